use netshaper_common::{constants::MTU_ETHERNET, ClassId};

use crate::QdiscError;

/// A traffic class: one queue of a [`QueueDiscipline`](crate::QueueDiscipline) together with
/// its scheduling parameters.
///
/// WFQ reads `weight`, DRR reads `quantum`. Both are kept so a class definition can move
/// between disciplines unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficClass {
    /// Unique within one discipline instance.
    pub id: ClassId,
    /// Human readable name.
    pub name: String,
    /// WFQ weight. Service share is proportional to it.
    pub weight: f64,
    /// DRR quantum, in bytes credited per round.
    pub quantum: u32,
    /// Guaranteed rate in bytes per second. Informational, exported with the class.
    pub min_bandwidth: u64,
    /// Rate cap in bytes per second. Informational, exported with the class.
    pub max_bandwidth: Option<u64>,
    /// Inactive classes admit nothing and are skipped by the scheduler. Packets already
    /// queued stay put until the class is reactivated or removed.
    pub active: bool,
    /// Per-class queue bound in packets. Falls back to the discipline default when unset.
    pub max_queue_len: Option<usize>,
}

impl TrafficClass {
    /// Creates an active class with weight 1 and a quantum of one Ethernet MTU.
    pub fn new(id: ClassId) -> Self {
        Self {
            id,
            name: format!("class-{id}"),
            weight: 1.0,
            quantum: MTU_ETHERNET,
            min_bandwidth: 0,
            max_bandwidth: None,
            active: true,
            max_queue_len: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn quantum(mut self, quantum: u32) -> Self {
        self.quantum = quantum;
        self
    }

    /// Sets the guaranteed and maximum rate, in bytes per second.
    pub fn bandwidth(mut self, min: u64, max: Option<u64>) -> Self {
        self.min_bandwidth = min;
        self.max_bandwidth = max;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn max_queue_len(mut self, len: usize) -> Self {
        self.max_queue_len = Some(len);
        self
    }

    /// Checks the class parameters. Weight and quantum only need to be positive while the
    /// class is active.
    pub fn validate(&self) -> Result<(), QdiscError> {
        let invalid = |reason| Err(QdiscError::InvalidClass { id: self.id, reason });

        if self.active && !(self.weight.is_finite() && self.weight > 0.0) {
            return invalid("weight must be a positive number");
        }

        if self.active && self.quantum == 0 {
            return invalid("quantum must be positive");
        }

        if self.max_bandwidth.is_some_and(|max| max < self.min_bandwidth) {
            return invalid("max_bandwidth is below min_bandwidth");
        }

        if self.max_queue_len == Some(0) {
            return invalid("max_queue_len must be positive");
        }

        Ok(())
    }
}
