use std::collections::BTreeMap;

use netshaper_common::{unix_micros, ClassId};

/// Running counters of one class. Lives under the discipline lock.
#[derive(Debug, Default, Clone)]
pub(crate) struct ClassCounters {
    pub(crate) packets_queued: u64,
    pub(crate) bytes_queued: u64,
    pub(crate) packets_dequeued: u64,
    pub(crate) bytes_dequeued: u64,
    pub(crate) packets_rejected: u64,
    pub(crate) bytes_rejected: u64,
    pub(crate) last_activity: u64,
}

impl ClassCounters {
    #[inline]
    pub(crate) fn record_enqueue(&mut self, bytes: usize) {
        self.packets_queued += 1;
        self.bytes_queued += bytes as u64;
        self.last_activity = unix_micros();
    }

    #[inline]
    pub(crate) fn record_dequeue(&mut self, bytes: usize) {
        self.packets_dequeued += 1;
        self.bytes_dequeued += bytes as u64;
        self.last_activity = unix_micros();
    }

    #[inline]
    pub(crate) fn record_reject(&mut self, bytes: usize) {
        self.packets_rejected += 1;
        self.bytes_rejected += bytes as u64;
    }
}

/// Snapshot of one class.
///
/// `packets_*` and `bytes_*` are counters, zeroed by
/// [`reset_statistics`](crate::QueueDiscipline::reset_statistics). `queue_len`, `queue_bytes`,
/// `deficit` and `last_finish_time` describe the live queue and are never reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassStats {
    pub packets_queued: u64,
    pub bytes_queued: u64,
    pub packets_dequeued: u64,
    pub bytes_dequeued: u64,
    /// Packets refused at admission because a bound was hit.
    pub packets_rejected: u64,
    pub bytes_rejected: u64,
    pub queue_len: usize,
    pub queue_bytes: usize,
    /// DRR credit carried by the class. Always zero under WFQ.
    pub deficit: u64,
    /// WFQ finish time of the most recently enqueued packet. Always zero under DRR.
    pub last_finish_time: f64,
    /// UNIX micros of the last enqueue or dequeue, 0 if none.
    pub last_activity: u64,
}

impl ClassStats {
    pub(crate) fn from_counters(counters: &ClassCounters) -> Self {
        Self {
            packets_queued: counters.packets_queued,
            bytes_queued: counters.bytes_queued,
            packets_dequeued: counters.packets_dequeued,
            bytes_dequeued: counters.bytes_dequeued,
            packets_rejected: counters.packets_rejected,
            bytes_rejected: counters.bytes_rejected,
            last_activity: counters.last_activity,
            ..Default::default()
        }
    }
}

/// Snapshot of a whole discipline, as returned by
/// [`get_statistics`](crate::QueueDiscipline::get_statistics).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QdiscStats {
    pub classes: BTreeMap<ClassId, ClassStats>,
    pub packets_queued: u64,
    pub bytes_queued: u64,
    pub packets_dequeued: u64,
    pub bytes_dequeued: u64,
    pub packets_rejected: u64,
    pub bytes_rejected: u64,
    /// Packets dropped at enqueue because their class did not exist.
    pub packets_unclassified: u64,
    /// Packets discarded by class removal, clear or shutdown.
    pub packets_discarded: u64,
    pub queue_len: usize,
    pub queue_bytes: usize,
    /// WFQ virtual time. Always zero under DRR.
    pub virtual_time: f64,
}

impl QdiscStats {
    /// Returns `true` if every counter is zero. Queue gauges are not considered.
    pub fn counters_are_zero(&self) -> bool {
        let class_zero = |c: &ClassStats| {
            c.packets_queued == 0 &&
                c.bytes_queued == 0 &&
                c.packets_dequeued == 0 &&
                c.bytes_dequeued == 0 &&
                c.packets_rejected == 0 &&
                c.bytes_rejected == 0
        };

        self.classes.values().all(class_zero) &&
            self.packets_queued == 0 &&
            self.bytes_queued == 0 &&
            self.packets_dequeued == 0 &&
            self.bytes_dequeued == 0 &&
            self.packets_rejected == 0 &&
            self.bytes_rejected == 0 &&
            self.packets_unclassified == 0 &&
            self.packets_discarded == 0
    }
}
