//! Per-interface queueing disciplines.
//!
//! A [`TrafficShaper`] owns one [`QueueDiscipline`] per interface name and forwards every
//! enqueue refusal to an optional [`ShaperHook`].

use std::{collections::BTreeMap, fmt, sync::Arc};

use netshaper_common::{ClassId, ErrorKind, Packet};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::{QdiscError, QdiscStats, QueueDiscipline, TrafficClass};

/// Errors returned by a [`TrafficShaper`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShaperError {
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),
    #[error("Interface {0} already has a discipline")]
    DuplicateInterface(String),
    #[error(transparent)]
    Qdisc(#[from] QdiscError),
}

impl ShaperError {
    /// Returns the category of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownInterface(_) | Self::DuplicateInterface(_) => ErrorKind::Config,
            Self::Qdisc(e) => e.kind(),
        }
    }
}

/// Notified when a discipline refuses a packet.
///
/// Hooks run on the enqueueing thread with no shaper lock held.
pub trait ShaperHook: Send + Sync + 'static {
    /// `packet` was refused by the discipline of `interface`.
    fn on_packet_dropped(&self, interface: &str, packet: &Packet, error: &QdiscError) {
        let _ = (interface, packet, error);
    }

    /// A queue of `interface` was full. Called after
    /// [`on_packet_dropped`](Self::on_packet_dropped) for the same packet.
    fn on_queue_full(&self, interface: &str) {
        let _ = interface;
    }
}

/// One [`QueueDiscipline`] per interface.
///
/// # Example
///
/// ```
/// use netshaper_common::Packet;
/// use netshaper_qdisc::{QdiscOptions, QueueDiscipline, TrafficClass, TrafficShaper};
///
/// let shaper = TrafficShaper::new();
/// let qdisc = QueueDiscipline::drr(QdiscOptions::default());
/// qdisc.initialize([TrafficClass::new(1)]).unwrap();
/// shaper.add_interface("eth0", qdisc).unwrap();
///
/// shaper.enqueue("eth0", Packet::new(1500, 1)).unwrap();
/// assert!(shaper.enqueue("eth1", Packet::new(1500, 1)).is_err());
/// assert_eq!(shaper.dequeue("eth0").unwrap().map(|p| p.size()), Some(1500));
/// ```
#[derive(Default)]
pub struct TrafficShaper {
    interfaces: RwLock<BTreeMap<String, Arc<QueueDiscipline>>>,
    hook: RwLock<Option<Arc<dyn ShaperHook>>>,
}

impl fmt::Debug for TrafficShaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficShaper")
            .field("interfaces", &self.interfaces.read().keys().collect::<Vec<_>>())
            .field("hook", &self.hook.read().is_some())
            .finish()
    }
}

impl TrafficShaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `hook`, replacing any previous one.
    pub fn with_hook(self, hook: impl ShaperHook) -> Self {
        self.set_hook(hook);
        self
    }

    pub fn set_hook(&self, hook: impl ShaperHook) {
        *self.hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_hook(&self) {
        *self.hook.write() = None;
    }

    /// Registers an initialized discipline for `interface`.
    pub fn add_interface(
        &self,
        interface: impl Into<String>,
        qdisc: QueueDiscipline,
    ) -> Result<Arc<QueueDiscipline>, ShaperError> {
        let interface = interface.into();
        let mut interfaces = self.interfaces.write();
        if interfaces.contains_key(&interface) {
            return Err(ShaperError::DuplicateInterface(interface));
        }

        let qdisc = Arc::new(qdisc);
        info!(interface, kind = %qdisc.kind(), "Interface shaped");
        interfaces.insert(interface, Arc::clone(&qdisc));
        Ok(qdisc)
    }

    /// Shuts down and unregisters the discipline of `interface`, returning what it still held.
    pub fn remove_interface(&self, interface: &str) -> Result<Vec<Packet>, ShaperError> {
        let qdisc = self
            .interfaces
            .write()
            .remove(interface)
            .ok_or_else(|| ShaperError::UnknownInterface(interface.to_string()))?;

        let discarded = qdisc.shutdown();
        info!(interface, discarded = discarded.len(), "Interface no longer shaped");
        Ok(discarded)
    }

    /// The discipline of `interface`.
    pub fn discipline(&self, interface: &str) -> Option<Arc<QueueDiscipline>> {
        self.interfaces.read().get(interface).cloned()
    }

    /// Shaped interface names, in order.
    pub fn interfaces(&self) -> Vec<String> {
        self.interfaces.read().keys().cloned().collect()
    }

    /// Classifies `packet` with the interface's classifier and queues it. Refusals are
    /// reported to the hook before the error is returned.
    pub fn enqueue(&self, interface: &str, packet: Packet) -> Result<(), ShaperError> {
        let qdisc = self.get(interface)?;
        let class_id = qdisc.classify(&packet);

        // Cloning only shares the payload buffer.
        let Err(error) = qdisc.enqueue(packet.clone(), class_id) else {
            return Ok(());
        };

        trace!(interface, class_id, %error, "Shaper dropped packet");
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook.on_packet_dropped(interface, &packet, &error);
            if matches!(error, QdiscError::QueueFull(_) | QdiscError::LimitExceeded(_)) {
                hook.on_queue_full(interface);
            }
        }
        Err(error.into())
    }

    /// Takes the next packet scheduled on `interface`.
    pub fn dequeue(&self, interface: &str) -> Result<Option<Packet>, ShaperError> {
        Ok(self.get(interface)?.dequeue()?)
    }

    pub fn add_class(&self, interface: &str, class: TrafficClass) -> Result<(), ShaperError> {
        debug!(interface, id = class.id, "Adding class through shaper");
        Ok(self.get(interface)?.add_class(class)?)
    }

    /// Removes a class of `interface`, returning its queued packets.
    pub fn remove_class(
        &self,
        interface: &str,
        class_id: ClassId,
    ) -> Result<Vec<Packet>, ShaperError> {
        Ok(self.get(interface)?.remove_class(class_id)?)
    }

    /// Statistics of every interface, by name.
    pub fn statistics(&self) -> BTreeMap<String, QdiscStats> {
        self.interfaces
            .read()
            .iter()
            .map(|(name, qdisc)| (name.clone(), qdisc.get_statistics()))
            .collect()
    }

    pub fn interface_statistics(&self, interface: &str) -> Result<QdiscStats, ShaperError> {
        Ok(self.get(interface)?.get_statistics())
    }

    /// Shuts down every discipline and forgets the interfaces. Returns the number of packets
    /// discarded.
    pub fn shutdown(&self) -> usize {
        let interfaces = std::mem::take(&mut *self.interfaces.write());
        let discarded: usize = interfaces.values().map(|qdisc| qdisc.shutdown().len()).sum();
        info!(interfaces = interfaces.len(), discarded, "Traffic shaper shut down");
        discarded
    }

    fn get(&self, interface: &str) -> Result<Arc<QueueDiscipline>, ShaperError> {
        self.discipline(interface)
            .ok_or_else(|| ShaperError::UnknownInterface(interface.to_string()))
    }
}
