use std::{collections::BTreeMap, fmt, sync::Arc};

use netshaper_common::{Classifier, ClassId, Packet};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::{
    drr::Drr,
    stats::{ClassCounters, ClassStats, QdiscStats},
    wfq::Wfq,
    QdiscError, Result, TrafficClass,
};

/// Default discipline-wide bound, in packets.
pub const DEFAULT_LIMIT: usize = 10_000;
/// Default per-class bound, in packets. Matches the netem default queue limit.
pub const DEFAULT_CLASS_LIMIT: usize = 1_000;

/// The scheduling algorithm of a [`QueueDiscipline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisciplineKind {
    /// Weighted Fair Queueing.
    Wfq,
    /// Deficit Round Robin.
    Drr,
}

impl fmt::Display for DisciplineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wfq => f.write_str("wfq"),
            Self::Drr => f.write_str("drr"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QdiscOptions {
    /// The maximum number of packets queued across all classes.
    limit: usize,
    /// The maximum number of packets queued in one class, unless the class sets its own.
    per_class_limit: usize,
}

impl Default for QdiscOptions {
    fn default() -> Self {
        Self { limit: DEFAULT_LIMIT, per_class_limit: DEFAULT_CLASS_LIMIT }
    }
}

impl QdiscOptions {
    /// Sets the maximum number of packets queued across all classes.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the default per-class queue bound. Classes with their own `max_queue_len` ignore it.
    pub fn per_class_limit(mut self, per_class_limit: usize) -> Self {
        self.per_class_limit = per_class_limit;
        self
    }
}

/// WFQ and DRR share the discipline contract and differ only in how they pick the next packet,
/// so they are dispatched through a plain enum.
#[derive(Debug)]
enum Scheduler {
    Wfq(Wfq),
    Drr(Drr),
}

macro_rules! dispatch {
    ($sched:expr, $s:ident => $body:expr) => {
        match $sched {
            Scheduler::Wfq($s) => $body,
            Scheduler::Drr($s) => $body,
        }
    };
}

impl Scheduler {
    fn new(kind: DisciplineKind) -> Self {
        match kind {
            DisciplineKind::Wfq => Self::Wfq(Wfq::default()),
            DisciplineKind::Drr => Self::Drr(Drr::default()),
        }
    }

    fn add_class(&mut self, class: TrafficClass) {
        dispatch!(self, s => s.add_class(class))
    }

    fn remove_class(&mut self, id: ClassId) -> Option<Vec<Packet>> {
        dispatch!(self, s => s.remove_class(id))
    }

    fn update_class(&mut self, class: TrafficClass) -> bool {
        dispatch!(self, s => s.update_class(class))
    }

    fn class(&self, id: ClassId) -> Option<&TrafficClass> {
        dispatch!(self, s => s.class(id))
    }

    fn classes(&self) -> Vec<TrafficClass> {
        dispatch!(self, s => s.classes().cloned().collect())
    }

    fn enqueue(&mut self, id: ClassId, packet: Packet) -> std::result::Result<(), Packet> {
        dispatch!(self, s => s.enqueue(id, packet))
    }

    fn dequeue(&mut self) -> Option<Packet> {
        dispatch!(self, s => s.dequeue())
    }

    fn len(&self, id: ClassId) -> Option<(usize, usize)> {
        dispatch!(self, s => s.len(id))
    }

    fn drain(&mut self) -> Vec<Packet> {
        dispatch!(self, s => s.drain())
    }

    fn annotate(&self, id: ClassId, stats: &mut ClassStats) {
        match self {
            Self::Wfq(wfq) => stats.last_finish_time = wfq.last_finish(id).unwrap_or_default(),
            Self::Drr(drr) => stats.deficit = drr.deficit(id).unwrap_or_default(),
        }
    }

    const fn virtual_time(&self) -> f64 {
        match self {
            Self::Wfq(wfq) => wfq.virtual_time(),
            Self::Drr(_) => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Running,
    Shutdown,
}

struct Inner {
    lifecycle: Lifecycle,
    scheduler: Scheduler,
    options: QdiscOptions,
    counters: BTreeMap<ClassId, ClassCounters>,
    classifier: Option<Arc<dyn Classifier>>,
    /// Packets and bytes queued across all classes.
    len: usize,
    bytes: usize,
    packets_unclassified: u64,
    packets_discarded: u64,
}

impl Inner {
    const fn ensure_running(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Running => Ok(()),
            Lifecycle::Uninitialized => Err(QdiscError::NotInitialized),
            Lifecycle::Shutdown => Err(QdiscError::Shutdown),
        }
    }

    fn insert_class(&mut self, class: TrafficClass) {
        self.counters.insert(class.id, ClassCounters::default());
        self.scheduler.add_class(class);
    }

    fn enqueue(&mut self, mut packet: Packet, class_id: ClassId) -> Result<()> {
        self.ensure_running()?;

        let Some(class) = self.scheduler.class(class_id) else {
            self.packets_unclassified += 1;
            return Err(QdiscError::UnknownClass(class_id));
        };

        if !class.active {
            return Err(QdiscError::ClassInactive(class_id));
        }

        let class_limit = class.max_queue_len.unwrap_or(self.options.per_class_limit);
        let (class_len, _) = self.scheduler.len(class_id).unwrap_or_default();
        let size = packet.size();

        let err = if class_len >= class_limit {
            Some(QdiscError::QueueFull(class_id))
        } else if self.len >= self.options.limit {
            Some(QdiscError::LimitExceeded(self.options.limit))
        } else {
            None
        };

        if let Some(err) = err {
            if let Some(counters) = self.counters.get_mut(&class_id) {
                counters.record_reject(size);
            }
            trace!(class_id, size, %err, "Packet rejected");
            return Err(err);
        }

        packet.set_class_id(class_id);
        if self.scheduler.enqueue(class_id, packet).is_err() {
            return Err(QdiscError::UnknownClass(class_id));
        }

        self.len += 1;
        self.bytes += size;
        if let Some(counters) = self.counters.get_mut(&class_id) {
            counters.record_enqueue(size);
        }

        Ok(())
    }

    fn discard(&mut self, packets: &[Packet]) {
        self.len -= packets.len();
        self.bytes -= packets.iter().map(Packet::size).sum::<usize>();
        self.packets_discarded += packets.len() as u64;
    }
}

/// A queueing discipline: per-class queues plus a WFQ or DRR scheduler deciding which packet
/// leaves next.
///
/// Every packet operation and every configuration change goes through one lock, so a class
/// update can never interleave with a scheduling decision. Statistics are read under the
/// shared side of the same lock and returned as a snapshot.
///
/// # Example
///
/// ```
/// use netshaper_common::Packet;
/// use netshaper_qdisc::{QdiscOptions, QueueDiscipline, TrafficClass};
///
/// let qdisc = QueueDiscipline::wfq(QdiscOptions::default());
/// qdisc.initialize([TrafficClass::new(1), TrafficClass::new(2).weight(2.0)]).unwrap();
///
/// qdisc.enqueue(Packet::new(1500, 0), 2).unwrap();
/// assert_eq!(qdisc.dequeue().unwrap().map(|p| p.class_id()), Some(2));
/// assert!(qdisc.dequeue().unwrap().is_none());
/// ```
pub struct QueueDiscipline {
    kind: DisciplineKind,
    inner: RwLock<Inner>,
}

impl fmt::Debug for QueueDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("QueueDiscipline")
            .field("kind", &self.kind)
            .field("lifecycle", &inner.lifecycle)
            .field("options", &inner.options)
            .field("len", &inner.len)
            .field("classifier", &inner.classifier.is_some())
            .finish_non_exhaustive()
    }
}

impl QueueDiscipline {
    /// Creates an uninitialized discipline. Call [`initialize`](Self::initialize) before use.
    pub fn new(kind: DisciplineKind, options: QdiscOptions) -> Self {
        Self {
            kind,
            inner: RwLock::new(Inner {
                lifecycle: Lifecycle::Uninitialized,
                scheduler: Scheduler::new(kind),
                options,
                counters: BTreeMap::new(),
                classifier: None,
                len: 0,
                bytes: 0,
                packets_unclassified: 0,
                packets_discarded: 0,
            }),
        }
    }

    /// Creates an uninitialized WFQ discipline.
    pub fn wfq(options: QdiscOptions) -> Self {
        Self::new(DisciplineKind::Wfq, options)
    }

    /// Creates an uninitialized DRR discipline.
    pub fn drr(options: QdiscOptions) -> Self {
        Self::new(DisciplineKind::Drr, options)
    }

    pub const fn kind(&self) -> DisciplineKind {
        self.kind
    }

    /// Installs the initial class set. All classes are validated before any is installed.
    pub fn initialize(&self, classes: impl IntoIterator<Item = TrafficClass>) -> Result<()> {
        let classes: Vec<_> = classes.into_iter().collect();

        let mut inner = self.inner.write();
        match inner.lifecycle {
            Lifecycle::Running => return Err(QdiscError::AlreadyInitialized),
            Lifecycle::Shutdown => return Err(QdiscError::Shutdown),
            Lifecycle::Uninitialized => {}
        }

        let mut seen = BTreeMap::new();
        for class in &classes {
            class.validate()?;
            if seen.insert(class.id, ()).is_some() {
                return Err(QdiscError::DuplicateClass(class.id));
            }
        }

        let n_classes = classes.len();
        for class in classes {
            inner.insert_class(class);
        }
        inner.lifecycle = Lifecycle::Running;

        info!(kind = %self.kind, n_classes, "Queue discipline initialized");
        Ok(())
    }

    /// Queues `packet` in class `class_id`, re-tagging it with that class.
    ///
    /// Fails if the class is unknown or inactive, or a queue bound is hit. A refused packet is
    /// dropped here; counting it as a loss is up to the caller.
    pub fn enqueue(&self, packet: Packet, class_id: ClassId) -> Result<()> {
        self.inner.write().enqueue(packet, class_id)
    }

    /// Returns the class the installed classifier picks for `packet`, or the packet's own tag
    /// when no classifier is installed.
    pub fn classify(&self, packet: &Packet) -> ClassId {
        match &self.inner.read().classifier {
            Some(classifier) => classifier.classify(packet),
            None => packet.class_id(),
        }
    }

    /// Queues `packet` in the class picked by the installed classifier, or in the class it is
    /// already tagged with when no classifier is set.
    pub fn enqueue_classified(&self, packet: Packet) -> Result<()> {
        let mut inner = self.inner.write();
        let class_id = match &inner.classifier {
            Some(classifier) => classifier.classify(&packet),
            None => packet.class_id(),
        };

        inner.enqueue(packet, class_id)
    }

    /// Removes the next packet according to the scheduling algorithm. `Ok(None)` means no
    /// active class has anything queued.
    pub fn dequeue(&self) -> Result<Option<Packet>> {
        let mut inner = self.inner.write();
        inner.ensure_running()?;

        let Some(packet) = inner.scheduler.dequeue() else {
            return Ok(None);
        };

        inner.len -= 1;
        inner.bytes -= packet.size();
        if let Some(counters) = inner.counters.get_mut(&packet.class_id()) {
            counters.record_dequeue(packet.size());
        }

        trace!(class_id = packet.class_id(), size = packet.size(), "Dequeued packet");
        Ok(Some(packet))
    }

    /// Returns `true` if no packet is queued in any class, including inactive ones.
    pub fn is_empty(&self) -> bool {
        self.inner.read().len == 0
    }

    /// Packets queued across all classes.
    pub fn queue_size(&self) -> usize {
        self.inner.read().len
    }

    /// Packets queued in one class.
    pub fn class_queue_size(&self, class_id: ClassId) -> Result<usize> {
        let inner = self.inner.read();
        inner.ensure_running()?;
        inner
            .scheduler
            .len(class_id)
            .map(|(len, _)| len)
            .ok_or(QdiscError::UnknownClass(class_id))
    }

    /// Adds a class to a running discipline.
    pub fn add_class(&self, class: TrafficClass) -> Result<()> {
        let mut inner = self.inner.write();
        inner.ensure_running()?;
        class.validate()?;

        if inner.scheduler.class(class.id).is_some() {
            return Err(QdiscError::DuplicateClass(class.id));
        }

        debug!(class_id = class.id, name = %class.name, "Added class");
        inner.insert_class(class);
        Ok(())
    }

    /// Removes a class, returning the packets that were still queued in it. Those packets are
    /// counted as discarded.
    pub fn remove_class(&self, class_id: ClassId) -> Result<Vec<Packet>> {
        let mut inner = self.inner.write();
        inner.ensure_running()?;

        let packets =
            inner.scheduler.remove_class(class_id).ok_or(QdiscError::UnknownClass(class_id))?;
        inner.counters.remove(&class_id);
        inner.discard(&packets);

        if packets.is_empty() {
            debug!(class_id, "Removed class");
        } else {
            warn!(class_id, discarded = packets.len(), "Removed class with queued packets");
        }

        Ok(packets)
    }

    /// Replaces the parameters of an existing class. Queued packets stay queued even when a
    /// smaller bound is set; the bound applies to admission only.
    pub fn update_class(&self, class: TrafficClass) -> Result<()> {
        let mut inner = self.inner.write();
        inner.ensure_running()?;
        class.validate()?;

        let class_id = class.id;
        if !inner.scheduler.update_class(class) {
            return Err(QdiscError::UnknownClass(class_id));
        }

        debug!(class_id, "Updated class");
        Ok(())
    }

    /// The configured classes, in ascending id order.
    pub fn classes(&self) -> Vec<TrafficClass> {
        self.inner.read().scheduler.classes()
    }

    /// Installs the classifier used by [`enqueue_classified`](Self::enqueue_classified).
    pub fn set_classifier(&self, classifier: impl Classifier) {
        self.inner.write().classifier = Some(Arc::new(classifier));
    }

    /// Removes the installed classifier.
    pub fn clear_classifier(&self) {
        self.inner.write().classifier = None;
    }

    /// Returns a consistent snapshot of all counters and queue gauges.
    pub fn get_statistics(&self) -> QdiscStats {
        let inner = self.inner.read();

        let mut stats = QdiscStats {
            packets_unclassified: inner.packets_unclassified,
            packets_discarded: inner.packets_discarded,
            queue_len: inner.len,
            queue_bytes: inner.bytes,
            virtual_time: inner.scheduler.virtual_time(),
            ..Default::default()
        };

        for (id, counters) in &inner.counters {
            let mut class = ClassStats::from_counters(counters);
            if let Some((len, bytes)) = inner.scheduler.len(*id) {
                class.queue_len = len;
                class.queue_bytes = bytes;
            }
            inner.scheduler.annotate(*id, &mut class);

            stats.packets_queued += class.packets_queued;
            stats.bytes_queued += class.bytes_queued;
            stats.packets_dequeued += class.packets_dequeued;
            stats.bytes_dequeued += class.bytes_dequeued;
            stats.packets_rejected += class.packets_rejected;
            stats.bytes_rejected += class.bytes_rejected;
            stats.classes.insert(*id, class);
        }

        stats
    }

    /// Zeroes every counter. Queued packets and scheduler state are untouched.
    pub fn reset_statistics(&self) {
        let mut inner = self.inner.write();
        for counters in inner.counters.values_mut() {
            *counters = ClassCounters::default();
        }
        inner.packets_unclassified = 0;
        inner.packets_discarded = 0;
    }

    /// Empties every queue, returning the discarded packets.
    pub fn clear(&self) -> Result<Vec<Packet>> {
        let mut inner = self.inner.write();
        inner.ensure_running()?;

        let packets = inner.scheduler.drain();
        inner.discard(&packets);
        Ok(packets)
    }

    /// Shuts the discipline down, returning whatever was still queued. Every later operation
    /// fails with [`QdiscError::Shutdown`].
    pub fn shutdown(&self) -> Vec<Packet> {
        let mut inner = self.inner.write();
        if inner.lifecycle == Lifecycle::Shutdown {
            return Vec::new();
        }

        let packets = inner.scheduler.drain();
        inner.discard(&packets);
        inner.lifecycle = Lifecycle::Shutdown;

        info!(kind = %self.kind, discarded = packets.len(), "Queue discipline shut down");
        packets
    }
}
