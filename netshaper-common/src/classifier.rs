use crate::{ClassId, Packet};

/// Maps a packet to the traffic class it should be queued in.
///
/// Classifiers are pure: the same packet always maps to the same class. Any
/// `Fn(&Packet) -> ClassId` closure is a classifier.
pub trait Classifier: Send + Sync + 'static {
    fn classify(&self, packet: &Packet) -> ClassId;
}

impl<F> Classifier for F
where
    F: Fn(&Packet) -> ClassId + Send + Sync + 'static,
{
    fn classify(&self, packet: &Packet) -> ClassId {
        self(packet)
    }
}

/// Sends every packet to the same class.
#[derive(Debug, Clone, Copy)]
pub struct FixedClassifier(pub ClassId);

impl Classifier for FixedClassifier {
    fn classify(&self, _: &Packet) -> ClassId {
        self.0
    }
}

/// Spreads flows over a set of classes by flow id. Packets of one flow always land in the same
/// class. With no classes configured, the packet's own tag is kept.
#[derive(Debug, Clone)]
pub struct FlowHashClassifier {
    classes: Vec<ClassId>,
}

impl FlowHashClassifier {
    pub fn new(classes: impl IntoIterator<Item = ClassId>) -> Self {
        Self { classes: classes.into_iter().collect() }
    }
}

impl Classifier for FlowHashClassifier {
    fn classify(&self, packet: &Packet) -> ClassId {
        if self.classes.is_empty() {
            return packet.class_id();
        }

        let idx = (packet.flow_id() % self.classes.len() as u64) as usize;
        self.classes[idx]
    }
}

/// Classifies by packet size: the first threshold the packet fits under wins.
///
/// Typical use is steering small control packets into a priority class.
#[derive(Debug, Clone)]
pub struct SizeClassifier {
    /// `(max_size, class)` pairs, kept sorted by `max_size`.
    thresholds: Vec<(usize, ClassId)>,
    fallback: ClassId,
}

impl SizeClassifier {
    /// Creates a classifier sending packets larger than every threshold to `fallback`.
    pub fn new(fallback: ClassId) -> Self {
        Self { thresholds: Vec::new(), fallback }
    }

    /// Sends packets of at most `max_size` bytes to `class_id`.
    pub fn threshold(mut self, max_size: usize, class_id: ClassId) -> Self {
        self.thresholds.push((max_size, class_id));
        self.thresholds.sort_by_key(|(size, _)| *size);
        self
    }
}

impl Classifier for SizeClassifier {
    fn classify(&self, packet: &Packet) -> ClassId {
        self.thresholds
            .iter()
            .find(|(max, _)| packet.size() <= *max)
            .map_or(self.fallback, |(_, class)| *class)
    }
}
