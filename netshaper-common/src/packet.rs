use bytes::Bytes;

/// Identifier of a traffic class. Stable for the lifetime of a discipline instance.
pub type ClassId = u32;

/// Identifier of a flow. Stateful impairments (burst loss) keep their state per flow.
pub type FlowId = u64;

/// The unit of work flowing through the engine.
///
/// A packet is owned by whichever stage currently holds it: ownership moves into a queue on
/// enqueue and back out on dequeue, so no two stages ever mutate the same packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Size on the wire, in bytes.
    size: usize,
    /// The traffic class this packet was tagged with.
    class_id: ClassId,
    /// The flow this packet belongs to.
    flow_id: FlowId,
    /// Time the packet entered the engine, in microseconds. The clock is chosen by the caller.
    enqueue_time: u64,
    /// Monotonic ingress sequence number, used for tie-breaks and reorder detection.
    arrival_sequence: u64,
    /// Raw bytes, only needed when corruption should be observable.
    payload: Option<Bytes>,
    /// Whether this packet is an engine-produced copy of another packet.
    duplicate: bool,
}

impl Packet {
    /// Creates a payload-less packet of `size` bytes tagged with `class_id`.
    pub const fn new(size: usize, class_id: ClassId) -> Self {
        Self {
            size,
            class_id,
            flow_id: 0,
            enqueue_time: 0,
            arrival_sequence: 0,
            payload: None,
            duplicate: false,
        }
    }

    /// Creates a packet carrying `payload`. The packet size is the payload length.
    pub fn from_payload(class_id: ClassId, payload: Bytes) -> Self {
        Self { size: payload.len(), payload: Some(payload), ..Self::new(0, class_id) }
    }

    /// Sets the flow id.
    pub fn with_flow(mut self, flow_id: FlowId) -> Self {
        self.flow_id = flow_id;
        self
    }

    /// Sets the arrival sequence number.
    pub fn with_sequence(mut self, arrival_sequence: u64) -> Self {
        self.arrival_sequence = arrival_sequence;
        self
    }

    /// Sets the enqueue timestamp, in microseconds.
    pub fn with_enqueue_time(mut self, enqueue_time: u64) -> Self {
        self.enqueue_time = enqueue_time;
        self
    }

    /// Attaches a payload. The size is left untouched, so a packet can model a large frame
    /// while only carrying its header bytes.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub const fn class_id(&self) -> ClassId {
        self.class_id
    }

    #[inline]
    pub const fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    #[inline]
    pub const fn enqueue_time(&self) -> u64 {
        self.enqueue_time
    }

    #[inline]
    pub const fn arrival_sequence(&self) -> u64 {
        self.arrival_sequence
    }

    #[inline]
    pub const fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    #[inline]
    pub const fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Re-tags the packet with another class. Used when a classifier overrides the ingress tag.
    pub fn set_class_id(&mut self, class_id: ClassId) {
        self.class_id = class_id;
    }

    /// Sets the enqueue timestamp, in microseconds.
    pub fn set_enqueue_time(&mut self, enqueue_time: u64) {
        self.enqueue_time = enqueue_time;
    }

    /// Sets the arrival sequence number.
    pub fn set_sequence(&mut self, arrival_sequence: u64) {
        self.arrival_sequence = arrival_sequence;
    }

    /// Replaces the payload, returning the previous one.
    pub fn replace_payload(&mut self, payload: Bytes) -> Option<Bytes> {
        self.payload.replace(payload)
    }

    /// Returns a copy of this packet marked as a duplicate. The payload is shared, not copied.
    pub fn duplicate(&self) -> Self {
        Self { duplicate: true, ..self.clone() }
    }
}
