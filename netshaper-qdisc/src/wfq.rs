//! Weighted Fair Queueing.
//!
//! Every packet is stamped with a virtual finish time `max(V, F_class) + size / weight`, where
//! `V` is the discipline's virtual time and `F_class` the finish time of the class's previous
//! packet. Dequeue serves the smallest finish time across all class heads and moves `V` to it.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, VecDeque},
};

use netshaper_common::{ClassId, Packet};

use crate::TrafficClass;

#[derive(Debug)]
struct QueueItem {
    packet: Packet,
    finish: f64,
    /// Enqueue counter, the last tie-break. Makes the order total even when a caller reuses
    /// arrival sequence numbers.
    order: u64,
}

impl QueueItem {
    fn schedule_cmp(&self, other: &Self) -> Ordering {
        self.finish
            .total_cmp(&other.finish)
            .then_with(|| self.packet.arrival_sequence().cmp(&other.packet.arrival_sequence()))
            .then_with(|| self.order.cmp(&other.order))
    }
}

#[derive(Debug)]
struct WfqClass {
    class: TrafficClass,
    queue: VecDeque<QueueItem>,
    bytes: usize,
    last_finish: f64,
}

#[derive(Debug, Default)]
pub(crate) struct Wfq {
    classes: BTreeMap<ClassId, WfqClass>,
    virtual_time: f64,
    order: u64,
}

impl Wfq {
    pub(crate) fn add_class(&mut self, class: TrafficClass) {
        let state = WfqClass { class, queue: VecDeque::new(), bytes: 0, last_finish: 0.0 };
        self.classes.insert(state.class.id, state);
    }

    pub(crate) fn remove_class(&mut self, id: ClassId) -> Option<Vec<Packet>> {
        self.classes.remove(&id).map(|c| c.queue.into_iter().map(|item| item.packet).collect())
    }

    /// New parameters apply to packets enqueued from now on. Finish times already assigned are
    /// kept.
    pub(crate) fn update_class(&mut self, class: TrafficClass) -> bool {
        match self.classes.get_mut(&class.id) {
            Some(state) => {
                state.class = class;
                true
            }
            None => false,
        }
    }

    pub(crate) fn class(&self, id: ClassId) -> Option<&TrafficClass> {
        self.classes.get(&id).map(|c| &c.class)
    }

    pub(crate) fn classes(&self) -> impl Iterator<Item = &TrafficClass> + '_ {
        self.classes.values().map(|c| &c.class)
    }

    /// Returns the packet back if the class does not exist.
    pub(crate) fn enqueue(&mut self, id: ClassId, packet: Packet) -> Result<(), Packet> {
        let Some(state) = self.classes.get_mut(&id) else {
            return Err(packet);
        };

        let start = self.virtual_time.max(state.last_finish);
        let finish = start + packet.size() as f64 / state.class.weight;
        state.last_finish = finish;
        state.bytes += packet.size();

        state.queue.push_back(QueueItem { packet, finish, order: self.order });
        self.order += 1;

        Ok(())
    }

    pub(crate) fn dequeue(&mut self) -> Option<Packet> {
        let id = self
            .classes
            .iter()
            .filter(|(_, c)| c.class.active)
            .filter_map(|(id, c)| c.queue.front().map(|head| (*id, head)))
            .min_by(|(_, a), (_, b)| a.schedule_cmp(b))
            .map(|(id, _)| id)?;

        let state = self.classes.get_mut(&id)?;
        let item = state.queue.pop_front()?;
        state.bytes -= item.packet.size();
        self.virtual_time = self.virtual_time.max(item.finish);

        Some(item.packet)
    }

    pub(crate) fn len(&self, id: ClassId) -> Option<(usize, usize)> {
        self.classes.get(&id).map(|c| (c.queue.len(), c.bytes))
    }

    pub(crate) fn last_finish(&self, id: ClassId) -> Option<f64> {
        self.classes.get(&id).map(|c| c.last_finish)
    }

    pub(crate) const fn virtual_time(&self) -> f64 {
        self.virtual_time
    }

    pub(crate) fn drain(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();
        for state in self.classes.values_mut() {
            out.extend(state.queue.drain(..).map(|item| item.packet));
            state.bytes = 0;
        }

        out
    }
}
