//! Deficit Round Robin.
//!
//! Classes are visited in ascending id order. A visit credits the class with its quantum and
//! then serves head packets for as long as the deficit covers them. Leftover credit carries to
//! the next visit, so packets larger than the quantum are served after enough rounds. Credit
//! is kept when a queue runs empty and only cleared when the discipline is drained.

use std::{
    collections::{BTreeMap, VecDeque},
    ops::Bound,
};

use netshaper_common::{ClassId, Packet};

use crate::TrafficClass;

#[derive(Debug)]
struct DrrClass {
    class: TrafficClass,
    queue: VecDeque<Packet>,
    bytes: usize,
    deficit: u64,
}

impl DrrClass {
    fn eligible(&self) -> bool {
        self.class.active && !self.queue.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Drr {
    classes: BTreeMap<ClassId, DrrClass>,
    /// Class the round-robin cursor points at.
    current: Option<ClassId>,
    /// Whether the current class has already been credited for this visit.
    in_service: bool,
}

impl Drr {
    pub(crate) fn add_class(&mut self, class: TrafficClass) {
        let state = DrrClass { class, queue: VecDeque::new(), bytes: 0, deficit: 0 };
        self.classes.insert(state.class.id, state);
    }

    pub(crate) fn remove_class(&mut self, id: ClassId) -> Option<Vec<Packet>> {
        let state = self.classes.remove(&id)?;
        if self.current == Some(id) {
            self.in_service = false;
        }

        Some(state.queue.into())
    }

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

        state.bytes += packet.size();
        state.queue.push_back(packet);
        Ok(())
    }

    pub(crate) fn dequeue(&mut self) -> Option<Packet> {
        // Without this check the loop below would spin forever.
        if !self.classes.values().any(DrrClass::eligible) {
            return None;
        }

        loop {
            let id = self.cursor()?;
            let state = self.classes.get_mut(&id)?;

            if state.eligible() {
                if !self.in_service {
                    state.deficit += u64::from(state.class.quantum);
                    self.in_service = true;
                }

                let head = state.queue.front()?.size() as u64;
                if state.deficit >= head {
                    let packet = state.queue.pop_front()?;
                    state.deficit -= head;
                    state.bytes -= packet.size();

                    if state.queue.is_empty() {
                        self.advance(id);
                    }

                    return Some(packet);
                }
            }

            self.advance(id);
        }
    }

    /// Resolves the cursor to an existing class, moving past classes removed since the last
    /// visit.
    fn cursor(&mut self) -> Option<ClassId> {
        match self.current {
            Some(id) if self.classes.contains_key(&id) => Some(id),
            Some(id) => {
                self.in_service = false;
                self.current = self.next_after(id);
                self.current
            }
            None => {
                self.current = self.classes.keys().next().copied();
                self.current
            }
        }
    }

    fn advance(&mut self, from: ClassId) {
        self.in_service = false;
        self.current = self.next_after(from);
    }

    fn next_after(&self, id: ClassId) -> Option<ClassId> {
        self.classes
            .range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .or_else(|| self.classes.iter().next())
            .map(|(id, _)| *id)
    }

    pub(crate) fn len(&self, id: ClassId) -> Option<(usize, usize)> {
        self.classes.get(&id).map(|c| (c.queue.len(), c.bytes))
    }

    pub(crate) fn deficit(&self, id: ClassId) -> Option<u64> {
        self.classes.get(&id).map(|c| c.deficit)
    }

    pub(crate) fn drain(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();
        for state in self.classes.values_mut() {
            out.extend(state.queue.drain(..));
            state.bytes = 0;
            state.deficit = 0;
        }
        self.in_service = false;

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drr(quanta: &[(ClassId, u32)]) -> Drr {
        let mut drr = Drr::default();
        for (id, quantum) in quanta {
            drr.add_class(TrafficClass::new(*id).quantum(*quantum));
        }
        drr
    }

    #[test]
    fn serves_multiple_packets_per_visit() {
        let mut drr = drr(&[(1, 300), (2, 300)]);
        for _ in 0..3 {
            drr.enqueue(1, Packet::new(100, 1)).unwrap();
            drr.enqueue(2, Packet::new(100, 2)).unwrap();
        }

        let order: Vec<_> = std::iter::from_fn(|| drr.dequeue()).map(|p| p.class_id()).collect();
        assert_eq!(order, vec![1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn deficit_carries_over_while_backlogged() {
        let mut drr = drr(&[(1, 400), (2, 400)]);
        for _ in 0..3 {
            drr.enqueue(1, Packet::new(300, 1)).unwrap();
        }
        drr.enqueue(2, Packet::new(1000, 2)).unwrap();
        drr.enqueue(2, Packet::new(100, 2)).unwrap();

        // Class 1 sends one packet and keeps 100 of credit.
        assert_eq!(drr.dequeue().map(|p| p.class_id()), Some(1));
        assert_eq!(drr.deficit(1), Some(100));
        // Class 2 is credited 400 < 1000 and passes; class 1 reaches 500 and sends.
        assert_eq!(drr.dequeue().map(|p| p.class_id()), Some(1));
        assert_eq!(drr.deficit(1), Some(200));
        assert_eq!(drr.deficit(2), Some(400));
        // Class 2 reaches 800 and passes; class 1 drains and keeps its credit.
        assert_eq!(drr.dequeue().map(|p| p.class_id()), Some(1));
        assert_eq!(drr.deficit(1), Some(300));
        assert_eq!(drr.deficit(2), Some(800));
        // Class 2 reaches 1200.
        assert_eq!(drr.dequeue().map(|p| p.size()), Some(1000));
        assert_eq!(drr.dequeue().map(|p| p.size()), Some(100));
        assert!(drr.dequeue().is_none());
    }

    #[test]
    fn oversized_packet_is_eventually_served() {
        let mut drr = drr(&[(1, 100)]);
        drr.enqueue(1, Packet::new(9000, 1)).unwrap();

        assert_eq!(drr.dequeue().map(|p| p.size()), Some(9000));
        assert_eq!(drr.deficit(1), Some(0));
    }

    #[test]
    fn inactive_class_is_skipped() {
        let mut drr = drr(&[(1, 1500)]);
        drr.add_class(TrafficClass::new(2).active(false).quantum(0));
        drr.enqueue(2, Packet::new(100, 2)).unwrap();

        assert!(drr.dequeue().is_none());
        assert_eq!(drr.len(2), Some((1, 100)));
    }

    #[test]
    fn removing_the_current_class_moves_the_cursor() {
        let mut drr = drr(&[(1, 100), (2, 100), (3, 100)]);
        for id in 1..=3 {
            drr.enqueue(id, Packet::new(100, id)).unwrap();
            drr.enqueue(id, Packet::new(100, id)).unwrap();
        }

        assert_eq!(drr.dequeue().map(|p| p.class_id()), Some(1));
        // Class 1 is still in service with one packet left.
        assert_eq!(drr.remove_class(1).map(|q| q.len()), Some(1));
        assert_eq!(drr.dequeue().map(|p| p.class_id()), Some(2));
        assert_eq!(drr.dequeue().map(|p| p.class_id()), Some(3));
    }
}
