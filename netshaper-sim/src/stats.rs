use std::{collections::BTreeMap, time::Duration};

use netshaper_common::ClassId;

use crate::engine::Delivery;

/// Per-class or global packet counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub packets_queued: u64,
    pub bytes_queued: u64,
    pub packets_dequeued: u64,
    pub bytes_dequeued: u64,
    pub packets_dropped: u64,
    pub bytes_dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub reordered: u64,
    /// Packets released from the path, duplicates included. Corruption, reordering, delay and
    /// jitter are accounted for these packets only.
    pub delivered: u64,
    pub total_delay: Duration,
    pub total_jitter: Duration,
}

impl Counters {
    fn merge(&mut self, other: &Self) {
        self.packets_queued += other.packets_queued;
        self.bytes_queued += other.bytes_queued;
        self.packets_dequeued += other.packets_dequeued;
        self.bytes_dequeued += other.bytes_dequeued;
        self.packets_dropped += other.packets_dropped;
        self.bytes_dropped += other.bytes_dropped;
        self.duplicated += other.duplicated;
        self.corrupted += other.corrupted;
        self.reordered += other.reordered;
        self.delivered += other.delivered;
        self.total_delay += other.total_delay;
        self.total_jitter += other.total_jitter;
    }

    /// Mean hold time over delivered packets.
    pub fn mean_delay(&self) -> Option<Duration> {
        let delivered = u32::try_from(self.delivered).ok().filter(|n| *n > 0)?;
        Some(self.total_delay / delivered)
    }
}

/// Where a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Refused by the policing token bucket.
    Policed,
    /// Refused by the queueing discipline.
    Rejected,
    /// Lost by the impairment engine.
    Lost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropBreakdown {
    pub policed: u64,
    pub rejected: u64,
    pub lost: u64,
    /// Packets in hand when a step failed or panicked. They reached neither the discipline
    /// nor the emission stream.
    pub aborted: u64,
}

/// Aggregate statistics of a simulation run.
///
/// Counters only grow, except through
/// [`reset_statistics`](crate::ImpairmentSimulator::reset_statistics). `elapsed` and
/// `active_events` describe the run's current state and survive a reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatistics {
    pub global: Counters,
    pub classes: BTreeMap<ClassId, Counters>,
    pub drops: DropBreakdown,
    /// Steps executed.
    pub steps: u64,
    /// Packets released with a lower arrival sequence than one released before them.
    pub out_of_order: u64,
    /// Released packets the emission stream had no room for.
    pub sink_overflow: u64,
    /// Logical time of the run.
    pub elapsed: Duration,
    /// Indices of the scenario events in force.
    pub active_events: Vec<usize>,
}

impl RunStatistics {
    pub fn class(&self, class_id: ClassId) -> Option<&Counters> {
        self.classes.get(&class_id)
    }

    /// Returns `true` if every counter is zero.
    pub fn counters_are_zero(&self) -> bool {
        let zero = Counters::default();
        self.global == zero &&
            self.classes.values().all(|c| *c == zero) &&
            self.drops == DropBreakdown::default() &&
            self.steps == 0 &&
            self.out_of_order == 0 &&
            self.sink_overflow == 0
    }

    pub(crate) fn merge(&mut self, report: &StepReport) {
        self.merge_counters(report);
        self.steps += 1;
        self.elapsed = report.elapsed;
        self.active_events.clone_from(&report.active_events);
    }

    /// Keeps what a failed step already did to the discipline and the stream. The step itself
    /// does not count, and the clock and active events stay where they were.
    pub(crate) fn merge_aborted(&mut self, report: &StepReport) {
        self.merge_counters(report);
        self.drops.aborted += report.in_hand;
    }

    fn merge_counters(&mut self, report: &StepReport) {
        self.global.merge(&report.global);
        for (class_id, counters) in &report.classes {
            self.classes.entry(*class_id).or_default().merge(counters);
        }
        self.drops.policed += report.drops.policed;
        self.drops.rejected += report.drops.rejected;
        self.drops.lost += report.drops.lost;
        self.out_of_order += report.out_of_order;
        self.sink_overflow += report.sink_overflow;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self {
            elapsed: self.elapsed,
            active_events: std::mem::take(&mut self.active_events),
            ..Default::default()
        };
    }
}

/// What happened during one step. Merged into the shared [`RunStatistics`] in one go once
/// the step completes or fails.
#[derive(Debug, Default)]
pub(crate) struct StepReport {
    global: Counters,
    classes: BTreeMap<ClassId, Counters>,
    drops: DropBreakdown,
    pub(crate) out_of_order: u64,
    pub(crate) sink_overflow: u64,
    /// Packets taken out of the discipline or the arrival queue and not yet accounted.
    pub(crate) in_hand: u64,
    pub(crate) elapsed: Duration,
    pub(crate) active_events: Vec<usize>,
}

impl StepReport {
    fn update(&mut self, class_id: ClassId, f: impl Fn(&mut Counters)) {
        f(&mut self.global);
        f(self.classes.entry(class_id).or_default());
    }

    pub(crate) fn queued(&mut self, class_id: ClassId, bytes: usize) {
        self.update(class_id, |c| {
            c.packets_queued += 1;
            c.bytes_queued += bytes as u64;
        });
    }

    pub(crate) fn dequeued(&mut self, class_id: ClassId, bytes: usize) {
        self.update(class_id, |c| {
            c.packets_dequeued += 1;
            c.bytes_dequeued += bytes as u64;
        });
    }

    pub(crate) fn dropped(&mut self, class_id: ClassId, bytes: usize, reason: DropReason) {
        self.update(class_id, |c| {
            c.packets_dropped += 1;
            c.bytes_dropped += bytes as u64;
        });
        match reason {
            DropReason::Policed => self.drops.policed += 1,
            DropReason::Rejected => self.drops.rejected += 1,
            DropReason::Lost => self.drops.lost += 1,
        }
    }

    pub(crate) fn duplicated(&mut self, class_id: ClassId) {
        self.update(class_id, |c| c.duplicated += 1);
    }

    /// Accounts a delivery released from the path.
    pub(crate) fn delivered(&mut self, delivery: &Delivery) {
        let (corrupted, reordered) = (delivery.corrupted, delivery.reordered);
        let (delay, jitter) = (delivery.delay, delivery.jitter);
        self.update(delivery.packet.class_id(), |c| {
            c.delivered += 1;
            c.corrupted += u64::from(corrupted);
            c.reordered += u64::from(reordered);
            c.total_delay += delay;
            c.total_jitter += jitter;
        });
    }
}
