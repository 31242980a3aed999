use std::time::{Duration, Instant};

use bytes::BytesMut;
use netshaper_common::{FlowId, Packet};
use parking_lot::RwLock;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    delay::DelaySampler,
    effective::{EffectiveImpairment, ImpairmentDescription},
    loss::LossChain,
    profile::{BandwidthProfile, CorruptProfile, ReorderMode, ReorderProfile},
    random::Correlated,
    ProfileError,
};

/// Hold slot used by reordering when no bandwidth profile gives a per-packet service time.
pub const DEFAULT_REORDER_SLOT: Duration = Duration::from_millis(1);

/// Flows tracked by the per-flow loss chains before the table is pruned.
pub const MAX_LOSS_FLOWS: usize = 4096;

/// A packet cleared for release after `delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub packet: Packet,
    /// Total hold time: sampled delay, reorder hold and bandwidth wait.
    pub delay: Duration,
    /// Absolute deviation of the sampled delay from the base delay.
    pub jitter: Duration,
    pub corrupted: bool,
    pub reordered: bool,
}

/// What happened to a packet passed through [`ImpairmentEngine::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum ImpairmentOutcome {
    Forward(Delivery),
    Drop,
    /// The original and its copy, each shaped independently.
    Duplicate(Delivery, Delivery),
    /// Held back past packets that arrived after it.
    Reorder(Delivery),
    /// Forwarded with a mutated payload.
    Corrupted(Delivery),
}

impl ImpairmentOutcome {
    pub const fn is_drop(&self) -> bool {
        matches!(self, Self::Drop)
    }

    /// The packets to release, in emission order.
    pub fn into_deliveries(self) -> Vec<Delivery> {
        match self {
            Self::Drop => Vec::new(),
            Self::Forward(d) | Self::Reorder(d) | Self::Corrupted(d) => vec![d],
            Self::Duplicate(a, b) => vec![a, b],
        }
    }
}

/// Engine counters. Zeroed only by [`ImpairmentEngine::reset_statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpairmentStats {
    pub processed: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub reordered: u64,
    /// Deliveries released with a non-zero hold time.
    pub delayed: u64,
    /// Deliveries that had to wait for the bandwidth gate.
    pub bandwidth_delayed: u64,
    pub total_delay: Duration,
    pub total_jitter: Duration,
}

/// Token-bucket pacing at the link rate. Packets beyond the rate accrue debt and wait for it
/// to be repaid. Nothing is ever dropped here.
///
/// The bucket starts full, and its clock starts at the first packet it sees.
#[derive(Debug, Clone)]
struct BandwidthGate {
    bytes_per_sec: f64,
    burst: f64,
    tokens: f64,
    last: Option<Duration>,
}

impl BandwidthGate {
    fn new(profile: BandwidthProfile) -> Self {
        let burst = f64::from(profile.effective_burst_bytes());
        Self { bytes_per_sec: profile.bytes_per_sec() as f64, burst, tokens: burst, last: None }
    }

    fn admit(&mut self, size: usize, now: Duration) -> Duration {
        match self.last {
            Some(last) if now > last => {
                let elapsed = (now - last).as_secs_f64();
                self.tokens = (self.tokens + elapsed * self.bytes_per_sec).min(self.burst);
                self.last = Some(now);
            }
            Some(_) => {}
            None => self.last = Some(now),
        }

        self.tokens -= size as f64;
        if self.tokens >= 0.0 || self.bytes_per_sec == 0.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((-self.tokens / self.bytes_per_sec * 1e9).round() as u64)
        }
    }
}

#[derive(Debug)]
struct EngineInner {
    rng: StdRng,
    epoch: Instant,
    base: EffectiveImpairment,
    overlay: EffectiveImpairment,
    effective: EffectiveImpairment,
    /// Loss chains are per flow so bursts on one flow don't bleed into another.
    loss: FxHashMap<FlowId, LossChain>,
    delay: Option<DelaySampler>,
    duplicate: Correlated,
    corrupt: Correlated,
    reorder: Correlated,
    reorder_candidates: u64,
    gate: Option<BandwidthGate>,
    stats: ImpairmentStats,
}

impl EngineInner {
    /// Recomputes the effective set, resetting the state of every kind whose profile changed.
    fn refresh(&mut self) {
        let previous = self.effective;
        let next = self.base.layered(&self.overlay);
        self.effective = next;

        if previous.loss != next.loss {
            self.loss.clear();
        }
        if previous.delay != next.delay {
            self.delay = next.delay.map(DelaySampler::new);
        }
        if previous.duplicate != next.duplicate {
            self.duplicate = Correlated::new(next.duplicate.map_or(0.0, |d| d.correlation));
        }
        if previous.corrupt != next.corrupt {
            self.corrupt = Correlated::new(next.corrupt.map_or(0.0, |c| c.correlation));
        }
        if previous.reorder != next.reorder {
            self.reorder = Correlated::new(next.reorder.map_or(0.0, |r| r.correlation));
            self.reorder_candidates = 0;
        }
        if previous.bandwidth != next.bandwidth {
            self.gate = next.bandwidth.map(BandwidthGate::new);
        }
    }

    fn reset_state(&mut self) {
        self.effective = EffectiveImpairment::default();
        self.loss.clear();
        self.delay = None;
        self.duplicate = Correlated::default();
        self.corrupt = Correlated::default();
        self.reorder = Correlated::default();
        self.reorder_candidates = 0;
        self.gate = None;
        self.refresh();
    }

    /// Makes room in the per-flow loss table. Resting chains go first since a fresh chain
    /// replaces them exactly. If every chain is mid-burst the table starts over.
    fn evict_loss_chains(&mut self) {
        self.loss.retain(|_, chain| !chain.is_resting());
        if self.loss.len() >= MAX_LOSS_FLOWS {
            debug!(flows = self.loss.len(), "Loss table full, resetting all flow chains");
            self.loss.clear();
        }
    }

    fn apply(&mut self, packet: Packet, now: Duration) -> ImpairmentOutcome {
        self.stats.processed += 1;
        let effect = self.effective;

        if let Some(model) = effect.loss {
            let flow = packet.flow_id();
            if self.loss.len() >= MAX_LOSS_FLOWS && !self.loss.contains_key(&flow) {
                self.evict_loss_chains();
            }
            let chain = self.loss.entry(flow).or_insert_with(|| LossChain::new(model));
            if chain.should_drop(&mut self.rng) {
                self.stats.dropped += 1;
                trace!(seq = packet.arrival_sequence(), flow = packet.flow_id(), "Dropped packet");
                return ImpairmentOutcome::Drop;
            }
        }

        let duplicated = match effect.duplicate {
            Some(d) => self.duplicate.chance(&mut self.rng, d.percentage),
            None => false,
        };

        if duplicated {
            self.stats.duplicated += 1;
            let copy = packet.duplicate();
            let original = self.shape(packet, &effect, now);
            let copy = self.shape(copy, &effect, now);
            trace!(seq = original.packet.arrival_sequence(), "Duplicated packet");
            return ImpairmentOutcome::Duplicate(original, copy);
        }

        let delivery = self.shape(packet, &effect, now);
        if delivery.reordered {
            ImpairmentOutcome::Reorder(delivery)
        } else if delivery.corrupted {
            ImpairmentOutcome::Corrupted(delivery)
        } else {
            ImpairmentOutcome::Forward(delivery)
        }
    }

    /// Runs corrupt, reorder, delay and bandwidth on one copy.
    fn shape(
        &mut self,
        mut packet: Packet,
        effect: &EffectiveImpairment,
        now: Duration,
    ) -> Delivery {
        let mut corrupted = false;
        if let Some(profile) = effect.corrupt {
            if self.corrupt.chance(&mut self.rng, profile.percentage) {
                corrupt_payload(&mut packet, &profile, &mut self.rng);
                corrupted = true;
                self.stats.corrupted += 1;
            }
        }

        let mut hold = Duration::ZERO;
        let mut reordered = false;
        if let Some(profile) = effect.reorder {
            if let Some(slots) = self.reorder_slots(&profile) {
                let slot = effect
                    .bandwidth
                    .map_or(DEFAULT_REORDER_SLOT, |b| b.transmission_time(packet.size()));
                hold = slot * slots;
                reordered = true;
                self.stats.reordered += 1;
            }
        }

        let (delay, jitter) = match self.delay.as_mut() {
            Some(sampler) => {
                let sample = sampler.sample(&mut self.rng);
                (sample.delay, sample.jitter)
            }
            None => (Duration::ZERO, Duration::ZERO),
        };

        let wait = match self.gate.as_mut() {
            Some(gate) => gate.admit(packet.size(), now),
            None => Duration::ZERO,
        };
        if !wait.is_zero() {
            self.stats.bandwidth_delayed += 1;
        }

        let total = delay + hold + wait;
        if !total.is_zero() {
            self.stats.delayed += 1;
        }
        self.stats.total_delay += total;
        self.stats.total_jitter += jitter;

        Delivery { packet, delay: total, jitter, corrupted, reordered }
    }

    /// Returns the number of slots to hold the next packet for, if it is picked for reordering.
    fn reorder_slots(&mut self, profile: &ReorderProfile) -> Option<u32> {
        match profile.mode {
            ReorderMode::Percentage => {
                self.reorder.chance(&mut self.rng, profile.percentage).then_some(profile.gap)
            }
            ReorderMode::Gap => {
                self.reorder_candidates += 1;
                if self.reorder_candidates % u64::from(profile.gap) != 0 {
                    return None;
                }
                self.reorder
                    .chance(&mut self.rng, profile.percentage)
                    .then(|| self.rng.gen_range(1..=profile.gap))
            }
        }
    }
}

/// Flips between 1 and `max_flips` random bits within the first `window_bytes` of the payload.
/// Packets without a payload are only marked.
fn corrupt_payload<R: Rng + ?Sized>(packet: &mut Packet, profile: &CorruptProfile, rng: &mut R) {
    let Some(payload) = packet.payload().filter(|p| !p.is_empty()) else {
        return;
    };

    let mut bytes = BytesMut::from(payload.as_ref());
    let window = bytes.len().min(profile.window_bytes);
    let flips = rng.gen_range(1..=profile.max_flips.max(1));
    for _ in 0..flips {
        let idx = rng.gen_range(0..window);
        bytes[idx] ^= 1 << rng.gen_range(0..8u8);
    }

    packet.replace_payload(bytes.freeze());
}

/// Applies the effective impairment set to a packet stream.
///
/// Effects compose in a fixed order: loss, duplicate, then corrupt, reorder, delay and bandwidth
/// on each surviving copy. All randomness comes from one seeded [`StdRng`], so two engines with
/// the same seed, profiles and packet sequence make identical decisions.
///
/// The effective set is a base set (usually a scenario's profiles) with an overlay on top
/// (usually the scenario events currently active). Swapping either resets the state of the
/// kinds that changed.
#[derive(Debug)]
pub struct ImpairmentEngine {
    seed: u64,
    inner: RwLock<EngineInner>,
}

impl ImpairmentEngine {
    /// Creates an engine with no effects.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            inner: RwLock::new(EngineInner {
                rng: StdRng::seed_from_u64(seed),
                epoch: Instant::now(),
                base: EffectiveImpairment::default(),
                overlay: EffectiveImpairment::default(),
                effective: EffectiveImpairment::default(),
                loss: FxHashMap::default(),
                delay: None,
                duplicate: Correlated::default(),
                corrupt: Correlated::default(),
                reorder: Correlated::default(),
                reorder_candidates: 0,
                gate: None,
                stats: ImpairmentStats::default(),
            }),
        }
    }

    /// Creates an engine applying `effect`.
    pub fn with_impairment(seed: u64, effect: EffectiveImpairment) -> Result<Self, ProfileError> {
        let engine = Self::new(seed);
        engine.set_base(effect)?;
        Ok(engine)
    }

    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Applies the effects to `packet`, timing the bandwidth gate by the wall clock.
    pub fn apply(&self, packet: Packet) -> ImpairmentOutcome {
        let mut inner = self.inner.write();
        let now = inner.epoch.elapsed();
        inner.apply(packet, now)
    }

    /// Applies the effects to `packet` at `now`, an offset on the caller's clock. The clock must
    /// not go backwards between calls.
    pub fn apply_at(&self, packet: Packet, now: Duration) -> ImpairmentOutcome {
        self.inner.write().apply(packet, now)
    }

    /// Replaces the base effect set.
    pub fn set_base(&self, effect: EffectiveImpairment) -> Result<(), ProfileError> {
        effect.validate()?;

        let mut inner = self.inner.write();
        inner.base = effect;
        inner.refresh();
        debug!(effective = ?inner.effective, "Base impairment updated");
        Ok(())
    }

    /// Replaces the overlay. Kinds present in the overlay win over the base.
    pub fn set_overlay(&self, effect: EffectiveImpairment) -> Result<(), ProfileError> {
        effect.validate()?;

        let mut inner = self.inner.write();
        inner.overlay = effect;
        inner.refresh();
        debug!(effective = ?inner.effective, "Impairment overlay updated");
        Ok(())
    }

    pub fn clear_overlay(&self) {
        let mut inner = self.inner.write();
        inner.overlay = EffectiveImpairment::default();
        inner.refresh();
    }

    /// Removes every effect. Statistics are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.base = EffectiveImpairment::default();
        inner.overlay = EffectiveImpairment::default();
        inner.refresh();
        debug!("Impairments cleared");
    }

    /// Restarts the random stream from `seed` and resets all per-flow and per-effect state.
    pub fn reseed(&self, seed: u64) {
        let mut inner = self.inner.write();
        inner.rng = StdRng::seed_from_u64(seed);
        inner.reset_state();
    }

    /// The effect set currently applied.
    pub fn effective(&self) -> EffectiveImpairment {
        self.inner.read().effective
    }

    pub fn describe(&self) -> ImpairmentDescription {
        self.inner.read().effective.describe()
    }

    /// A snapshot of the counters.
    pub fn statistics(&self) -> ImpairmentStats {
        self.inner.read().stats.clone()
    }

    pub fn reset_statistics(&self) {
        self.inner.write().stats = ImpairmentStats::default();
    }
}
