use crate::{
    effective::EffectiveImpairment,
    profile::{BandwidthProfile, DelayProfile, ImpairmentProfile, LossModel, ReorderProfile},
    ProfileError,
};

/// A time-bounded impairment: `profile` is in force during `[start_ms, end_ms)` of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioEvent {
    pub start_ms: u64,
    pub end_ms: u64,
    /// Name of a profile in the store.
    pub profile: String,
}

impl ScenarioEvent {
    pub fn new(start_ms: u64, end_ms: u64, profile: impl Into<String>) -> Self {
        Self { start_ms, end_ms, profile: profile.into() }
    }

    pub const fn is_active_at(&self, at_ms: u64) -> bool {
        self.start_ms <= at_ms && at_ms < self.end_ms
    }

    pub const fn validate(&self) -> Result<(), ProfileError> {
        if self.start_ms >= self.end_ms {
            return Err(ProfileError::InvalidEvent {
                start_ms: self.start_ms,
                end_ms: self.end_ms,
            });
        }
        Ok(())
    }
}

/// A named set of profiles bound to an interface, plus timed events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    name: String,
    interface: String,
    /// Profile names, in insertion order.
    profiles: Vec<String>,
    events: Vec<ScenarioEvent>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: interface.into(),
            profiles: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn profile(mut self, name: impl Into<String>) -> Self {
        self.profiles.push(name.into());
        self
    }

    pub fn event(mut self, event: ScenarioEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    pub fn events(&self) -> &[ScenarioEvent] {
        &self.events
    }

    /// Returns `true` if the scenario refers to `profile`, as a base profile or from an event.
    pub fn references(&self, profile: &str) -> bool {
        self.profiles.iter().any(|p| p == profile) ||
            self.events.iter().any(|e| e.profile == profile)
    }

    pub(crate) fn profiles_mut(&mut self) -> &mut Vec<String> {
        &mut self.profiles
    }

    pub(crate) fn events_mut(&mut self) -> &mut Vec<ScenarioEvent> {
        &mut self.events
    }
}

/// An event with its profile looked up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub start_ms: u64,
    pub end_ms: u64,
    pub profile_name: String,
    pub profile: ImpairmentProfile,
}

impl ResolvedEvent {
    pub const fn is_active_at(&self, at_ms: u64) -> bool {
        self.start_ms <= at_ms && at_ms < self.end_ms
    }
}

/// A scenario with every profile name replaced by its value. This is what the engine and the
/// simulator consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScenario {
    pub name: String,
    pub interface: String,
    pub base: EffectiveImpairment,
    pub events: Vec<ResolvedEvent>,
}

impl ResolvedScenario {
    /// Indices of the events active at `at_ms`.
    pub fn active_events(&self, at_ms: u64) -> Vec<usize> {
        self.events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_active_at(at_ms))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// The overlay formed by the events active at `at_ms`. When active events share a kind, the
    /// one listed last wins.
    pub fn overlay_at(&self, at_ms: u64) -> EffectiveImpairment {
        let mut overlay = EffectiveImpairment::default();
        for event in self.events.iter().filter(|e| e.is_active_at(at_ms)) {
            overlay.set(event.profile);
        }
        overlay
    }

    /// The base with the active overlay on top.
    pub fn effective_at(&self, at_ms: u64) -> EffectiveImpairment {
        self.base.layered(&self.overlay_at(at_ms))
    }
}

/// Ready-made scenarios for common path types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Preset {
    /// 100 ms delay with 10 ms jitter.
    HighLatency,
    /// Random loss at the given percentage, 25% correlated.
    PacketLoss(f64),
    /// Jitter of the given milliseconds around no base delay.
    Jitter(f64),
    /// A link capped at the given bits per second.
    BandwidthLimit(u64),
    /// 50 ms ± 20 ms, 2% loss.
    MobileNetwork,
    /// 500 ms ± 10 ms, 1% loss.
    SatelliteLink,
    /// 100 ms ± 50 ms, 5% loss, 10% reordering.
    CongestedNetwork,
}

impl Preset {
    pub fn profiles(&self) -> Vec<ImpairmentProfile> {
        match *self {
            Self::HighLatency => vec![ImpairmentProfile::Delay(DelayProfile::new(100.0, 10.0))],
            Self::PacketLoss(pct) => {
                let model = LossModel::Random { percentage: pct, correlation: 25.0 };
                vec![ImpairmentProfile::Loss(model)]
            }
            Self::Jitter(ms) => vec![ImpairmentProfile::Delay(DelayProfile::new(0.0, ms))],
            Self::BandwidthLimit(bps) => {
                vec![ImpairmentProfile::Bandwidth(BandwidthProfile::from_bps(bps))]
            }
            Self::MobileNetwork => vec![
                ImpairmentProfile::Delay(DelayProfile::new(50.0, 20.0)),
                ImpairmentProfile::Loss(LossModel::Random { percentage: 2.0, correlation: 30.0 }),
            ],
            Self::SatelliteLink => vec![
                ImpairmentProfile::Delay(DelayProfile::new(500.0, 10.0)),
                ImpairmentProfile::Loss(LossModel::Random { percentage: 1.0, correlation: 20.0 }),
            ],
            Self::CongestedNetwork => vec![
                ImpairmentProfile::Delay(DelayProfile::new(100.0, 50.0)),
                ImpairmentProfile::Loss(LossModel::Random { percentage: 5.0, correlation: 40.0 }),
                ImpairmentProfile::Reorder(ReorderProfile::new(10.0, 5)),
            ],
        }
    }
}
