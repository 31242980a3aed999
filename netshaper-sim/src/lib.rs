//! Network impairment emulation.
//!
//! Named [`ImpairmentProfile`]s (delay, loss, duplication, corruption, reordering and
//! bandwidth limits) live in a [`ProfileStore`] and are grouped into [`Scenario`]s, optionally
//! with timed events layered on top. The [`ImpairmentEngine`] applies the resulting effect to
//! individual packets, and the [`ImpairmentSimulator`] drives a queueing discipline and the
//! engine together on a fixed time step.
#![doc(issue_tracker_base_url = "https://github.com/chainbound/netshaper/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod config;
pub use config::SimulationFile;

mod delay;
mod loss;
mod random;

mod driver;
pub use driver::{DriverCall, ImpairmentDriver, NoopDriver, RecordingDriver};

mod effective;
pub use effective::{EffectiveImpairment, ImpairmentDescription};

mod engine;
pub use engine::{
    Delivery, ImpairmentEngine, ImpairmentOutcome, ImpairmentStats, DEFAULT_REORDER_SLOT,
};

mod error;
pub use error::{ConfigError, DriverError, ProfileError, SimulationError};

mod profile;
pub use profile::{
    BandwidthProfile, CorruptProfile, DelayDistribution, DelayProfile, DuplicateProfile,
    ImpairmentProfile, LossModel, ProfileKind, ReorderMode, ReorderProfile,
};

mod scenario;
pub use scenario::{Preset, ResolvedEvent, ResolvedScenario, Scenario, ScenarioEvent};

mod simulator;
pub use simulator::{
    Emission, ImpairmentSimulator, SimulationConfig, SimulatorHandle, TrafficSource,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_DEQUEUE_BUDGET, DEFAULT_STEP,
};

mod stats;
pub use stats::{Counters, DropBreakdown, DropReason, RunStatistics};

mod store;
pub use store::ProfileStore;
