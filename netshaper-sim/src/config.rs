//! TOML simulation files.
//!
//! A file describes a discipline and its classes, an optional policing token bucket, named
//! impairment profiles, scenarios grouping them, and the simulation run:
//!
//! ```toml
//! [discipline]
//! kind = "drr"
//!
//! [[discipline.classes]]
//! id = 1
//! quantum = 3000
//!
//! [[profiles]]
//! name = "wan-delay"
//! kind = "delay"
//! base_ms = 40
//! jitter_ms = 5
//! distribution = "normal"
//!
//! [[scenarios]]
//! name = "wan"
//! interface = "eth0"
//! profiles = ["wan-delay"]
//!
//! [simulation]
//! seed = 7
//! step_ms = 10
//!
//! [[simulation.sources]]
//! class_id = 1
//! packets_per_step = 4
//! packet_size = 1200
//! ```
//!
//! Everything deserializes into `*Input` structs with every field optional, which
//! [`SimulationFileInput::resolve`] turns into validated runtime configuration.

use std::time::Duration;

use netshaper_qdisc::{
    DisciplineKind, QdiscOptions, QueueDiscipline, TokenBucketConfig, TrafficClass,
    DEFAULT_CLASS_LIMIT, DEFAULT_LIMIT,
};
use serde::Deserialize;
use tracing::debug;

use crate::{
    driver::ImpairmentDriver,
    profile::{
        BandwidthProfile, CorruptProfile, DelayDistribution, DelayProfile, DuplicateProfile,
        ImpairmentProfile, LossModel, ReorderMode, ReorderProfile,
    },
    scenario::{Scenario, ScenarioEvent},
    simulator::{ImpairmentSimulator, SimulationConfig, TrafficSource},
    store::ProfileStore,
    ConfigError, SimulationError,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationFileInput {
    pub discipline: DisciplineInput,
    pub token_bucket: Option<TokenBucketInput>,
    pub profiles: Vec<ProfileInput>,
    pub scenarios: Vec<ScenarioInput>,
    pub simulation: SimulationInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisciplineInput {
    /// `"wfq"` (default) or `"drr"`.
    pub kind: Option<String>,
    pub limit: Option<usize>,
    pub per_class_limit: Option<usize>,
    pub classes: Vec<ClassInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassInput {
    pub id: Option<u32>,
    pub name: Option<String>,
    pub weight: Option<f64>,
    pub quantum: Option<u32>,
    pub min_bandwidth: Option<u64>,
    pub max_bandwidth: Option<u64>,
    pub active: Option<bool>,
    pub max_queue_len: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenBucketInput {
    pub capacity: Option<u64>,
    pub rate: Option<u64>,
    pub burst_size: Option<u64>,
    pub allow_burst: Option<bool>,
}

/// A profile. `kind` selects which of the other fields are read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileInput {
    pub name: String,
    /// `delay`, `loss`, `duplicate`, `corrupt`, `reorder` or `bandwidth`.
    pub kind: String,
    pub base_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub distribution: Option<DelayDistribution>,
    pub percentage: Option<f64>,
    pub correlation: Option<f64>,
    /// Loss model: `random` (default), `state` or `gilbert_elliott`.
    pub model: Option<String>,
    pub p13: Option<f64>,
    pub p31: Option<f64>,
    pub p32: Option<f64>,
    pub p23: Option<f64>,
    pub p14: Option<f64>,
    pub p: Option<f64>,
    pub r: Option<f64>,
    pub loss_bad: Option<f64>,
    pub loss_good: Option<f64>,
    pub max_flips: Option<u32>,
    pub window_bytes: Option<usize>,
    pub gap: Option<u32>,
    pub mode: Option<ReorderMode>,
    pub rate_kbit: Option<u64>,
    pub rate_bps: Option<u64>,
    pub burst_bytes: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioInput {
    pub name: String,
    pub interface: Option<String>,
    pub profiles: Vec<String>,
    pub events: Vec<EventInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventInput {
    pub start_ms: u64,
    pub end_ms: u64,
    pub profile: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationInput {
    pub seed: Option<u64>,
    pub step_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub dequeue_budget: Option<usize>,
    pub sink_capacity: Option<usize>,
    /// The scenario to run. Defaults to the only scenario, if exactly one is defined.
    pub scenario: Option<String>,
    pub sources: Vec<SourceInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceInput {
    pub class_id: u32,
    pub flow_id: Option<u64>,
    pub packets_per_step: Option<u32>,
    pub packet_size: Option<usize>,
    pub payload: bool,
}

/// A resolved simulation file.
#[derive(Debug)]
pub struct SimulationFile {
    pub discipline: DisciplineKind,
    pub qdisc_options: QdiscOptions,
    pub classes: Vec<TrafficClass>,
    pub token_bucket: Option<TokenBucketConfig>,
    pub store: ProfileStore,
    pub scenario: Option<String>,
    pub simulation: SimulationConfig,
}

impl SimulationFile {
    /// Parses and resolves a TOML document. An empty document yields an empty WFQ setup.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let parsed: SimulationFileInput = toml::from_str(input)?;
        parsed.resolve()
    }

    /// Builds and initializes the discipline described by the file.
    pub fn qdisc(&self) -> Result<QueueDiscipline, ConfigError> {
        let qdisc = QueueDiscipline::new(self.discipline, self.qdisc_options.clone());
        qdisc.initialize(self.classes.iter().cloned())?;
        Ok(qdisc)
    }

    /// Builds a simulator for the file, running the selected scenario.
    pub fn build(
        &self,
        driver: impl ImpairmentDriver,
    ) -> Result<ImpairmentSimulator, SimulationError> {
        let mut simulator =
            ImpairmentSimulator::new(self.qdisc()?, self.simulation.clone()).with_driver(driver);

        if let Some(config) = self.token_bucket {
            simulator = simulator.with_policer(config)?;
        }
        if let Some(name) = &self.scenario {
            simulator = simulator.with_scenario(self.store.resolve_scenario(name)?)?;
        }

        Ok(simulator)
    }
}

impl SimulationFileInput {
    pub fn resolve(mut self) -> Result<SimulationFile, ConfigError> {
        let discipline = match self.discipline.kind.as_deref().map(str::to_ascii_lowercase) {
            None => DisciplineKind::Wfq,
            Some(kind) if kind == "wfq" => DisciplineKind::Wfq,
            Some(kind) if kind == "drr" => DisciplineKind::Drr,
            Some(kind) => return Err(ConfigError::Invalid(format!("unknown discipline {kind}"))),
        };

        let qdisc_options = QdiscOptions::default()
            .limit(self.discipline.limit.unwrap_or(DEFAULT_LIMIT))
            .per_class_limit(self.discipline.per_class_limit.unwrap_or(DEFAULT_CLASS_LIMIT));

        let classes = self
            .discipline
            .classes
            .into_iter()
            .map(ClassInput::resolve)
            .collect::<Result<Vec<_>, _>>()?;

        let token_bucket = self.token_bucket.map(TokenBucketInput::resolve).transpose()?;

        let store = ProfileStore::new();
        for profile in self.profiles {
            let name = profile.name.trim().to_string();
            if name.is_empty() {
                return Err(ConfigError::Invalid("profile without a name".to_string()));
            }
            store.add_profile(name, profile.resolve()?)?;
        }

        for input in self.scenarios {
            let mut scenario =
                Scenario::new(input.name, input.interface.unwrap_or_else(|| "eth0".to_string()));
            for profile in input.profiles {
                scenario = scenario.profile(profile);
            }
            for event in input.events {
                let event = ScenarioEvent::new(event.start_ms, event.end_ms, event.profile);
                scenario = scenario.event(event);
            }
            store.add_scenario(scenario)?;
        }

        let scenario = match self.simulation.scenario.take() {
            Some(name) if store.scenario(&name).is_none() => {
                return Err(ConfigError::Invalid(format!("unknown scenario {name}")))
            }
            Some(name) => Some(name),
            None => {
                let mut names = store.scenarios();
                if names.len() == 1 { names.pop() } else { None }
            }
        };

        let simulation = self.simulation.resolve();

        let file = SimulationFile {
            discipline,
            qdisc_options,
            classes,
            token_bucket,
            store,
            scenario,
            simulation,
        };
        // Surface class errors now rather than at build time.
        file.qdisc()?;

        debug!(
            discipline = %file.discipline,
            classes = file.classes.len(),
            scenario = ?file.scenario,
            "Resolved simulation file"
        );
        Ok(file)
    }
}

impl ClassInput {
    fn resolve(self) -> Result<TrafficClass, ConfigError> {
        let id = self.id.ok_or_else(|| ConfigError::Invalid("class without an id".to_string()))?;

        let mut class = TrafficClass::new(id);
        if let Some(name) = self.name {
            class = class.name(name);
        }
        if let Some(weight) = self.weight {
            class = class.weight(weight);
        }
        if let Some(quantum) = self.quantum {
            class = class.quantum(quantum);
        }
        if let Some(len) = self.max_queue_len {
            class = class.max_queue_len(len);
        }
        class = class
            .bandwidth(self.min_bandwidth.unwrap_or_default(), self.max_bandwidth)
            .active(self.active.unwrap_or(true));

        class.validate()?;
        Ok(class)
    }
}

impl TokenBucketInput {
    fn resolve(self) -> Result<TokenBucketConfig, ConfigError> {
        let defaults = TokenBucketConfig::default();
        let config = defaults
            .capacity(self.capacity.unwrap_or(defaults.capacity))
            .rate(self.rate.unwrap_or(defaults.rate))
            .burst_size(self.burst_size.unwrap_or(defaults.burst_size))
            .allow_burst(self.allow_burst.unwrap_or(defaults.allow_burst));

        config.validate()?;
        Ok(config)
    }
}

impl ProfileInput {
    fn resolve(self) -> Result<ImpairmentProfile, ConfigError> {
        let percentage = self.percentage.unwrap_or_default();
        let correlation = self.correlation.unwrap_or_default();

        let profile = match self.kind.to_ascii_lowercase().as_str() {
            "delay" => {
                let base_ms = self.base_ms.unwrap_or_default();
                let jitter_ms = self.jitter_ms.unwrap_or_default();
                ImpairmentProfile::Delay(
                    DelayProfile::new(base_ms, jitter_ms)
                        .correlation(correlation)
                        .distribution(self.distribution.unwrap_or_default()),
                )
            }
            "loss" => ImpairmentProfile::Loss(self.loss_model(percentage, correlation)?),
            "duplicate" => {
                ImpairmentProfile::Duplicate(DuplicateProfile { percentage, correlation })
            }
            "corrupt" => {
                let defaults = CorruptProfile::new(percentage);
                ImpairmentProfile::Corrupt(CorruptProfile {
                    correlation,
                    max_flips: self.max_flips.unwrap_or(defaults.max_flips),
                    window_bytes: self.window_bytes.unwrap_or(defaults.window_bytes),
                    ..defaults
                })
            }
            "reorder" => {
                let base = ReorderProfile::new(percentage, self.gap.unwrap_or(1));
                ImpairmentProfile::Reorder(ReorderProfile {
                    correlation,
                    ..base.mode(self.mode.unwrap_or_default())
                })
            }
            "bandwidth" => {
                let base = match (self.rate_kbit, self.rate_bps) {
                    (Some(kbit), _) => BandwidthProfile::new(kbit),
                    (None, Some(bps)) => BandwidthProfile::from_bps(bps),
                    (None, None) => {
                        return Err(ConfigError::Invalid(format!(
                            "bandwidth profile {} needs rate_kbit or rate_bps",
                            self.name
                        )))
                    }
                };
                ImpairmentProfile::Bandwidth(BandwidthProfile {
                    burst_bytes: self.burst_bytes,
                    ..base
                })
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "profile {} has unknown kind {other:?}",
                    self.name
                )))
            }
        };

        Ok(profile)
    }

    fn loss_model(&self, percentage: f64, correlation: f64) -> Result<LossModel, ConfigError> {
        let model = self.model.as_deref().unwrap_or("random").to_ascii_lowercase();
        let required = |field: &str, value: Option<f64>| {
            value.ok_or_else(|| {
                ConfigError::Invalid(format!("loss profile {} is missing {field}", self.name))
            })
        };

        match model.as_str() {
            "random" => Ok(LossModel::Random { percentage, correlation }),
            "state" => Ok(LossModel::State {
                p13: required("p13", self.p13)?,
                p31: self.p31.unwrap_or(100.0),
                p32: self.p32.unwrap_or_default(),
                p23: self.p23.unwrap_or_default(),
                p14: self.p14.unwrap_or_default(),
            }),
            "gilbert_elliott" | "gemodel" => Ok(LossModel::GilbertElliott {
                p: required("p", self.p)?,
                r: self.r.unwrap_or(100.0),
                loss_bad: self.loss_bad.unwrap_or(100.0),
                loss_good: self.loss_good.unwrap_or_default(),
            }),
            other => Err(ConfigError::Invalid(format!(
                "loss profile {} has unknown model {other:?}",
                self.name
            ))),
        }
    }
}

impl SimulationInput {
    fn resolve(self) -> SimulationConfig {
        let mut config = SimulationConfig::default();
        if let Some(seed) = self.seed {
            config = config.seed(seed);
        }
        if let Some(step) = self.step_ms {
            config = config.step(Duration::from_millis(step));
        }
        if let Some(duration) = self.duration_ms {
            config = config.duration(Duration::from_millis(duration));
        }
        if let Some(budget) = self.dequeue_budget {
            config = config.dequeue_budget(budget);
        }
        if let Some(capacity) = self.sink_capacity {
            config = config.sink_capacity(capacity);
        }

        for source in self.sources {
            let mut resolved = TrafficSource::new(
                source.class_id,
                source.packets_per_step.unwrap_or(1),
                source.packet_size.unwrap_or(1500),
            );
            if let Some(flow) = source.flow_id {
                resolved = resolved.flow(flow);
            }
            if source.payload {
                resolved = resolved.with_payload();
            }
            config = config.source(resolved);
        }

        config
    }
}
