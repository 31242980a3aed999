use netshaper_common::ErrorKind;
use netshaper_qdisc::{QdiscError, TokenBucketError};
use thiserror::Error;

use crate::profile::ProfileKind;

/// Errors raised while creating, grouping or resolving impairment profiles.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Invalid {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: &'static str },
    #[error("Name already in use: {0}")]
    DuplicateName(String),
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("Profile {profile} is referenced by scenario {scenario}")]
    ProfileInUse { profile: String, scenario: String },
    #[error("Scenario {scenario} already has a {kind} profile")]
    DuplicateKind { scenario: String, kind: ProfileKind },
    #[error("Invalid event window [{start_ms}, {end_ms})")]
    InvalidEvent { start_ms: u64, end_ms: u64 },
}

impl ProfileError {
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Errors returned by an [`ImpairmentDriver`](crate::ImpairmentDriver).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Driver error on {interface}: {reason}")]
pub struct DriverError {
    pub interface: String,
    pub reason: String,
}

/// Errors raised while loading a simulation file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Qdisc(#[from] QdiscError),
    #[error(transparent)]
    TokenBucket(#[from] TokenBucketError),
}

impl ConfigError {
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Errors returned by the [`ImpairmentSimulator`](crate::ImpairmentSimulator).
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Simulation already running")]
    AlreadyRunning,
    #[error("Simulation not running")]
    NotRunning,
    #[error("Injection queue full")]
    InjectQueueFull,
    #[error("Simulation step panicked")]
    Panicked,
    #[error("Simulation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Qdisc(#[from] QdiscError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    TokenBucket(#[from] TokenBucketError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl SimulationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyRunning |
            Self::NotRunning |
            Self::Panicked |
            Self::Join(_) |
            Self::Driver(_) => ErrorKind::State,
            Self::InjectQueueFull => ErrorKind::Capacity,
            Self::Qdisc(e) => e.kind(),
            Self::TokenBucket(e) => e.kind(),
            Self::Profile(_) | Self::Config(_) => ErrorKind::Config,
        }
    }
}
