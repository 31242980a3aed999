use netshaper_common::{ClassId, ErrorKind};
use thiserror::Error;

/// Errors returned by a [`QueueDiscipline`](crate::QueueDiscipline).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QdiscError {
    #[error("Unknown class: {0}")]
    UnknownClass(ClassId),
    #[error("Class {0} already exists")]
    DuplicateClass(ClassId),
    #[error("Invalid class {id}: {reason}")]
    InvalidClass { id: ClassId, reason: &'static str },
    #[error("Class {0} is inactive")]
    ClassInactive(ClassId),
    #[error("Queue of class {0} is full")]
    QueueFull(ClassId),
    #[error("Discipline limit of {0} packets exceeded")]
    LimitExceeded(usize),
    #[error("Discipline not initialized")]
    NotInitialized,
    #[error("Discipline already initialized")]
    AlreadyInitialized,
    #[error("Discipline shut down")]
    Shutdown,
}

impl QdiscError {
    /// Returns the category of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownClass(_) |
            Self::DuplicateClass(_) |
            Self::InvalidClass { .. } |
            Self::ClassInactive(_) => ErrorKind::Config,
            Self::QueueFull(_) | Self::LimitExceeded(_) => ErrorKind::Capacity,
            Self::NotInitialized | Self::AlreadyInitialized | Self::Shutdown => ErrorKind::State,
        }
    }
}

/// Errors returned by a [`TokenBucket`](crate::TokenBucket).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenBucketError {
    #[error("Invalid token bucket config: {0}")]
    InvalidConfig(&'static str),
    #[error("Insufficient tokens: requested {requested}, available {available}")]
    Insufficient { requested: u64, available: u64 },
    #[error("Unknown token bucket: {0}")]
    UnknownBucket(String),
}

impl TokenBucketError {
    /// Returns the category of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::UnknownBucket(_) => ErrorKind::Config,
            Self::Insufficient { .. } => ErrorKind::Capacity,
        }
    }
}

pub type Result<T> = std::result::Result<T, QdiscError>;
