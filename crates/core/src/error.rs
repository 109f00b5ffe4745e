use thiserror::Error;

pub type PulseResult<T> = Result<T, PulseError>;

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Segment {0} not found")]
    SegmentNotFound(String),

    #[error("Journey {0} not found")]
    JourneyNotFound(uuid::Uuid),

    #[error("Instance {0} not found")]
    InstanceNotFound(uuid::Uuid),

    #[error("Instance store error: {0}")]
    Store(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
