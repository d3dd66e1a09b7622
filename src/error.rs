use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job already registered: {0}")]
    DuplicateId(Uuid),

    #[error("Job not found: {0}")]
    UnknownJob(Uuid),

    #[error("Target set is empty")]
    TargetSetEmpty,

    #[error("Invalid target pattern: {0}")]
    InvalidTarget(String),

    #[error("Job registry at capacity ({0} jobs)")]
    RegistryFull(usize),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
