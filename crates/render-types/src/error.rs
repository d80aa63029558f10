use thiserror::Error;

/// Error taxonomy for the render pipeline engine's public contract.
///
/// `Transient` provider failures are deliberately not a variant here: per the
/// engine's step contract, a step body retries transient failures internally
/// and only ever surfaces `StepFailed` once its own retries are exhausted.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("queue is full")]
    QueueFull,

    #[error("not found")]
    NotFound,

    #[error("run cannot be canceled in its current state")]
    NotCancelable,

    #[error("run cannot be retried in its current state")]
    NotRetryable,

    #[error("step failed: {0}")]
    StepFailed(String),

    #[error("canceled")]
    Canceled,

    #[error("too many subscribers for this run")]
    TooManySubscribers,

    #[error("corrupt persisted state: {0}")]
    Corrupt(String),

    #[error("store transaction conflict: {0}")]
    IntegrityViolation(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
