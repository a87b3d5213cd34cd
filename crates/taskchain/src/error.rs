// Error taxonomy for the chain engine.
// Library conditions live in `ChainError`; what a step body reports lives in `StepError`.

use crate::step::StepInfo;
use std::fmt;

/// Conditions raised by the engine itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// A continuation was completed a second time after its first result was accepted.
    #[error("continuation for step {step} was invoked more than once")]
    ReentrancyViolation { step: StepInfo },

    /// `abort()` was called while no step was executing on this thread.
    #[error("abort() called outside of an executing task chain step")]
    AbortOutsideStep,

    /// A callback step did not call its continuation within the allowed ticks.
    #[error("step {step} did not complete within {ticks} ticks")]
    StepTimedOut { step: StepInfo, ticks: u64 },

    /// The value carried between steps was not of the type the step expected.
    #[error("step input was not a {expected}")]
    TypeMismatch { expected: &'static str },

    /// Settings failed validation.
    #[error("invalid task chain settings: {0}")]
    InvalidSettings(String),
}

/// Result type returned by step bodies.
pub type StepResult<T> = Result<T, StepError>;

/// How a step reports that it did not produce a value.
///
/// `Abort` is deliberate control flow: it ends the chain, skips the error
/// handler and is never logged as an error. `Fault` is a genuine failure.
pub enum StepError {
    Abort,
    Fault(anyhow::Error),
}

impl StepError {
    /// Wrap any error (including `anyhow::Error`) as a fault.
    pub fn fault(error: impl Into<anyhow::Error>) -> Self {
        StepError::Fault(error.into())
    }

    /// Whether this is the abort signal rather than a fault.
    pub fn is_abort(&self) -> bool {
        matches!(self, StepError::Abort)
    }
}

impl<E> From<E> for StepError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        StepError::Fault(anyhow::Error::new(error))
    }
}

impl fmt::Debug for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Abort => write!(f, "Abort"),
            StepError::Fault(e) => write!(f, "Fault({:?})", e),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Abort => write!(f, "chain aborted"),
            StepError::Fault(e) => write!(f, "{:#}", e),
        }
    }
}
