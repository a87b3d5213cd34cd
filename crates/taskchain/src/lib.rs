// taskchain: sequential step chains that hop between a host's main thread and
// its background workers. This crate is the engine; `taskchain-host` provides
// a threaded host to run it against.

pub mod affinity;
pub mod chain;
pub mod error;
pub mod factory;
mod handle;
mod holder;
pub mod host;
pub mod settings;
pub mod shared;
pub mod step;

#[cfg(test)]
mod testing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use affinity::{Affinity, ExecutionContext};
pub use chain::{ChainOutcome, DoneCallback, ErrorHandler, TaskChain};
pub use error::{ChainError, StepError, StepResult};
pub use factory::TaskChainFactory;
pub use handle::{abort, ChainHandle};
pub use host::{BoxFuture, GameInterface, Job, MILLIS_PER_TICK};
pub use settings::ChainSettings;
pub use shared::SharedTaskChain;
pub use step::{Next, Step, StepInfo, StepShape, StepTimeout};
