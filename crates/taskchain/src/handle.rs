// ChainHandle: the explicit view of its own chain that every step body receives,
// plus the thread-local lookup layered on top of it.

use crate::affinity::ExecutionContext;
use crate::chain::ChainInner;
use crate::error::{ChainError, StepError, StepResult};
use crate::host::GameInterface;

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A handle to the chain a step is running in.
///
/// Passed explicitly to every step body. Gives access to the chain's task
/// data and position; it cannot reorder or reach into the value slot.
#[derive(Clone)]
pub struct ChainHandle {
    inner: Arc<ChainInner>,
}

impl ChainHandle {
    pub(crate) fn new(inner: Arc<ChainInner>) -> Self {
        Self { inner }
    }

    /// The chain whose step is executing on this thread, if any.
    ///
    /// Only set for the duration of a step body's synchronous part.
    pub fn current() -> Option<ChainHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Unique id of the chain, as shown in logs.
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    /// Index of the step currently running.
    pub fn action_index(&self) -> usize {
        self.inner.action_index()
    }

    /// The context the chain last recorded itself on.
    pub fn context(&self) -> ExecutionContext {
        self.inner.context()
    }

    /// Store a value under `key`, replacing any previous one.
    pub fn set_data<V: Any + Send>(&self, key: impl Into<String>, value: V) {
        self.inner.set_data(key.into(), Box::new(value));
    }

    /// Clone of the value under `key` if present and of type `V`.
    pub fn data<V: Any + Clone>(&self, key: &str) -> Option<V> {
        self.inner.data(key)
    }

    /// Remove and return the value under `key` if it is of type `V`.
    pub fn take_data<V: Any>(&self, key: &str) -> Option<V> {
        self.inner.take_data(key)
    }

    pub(crate) fn host(&self) -> &Arc<dyn GameInterface> {
        self.inner.host()
    }
}

impl fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainHandle").field("id", &self.id()).finish()
    }
}

// ---------------------------------------------------------------------------
// Thread-local current step
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: RefCell<Option<ChainHandle>> = RefCell::new(None);
}

/// Publishes a chain as "current" on this thread until dropped, then restores
/// whatever was current before (chains may run nested on one thread).
pub(crate) struct StepScope {
    previous: Option<ChainHandle>,
}

impl StepScope {
    pub(crate) fn enter(handle: ChainHandle) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(handle)));
        Self { previous }
    }
}

impl Drop for StepScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Abort the chain whose step is running on this thread.
///
/// Use as `return taskchain::abort();` from a step body. Outside a step this
/// does not touch any chain; it returns a fault carrying
/// [`ChainError::AbortOutsideStep`].
pub fn abort<T>() -> StepResult<T> {
    if ChainHandle::current().is_some() {
        Err(StepError::Abort)
    } else {
        let error = ChainError::AbortOutsideStep;
        tracing::error!("{}", error);
        Err(error.into())
    }
}
