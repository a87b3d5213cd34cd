// Step contracts: the closed set of step shapes a chain can run, and the
// typed continuation handed to callback-style steps.

use crate::affinity::Affinity;
use crate::error::{ChainError, StepError, StepResult};
use crate::handle::ChainHandle;
use crate::holder::{Completion, Signal};

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// The type-erased value carried from one step to the next.
pub(crate) type Value = Box<dyn Any + Send>;

pub(crate) fn unit_value() -> Value {
    Box::new(())
}

fn take_input<T: 'static>(input: Value) -> Result<T, ChainError> {
    input
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| ChainError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
}

// ---------------------------------------------------------------------------
// Shape and identity
// ---------------------------------------------------------------------------

/// Which of the four step shapes a step was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepShape {
    /// Ignores its input, produces output.
    First,
    /// Consumes input, produces output.
    Plain,
    /// Consumes input, produces nothing.
    Last,
    /// Neither consumes nor produces.
    Generic,
}

impl fmt::Display for StepShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepShape::First => write!(f, "first"),
            StepShape::Plain => write!(f, "plain"),
            StepShape::Last => write!(f, "last"),
            StepShape::Generic => write!(f, "generic"),
        }
    }
}

/// Identifies a queued step in diagnostics and error handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    /// Zero-based position of the step in its chain.
    pub index: usize,
    pub shape: StepShape,
    pub affinity: Affinity,
    /// Whether the step completes through a continuation.
    pub callback: bool,
    pub label: Option<String>,
}

impl fmt::Display for StepInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)?;
        if let Some(ref label) = self.label {
            write!(f, " '{}'", label)?;
        }
        write!(f, " ({} {}", self.affinity, self.shape)?;
        if self.callback {
            write!(f, ", callback")?;
        }
        write!(f, ")")
    }
}

/// Callback-step timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTimeout {
    /// Use the chain's `callback_timeout`.
    ChainDefault,
    Ticks(u64),
    Never,
}

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

type ProduceFn = Box<dyn FnOnce(Value, &ChainHandle) -> StepResult<Value> + Send>;
type ConsumeFn = Box<dyn FnOnce(Value, &ChainHandle) -> StepResult<()> + Send>;
type NeitherFn = Box<dyn FnOnce(&ChainHandle) -> StepResult<()> + Send>;
type ProduceCallbackFn =
    Box<dyn FnOnce(Value, &ChainHandle, Arc<Completion>) -> StepResult<()> + Send>;
type ConsumeCallbackFn =
    Box<dyn FnOnce(Value, &ChainHandle, Arc<Completion>) -> StepResult<()> + Send>;
type NeitherCallbackFn = Box<dyn FnOnce(&ChainHandle, Arc<Completion>) -> StepResult<()> + Send>;

/// Data flow crossed with completion style. First steps are `Produces`
/// bodies that drop their input.
pub(crate) enum StepKind {
    Produces(ProduceFn),
    Consumes(ConsumeFn),
    Neither(NeitherFn),
    ProducesCallback(ProduceCallbackFn),
    ConsumesCallback(ConsumeCallbackFn),
    NeitherCallback(NeitherCallbackFn),
}

impl StepKind {
    pub(crate) fn is_callback(&self) -> bool {
        matches!(
            self,
            StepKind::ProducesCallback(_)
                | StepKind::ConsumesCallback(_)
                | StepKind::NeitherCallback(_)
        )
    }

    /// Run the body. Every outcome, synchronous or not, reaches the chain
    /// through `completion`.
    pub(crate) fn run(self, input: Value, chain: &ChainHandle, completion: &Arc<Completion>) {
        let result = match self {
            StepKind::Produces(body) => body(input, chain),
            StepKind::Consumes(body) => body(input, chain).map(|()| unit_value()),
            StepKind::Neither(body) => {
                drop(input);
                body(chain).map(|()| unit_value())
            }
            StepKind::ProducesCallback(body) | StepKind::ConsumesCallback(body) => {
                Self::started(body(input, chain, Arc::clone(completion)), completion);
                return;
            }
            StepKind::NeitherCallback(body) => {
                drop(input);
                Self::started(body(chain, Arc::clone(completion)), completion);
                return;
            }
        };
        // A rejected second signal has already been logged by the completion.
        let _ = completion.deliver(Signal::from_result(result));
    }

    /// A callback body returned. `Ok` leaves the outcome to its continuation.
    fn started(result: StepResult<()>, completion: &Completion) {
        if let Err(error) = result {
            completion.body_failed(error);
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of work taking `I` and producing `O`.
pub struct Step<I, O> {
    kind: StepKind,
    shape: StepShape,
    label: Option<String>,
    timeout: StepTimeout,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Step<I, O> {
    fn from_kind(kind: StepKind, shape: StepShape) -> Self {
        Self {
            kind,
            shape,
            label: None,
            timeout: StepTimeout::ChainDefault,
            _marker: PhantomData,
        }
    }

    /// Attach a label shown in logs and error reports.
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Fail the chain if this callback step has not completed after `ticks`.
    pub fn with_timeout(mut self, ticks: u64) -> Self {
        self.timeout = StepTimeout::Ticks(ticks);
        self
    }

    /// Never time this step out, whatever the chain default is.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = StepTimeout::Never;
        self
    }

    pub fn shape(&self) -> StepShape {
        self.shape
    }

    pub fn is_callback(&self) -> bool {
        self.kind.is_callback()
    }

    pub(crate) fn into_parts(self) -> (StepKind, StepShape, Option<String>, StepTimeout) {
        (self.kind, self.shape, self.label, self.timeout)
    }
}

impl<I: Send + 'static, O: Send + 'static> Step<I, O> {
    /// A step that ignores its input and produces a value.
    pub fn first<F>(body: F) -> Self
    where
        F: FnOnce(&ChainHandle) -> StepResult<O> + Send + 'static,
    {
        Self::from_kind(
            StepKind::Produces(Box::new(move |_input, chain| {
                body(chain).map(|out| Box::new(out) as Value)
            })),
            StepShape::First,
        )
    }

    /// A step that maps its input to an output.
    pub fn plain<F>(body: F) -> Self
    where
        F: FnOnce(I, &ChainHandle) -> StepResult<O> + Send + 'static,
    {
        Self::from_kind(
            StepKind::Produces(Box::new(move |input, chain| {
                let input = take_input::<I>(input)?;
                body(input, chain).map(|out| Box::new(out) as Value)
            })),
            StepShape::Plain,
        )
    }

    /// Callback form of [`Step::first`].
    pub fn first_callback<F>(body: F) -> Self
    where
        F: FnOnce(&ChainHandle, Next<O>) -> StepResult<()> + Send + 'static,
    {
        Self::from_kind(
            StepKind::ProducesCallback(Box::new(move |_input, chain, completion| {
                body(chain, Next::new(completion))
            })),
            StepShape::First,
        )
    }

    /// Callback form of [`Step::plain`].
    pub fn plain_callback<F>(body: F) -> Self
    where
        F: FnOnce(I, &ChainHandle, Next<O>) -> StepResult<()> + Send + 'static,
    {
        Self::from_kind(
            StepKind::ProducesCallback(Box::new(move |input, chain, completion| {
                let input = take_input::<I>(input)?;
                body(input, chain, Next::new(completion))
            })),
            StepShape::Plain,
        )
    }

    /// A step whose body starts a future. The future is driven by the host
    /// and its output completes the step.
    pub fn future<F, Fut>(body: F) -> Self
    where
        F: FnOnce(I, &ChainHandle) -> Fut + Send + 'static,
        Fut: Future<Output = StepResult<O>> + Send + 'static,
    {
        Self::plain_callback(move |input, chain, next| {
            let future = body(input, chain);
            chain.host().spawn_future(Box::pin(async move {
                let _ = next.settle(future.await);
            }));
            Ok(())
        })
    }
}

impl<I: Send + 'static> Step<I, ()> {
    /// A step that consumes its input and produces nothing.
    pub fn last<F>(body: F) -> Self
    where
        F: FnOnce(I, &ChainHandle) -> StepResult<()> + Send + 'static,
    {
        Self::from_kind(
            StepKind::Consumes(Box::new(move |input, chain| {
                let input = take_input::<I>(input)?;
                body(input, chain)
            })),
            StepShape::Last,
        )
    }

    /// A step with neither input nor output.
    pub fn generic<F>(body: F) -> Self
    where
        F: FnOnce(&ChainHandle) -> StepResult<()> + Send + 'static,
    {
        Self::from_kind(StepKind::Neither(Box::new(body)), StepShape::Generic)
    }

    /// Callback form of [`Step::last`].
    pub fn last_callback<F>(body: F) -> Self
    where
        F: FnOnce(I, &ChainHandle, Next<()>) -> StepResult<()> + Send + 'static,
    {
        Self::from_kind(
            StepKind::ConsumesCallback(Box::new(move |input, chain, completion| {
                let input = take_input::<I>(input)?;
                body(input, chain, Next::new(completion))
            })),
            StepShape::Last,
        )
    }

    /// Callback form of [`Step::generic`].
    pub fn generic_callback<F>(body: F) -> Self
    where
        F: FnOnce(&ChainHandle, Next<()>) -> StepResult<()> + Send + 'static,
    {
        Self::from_kind(
            StepKind::NeitherCallback(Box::new(move |chain, completion| {
                body(chain, Next::new(completion))
            })),
            StepShape::Generic,
        )
    }
}

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// Continuation for a callback-style step.
///
/// Clones share one completion: the first signal through any of them is
/// accepted; a later `complete` is rejected with
/// [`ChainError::ReentrancyViolation`], unless the step already aborted or
/// failed, in which case it is silently ignored.
pub struct Next<T> {
    completion: Arc<Completion>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Next<T> {
    fn clone(&self) -> Self {
        Self {
            completion: Arc::clone(&self.completion),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Next<T> {
    pub(crate) fn new(completion: Arc<Completion>) -> Self {
        Self {
            completion,
            _marker: PhantomData,
        }
    }

    /// Complete the step with its output and let the chain advance.
    pub fn complete(self, value: T) -> Result<(), ChainError> {
        self.completion.deliver(Signal::Complete(Box::new(value)))
    }

    /// End the chain without error.
    pub fn abort(self) -> Result<(), ChainError> {
        self.completion.deliver(Signal::Abort)
    }

    /// End the chain with a fault routed to its error handler.
    pub fn fail(self, error: impl Into<anyhow::Error>) -> Result<(), ChainError> {
        self.completion.deliver(Signal::Fault(error.into()))
    }

    /// Complete, abort or fail according to `result`.
    pub fn settle(self, result: StepResult<T>) -> Result<(), ChainError> {
        match result {
            Ok(value) => self.complete(value),
            Err(StepError::Abort) => self.abort(),
            Err(StepError::Fault(error)) => self.fail(error),
        }
    }

    /// Whether any clone of this continuation has already been used.
    pub fn is_settled(&self) -> bool {
        self.completion.is_settled()
    }

    /// The chain this step belongs to.
    pub fn chain(&self) -> ChainHandle {
        self.completion.chain_handle()
    }
}

impl<T> fmt::Debug for Next<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("step", self.completion.step())
            .finish()
    }
}
