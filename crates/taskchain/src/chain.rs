// TaskChain: builds an ordered queue of steps and walks it one step at a time,
// hopping between the main thread and background workers as steps require.

use crate::affinity::{Affinity, ExecutionContext};
use crate::error::{StepError, StepResult};
use crate::handle::ChainHandle;
use crate::holder::{Signal, TaskHolder};
use crate::host::{GameInterface, Job};
use crate::shared::SharedTaskChain;
use crate::step::{unit_value, Next, Step, StepInfo, StepKind, StepShape, StepTimeout, Value};

use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Invoked exactly once when a chain stops.
pub type DoneCallback = Box<dyn FnOnce(ChainOutcome) + Send + 'static>;

/// Receives a step fault together with the step that raised it.
pub type ErrorHandler = Box<dyn FnOnce(anyhow::Error, &StepInfo) + Send + 'static>;

/// How a chain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every step ran.
    Completed,
    /// A step asked the chain to stop.
    Aborted,
    /// A step faulted; the fault went to the error handler or the host log.
    Failed,
}

impl ChainOutcome {
    pub fn is_completed(self) -> bool {
        self == ChainOutcome::Completed
    }
}

impl fmt::Display for ChainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainOutcome::Completed => write!(f, "completed"),
            ChainOutcome::Aborted => write!(f, "aborted"),
            ChainOutcome::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// ChainInner
// ---------------------------------------------------------------------------

struct ChainState {
    queue: VecDeque<TaskHolder>,
    appended: usize,
    /// Output of the last completed step. Only the in-flight step's
    /// bookkeeping touches it.
    previous: Option<Value>,
    context: ExecutionContext,
    action_index: usize,
    callback_timeout: Option<u64>,
    done: Option<DoneCallback>,
    /// Runs after `done`; used by shared groups to release the next member.
    after_done: Option<DoneCallback>,
    error_handler: Option<ErrorHandler>,
    data: HashMap<String, Value>,
    outcome: Option<ChainOutcome>,
}

/// Shared state of one chain. Held by the builder until `execute`, then by
/// whichever job or continuation is moving the chain forward.
pub(crate) struct ChainInner {
    id: Uuid,
    host: Arc<dyn GameInterface>,
    group: Option<Arc<SharedTaskChain>>,
    state: Mutex<ChainState>,
}

impl ChainInner {
    fn new(
        host: Arc<dyn GameInterface>,
        group: Option<Arc<SharedTaskChain>>,
        callback_timeout: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            host,
            group,
            state: Mutex::new(ChainState {
                queue: VecDeque::new(),
                appended: 0,
                previous: None,
                context: ExecutionContext::Main,
                action_index: 0,
                callback_timeout,
                done: None,
                after_done: None,
                error_handler: None,
                data: HashMap::new(),
                outcome: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn host(&self) -> &Arc<dyn GameInterface> {
        &self.host
    }

    pub(crate) fn action_index(&self) -> usize {
        self.state.lock().action_index
    }

    pub(crate) fn context(&self) -> ExecutionContext {
        self.state.lock().context
    }

    pub(crate) fn is_aborted(&self) -> bool {
        matches!(
            self.state.lock().outcome,
            Some(ChainOutcome::Aborted) | Some(ChainOutcome::Failed)
        )
    }

    pub(crate) fn resolve_timeout(&self, timeout: StepTimeout) -> Option<u64> {
        match timeout {
            StepTimeout::ChainDefault => self.state.lock().callback_timeout,
            StepTimeout::Ticks(ticks) => Some(ticks),
            StepTimeout::Never => None,
        }
    }

    pub(crate) fn set_data(&self, key: String, value: Value) {
        self.state.lock().data.insert(key, value);
    }

    pub(crate) fn data<V: Any + Clone>(&self, key: &str) -> Option<V> {
        self.state
            .lock()
            .data
            .get(key)
            .and_then(|value| value.downcast_ref::<V>())
            .cloned()
    }

    pub(crate) fn take_data<V: Any>(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        let value = state.data.remove(key)?;
        match value.downcast::<V>() {
            Ok(value) => Some(*value),
            Err(value) => {
                state.data.insert(key.to_string(), value);
                None
            }
        }
    }

    fn push(
        &self,
        affinity: Affinity,
        (kind, shape, label, timeout): (StepKind, StepShape, Option<String>, StepTimeout),
    ) {
        let mut state = self.state.lock();
        let info = StepInfo {
            index: state.appended,
            shape,
            affinity,
            callback: kind.is_callback(),
            label,
        };
        state.appended += 1;
        state.queue.push_back(TaskHolder::new(info, kind, timeout));
    }

    pub(crate) fn set_after_done(&self, callback: DoneCallback) {
        self.state.lock().after_done = Some(callback);
    }

    fn sample_context(&self) -> ExecutionContext {
        ExecutionContext::from_main_flag(self.host.is_main_thread())
    }

    fn start(self: &Arc<Self>, done: Option<DoneCallback>, error_handler: Option<ErrorHandler>) {
        {
            let mut state = self.state.lock();
            state.done = done;
            state.error_handler = error_handler;
        }
        match self.group {
            Some(ref group) => group.submit(Arc::clone(self)),
            None => self.run(),
        }
    }

    /// Record the caller's context and start draining the queue.
    pub(crate) fn run(self: &Arc<Self>) {
        let context = self.sample_context();
        let steps = {
            let mut state = self.state.lock();
            state.context = context;
            state.queue.len()
        };
        tracing::debug!(chain = %self.id, %context, steps, "Executing task chain");
        self.next_task();
    }

    /// Take the next step and run it here or hop to where it must run.
    ///
    /// Loops while steps complete synchronously on the same context.
    fn next_task(self: &Arc<Self>) {
        loop {
            let (holder, input, current) = {
                let mut state = self.state.lock();
                if state.outcome.is_some() {
                    return;
                }
                let next = state.queue.pop_front();
                match next {
                    Some(holder) => {
                        state.action_index = holder.info.index;
                        let input = state.previous.take().unwrap_or_else(unit_value);
                        (holder, input, state.context)
                    }
                    None => {
                        drop(state);
                        self.finish(ChainOutcome::Completed);
                        return;
                    }
                }
            };

            let target = holder.info.affinity.resolve(current);
            if target != current {
                self.hop(target, holder, input);
                return;
            }

            let info = holder.info.clone();
            match holder.run(self, input) {
                Some(signal) => {
                    if !self.record(signal, &info) {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    fn hop(self: &Arc<Self>, target: ExecutionContext, holder: TaskHolder, input: Value) {
        tracing::debug!(chain = %self.id, step = %holder.info, to = %target, "Switching context");

        let chain = Arc::clone(self);
        let job: Job = Box::new(move || {
            chain.state.lock().context = target;
            let info = holder.info.clone();
            if let Some(signal) = holder.run(&chain, input) {
                if chain.record(signal, &info) {
                    chain.next_task();
                }
            }
        });

        match target {
            ExecutionContext::Main => self.host.post_to_main(job),
            ExecutionContext::Background => self.host.post_to_background(job),
        }
    }

    /// Continue the chain from a continuation that fired outside the drive loop.
    pub(crate) fn resume(self: &Arc<Self>, signal: Signal, step: &StepInfo) {
        if self.record(signal, step) {
            self.next_task();
        }
    }

    /// Apply a step's signal. Returns whether the chain should advance.
    fn record(&self, signal: Signal, step: &StepInfo) -> bool {
        match signal {
            Signal::Complete(value) => {
                // The continuation may have fired on any thread.
                let context = self.sample_context();
                let mut state = self.state.lock();
                if state.outcome.is_some() {
                    return false;
                }
                state.previous = Some(value);
                state.context = context;
                true
            }
            Signal::Abort => {
                tracing::debug!(chain = %self.id, %step, "Task chain aborted by step");
                self.finish(ChainOutcome::Aborted);
                false
            }
            Signal::Fault(error) => {
                self.fail(error, step);
                false
            }
        }
    }

    fn fail(&self, error: anyhow::Error, step: &StepInfo) {
        let handler = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.error_handler.take()
        };

        match handler {
            Some(handler) => self.guarded("error handler", || handler(error, step)),
            None => self.host.log_error(
                &error,
                &format!("Task chain {} failed at step {}", self.id, step),
            ),
        }

        self.finish(ChainOutcome::Failed);
    }

    /// A step faulted after its continuation had already completed it. The
    /// chain keeps going on the completed value; the fault is still reported.
    pub(crate) fn report_late_fault(&self, error: anyhow::Error, step: &StepInfo) {
        tracing::warn!(chain = %self.id, %step, "Step faulted after completing");

        let handler = self.state.lock().error_handler.take();
        match handler {
            Some(handler) => self.guarded("error handler", || handler(error, step)),
            None => self.host.log_error(
                &error,
                &format!("Task chain {} step {} faulted after completing", self.id, step),
            ),
        }
    }

    fn finish(&self, outcome: ChainOutcome) {
        let (done, after_done, queue, previous, data) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome);
            (
                state.done.take(),
                state.after_done.take(),
                mem::take(&mut state.queue),
                state.previous.take(),
                mem::take(&mut state.data),
            )
        };
        let skipped = queue.len();
        drop((queue, previous, data));

        tracing::debug!(chain = %self.id, %outcome, skipped, "Task chain finished");

        if let Some(done) = done {
            self.guarded("done callback", || done(outcome));
        }
        if let Some(after_done) = after_done {
            after_done(outcome);
        }
    }

    fn guarded<F: FnOnce()>(&self, what: &str, f: F) {
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            tracing::error!(chain = %self.id, "Task chain {} panicked", what);
        }
    }
}

// ---------------------------------------------------------------------------
// TaskChain builder
// ---------------------------------------------------------------------------

/// A chain under construction whose last step produces a `T`.
///
/// Appending a step consumes the builder and returns it retyped to the new
/// step's output. `execute` hands the chain to its host; it never blocks and
/// never returns an error, since all outcomes go to the callbacks.
pub struct TaskChain<T> {
    inner: Arc<ChainInner>,
    _marker: PhantomData<fn() -> T>,
}

impl TaskChain<()> {
    /// An empty chain on `host` without a callback timeout.
    pub fn new(host: Arc<dyn GameInterface>) -> Self {
        Self::from_parts(host, None, None)
    }

    pub(crate) fn from_parts(
        host: Arc<dyn GameInterface>,
        group: Option<Arc<SharedTaskChain>>,
        callback_timeout: Option<u64>,
    ) -> Self {
        Self {
            inner: ChainInner::new(host, group, callback_timeout),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> TaskChain<T> {
    fn retype<R>(self) -> TaskChain<R> {
        TaskChain {
            inner: self.inner,
            _marker: PhantomData,
        }
    }

    /// Unique id of the chain, as shown in logs.
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    /// Number of steps appended so far.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a step of any shape with the given affinity.
    pub fn append<R: Send + 'static>(self, affinity: Affinity, step: Step<T, R>) -> TaskChain<R> {
        self.inner.push(affinity, step.into_parts());
        self.retype()
    }

    /// Label the most recently appended step.
    pub fn label(self, label: impl Into<String>) -> Self {
        if let Some(holder) = self.inner.state.lock().queue.back_mut() {
            holder.info.label = Some(label.into());
        }
        self
    }

    /// Fail any callback step that has not completed within `ticks`.
    pub fn callback_timeout(self, ticks: u64) -> Self {
        self.inner.state.lock().callback_timeout = Some(ticks);
        self
    }

    // -----------------------------------------------------------------------
    // Plain steps
    // -----------------------------------------------------------------------

    pub fn main<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle) -> StepResult<R> + Send + 'static,
    {
        self.append(Affinity::Main, Step::plain(body))
    }

    pub fn background<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle) -> StepResult<R> + Send + 'static,
    {
        self.append(Affinity::Background, Step::plain(body))
    }

    pub fn current<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle) -> StepResult<R> + Send + 'static,
    {
        self.append(Affinity::Inherit, Step::plain(body))
    }

    // -----------------------------------------------------------------------
    // First steps
    // -----------------------------------------------------------------------

    pub fn main_first<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(&ChainHandle) -> StepResult<R> + Send + 'static,
    {
        self.append(Affinity::Main, Step::first(body))
    }

    pub fn background_first<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(&ChainHandle) -> StepResult<R> + Send + 'static,
    {
        self.append(Affinity::Background, Step::first(body))
    }

    pub fn current_first<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(&ChainHandle) -> StepResult<R> + Send + 'static,
    {
        self.append(Affinity::Inherit, Step::first(body))
    }

    // -----------------------------------------------------------------------
    // Last steps
    // -----------------------------------------------------------------------

    pub fn main_last<F>(self, body: F) -> TaskChain<()>
    where
        F: FnOnce(T, &ChainHandle) -> StepResult<()> + Send + 'static,
    {
        self.append(Affinity::Main, Step::last(body))
    }

    pub fn background_last<F>(self, body: F) -> TaskChain<()>
    where
        F: FnOnce(T, &ChainHandle) -> StepResult<()> + Send + 'static,
    {
        self.append(Affinity::Background, Step::last(body))
    }

    pub fn current_last<F>(self, body: F) -> TaskChain<()>
    where
        F: FnOnce(T, &ChainHandle) -> StepResult<()> + Send + 'static,
    {
        self.append(Affinity::Inherit, Step::last(body))
    }

    // -----------------------------------------------------------------------
    // Callback steps
    // -----------------------------------------------------------------------

    pub fn main_callback<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle, Next<R>) -> StepResult<()> + Send + 'static,
    {
        self.append(Affinity::Main, Step::plain_callback(body))
    }

    pub fn background_callback<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle, Next<R>) -> StepResult<()> + Send + 'static,
    {
        self.append(Affinity::Background, Step::plain_callback(body))
    }

    pub fn current_callback<R, F>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle, Next<R>) -> StepResult<()> + Send + 'static,
    {
        self.append(Affinity::Inherit, Step::plain_callback(body))
    }

    // -----------------------------------------------------------------------
    // Future steps
    // -----------------------------------------------------------------------

    pub fn main_future<R, F, Fut>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle) -> Fut + Send + 'static,
        Fut: Future<Output = StepResult<R>> + Send + 'static,
    {
        self.append(Affinity::Main, Step::future(body))
    }

    pub fn background_future<R, F, Fut>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle) -> Fut + Send + 'static,
        Fut: Future<Output = StepResult<R>> + Send + 'static,
    {
        self.append(Affinity::Background, Step::future(body))
    }

    pub fn current_future<R, F, Fut>(self, body: F) -> TaskChain<R>
    where
        R: Send + 'static,
        F: FnOnce(T, &ChainHandle) -> Fut + Send + 'static,
        Fut: Future<Output = StepResult<R>> + Send + 'static,
    {
        self.append(Affinity::Inherit, Step::future(body))
    }

    // -----------------------------------------------------------------------
    // Built-in steps
    // -----------------------------------------------------------------------

    /// Pause for `ticks` host ticks, then continue on the context the chain
    /// was on when the pause began.
    pub fn delay(self, ticks: u64) -> TaskChain<T> {
        let step = Step::plain_callback(move |input: T, chain: &ChainHandle, next: Next<T>| {
            let host = Arc::clone(chain.host());
            let resume_on_background = !host.is_main_thread();
            chain.host().post_to_main_delayed(
                Box::new(move || {
                    if resume_on_background {
                        host.post_to_background(Box::new(move || {
                            let _ = next.complete(input);
                        }));
                    } else {
                        let _ = next.complete(input);
                    }
                }),
                ticks,
            );
            Ok(())
        });
        self.append(Affinity::Inherit, step.named("delay").without_timeout())
    }

    /// [`TaskChain::delay`] for a wall-clock duration, converted by the host.
    pub fn delay_for(self, duration: Duration) -> TaskChain<T> {
        let ticks = self.inner.host().ticks_for(duration);
        self.delay(ticks)
    }

    /// Abort the chain when `predicate` holds for the current value.
    pub fn abort_if<F>(self, predicate: F) -> TaskChain<T>
    where
        F: FnOnce(&T) -> bool + Send + 'static,
    {
        self.current(move |value, _| {
            if predicate(&value) {
                Err(StepError::Abort)
            } else {
                Ok(value)
            }
        })
    }

    /// Copy the current value into task data under `key` and pass it on.
    pub fn store_as_data(self, key: impl Into<String>) -> TaskChain<T>
    where
        T: Clone,
    {
        let key = key.into();
        self.current(move |value: T, chain| {
            chain.set_data(key, value.clone());
            Ok(value)
        })
    }

    /// Replace the current value with the task data stored under `key`.
    pub fn return_data<V>(self, key: impl Into<String>) -> TaskChain<Option<V>>
    where
        V: Any + Clone + Send,
    {
        let key = key.into();
        self.current(move |_value: T, chain| Ok(chain.data::<V>(&key)))
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run the chain. Faults are logged through the host.
    pub fn execute(self) {
        self.inner.start(None, None);
    }

    /// Run the chain and call `done` once it stops.
    pub fn execute_with_done<D>(self, done: D)
    where
        D: FnOnce(ChainOutcome) + Send + 'static,
    {
        self.inner.start(Some(Box::new(done)), None);
    }

    /// Run the chain, sending a step fault to `handler` instead of the host log.
    pub fn execute_with_error_handler<E>(self, handler: E)
    where
        E: FnOnce(anyhow::Error, &StepInfo) + Send + 'static,
    {
        self.inner.start(None, Some(Box::new(handler)));
    }

    /// Run the chain with both a done callback and an error handler.
    pub fn execute_with<D, E>(self, done: D, handler: E)
    where
        D: FnOnce(ChainOutcome) + Send + 'static,
        E: FnOnce(anyhow::Error, &StepInfo) + Send + 'static,
    {
        self.inner.start(Some(Box::new(done)), Some(Box::new(handler)));
    }
}

impl<V: Send + 'static> TaskChain<Option<V>> {
    /// Abort when the current value is `None`, otherwise unwrap it.
    pub fn abort_if_none(self) -> TaskChain<V> {
        self.current(|value, _| value.ok_or(StepError::Abort))
    }
}

impl<T> fmt::Debug for TaskChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskChain")
            .field("id", &self.inner.id)
            .field("steps", &self.inner.state.lock().queue.len())
            .finish()
    }
}
