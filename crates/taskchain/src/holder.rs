// TaskHolder: runs exactly one step exactly once and reports its outcome to the chain.
//
// Every step, synchronous or callback-style, reports through a `Completion`.
// The completion enforces the single-result contract, and when the result
// arrives on the dispatching thread before the body returns it is parked and
// handed back to the chain's drive loop instead of recursing.

use crate::chain::ChainInner;
use crate::error::{ChainError, StepError, StepResult};
use crate::handle::{ChainHandle, StepScope};
use crate::step::{StepInfo, StepKind, StepTimeout, Value};

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// What a step reported.
pub(crate) enum Signal {
    Complete(Value),
    Abort,
    Fault(anyhow::Error),
}

impl Signal {
    pub(crate) fn from_result(result: StepResult<Value>) -> Self {
        match result {
            Ok(value) => Signal::Complete(value),
            Err(error) => Signal::from_error(error),
        }
    }

    pub(crate) fn from_error(error: StepError) -> Self {
        match error {
            StepError::Abort => Signal::Abort,
            StepError::Fault(error) => Signal::Fault(error),
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DispatchSlot {
    /// Thread currently inside the step body, if any.
    dispatching: Option<ThreadId>,
    /// Signal delivered on that thread while the body was still running.
    parked: Option<Signal>,
}

/// Handed to the delayed watchdog job. Emptied when the step settles, so a
/// pending watchdog does not keep a finished chain alive.
type WatchdogSlot = Arc<Mutex<Option<Arc<Completion>>>>;

/// Single-use result slot shared by a running step and its continuation(s).
pub(crate) struct Completion {
    chain: Arc<ChainInner>,
    step: StepInfo,
    executed: AtomicBool,
    aborted: AtomicBool,
    slot: Mutex<DispatchSlot>,
    watchdog: Mutex<Option<WatchdogSlot>>,
}

impl Completion {
    fn new(chain: Arc<ChainInner>, step: StepInfo) -> Self {
        Self {
            chain,
            step,
            executed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            slot: Mutex::new(DispatchSlot::default()),
            watchdog: Mutex::new(None),
        }
    }

    pub(crate) fn step(&self) -> &StepInfo {
        &self.step
    }

    pub(crate) fn chain_handle(&self) -> ChainHandle {
        ChainHandle::new(Arc::clone(&self.chain))
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.executed.load(Ordering::Acquire)
    }

    /// Accept the first signal; reject or ignore every later one.
    pub(crate) fn deliver(&self, signal: Signal) -> Result<(), ChainError> {
        if self.executed.swap(true, Ordering::AcqRel) {
            return self.reject();
        }
        self.accept(signal);
        Ok(())
    }

    /// The step body itself returned an error or panicked.
    ///
    /// If the continuation already settled the step, this is not a second
    /// result: the fault is reported on its own and the chain keeps the
    /// result it was given.
    pub(crate) fn body_failed(&self, error: StepError) {
        if !self.executed.swap(true, Ordering::AcqRel) {
            self.accept(Signal::from_error(error));
            return;
        }
        match error {
            StepError::Abort => tracing::warn!(
                chain = %self.chain.id(),
                step = %self.step,
                "Ignoring abort from a step that already completed"
            ),
            StepError::Fault(error) => self.chain.report_late_fault(error, &self.step),
        }
    }

    fn accept(&self, signal: Signal) {
        if signal.is_terminal() {
            self.aborted.store(true, Ordering::Release);
        }
        self.disarm_watchdog();
        self.dispatch(signal);
    }

    fn reject(&self) -> Result<(), ChainError> {
        if self.aborted.load(Ordering::Acquire) || self.chain.is_aborted() {
            tracing::warn!(
                chain = %self.chain.id(),
                step = %self.step,
                "Ignoring continuation for a step whose chain already stopped"
            );
            return Ok(());
        }

        let error = ChainError::ReentrancyViolation {
            step: self.step.clone(),
        };
        tracing::error!(chain = %self.chain.id(), step = %self.step, "{}", error);
        Err(error)
    }

    fn dispatch(&self, signal: Signal) {
        {
            let mut slot = self.slot.lock();
            if slot.dispatching == Some(thread::current().id()) {
                slot.parked = Some(signal);
                return;
            }
        }
        self.chain.resume(signal, &self.step);
    }

    fn begin_dispatch(&self) {
        self.slot.lock().dispatching = Some(thread::current().id());
    }

    fn end_dispatch(&self) -> Option<Signal> {
        let mut slot = self.slot.lock();
        slot.dispatching = None;
        slot.parked.take()
    }

    fn arm_watchdog(completion: &Arc<Completion>, ticks: u64) {
        let slot: WatchdogSlot = Arc::new(Mutex::new(Some(Arc::clone(completion))));
        *completion.watchdog.lock() = Some(Arc::clone(&slot));

        let job = Box::new(move || {
            let armed = slot.lock().take();
            if let Some(completion) = armed {
                completion.expire(ticks);
            }
        });
        completion.chain.host().post_to_main_delayed(job, ticks);
    }

    fn disarm_watchdog(&self) {
        let slot = self.watchdog.lock().take();
        if let Some(slot) = slot {
            let armed = slot.lock().take();
            drop(armed);
        }
    }

    fn expire(&self, ticks: u64) {
        self.watchdog.lock().take();
        if self.executed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.aborted.store(true, Ordering::Release);

        tracing::warn!(
            chain = %self.chain.id(),
            step = %self.step,
            "Callback step timed out after {} ticks",
            ticks
        );
        let error = ChainError::StepTimedOut {
            step: self.step.clone(),
            ticks,
        };
        self.dispatch(Signal::Fault(error.into()));
    }
}

// ---------------------------------------------------------------------------
// TaskHolder
// ---------------------------------------------------------------------------

/// A queued step together with its declared affinity and identity.
pub(crate) struct TaskHolder {
    pub(crate) info: StepInfo,
    kind: StepKind,
    timeout: StepTimeout,
}

impl TaskHolder {
    pub(crate) fn new(info: StepInfo, kind: StepKind, timeout: StepTimeout) -> Self {
        Self {
            info,
            kind,
            timeout,
        }
    }

    /// Run the step on the calling thread.
    ///
    /// Returns the step's signal if it arrived before the body returned; the
    /// caller then continues the chain. `None` means the continuation will
    /// resume the chain itself later.
    pub(crate) fn run(self, chain: &Arc<ChainInner>, input: Value) -> Option<Signal> {
        let TaskHolder {
            info,
            kind,
            timeout,
        } = self;

        let completion = Arc::new(Completion::new(Arc::clone(chain), info.clone()));
        completion.begin_dispatch();

        if kind.is_callback() {
            if let Some(ticks) = chain.resolve_timeout(timeout) {
                Completion::arm_watchdog(&completion, ticks);
            }
        }

        tracing::debug!(chain = %chain.id(), step = %info, "Running step");

        let handle = ChainHandle::new(Arc::clone(chain));
        let outcome = {
            let _scope = StepScope::enter(handle.clone());
            panic::catch_unwind(AssertUnwindSafe(|| kind.run(input, &handle, &completion)))
        };

        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            let error = anyhow::anyhow!("step {} panicked: {}", info, message);
            completion.body_failed(StepError::Fault(error));
        }

        completion.end_dispatch()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_terminal_signals() {
        assert!(Signal::Abort.is_terminal());
        assert!(Signal::Fault(anyhow::anyhow!("x")).is_terminal());
        assert!(!Signal::Complete(Box::new(1)).is_terminal());
    }
}
