// SharedTaskChain: a named group whose member chains run strictly one at a time,
// in the order they were executed.

use crate::affinity::Affinity;
use crate::chain::{ChainInner, TaskChain};
use crate::host::GameInterface;
use crate::step::{Next, Step};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct SharedState {
    waiting: VecDeque<Arc<ChainInner>>,
    running: bool,
    /// Some thread is inside the `advance` loop.
    advancing: bool,
    /// The member started by that loop has already stopped.
    released: bool,
}

/// Serializes the chains created from it.
///
/// A member starts only after the previous member has stopped, whether it
/// completed, aborted or failed. Unrelated chains are unaffected.
pub struct SharedTaskChain {
    name: String,
    host: Arc<dyn GameInterface>,
    callback_timeout: Option<u64>,
    state: Mutex<SharedState>,
}

impl SharedTaskChain {
    pub fn new(name: impl Into<String>, host: Arc<dyn GameInterface>) -> Arc<Self> {
        Self::with_timeout(name, host, None)
    }

    pub(crate) fn with_timeout(
        name: impl Into<String>,
        host: Arc<dyn GameInterface>,
        callback_timeout: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            host,
            callback_timeout,
            state: Mutex::new(SharedState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start building a chain that belongs to this group.
    pub fn new_chain(self: &Arc<Self>) -> TaskChain<()> {
        TaskChain::from_parts(
            Arc::clone(&self.host),
            Some(Arc::clone(self)),
            self.callback_timeout,
        )
    }

    /// Members executed but not yet started.
    pub fn pending(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Whether a member is currently running.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Queue an executed member; start it now if the group is idle.
    pub(crate) fn submit(self: &Arc<Self>, member: Arc<ChainInner>) {
        {
            let mut state = self.state.lock();
            state.waiting.push_back(member);
            if state.running {
                tracing::debug!(
                    group = %self.name,
                    waiting = state.waiting.len(),
                    "Shared chain busy, queued member"
                );
                return;
            }
            state.running = true;
        }
        self.advance();
    }

    /// Start members until one is still running when `drive` returns.
    ///
    /// A member that stops inline calls back into `advance` while this loop
    /// is on the stack; that call only flags the release and the loop starts
    /// the next member, so the stack does not grow with the queue.
    fn advance(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.advancing {
                state.released = true;
                return;
            }
            state.advancing = true;
        }

        loop {
            let member = {
                let mut state = self.state.lock();
                match state.waiting.pop_front() {
                    Some(member) => member,
                    None => {
                        state.running = false;
                        state.advancing = false;
                        return;
                    }
                }
            };

            self.drive(member);

            let mut state = self.state.lock();
            if state.released {
                state.released = false;
            } else {
                state.advancing = false;
                return;
            }
        }
    }

    /// Run `member` inside a one-step backing chain that completes when the
    /// member stops, then move on to the next member.
    fn drive(self: &Arc<Self>, member: Arc<ChainInner>) {
        tracing::debug!(group = %self.name, chain = %member.id(), "Starting shared chain member");

        let group = Arc::clone(self);
        let step = Step::generic_callback(move |_, next: Next<()>| {
            member.set_after_done(Box::new(move |_| {
                let _ = next.complete(());
            }));
            member.run();
            Ok(())
        });

        TaskChain::new(Arc::clone(&self.host))
            .append(
                Affinity::Inherit,
                step.without_timeout().named(format!("shared '{}'", self.name)),
            )
            .execute_with_done(move |_| group.advance());
    }
}

impl fmt::Debug for SharedTaskChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedTaskChain")
            .field("name", &self.name)
            .field("running", &state.running)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}
