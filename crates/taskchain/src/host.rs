// GameInterface: the work-submission capabilities the engine consumes from its host.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// A unit of work submitted to an execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A future handed to the host to drive to completion.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Milliseconds per tick assumed by the provided `ticks_for`.
pub const MILLIS_PER_TICK: u64 = 50;

/// The host platform a chain runs against.
///
/// There is exactly one main thread. Background jobs may run on any number
/// of other threads. Implementations must never run a job inline from within
/// `post_*`: the engine relies on submission returning before the job starts.
pub trait GameInterface: Send + Sync + 'static {
    /// Whether the calling thread is the main thread.
    fn is_main_thread(&self) -> bool;

    /// Run `job` on the main thread as soon as possible.
    fn post_to_main(&self, job: Job);

    /// Run `job` on the main thread after `ticks` host ticks.
    fn post_to_main_delayed(&self, job: Job, ticks: u64);

    /// Run `job` on a background worker.
    fn post_to_background(&self, job: Job);

    /// Drive `future` to completion somewhere off the main thread.
    fn spawn_future(&self, future: BoxFuture) {
        self.post_to_background(Box::new(move || futures::executor::block_on(future)));
    }

    /// Default sink for step faults when a chain has no error handler.
    fn log_error(&self, error: &anyhow::Error, context: &str) {
        tracing::error!("{}: {:?}", context, error);
    }

    /// Convert a wall-clock duration to host ticks, rounding up.
    fn ticks_for(&self, duration: Duration) -> u64 {
        let millis = duration.as_millis() as u64;
        (millis + MILLIS_PER_TICK - 1) / MILLIS_PER_TICK
    }
}
