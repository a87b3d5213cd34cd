// taskchain-host: a reference host for task chains. One tick-driven main
// thread plus a tokio runtime for background work.

pub mod host_context;
pub mod logging;
pub mod main_thread;

pub use host_context::ThreadedHost;
pub use logging::init_tracing;
pub use main_thread::MainThread;
