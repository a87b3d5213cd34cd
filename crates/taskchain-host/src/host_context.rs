// ThreadedHost: a GameInterface backed by a real main thread and a tokio
// runtime for background jobs and futures.

use crate::main_thread::MainThread;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use taskchain::{BoxFuture, ChainSettings, GameInterface, Job};
use tokio::runtime::{Handle, Runtime};

/// How long `shutdown` waits for background work to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A host with one tick-driven main thread and a pool of background workers.
///
/// Build with [`ThreadedHost::start`] and hand it to a `TaskChainFactory`.
/// Call [`ThreadedHost::shutdown`] from outside the host's threads.
pub struct ThreadedHost {
    main: MainThread,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    settings: ChainSettings,
}

impl ThreadedHost {
    pub fn start(settings: ChainSettings) -> Result<Arc<Self>> {
        settings.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(settings.background_workers)
            .max_blocking_threads(settings.background_workers)
            .thread_name("taskchain-worker")
            .enable_all()
            .build()
            .context("Failed to build the background runtime")?;
        let handle = runtime.handle().clone();

        let main = MainThread::spawn(Duration::from_millis(settings.tick_millis))?;

        tracing::info!(
            tick_millis = settings.tick_millis,
            workers = settings.background_workers,
            "Threaded host started"
        );

        Ok(Arc::new(Self {
            main,
            runtime: Mutex::new(Some(runtime)),
            handle,
            settings,
        }))
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Ticks elapsed on the main thread.
    pub fn current_tick(&self) -> u64 {
        self.main.current_tick()
    }

    /// Stop the tick loop and the background runtime. Idempotent.
    pub fn shutdown(&self) {
        self.main.stop();
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            tracing::info!("Threaded host stopped");
        }
    }
}

impl GameInterface for ThreadedHost {
    fn is_main_thread(&self) -> bool {
        self.main.is_current()
    }

    fn post_to_main(&self, job: Job) {
        self.main.post(job);
    }

    fn post_to_main_delayed(&self, job: Job, ticks: u64) {
        self.main.post_delayed(job, ticks);
    }

    fn post_to_background(&self, job: Job) {
        drop(self.handle.spawn_blocking(job));
    }

    fn spawn_future(&self, future: BoxFuture) {
        drop(self.handle.spawn(future));
    }

    fn ticks_for(&self, duration: Duration) -> u64 {
        let millis = duration.as_millis() as u64;
        let tick = self.settings.tick_millis;
        (millis + tick - 1) / tick
    }
}
