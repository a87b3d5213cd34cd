// MainThread: the single thread that plays the game server's main tick loop.
// Immediate jobs run as they arrive; delayed jobs run once their tick comes up.

use taskchain::Job;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Name given to the main OS thread.
pub const MAIN_THREAD_NAME: &str = "taskchain-main";

enum Command {
    Run(Job),
    RunAfter { ticks: u64, job: Job },
    Stop,
}

/// Handle to the running tick loop.
pub struct MainThread {
    sender: Sender<Command>,
    thread_id: ThreadId,
    tick: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MainThread {
    /// Spawn the tick loop with ticks of `tick_length`.
    pub fn spawn(tick_length: Duration) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let tick = Arc::new(AtomicU64::new(0));
        let loop_tick = Arc::clone(&tick);

        let handle = thread::Builder::new()
            .name(MAIN_THREAD_NAME.to_string())
            .spawn(move || tick_loop(receiver, tick_length, loop_tick))
            .context("Failed to spawn the main thread")?;

        tracing::debug!("Main thread started with {:?} ticks", tick_length);

        Ok(Self {
            sender,
            thread_id: handle.thread().id(),
            tick,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether the caller is running on the main thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Ticks elapsed since the loop started.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub fn post(&self, job: Job) {
        self.send(Command::Run(job));
    }

    pub fn post_delayed(&self, job: Job, ticks: u64) {
        self.send(Command::RunAfter { ticks, job });
    }

    fn send(&self, command: Command) {
        if self.sender.send(command).is_err() {
            tracing::warn!("Main thread has stopped, dropping job");
        }
    }

    /// Stop the loop after the jobs already queued and wait for it to exit.
    /// Pending delayed jobs are dropped.
    pub fn stop(&self) {
        let _ = self.sender.send(Command::Stop);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if self.is_current() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Main thread exited with a panic");
            }
        }
    }
}

impl Drop for MainThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick_loop(receiver: Receiver<Command>, tick_length: Duration, tick: Arc<AtomicU64>) {
    let mut delayed: BTreeMap<(u64, u64), Job> = BTreeMap::new();
    let mut sequence: u64 = 0;
    let mut next_tick = Instant::now() + tick_length;

    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(wait) {
            Ok(Command::Run(job)) => run_job(job),
            Ok(Command::RunAfter { ticks, job }) => {
                let due = tick.load(Ordering::Acquire) + ticks;
                delayed.insert((due, sequence), job);
                sequence += 1;
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if Instant::now() < next_tick {
            continue;
        }
        next_tick += tick_length;
        let now = tick.fetch_add(1, Ordering::AcqRel) + 1;

        let later = delayed.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut delayed, later);
        for job in due.into_values() {
            run_job(job);
        }
    }

    if !delayed.is_empty() {
        tracing::debug!("Main thread stopping with {} delayed jobs pending", delayed.len());
    }
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("Job panicked on the main thread");
    }
}
