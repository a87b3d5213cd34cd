// Deterministic single-threaded host for unit tests. Main, background and
// delayed jobs are all run by the test thread in `run_until_idle`.

use crate::host::{GameInterface, Job};

use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

thread_local! {
    static ON_MAIN: Cell<bool> = Cell::new(false);
}

struct Delayed {
    due: u64,
    seq: u64,
    job: Job,
}

pub(crate) struct TestHost {
    main: Mutex<VecDeque<Job>>,
    background: Mutex<VecDeque<Job>>,
    delayed: Mutex<Vec<Delayed>>,
    tick: AtomicU64,
    seq: AtomicU64,
    main_posts: AtomicUsize,
    background_posts: AtomicUsize,
    logged: Mutex<Vec<String>>,
}

impl TestHost {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            main: Mutex::new(VecDeque::new()),
            background: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(Vec::new()),
            tick: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            main_posts: AtomicUsize::new(0),
            background_posts: AtomicUsize::new(0),
            logged: Mutex::new(Vec::new()),
        })
    }

    /// Treat the calling thread as the main thread.
    pub(crate) fn enter_main(&self) {
        ON_MAIN.with(|flag| flag.set(true));
    }

    pub(crate) fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub(crate) fn main_posts(&self) -> usize {
        self.main_posts.load(Ordering::SeqCst)
    }

    pub(crate) fn background_posts(&self) -> usize {
        self.background_posts.load(Ordering::SeqCst)
    }

    pub(crate) fn logged(&self) -> Vec<String> {
        self.logged.lock().clone()
    }

    /// Run queued jobs, advancing the tick counter whenever only delayed
    /// jobs remain, until nothing is left.
    pub(crate) fn run_until_idle(&self) {
        loop {
            let job = self.main.lock().pop_front();
            if let Some(job) = job {
                run_as(true, job);
                continue;
            }

            let job = self.background.lock().pop_front();
            if let Some(job) = job {
                run_as(false, job);
                continue;
            }

            let due = {
                let mut delayed = self.delayed.lock();
                let Some(next_due) = delayed.iter().map(|d| d.due).min() else {
                    break;
                };
                let now = self.tick().max(next_due);
                self.tick.store(now, Ordering::SeqCst);

                let mut due: Vec<Delayed> = Vec::new();
                let mut index = 0;
                while index < delayed.len() {
                    if delayed[index].due <= now {
                        due.push(delayed.remove(index));
                    } else {
                        index += 1;
                    }
                }
                due.sort_by_key(|d| d.seq);
                due
            };

            let mut main = self.main.lock();
            for delayed in due {
                main.push_back(delayed.job);
            }
        }
    }
}

fn run_as(on_main: bool, job: Job) {
    let previous = ON_MAIN.with(|flag| flag.replace(on_main));
    job();
    ON_MAIN.with(|flag| flag.set(previous));
}

impl GameInterface for TestHost {
    fn is_main_thread(&self) -> bool {
        ON_MAIN.with(|flag| flag.get())
    }

    fn post_to_main(&self, job: Job) {
        self.main_posts.fetch_add(1, Ordering::SeqCst);
        self.main.lock().push_back(job);
    }

    fn post_to_main_delayed(&self, job: Job, ticks: u64) {
        let delayed = Delayed {
            due: self.tick() + ticks,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            job,
        };
        self.delayed.lock().push(delayed);
    }

    fn post_to_background(&self, job: Job) {
        self.background_posts.fetch_add(1, Ordering::SeqCst);
        self.background.lock().push_back(job);
    }

    fn log_error(&self, error: &anyhow::Error, context: &str) {
        self.logged.lock().push(format!("{}: {:#}", context, error));
    }
}

/// Shared, cloneable sink for values observed inside steps.
pub(crate) struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Recorder<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    pub(crate) fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }
}

impl<T: Clone> Recorder<T> {
    pub(crate) fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}
