//! A single timer thread driving periodic callbacks (heartbeats, expiry
//! checks). Callbacks run on the timer thread and must not block on other
//! transports; everything that could is pushed through a conveyor instead.

use ion::logging::{self, Logger};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    id: u64,
    deadline: Instant,
    period: Duration,
    callback: Callback,
}

struct State {
    entries: Vec<Entry>,
    next_id: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

pub struct Timer {
    inner: Arc<Inner>,
    worker: Option<thread::JoinHandle<()>>,
}

/// Cancels its entry when asked to; dropping the handle leaves the
/// schedule alone.
pub struct TimerHandle {
    id: u64,
    inner: Weak<Inner>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.state.lock().unwrap();
            state.entries.retain(|entry| entry.id != self.id);
            inner.cond.notify_one();
        }
    }
}

impl Timer {
    pub fn new(name: &str, log: &Logger) -> Timer {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                entries: Vec::new(),
                next_id: 1,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let worker_inner = inner.clone();
        let worker_log = log.new(logging::o!("thread" => name.to_owned()));
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || Timer::run(worker_inner, worker_log))
            .expect("failed to spawn timer thread");

        Timer {
            inner,
            worker: Some(worker),
        }
    }

    /// First fires after `delay`, then every `period`.
    pub fn schedule_periodic(&self, delay: Duration, period: Duration, callback: Callback) -> TimerHandle {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Entry {
            id,
            deadline: Instant::now() + delay,
            period,
            callback,
        });
        self.inner.cond.notify_one();
        TimerHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn run(inner: Arc<Inner>, log: Logger) {
        let mut state = inner.state.lock().unwrap();
        loop {
            if state.shutdown {
                break;
            }

            let now = Instant::now();
            let due = state
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.deadline)
                .map(|(index, entry)| (index, entry.deadline));

            match due {
                None => {
                    state = inner.cond.wait(state).unwrap();
                }
                Some((_, deadline)) if deadline > now => {
                    let (next, _) = inner.cond.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                }
                Some((index, _)) => {
                    let callback = state.entries[index].callback.clone();
                    let deadline = state.entries[index].deadline + state.entries[index].period;
                    state.entries[index].deadline = deadline.max(now);
                    drop(state);
                    callback();
                    state = inner.state.lock().unwrap();
                }
            }
        }
        logging::trace!(log, "timer thread exiting");
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            state.entries.clear();
            self.inner.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
