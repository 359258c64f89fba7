//! A single worker thread draining a queue of notification closures.
//! Completion callbacks (connect, get-done, put-done, monitor-event) are
//! pushed here so requester code never runs on a transport worker, which
//! would deadlock the moment a callback re-enters the transport.

use ion::logging::{self, Logger};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Task = Box<dyn FnOnce() + Send>;

struct State {
    queue: VecDeque<Task>,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

pub struct Conveyor {
    inner: Arc<Inner>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Conveyor {
    pub fn new(name: &str, log: &Logger) -> Conveyor {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let worker_inner = inner.clone();
        let worker_log = log.new(logging::o!("thread" => name.to_owned()));
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || Conveyor::run(worker_inner, worker_log))
            .expect("failed to spawn conveyor thread");

        Conveyor {
            inner,
            worker: Some(worker),
        }
    }

    /// Enqueues a notification. Dropped silently after shutdown.
    pub fn push<F: FnOnce() + Send + 'static>(&self, task: F) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.queue.push_back(Box::new(task));
        self.inner.cond.notify_one();
    }

    fn run(inner: Arc<Inner>, log: Logger) {
        loop {
            let task = {
                let mut state = inner.state.lock().unwrap();
                loop {
                    if let Some(task) = state.queue.pop_front() {
                        break task;
                    }
                    if state.shutdown {
                        logging::trace!(log, "conveyor thread exiting");
                        return;
                    }
                    state = inner.cond.wait(state).unwrap();
                }
            };
            task();
        }
    }
}

impl Drop for Conveyor {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            self.inner.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_order() {
        let conveyor = Conveyor::new("test-conveyor", &ion::logging::discard());
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..10 {
            let order = order.clone();
            conveyor.push(move || order.lock().unwrap().push(index));
        }

        thread::sleep(Duration::from_millis(50));
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_pending_tasks() {
        let conveyor = Conveyor::new("test-conveyor", &ion::logging::discard());
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let hits = hits.clone();
            conveyor.push(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(conveyor);
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }
}
