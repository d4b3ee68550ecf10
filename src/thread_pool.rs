use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

type Job = Box<dyn FnOnce() + Send>;

struct State {
    queue: VecDeque<Job>,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

/// Fixed-size pool of worker threads for blocking work.
///
/// Reactor callbacks must not stall their loop; anything that would (disk
/// I/O, heavyweight computation) is pushed here via [`enqueue`]. Jobs run in
/// FIFO order across the pool. After [`stop`], `enqueue` fails explicitly
/// instead of silently dropping work; jobs already queued at stop time are
/// drained by the workers before they exit.
///
/// [`enqueue`]: ThreadPool::enqueue
/// [`stop`]: ThreadPool::stop
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `threads` workers named `{name}-{index}`.
    pub fn new(threads: usize, name: &str) -> io::Result<ThreadPool> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                running: true,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_main(&shared))?;
            workers.push(worker);
        }

        debug!("thread pool started with {} workers", workers.len());
        Ok(ThreadPool { shared, workers })
    }

    /// Submits a job. Fails with an error once the pool has been stopped.
    pub fn enqueue<F>(&self, job: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        if !state.running {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "job submitted to a stopped thread pool",
            ));
        }
        state.queue.push_back(Box::new(job));
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Stops accepting jobs, drains the queue and joins every worker.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                // Drain before honouring shutdown so accepted jobs always run.
                if let Some(job) = state.queue.pop_front() {
                    break Some(job);
                }
                if !state.running {
                    break None;
                }
                state = shared.available.wait(state).unwrap();
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    #[test]
    fn jobs_run() {
        let pool = ThreadPool::new(2, "test-pool").unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.enqueue(move || tx.send(i).unwrap()).unwrap();
        }
        let mut got: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn queued_jobs_drain_on_stop() {
        let mut pool = ThreadPool::new(1, "drain-pool").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn enqueue_after_stop_fails() {
        let mut pool = ThreadPool::new(1, "stopped-pool").unwrap();
        pool.stop();
        assert!(pool.enqueue(|| {}).is_err());
    }
}
