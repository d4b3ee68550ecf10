use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use log::debug;

use crate::event_loop::{EventLoop, LoopHandle};

/// One [`EventLoop`] running on a dedicated thread.
///
/// The loop is constructed on the spawned thread (loops are pinned to their
/// creating thread); `spawn` blocks until the loop's handle is visible and
/// returns it to the caller.
///
/// [`EventLoop`]: crate::EventLoop
pub struct LoopThread {
    handle: Arc<LoopHandle>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    /// Spawns a named thread and runs a fresh loop on it.
    pub fn spawn(name: &str) -> io::Result<LoopThread> {
        let (tx, rx) = mpsc::channel::<io::Result<Arc<LoopHandle>>>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                let _ = tx.send(Ok(Arc::clone(lp.handle())));
                lp.run();
            })?;

        let handle = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "loop thread died during startup"))??;

        Ok(LoopThread {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    /// Quits the loop and joins the thread. Tasks queued before the quit run
    /// before the thread exits.
    pub fn stop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A pool of worker loops fed round-robin.
///
/// The base loop (typically the accept loop) is supplied by the caller; with
/// zero workers every [`next_loop`] call returns the base handle, collapsing
/// the server into single-reactor mode.
///
/// [`next_loop`]: LoopPool::next_loop
pub struct LoopPool {
    base: Arc<LoopHandle>,
    workers: Vec<LoopThread>,
    next: AtomicUsize,
}

impl LoopPool {
    /// Spawns `workers` loop threads named `{name_prefix}-{index}`.
    pub fn start(base: Arc<LoopHandle>, workers: usize, name_prefix: &str) -> io::Result<LoopPool> {
        let mut spawned = Vec::with_capacity(workers);
        for i in 0..workers {
            spawned.push(LoopThread::spawn(&format!("{}-{}", name_prefix, i))?);
        }
        debug!("loop pool started with {} workers", spawned.len());
        Ok(LoopPool {
            base,
            workers: spawned,
            next: AtomicUsize::new(0),
        })
    }

    /// Returns the next worker handle in strict round-robin order, or the
    /// base handle when the pool has no workers.
    pub fn next_loop(&self) -> Arc<LoopHandle> {
        if self.workers.is_empty() {
            return Arc::clone(&self.base);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(self.workers[i].handle())
    }

    pub fn base(&self) -> &Arc<LoopHandle> {
        &self.base
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Quits every worker loop and joins the threads.
    pub fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
    }
}
