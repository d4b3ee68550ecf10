use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::event::Events;
use crate::handler::EventHandler;
use crate::poll::Poller;
use crate::timer::{TimerId, TimerWheel};
use crate::waker::Waker;
use crate::{Interest, Token};

const TOKEN_WAKER: Token = Token(0);
const TOKEN_TIMER: Token = Token(1);
const FIRST_USER_TOKEN: usize = 2;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const EVENTS_CAPACITY: usize = 64;

thread_local! {
    static HAS_LOOP: Cell<bool> = const { Cell::new(false) };
    // Published by `EventLoop::run` so cross-object code on the loop thread
    // (thread-safe sends taking the fast path) can reach the running loop.
    static CURRENT_LOOP: Cell<*const EventLoop> = const { Cell::new(ptr::null()) };
}

type Task = Box<dyn FnOnce(&EventLoop) + Send>;

/// Single threaded I/O event loop.
///
/// An `EventLoop` owns a [`Poller`], a timer wheel and the handlers of every
/// channel registered with it. One loop exists per thread at most, and a loop
/// only ever runs on the thread that created it; all channel and timer
/// mutation is restricted to that thread, enforced by
/// [`assert_in_loop_thread`].
///
/// Other threads interact with a loop exclusively through its [`LoopHandle`],
/// which posts closures into the loop's task queue and wakes the poller via
/// an eventfd, so a cross-thread submission never waits out the poll timeout.
///
/// The main cycle polls for readiness (at most 10 s), dispatches every ready
/// channel to its [`EventHandler`], then drains the pending task queue once.
///
/// [`assert_in_loop_thread`]: EventLoop::assert_in_loop_thread
/// [`Poller`]: crate::Poller
/// [`EventHandler`]: crate::EventHandler
pub struct EventLoop {
    handle: Arc<LoopHandle>,
    poller: Poller,
    events: RefCell<Events>,
    handlers: RefCell<HashMap<Token, Arc<dyn EventHandler>>>,
    timers: RefCell<TimerWheel>,
    waker: Arc<Waker>,
    next_token: Cell<usize>,
    // Loops are pinned to the thread that created them.
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Creates an event loop owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already constructed an `EventLoop` that
    /// is still alive. One loop per thread is a structural invariant, not a
    /// recoverable error.
    pub fn new() -> io::Result<EventLoop> {
        if HAS_LOOP.with(|has| has.get()) {
            panic!(
                "another EventLoop already exists on thread {:?}",
                thread::current().id()
            );
        }

        let poller = Poller::new()?;
        let waker = Arc::new(Waker::new(&poller, TOKEN_WAKER)?);
        let timers = TimerWheel::new()?;
        poller.register(timers.as_raw_fd(), TOKEN_TIMER, Interest::READABLE)?;

        HAS_LOOP.with(|has| has.set(true));

        let handle = Arc::new(LoopHandle {
            thread: thread::current().id(),
            tasks: Mutex::new(Vec::new()),
            waker: Arc::clone(&waker),
            quit: AtomicBool::new(false),
        });

        Ok(EventLoop {
            handle,
            poller,
            events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
            handlers: RefCell::new(HashMap::new()),
            timers: RefCell::new(timers),
            waker,
            next_token: Cell::new(FIRST_USER_TOKEN),
            _not_send: PhantomData,
        })
    }

    /// Returns the cross-thread handle for this loop.
    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    /// Runs the loop until [`LoopHandle::quit`] is called. Tasks still queued
    /// when the quit flag is observed run before this returns.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        let _current = CurrentGuard::set(self);
        debug!("event loop started on {:?}", thread::current().id());

        while !self.handle.quit.load(Ordering::Acquire) {
            {
                let mut events = self.events.borrow_mut();
                if let Err(err) = self.poller.poll(&mut events, Some(POLL_TIMEOUT)) {
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("poll failed: {}", err);
                    continue;
                }
                trace!("{} events ready", events.len());

                for event in events.iter() {
                    match event.token() {
                        TOKEN_WAKER => {
                            if let Err(err) = self.waker.ack() {
                                warn!("failed to ack wakeup: {}", err);
                            }
                        }
                        TOKEN_TIMER => self.process_timers(),
                        token => {
                            // Clone out of the map so a handler may remove
                            // itself; the clone also keeps it alive through
                            // its own teardown callback.
                            let handler = self.handlers.borrow().get(&token).cloned();
                            match handler {
                                Some(handler) => handler.ready(self, event),
                                None => trace!("sporadic event for stale {:?}", token),
                            }
                        }
                    }
                }
            }

            self.run_pending_tasks();
        }

        // Submissions that raced with quit still run; their submitters were
        // promised execution, not silence.
        self.run_pending_tasks();
        debug!("event loop stopped on {:?}", thread::current().id());
    }

    /// Runs `task` on this loop: inline when already on the loop thread (and
    /// the loop is running), queued for the next cycle otherwise.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task(self);
        } else {
            self.handle.queue_in_loop(task);
        }
    }

    /// Schedules `callback` to run once on this loop after `delay`, or
    /// repeatedly every `interval` after the first fire.
    ///
    /// Timers for the same instant fire in registration order. The returned
    /// id cancels the timer via [`cancel_timer`], including from within its
    /// own callback.
    ///
    /// [`cancel_timer`]: EventLoop::cancel_timer
    pub fn add_timer<F>(&self, delay: Duration, interval: Option<Duration>, callback: F) -> TimerId
    where
        F: FnMut(&EventLoop) + 'static,
    {
        self.assert_in_loop_thread();
        let now = Instant::now();
        let mut timers = self.timers.borrow_mut();
        let id = timers.insert(now + delay, interval, Box::new(callback));
        if let Err(err) = timers.rearm(now) {
            warn!("failed to arm timer: {}", err);
        }
        id
    }

    /// Cancels a timer. Returns `true` if it was still scheduled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.assert_in_loop_thread();
        let mut timers = self.timers.borrow_mut();
        let cancelled = timers.cancel(id);
        if cancelled {
            if let Err(err) = timers.rearm(Instant::now()) {
                warn!("failed to re-arm timer: {}", err);
            }
        }
        cancelled
    }

    /// Registers the handler dispatched for `token`'s readiness events.
    pub fn add_handler(&self, token: Token, handler: Arc<dyn EventHandler>) {
        self.assert_in_loop_thread();
        self.handlers.borrow_mut().insert(token, handler);
    }

    /// Removes the handler for `token`, dropping the loop's strong reference.
    pub fn remove_handler(&self, token: Token) -> Option<Arc<dyn EventHandler>> {
        self.assert_in_loop_thread();
        self.handlers.borrow_mut().remove(&token)
    }

    /// Allocates a token for a new channel on this loop.
    pub fn next_token(&self) -> Token {
        self.assert_in_loop_thread();
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        Token(token)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    /// Aborts with a diagnostic when called off the owning thread. Guards
    /// every mutation of loop-owned state.
    pub fn assert_in_loop_thread(&self) {
        self.handle.assert_in_loop_thread();
    }

    pub(crate) fn poller(&self) -> &Poller {
        self.assert_in_loop_thread();
        &self.poller
    }

    fn process_timers(&self) {
        if let Err(err) = self.timers.borrow().ack() {
            warn!("failed to ack timer fd: {}", err);
        }

        let now = Instant::now();
        let due = self.timers.borrow_mut().pop_due(now);
        trace!("{} timers due", due.len());

        // Callbacks run without holding the wheel borrow so they can add and
        // cancel timers themselves.
        for mut entry in due {
            self.timers.borrow_mut().begin_fire(entry.seq);
            (entry.callback)(self);
            let cancelled = self.timers.borrow_mut().finish_fire();
            if !cancelled && entry.interval.is_some() {
                self.timers.borrow_mut().reinsert(entry, now);
            }
        }

        if let Err(err) = self.timers.borrow().rearm(Instant::now()) {
            warn!("failed to re-arm timer fd: {}", err);
        }
    }

    fn run_pending_tasks(&self) {
        // Swap the whole queue out under one lock acquisition; tasks queued
        // by these tasks run next cycle, keeping the drain bounded.
        let tasks = mem::take(&mut *self.handle.tasks.lock().unwrap());
        if !tasks.is_empty() {
            trace!("running {} queued tasks", tasks.len());
        }
        for task in tasks {
            task(self);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        HAS_LOOP.with(|has| has.set(false));
    }
}

/// Sends work to an [`EventLoop`] from any thread.
///
/// The handle is the only cross-thread face of a loop: it owns the task
/// queue, the eventfd waker and the quit flag. It stays valid after the loop
/// exits; tasks queued to a stopped loop are simply never run and are dropped
/// with the handle.
pub struct LoopHandle {
    thread: ThreadId,
    tasks: Mutex<Vec<Task>>,
    waker: Arc<Waker>,
    quit: AtomicBool,
}

impl LoopHandle {
    /// Returns `true` when called on the loop's owning thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Aborts with a diagnostic when called off the owning thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop-thread affinity violated: on {:?}, loop owned by {:?}",
                thread::current().id(),
                self.thread,
            );
        }
    }

    /// Runs `task` on the owning loop.
    ///
    /// Called from the loop thread while the loop is running, the task runs
    /// inline. In every other case the task is queued and the loop is woken;
    /// queued tasks run in FIFO order per submitter at the end of a cycle.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            let current = CURRENT_LOOP.with(|c| c.get());
            if !current.is_null() {
                // SAFETY: the pointer is published only for the duration of
                // `EventLoop::run` on this thread, and we are on this thread.
                let lp = unsafe { &*current };
                task(lp);
                return;
            }
            // The loop exists but is not running yet (setup phase); fall
            // through and let the first cycle pick the task up.
        }
        self.queue_in_loop(task);
    }

    /// Queues `task` unconditionally, even when called on the loop thread.
    /// Used when the caller needs the task to run after the current dispatch
    /// completes (teardown paths rely on this ordering).
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.tasks.lock().unwrap().push(Box::new(task));
        if let Err(err) = self.waker.wake() {
            warn!("failed to wake loop: {}", err);
        }
    }

    /// Asks the loop to exit. Cooperative: the flag is checked at the top of
    /// each cycle, and the wakeup ensures a blocked poll notices promptly.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            warn!("failed to wake loop for quit: {}", err);
        }
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.thread)
            .field("quit", &self.quit.load(Ordering::Relaxed))
            .finish()
    }
}

/// Runs `f` with the loop currently running on this thread, if any.
///
/// Callers must have already confirmed they are on the right loop's thread
/// (via [`LoopHandle::is_in_loop_thread`]); one-loop-per-thread then
/// guarantees the published loop is that one.
pub(crate) fn try_with_current<R>(f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
    CURRENT_LOOP.with(|c| {
        let current = c.get();
        if current.is_null() {
            None
        } else {
            // SAFETY: the pointer is published only for the duration of
            // `EventLoop::run` on this thread, and we are on this thread.
            Some(f(unsafe { &*current }))
        }
    })
}

struct CurrentGuard;

impl CurrentGuard {
    fn set(lp: &EventLoop) -> CurrentGuard {
        CURRENT_LOOP.with(|c| c.set(lp as *const EventLoop));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|c| c.set(ptr::null()));
    }
}

/// A cell for loop-owned state inside objects that are shared across threads.
///
/// Connections and acceptors are handed around as `Arc`s, but their buffers
/// and channels belong to exactly one loop. `LoopCell` makes that ownership
/// checkable: every borrow asserts the owning loop thread, so a stray access
/// from another thread aborts instead of racing.
pub struct LoopCell<T> {
    handle: Arc<LoopHandle>,
    inner: RefCell<T>,
}

impl<T> LoopCell<T> {
    pub fn new(handle: Arc<LoopHandle>, value: T) -> LoopCell<T> {
        LoopCell {
            handle,
            inner: RefCell::new(value),
        }
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        self.handle.assert_in_loop_thread();
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.handle.assert_in_loop_thread();
        self.inner.borrow_mut()
    }

    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }
}

// SAFETY: every borrow asserts that it happens on the single owning loop
// thread, so the inner RefCell is never touched from two threads at once.
// Re-entrant borrows on the loop thread itself are still caught by the
// RefCell. Dropping from another thread is fine because `T: Send`.
unsafe impl<T: Send> Sync for LoopCell<T> {}
