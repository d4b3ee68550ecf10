use std::collections::{BTreeMap, HashMap};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::event_loop::EventLoop;
use crate::sys::timerfd::TimerFd;

/// Identifies a timer registered with an [`EventLoop`], for cancellation.
///
/// Ids are backed by a per-loop monotonic sequence and are never reused, so a
/// stale id is a harmless no-op to cancel.
///
/// [`EventLoop`]: crate::EventLoop
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

pub(crate) type TimerCallback = Box<dyn FnMut(&EventLoop)>;

pub(crate) struct TimerEntry {
    pub(crate) seq: u64,
    pub(crate) interval: Option<Duration>,
    pub(crate) callback: TimerCallback,
}

/// Ordered set of scheduled callbacks backed by a single kernel timer.
///
/// Entries are keyed by `(deadline, sequence)`; the sequence breaks deadline
/// ties so that timers scheduled for the same instant fire in registration
/// order. The timerfd is armed for the earliest deadline only; repeating
/// timers are re-inserted by the loop after each fire.
pub(crate) struct TimerWheel {
    fd: TimerFd,
    entries: BTreeMap<(Instant, u64), TimerEntry>,
    // seq -> current deadline, for cancellation by id.
    active: HashMap<u64, Instant>,
    // Entry currently executing its callback; `cancel` for it is recorded
    // here because it is in neither map while it runs.
    firing: Option<u64>,
    cancel_firing: bool,
    next_seq: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> io::Result<TimerWheel> {
        Ok(TimerWheel {
            fd: TimerFd::new()?,
            entries: BTreeMap::new(),
            active: HashMap::new(),
            firing: None,
            cancel_firing: false,
            next_seq: 0,
        })
    }

    pub(crate) fn insert(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            (deadline, seq),
            TimerEntry {
                seq,
                interval,
                callback,
            },
        );
        self.active.insert(seq, deadline);
        TimerId(seq)
    }

    /// Cancels a timer. Returns `true` if the timer was still pending (or is
    /// currently firing and will not repeat).
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        if let Some(deadline) = self.active.remove(&id.0) {
            self.entries.remove(&(deadline, id.0));
            true
        } else if self.firing == Some(id.0) {
            self.cancel_firing = true;
            true
        } else {
            false
        }
    }

    /// Removes and returns every entry due at `now`, earliest first.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        // `u64::MAX` is never allocated as a sequence, so the boundary key
        // sorts after every real entry with deadline <= `now`.
        let remaining = self.entries.split_off(&(now, u64::MAX));
        let due = mem::replace(&mut self.entries, remaining);
        due.into_values()
            .map(|entry| {
                self.active.remove(&entry.seq);
                entry
            })
            .collect()
    }

    pub(crate) fn begin_fire(&mut self, seq: u64) {
        self.firing = Some(seq);
        self.cancel_firing = false;
    }

    /// Ends the fire started with [`begin_fire`], returning `true` when the
    /// callback cancelled its own timer.
    ///
    /// [`begin_fire`]: TimerWheel::begin_fire
    pub(crate) fn finish_fire(&mut self) -> bool {
        self.firing = None;
        mem::replace(&mut self.cancel_firing, false)
    }

    /// Puts a repeating entry back, `interval` after `now`.
    pub(crate) fn reinsert(&mut self, entry: TimerEntry, now: Instant) {
        let interval = match entry.interval {
            Some(interval) => interval,
            None => return,
        };
        let deadline = now + interval;
        self.active.insert(entry.seq, deadline);
        self.entries.insert((deadline, entry.seq), entry);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Programs the kernel timer for the earliest deadline, or disarms it
    /// when the wheel is empty.
    pub(crate) fn rearm(&self, now: Instant) -> io::Result<()> {
        match self.next_deadline() {
            Some(deadline) => self.fd.set(deadline.saturating_duration_since(now)),
            None => self.fd.disarm(),
        }
    }

    pub(crate) fn ack(&self) -> io::Result<()> {
        self.fd.ack()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AsRawFd for TimerWheel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    #[test]
    fn pop_due_orders_equal_deadlines_by_sequence() {
        let mut wheel = TimerWheel::new().unwrap();
        let now = Instant::now();

        let a = wheel.insert(now, None, noop());
        let b = wheel.insert(now, None, noop());
        let later = wheel.insert(now + Duration::from_secs(1), None, noop());

        let due = wheel.pop_due(now);
        let seqs: Vec<u64> = due.iter().map(|e| e.seq).collect();
        assert_eq!(seqs.len(), 2);
        // Registration order, not map iteration luck.
        assert!(seqs[0] < seqs[1]);
        assert_ne!(a, b);

        assert!(!wheel.is_empty());
        assert!(wheel.cancel(later));
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_pending_and_stale() {
        let mut wheel = TimerWheel::new().unwrap();
        let now = Instant::now();

        let id = wheel.insert(now + Duration::from_secs(10), None, noop());
        assert!(wheel.cancel(id));
        // Already cancelled: stale ids are a no-op.
        assert!(!wheel.cancel(id));
        assert_eq!(wheel.next_deadline(), None);
    }

    #[test]
    fn cancel_during_fire_suppresses_reinsert() {
        let mut wheel = TimerWheel::new().unwrap();
        let now = Instant::now();

        let id = wheel.insert(now, Some(Duration::from_millis(20)), noop());
        let mut due = wheel.pop_due(now);
        let entry = due.pop().unwrap();

        wheel.begin_fire(entry.seq);
        assert!(wheel.cancel(id));
        assert!(wheel.finish_fire());

        // The loop drops the entry instead of reinserting it.
        assert!(wheel.is_empty());
    }
}
