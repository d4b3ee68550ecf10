use std::collections::VecDeque;
use std::sync::Mutex;

/// Batching many-producer, one-consumer queue.
///
/// I/O threads push audio frames as they arrive; the mix tick takes
/// everything in one [`drain`] call under a single lock acquisition, so
/// producers are never blocked behind per-element consumption. There is no
/// condition variable on purpose: the consumer is driven by a timer, not by
/// arrival.
///
/// [`drain`]: DrainQueue::drain
///
/// # Examples
///
/// ```
/// use lightvoice::DrainQueue;
///
/// let queue = DrainQueue::new();
/// queue.push(1);
/// queue.push(2);
///
/// let mut out = Vec::new();
/// queue.drain(&mut out);
/// assert_eq!(out, vec![1, 2]);
/// assert!(queue.is_empty());
/// ```
#[derive(Debug)]
pub struct DrainQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> DrainQueue<T> {
    pub fn new() -> DrainQueue<T> {
        DrainQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, value: T) {
        self.inner.lock().unwrap().push_back(value);
    }

    /// Removes the oldest element, if any.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Moves every queued element into `out`, oldest first.
    pub fn drain(&self, out: &mut Vec<T>) {
        let mut queue = self.inner.lock().unwrap();
        out.extend(queue.drain(..));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl<T> Default for DrainQueue<T> {
    fn default() -> DrainQueue<T> {
        DrainQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::DrainQueue;

    #[test]
    fn fifo_order() {
        let queue = DrainQueue::new();
        queue.push("a");
        queue.push("b");
        queue.push("c");

        assert_eq!(queue.try_pop(), Some("a"));

        let mut out = Vec::new();
        queue.drain(&mut out);
        assert_eq!(out, vec!["b", "c"]);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn drain_appends() {
        let queue = DrainQueue::new();
        queue.push(2);
        let mut out = vec![1];
        queue.drain(&mut out);
        assert_eq!(out, vec![1, 2]);
    }
}
