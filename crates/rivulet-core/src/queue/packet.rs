// crates/rivulet-core/src/queue/packet.rs
//
// Bounded FIFO for coded packets. One mutex guards the deque and its
// byte/duration accounting so the counters always equal the sum over
// current elements; two condvars separate producer and consumer
// wakeups. `abort()` wakes everything and makes push fail, while pop
// keeps draining until the queue is empty.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use super::{QueueItem, Timeout};

#[derive(Debug, Clone, Copy)]
pub struct PacketQueueStats {
    pub count: usize,
    pub byte_size: usize,
    pub duration_units: i64,
    pub serial: i32,
    pub aborted: bool,
}

struct Inner<T> {
    queue: VecDeque<T>,
    max_count: usize,
    byte_size: usize,
    duration_units: i64,
    serial: i32,
    aborted: bool,
}

pub struct PacketQueue<T> {
    inner: Mutex<Inner<T>>,
    push_cond: Condvar,
    pop_cond: Condvar,
}

impl<T: QueueItem> PacketQueue<T> {
    pub fn new(max_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                max_count: max_count.max(1),
                byte_size: 0,
                duration_units: 0,
                serial: 0,
                aborted: false,
            }),
            push_cond: Condvar::new(),
            pop_cond: Condvar::new(),
        }
    }

    /// Enqueue `item`. Returns false when the wait timed out or the
    /// queue is aborted.
    pub fn push(&self, item: T, timeout: Timeout) -> bool {
        let guard = self.inner.lock().unwrap();
        let can_push = |inner: &Inner<T>| inner.aborted || inner.queue.len() < inner.max_count;

        let Some(mut inner) = wait_until(guard, &self.push_cond, timeout, can_push) else {
            return false;
        };
        if inner.aborted {
            return false;
        }

        inner.byte_size += item.byte_size();
        inner.duration_units += item.duration_units();
        inner.queue.push_back(item);

        self.pop_cond.notify_one();
        true
    }

    /// Dequeue the oldest item. After `abort()`, pop keeps returning
    /// remaining items until the queue is drained, then fails.
    pub fn pop(&self, timeout: Timeout) -> Option<T> {
        let guard = self.inner.lock().unwrap();
        let can_pop = |inner: &Inner<T>| inner.aborted || !inner.queue.is_empty();

        let mut inner = wait_until(guard, &self.pop_cond, timeout, can_pop)?;
        if inner.queue.is_empty() {
            // Only reachable when aborted.
            return None;
        }

        let item = inner.queue.pop_front().unwrap();
        inner.byte_size -= item.byte_size();
        inner.duration_units -= item.duration_units();

        self.push_cond.notify_one();
        Some(item)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.pop(Timeout::NoWait)
    }

    /// Non-destructive peek at the head.
    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().unwrap().queue.front().cloned()
    }

    /// Empty the queue and advance the serial, invalidating everything
    /// downstream that still carries the old one. Never blocks.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.byte_size = 0;
        inner.duration_units = 0;
        inner.serial += 1;
        self.push_cond.notify_all();
        self.pop_cond.notify_all();
    }

    /// Clear the abort flag and advance the serial.
    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = false;
        inner.serial += 1;
        self.push_cond.notify_all();
        self.pop_cond.notify_all();
    }

    /// Idempotent; wakes every waiter.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        self.push_cond.notify_all();
        self.pop_cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queue.len() >= inner.max_count
    }

    pub fn byte_size(&self) -> usize {
        self.inner.lock().unwrap().byte_size
    }

    pub fn duration_units(&self) -> i64 {
        self.inner.lock().unwrap().duration_units
    }

    pub fn serial(&self) -> i32 {
        self.inner.lock().unwrap().serial
    }

    pub fn max_count(&self) -> usize {
        self.inner.lock().unwrap().max_count
    }

    pub fn set_max_count(&self, max_count: usize) {
        assert!(max_count > 0, "packet queue capacity must be positive");
        let mut inner = self.inner.lock().unwrap();
        inner.max_count = max_count;
        self.push_cond.notify_all();
    }

    pub fn stats(&self) -> PacketQueueStats {
        let inner = self.inner.lock().unwrap();
        PacketQueueStats {
            count: inner.queue.len(),
            byte_size: inner.byte_size,
            duration_units: inner.duration_units,
            serial: inner.serial,
            aborted: inner.aborted,
        }
    }
}

/// Block on `cond` until `pred` holds or the timeout elapses. Returns
/// the re-acquired guard when the predicate is satisfied.
fn wait_until<'a, T, F>(
    guard: MutexGuard<'a, Inner<T>>,
    cond: &Condvar,
    timeout: Timeout,
    pred: F,
) -> Option<MutexGuard<'a, Inner<T>>>
where
    F: Fn(&Inner<T>) -> bool,
{
    match timeout {
        Timeout::NoWait => {
            if pred(&guard) {
                Some(guard)
            } else {
                None
            }
        }
        Timeout::Infinite => Some(cond.wait_while(guard, |inner| !pred(inner)).unwrap()),
        Timeout::Millis(ms) => {
            let (guard, result) = cond
                .wait_timeout_while(guard, std::time::Duration::from_millis(ms), |inner| {
                    !pred(inner)
                })
                .unwrap();
            if result.timed_out() && !pred(&guard) {
                None
            } else {
                Some(guard)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: u32,
        bytes: usize,
        dur: i64,
    }

    impl QueueItem for Item {
        fn byte_size(&self) -> usize {
            self.bytes
        }
        fn duration_units(&self) -> i64 {
            self.dur
        }
    }

    fn item(id: u32) -> Item {
        Item { id, bytes: 100, dur: 40 }
    }

    #[test]
    fn fifo_order_between_flushes() {
        let q = PacketQueue::new(16);
        for id in 0..8 {
            assert!(q.push(item(id), Timeout::NoWait));
        }
        for id in 0..8 {
            assert_eq!(q.pop(Timeout::NoWait).unwrap().id, id);
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn counters_track_contents() {
        let q = PacketQueue::new(16);
        q.push(item(0), Timeout::NoWait);
        q.push(item(1), Timeout::NoWait);
        assert_eq!(q.byte_size(), 200);
        assert_eq!(q.duration_units(), 80);

        q.pop(Timeout::NoWait);
        assert_eq!(q.byte_size(), 100);
        assert_eq!(q.duration_units(), 40);

        q.flush();
        assert_eq!(q.byte_size(), 0);
        assert_eq!(q.duration_units(), 0);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn serial_strictly_increases_across_flushes() {
        let q = PacketQueue::<Item>::new(4);
        let s0 = q.serial();
        q.flush();
        let s1 = q.serial();
        q.flush();
        let s2 = q.serial();
        assert!(s0 < s1 && s1 < s2);
    }

    #[test]
    fn push_blocks_when_full_and_times_out() {
        let q = PacketQueue::new(1);
        assert!(q.push(item(0), Timeout::NoWait));
        let start = Instant::now();
        assert!(!q.push(item(1), Timeout::Millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn pop_drains_after_abort_then_fails() {
        let q = PacketQueue::new(4);
        q.push(item(0), Timeout::NoWait);
        q.push(item(1), Timeout::NoWait);
        q.abort();

        assert!(!q.push(item(2), Timeout::NoWait), "push after abort");
        assert_eq!(q.pop(Timeout::NoWait).unwrap().id, 0);
        assert_eq!(q.pop(Timeout::NoWait).unwrap().id, 1);
        assert!(q.pop(Timeout::NoWait).is_none());
        // Even an infinite wait returns immediately once aborted.
        assert!(q.pop(Timeout::Infinite).is_none());
    }

    #[test]
    fn abort_unblocks_waiting_consumer() {
        let q = Arc::new(PacketQueue::<Item>::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop(Timeout::Infinite))
        };
        thread::sleep(Duration::from_millis(20));
        q.abort();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn start_clears_abort_and_bumps_serial() {
        let q = PacketQueue::<Item>::new(4);
        q.abort();
        let serial_before = q.serial();
        q.start();
        assert!(!q.is_aborted());
        assert!(q.serial() > serial_before);
        assert!(q.push(item(9), Timeout::NoWait));
    }

    #[test]
    fn producer_consumer_pair_transfers_everything() {
        let q = Arc::new(PacketQueue::new(8));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for id in 0..100 {
                    assert!(q.push(item(id), Timeout::Infinite));
                }
            })
        };
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 100 {
                    if let Some(it) = q.pop(Timeout::Millis(100)) {
                        seen.push(it.id);
                    }
                }
                seen
            })
        };
        producer.join().unwrap();
        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn front_is_non_destructive() {
        let q = PacketQueue::new(4);
        q.push(item(5), Timeout::NoWait);
        assert_eq!(q.front().unwrap().id, 5);
        assert_eq!(q.len(), 1);
    }
}
