// crates/rivulet-core/src/queue/frame.rs
//
// Fixed-capacity frame ring between one decoder and its consumers.
// Producing is two-phase: `begin_write` reserves the tail while there
// is room, `commit` publishes the finished frame. The reservation is a
// guard value, so at most one write can be pending and an abandoned
// reservation releases its slot on drop.
//
// `keep_last` changes pop at size 1 to return a copy of the head
// without removing it, so a consumer can keep redisplaying the most
// recent frame while paused.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use super::Timeout;

struct Inner<T> {
    queue: VecDeque<T>,
    max_size: usize,
    keep_last: bool,
    serial: i32,
    aborted: bool,
    pending_write: bool,
}

pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

/// Tail-slot reservation returned by `begin_write`. Publish with
/// `commit`; dropping without committing frees the slot.
pub struct WriteReservation<'a, T> {
    queue: &'a FrameQueue<T>,
    committed: bool,
}

impl<T> WriteReservation<'_, T> {
    /// Publish `frame` at the tail. Fails only if the queue was
    /// aborted while the reservation was held.
    pub fn commit(mut self, frame: T) -> bool {
        self.committed = true;
        let mut inner = self.queue.inner.lock().unwrap();
        inner.pending_write = false;
        if inner.aborted {
            self.queue.cond.notify_all();
            return false;
        }
        inner.queue.push_back(frame);
        self.queue.cond.notify_all();
        true
    }
}

impl<T> Drop for WriteReservation<'_, T> {
    fn drop(&mut self) {
        if !self.committed {
            let mut inner = self.queue.inner.lock().unwrap();
            inner.pending_write = false;
            self.queue.cond.notify_all();
        }
    }
}

impl<T> FrameQueue<T> {
    pub fn new(max_size: usize, keep_last: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                max_size: max_size.max(1),
                keep_last,
                serial: 0,
                aborted: false,
                pending_write: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Reserve the tail slot. Waits while the ring is full or another
    /// write is pending; returns None on timeout or abort.
    pub fn begin_write(&self, timeout: Timeout) -> Option<WriteReservation<'_, T>> {
        let mut guard = self.inner.lock().unwrap();
        let writable =
            |inner: &Inner<T>| inner.aborted || (inner.queue.len() < inner.max_size && !inner.pending_write);

        match timeout {
            Timeout::NoWait => {
                if !writable(&guard) {
                    return None;
                }
            }
            Timeout::Infinite => {
                guard = self.cond.wait_while(guard, |inner| !writable(inner)).unwrap();
            }
            Timeout::Millis(ms) => {
                let (g, result) = self
                    .cond
                    .wait_timeout_while(guard, std::time::Duration::from_millis(ms), |inner| {
                        !writable(inner)
                    })
                    .unwrap();
                guard = g;
                if result.timed_out() && !writable(&guard) {
                    return None;
                }
            }
        }

        if guard.aborted {
            return None;
        }
        guard.pending_write = true;
        Some(WriteReservation { queue: self, committed: false })
    }

    /// Reserve-and-commit in one call.
    pub fn push(&self, frame: T, timeout: Timeout) -> bool {
        match self.begin_write(timeout) {
            Some(reservation) => reservation.commit(frame),
            None => false,
        }
    }
}

impl<T: Clone> FrameQueue<T> {
    /// Consume the head. Under `keep_last` with exactly one element the
    /// head is copied to the caller and left in place.
    pub fn pop(&self, timeout: Timeout) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        let can_pop = |inner: &Inner<T>| {
            inner.aborted
                || if inner.keep_last {
                    inner.queue.len() > 1
                } else {
                    !inner.queue.is_empty()
                }
        };

        let satisfied = match timeout {
            Timeout::NoWait => can_pop(&guard),
            Timeout::Infinite => {
                guard = self.cond.wait_while(guard, |inner| !can_pop(inner)).unwrap();
                true
            }
            Timeout::Millis(ms) => {
                let (g, result) = self
                    .cond
                    .wait_timeout_while(guard, std::time::Duration::from_millis(ms), |inner| {
                        !can_pop(inner)
                    })
                    .unwrap();
                guard = g;
                !(result.timed_out() && !can_pop(&guard))
            }
        };

        if guard.aborted {
            return None;
        }
        if !satisfied {
            // keep-last still serves the final frame to timed-out
            // callers so a paused consumer can redisplay it.
            if guard.keep_last && guard.queue.len() == 1 {
                return guard.queue.front().cloned();
            }
            return None;
        }

        if guard.keep_last && guard.queue.len() == 1 {
            return guard.queue.front().cloned();
        }

        let frame = guard.queue.pop_front();
        self.cond.notify_all();
        frame
    }

    pub fn try_pop(&self) -> Option<T> {
        self.pop(Timeout::NoWait)
    }
}

impl<T> FrameQueue<T> {
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        self.cond.notify_all();
    }

    pub fn set_abort(&self, abort: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted != abort {
            inner.aborted = abort;
            self.cond.notify_all();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    pub fn set_serial(&self, serial: i32) {
        self.inner.lock().unwrap().serial = serial;
    }

    pub fn serial(&self) -> i32 {
        self.inner.lock().unwrap().serial
    }

    pub fn set_keep_last(&self, keep_last: bool) {
        self.inner.lock().unwrap().keep_last = keep_last;
    }

    pub fn is_keep_last(&self) -> bool {
        self.inner.lock().unwrap().keep_last
    }

    /// Change capacity, keeping the newest frames that still fit.
    pub fn set_max_count(&self, max_count: usize) -> bool {
        if max_count == 0 {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.len() > max_count {
            inner.queue.pop_front();
        }
        inner.max_size = max_count;
        self.cond.notify_all();
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().max_size
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queue.len() >= inner.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reserve_commit_pop_round_trip() {
        let q = FrameQueue::new(3, false);
        let r = q.begin_write(Timeout::NoWait).unwrap();
        assert!(r.commit(1u32));
        q.push(2, Timeout::NoWait);
        assert_eq!(q.pop(Timeout::NoWait), Some(1));
        assert_eq!(q.pop(Timeout::NoWait), Some(2));
        assert_eq!(q.pop(Timeout::NoWait), None);
    }

    #[test]
    fn only_one_pending_write_at_a_time() {
        let q = FrameQueue::<u32>::new(3, false);
        let first = q.begin_write(Timeout::NoWait).unwrap();
        assert!(q.begin_write(Timeout::Millis(20)).is_none());
        drop(first); // abandoned reservation releases the slot
        assert!(q.begin_write(Timeout::NoWait).is_some());
    }

    #[test]
    fn full_queue_blocks_writer_until_pop() {
        let q = Arc::new(FrameQueue::new(1, false));
        q.push(1u32, Timeout::NoWait);

        let writer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(2, Timeout::Infinite))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.pop(Timeout::NoWait), Some(1));
        assert!(writer.join().unwrap());
        assert_eq!(q.pop(Timeout::NoWait), Some(2));
    }

    #[test]
    fn keep_last_returns_final_frame_without_removing() {
        let q = FrameQueue::new(3, true);
        q.push(7u32, Timeout::NoWait);
        q.push(8, Timeout::NoWait);

        // Two elements: normal pop.
        assert_eq!(q.pop(Timeout::NoWait), Some(7));
        // One element left: copied out, not removed, repeatedly.
        assert_eq!(q.pop(Timeout::NoWait), Some(8));
        assert_eq!(q.pop(Timeout::NoWait), Some(8));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn abort_unblocks_writer_and_fails_commit() {
        let q = Arc::new(FrameQueue::new(1, false));
        q.push(1u32, Timeout::NoWait);

        let writer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(2, Timeout::Infinite))
        };
        thread::sleep(Duration::from_millis(20));
        q.set_abort(true);
        assert!(!writer.join().unwrap());
    }

    #[test]
    fn resize_keeps_newest_in_fifo_order() {
        let q = FrameQueue::new(5, false);
        for v in 0..5u32 {
            q.push(v, Timeout::NoWait);
        }
        assert!(q.set_max_count(2));
        assert_eq!(q.capacity(), 2);
        assert_eq!(q.pop(Timeout::NoWait), Some(3));
        assert_eq!(q.pop(Timeout::NoWait), Some(4));
        assert!(!q.set_max_count(0));
    }

    #[test]
    fn clear_empties_and_wakes_writers() {
        let q = Arc::new(FrameQueue::new(1, false));
        q.push(1u32, Timeout::NoWait);
        let writer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(2, Timeout::Infinite))
        };
        thread::sleep(Duration::from_millis(20));
        q.clear();
        assert!(writer.join().unwrap());
    }

    #[test]
    fn aborted_pop_fails_even_with_items() {
        let q = FrameQueue::new(3, false);
        q.push(1u32, Timeout::NoWait);
        q.set_abort(true);
        assert_eq!(q.pop(Timeout::NoWait), None);
        assert_eq!(q.pop(Timeout::Infinite), None);
        // Clearing the abort makes the remaining frame reachable again.
        q.set_abort(false);
        assert_eq!(q.pop(Timeout::NoWait), Some(1));
    }

    #[test]
    fn serial_is_tracked_not_derived() {
        let q = FrameQueue::<u32>::new(2, false);
        assert_eq!(q.serial(), 0);
        q.set_serial(5);
        assert_eq!(q.serial(), 5);
    }
}
