// crates/rivulet-core/src/dispatch.rs
//
// Listener registry with two delivery modes: Sync runs callbacks on
// the emitting thread, Queued pushes onto a bounded channel drained by
// a dedicated worker. Global listeners are fan-out registrations
// across every event kind.
//
// Listener callbacks are invoked without any dispatcher lock held, so
// a callback may add or remove listeners (including itself).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::events::{Event, EventKind};

pub type EventCallback = dyn Fn(&Event) + Send + Sync;

/// Opaque handle returned by listener registration; one handle may
/// cover several kinds (global registration).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle(Vec<(EventKind, u64)>);

/// How an emit is delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Invoke listeners on the calling thread before returning.
    Sync,
    /// Enqueue for the worker thread.
    #[default]
    Queued,
}

type Registry = HashMap<EventKind, Vec<(u64, Arc<EventCallback>)>>;

const QUEUE_DEPTH: usize = 512;

pub struct EventDispatcher {
    listeners: Mutex<Registry>,
    next_id: AtomicU64,
    queue_tx: Sender<Event>,
    queue_rx: Receiver<Event>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    worker_active: Arc<AtomicBool>,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        let (queue_tx, queue_rx) = bounded(QUEUE_DEPTH);
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_tx,
            queue_rx,
            worker: Mutex::new(None),
            worker_active: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn add_listener<F>(&self, kind: EventKind, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        ListenerHandle(vec![(kind, id)])
    }

    /// Register one callback for every event kind.
    pub fn add_global_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let shared: Arc<EventCallback> = Arc::new(callback);
        let mut entries = Vec::with_capacity(EventKind::all().len());
        let mut listeners = self.listeners.lock().unwrap();
        for &kind in EventKind::all() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            listeners.entry(kind).or_default().push((id, Arc::clone(&shared)));
            entries.push((kind, id));
        }
        ListenerHandle(entries)
    }

    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let mut removed = false;
        for &(kind, id) in &handle.0 {
            if let Some(list) = listeners.get_mut(&kind) {
                let before = list.len();
                list.retain(|(entry_id, _)| *entry_id != id);
                removed |= list.len() != before;
            }
        }
        removed
    }

    /// Emit `event` in the given mode. Queued emits fall back to the
    /// caller's thread when the worker is not running or the queue is
    /// saturated; events are never silently dropped.
    pub fn emit(&self, event: Event, mode: DispatchMode) {
        match mode {
            DispatchMode::Sync => self.deliver(&event),
            DispatchMode::Queued => {
                if !self.worker_active.load(Ordering::Acquire)
                    || self.queue_tx.try_send(event.clone()).is_err()
                {
                    self.deliver(&event);
                }
            }
        }
    }

    /// Drain pending queued events on the calling thread. Returns true
    /// if anything was processed. Intended for hosts that poll instead
    /// of running the worker.
    pub fn process_queued(&self) -> bool {
        let mut any = false;
        while let Ok(event) = self.queue_rx.try_recv() {
            self.deliver(&event);
            any = true;
        }
        any
    }

    pub fn start_worker(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        self.worker_active.store(true, Ordering::Release);

        let this = Arc::clone(self);
        let active = Arc::clone(&self.worker_active);
        *worker = Some(thread::spawn(move || {
            while active.load(Ordering::Acquire) {
                match this.queue_rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(event) => this.deliver(&event),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Drain what was queued before the stop flag flipped.
            while let Ok(event) = this.queue_rx.try_recv() {
                this.deliver(&event);
            }
        }));
    }

    pub fn stop_worker(&self) {
        self.worker_active.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_worker_active(&self) -> bool {
        self.worker_active.load(Ordering::Acquire)
    }

    fn deliver(&self, event: &Event) {
        // Snapshot under the lock, invoke outside it.
        let callbacks: Vec<Arc<EventCallback>> = {
            let listeners = self.listeners.lock().unwrap();
            match listeners.get(&event.kind) {
                Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };
        for cb in callbacks {
            cb(event);
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.worker_active.store(false, Ordering::Release);
        if let Some(handle) = self.worker.get_mut().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_listener(counter: &Arc<AtomicUsize>) -> impl Fn(&Event) + Send + Sync {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sync_dispatch_invokes_matching_listeners_only() {
        let dispatcher = EventDispatcher::new();
        let opened = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        dispatcher.add_listener(EventKind::StreamOpened, counter_listener(&opened));
        dispatcher.add_listener(EventKind::StreamOpenFailed, counter_listener(&failed));

        let ev = Event::stream(EventKind::StreamOpened, "a.mp4", "demuxer", "opened");
        dispatcher.emit(ev, DispatchMode::Sync);

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn queued_dispatch_runs_on_worker() {
        let dispatcher = EventDispatcher::new();
        dispatcher.start_worker();

        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.add_listener(EventKind::DecodeStarted, counter_listener(&count));

        for _ in 0..10 {
            dispatcher.emit(
                Event::new(EventKind::DecodeStarted, "decoder", "started"),
                DispatchMode::Queued,
            );
        }
        dispatcher.stop_worker();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn queued_without_worker_delivers_inline() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.add_listener(EventKind::SeekSuccess, counter_listener(&count));

        dispatcher.emit(
            Event::new(EventKind::SeekSuccess, "controller", "seek done"),
            DispatchMode::Queued,
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn global_listener_sees_every_kind_and_unregisters_once() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.add_global_listener(counter_listener(&count));

        dispatcher.emit(Event::new(EventKind::StreamEnded, "demuxer", "eof"), DispatchMode::Sync);
        dispatcher.emit(
            Event::new(EventKind::RecordingStopped, "recorder", "done"),
            DispatchMode::Sync,
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(dispatcher.remove_listener(&handle));
        dispatcher.emit(Event::new(EventKind::StreamEnded, "demuxer", "eof"), DispatchMode::Sync);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_unknown_handle_is_false() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.add_listener(EventKind::StreamOpened, counter_listener(&count));
        assert!(dispatcher.remove_listener(&handle));
        assert!(!dispatcher.remove_listener(&handle));
    }

    #[test]
    fn listener_can_register_another_listener() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let inner_count = Arc::clone(&count);
        let dispatcher_ref = Arc::clone(&dispatcher);
        dispatcher.add_listener(EventKind::StreamOpened, move |_| {
            inner_count.fetch_add(1, Ordering::SeqCst);
            // Re-entrant registration must not deadlock.
            let extra = Arc::new(AtomicUsize::new(0));
            let handle = dispatcher_ref
                .add_listener(EventKind::StreamClosed, counter_listener(&extra));
            dispatcher_ref.remove_listener(&handle);
        });

        dispatcher.emit(
            Event::new(EventKind::StreamOpened, "demuxer", "opened"),
            DispatchMode::Sync,
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
