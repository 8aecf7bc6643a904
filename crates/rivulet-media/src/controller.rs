// crates/rivulet-media/src/controller.rs
//
// Composition root. Owns the event dispatcher, the sync manager, the
// demuxer, and the two decoders; runs async open with cancellation and
// the reconnect loop. Lifecycle transitions are serialized by the
// state mutex, which is never held across a blocking join of a thread
// that could itself need it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use rivulet_core::queue::FrameQueue;
use rivulet_core::{
    AsyncOpenResult, Config, DispatchMode, Event, EventDispatcher, EventKind, EventPayload,
    ListenerHandle, LoopMode, MasterClock, MediaType, PreBufferProgress, PreBufferState,
    StreamSyncManager, SyncQualityStats, SyncStats,
};

use crate::decoder::{AudioDecoder, DecoderStatistics, VideoDecoder};
use crate::demuxer::Demuxer;
use crate::frame::MediaFrame;

/// Wait between closing and reopening during a reconnect attempt.
const RECONNECT_RELEASE_WAIT: Duration = Duration::from_millis(300);
/// Stop-flag poll slice inside reconnect interval waits.
const RECONNECT_POLL: Duration = Duration::from_millis(100);

pub type AsyncOpenCallback = Box<dyn FnOnce(AsyncOpenResult, bool, String) + Send>;

struct ControllerState {
    config: Config,
    original_url: String,
    video_decoder: Option<Arc<VideoDecoder>>,
    audio_decoder: Option<Arc<AudioDecoder>>,
    is_decoding: bool,
}

pub struct DecoderController {
    dispatcher: Arc<EventDispatcher>,
    sync: Arc<StreamSyncManager>,
    demuxer: Arc<Demuxer>,
    state: Mutex<ControllerState>,

    async_open_worker: Mutex<Option<thread::JoinHandle<()>>>,
    async_open_in_progress: Arc<AtomicBool>,
    should_cancel_async_open: Arc<AtomicBool>,

    reconnect_worker: Mutex<Option<thread::JoinHandle<()>>>,
    is_reconnecting: Arc<AtomicBool>,
    should_stop_reconnect: Arc<AtomicBool>,
    reconnect_attempt: AtomicU32,
    paused_when_reconnected: AtomicBool,
    had_decoders_when_reconnected: AtomicBool,

    pre_buffer_state: Mutex<PreBufferState>,
}

impl DecoderController {
    pub fn new() -> Arc<Self> {
        // Safe to call repeatedly; libav registration is idempotent.
        let _ = ffmpeg::init();
        ffmpeg::format::network::init();

        let dispatcher = EventDispatcher::new();
        dispatcher.start_worker();

        let controller = Arc::new(Self {
            sync: Arc::new(StreamSyncManager::new()),
            demuxer: Arc::new(Demuxer::new(Arc::clone(&dispatcher))),
            dispatcher,
            state: Mutex::new(ControllerState {
                config: Config::default(),
                original_url: String::new(),
                video_decoder: None,
                audio_decoder: None,
                is_decoding: false,
            }),
            async_open_worker: Mutex::new(None),
            async_open_in_progress: Arc::new(AtomicBool::new(false)),
            should_cancel_async_open: Arc::new(AtomicBool::new(false)),
            reconnect_worker: Mutex::new(None),
            is_reconnecting: Arc::new(AtomicBool::new(false)),
            should_stop_reconnect: Arc::new(AtomicBool::new(false)),
            reconnect_attempt: AtomicU32::new(0),
            paused_when_reconnected: AtomicBool::new(false),
            had_decoders_when_reconnected: AtomicBool::new(false),
            pre_buffer_state: Mutex::new(PreBufferState::Disabled),
        });

        // Fatal read errors feed the reconnect loop.
        let weak = Arc::downgrade(&controller);
        controller
            .dispatcher
            .add_listener(EventKind::StreamReadError, move |_event| {
                if let Some(controller) = weak.upgrade() {
                    let enabled = controller.state.lock().unwrap().config.enable_auto_reconnect;
                    if enabled && !controller.should_stop_reconnect.load(Ordering::Acquire) {
                        log::warn!("stream read error, starting reconnect");
                        controller.start_reconnect();
                    }
                }
            });

        log::info!("decoder controller initialized");
        controller
    }

    // ── Open / close ─────────────────────────────────────────────────

    pub fn open(self: &Arc<Self>, url: &str, config: Config) -> bool {
        self.cancel_async_open();
        self.stop_reconnect();

        let mut state = self.state.lock().unwrap();
        let result = self.open_internal(&mut state, url, config);
        if result {
            log::info!("opened {url}");
        } else {
            log::error!("failed to open {url}");
        }
        result
    }

    /// Open on a background thread. The callback receives the outcome;
    /// `cancel_async_open` both interrupts the open and closes the
    /// demuxer if it managed to open during the cancellation window.
    pub fn open_async(self: &Arc<Self>, url: &str, config: Config, callback: AsyncOpenCallback) {
        self.cancel_async_open();

        self.async_open_in_progress.store(true, Ordering::Release);
        self.should_cancel_async_open.store(false, Ordering::Release);

        let this = Arc::clone(self);
        let url = url.to_owned();
        let worker = thread::Builder::new()
            .name("rivulet-async-open".into())
            .spawn(move || {
                let (result, success, message) = if this
                    .should_cancel_async_open
                    .load(Ordering::Acquire)
                {
                    (AsyncOpenResult::Cancelled, false, "cancelled before start".to_owned())
                } else {
                    let mut state = this.state.lock().unwrap();
                    let opened = this.open_internal(&mut state, &url, config);
                    if this.should_cancel_async_open.load(Ordering::Acquire) {
                        if opened {
                            drop(state);
                            this.demuxer.close();
                        }
                        (AsyncOpenResult::Cancelled, false, "cancelled during open".to_owned())
                    } else if opened {
                        (AsyncOpenResult::Success, true, String::new())
                    } else {
                        (AsyncOpenResult::Failed, false, "failed to open media".to_owned())
                    }
                };

                callback(result, success, message);
                this.async_open_in_progress.store(false, Ordering::Release);
            })
            .expect("spawn async open");

        *self.async_open_worker.lock().unwrap() = Some(worker);
    }

    pub fn cancel_async_open(&self) {
        if !self.async_open_in_progress.load(Ordering::Acquire) {
            // Still reap a finished worker so the handle does not leak.
            if let Some(handle) = self.async_open_worker.lock().unwrap().take() {
                let _ = handle.join();
            }
            return;
        }
        self.should_cancel_async_open.store(true, Ordering::Release);
        if let Some(handle) = self.async_open_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.should_cancel_async_open.store(false, Ordering::Release);
    }

    pub fn is_async_open_in_progress(&self) -> bool {
        self.async_open_in_progress.load(Ordering::Acquire)
    }

    pub fn close(&self) -> bool {
        self.stop_reconnect();
        self.cancel_async_open();
        self.cleanup_pre_buffer_state();
        self.stop_decode();

        let mut state = self.state.lock().unwrap();
        state.video_decoder = None;
        state.audio_decoder = None;
        drop(state);

        self.demuxer.close()
    }

    // ── Decode lifecycle ─────────────────────────────────────────────

    pub fn start_decode(&self) -> bool {
        self.had_decoders_when_reconnected.store(true, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        self.start_decode_internal(&mut state)
    }

    pub fn stop_decode(&self) -> bool {
        self.had_decoders_when_reconnected.store(false, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        self.stop_decode_internal(&mut state)
    }

    pub fn is_decoding(&self) -> bool {
        self.state.lock().unwrap().is_decoding
    }

    pub fn pause(&self) -> bool {
        let state = self.state.lock().unwrap();
        if let Some(video) = &state.video_decoder {
            video.pause();
        }
        if let Some(audio) = &state.audio_decoder {
            audio.pause();
        }
        self.paused_when_reconnected.store(true, Ordering::Release);
        self.demuxer.pause()
    }

    pub fn resume(&self) -> bool {
        let state = self.state.lock().unwrap();

        // A realtime stream restarts from "now"; the old clock anchors
        // would report seconds of drift on the first frame back.
        if self.demuxer.is_realtime() {
            self.sync.reset_clocks();
        }

        if let Some(video) = &state.video_decoder {
            video.resume();
        }
        if let Some(audio) = &state.audio_decoder {
            audio.resume();
        }
        self.paused_when_reconnected.store(false, Ordering::Release);
        self.demuxer.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.demuxer.is_paused()
    }

    pub fn seek(&self, position: f64) -> bool {
        let state = self.state.lock().unwrap();

        self.emit_seek(EventKind::SeekStarted, position, "seek started");

        if self.demuxer.is_realtime() {
            log::warn!("seek not supported for realtime streams");
            self.emit_seek(EventKind::SeekFailed, position, "seek failed");
            return false;
        }

        if !self.demuxer.seek(position) {
            self.emit_seek(EventKind::SeekFailed, position, "seek failed");
            return false;
        }

        self.sync.reset_clocks();

        if let Some(video) = &state.video_decoder {
            video.frame_queue().clear();
            video.set_seek_pos(position);
        }
        if let Some(audio) = &state.audio_decoder {
            audio.frame_queue().clear();
            audio.set_seek_pos(position);
        }

        // Clocks re-anchor at the target under the post-flush serials,
        // before the first frame of the new serial can publish.
        if state.audio_decoder.is_some() {
            if let Some(queue) = self.demuxer.packet_queue(MediaType::Audio) {
                self.sync.update_audio_clock(position, queue.serial());
            }
        }
        if state.video_decoder.is_some() {
            if let Some(queue) = self.demuxer.packet_queue(MediaType::Video) {
                self.sync.update_video_clock(position, queue.serial());
            }
        }

        self.emit_seek(EventKind::SeekSuccess, position, "seek success");
        log::info!("seek to {position:.3}s completed");
        true
    }

    pub fn set_speed(&self, speed: f64) -> bool {
        if speed <= 0.0 {
            log::error!("invalid speed {speed:.2}");
            return false;
        }
        if self.demuxer.is_realtime() {
            log::warn!("speed control not supported for realtime streams");
            return false;
        }

        let mut state = self.state.lock().unwrap();
        state.config.speed = speed;
        if let Some(video) = &state.video_decoder {
            video.set_speed(speed);
        }
        if let Some(audio) = &state.audio_decoder {
            audio.set_speed(speed);
        }
        self.sync.set_speed(speed);
        log::info!("playback speed set to {speed:.2}x");
        true
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().unwrap().config.speed
    }

    // ── Queues, clocks, stats ────────────────────────────────────────

    pub fn video_queue(&self) -> Option<Arc<FrameQueue<MediaFrame>>> {
        self.state
            .lock()
            .unwrap()
            .video_decoder
            .as_ref()
            .map(|d| d.frame_queue())
    }

    pub fn audio_queue(&self) -> Option<Arc<FrameQueue<MediaFrame>>> {
        self.state
            .lock()
            .unwrap()
            .audio_decoder
            .as_ref()
            .map(|d| d.frame_queue())
    }

    pub fn set_master_clock(&self, master: MasterClock) {
        self.sync.set_master(master);
    }

    pub fn update_external_clock(&self, pts: f64, serial: i32) {
        self.sync.update_external_clock(pts, serial);
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    pub fn sync_quality_stats(&self) -> SyncQualityStats {
        self.sync.quality_stats()
    }

    pub fn video_frame_rate(&self) -> f64 {
        self.state
            .lock()
            .unwrap()
            .video_decoder
            .as_ref()
            .map_or(0.0, |d| d.frame_rate())
    }

    pub fn video_statistics(&self) -> Option<Arc<DecoderStatistics>> {
        self.state
            .lock()
            .unwrap()
            .video_decoder
            .as_ref()
            .map(|d| d.statistics())
    }

    pub fn audio_statistics(&self) -> Option<Arc<DecoderStatistics>> {
        self.state
            .lock()
            .unwrap()
            .audio_decoder
            .as_ref()
            .map(|d| d.statistics())
    }

    pub fn set_frame_rate_control(&self, enable: bool) {
        let mut state = self.state.lock().unwrap();
        state.config.enable_frame_rate_control = enable;
        if let Some(video) = &state.video_decoder {
            video.set_frame_rate_control(enable);
        }
        if let Some(audio) = &state.audio_decoder {
            audio.set_frame_rate_control(enable);
        }
    }

    pub fn is_realtime_url(&self) -> bool {
        self.demuxer.is_realtime()
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.demuxer.duration_secs()
    }

    // ── Looping ──────────────────────────────────────────────────────

    pub fn set_loop_mode(&self, mode: LoopMode) -> bool {
        if self.demuxer.is_realtime() {
            log::warn!("loop mode is not supported for realtime streams");
            return false;
        }
        self.demuxer.set_loop_mode(mode);
        true
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.demuxer.loop_mode()
    }

    pub fn current_loop_count(&self) -> u32 {
        self.demuxer.current_loop_count()
    }

    pub fn reset_loop_count(&self) {
        self.demuxer.reset_loop_count()
    }

    // ── Recording ────────────────────────────────────────────────────

    pub fn start_recording(&self, output_path: &str) -> bool {
        self.demuxer.start_recording(output_path)
    }

    pub fn stop_recording(&self) -> bool {
        self.demuxer.stop_recording()
    }

    pub fn is_recording(&self) -> bool {
        self.demuxer.is_recording()
    }

    pub fn recording_path(&self) -> Option<String> {
        self.demuxer.recording_path()
    }

    // ── Events ───────────────────────────────────────────────────────

    pub fn add_event_listener<F>(&self, kind: EventKind, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.dispatcher.add_listener(kind, callback)
    }

    pub fn add_global_event_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.dispatcher.add_global_listener(callback)
    }

    pub fn remove_event_listener(&self, handle: &ListenerHandle) -> bool {
        self.dispatcher.remove_listener(handle)
    }

    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    // ── Pre-buffer ───────────────────────────────────────────────────

    pub fn pre_buffer_state(&self) -> PreBufferState {
        *self.pre_buffer_state.lock().unwrap()
    }

    pub fn pre_buffer_progress(&self) -> PreBufferProgress {
        self.demuxer.pre_buffer_progress()
    }

    /// Manual unpark for `auto_start_after == false`.
    pub fn start_after_pre_buffer(&self) {
        let state = self.state.lock().unwrap();
        if let Some(video) = &state.video_decoder {
            video.set_waiting_for_pre_buffer(false);
        }
        if let Some(audio) = &state.audio_decoder {
            audio.set_waiting_for_pre_buffer(false);
        }
    }

    // ── Reconnect ────────────────────────────────────────────────────

    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting.load(Ordering::Acquire)
    }

    pub fn stop_reconnect(&self) {
        if !self.is_reconnecting.load(Ordering::Acquire) {
            if let Some(handle) = self.reconnect_worker.lock().unwrap().take() {
                let _ = handle.join();
            }
            return;
        }
        self.should_stop_reconnect.store(true, Ordering::Release);
        if let Some(handle) = self.reconnect_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.is_reconnecting.store(false, Ordering::Release);
        self.should_stop_reconnect.store(false, Ordering::Release);
        self.reconnect_attempt.store(0, Ordering::Release);
    }

    fn start_reconnect(self: &Arc<Self>) {
        if self
            .is_reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.should_stop_reconnect.store(false, Ordering::Release);
        self.reconnect_attempt.store(0, Ordering::Release);

        let mut worker = self.reconnect_worker.lock().unwrap();
        if let Some(old) = worker.take() {
            let _ = old.join();
        }
        let this = Arc::clone(self);
        *worker = Some(
            thread::Builder::new()
                .name("rivulet-reconnect".into())
                .spawn(move || this.reconnect_loop())
                .expect("spawn reconnect"),
        );
    }

    fn reconnect_loop(self: Arc<Self>) {
        let (max_attempts, interval_ms, url) = {
            let state = self.state.lock().unwrap();
            (
                state.config.max_reconnect_attempts,
                state.config.reconnect_interval_ms,
                state.original_url.clone(),
            )
        };

        while !self.should_stop_reconnect.load(Ordering::Acquire) {
            let attempt = self.reconnect_attempt.load(Ordering::Acquire);
            if max_attempts > 0 && attempt >= max_attempts as u32 {
                log::info!("max reconnect attempts ({max_attempts}) reached for {url}");
                break;
            }
            let attempt = self.reconnect_attempt.fetch_add(1, Ordering::AcqRel) + 1;
            log::info!("reconnect attempt {attempt} for {url}");

            if self.attempt_reconnect(&url) {
                log::info!("reconnect successful after {attempt} attempts");
                break;
            }
            log::warn!("reconnect attempt {attempt} failed for {url}");

            // Interval wait in slices so stop_reconnect stays prompt.
            let mut waited = Duration::ZERO;
            while !self.should_stop_reconnect.load(Ordering::Acquire)
                && waited < Duration::from_millis(interval_ms)
            {
                thread::sleep(RECONNECT_POLL);
                waited += RECONNECT_POLL;
            }
        }

        self.is_reconnecting.store(false, Ordering::Release);
        self.reconnect_attempt.store(0, Ordering::Release);
    }

    fn attempt_reconnect(self: &Arc<Self>, url: &str) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            self.stop_decode_internal(&mut state);
            state.video_decoder = None;
            state.audio_decoder = None;
        }
        if !self.demuxer.close() {
            return false;
        }

        thread::sleep(RECONNECT_RELEASE_WAIT);
        if self.should_stop_reconnect.load(Ordering::Acquire) {
            return false;
        }

        let mut state = self.state.lock().unwrap();
        let config = state.config.clone();
        if !self
            .demuxer
            .open(url, &config, Some(self.pre_buffer_callback()), true)
        {
            return false;
        }
        self.create_decoders(&mut state);

        if self.paused_when_reconnected.load(Ordering::Acquire) {
            self.demuxer.pause();
        }
        if self.had_decoders_when_reconnected.load(Ordering::Acquire)
            && !self.start_decode_internal(&mut state)
        {
            log::error!("failed to restart decoders during reconnect");
            return false;
        }
        true
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn open_internal(self: &Arc<Self>, state: &mut ControllerState, url: &str, config: Config) -> bool {
        state.original_url = url.to_owned();
        state.config = config;
        *self.pre_buffer_state.lock().unwrap() = PreBufferState::Disabled;

        if !self
            .demuxer
            .open(url, &state.config, Some(self.pre_buffer_callback()), false)
        {
            return false;
        }

        self.create_decoders(state);
        true
    }

    fn create_decoders(self: &Arc<Self>, state: &mut ControllerState) {
        let is_realtime = self.demuxer.is_realtime();

        state.video_decoder = None;
        state.audio_decoder = None;

        if state.config.decode_media_type.has_video() {
            if let (Some(queue), Some(info)) = (
                self.demuxer.packet_queue(MediaType::Video),
                self.demuxer.stream_info(MediaType::Video),
            ) {
                state.video_decoder = Some(Arc::new(VideoDecoder::new(
                    queue,
                    info,
                    Arc::clone(&self.sync),
                    Arc::clone(&self.dispatcher),
                    is_realtime,
                )));
            }
        }
        if state.config.decode_media_type.has_audio() {
            if let (Some(queue), Some(info)) = (
                self.demuxer.packet_queue(MediaType::Audio),
                self.demuxer.stream_info(MediaType::Audio),
            ) {
                state.audio_decoder = Some(Arc::new(AudioDecoder::new(
                    queue,
                    info,
                    Arc::clone(&self.sync),
                    Arc::clone(&self.dispatcher),
                    is_realtime,
                )));
            }
        }
    }

    fn start_decode_internal(&self, state: &mut ControllerState) -> bool {
        self.sync.reset_clocks();

        if let Some(video) = &state.video_decoder {
            video.init(&state.config);
            if !video.open() {
                log::error!("failed to open video decoder");
                return false;
            }
        }
        if let Some(audio) = &state.audio_decoder {
            audio.init(&state.config);
            if !audio.open() {
                log::error!("failed to open audio decoder");
                return false;
            }
        }

        // Audio leads when present; its clock is steadier than video.
        if state.audio_decoder.is_some() {
            self.sync.set_master(MasterClock::Audio);
        } else if state.video_decoder.is_some() {
            self.sync.set_master(MasterClock::Video);
        }

        if state.config.pre_buffer.enable {
            *self.pre_buffer_state.lock().unwrap() = PreBufferState::WaitingBuffer;
            if let Some(video) = &state.video_decoder {
                video.set_waiting_for_pre_buffer(true);
            }
            if let Some(audio) = &state.audio_decoder {
                audio.set_waiting_for_pre_buffer(true);
            }
            log::info!("decode parked, waiting for pre-buffer");
        }

        if let Some(video) = &state.video_decoder {
            video.start();
        }
        if let Some(audio) = &state.audio_decoder {
            audio.start();
        }

        state.is_decoding = true;
        true
    }

    fn stop_decode_internal(&self, state: &mut ControllerState) -> bool {
        if let Some(video) = &state.video_decoder {
            video.stop();
            video.close();
        }
        if let Some(audio) = &state.audio_decoder {
            audio.stop();
            audio.close();
        }
        state.is_decoding = false;
        true
    }

    fn pre_buffer_callback(self: &Arc<Self>) -> Box<dyn FnOnce() + Send> {
        let weak: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(controller) = weak.upgrade() {
                controller.on_pre_buffer_ready();
            }
        })
    }

    fn on_pre_buffer_ready(&self) {
        *self.pre_buffer_state.lock().unwrap() = PreBufferState::Ready;

        let auto_start = self.state.lock().unwrap().config.pre_buffer.auto_start_after;
        if auto_start {
            self.start_after_pre_buffer();
            log::info!("pre-buffer complete, decoders released");
        } else {
            log::info!("pre-buffer complete, waiting for manual start");
        }
    }

    fn cleanup_pre_buffer_state(&self) {
        *self.pre_buffer_state.lock().unwrap() = PreBufferState::Disabled;
        let state = self.state.lock().unwrap();
        if let Some(video) = &state.video_decoder {
            video.set_waiting_for_pre_buffer(false);
        }
        if let Some(audio) = &state.audio_decoder {
            audio.set_waiting_for_pre_buffer(false);
        }
    }

    fn emit_seek(&self, kind: EventKind, target: f64, description: &str) {
        let event = Event::new(kind, "controller", description).with_payload(EventPayload::Seek {
            position_secs: self.sync.master_clock(),
            target_secs: target,
        });
        self.dispatcher.emit(event, DispatchMode::Queued);
    }
}

impl Drop for DecoderController {
    fn drop(&mut self) {
        // Threads holding Weak references cannot resurrect the
        // controller at this point; tear down in dependency order.
        self.stop_reconnect();
        self.cancel_async_open();
        self.stop_decode();
        self.demuxer.close();
        self.dispatcher.stop_worker();
        log::info!("decoder controller destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn open_failure_returns_false_and_leaves_no_decoders() {
        let controller = DecoderController::new();
        assert!(!controller.open("/nonexistent/rivulet.mp4", Config::default()));
        assert!(controller.video_queue().is_none());
        assert!(controller.audio_queue().is_none());
        assert!(!controller.is_decoding());
        assert!(controller.close());
    }

    #[test]
    fn async_open_reports_failure_through_callback() {
        let controller = DecoderController::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        let calls_cb = Arc::clone(&calls);
        let seen_cb = Arc::clone(&seen);
        controller.open_async(
            "/nonexistent/rivulet.mp4",
            Config::default(),
            Box::new(move |result, success, _message| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
                *seen_cb.lock().unwrap() = Some((result, success));
            }),
        );

        // Join the worker through cancel; the open has already failed
        // so the callback carries Failed, not Cancelled.
        while controller.is_async_open_in_progress() {
            thread::sleep(Duration::from_millis(5));
        }
        controller.cancel_async_open();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (result, success) = seen.lock().unwrap().unwrap();
        assert_eq!(result, AsyncOpenResult::Failed);
        assert!(!success);
    }

    #[test]
    fn speed_rejects_non_positive() {
        let controller = DecoderController::new();
        assert!(!controller.set_speed(0.0));
        assert!(!controller.set_speed(-1.0));
    }

    #[test]
    fn master_clock_is_settable() {
        let controller = DecoderController::new();
        controller.set_master_clock(MasterClock::External);
        controller.update_external_clock(42.0, 0);
        assert!((controller.sync_stats().master_clock - 42.0).abs() < 0.5);
    }
}
