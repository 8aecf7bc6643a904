// crates/rivulet-media/src/decoder/mod.rs
//
// Shared worker scaffolding for the two decoders: run/pause/pre-buffer
// controls, decode statistics, frame pacing, and the decoder event
// helpers. The media-specific loops live in video.rs and audio.rs.

pub mod audio;
pub mod video;

pub use audio::AudioDecoder;
pub use video::VideoDecoder;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ffmpeg_the_third as ffmpeg;

use rivulet_core::{DispatchMode, Event, EventDispatcher, EventKind, EventPayload, MediaType};

/// Backoff after a recoverable codec error, in milliseconds.
pub(crate) const DEFAULT_RECOVERY_INTERVAL_MS: u32 = 3;
pub(crate) const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Poll interval while parked behind the pre-buffer watermark.
pub(crate) const PRE_BUFFER_POLL: Duration = Duration::from_millis(10);
/// Default frame queue depth per decoder.
pub(crate) const FRAME_QUEUE_DEFAULT_SIZE: usize = 3;

/// Decode counters, shared between the worker and the handle.
#[derive(Default)]
pub struct DecoderStatistics {
    frames_decoded: AtomicU64,
    errors_count: AtomicU64,
    total_decode_time_ms: AtomicU64,
    consecutive_errors: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl DecoderStatistics {
    pub fn reset(&self) {
        self.frames_decoded.store(0, Ordering::Release);
        self.errors_count.store(0, Ordering::Release);
        self.total_decode_time_ms.store(0, Ordering::Release);
        self.consecutive_errors.store(0, Ordering::Release);
        *self.started_at.lock().unwrap() = Some(Instant::now());
    }

    /// Count one decoded frame; returns the new total.
    pub(crate) fn record_frame(&self) -> u64 {
        self.consecutive_errors.store(0, Ordering::Release);
        self.frames_decoded.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn record_error(&self) -> u64 {
        self.errors_count.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn refresh_decode_time(&self) {
        if let Some(start) = *self.started_at.lock().unwrap() {
            self.total_decode_time_ms
                .store(start.elapsed().as_millis() as u64, Ordering::Release);
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Acquire)
    }

    pub fn errors_count(&self) -> u64 {
        self.errors_count.load(Ordering::Acquire)
    }

    pub fn total_decode_time_ms(&self) -> u64 {
        self.total_decode_time_ms.load(Ordering::Acquire)
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    /// Average decoded frames per second since the last reset.
    pub fn average_frame_rate(&self) -> f64 {
        let elapsed = self
            .started_at
            .lock()
            .unwrap()
            .map_or(0.0, |s| s.elapsed().as_secs_f64());
        if elapsed > 0.0 {
            self.frames_decoded() as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Control surface shared between a decoder handle and its worker.
pub(crate) struct Controls {
    pub running: AtomicBool,
    pub paused: Mutex<bool>,
    pub pause_cv: Condvar,
    pub waiting_pre_buffer: AtomicBool,
    pub seek_pos: Mutex<f64>,
    pub speed: Mutex<f64>,
    pub frame_rate_control: AtomicBool,
    pub recovery_interval_ms: AtomicU32,
    pub max_consecutive_errors: AtomicU32,
}

impl Controls {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            paused: Mutex::new(false),
            pause_cv: Condvar::new(),
            waiting_pre_buffer: AtomicBool::new(false),
            seek_pos: Mutex::new(0.0),
            speed: Mutex::new(1.0),
            frame_rate_control: AtomicBool::new(true),
            recovery_interval_ms: AtomicU32::new(DEFAULT_RECOVERY_INTERVAL_MS),
            max_consecutive_errors: AtomicU32::new(DEFAULT_MAX_CONSECUTIVE_ERRORS),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn speed(&self) -> f64 {
        *self.speed.lock().unwrap()
    }

    pub fn seek_pos(&self) -> f64 {
        *self.seek_pos.lock().unwrap()
    }

    pub fn set_seek_pos(&self, pos: f64) {
        *self.seek_pos.lock().unwrap() = pos;
    }

    /// Block while paused. Returns false when the worker should exit
    /// instead of resuming; true also reports whether we actually
    /// paused (so the caller can re-anchor its pacer).
    pub fn wait_if_paused(&self) -> (bool, bool) {
        let mut paused = self.paused.lock().unwrap();
        if !*paused {
            return (true, false);
        }
        while *paused && self.is_running() {
            let (guard, _) = self
                .pause_cv
                .wait_timeout(paused, Duration::from_millis(100))
                .unwrap();
            paused = guard;
        }
        (self.is_running(), true)
    }
}

/// Frame pacing against wall time: each frame's theoretical interval is
/// `duration / speed`; the returned delay keeps the cadence without
/// accumulating lag when decode runs behind.
pub(crate) struct FramePacer {
    last: Option<Instant>,
}

impl FramePacer {
    pub fn new() -> Self {
        Self { last: None }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn base_delay_ms(&mut self, duration_ms: f64, speed: f64) -> f64 {
        let speed = if speed > 0.0 { speed } else { 1.0 };
        let now = Instant::now();
        let Some(last) = self.last else {
            self.last = Some(now);
            return 0.0;
        };

        let interval = Duration::from_secs_f64((duration_ms / speed).max(0.0) / 1000.0);
        let next = last + interval;
        let delay_ms = next
            .checked_duration_since(now)
            .map_or(0.0, |d| d.as_secs_f64() * 1000.0);
        self.last = Some(now + Duration::from_secs_f64(delay_ms / 1000.0));
        delay_ms
    }
}

/// Identity carried by every decoder event.
#[derive(Clone)]
pub(crate) struct DecoderEventCtx {
    pub dispatcher: Arc<EventDispatcher>,
    pub codec_name: String,
    pub stream_index: i32,
    pub media_type: MediaType,
    pub hardware_accel: bool,
    pub source: &'static str,
}

impl DecoderEventCtx {
    pub fn emit(&self, kind: EventKind, description: &str) {
        let event = Event::new(kind, self.source, description).with_payload(EventPayload::Decoder {
            codec_name: self.codec_name.clone(),
            stream_index: self.stream_index,
            media_type: self.media_type,
            hardware_accel: self.hardware_accel,
        });
        self.dispatcher.emit(event, DispatchMode::Queued);
    }

    pub fn emit_error(&self, kind: EventKind, description: &str, code: i32, message: String) {
        let event = Event::new(kind, self.source, description)
            .with_error(code, message)
            .with_payload(EventPayload::Decoder {
                codec_name: self.codec_name.clone(),
                stream_index: self.stream_index,
                media_type: self.media_type,
                hardware_accel: self.hardware_accel,
            });
        self.dispatcher.emit(event, DispatchMode::Queued);
    }
}

/// True for the transient decode results that are not errors.
pub(crate) fn is_transient(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Eof)
        || matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
}

/// Codec name for a parameter set, from the codec registry.
pub(crate) fn codec_name_for(parameters: &ffmpeg::codec::Parameters) -> String {
    ffmpeg::decoder::find(parameters.id())
        .map(|codec| codec.name().to_owned())
        .unwrap_or_else(|| format!("{:?}", parameters.id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_first_frame_is_immediate() {
        let mut pacer = FramePacer::new();
        assert_eq!(pacer.base_delay_ms(40.0, 1.0), 0.0);
    }

    #[test]
    fn pacer_spaces_frames_by_interval_over_speed() {
        let mut pacer = FramePacer::new();
        pacer.base_delay_ms(40.0, 2.0);
        // Immediately asking for the next frame: delay close to the
        // 20ms effective interval.
        let delay = pacer.base_delay_ms(40.0, 2.0);
        assert!(delay > 10.0 && delay <= 20.5, "delay {delay}");
    }

    #[test]
    fn pacer_does_not_accumulate_lag() {
        let mut pacer = FramePacer::new();
        pacer.base_delay_ms(10.0, 1.0);
        std::thread::sleep(Duration::from_millis(30));
        // Decode ran late: no delay requested, anchor re-bases to now.
        assert_eq!(pacer.base_delay_ms(10.0, 1.0), 0.0);
        let next = pacer.base_delay_ms(10.0, 1.0);
        assert!(next <= 10.5, "next {next}");
    }

    #[test]
    fn statistics_counters() {
        let stats = DecoderStatistics::default();
        stats.reset();
        assert_eq!(stats.record_frame(), 1);
        assert_eq!(stats.record_frame(), 2);
        stats.record_error();
        assert_eq!(stats.errors_count(), 1);
        assert_eq!(stats.consecutive_errors(), 1);
        stats.record_frame();
        assert_eq!(stats.consecutive_errors(), 0);
        assert_eq!(stats.frames_decoded(), 3);
    }

    #[test]
    fn controls_pause_roundtrip() {
        let controls = Controls::new();
        controls.running.store(true, Ordering::Release);
        let (keep_going, was_paused) = controls.wait_if_paused();
        assert!(keep_going);
        assert!(!was_paused);
    }
}
