// crates/rivulet-media/src/decoder/audio.rs
//
// Audio decode worker. Shares the serial/pre-buffer/pause scaffolding
// with the video side, plus two audio-only conversions: a speed
// resampler whose output rate is the codec rate scaled by playback
// speed (rebuilt when the speed moves more than 0.01), and a
// planar/interleaved coercion toward the configured layout, with the
// converter cached on its full parameter key so steady-state playback
// never reallocates it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Sample;
use ffmpeg::software::resampling;
use ffmpeg::util::frame::audio::Audio;
use ffmpeg::Rational;

use rivulet_core::queue::{FrameQueue, PacketQueue, Timeout};
use rivulet_core::{Config, EventDispatcher, EventKind, MediaType, StreamSyncManager};

use crate::demuxer::StreamInfo;
use crate::frame::MediaFrame;
use crate::helpers::formats::{sample_is_planar, toggled_interleaving};
use crate::packet::MediaPacket;

use super::{
    codec_name_for, is_transient, Controls, DecoderEventCtx, DecoderStatistics, FramePacer,
    FRAME_QUEUE_DEFAULT_SIZE, PRE_BUFFER_POLL,
};

const SOURCE: &str = "audio decoder";
/// Speed deltas below this do not rebuild the resampler.
const SPEED_EPSILON: f64 = 0.01;

/// Cache key for the layout-coercion resampler. The channel layout
/// mask is part of the key so a mid-stream rearrangement with the same
/// channel count still rebuilds the converter.
#[derive(PartialEq, Clone, Copy)]
struct ConvertKey {
    src: Sample,
    dst: Sample,
    rate: u32,
    channels: u32,
    layout: u64,
}

/// Native-order channel mask of a decoded frame.
fn layout_mask(frame: &Audio) -> u64 {
    unsafe { (*frame.as_ptr()).ch_layout.u.mask }
}

struct AudioCore {
    decoder: ffmpeg::decoder::Audio,
    /// Speed resampler plus the speed it was built for.
    resampler: Option<(resampling::Context, f64)>,
    convert: Option<(ConvertKey, resampling::Context)>,
    interleaved: bool,
}

unsafe impl Send for AudioCore {}

pub struct AudioDecoder {
    packet_queue: Arc<PacketQueue<MediaPacket>>,
    frame_queue: Arc<FrameQueue<MediaFrame>>,
    stream: StreamInfo,
    sync: Arc<StreamSyncManager>,
    dispatcher: Arc<EventDispatcher>,
    controls: Arc<Controls>,
    stats: Arc<DecoderStatistics>,
    is_realtime: bool,

    interleaved: AtomicBool,
    opened: Mutex<Option<AudioCore>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    codec_name: Mutex<String>,
}

impl AudioDecoder {
    pub fn new(
        packet_queue: Arc<PacketQueue<MediaPacket>>,
        stream: StreamInfo,
        sync: Arc<StreamSyncManager>,
        dispatcher: Arc<EventDispatcher>,
        is_realtime: bool,
    ) -> Self {
        Self {
            packet_queue,
            frame_queue: Arc::new(FrameQueue::new(FRAME_QUEUE_DEFAULT_SIZE, false)),
            stream,
            sync,
            dispatcher,
            controls: Arc::new(Controls::new()),
            stats: Arc::new(DecoderStatistics::default()),
            is_realtime,
            interleaved: AtomicBool::new(true),
            opened: Mutex::new(None),
            worker: Mutex::new(None),
            codec_name: Mutex::new(String::new()),
        }
    }

    pub fn init(&self, config: &Config) {
        self.interleaved.store(config.audio_interleaved, Ordering::Release);
        self.controls
            .frame_rate_control
            .store(config.enable_frame_rate_control, Ordering::Release);
        *self.controls.speed.lock().unwrap() = config.speed;
    }

    pub fn open(&self) -> bool {
        let codec_name = codec_name_for(&self.stream.parameters);
        *self.codec_name.lock().unwrap() = codec_name.clone();

        let fail = || {
            self.events().emit(EventKind::CreateDecoderFailed, "decoder create failed");
        };

        let context =
            match ffmpeg::codec::context::Context::from_parameters(self.stream.parameters.clone()) {
                Ok(context) => context,
                Err(err) => {
                    log::error!("audio codec context: {err}");
                    fail();
                    return false;
                }
            };

        let decoder = match context.decoder().audio() {
            Ok(decoder) => decoder,
            Err(err) => {
                log::error!("open audio decoder {codec_name}: {err}");
                fail();
                return false;
            }
        };

        *self.opened.lock().unwrap() = Some(AudioCore {
            decoder,
            resampler: None,
            convert: None,
            interleaved: self.interleaved.load(Ordering::Acquire),
        });

        self.stats.reset();
        self.events().emit(EventKind::CreateDecoderSuccess, "decoder created");
        true
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let Some(core) = self.opened.lock().unwrap().take() else {
            log::error!("audio decoder start without open");
            return;
        };

        self.frame_queue.set_serial(self.packet_queue.serial());
        self.frame_queue.set_abort(self.packet_queue.is_aborted());
        self.controls.set_seek_pos(0.0);
        self.controls.running.store(true, Ordering::Release);

        let ctx = WorkerCtx {
            packet_queue: Arc::clone(&self.packet_queue),
            frame_queue: Arc::clone(&self.frame_queue),
            sync: Arc::clone(&self.sync),
            controls: Arc::clone(&self.controls),
            stats: Arc::clone(&self.stats),
            events: self.events(),
            time_base: self.stream.time_base,
            is_realtime: self.is_realtime,
        };
        *worker = Some(
            thread::Builder::new()
                .name("rivulet-audio-dec".into())
                .spawn(move || audio_worker(core, ctx))
                .expect("spawn audio decoder"),
        );

        self.events().emit(EventKind::DecodeStarted, "decode started");
    }

    pub fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock().unwrap();
            if worker.is_none() {
                return;
            }
            self.controls.running.store(false, Ordering::Release);
            self.frame_queue.set_abort(true);
            self.controls.pause_cv.notify_all();
            worker.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.events().emit(EventKind::DecodeStopped, "decode stopped");
    }

    pub fn close(&self) {
        self.stop();
        self.opened.lock().unwrap().take();
        self.events().emit(EventKind::DestroyDecoder, "decoder destroyed");
    }

    pub fn pause(&self) {
        *self.controls.paused.lock().unwrap() = true;
        self.events().emit(EventKind::DecodePaused, "decode paused");
    }

    pub fn resume(&self) {
        *self.controls.paused.lock().unwrap() = false;
        self.controls.pause_cv.notify_all();
    }

    pub fn set_speed(&self, speed: f64) -> bool {
        if speed <= 0.0 {
            return false;
        }
        {
            let mut current = self.controls.speed.lock().unwrap();
            if (*current - speed).abs() < f64::EPSILON {
                return false;
            }
            *current = speed;
        }
        self.sync.set_speed(speed);
        true
    }

    pub fn speed(&self) -> f64 {
        self.controls.speed()
    }

    pub fn set_seek_pos(&self, pos: f64) {
        self.controls.set_seek_pos(pos);
    }

    pub fn set_frame_rate_control(&self, enable: bool) {
        self.controls.frame_rate_control.store(enable, Ordering::Release);
    }

    pub fn set_waiting_for_pre_buffer(&self, waiting: bool) {
        self.controls.waiting_pre_buffer.store(waiting, Ordering::Release);
        if !waiting {
            log::info!("audio decoder resumed after pre-buffer");
        }
    }

    pub fn set_max_frame_queue_size(&self, size: usize) {
        self.frame_queue.set_max_count(size);
    }

    pub fn frame_queue(&self) -> Arc<FrameQueue<MediaFrame>> {
        Arc::clone(&self.frame_queue)
    }

    pub fn statistics(&self) -> Arc<DecoderStatistics> {
        Arc::clone(&self.stats)
    }

    fn events(&self) -> DecoderEventCtx {
        DecoderEventCtx {
            dispatcher: Arc::clone(&self.dispatcher),
            codec_name: self.codec_name.lock().unwrap().clone(),
            stream_index: self.stream.index as i32,
            media_type: MediaType::Audio,
            hardware_accel: false,
            source: SOURCE,
        }
    }
}

impl Drop for AudioDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Worker ────────────────────────────────────────────────────────────

struct WorkerCtx {
    packet_queue: Arc<PacketQueue<MediaPacket>>,
    frame_queue: Arc<FrameQueue<MediaFrame>>,
    sync: Arc<StreamSyncManager>,
    controls: Arc<Controls>,
    stats: Arc<DecoderStatistics>,
    events: DecoderEventCtx,
    time_base: Rational,
    is_realtime: bool,
}

fn audio_worker(mut core: AudioCore, ctx: WorkerCtx) {
    // Stale audio queued before start would lead the master clock on a
    // live source; begin from fresh packets.
    if ctx.is_realtime {
        ctx.packet_queue.flush();
    }

    let mut serial = ctx.packet_queue.serial();
    ctx.sync.update_audio_clock(0.0, serial);
    ctx.frame_queue.set_serial(serial);

    let mut read_first_frame = false;
    let mut occurred_error = false;
    let mut pacer = FramePacer::new();

    ctx.stats.reset();
    let error_budget = u64::from(ctx.controls.max_consecutive_errors.load(Ordering::Acquire));
    while ctx.controls.is_running() && ctx.stats.consecutive_errors() < error_budget {
        if ctx.controls.waiting_pre_buffer.load(Ordering::Acquire) {
            thread::sleep(PRE_BUFFER_POLL);
            continue;
        }

        let (keep_going, was_paused) = ctx.controls.wait_if_paused();
        if !keep_going {
            break;
        }
        if was_paused {
            pacer.reset();
        }

        let queue_serial = ctx.packet_queue.serial();
        if queue_serial != serial {
            core.decoder.flush();
            serial = queue_serial;
            ctx.frame_queue.set_serial(serial);
            ctx.sync.update_audio_clock(0.0, serial);
            pacer.reset();
        }

        let Some(media_packet) = ctx.packet_queue.pop(Timeout::Millis(1)) else {
            if ctx.packet_queue.is_aborted() {
                break;
            }
            continue;
        };

        if media_packet.serial() != serial {
            continue;
        }

        if media_packet.is_end_of_stream() {
            let _ = core.decoder.send_eof();
            drain_frames(&mut core, &ctx, serial, &mut pacer, &mut read_first_frame, &mut occurred_error);
            core.decoder.flush();
            continue;
        }

        let Some(packet) = media_packet.into_packet() else { continue };
        if let Err(err) = core.decoder.send_packet(&packet) {
            if !is_transient(&err) {
                log::warn!("audio send packet: {err}");
                continue;
            }
        }

        if !drain_frames(&mut core, &ctx, serial, &mut pacer, &mut read_first_frame, &mut occurred_error)
        {
            break;
        }
    }

    ctx.stats.refresh_decode_time();
}

/// Receive every frame the codec has ready. Returns false when the
/// worker should exit (frame queue aborted).
fn drain_frames(
    core: &mut AudioCore,
    ctx: &WorkerCtx,
    serial: i32,
    pacer: &mut FramePacer,
    read_first_frame: &mut bool,
    occurred_error: &mut bool,
) -> bool {
    loop {
        let mut raw = Audio::empty();
        match core.decoder.receive_frame(&mut raw) {
            Ok(()) => {
                if !deliver_frame(core, ctx, raw, serial, pacer, read_first_frame, occurred_error) {
                    return false;
                }
            }
            Err(err) if is_transient(&err) => return true,
            Err(err) => {
                ctx.stats.record_error();
                log::error!("audio decode error: {err}");
                ctx.events
                    .emit_error(EventKind::DecodeError, "decode error", -1, err.to_string());
                core.decoder.flush();
                let backoff = ctx.controls.recovery_interval_ms.load(Ordering::Acquire);
                thread::sleep(Duration::from_millis(u64::from(backoff)));
                *occurred_error = true;
                return true;
            }
        }
    }
}

fn deliver_frame(
    core: &mut AudioCore,
    ctx: &WorkerCtx,
    raw: Audio,
    serial: i32,
    pacer: &mut FramePacer,
    read_first_frame: &mut bool,
    occurred_error: &mut bool,
) -> bool {
    let speed = ctx.controls.speed();
    let input_rate = raw.rate();

    let mut frame = match resample_for_speed(core, ctx, raw, speed) {
        Some(frame) => frame,
        None => return true,
    };

    // Duration uses the effective output rate so a 2x stream still
    // accounts one second of media per second of samples.
    let effective_rate = f64::from(input_rate) * resample_speed(core, speed);
    let duration = if effective_rate > 0.0 {
        frame.samples() as f64 / effective_rate
    } else {
        0.0
    };

    let pts_units = frame.timestamp().or(frame.pts());
    let pts = pts_units.map(|units| units as f64 * f64::from(ctx.time_base));
    if let Some(pts) = pts {
        ctx.sync.update_audio_clock(pts, serial);
    }
    let pts = pts.unwrap_or(f64::NAN);

    // Seek pre-roll: drop silently until the target, then stop
    // filtering so later backward pts (wrap, discontinuity) still play.
    let seek_pos = ctx.controls.seek_pos();
    if seek_pos > 0.0 {
        if pts.is_finite() && pts < seek_pos {
            return true;
        }
        ctx.controls.set_seek_pos(0.0);
    }

    if let Some(coerced) = coerce_interleaving(core, ctx, &frame) {
        frame = coerced;
    }

    if !*read_first_frame {
        *read_first_frame = true;
        ctx.events.emit(EventKind::DecodeFirstFrame, "first frame decoded");
    }
    if *occurred_error {
        *occurred_error = false;
        ctx.events.emit(EventKind::DecodeRecovery, "decode recovered");
    }

    let Some(reservation) = ctx.frame_queue.begin_write(Timeout::Infinite) else {
        return false;
    };

    if ctx.controls.frame_rate_control.load(Ordering::Acquire) && pts.is_finite() {
        let base_delay = pacer.base_delay_ms(duration * 1000.0, speed);
        let delay = ctx.sync.compute_audio_delay(pts, base_delay, speed);
        if delay > 0.0 {
            thread::sleep(Duration::from_secs_f64(delay / 1000.0));
        }
    }

    let media_frame = MediaFrame::from_audio(frame, serial, pts, duration);
    if reservation.commit(media_frame) {
        let total = ctx.stats.record_frame();
        if total % 100 == 0 {
            ctx.stats.refresh_decode_time();
        }
    }
    true
}

/// Effective resample factor: 1.0 while the resampler is bypassed.
fn resample_speed(core: &AudioCore, speed: f64) -> f64 {
    if core.resampler.is_some() {
        speed
    } else {
        1.0
    }
}

/// Resample toward `rate * speed`, preserving format and layout. At
/// speeds within epsilon of 1.0 the frame passes through untouched.
fn resample_for_speed(core: &mut AudioCore, ctx: &WorkerCtx, raw: Audio, speed: f64) -> Option<Audio> {
    if (speed - 1.0).abs() < SPEED_EPSILON {
        core.resampler = None;
        return Some(raw);
    }

    let rebuild = match &core.resampler {
        Some((_, built_for)) => (built_for - speed).abs() > SPEED_EPSILON,
        None => true,
    };
    if rebuild {
        let out_rate = (f64::from(raw.rate()) * speed) as u32;
        match resampling::Context::get2(
            raw.format(),
            raw.ch_layout(),
            raw.rate(),
            raw.format(),
            raw.ch_layout(),
            out_rate,
        ) {
            Ok(resampler) => core.resampler = Some((resampler, speed)),
            Err(err) => {
                log::error!("speed resampler init: {err}");
                ctx.events.emit_error(
                    EventKind::DecodeError,
                    "resampler init failed",
                    -1,
                    err.to_string(),
                );
                core.resampler = None;
                return Some(raw);
            }
        }
    }

    let (resampler, _) = core.resampler.as_mut().unwrap();
    let mut resampled = Audio::empty();
    match resampler.run(&raw, &mut resampled) {
        Ok(_) if resampled.samples() > 0 => {
            resampled.set_pts(raw.pts());
            Some(resampled)
        }
        Ok(_) => None,
        Err(err) => {
            ctx.events
                .emit_error(EventKind::DecodeError, "resample failed", -1, err.to_string());
            None
        }
    }
}

/// Convert between planar and packed layouts when the decoded layout
/// does not match the configured delivery. Same rate in and out, only
/// the sample format changes.
fn coerce_interleaving(core: &mut AudioCore, ctx: &WorkerCtx, frame: &Audio) -> Option<Audio> {
    let format = frame.format();
    let is_planar = sample_is_planar(format);
    let mismatch = (core.interleaved && is_planar) || (!core.interleaved && !is_planar);
    if !mismatch {
        return None;
    }

    let target = toggled_interleaving(format);
    if target == format || target == Sample::None {
        return None;
    }

    let key = ConvertKey {
        src: format,
        dst: target,
        rate: frame.rate(),
        channels: frame.ch_layout().channels() as u32,
        layout: layout_mask(frame),
    };
    let rebuild = match &core.convert {
        Some((cached, _)) => *cached != key,
        None => true,
    };
    if rebuild {
        match resampling::Context::get2(
            format,
            frame.ch_layout(),
            frame.rate(),
            target,
            frame.ch_layout(),
            frame.rate(),
        ) {
            Ok(converter) => core.convert = Some((key, converter)),
            Err(err) => {
                log::warn!("interleave converter init: {err}");
                return None;
            }
        }
    }

    let (_, converter) = core.convert.as_mut().unwrap();
    let mut converted = Audio::empty();
    match converter.run(frame, &mut converted) {
        Ok(_) if converted.samples() > 0 => {
            converted.set_pts(frame.pts());
            Some(converted)
        }
        _ => {
            log::warn!("interleave conversion produced no samples");
            ctx.events.emit_error(
                EventKind::DecodeError,
                "interleave conversion failed",
                -1,
                "swr_convert produced no samples".into(),
            );
            None
        }
    }
}
