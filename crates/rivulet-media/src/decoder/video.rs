// crates/rivulet-media/src/decoder/video.rs
//
// Video decode worker. Serial-aware loop: a packet-queue serial bump
// (seek, reconnect, realtime resume) flushes the codec, re-arms the
// keyframe gate, and re-anchors the video clock. Decoded frames go
// through the hardware transfer / software conversion pipeline before
// being committed to the frame queue, paced by the frame interval and
// the sync manager's delay decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg::Rational;

use rivulet_core::queue::{FrameQueue, PacketQueue, Timeout};
use rivulet_core::{Config, EventDispatcher, EventKind, MediaType, StreamSyncManager};

use crate::demuxer::StreamInfo;
use crate::frame::MediaFrame;
use crate::helpers::formats::pixel_from_image_format;
use crate::hwaccel::{self, HardwareAccel};
use crate::packet::MediaPacket;

use super::{
    codec_name_for, is_transient, Controls, DecoderEventCtx, DecoderStatistics, FramePacer,
    FRAME_QUEUE_DEFAULT_SIZE, PRE_BUFFER_POLL,
};

const SOURCE: &str = "video decoder";

/// Codec-side state moved into the worker thread. The scaler is
/// rebuilt whenever the incoming geometry or format changes.
struct VideoCore {
    decoder: ffmpeg::decoder::Video,
    accel: Option<Box<dyn HardwareAccel>>,
    scaler: Option<(SwsContext, Pixel, u32, u32)>,
    out_format: Pixel,
    require_sys_mem: bool,
}

unsafe impl Send for VideoCore {}

struct OpenSettings {
    out_format: Pixel,
    require_sys_mem: bool,
    hw_accel: rivulet_core::HwAccelType,
    hw_device_index: i32,
    enable_fallback: bool,
    create_cb: Option<rivulet_core::config::HwContextCallback>,
    free_cb: Option<rivulet_core::config::FreeHwContextCallback>,
}

pub struct VideoDecoder {
    packet_queue: Arc<PacketQueue<MediaPacket>>,
    frame_queue: Arc<FrameQueue<MediaFrame>>,
    stream: StreamInfo,
    sync: Arc<StreamSyncManager>,
    dispatcher: Arc<EventDispatcher>,
    controls: Arc<Controls>,
    stats: Arc<DecoderStatistics>,
    is_realtime: bool,

    settings: Mutex<OpenSettings>,
    opened: Mutex<Option<VideoCore>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    codec_name: Mutex<String>,
    hw_active: AtomicBool,
    frame_rate: Mutex<f64>,
}

impl VideoDecoder {
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
            settings: Mutex::new(OpenSettings {
                out_format: Pixel::YUV420P,
                require_sys_mem: false,
                hw_accel: rivulet_core::HwAccelType::Auto,
                hw_device_index: 0,
                enable_fallback: true,
                create_cb: None,
                free_cb: None,
            }),
            opened: Mutex::new(None),
            worker: Mutex::new(None),
            codec_name: Mutex::new(String::new()),
            hw_active: AtomicBool::new(false),
            frame_rate: Mutex::new(0.0),
        }
    }

    /// Apply the controller configuration. Call before `open`.
    pub fn init(&self, config: &Config) {
        let mut settings = self.settings.lock().unwrap();
        settings.out_format = pixel_from_image_format(config.sw_video_out_format);
        settings.require_sys_mem = config.require_frame_in_system_memory;
        settings.hw_accel = config.hw_accel_type;
        settings.hw_device_index = config.hw_device_index;
        settings.enable_fallback = config.enable_hardware_fallback;
        settings.create_cb = config.create_hw_context_callback.clone();
        settings.free_cb = config.free_hw_context_callback.clone();
        self.controls
            .frame_rate_control
            .store(config.enable_frame_rate_control, Ordering::Release);
        *self.controls.speed.lock().unwrap() = config.speed;
    }

    /// Create and open the codec context, with hardware setup first
    /// when configured.
    pub fn open(&self) -> bool {
        let settings = self.settings.lock().unwrap();
        let codec_name = codec_name_for(&self.stream.parameters);
        *self.codec_name.lock().unwrap() = codec_name.clone();

        let fail = |hw: bool| {
            self.events_with(codec_name.clone(), hw)
                .emit(EventKind::CreateDecoderFailed, "decoder create failed");
        };

        let mut context =
            match ffmpeg::codec::context::Context::from_parameters(self.stream.parameters.clone()) {
                Ok(context) => context,
                Err(err) => {
                    log::error!("video codec context: {err}");
                    fail(false);
                    return false;
                }
            };

        let mut accel = hwaccel::create(
            settings.hw_accel,
            settings.hw_device_index,
            settings.create_cb.as_ref(),
            settings.free_cb.clone(),
        );
        if let Some(active) = &accel {
            if active.setup_decoder(&mut context) {
                log::info!(
                    "using hardware accelerator {} ({})",
                    active.device_name(),
                    active.device_description()
                );
            } else if settings.enable_fallback {
                log::warn!("hardware setup failed, falling back to software decode");
                accel = None;
            } else {
                fail(true);
                return false;
            }
        }
        let hw = accel.is_some();

        let decoder = match context.decoder().video() {
            Ok(decoder) => decoder,
            Err(err) => {
                log::error!("open video decoder {codec_name}: {err}");
                fail(hw);
                return false;
            }
        };

        let rate = f64::from(self.stream.avg_frame_rate);
        if rate.is_finite() && rate > 0.0 {
            *self.frame_rate.lock().unwrap() = rate;
        }

        self.hw_active.store(hw, Ordering::Release);
        *self.opened.lock().unwrap() = Some(VideoCore {
            decoder,
            accel,
            scaler: None,
            out_format: settings.out_format,
            require_sys_mem: settings.require_sys_mem,
        });

        self.stats.reset();
        self.events()
            .emit(EventKind::CreateDecoderSuccess, "decoder created");
        true
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let Some(core) = self.opened.lock().unwrap().take() else {
            log::error!("video decoder start without open");
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
            avg_frame_rate: self.stream.avg_frame_rate,
        };
        *worker = Some(
            thread::Builder::new()
                .name("rivulet-video-dec".into())
                .spawn(move || video_worker(core, ctx))
                .expect("spawn video decoder"),
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
            log::info!("video decoder resumed after pre-buffer");
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

    pub fn frame_rate(&self) -> f64 {
        *self.frame_rate.lock().unwrap()
    }

    pub fn is_hardware_active(&self) -> bool {
        self.hw_active.load(Ordering::Acquire)
    }

    pub fn is_realtime(&self) -> bool {
        self.is_realtime
    }

    fn events(&self) -> DecoderEventCtx {
        self.events_with(
            self.codec_name.lock().unwrap().clone(),
            self.hw_active.load(Ordering::Acquire),
        )
    }

    fn events_with(&self, codec_name: String, hardware_accel: bool) -> DecoderEventCtx {
        DecoderEventCtx {
            dispatcher: Arc::clone(&self.dispatcher),
            codec_name,
            stream_index: self.stream.index as i32,
            media_type: MediaType::Video,
            hardware_accel,
            source: SOURCE,
        }
    }
}

impl Drop for VideoDecoder {
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
    avg_frame_rate: Rational,
}

fn video_worker(mut core: VideoCore, ctx: WorkerCtx) {
    let mut serial = ctx.packet_queue.serial();
    ctx.sync.update_video_clock(0.0, serial);
    ctx.frame_queue.set_serial(serial);

    let mut has_keyframe = false;
    let mut read_first_frame = false;
    let mut occurred_error = false;
    let mut pacer = FramePacer::new();

    let frame_duration = {
        let rate = f64::from(ctx.avg_frame_rate);
        if rate.is_finite() && rate > 0.0 {
            1.0 / rate
        } else {
            0.04
        }
    };

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
            has_keyframe = false;
            ctx.sync.update_video_clock(0.0, serial);
            pacer.reset();
        }

        let Some(reservation) = ctx.frame_queue.begin_write(Timeout::Infinite) else {
            break;
        };

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
            // Drain the codec so buffered B-frames still display.
            let _ = core.decoder.send_eof();
            drop(reservation);
            loop {
                let mut raw = Video::empty();
                match core.decoder.receive_frame(&mut raw) {
                    Ok(()) => {
                        let Some(slot) = ctx.frame_queue.begin_write(Timeout::Infinite) else {
                            break;
                        };
                        deliver_frame(
                            &mut core,
                            &ctx,
                            raw,
                            serial,
                            frame_duration,
                            &mut pacer,
                            &mut read_first_frame,
                            &mut occurred_error,
                            slot,
                        );
                    }
                    Err(_) => break,
                }
            }
            core.decoder.flush();
            continue;
        }

        // Nothing decodes before the first keyframe; feeding the codec
        // mid-GOP yields garbage references.
        if !has_keyframe && !media_packet.is_key() {
            continue;
        }
        has_keyframe = true;

        let Some(packet) = media_packet.into_packet() else { continue };
        if let Err(err) = core.decoder.send_packet(&packet) {
            if !is_transient(&err) {
                handle_decode_error(&mut core, &ctx, &err);
                occurred_error = true;
                continue;
            }
        }

        let mut raw = Video::empty();
        match core.decoder.receive_frame(&mut raw) {
            Ok(()) => {
                deliver_frame(
                    &mut core,
                    &ctx,
                    raw,
                    serial,
                    frame_duration,
                    &mut pacer,
                    &mut read_first_frame,
                    &mut occurred_error,
                    reservation,
                );
            }
            Err(err) if is_transient(&err) => continue,
            Err(err) => {
                handle_decode_error(&mut core, &ctx, &err);
                occurred_error = true;
            }
        }
    }

    ctx.stats.refresh_decode_time();
}

/// Timing, seek filtering, conversion, pacing, publish.
#[allow(clippy::too_many_arguments)]
fn deliver_frame(
    core: &mut VideoCore,
    ctx: &WorkerCtx,
    raw: Video,
    serial: i32,
    frame_duration: f64,
    pacer: &mut FramePacer,
    read_first_frame: &mut bool,
    occurred_error: &mut bool,
    reservation: rivulet_core::queue::WriteReservation<'_, MediaFrame>,
) {
    let pts_units = raw.timestamp().or(raw.pts());
    let pts = pts_units.map(|units| units as f64 * f64::from(ctx.time_base));

    if let Some(pts) = pts {
        ctx.sync.update_video_clock(pts, serial);
    }
    let pts = pts.unwrap_or(f64::NAN);

    // Pre-roll from a keyframe-aligned seek: decode but never publish.
    let seek_pos = ctx.controls.seek_pos();
    if seek_pos > 0.0 && pts.is_finite() && pts < seek_pos {
        return;
    }

    if !*read_first_frame {
        *read_first_frame = true;
        ctx.events.emit(EventKind::DecodeFirstFrame, "first frame decoded");
    }
    if *occurred_error {
        *occurred_error = false;
        ctx.events.emit(EventKind::DecodeRecovery, "decode recovered");
    }

    let Some(converted) = convert_frame(core, ctx, raw) else {
        return;
    };

    let speed = ctx.controls.speed();
    if ctx.controls.frame_rate_control.load(Ordering::Acquire) && pts.is_finite() {
        let base_delay = pacer.base_delay_ms(frame_duration * 1000.0, speed);
        let delay = ctx
            .sync
            .compute_video_delay(pts, frame_duration, base_delay, speed);
        if delay < 0.0 {
            // Sync manager decided this frame is too late to show.
            return;
        }
        if delay > 0.0 {
            thread::sleep(Duration::from_secs_f64(delay / 1000.0));
        }
    }

    let frame = MediaFrame::from_video(converted, serial, pts, frame_duration);
    if reservation.commit(frame) {
        let total = ctx.stats.record_frame();
        if total % 100 == 0 {
            ctx.stats.refresh_decode_time();
        }
    }
}

/// Hardware transfer and pixel conversion per the configured output.
fn convert_frame(core: &mut VideoCore, ctx: &WorkerCtx, raw: Video) -> Option<Video> {
    let is_hardware = unsafe { !(*raw.as_ptr()).hw_frames_ctx.is_null() };

    if is_hardware {
        if !core.require_sys_mem {
            return Some(raw);
        }
        let accel = core.accel.as_ref()?;
        let mut host = Video::empty();
        if !accel.transfer_to_host(&raw, &mut host) {
            ctx.events.emit_error(
                EventKind::DecodeError,
                "hardware frame transfer failed",
                -1,
                "av_hwframe_transfer_data failed".into(),
            );
            return None;
        }
        if host.format() != core.out_format {
            return scale_frame(core, ctx, &host);
        }
        return Some(host);
    }

    if raw.format() != core.out_format {
        return scale_frame(core, ctx, &raw);
    }
    Some(raw)
}

fn scale_frame(core: &mut VideoCore, ctx: &WorkerCtx, input: &Video) -> Option<Video> {
    let (width, height, format) = (input.width(), input.height(), input.format());

    let rebuild = match &core.scaler {
        Some((_, fmt, w, h)) => *fmt != format || *w != width || *h != height,
        None => true,
    };
    if rebuild {
        match SwsContext::get(
            format,
            width,
            height,
            core.out_format,
            width,
            height,
            Flags::BILINEAR,
        ) {
            Ok(scaler) => core.scaler = Some((scaler, format, width, height)),
            Err(err) => {
                ctx.events.emit_error(
                    EventKind::DecodeError,
                    "scaler create failed",
                    -1,
                    err.to_string(),
                );
                return None;
            }
        }
    }

    let (scaler, _, _, _) = core.scaler.as_mut().unwrap();
    let mut output = Video::empty();
    if let Err(err) = scaler.run(input, &mut output) {
        ctx.events
            .emit_error(EventKind::DecodeError, "scale failed", -1, err.to_string());
        return None;
    }
    output.set_pts(input.pts());
    Some(output)
}

fn handle_decode_error(core: &mut VideoCore, ctx: &WorkerCtx, err: &ffmpeg::Error) {
    ctx.stats.record_error();
    log::error!("video decode error: {err}");
    ctx.events
        .emit_error(EventKind::DecodeError, "decode error", -1, err.to_string());
    core.decoder.flush();
    let backoff = ctx.controls.recovery_interval_ms.load(Ordering::Acquire);
    thread::sleep(Duration::from_millis(u64::from(backoff)));
}
