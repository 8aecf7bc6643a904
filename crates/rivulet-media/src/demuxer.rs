// crates/rivulet-media/src/demuxer.rs
//
// Source demuxing. `open` probes the container on the caller thread,
// snapshots per-stream facts, then moves the input context into a
// dedicated reader thread that owns it for the rest of the session.
// Control reaches the reader two ways: atomics + condvar for
// pause/resume and the running flag, and a bounded command channel for
// seek (the reader applies it between reads and replies over a
// one-shot channel).
//
// Seek flushes the packet queues from the caller side first. A reader
// blocked in a full-queue push wakes from that flush, drains the
// command, seeks, and flushes again so anything pushed in between is
// invalidated by the second serial bump.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::media::Type;
use ffmpeg::Rational;

use rivulet_core::queue::{PacketQueue, Timeout};
use rivulet_core::{
    Config, Event, EventDispatcher, EventKind, EventPayload, DispatchMode, LoopMode, MediaType,
    PreBufferProgress,
};

use crate::helpers::url::is_realtime_url;
use crate::packet::MediaPacket;
use crate::recorder::RealTimeStreamRecorder;

const PACKET_QUEUE_DEPTH: usize = 1000;
const READ_ERROR_MAX: u32 = 25;
const READ_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Facts about one elementary stream, snapshotted at open so decoders
/// and the recorder never touch the input context.
pub struct StreamInfo {
    pub index: usize,
    pub media_type: MediaType,
    pub parameters: ffmpeg::codec::Parameters,
    pub time_base: Rational,
    pub avg_frame_rate: Rational,
}

impl Clone for StreamInfo {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            media_type: self.media_type,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
            avg_frame_rate: self.avg_frame_rate,
        }
    }
}

// The cloned codec parameters are plain refcounted data owned by this
// snapshot alone; nothing in it is thread-affine.
unsafe impl Send for StreamInfo {}
unsafe impl Sync for StreamInfo {}

/// Owns the input context inside the reader thread.
struct InputHolder(ffmpeg::format::context::Input);

unsafe impl Send for InputHolder {}

enum ReaderCmd {
    Seek { position: f64, done: Sender<bool> },
}

struct ReaderShared {
    running: AtomicBool,
    paused: Mutex<bool>,
    pause_cv: Condvar,
    seeking: AtomicBool,
}

struct PreBufferShared {
    enabled: AtomicBool,
    ready: AtomicBool,
    video_frames: usize,
    audio_packets: usize,
    require_both: bool,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

struct LoopShared {
    mode: Mutex<LoopMode>,
    count: AtomicU32,
}

struct StreamArm {
    info: StreamInfo,
    queue: Option<Arc<PacketQueue<MediaPacket>>>,
}

struct Session {
    url: String,
    is_realtime: bool,
    duration_secs: Option<i64>,
    video: Option<StreamArm>,
    audio: Option<StreamArm>,
    cmd_tx: Sender<ReaderCmd>,
    reader: Option<thread::JoinHandle<()>>,
    shared: Arc<ReaderShared>,
    pre_buffer: Arc<PreBufferShared>,
}

pub struct Demuxer {
    dispatcher: Arc<EventDispatcher>,
    recorder: Arc<RealTimeStreamRecorder>,
    inner: Mutex<Option<Session>>,
    loop_state: Arc<LoopShared>,
}

impl Demuxer {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            recorder: Arc::new(RealTimeStreamRecorder::new(Arc::clone(&dispatcher))),
            dispatcher,
            inner: Mutex::new(None),
            loop_state: Arc::new(LoopShared {
                mode: Mutex::new(LoopMode::None),
                count: AtomicU32::new(0),
            }),
        }
    }

    /// Open `url` and start the reader thread. `on_pre_buffer_ready`
    /// fires once when the configured watermark is met.
    pub fn open(
        &self,
        url: &str,
        config: &Config,
        on_pre_buffer_ready: Option<Box<dyn FnOnce() + Send>>,
        is_reopen: bool,
    ) -> bool {
        if self.inner.lock().unwrap().is_some() {
            self.close();
        }

        self.emit_stream(EventKind::StreamOpening, url, "stream opening");

        let is_realtime = is_realtime_url(url);

        let mut options = ffmpeg::Dictionary::new();
        options.set("timeout", "2000000");
        options.set("max_delay", "100000");
        options.set("buffer_size", "10000000");
        options.set("analyzeduration", "1000000");
        if is_realtime {
            options.set("rtsp_transport", "tcp");
            options.set("fflags", "nobuffer");
            options.set("stimeout", "2000000");
        }

        let ictx = match open_input_with_options(url, options) {
            Ok(ictx) => ictx,
            Err(err) => {
                log::error!("failed to open input {url}: {err}");
                self.emit_stream_error(EventKind::StreamOpenFailed, url, "stream open failed", &err);
                return false;
            }
        };

        let video_info = ictx.streams().best(Type::Video).map(|s| StreamInfo {
            index: s.index(),
            media_type: MediaType::Video,
            parameters: s.parameters().clone(),
            time_base: s.time_base(),
            avg_frame_rate: s.avg_frame_rate(),
        });
        let audio_info = ictx.streams().best(Type::Audio).map(|s| StreamInfo {
            index: s.index(),
            media_type: MediaType::Audio,
            parameters: s.parameters().clone(),
            time_base: s.time_base(),
            avg_frame_rate: s.avg_frame_rate(),
        });

        if video_info.is_none() && audio_info.is_none() {
            log::error!("no decodable streams in {url}");
            self.emit_stream(EventKind::StreamOpenFailed, url, "no streams found");
            return false;
        }

        // Indexable sources rewind after stream discovery so the first
        // packets are not consumed by probing.
        if !is_realtime {
            unsafe {
                let pb = (*ictx.as_ptr()).pb;
                if !pb.is_null() && (*pb).seekable != 0 {
                    ffi::avio_seek(pb, 0, 0);
                }
            }
        }

        let duration_secs = match ictx.duration() {
            d if d > 0 => Some(d / i64::from(ffi::AV_TIME_BASE)),
            _ => None,
        };

        let make_arm = |info: Option<StreamInfo>, wanted: bool| {
            info.map(|info| StreamArm {
                queue: wanted.then(|| Arc::new(PacketQueue::new(PACKET_QUEUE_DEPTH))),
                info,
            })
        };
        let video = make_arm(video_info, config.decode_media_type.has_video());
        let audio = make_arm(audio_info, config.decode_media_type.has_audio());

        for arm in [&video, &audio].into_iter().flatten() {
            if let Some(queue) = &arm.queue {
                queue.start();
            }
        }

        let pre_buffer = Arc::new(PreBufferShared {
            enabled: AtomicBool::new(
                config.pre_buffer.enable
                    && (config.pre_buffer.video_frames > 0 || config.pre_buffer.audio_packets > 0),
            ),
            ready: AtomicBool::new(false),
            video_frames: config.pre_buffer.video_frames,
            audio_packets: config.pre_buffer.audio_packets,
            require_both: config.pre_buffer.require_both,
            callback: Mutex::new(on_pre_buffer_ready),
        });

        let shared = Arc::new(ReaderShared {
            running: AtomicBool::new(true),
            paused: Mutex::new(false),
            pause_cv: Condvar::new(),
            seeking: AtomicBool::new(false),
        });

        let (cmd_tx, cmd_rx) = bounded(4);
        let reader_ctx = ReaderCtx {
            url: url.to_owned(),
            is_realtime,
            shared: Arc::clone(&shared),
            cmd_rx,
            video_index: video.as_ref().map(|a| a.info.index),
            audio_index: audio.as_ref().map(|a| a.info.index),
            video_queue: video.as_ref().and_then(|a| a.queue.clone()),
            audio_queue: audio.as_ref().and_then(|a| a.queue.clone()),
            dispatcher: Arc::clone(&self.dispatcher),
            recorder: Arc::clone(&self.recorder),
            pre_buffer: Arc::clone(&pre_buffer),
            loop_state: Arc::clone(&self.loop_state),
        };

        let holder = InputHolder(ictx);
        let reader = thread::Builder::new()
            .name("rivulet-demux".into())
            .spawn(move || reader_loop(holder, reader_ctx))
            .expect("spawn demux reader");

        *self.inner.lock().unwrap() = Some(Session {
            url: url.to_owned(),
            is_realtime,
            duration_secs,
            video,
            audio,
            cmd_tx,
            reader: Some(reader),
            shared,
            pre_buffer,
        });

        let mut opened = Event::stream(EventKind::StreamOpened, url, "demuxer", "stream opened");
        opened.payload = EventPayload::Stream { url: url.to_owned(), total_time_secs: duration_secs };
        self.dispatcher.emit(opened, DispatchMode::Queued);

        if is_reopen {
            self.emit_stream(EventKind::StreamReadRecovery, url, "stream recovery");
        }

        log::info!("opened {url} (realtime: {is_realtime})");
        true
    }

    pub fn close(&self) -> bool {
        if self.recorder.is_recording() {
            self.recorder.stop_recording();
        }

        let Some(mut session) = self.inner.lock().unwrap().take() else {
            return true;
        };

        self.emit_stream(EventKind::StreamClose, &session.url, "stream close");

        session.shared.running.store(false, Ordering::Release);
        session.shared.pause_cv.notify_all();
        for arm in [&session.video, &session.audio].into_iter().flatten() {
            if let Some(queue) = &arm.queue {
                queue.abort();
            }
        }
        if let Some(reader) = session.reader.take() {
            let _ = reader.join();
        }

        *session.pre_buffer.callback.lock().unwrap() = None;
        session.pre_buffer.enabled.store(false, Ordering::Release);
        session.pre_buffer.ready.store(false, Ordering::Release);

        self.emit_stream(EventKind::StreamClosed, &session.url, "stream closed");
        log::info!("closed {}", session.url);
        true
    }

    pub fn pause(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.as_ref() else { return false };
        *session.shared.paused.lock().unwrap() = true;
        true
    }

    pub fn resume(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.as_ref() else { return false };

        // Stale realtime packets would replay a burst of old media on
        // resume; drop them before the reader continues distributing.
        if session.is_realtime {
            for arm in [&session.video, &session.audio].into_iter().flatten() {
                if let Some(queue) = &arm.queue {
                    queue.flush();
                }
            }
        }

        *session.shared.paused.lock().unwrap() = false;
        session.shared.pause_cv.notify_all();
        true
    }

    pub fn is_paused(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .as_ref()
            .is_some_and(|s| *s.shared.paused.lock().unwrap())
    }

    /// Seek a file source to `position` seconds. Rejected for realtime
    /// sources and while another seek is in flight.
    pub fn seek(&self, position: f64) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.as_ref() else { return false };
        if session.is_realtime {
            return false;
        }

        if session
            .shared
            .seeking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("seek already in progress, ignoring request to {position:.2}s");
            return false;
        }

        // Unblock a reader stuck in a full-queue push so it can drain
        // the command; the reader flushes again after the seek lands.
        for arm in [&session.video, &session.audio].into_iter().flatten() {
            if let Some(queue) = &arm.queue {
                queue.flush();
            }
        }

        let (done_tx, done_rx) = bounded(1);
        let sent = session
            .cmd_tx
            .send(ReaderCmd::Seek { position, done: done_tx })
            .is_ok();
        let result = sent && done_rx.recv_timeout(Duration::from_secs(2)).unwrap_or(false);

        session.shared.seeking.store(false, Ordering::Release);
        if result {
            log::info!("{} seek to {position:.2}s", session.url);
        } else {
            log::error!("{} seek to {position:.2}s failed", session.url);
        }
        result
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn has_video(&self) -> bool {
        self.inner.lock().unwrap().as_ref().is_some_and(|s| s.video.is_some())
    }

    pub fn has_audio(&self) -> bool {
        self.inner.lock().unwrap().as_ref().is_some_and(|s| s.audio.is_some())
    }

    pub fn is_realtime(&self) -> bool {
        self.inner.lock().unwrap().as_ref().is_some_and(|s| s.is_realtime)
    }

    pub fn url(&self) -> String {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.url.clone())
            .unwrap_or_default()
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.inner.lock().unwrap().as_ref().and_then(|s| s.duration_secs)
    }

    pub fn packet_queue(&self, media_type: MediaType) -> Option<Arc<PacketQueue<MediaPacket>>> {
        let inner = self.inner.lock().unwrap();
        let session = inner.as_ref()?;
        let arm = match media_type {
            MediaType::Video => session.video.as_ref(),
            MediaType::Audio => session.audio.as_ref(),
            MediaType::Unknown => None,
        };
        arm.and_then(|a| a.queue.clone())
    }

    pub fn stream_info(&self, media_type: MediaType) -> Option<StreamInfo> {
        let inner = self.inner.lock().unwrap();
        let session = inner.as_ref()?;
        let arm = match media_type {
            MediaType::Video => session.video.as_ref(),
            MediaType::Audio => session.audio.as_ref(),
            MediaType::Unknown => None,
        };
        arm.map(|a| a.info.clone())
    }

    // ── Pre-buffer ───────────────────────────────────────────────────

    pub fn is_pre_buffer_ready(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.pre_buffer.ready.load(Ordering::Acquire))
    }

    pub fn pre_buffer_progress(&self) -> PreBufferProgress {
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.as_ref() else {
            return PreBufferProgress::default();
        };
        let pb = &session.pre_buffer;

        let mut progress = PreBufferProgress {
            video_required_frames: pb.video_frames,
            audio_required_packets: pb.audio_packets,
            ..Default::default()
        };

        if let Some(queue) = session.video.as_ref().and_then(|a| a.queue.as_ref()) {
            progress.video_buffered_frames = queue.len();
            progress.is_video_ready = progress.video_buffered_frames >= pb.video_frames;
            progress.video_progress = if pb.video_frames > 0 {
                (progress.video_buffered_frames as f64 / pb.video_frames as f64).min(1.0)
            } else {
                1.0
            };
        }
        if let Some(queue) = session.audio.as_ref().and_then(|a| a.queue.as_ref()) {
            progress.audio_buffered_packets = queue.len();
            progress.is_audio_ready = progress.audio_buffered_packets >= pb.audio_packets;
            progress.audio_progress = if pb.audio_packets > 0 {
                (progress.audio_buffered_packets as f64 / pb.audio_packets as f64).min(1.0)
            } else {
                1.0
            };
        }

        progress.is_overall_ready = overall_ready(
            pb.require_both,
            (pb.video_frames > 0).then_some(progress.is_video_ready),
            (pb.audio_packets > 0).then_some(progress.is_audio_ready),
        );
        progress
    }

    // ── Looping ──────────────────────────────────────────────────────

    pub fn set_loop_mode(&self, mode: LoopMode) {
        *self.loop_state.mode.lock().unwrap() = mode;
        if mode == LoopMode::None {
            self.loop_state.count.store(0, Ordering::Release);
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        *self.loop_state.mode.lock().unwrap()
    }

    pub fn current_loop_count(&self) -> u32 {
        self.loop_state.count.load(Ordering::Acquire)
    }

    pub fn reset_loop_count(&self) {
        self.loop_state.count.store(0, Ordering::Release);
    }

    // ── Recording ────────────────────────────────────────────────────

    pub fn start_recording(&self, output_path: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.as_ref() else {
            log::error!("cannot record: no open stream");
            return false;
        };
        if !session.is_realtime {
            log::warn!("recording is only supported for realtime streams");
            return false;
        }
        self.recorder.start_recording(
            output_path,
            session.video.as_ref().map(|a| a.info.clone()),
            session.audio.as_ref().map(|a| a.info.clone()),
        )
    }

    pub fn stop_recording(&self) -> bool {
        self.recorder.stop_recording()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn recording_path(&self) -> Option<String> {
        self.recorder.recording_path()
    }

    // ── Event helpers ────────────────────────────────────────────────

    fn emit_stream(&self, kind: EventKind, url: &str, description: &str) {
        self.dispatcher
            .emit(Event::stream(kind, url, "demuxer", description), DispatchMode::Queued);
    }

    fn emit_stream_error(&self, kind: EventKind, url: &str, description: &str, err: &ffmpeg::Error) {
        let event = Event::stream(kind, url, "demuxer", description)
            .with_error(-1, err.to_string());
        self.dispatcher.emit(event, DispatchMode::Queued);
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Overall readiness over the streams that actually have a watermark
/// configured; an unconfigured pre-buffer counts as ready.
fn overall_ready(require_both: bool, video: Option<bool>, audio: Option<bool>) -> bool {
    let configured: Vec<bool> = [video, audio].into_iter().flatten().collect();
    if configured.is_empty() {
        return true;
    }
    if require_both {
        configured.into_iter().all(|ready| ready)
    } else {
        configured.into_iter().any(|ready| ready)
    }
}

// ── Reader thread ─────────────────────────────────────────────────────

struct ReaderCtx {
    url: String,
    is_realtime: bool,
    shared: Arc<ReaderShared>,
    cmd_rx: Receiver<ReaderCmd>,
    video_index: Option<usize>,
    audio_index: Option<usize>,
    video_queue: Option<Arc<PacketQueue<MediaPacket>>>,
    audio_queue: Option<Arc<PacketQueue<MediaPacket>>>,
    dispatcher: Arc<EventDispatcher>,
    recorder: Arc<RealTimeStreamRecorder>,
    pre_buffer: Arc<PreBufferShared>,
    loop_state: Arc<LoopShared>,
}

impl ReaderCtx {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn is_paused(&self) -> bool {
        *self.shared.paused.lock().unwrap()
    }

    fn emit(&self, kind: EventKind, description: &str) {
        self.dispatcher.emit(
            Event::stream(kind, &self.url, "demuxer", description),
            DispatchMode::Queued,
        );
    }

    fn queues_empty(&self) -> bool {
        self.video_queue.as_ref().map_or(true, |q| q.is_empty())
            && self.audio_queue.as_ref().map_or(true, |q| q.is_empty())
    }

    fn flush_queues(&self) {
        for queue in [&self.video_queue, &self.audio_queue].into_iter().flatten() {
            queue.flush();
        }
    }
}

/// `avformat_open_input` with an options dictionary. The high-level
/// open helpers do not take options, so the context is assembled by
/// hand and wrapped.
fn open_input_with_options(
    url: &str,
    options: ffmpeg::Dictionary,
) -> Result<ffmpeg::format::context::Input, ffmpeg::Error> {
    unsafe {
        let mut ps = ffi::avformat_alloc_context();
        let path = std::ffi::CString::new(url).map_err(|_| ffmpeg::Error::InvalidData)?;
        let mut opts = options.disown();
        let res = ffi::avformat_open_input(&mut ps, path.as_ptr(), std::ptr::null_mut(), &mut opts);
        ffmpeg::Dictionary::own(opts);

        match res {
            0 => match ffi::avformat_find_stream_info(ps, std::ptr::null_mut()) {
                r if r >= 0 => Ok(ffmpeg::format::context::Input::wrap(ps)),
                e => {
                    ffi::avformat_close_input(&mut ps);
                    Err(ffmpeg::Error::from(e))
                }
            },
            e => Err(ffmpeg::Error::from(e)),
        }
    }
}

enum ReadOutcome {
    Packet(ffmpeg::Packet),
    Again,
    Eof,
    Error(i32),
}

fn read_packet(input: &mut ffmpeg::format::context::Input) -> ReadOutcome {
    let mut packet = ffmpeg::Packet::empty();
    let ret = unsafe { ffi::av_read_frame(input.as_mut_ptr(), packet.as_mut_ptr()) };
    if ret >= 0 {
        return ReadOutcome::Packet(packet);
    }

    let at_eof = unsafe {
        let pb = (*input.as_ptr()).pb;
        !pb.is_null() && ffi::avio_feof(pb) != 0
    };
    match ffmpeg::Error::from(ret) {
        ffmpeg::Error::Eof => ReadOutcome::Eof,
        _ if at_eof => ReadOutcome::Eof,
        ffmpeg::Error::Other { errno } if errno == ffmpeg::util::error::EAGAIN => ReadOutcome::Again,
        _ => ReadOutcome::Error(ret),
    }
}

fn reader_loop(mut holder: InputHolder, ctx: ReaderCtx) {
    let mut error_count: u32 = 0;
    let mut read_first = false;
    let mut at_eof = false;
    let mut ended_emitted = false;

    while ctx.running() {
        // File sources stop reading entirely while paused; realtime
        // sources keep draining the socket and drop in distribute().
        if !ctx.is_realtime {
            let mut paused = ctx.shared.paused.lock().unwrap();
            while *paused && ctx.shared.running.load(Ordering::Acquire) {
                let (guard, _) = ctx
                    .shared
                    .pause_cv
                    .wait_timeout(paused, Duration::from_millis(100))
                    .unwrap();
                paused = guard;
            }
            if !ctx.running() {
                break;
            }
        }

        while let Ok(cmd) = ctx.cmd_rx.try_recv() {
            match cmd {
                ReaderCmd::Seek { position, done } => {
                    let ok = perform_seek(&mut holder.0, position, &ctx);
                    at_eof = false;
                    ended_emitted = false;
                    let _ = done.send(ok);
                }
            }
        }

        match read_packet(&mut holder.0) {
            ReadOutcome::Packet(packet) => {
                error_count = 0;
                at_eof = false;
                ended_emitted = false;
                if !read_first {
                    read_first = true;
                    ctx.emit(EventKind::StreamReadData, "stream read data");
                }
                distribute_packet(&ctx, packet);
                check_pre_buffer(&ctx);
            }
            ReadOutcome::Again => {
                thread::sleep(READ_RETRY_SLEEP);
            }
            ReadOutcome::Eof => {
                if ctx.is_realtime {
                    // Live EOF is usually a transient stall; budget it
                    // like any other read failure.
                    error_count += 1;
                    if error_count >= READ_ERROR_MAX {
                        log::error!("{}: {error_count} consecutive EOFs, giving up", ctx.url);
                        ctx.emit(EventKind::StreamReadError, "stream read error");
                        break;
                    }
                    thread::sleep(READ_RETRY_SLEEP);
                } else {
                    if !at_eof {
                        push_eos_sentinels(&ctx);
                        at_eof = true;
                    }
                    if ctx.queues_empty() && !ended_emitted {
                        ended_emitted = true;
                        ctx.emit(EventKind::StreamEnded, "stream ended");
                        if handle_loop_restart(&mut holder.0, &ctx) {
                            at_eof = false;
                            ended_emitted = false;
                            continue;
                        }
                    }
                    thread::sleep(READ_RETRY_SLEEP);
                }
            }
            ReadOutcome::Error(code) => {
                if ctx.is_realtime && ctx.is_paused() {
                    continue;
                }
                error_count += 1;
                if error_count >= READ_ERROR_MAX {
                    log::error!(
                        "{}: {error_count} consecutive read errors (last {code}), giving up",
                        ctx.url
                    );
                    ctx.emit(EventKind::StreamReadError, "stream read error");
                    break;
                }
                thread::sleep(READ_RETRY_SLEEP);
            }
        }
    }
    log::info!("{} demux loop ended", ctx.url);
}

fn perform_seek(input: &mut ffmpeg::format::context::Input, position: f64, ctx: &ReaderCtx) -> bool {
    let target = (position * f64::from(ffi::AV_TIME_BASE)) as i64;
    // Backward range lands on the keyframe at or before the target;
    // decoders discard the pre-roll by pts.
    match input.seek(target, ..=target) {
        Ok(()) => {
            unsafe {
                ffi::avformat_flush(input.as_mut_ptr());
            }
            ctx.flush_queues();
            true
        }
        Err(err) => {
            log::error!("{} seek failed: {err}", ctx.url);
            false
        }
    }
}

fn distribute_packet(ctx: &ReaderCtx, packet: ffmpeg::Packet) {
    let index = packet.stream();
    let paused = ctx.is_paused();
    let recording = ctx.recorder.is_recording();

    let (queue, media_type) = if Some(index) == ctx.video_index {
        (&ctx.video_queue, MediaType::Video)
    } else if Some(index) == ctx.audio_index {
        (&ctx.audio_queue, MediaType::Audio)
    } else {
        return;
    };

    if recording {
        ctx.recorder.write_packet(MediaPacket::new(packet.clone(), 0), media_type);
    }

    // A paused realtime session keeps reading but drops the media;
    // recording above still sees every packet.
    if let (Some(queue), false) = (queue, paused) {
        let item = MediaPacket::new(packet, queue.serial());
        queue.push(item, Timeout::Infinite);
    }
}

fn push_eos_sentinels(ctx: &ReaderCtx) {
    for queue in [&ctx.video_queue, &ctx.audio_queue].into_iter().flatten() {
        queue.push(MediaPacket::end_of_stream(queue.serial()), Timeout::NoWait);
    }
}

fn check_pre_buffer(ctx: &ReaderCtx) {
    let pb = &ctx.pre_buffer;
    if !pb.enabled.load(Ordering::Acquire) || pb.ready.load(Ordering::Acquire) {
        return;
    }

    let video_ready = (pb.video_frames > 0 && ctx.video_queue.is_some())
        .then(|| ctx.video_queue.as_ref().unwrap().len() >= pb.video_frames);
    let audio_ready = (pb.audio_packets > 0 && ctx.audio_queue.is_some())
        .then(|| ctx.audio_queue.as_ref().unwrap().len() >= pb.audio_packets);

    if overall_ready(pb.require_both, video_ready, audio_ready) {
        pb.ready.store(true, Ordering::Release);
        log::info!(
            "pre-buffer ready: video {}/{}, audio {}/{}",
            ctx.video_queue.as_ref().map_or(0, |q| q.len()),
            pb.video_frames,
            ctx.audio_queue.as_ref().map_or(0, |q| q.len()),
            pb.audio_packets
        );
        if let Some(callback) = pb.callback.lock().unwrap().take() {
            callback();
        }
    }
}

fn handle_loop_restart(input: &mut ffmpeg::format::context::Input, ctx: &ReaderCtx) -> bool {
    let mode = *ctx.loop_state.mode.lock().unwrap();
    let current = ctx.loop_state.count.load(Ordering::Acquire);
    let max_loops = match mode {
        LoopMode::None => return false,
        LoopMode::Single(max) => {
            if current >= max {
                return false;
            }
            Some(max)
        }
        LoopMode::Infinite => None,
    };

    if !perform_seek(input, 0.0, ctx) {
        return false;
    }
    unsafe {
        let pb = (*input.as_ptr()).pb;
        if !pb.is_null() && (*pb).seekable != 0 {
            ffi::avio_seek(pb, 0, 0);
        }
    }

    let current = ctx.loop_state.count.fetch_add(1, Ordering::AcqRel) + 1;
    let event = Event::new(EventKind::StreamLooped, "demuxer", "stream looped").with_payload(
        EventPayload::Loop { current_loop: current, max_loops },
    );
    ctx.dispatcher.emit(event, DispatchMode::Queued);
    log::info!("{} looped ({current}/{:?})", ctx.url, max_loops);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_ready_uses_configured_streams_only() {
        // Nothing configured: trivially ready.
        assert!(overall_ready(false, None, None));
        // Only video configured, either-mode: audio's absence is not a
        // free pass.
        assert!(!overall_ready(false, Some(false), None));
        assert!(overall_ready(false, Some(true), None));
        // Both configured, require_both.
        assert!(!overall_ready(true, Some(true), Some(false)));
        assert!(overall_ready(true, Some(true), Some(true)));
        // Both configured, either-mode.
        assert!(overall_ready(false, Some(false), Some(true)));
    }

    #[test]
    fn opening_missing_file_fails_with_event() {
        let dispatcher = EventDispatcher::new();
        let failed = Arc::new(AtomicBool::new(false));
        {
            let failed = Arc::clone(&failed);
            dispatcher.add_listener(EventKind::StreamOpenFailed, move |_| {
                failed.store(true, Ordering::SeqCst);
            });
        }
        let demuxer = Demuxer::new(Arc::clone(&dispatcher));
        assert!(!demuxer.open(
            "/nonexistent/rivulet-test.mp4",
            &Config::default(),
            None,
            false
        ));
        dispatcher.process_queued();
        assert!(failed.load(Ordering::SeqCst));
        assert!(!demuxer.has_video());
        assert!(demuxer.close());
    }

    #[test]
    fn loop_mode_round_trip() {
        let demuxer = Demuxer::new(EventDispatcher::new());
        assert_eq!(demuxer.loop_mode(), LoopMode::None);
        demuxer.set_loop_mode(LoopMode::Single(3));
        assert_eq!(demuxer.loop_mode(), LoopMode::Single(3));
        demuxer.set_loop_mode(LoopMode::None);
        assert_eq!(demuxer.current_loop_count(), 0);
    }
}
