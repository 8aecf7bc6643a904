// crates/rivulet-media/src/recorder.rs
//
// Real-time remux recorder: copies live coded packets into a container
// file without transcoding. The demuxer fans packets into two bounded
// queues; a writer thread drains them, gates everything on the first
// video keyframe, rebases timestamps so the output starts at zero, and
// writes through the interleaving muxer API.
//
// Timestamp rebasing happens in the input stream's time base (offset
// by the first packet seen per media type, floored at zero), then the
// packet is rescaled to the muxer-assigned output time base and DTS is
// clamped to PTS.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::Rational;

use rivulet_core::queue::{PacketQueue, Timeout};
use rivulet_core::{DispatchMode, Event, EventDispatcher, EventKind, EventPayload, MediaType};

use crate::demuxer::StreamInfo;
use crate::packet::MediaPacket;

const RECORD_QUEUE_DEPTH: usize = 1000;

/// Containers the recorder can write, detected from the output
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Mp4,
    Avi,
    Mkv,
    Mov,
    Flv,
    Ts,
    Webm,
    Ogv,
}

pub struct ContainerFormatInfo {
    pub format: ContainerFormat,
    pub extension: &'static str,
    pub description: &'static str,
    pub video_codecs: &'static [&'static str],
    pub audio_codecs: &'static [&'static str],
}

const FORMAT_TABLE: &[ContainerFormatInfo] = &[
    ContainerFormatInfo {
        format: ContainerFormat::Mp4,
        extension: "mp4",
        description: "MPEG-4 Part 14",
        video_codecs: &["h264", "hevc", "mpeg4", "av1"],
        audio_codecs: &["aac", "mp3", "ac3", "eac3", "opus"],
    },
    ContainerFormatInfo {
        format: ContainerFormat::Avi,
        extension: "avi",
        description: "Audio Video Interleave",
        video_codecs: &["h264", "mpeg4", "mjpeg"],
        audio_codecs: &["mp3", "ac3", "pcm_s16le", "pcm_s24le"],
    },
    ContainerFormatInfo {
        format: ContainerFormat::Mkv,
        extension: "mkv",
        description: "Matroska",
        video_codecs: &["h264", "hevc", "vp8", "vp9", "av1"],
        audio_codecs: &["aac", "mp3", "ac3", "opus", "flac"],
    },
    ContainerFormatInfo {
        format: ContainerFormat::Mov,
        extension: "mov",
        description: "QuickTime",
        video_codecs: &["h264", "hevc", "prores"],
        audio_codecs: &["aac", "mp3", "pcm_s16le", "pcm_s24le"],
    },
    ContainerFormatInfo {
        format: ContainerFormat::Flv,
        extension: "flv",
        description: "Flash Video",
        video_codecs: &["h264", "flv1"],
        audio_codecs: &["aac", "mp3"],
    },
    ContainerFormatInfo {
        format: ContainerFormat::Ts,
        extension: "ts",
        description: "MPEG Transport Stream",
        video_codecs: &["h264", "hevc", "mpeg2video"],
        audio_codecs: &["aac", "mp3", "ac3"],
    },
    ContainerFormatInfo {
        format: ContainerFormat::Webm,
        extension: "webm",
        description: "WebM",
        video_codecs: &["vp8", "vp9", "av1"],
        audio_codecs: &["vorbis", "opus"],
    },
    ContainerFormatInfo {
        format: ContainerFormat::Ogv,
        extension: "ogv",
        description: "Ogg Video",
        video_codecs: &["theora", "vp8"],
        audio_codecs: &["vorbis", "opus", "flac"],
    },
];

pub fn supported_formats() -> &'static [ContainerFormatInfo] {
    FORMAT_TABLE
}

fn format_info(format: ContainerFormat) -> &'static ContainerFormatInfo {
    FORMAT_TABLE.iter().find(|info| info.format == format).unwrap()
}

/// Container from the output path's extension, lowercased.
fn detect_container(path: &str) -> Option<ContainerFormat> {
    let extension = Path::new(path)
        .extension()?
        .to_string_lossy()
        .to_ascii_lowercase();
    FORMAT_TABLE
        .iter()
        .find(|info| info.extension == extension)
        .map(|info| info.format)
}

fn codec_name(parameters: &ffmpeg::codec::Parameters) -> String {
    unsafe {
        let raw = ffi::avcodec_get_name(parameters.id().into());
        if raw.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(raw).to_string_lossy().into_owned()
        }
    }
}

/// Shift `ts` so the first packet lands at zero, flooring at zero so a
/// stream whose later packets pre-date the first (B-frame DTS jitter)
/// cannot produce negative output timestamps.
fn rebase_timestamp(ts: Option<i64>, first: i64) -> Option<i64> {
    ts.map(|value| (value - first).max(0))
}

/// DTS must never trail PTS in the output.
fn clamp_dts(pts: Option<i64>, dts: Option<i64>) -> Option<i64> {
    match (pts, dts) {
        (Some(pts), Some(dts)) if dts > pts => Some(pts),
        (_, dts) => dts,
    }
}

struct OutputHolder(ffmpeg::format::context::Output);

unsafe impl Send for OutputHolder {}

/// Per-media-type rebase anchor plus output stream wiring.
struct StreamLane {
    out_index: usize,
    in_time_base: Rational,
    out_time_base: Rational,
    first_pts: Option<i64>,
    first_dts: Option<i64>,
}

struct WriterState {
    octx: OutputHolder,
    video: Option<StreamLane>,
    audio: Option<StreamLane>,
    has_keyframe: bool,
    output_path: String,
}

struct RecordingSession {
    output_path: String,
    format: ContainerFormat,
    writer: Option<thread::JoinHandle<()>>,
}

pub struct RealTimeStreamRecorder {
    dispatcher: Arc<EventDispatcher>,
    video_queue: Arc<PacketQueue<MediaPacket>>,
    audio_queue: Arc<PacketQueue<MediaPacket>>,
    recording: AtomicBool,
    should_stop: Arc<AtomicBool>,
    session: Mutex<Option<RecordingSession>>,
}

impl RealTimeStreamRecorder {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            dispatcher,
            video_queue: Arc::new(PacketQueue::new(RECORD_QUEUE_DEPTH)),
            audio_queue: Arc::new(PacketQueue::new(RECORD_QUEUE_DEPTH)),
            recording: AtomicBool::new(false),
            should_stop: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn recording_path(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.output_path.clone())
    }

    /// Begin remuxing into `output_path`. The stream infos describe the
    /// live input; at least one must be present.
    pub fn start_recording(
        &self,
        output_path: &str,
        video: Option<StreamInfo>,
        audio: Option<StreamInfo>,
    ) -> bool {
        let mut session = self.session.lock().unwrap();
        if self.recording.load(Ordering::Acquire) {
            log::warn!("recording already in progress");
            return false;
        }

        let Some(format) = detect_container(output_path) else {
            log::error!("unsupported container for {output_path}");
            return false;
        };
        let info = format_info(format);

        if video.is_none() && audio.is_none() {
            log::error!("nothing to record: no input streams");
            return false;
        }

        // Pre-flight: warn on codecs outside the container's known set,
        // but keep going; the muxer has the final word.
        if let Some(stream) = &video {
            let name = codec_name(&stream.parameters);
            if !info.video_codecs.contains(&name.as_str()) {
                log::warn!("video codec {name} may not be supported by {}", info.description);
            }
        }
        if let Some(stream) = &audio {
            let name = codec_name(&stream.parameters);
            if !info.audio_codecs.contains(&name.as_str()) {
                log::warn!("audio codec {name} may not be supported by {}", info.description);
            }
        }

        let state = match build_output(output_path, &video, &audio) {
            Ok(state) => state,
            Err(err) => {
                log::error!("recorder output setup failed: {err:#}");
                self.emit(
                    EventKind::RecordingError,
                    output_path,
                    info.extension,
                    "recording setup failed",
                    Some(format!("{err:#}")),
                );
                return false;
            }
        };

        self.video_queue.start();
        self.audio_queue.start();
        self.should_stop.store(false, Ordering::Release);

        let writer_ctx = WriterCtx {
            video_queue: Arc::clone(&self.video_queue),
            audio_queue: Arc::clone(&self.audio_queue),
            should_stop: Arc::clone(&self.should_stop),
            dispatcher: Arc::clone(&self.dispatcher),
            extension: info.extension,
        };
        let writer = thread::Builder::new()
            .name("rivulet-recorder".into())
            .spawn(move || writer_loop(state, writer_ctx))
            .expect("spawn recorder writer");

        *session = Some(RecordingSession {
            output_path: output_path.to_owned(),
            format,
            writer: Some(writer),
        });
        self.recording.store(true, Ordering::Release);

        self.emit(
            EventKind::RecordingStarted,
            output_path,
            info.extension,
            "recording started",
            None,
        );
        log::info!("recording started: {output_path} ({})", info.description);
        true
    }

    pub fn stop_recording(&self) -> bool {
        if !self.recording.load(Ordering::Acquire) {
            return false;
        }

        self.should_stop.store(true, Ordering::Release);
        self.video_queue.abort();
        self.audio_queue.abort();

        let Some(mut session) = self.session.lock().unwrap().take() else {
            return false;
        };
        if let Some(writer) = session.writer.take() {
            let _ = writer.join();
        }

        self.video_queue.flush();
        self.audio_queue.flush();
        self.recording.store(false, Ordering::Release);

        let info = format_info(session.format);
        self.emit(
            EventKind::RecordingStopped,
            &session.output_path,
            info.extension,
            "recording stopped",
            None,
        );
        log::info!("recording stopped: {}", session.output_path);
        true
    }

    /// Route one live packet into the writer queues. Called from the
    /// demuxer reader for every packet while recording.
    pub fn write_packet(&self, packet: MediaPacket, media_type: MediaType) -> bool {
        if !self.recording.load(Ordering::Acquire) || packet.is_end_of_stream() {
            return false;
        }
        match media_type {
            MediaType::Video => self.video_queue.push(packet, Timeout::Infinite),
            MediaType::Audio => self.audio_queue.push(packet, Timeout::Infinite),
            MediaType::Unknown => false,
        }
    }

    fn emit(
        &self,
        kind: EventKind,
        output_path: &str,
        format: &str,
        description: &str,
        error: Option<String>,
    ) {
        let mut event = Event::new(kind, "recorder", description).with_payload(
            EventPayload::Recording {
                output_path: output_path.to_owned(),
                format: format.to_owned(),
            },
        );
        if let Some(message) = error {
            event = event.with_error(-1, message);
        }
        self.dispatcher.emit(event, DispatchMode::Queued);
    }
}

impl Drop for RealTimeStreamRecorder {
    fn drop(&mut self) {
        self.stop_recording();
    }
}

/// Create the output context: auto-detected container, one stream per
/// live input stream with copied codec parameters, header written.
fn build_output(
    output_path: &str,
    video: &Option<StreamInfo>,
    audio: &Option<StreamInfo>,
) -> Result<WriterState> {
    let mut octx = ffmpeg::format::output(&output_path)
        .with_context(|| format!("could not open output '{output_path}'"))?;

    let mut add_lane = |info: &StreamInfo| -> Result<usize> {
        let mut ost = octx
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
            .context("add output stream")?;
        ost.set_parameters(info.parameters.clone());
        // The input's codec tag rarely survives a container change.
        unsafe {
            (*ost.parameters().as_mut_ptr()).codec_tag = 0;
        }
        Ok(ost.index())
    };

    let video_index = video.as_ref().map(&mut add_lane).transpose()?;
    let audio_index = audio.as_ref().map(&mut add_lane).transpose()?;

    octx.write_header().context("write output header")?;

    // Muxer-assigned time bases are only final after write_header.
    let lane = |index: Option<usize>, info: &Option<StreamInfo>| {
        index.and_then(|index| {
            info.as_ref().map(|info| StreamLane {
                out_index: index,
                in_time_base: info.time_base,
                out_time_base: octx.stream(index).unwrap().time_base(),
                first_pts: None,
                first_dts: None,
            })
        })
    };

    Ok(WriterState {
        video: lane(video_index, video),
        audio: lane(audio_index, audio),
        octx: OutputHolder(octx),
        has_keyframe: false,
        output_path: output_path.to_owned(),
    })
}

struct WriterCtx {
    video_queue: Arc<PacketQueue<MediaPacket>>,
    audio_queue: Arc<PacketQueue<MediaPacket>>,
    should_stop: Arc<AtomicBool>,
    dispatcher: Arc<EventDispatcher>,
    extension: &'static str,
}

fn writer_loop(mut state: WriterState, ctx: WriterCtx) {
    while !ctx.should_stop.load(Ordering::Acquire) {
        let mut wrote = false;

        if let Some(packet) = ctx.video_queue.pop(Timeout::Millis(1)) {
            wrote |= process_packet(&mut state, &ctx, packet, MediaType::Video);
        }

        // Audio holds until the first video keyframe is in the file so
        // the recording does not open with sound over no picture. An
        // audio-only input has no gate.
        if state.has_keyframe || state.video.is_none() {
            if let Some(packet) = ctx.audio_queue.pop(Timeout::Millis(1)) {
                wrote |= process_packet(&mut state, &ctx, packet, MediaType::Audio);
            }
        }

        if !wrote {
            thread::sleep(Duration::from_millis(1));
        }
    }

    // Drain whatever the abort left behind, then finalize the file.
    while let Some(packet) = ctx.video_queue.try_pop() {
        process_packet(&mut state, &ctx, packet, MediaType::Video);
    }
    if state.has_keyframe || state.video.is_none() {
        while let Some(packet) = ctx.audio_queue.try_pop() {
            process_packet(&mut state, &ctx, packet, MediaType::Audio);
        }
    }

    if let Err(err) = state.octx.0.write_trailer() {
        log::error!("recorder trailer: {err}");
    }
}

fn process_packet(
    state: &mut WriterState,
    ctx: &WriterCtx,
    media_packet: MediaPacket,
    media_type: MediaType,
) -> bool {
    let Some(mut packet) = media_packet.into_packet() else {
        return false;
    };

    if media_type == MediaType::Video {
        if !state.has_keyframe && !packet.is_key() {
            return false;
        }
        state.has_keyframe = true;
    }

    let lane = match media_type {
        MediaType::Video => state.video.as_mut(),
        MediaType::Audio => state.audio.as_mut(),
        MediaType::Unknown => None,
    };
    let Some(lane) = lane else { return false };

    // First packet of this media type anchors the rebased timeline.
    if lane.first_pts.is_none() {
        let first_pts = packet.pts().unwrap_or(0);
        let first_dts = packet.dts().unwrap_or(first_pts);
        lane.first_pts = Some(first_pts);
        lane.first_dts = Some(first_dts);
        log::debug!(
            "recorder anchor for {:?}: pts {first_pts}, dts {first_dts}",
            media_type
        );
    }

    packet.set_pts(rebase_timestamp(packet.pts(), lane.first_pts.unwrap()));
    packet.set_dts(rebase_timestamp(packet.dts(), lane.first_dts.unwrap()));

    packet.set_stream(lane.out_index);
    packet.rescale_ts(lane.in_time_base, lane.out_time_base);
    packet.set_dts(clamp_dts(packet.pts(), packet.dts()));

    match packet.write_interleaved(&mut state.octx.0) {
        Ok(()) => true,
        Err(err) => {
            log::error!("recorder write failed: {err}");
            let event = Event::new(EventKind::RecordingError, "recorder", "recording write failed")
                .with_error(-1, err.to_string())
                .with_payload(EventPayload::Recording {
                    output_path: state.output_path.clone(),
                    format: ctx.extension.to_owned(),
                });
            ctx.dispatcher.emit(event, DispatchMode::Queued);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_detection_by_extension() {
        assert_eq!(detect_container("/tmp/out.mp4"), Some(ContainerFormat::Mp4));
        assert_eq!(detect_container("/tmp/OUT.MKV"), Some(ContainerFormat::Mkv));
        assert_eq!(detect_container("clip.webm"), Some(ContainerFormat::Webm));
        assert_eq!(detect_container("capture.ts"), Some(ContainerFormat::Ts));
        assert_eq!(detect_container("a.ogv"), Some(ContainerFormat::Ogv));
        assert_eq!(detect_container("a.wav"), None);
        assert_eq!(detect_container("no_extension"), None);
    }

    #[test]
    fn format_table_covers_expected_codecs() {
        let mp4 = format_info(ContainerFormat::Mp4);
        assert!(mp4.video_codecs.contains(&"h264"));
        assert!(mp4.audio_codecs.contains(&"aac"));
        let webm = format_info(ContainerFormat::Webm);
        assert!(!webm.video_codecs.contains(&"h264"));
        assert!(webm.audio_codecs.contains(&"opus"));
    }

    #[test]
    fn rebase_floors_at_zero_and_anchors_first_packet() {
        // First packet: exactly zero after rebasing.
        assert_eq!(rebase_timestamp(Some(9000), 9000), Some(0));
        // Later packets shift by the anchor.
        assert_eq!(rebase_timestamp(Some(12000), 9000), Some(3000));
        // Pre-anchor timestamps clamp instead of going negative.
        assert_eq!(rebase_timestamp(Some(8000), 9000), Some(0));
        // Missing timestamps pass through.
        assert_eq!(rebase_timestamp(None, 9000), None);
    }

    #[test]
    fn dts_never_exceeds_pts() {
        assert_eq!(clamp_dts(Some(100), Some(150)), Some(100));
        assert_eq!(clamp_dts(Some(100), Some(90)), Some(90));
        assert_eq!(clamp_dts(None, Some(90)), Some(90));
        assert_eq!(clamp_dts(Some(100), None), None);
    }

    #[test]
    fn supported_formats_matches_table() {
        assert_eq!(supported_formats().len(), 8);
        assert!(supported_formats()
            .iter()
            .any(|info| info.extension == "flv"));
    }
}
