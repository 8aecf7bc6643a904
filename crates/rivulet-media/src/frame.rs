// crates/rivulet-media/src/frame.rs
//
// Decoded frame carrier handed to consumers through the frame queues.
// Wraps the libav frame (video or audio) and adds the queue serial and
// second-based timing the sync layer works in. Plane data stays in the
// reference-counted libav buffers; cloning is cheap enough for the
// keep-last path.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::frame::{audio, video};

use rivulet_core::{AudioSampleFormat, ImageFormat, MediaType};

use crate::helpers::formats::{audio_format_from_sample, image_format_from_pixel};

#[derive(Clone)]
enum FrameData {
    Video(video::Video),
    Audio(audio::Audio),
}

#[derive(Clone)]
pub struct MediaFrame {
    data: FrameData,
    serial: i32,
    pts_seconds: f64,
    duration_seconds: f64,
}

impl MediaFrame {
    pub fn from_video(frame: video::Video, serial: i32, pts_seconds: f64, duration_seconds: f64) -> Self {
        Self { data: FrameData::Video(frame), serial, pts_seconds, duration_seconds }
    }

    pub fn from_audio(frame: audio::Audio, serial: i32, pts_seconds: f64, duration_seconds: f64) -> Self {
        Self { data: FrameData::Audio(frame), serial, pts_seconds, duration_seconds }
    }

    pub fn media_type(&self) -> MediaType {
        match self.data {
            FrameData::Video(_) => MediaType::Video,
            FrameData::Audio(_) => MediaType::Audio,
        }
    }

    pub fn serial(&self) -> i32 {
        self.serial
    }

    pub fn pts_seconds(&self) -> f64 {
        self.pts_seconds
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    pub fn video(&self) -> Option<&video::Video> {
        match &self.data {
            FrameData::Video(v) => Some(v),
            FrameData::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&audio::Audio> {
        match &self.data {
            FrameData::Audio(a) => Some(a),
            FrameData::Video(_) => None,
        }
    }

    // ── Video accessors ──────────────────────────────────────────────

    pub fn width(&self) -> u32 {
        self.video().map_or(0, |v| v.width())
    }

    pub fn height(&self) -> u32 {
        self.video().map_or(0, |v| v.height())
    }

    pub fn pixel_format(&self) -> ImageFormat {
        self.video()
            .map_or(ImageFormat::Unknown, |v| image_format_from_pixel(v.format()))
    }

    /// True when the frame still lives in device memory.
    pub fn is_hardware(&self) -> bool {
        match &self.data {
            FrameData::Video(v) => unsafe { !(*v.as_ptr()).hw_frames_ctx.is_null() },
            FrameData::Audio(_) => false,
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.video().is_some_and(|v| v.is_key())
    }

    /// Best-effort timestamp in stream time base units.
    pub fn best_effort_timestamp(&self) -> Option<i64> {
        match &self.data {
            FrameData::Video(v) => v.timestamp(),
            FrameData::Audio(a) => a.timestamp(),
        }
    }

    // ── Audio accessors ──────────────────────────────────────────────

    pub fn sample_rate(&self) -> u32 {
        self.audio().map_or(0, |a| a.rate())
    }

    pub fn channels(&self) -> u16 {
        self.audio().map_or(0, |a| a.ch_layout().channels() as u16)
    }

    pub fn sample_format(&self) -> AudioSampleFormat {
        self.audio()
            .map_or(AudioSampleFormat::Unknown, |a| audio_format_from_sample(a.format()))
    }

    pub fn nb_samples(&self) -> usize {
        self.audio().map_or(0, |a| a.samples())
    }

    // ── Plane access ─────────────────────────────────────────────────

    pub fn plane_count(&self) -> usize {
        match &self.data {
            FrameData::Video(v) => v.planes(),
            FrameData::Audio(a) => a.planes(),
        }
    }

    /// Raw bytes of one plane, stride padding included for video.
    pub fn plane_data(&self, index: usize) -> &[u8] {
        match &self.data {
            FrameData::Video(v) => v.data(index),
            FrameData::Audio(a) => a.data(index),
        }
    }

    /// Bytes per row for a video plane; zero for audio.
    pub fn plane_stride(&self, index: usize) -> usize {
        match &self.data {
            FrameData::Video(v) => v.stride(index),
            FrameData::Audio(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg::format::Pixel;

    #[test]
    fn video_frame_reports_geometry_and_type() {
        let raw = video::Video::new(Pixel::YUV420P, 64, 48);
        let frame = MediaFrame::from_video(raw, 2, 1.5, 0.04);
        assert_eq!(frame.media_type(), MediaType::Video);
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
        assert_eq!(frame.pixel_format(), ImageFormat::Yuv420p);
        assert_eq!(frame.serial(), 2);
        assert_eq!(frame.pts_seconds(), 1.5);
        assert_eq!(frame.duration_seconds(), 0.04);
        assert!(!frame.is_hardware());
        assert_eq!(frame.plane_count(), 3);
        assert_eq!(frame.sample_rate(), 0);
    }

    #[test]
    fn yuv420_planes_have_expected_sizes() {
        let raw = video::Video::new(Pixel::YUV420P, 32, 32);
        let frame = MediaFrame::from_video(raw, 0, 0.0, 0.0);
        // Luma plane is at least w*h; chroma strides are half width.
        assert!(frame.plane_data(0).len() >= 32 * 32);
        assert!(frame.plane_stride(0) >= 32);
        assert!(frame.plane_stride(1) >= 16);
    }
}
