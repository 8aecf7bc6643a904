// crates/rivulet-core/src/config.rs
//
// Shared plain types: media/format enums and the controller Config.
// Nothing here touches FFmpeg; rivulet-media maps these onto the
// concrete libav types.

/// Media stream kind carried by packets and frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Unknown,
    Video,
    Audio,
}

/// Hardware acceleration backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HwAccelType {
    None,
    #[default]
    Auto,
    Dxva2,
    D3d11va,
    Cuda,
    Vaapi,
    Vdpau,
    Qsv,
    VideoToolbox,
}

impl HwAccelType {
    /// Probe order used when `Auto` is requested.
    pub const AUTO_PRIORITY: [HwAccelType; 7] = [
        HwAccelType::D3d11va,
        HwAccelType::Dxva2,
        HwAccelType::Cuda,
        HwAccelType::Qsv,
        HwAccelType::Vaapi,
        HwAccelType::Vdpau,
        HwAccelType::VideoToolbox,
    ];
}

/// Video pixel layouts the library hands to consumers. The hardware
/// variants describe opaque device surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    Nv12,
    Nv21,
    #[default]
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,

    Dxva2,
    D3d11va,
    Cuda,
    Vaapi,
    Vdpau,
    Qsv,
    VideoToolbox,

    Unknown,
}

impl ImageFormat {
    pub fn is_hardware(self) -> bool {
        matches!(
            self,
            ImageFormat::Dxva2
                | ImageFormat::D3d11va
                | ImageFormat::Cuda
                | ImageFormat::Vaapi
                | ImageFormat::Vdpau
                | ImageFormat::Qsv
                | ImageFormat::VideoToolbox
        )
    }
}

/// Audio sample layouts; `*P` variants are planar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioSampleFormat {
    U8,
    S16,
    S32,
    Flt,
    Dbl,
    U8P,
    S16P,
    S32P,
    FltP,
    DblP,
    S64,
    S64P,
    Unknown,
}

impl AudioSampleFormat {
    pub fn is_planar(self) -> bool {
        matches!(
            self,
            AudioSampleFormat::U8P
                | AudioSampleFormat::S16P
                | AudioSampleFormat::S32P
                | AudioSampleFormat::FltP
                | AudioSampleFormat::DblP
                | AudioSampleFormat::S64P
        )
    }

    /// The packed counterpart of a planar format (identity for packed).
    pub fn packed(self) -> AudioSampleFormat {
        match self {
            AudioSampleFormat::U8P => AudioSampleFormat::U8,
            AudioSampleFormat::S16P => AudioSampleFormat::S16,
            AudioSampleFormat::S32P => AudioSampleFormat::S32,
            AudioSampleFormat::FltP => AudioSampleFormat::Flt,
            AudioSampleFormat::DblP => AudioSampleFormat::Dbl,
            AudioSampleFormat::S64P => AudioSampleFormat::S64,
            other => other,
        }
    }

    /// The planar counterpart of a packed format (identity for planar).
    pub fn planar(self) -> AudioSampleFormat {
        match self {
            AudioSampleFormat::U8 => AudioSampleFormat::U8P,
            AudioSampleFormat::S16 => AudioSampleFormat::S16P,
            AudioSampleFormat::S32 => AudioSampleFormat::S32P,
            AudioSampleFormat::Flt => AudioSampleFormat::FltP,
            AudioSampleFormat::Dbl => AudioSampleFormat::DblP,
            AudioSampleFormat::S64 => AudioSampleFormat::S64P,
            other => other,
        }
    }
}

/// Which timeline sync decisions are made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MasterClock {
    #[default]
    Audio,
    Video,
    External,
}

/// File-source loop behavior. `Single(n)` replays `n` extra times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    None,
    Single(u32),
    Infinite,
}

/// Bit flags selecting which elementary streams get decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeMediaType(pub u8);

impl DecodeMediaType {
    pub const VIDEO: DecodeMediaType = DecodeMediaType(1);
    pub const AUDIO: DecodeMediaType = DecodeMediaType(2);
    pub const ALL: DecodeMediaType = DecodeMediaType(3);

    pub fn has_video(self) -> bool {
        self.0 & Self::VIDEO.0 != 0
    }

    pub fn has_audio(self) -> bool {
        self.0 & Self::AUDIO.0 != 0
    }
}

impl Default for DecodeMediaType {
    fn default() -> Self {
        Self::ALL
    }
}

/// Producer-side watermark gating decoder output.
#[derive(Debug, Clone, Copy)]
pub struct PreBufferConfig {
    pub enable: bool,
    pub video_frames: usize,
    pub audio_packets: usize,
    /// Require both streams to reach their watermark (otherwise either).
    pub require_both: bool,
    /// Unpark the decoders automatically once the watermark fires.
    pub auto_start_after: bool,
}

impl Default for PreBufferConfig {
    fn default() -> Self {
        Self {
            enable: false,
            video_frames: 0,
            audio_packets: 0,
            require_both: false,
            auto_start_after: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreBufferState {
    #[default]
    Disabled,
    WaitingBuffer,
    Ready,
}

/// Pre-buffer fill snapshot, per stream and overall.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreBufferProgress {
    pub video_buffered_frames: usize,
    pub audio_buffered_packets: usize,
    pub video_required_frames: usize,
    pub audio_required_packets: usize,
    pub video_progress: f64,
    pub audio_progress: f64,
    pub is_video_ready: bool,
    pub is_audio_ready: bool,
    pub is_overall_ready: bool,
}

/// Outcome reported by the async-open callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncOpenResult {
    Success,
    Failed,
    Cancelled,
}

/// Controller configuration. Defaults mirror the documented option set.
#[derive(Clone)]
pub struct Config {
    pub enable_frame_rate_control: bool,
    /// Playback speed. Must be > 0; ignored for realtime sources.
    pub speed: f64,
    pub hw_accel_type: HwAccelType,
    pub hw_device_index: i32,
    pub sw_video_out_format: ImageFormat,
    pub require_frame_in_system_memory: bool,
    pub decode_media_type: DecodeMediaType,
    pub enable_hardware_fallback: bool,

    /// Optional foreign hardware device handle supplier. Called once per
    /// decoder creation with the selected backend; returning null lets
    /// the library create its own device.
    pub create_hw_context_callback: Option<HwContextCallback>,
    pub free_hw_context_callback: Option<FreeHwContextCallback>,

    pub enable_auto_reconnect: bool,
    /// <= 0 means unlimited attempts.
    pub max_reconnect_attempts: i32,
    pub reconnect_interval_ms: u64,

    pub pre_buffer: PreBufferConfig,

    /// Deliver audio packed (interleaved) rather than planar.
    pub audio_interleaved: bool,
}

pub type HwContextCallback = std::sync::Arc<dyn Fn(HwAccelType) -> *mut std::ffi::c_void + Send + Sync>;
pub type FreeHwContextCallback =
    std::sync::Arc<dyn Fn(HwAccelType, *mut std::ffi::c_void) + Send + Sync>;

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_frame_rate_control: true,
            speed: 1.0,
            hw_accel_type: HwAccelType::Auto,
            hw_device_index: 0,
            sw_video_out_format: ImageFormat::Yuv420p,
            require_frame_in_system_memory: false,
            decode_media_type: DecodeMediaType::ALL,
            enable_hardware_fallback: true,
            create_hw_context_callback: None,
            free_hw_context_callback: None,
            enable_auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 3000,
            pre_buffer: PreBufferConfig::default(),
            audio_interleaved: true,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("enable_frame_rate_control", &self.enable_frame_rate_control)
            .field("speed", &self.speed)
            .field("hw_accel_type", &self.hw_accel_type)
            .field("hw_device_index", &self.hw_device_index)
            .field("sw_video_out_format", &self.sw_video_out_format)
            .field("require_frame_in_system_memory", &self.require_frame_in_system_memory)
            .field("decode_media_type", &self.decode_media_type)
            .field("enable_hardware_fallback", &self.enable_hardware_fallback)
            .field("enable_auto_reconnect", &self.enable_auto_reconnect)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_interval_ms", &self.reconnect_interval_ms)
            .field("audio_interleaved", &self.audio_interleaved)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_media_type_flags() {
        assert!(DecodeMediaType::ALL.has_video());
        assert!(DecodeMediaType::ALL.has_audio());
        assert!(DecodeMediaType::VIDEO.has_video());
        assert!(!DecodeMediaType::VIDEO.has_audio());
        assert!(!DecodeMediaType::AUDIO.has_video());
    }

    #[test]
    fn sample_format_planar_round_trip() {
        assert_eq!(AudioSampleFormat::S16.planar(), AudioSampleFormat::S16P);
        assert_eq!(AudioSampleFormat::S16P.packed(), AudioSampleFormat::S16);
        assert_eq!(AudioSampleFormat::FltP.packed().planar(), AudioSampleFormat::FltP);
        assert!(AudioSampleFormat::DblP.is_planar());
        assert!(!AudioSampleFormat::S64.is_planar());
    }

    #[test]
    fn hardware_image_formats() {
        assert!(ImageFormat::Cuda.is_hardware());
        assert!(!ImageFormat::Yuv420p.is_hardware());
    }

    #[test]
    fn config_defaults() {
        let cfg = Config::default();
        assert!(cfg.enable_frame_rate_control);
        assert_eq!(cfg.speed, 1.0);
        assert_eq!(cfg.hw_accel_type, HwAccelType::Auto);
        assert_eq!(cfg.sw_video_out_format, ImageFormat::Yuv420p);
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.reconnect_interval_ms, 3000);
        assert!(cfg.audio_interleaved);
    }
}
