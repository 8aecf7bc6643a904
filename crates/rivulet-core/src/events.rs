// crates/rivulet-core/src/events.rs
//
// Event taxonomy and payloads. Kinds carry stable integer codes so
// bindings on top of this library can match on numbers; payloads are a
// tagged enum with a shared header.

use std::time::Instant;

use crate::config::MediaType;

/// Every event the library emits, with its stable wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    // Stream lifecycle
    StreamOpened = 1,
    StreamClosed = 2,
    StreamOpening = 3,
    StreamOpenFailed = 4,
    StreamClose = 5,
    StreamReadData = 6,
    StreamReadError = 7,
    StreamReadRecovery = 8,
    StreamEnded = 9,
    StreamLooped = 10,

    // Decoding
    DecodeStarted = 20,
    DecodeStopped = 21,
    DecodePaused = 22,
    CreateDecoderSuccess = 23,
    CreateDecoderFailed = 24,
    DestroyDecoder = 25,
    DecodeFirstFrame = 26,
    DecodeError = 27,
    DecodeRecovery = 28,

    // Seeking
    SeekStarted = 40,
    SeekSuccess = 41,
    SeekFailed = 42,

    // Recording
    RecordingStarted = 60,
    RecordingStopped = 61,
    RecordingError = 62,
}

impl EventKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// All kinds, for global listener registration and table-driven tests.
    pub fn all() -> &'static [EventKind] {
        use EventKind::*;
        &[
            StreamOpened,
            StreamClosed,
            StreamOpening,
            StreamOpenFailed,
            StreamClose,
            StreamReadData,
            StreamReadError,
            StreamReadRecovery,
            StreamEnded,
            StreamLooped,
            DecodeStarted,
            DecodeStopped,
            DecodePaused,
            CreateDecoderSuccess,
            CreateDecoderFailed,
            DestroyDecoder,
            DecodeFirstFrame,
            DecodeError,
            DecodeRecovery,
            SeekStarted,
            SeekSuccess,
            SeekFailed,
            RecordingStarted,
            RecordingStopped,
            RecordingError,
        ]
    }
}

/// Type-specific event fields.
#[derive(Debug, Clone, Default)]
pub enum EventPayload {
    #[default]
    None,
    Stream {
        url: String,
        /// Total duration in seconds; carried by `StreamOpened` when the
        /// container reports one.
        total_time_secs: Option<i64>,
    },
    Decoder {
        codec_name: String,
        stream_index: i32,
        media_type: MediaType,
        hardware_accel: bool,
    },
    Seek {
        /// Playback position when the seek was issued.
        position_secs: f64,
        target_secs: f64,
    },
    Recording {
        output_path: String,
        format: String,
    },
    Loop {
        current_loop: u32,
        /// None for infinite looping.
        max_loops: Option<u32>,
    },
}

/// One emitted event: common header plus the typed payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: Instant,
    pub source: String,
    pub description: String,
    /// 0 means no error.
    pub error_code: i32,
    pub error_message: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(kind: EventKind, source: &str, description: &str) -> Self {
        Self {
            kind,
            timestamp: Instant::now(),
            source: source.to_owned(),
            description: description.to_owned(),
            error_code: 0,
            error_message: String::new(),
            payload: EventPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_error(mut self, code: i32, message: impl Into<String>) -> Self {
        self.error_code = code;
        self.error_message = message.into();
        self
    }

    /// Shorthand for stream lifecycle events.
    pub fn stream(kind: EventKind, url: &str, source: &str, description: &str) -> Self {
        Self::new(kind, source, description).with_payload(EventPayload::Stream {
            url: url.to_owned(),
            total_time_secs: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EventKind::StreamOpened.code(), 1);
        assert_eq!(EventKind::StreamLooped.code(), 10);
        assert_eq!(EventKind::DecodeStarted.code(), 20);
        assert_eq!(EventKind::DecodeRecovery.code(), 28);
        assert_eq!(EventKind::SeekStarted.code(), 40);
        assert_eq!(EventKind::RecordingStarted.code(), 60);
    }

    #[test]
    fn all_kinds_have_unique_codes() {
        let kinds = EventKind::all();
        let mut codes: Vec<u32> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn event_builder_carries_error() {
        let ev = Event::stream(EventKind::StreamOpenFailed, "rtsp://cam/1", "demuxer", "open failed")
            .with_error(-5, "connection refused");
        assert_eq!(ev.error_code, -5);
        assert_eq!(ev.error_message, "connection refused");
        match ev.payload {
            EventPayload::Stream { ref url, .. } => assert_eq!(url, "rtsp://cam/1"),
            _ => panic!("wrong payload"),
        }
    }
}
