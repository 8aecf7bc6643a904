// crates/rivulet-media/src/lib.rs
//
// FFmpeg-facing half of the rivulet workspace: demuxing, decoding,
// hardware acceleration, real-time remux recording, and the controller
// that composes them. Pure types and the sync machinery live in
// rivulet-core.

pub mod controller;
pub mod decoder;
pub mod demuxer;
pub mod frame;
pub mod hwaccel;
pub mod packet;
pub mod recorder;
mod helpers; // internal format/url mapping, not part of the public API

pub use controller::DecoderController;
pub use decoder::{AudioDecoder, DecoderStatistics, VideoDecoder};
pub use demuxer::{Demuxer, StreamInfo};
pub use frame::MediaFrame;
pub use hwaccel::{enumerate_hw_accels, HardwareAccel, HwAccelInfo};
pub use packet::MediaPacket;
pub use recorder::{supported_formats, ContainerFormat, ContainerFormatInfo, RealTimeStreamRecorder};

pub use rivulet_core;
