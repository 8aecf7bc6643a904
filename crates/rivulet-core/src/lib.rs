// crates/rivulet-core/src/lib.rs

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod queue;
pub mod sync;

pub use clock::{Clock, ClockState, ClockStats};
pub use config::{
    AsyncOpenResult, AudioSampleFormat, Config, DecodeMediaType, HwAccelType, ImageFormat,
    LoopMode, MasterClock, MediaType, PreBufferConfig, PreBufferProgress, PreBufferState,
};
pub use dispatch::{DispatchMode, EventDispatcher, ListenerHandle};
pub use events::{Event, EventKind, EventPayload};
pub use queue::{FrameQueue, PacketQueue, QueueItem, Timeout, WriteReservation};
pub use sync::{StreamSyncManager, SyncQualityStats, SyncState, SyncStats};
