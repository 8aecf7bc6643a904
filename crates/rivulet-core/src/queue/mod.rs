// crates/rivulet-core/src/queue/mod.rs
//
// Bounded blocking queues shared between the demuxer, decoders, and
// recorder. Generic over the item type so the core crate stays free of
// FFmpeg types; rivulet-media's packet/frame carriers implement
// `QueueItem`.

mod frame;
mod packet;

pub use frame::{FrameQueue, WriteReservation};
pub use packet::{PacketQueue, PacketQueueStats};

use std::time::Duration;

/// Accounting hooks for queued items. Sizes feed the queue's running
/// byte and duration totals.
pub trait QueueItem {
    fn byte_size(&self) -> usize {
        0
    }
    /// Duration in the item's native time base units.
    fn duration_units(&self) -> i64 {
        0
    }
}

/// Wait behavior for queue operations: negative is wait-forever, zero
/// is try-once, positive waits at most that many milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    NoWait,
    Millis(u64),
}

impl Timeout {
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Millis(ms) => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }
}

impl From<i64> for Timeout {
    fn from(ms: i64) -> Self {
        match ms {
            t if t < 0 => Timeout::Infinite,
            0 => Timeout::NoWait,
            t => Timeout::Millis(t as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_from_millis_convention() {
        assert_eq!(Timeout::from(-1), Timeout::Infinite);
        assert_eq!(Timeout::from(0), Timeout::NoWait);
        assert_eq!(Timeout::from(25), Timeout::Millis(25));
    }
}
