// crates/rivulet-media/src/packet.rs
//
// Serial-stamped coded packet. The serial is assigned by the demuxer
// at enqueue time from the target queue; decoders discard packets
// whose serial no longer matches after a flush or seek.
//
// An end-of-stream sentinel is a MediaPacket with no payload; decoders
// answer it by draining the codec with send_eof.

use ffmpeg_the_third as ffmpeg;

use rivulet_core::queue::QueueItem;

#[derive(Clone)]
pub struct MediaPacket {
    packet: Option<ffmpeg::Packet>,
    serial: i32,
}

impl MediaPacket {
    pub fn new(packet: ffmpeg::Packet, serial: i32) -> Self {
        Self { packet: Some(packet), serial }
    }

    /// Sentinel pushed by the demuxer when a file source hits EOF.
    pub fn end_of_stream(serial: i32) -> Self {
        Self { packet: None, serial }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.packet.is_none()
    }

    pub fn serial(&self) -> i32 {
        self.serial
    }

    pub fn set_serial(&mut self, serial: i32) {
        self.serial = serial;
    }

    pub fn packet(&self) -> Option<&ffmpeg::Packet> {
        self.packet.as_ref()
    }

    pub fn into_packet(self) -> Option<ffmpeg::Packet> {
        self.packet
    }

    pub fn is_key(&self) -> bool {
        self.packet.as_ref().is_some_and(|p| p.is_key())
    }

    pub fn pts(&self) -> Option<i64> {
        self.packet.as_ref().and_then(|p| p.pts())
    }

    pub fn dts(&self) -> Option<i64> {
        self.packet.as_ref().and_then(|p| p.dts())
    }

    pub fn size(&self) -> usize {
        self.packet.as_ref().map_or(0, |p| p.size())
    }
}

impl QueueItem for MediaPacket {
    fn byte_size(&self) -> usize {
        self.size()
    }

    fn duration_units(&self) -> i64 {
        self.packet.as_ref().map_or(0, |p| p.duration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_has_no_payload() {
        let eos = MediaPacket::end_of_stream(3);
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.serial(), 3);
        assert_eq!(eos.size(), 0);
        assert_eq!(eos.duration_units(), 0);
        assert!(!eos.is_key());
        assert!(eos.pts().is_none());
    }

    #[test]
    fn serial_is_mutable_after_construction() {
        let mut eos = MediaPacket::end_of_stream(0);
        eos.set_serial(9);
        assert_eq!(eos.serial(), 9);
    }
}
