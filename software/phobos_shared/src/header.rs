//! Interpreters for the 22-byte header prefixed to every stream datagram.
//!
//! The layout changed between firmware generations, so there is one
//! interpreter per generation. Both are stateless views over borrowed bytes:
//! every accessor is a pure function of the header and nothing is cached or
//! mutated. Callers must pick the interpreter matching the device's
//! firmware generation; nothing in the header itself identifies the layout.

use crate::enum_with_unknown;

/// Length of the header prefixed to every stream datagram
pub const HEADER_LEN: usize = 22;

enum_with_unknown!(
    /// Stream operating mode reported in Gen2 headers
    pub enum StreamMode(u8) {
        Off = 0,
        Continuous = 1,
        Gated = 2,
        Burst = 3,
    }
);

enum_with_unknown!(
    /// Trigger edge type reported in Gen2 headers
    pub enum TriggerEdge(u8) {
        Rising = 0,
        Falling = 1,
        Both = 2,
    }
);

fn read_u16_be(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32_be(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u48_be(bytes: &[u8], offset: usize) -> u64 {
    let mut value = 0u64;
    for b in &bytes[offset..offset + 6] {
        value = (value << 8) | *b as u64;
    }
    value
}

/// Generation-1 stream header view.
///
/// Layout: serial u32 at 0, flag word u16 at 4 (stream id in bits 0-1, UDP
/// test mode in bit 2, first-sample-full in bit 3), packet counter u48 at 8,
/// legacy sample counter u48 at 16.
#[derive(Debug, Clone, Copy)]
pub struct HeaderV1<'a> {
    bytes: &'a [u8],
}

impl<'a> HeaderV1<'a> {
    /// Borrow a datagram's header region. Returns `None` for datagrams
    /// shorter than the header.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(Self { bytes })
    }

    pub fn serial(&self) -> u32 {
        read_u32_be(self.bytes, 0)
    }

    fn flags(&self) -> u16 {
        read_u16_be(self.bytes, 4)
    }

    /// Which of the four streams this packet belongs to, 0-3
    pub fn stream_id(&self) -> u8 {
        (self.flags() & 0b11) as u8
    }

    /// Whether the payload is counter test data rather than ADC samples
    pub fn udp_test_mode(&self) -> bool {
        self.flags() & (1 << 2) != 0
    }

    /// Whether the packet's first byte starts a new sample
    pub fn first_sample_full(&self) -> bool {
        self.flags() & (1 << 3) != 0
    }

    /// Zero-based packet sequence number within the measurement
    pub fn packet_counter(&self) -> u64 {
        read_u48_be(self.bytes, 8)
    }

    /// Free-running sample counter at the start of the packet
    pub fn sample_counter(&self) -> u64 {
        read_u48_be(self.bytes, 16)
    }
}

/// Generation-2 stream header view.
///
/// Keeps the Gen1 serial, stream id, UDP test and packet counter fields,
/// moves the first-sample-full flag to bit 4, and adds burst/trigger
/// metadata: data byte count u16 at 6, burst counter u16 at 14, trigger
/// location u16 at 16 (0 = no trigger in this packet), trigger status u8 at
/// 18, stream mode in flag bits 8-10, trigger edge in flag bits 11-12,
/// dual-SATA in bit 5, burst-start in bit 6.
#[derive(Debug, Clone, Copy)]
pub struct HeaderV2<'a> {
    bytes: &'a [u8],
}

impl<'a> HeaderV2<'a> {
    /// Borrow a datagram's header region. Returns `None` for datagrams
    /// shorter than the header.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(Self { bytes })
    }

    pub fn serial(&self) -> u32 {
        read_u32_be(self.bytes, 0)
    }

    fn flags(&self) -> u16 {
        read_u16_be(self.bytes, 4)
    }

    /// Which of the four streams this packet belongs to, 0-3
    pub fn stream_id(&self) -> u8 {
        (self.flags() & 0b11) as u8
    }

    /// Whether the payload is counter test data rather than ADC samples
    pub fn udp_test_mode(&self) -> bool {
        self.flags() & (1 << 2) != 0
    }

    /// Whether the packet's first byte starts a new sample.
    /// Sits at bit 4 here, not bit 3 as in Gen1.
    pub fn first_sample_full(&self) -> bool {
        self.flags() & (1 << 4) != 0
    }

    /// Whether this board's data is split across two SATA lanes
    pub fn dual_sata(&self) -> bool {
        self.flags() & (1 << 5) != 0
    }

    /// Whether this packet starts a burst
    pub fn burst_start(&self) -> bool {
        self.flags() & (1 << 6) != 0
    }

    pub fn stream_mode(&self) -> StreamMode {
        StreamMode::from(((self.flags() >> 8) & 0b111) as u8)
    }

    pub fn trigger_edge(&self) -> TriggerEdge {
        TriggerEdge::from(((self.flags() >> 11) & 0b11) as u8)
    }

    /// Number of ADC payload bytes in this packet
    pub fn data_bytes(&self) -> u16 {
        read_u16_be(self.bytes, 6)
    }

    /// Zero-based packet sequence number within the measurement
    pub fn packet_counter(&self) -> u64 {
        read_u48_be(self.bytes, 8)
    }

    /// Burst index within the measurement
    pub fn burst_counter(&self) -> u16 {
        read_u16_be(self.bytes, 14)
    }

    /// Byte offset of the trigger event within this packet's payload, or
    /// `None` when no trigger fell in this packet.
    ///
    /// The device reports the offset relative to the start of the full UDP
    /// frame; the header length is subtracted here so the result indexes
    /// into the payload directly.
    pub fn trigger_location(&self) -> Option<u16> {
        let raw = read_u16_be(self.bytes, 16);
        if raw == 0 {
            None
        } else {
            Some(raw.saturating_sub(HEADER_LEN as u16))
        }
    }

    pub fn trigger_status(&self) -> u8 {
        self.bytes[18]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v1_header() -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[..4].copy_from_slice(&0x00C0FFEEu32.to_be_bytes());
        // stream 2, udp test off, first sample full
        h[4..6].copy_from_slice(&0b0000_1010u16.to_be_bytes());
        h[8..14].copy_from_slice(&[0, 0, 0, 0x01, 0x02, 0x03]);
        h[16..22].copy_from_slice(&[0, 0, 0, 0, 0xAB, 0xCD]);
        h
    }

    #[test]
    fn test_v1_fields() {
        let bytes = v1_header();
        let h = HeaderV1::new(&bytes).unwrap();
        assert_eq!(h.serial(), 0x00C0FFEE);
        assert_eq!(h.stream_id(), 2);
        assert!(!h.udp_test_mode());
        assert!(h.first_sample_full());
        assert_eq!(h.packet_counter(), 0x010203);
        assert_eq!(h.sample_counter(), 0xABCD);
    }

    #[test]
    fn test_v2_first_sample_full_moved() {
        let mut bytes = [0u8; HEADER_LEN];
        // Bit 3 set: full for v1, not for v2
        bytes[4..6].copy_from_slice(&0b0000_1000u16.to_be_bytes());
        assert!(HeaderV1::new(&bytes).unwrap().first_sample_full());
        assert!(!HeaderV2::new(&bytes).unwrap().first_sample_full());

        // Bit 4 set: full for v2
        bytes[4..6].copy_from_slice(&0b0001_0000u16.to_be_bytes());
        assert!(HeaderV2::new(&bytes).unwrap().first_sample_full());
    }

    #[test]
    fn test_v2_burst_and_mode_fields() {
        let mut bytes = [0u8; HEADER_LEN];
        let flags: u16 = 0b0001_0001_0110_0001; // burst+dual, mode=Continuous, edge=Both
        bytes[4..6].copy_from_slice(&flags.to_be_bytes());
        bytes[6..8].copy_from_slice(&1440u16.to_be_bytes());
        bytes[14..16].copy_from_slice(&7u16.to_be_bytes());
        bytes[18] = 0x55;

        let h = HeaderV2::new(&bytes).unwrap();
        assert_eq!(h.stream_id(), 1);
        assert!(h.dual_sata());
        assert!(h.burst_start());
        assert_eq!(h.stream_mode(), StreamMode::Continuous);
        assert_eq!(h.trigger_edge(), TriggerEdge::Both);
        assert_eq!(h.data_bytes(), 1440);
        assert_eq!(h.burst_counter(), 7);
        assert_eq!(h.trigger_status(), 0x55);
    }

    #[test]
    fn test_v2_trigger_location_sentinel() {
        let mut bytes = [0u8; HEADER_LEN];
        let h = HeaderV2::new(&bytes).unwrap();
        assert_eq!(h.trigger_location(), None);

        // Offset 30 within the full frame = payload byte 8
        bytes[16..18].copy_from_slice(&30u16.to_be_bytes());
        let h = HeaderV2::new(&bytes).unwrap();
        assert_eq!(h.trigger_location(), Some(8));
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(HeaderV1::new(&[0u8; 21]).is_none());
        assert!(HeaderV2::new(&[0u8; 4]).is_none());
    }
}
