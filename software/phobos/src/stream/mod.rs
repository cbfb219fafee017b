//! Measurement stream layout: bytes-per-sample math and packet planning.
//!
//! Everything about a measurement's wire layout is computable up front from
//! the enabled-channel masks, the resolution, the sample count, and the
//! link MTU. [`StreamPlan::plan`] does that once per measurement so the
//! receive path can index packets straight into pre-allocated slots and the
//! extraction path can find sample boundaries without re-deriving layout.

pub mod channel;
pub mod receiver;

pub use receiver::{ReceiveProgress, StreamReceiver};

use phobos_shared::header::HEADER_LEN;
use phobos_shared::{CHANNELS_PER_CHIP, CHIPS_PER_BOARD};

use crate::error::{DeviceError, Result};

/// IPv4 header bytes counted against the MTU
const IPV4_HEADER: usize = 20;

/// UDP header bytes counted against the MTU
const UDP_HEADER: usize = 8;

/// Per-board inputs to the plan, read from the board's registers
#[derive(Debug, Clone, Copy)]
pub struct BoardStreamSetup {
    /// Which of the four streams carries this board's data
    pub stream_index: usize,
    /// Channel enable mask per 8-channel chip
    pub chip_masks: [u8; CHIPS_PER_BOARD],
    /// Bits per sample per channel
    pub resolution_bits: u8,
}

/// Planned position of one packet within the sample byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPlan {
    /// Index of the sample whose bytes this packet starts with
    pub first_sample: u64,
    /// Byte offset within that first sample at which the packet begins;
    /// 0 means the packet starts on a sample boundary
    pub first_sample_start_byte: u32,
    /// Index of the sample whose bytes this packet ends with
    pub last_sample: u64,
    /// Exclusive byte offset within that last sample at which the packet
    /// ends; equal to bytes-per-sample when the packet ends on a boundary
    pub last_sample_stop_byte: u32,
}

/// Authoritative wire layout for one board's stream
#[derive(Debug, Clone)]
pub struct BoardPlan {
    pub stream_index: usize,
    pub chip_masks: [u8; CHIPS_PER_BOARD],
    pub resolution_bits: u8,
    /// Whole bytes each chip contributes to one sample
    pub chip_bytes: [u32; CHIPS_PER_BOARD],
    /// Chip bytes summed and rounded up to a 32-bit boundary
    pub bytes_per_sample: u32,
    /// Packets the device will send for the full sample count
    pub expected_packets: usize,
    /// Per-packet layout bookkeeping, `expected_packets` long
    pub slots: Vec<SlotPlan>,
}

/// Wire layout for a whole measurement
#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub sample_count: u64,
    /// 8-byte payload groups per packet
    pub octet: u32,
    /// ADC payload bytes per packet, `octet * 8`
    pub payload_bytes: u32,
    pub boards: Vec<BoardPlan>,
}

/// Whole bytes one chip contributes to a sample: its enabled channel count
/// times the resolution, rounded up to a byte
pub fn chip_sample_bytes(resolution_bits: u8, chip_mask: u8) -> u32 {
    let bits = resolution_bits as u32 * chip_mask.count_ones();
    bits.div_ceil(8)
}

/// A board's bytes per sample: the four chips' byte counts summed and
/// rounded up to a multiple of 4. This rounding only ever adds; a total
/// already on a 32-bit boundary is returned unchanged.
pub fn board_bytes_per_sample(resolution_bits: u8, chip_masks: &[u8; CHIPS_PER_BOARD]) -> u32 {
    let total: u32 = chip_masks
        .iter()
        .map(|&mask| chip_sample_bytes(resolution_bits, mask))
        .sum();
    total.div_ceil(4) * 4
}

/// Payload groups per packet for a link MTU: what remains after the IPv4,
/// UDP, and stream headers, in 8-byte units
pub fn octet_for_mtu(mtu: usize) -> Result<u32> {
    let budget = mtu
        .saturating_sub(IPV4_HEADER + UDP_HEADER + HEADER_LEN)
        / 8;
    if budget < 1 {
        return Err(DeviceError::config(format!(
            "mtu {mtu} leaves no room for stream payload"
        )));
    }
    Ok(budget as u32)
}

impl StreamPlan {
    /// Lay out a measurement of `sample_count` samples over the boards'
    /// current channel masks and resolutions.
    pub fn plan(boards: &[BoardStreamSetup], sample_count: u64, mtu: usize) -> Result<Self> {
        if sample_count == 0 {
            return Err(DeviceError::config("measurement of zero samples"));
        }
        if boards.is_empty() {
            return Err(DeviceError::config("no boards to stream from"));
        }
        let octet = octet_for_mtu(mtu)?;
        let payload_bytes = octet * 8;

        let mut planned = Vec::with_capacity(boards.len());
        for board in boards {
            if board.resolution_bits == 0 || board.resolution_bits > 32 {
                return Err(DeviceError::config(format!(
                    "stream {}: resolution of {} bits is not extractable",
                    board.stream_index, board.resolution_bits
                )));
            }
            if board.stream_index >= 4 {
                return Err(DeviceError::config(format!(
                    "stream index {} out of range",
                    board.stream_index
                )));
            }

            let mut chip_bytes = [0u32; CHIPS_PER_BOARD];
            for (chip, &mask) in board.chip_masks.iter().enumerate() {
                chip_bytes[chip] = chip_sample_bytes(board.resolution_bits, mask);
            }
            let bytes_per_sample = board_bytes_per_sample(board.resolution_bits, &board.chip_masks);

            // A board with every channel disabled sends nothing
            let (expected_packets, slots) = if bytes_per_sample == 0 {
                (0, Vec::new())
            } else {
                let total_bytes = bytes_per_sample as u64 * sample_count;
                let expected = total_bytes.div_ceil(payload_bytes as u64) as usize;
                let mut slots = Vec::with_capacity(expected);
                for k in 0..expected as u64 {
                    let start = k * payload_bytes as u64;
                    let end = (start + payload_bytes as u64).min(total_bytes);
                    slots.push(SlotPlan {
                        first_sample: start / bytes_per_sample as u64,
                        first_sample_start_byte: (start % bytes_per_sample as u64) as u32,
                        last_sample: (end - 1) / bytes_per_sample as u64,
                        last_sample_stop_byte: ((end - 1) % bytes_per_sample as u64) as u32 + 1,
                    });
                }
                (expected, slots)
            };

            planned.push(BoardPlan {
                stream_index: board.stream_index,
                chip_masks: board.chip_masks,
                resolution_bits: board.resolution_bits,
                chip_bytes,
                bytes_per_sample,
                expected_packets,
                slots,
            });
        }

        Ok(Self {
            sample_count,
            octet,
            payload_bytes,
            boards: planned,
        })
    }
}

impl BoardPlan {
    /// Bit offset of a channel's field within one sample, or an error if
    /// the channel is disabled or out of range
    pub fn channel_bit_offset(&self, channel: usize) -> Result<usize> {
        if channel >= CHIPS_PER_BOARD * CHANNELS_PER_CHIP {
            return Err(DeviceError::config(format!(
                "channel {channel} out of range for a 32-channel board"
            )));
        }
        let chip = channel / CHANNELS_PER_CHIP;
        let lane = channel % CHANNELS_PER_CHIP;
        let mask = self.chip_masks[chip];
        if mask & (1 << lane) == 0 {
            return Err(DeviceError::config(format!(
                "channel {channel} is not enabled"
            )));
        }

        let chip_offset_bytes: u32 = self.chip_bytes[..chip].iter().sum();
        let enabled_before = (mask & ((1u8 << lane) - 1)).count_ones() as usize;
        Ok(chip_offset_bytes as usize * 8 + enabled_before * self.resolution_bits as usize)
    }
}
