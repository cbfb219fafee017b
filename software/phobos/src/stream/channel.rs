//! Per-channel sample reconstruction from a received stream.
//!
//! Samples are densely bit-packed within each packet's payload and a sample
//! may straddle a packet boundary. Reconstruction starts at the first
//! received packet whose header reports a full first sample (there is no
//! way to locate a sample boundary inside a partial lead-in), walks forward
//! sample by sample, continues split samples into the next received packet,
//! and stops at the first hole rather than fabricate data.

use phobos_shared::header::{HeaderV1, HeaderV2, HEADER_LEN};
use phobos_shared::registers::FirmwareGeneration;

use crate::error::Result;

use super::BoardPlan;

fn first_sample_full(datagram: &[u8], generation: FirmwareGeneration) -> bool {
    match generation {
        FirmwareGeneration::Gen1 => HeaderV1::new(datagram)
            .map(|h| h.first_sample_full())
            .unwrap_or(false),
        FirmwareGeneration::Gen2 => HeaderV2::new(datagram)
            .map(|h| h.first_sample_full())
            .unwrap_or(false),
    }
}

/// Reconstruct one channel's samples from a stream's packet slots.
///
/// Returns the longest contiguous run of samples recoverable from the
/// received packets: leading packets that start mid-sample are skipped, and
/// the run ends at the first missing packet.
pub fn extract(
    board: &BoardPlan,
    slots: &[Option<Vec<u8>>],
    generation: FirmwareGeneration,
    channel: usize,
) -> Result<Vec<u32>> {
    let bit_offset = board.channel_bit_offset(channel)?;
    let bytes_per_sample = board.bytes_per_sample as usize;
    let resolution = board.resolution_bits as usize;
    if bytes_per_sample == 0 || slots.is_empty() {
        return Ok(Vec::new());
    }

    // Find the first packet that starts on a sample boundary
    let start_packet = slots.iter().position(|slot| {
        slot.as_deref()
            .map(|d| first_sample_full(d, generation))
            .unwrap_or(false)
    });
    let Some(start_packet) = start_packet else {
        return Ok(Vec::new());
    };

    let payload =
        |i: usize| -> Option<&[u8]> { slots[i].as_deref().map(|d| &d[HEADER_LEN..]) };

    let mut out = Vec::new();
    let mut packet = start_packet;
    let mut pos = 0usize;
    let mut sample = vec![0u8; bytes_per_sample];

    'walk: loop {
        // Gather one sample's bytes, spilling into following packets as
        // needed. A missing continuation packet ends the walk.
        let mut filled = 0usize;
        while filled < bytes_per_sample {
            if packet >= slots.len() {
                break 'walk;
            }
            let Some(data) = payload(packet) else {
                break 'walk;
            };
            let available = data.len().saturating_sub(pos);
            if available == 0 {
                packet += 1;
                pos = 0;
                continue;
            }
            let take = available.min(bytes_per_sample - filled);
            sample[filled..filled + take].copy_from_slice(&data[pos..pos + take]);
            filled += take;
            pos += take;
        }

        // Extract the channel's bits, most significant first
        let mut value = 0u32;
        for i in 0..resolution {
            let bit = bit_offset + i;
            let byte = sample[bit / 8];
            value = (value << 1) | ((byte >> (7 - (bit % 8))) & 1) as u32;
        }
        out.push(value);
    }

    Ok(out)
}
