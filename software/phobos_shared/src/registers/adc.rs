//! Register map for the ADC boards.
//!
//! Each ADC board carries four 8-channel chips and exposes one flat register
//! block at its PDI card address. The first byte is the board version code;
//! its high nibble is the presence marker checked during discovery.

use super::{BitField, ByteOrder, RegisterDescriptor};

/// Bytes to fetch for a full ADC board dump
pub const ADC_BLOCK_LENGTH: u16 = 0x40;

/// ADC-board registers. Offsets are relative to the board's register base.
pub struct AdcRegisters {
    /// Board type marker (high nibble) and hardware revision (low nibble)
    pub board_version: RegisterDescriptor,
    /// Microcontroller firmware version, main*100 + sub
    pub mc_version: RegisterDescriptor,
    /// Board serial number
    pub serial: RegisterDescriptor,
    /// PLL lock flags
    pub status: RegisterDescriptor,
    /// Overload and LED flags
    pub fault: RegisterDescriptor,
    /// Board temperature in whole degrees C
    pub temperature: RegisterDescriptor,
    /// Operating control bits, including the clock sync toggle
    pub control: RegisterDescriptor,
    /// Bits per sample: 8, 12, or 14
    pub resolution: RegisterDescriptor,
    /// SATA ring buffer size in samples
    pub ring_buffer_size: RegisterDescriptor,
    /// Overload comparator level
    pub overload_level: RegisterDescriptor,
    /// Per-chip channel enable masks, chip 0 first
    pub channel_enable: [RegisterDescriptor; 4],
    /// Per-chip pairs of FIR/IIR filter coefficients
    pub filter_coeff: [RegisterDescriptor; 8],
}

// Status bits
pub const ADC_BASE_PLL_LOCK: BitField = BitField::new("base_pll_lock", 0, 0, "ADC base PLL locked");
pub const ADC_SATA1_PLL_LOCK: BitField = BitField::new("sata1_pll_lock", 1, 1, "SATA lane 1 PLL locked");
pub const ADC_SATA2_PLL_LOCK: BitField = BitField::new("sata2_pll_lock", 2, 2, "SATA lane 2 PLL locked");

// Fault bits
pub const ADC_OVERLOAD: BitField = BitField::new("overload", 0, 0, "Analog input overload latched");

// Control bits
pub const ADC_SATA_ON: BitField = BitField::new("sata_on", 0, 0, "Enable the SATA transmitter");
pub const ADC_DUAL_SATA: BitField = BitField::new("dual_sata", 1, 1, "Use both SATA lanes");
pub const ADC_SYNC: BitField = BitField::new(
    "adc_sync",
    2,
    2,
    "Toggle 1-then-0 to resynchronize the chip sampling clocks",
);
pub const ADC_TEST_PATTERN: BitField =
    BitField::new("test_pattern", 3, 3, "Emit a fixed test pattern instead of samples");
pub const ADC_FILTER_ON: BitField = BitField::new("filter_on", 4, 4, "Enable the digital filter chain");
pub const ADC_REVERSE_BITORD: BitField =
    BitField::new("reverse_bitord", 5, 5, "Reverse sample bit order on the wire");

pub static ADC_GEN1: AdcRegisters = AdcRegisters {
    board_version: RegisterDescriptor::plain("board_version", 0x00, 1, ByteOrder::Big, false),
    mc_version: RegisterDescriptor::plain("mc_version", 0x01, 2, ByteOrder::Big, false),
    serial: RegisterDescriptor::plain("serial", 0x03, 2, ByteOrder::Big, false),
    status: RegisterDescriptor::with_bits(
        "status",
        0x05,
        1,
        ByteOrder::Big,
        &[ADC_BASE_PLL_LOCK, ADC_SATA1_PLL_LOCK, ADC_SATA2_PLL_LOCK],
    ),
    fault: RegisterDescriptor::with_bits("fault", 0x06, 1, ByteOrder::Big, &[ADC_OVERLOAD]),
    temperature: RegisterDescriptor::plain("temperature", 0x07, 1, ByteOrder::Big, true),
    control: RegisterDescriptor::with_bits(
        "control",
        0x08,
        1,
        ByteOrder::Big,
        &[
            ADC_SATA_ON,
            ADC_DUAL_SATA,
            ADC_SYNC,
            ADC_TEST_PATTERN,
            ADC_FILTER_ON,
            ADC_REVERSE_BITORD,
        ],
    ),
    resolution: RegisterDescriptor::plain("resolution", 0x09, 1, ByteOrder::Big, false),
    ring_buffer_size: RegisterDescriptor::plain("ring_buffer_size", 0x0A, 2, ByteOrder::Big, false),
    overload_level: RegisterDescriptor::plain("overload_level", 0x20, 2, ByteOrder::Big, false),
    channel_enable: [
        RegisterDescriptor::plain("channel_enable_1", 0x0C, 1, ByteOrder::Big, false),
        RegisterDescriptor::plain("channel_enable_2", 0x0D, 1, ByteOrder::Big, false),
        RegisterDescriptor::plain("channel_enable_3", 0x0E, 1, ByteOrder::Big, false),
        RegisterDescriptor::plain("channel_enable_4", 0x0F, 1, ByteOrder::Big, false),
    ],
    filter_coeff: [
        RegisterDescriptor::plain("filter_coeff_1", 0x10, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_2", 0x12, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_3", 0x14, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_4", 0x16, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_5", 0x18, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_6", 0x1A, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_7", 0x1C, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_8", 0x1E, 2, ByteOrder::Big, false),
    ],
};

// Gen2 widens the temperature register to a two-byte tenth-of-a-degree
// count, shifting the rest of the map down accordingly.
pub static ADC_GEN2: AdcRegisters = AdcRegisters {
    board_version: RegisterDescriptor::plain("board_version", 0x00, 1, ByteOrder::Big, false),
    mc_version: RegisterDescriptor::plain("mc_version", 0x01, 2, ByteOrder::Big, false),
    serial: RegisterDescriptor::plain("serial", 0x03, 2, ByteOrder::Big, false),
    status: RegisterDescriptor::with_bits(
        "status",
        0x05,
        1,
        ByteOrder::Big,
        &[ADC_BASE_PLL_LOCK, ADC_SATA1_PLL_LOCK, ADC_SATA2_PLL_LOCK],
    ),
    fault: RegisterDescriptor::with_bits("fault", 0x06, 1, ByteOrder::Big, &[ADC_OVERLOAD]),
    temperature: RegisterDescriptor::plain("temperature", 0x07, 2, ByteOrder::Big, true),
    control: RegisterDescriptor::with_bits(
        "control",
        0x0A,
        1,
        ByteOrder::Big,
        &[
            ADC_SATA_ON,
            ADC_DUAL_SATA,
            ADC_SYNC,
            ADC_TEST_PATTERN,
            ADC_FILTER_ON,
            ADC_REVERSE_BITORD,
        ],
    ),
    resolution: RegisterDescriptor::plain("resolution", 0x0B, 1, ByteOrder::Big, false),
    ring_buffer_size: RegisterDescriptor::plain("ring_buffer_size", 0x0C, 2, ByteOrder::Big, false),
    overload_level: RegisterDescriptor::plain("overload_level", 0x22, 2, ByteOrder::Big, false),
    channel_enable: [
        RegisterDescriptor::plain("channel_enable_1", 0x0E, 1, ByteOrder::Big, false),
        RegisterDescriptor::plain("channel_enable_2", 0x0F, 1, ByteOrder::Big, false),
        RegisterDescriptor::plain("channel_enable_3", 0x10, 1, ByteOrder::Big, false),
        RegisterDescriptor::plain("channel_enable_4", 0x11, 1, ByteOrder::Big, false),
    ],
    filter_coeff: [
        RegisterDescriptor::plain("filter_coeff_1", 0x12, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_2", 0x14, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_3", 0x16, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_4", 0x18, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_5", 0x1A, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_6", 0x1C, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_7", 0x1E, 2, ByteOrder::Big, false),
        RegisterDescriptor::plain("filter_coeff_8", 0x20, 2, ByteOrder::Big, false),
    ],
};

impl AdcRegisters {
    /// Every descriptor in the table, for table-integrity checks
    pub fn all(&self) -> Vec<&RegisterDescriptor> {
        let mut regs = vec![
            &self.board_version,
            &self.mc_version,
            &self.serial,
            &self.status,
            &self.fault,
            &self.temperature,
            &self.control,
            &self.resolution,
            &self.ring_buffer_size,
            &self.overload_level,
        ];
        regs.extend(self.channel_enable.iter());
        regs.extend(self.filter_coeff.iter());
        regs
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_no_overlapping_registers() {
        // Within one table, descriptors may share bytes only as alternate
        // bit-field views of the identical descriptor. These tables have no
        // such aliases, so all byte ranges must be disjoint.
        for table in [&ADC_GEN1, &ADC_GEN2] {
            let regs = table.all();
            for (i, a) in regs.iter().enumerate() {
                for b in regs.iter().skip(i + 1) {
                    let a_end = a.start + a.length as u32;
                    let b_end = b.start + b.length as u32;
                    assert!(
                        a_end <= b.start || b_end <= a.start,
                        "registers {} and {} overlap",
                        a.name,
                        b.name
                    );
                }
            }
        }
    }

    #[test]
    fn test_block_covers_registers() {
        for table in [&ADC_GEN1, &ADC_GEN2] {
            for r in table.all() {
                assert!(
                    r.start + r.length as u32 <= ADC_BLOCK_LENGTH as u32,
                    "register {} overruns the ADC block",
                    r.name
                );
            }
        }
    }

    #[test]
    fn test_bit_fields_fit() {
        for table in [&ADC_GEN1, &ADC_GEN2] {
            for r in table.all() {
                for f in r.bits {
                    assert!(f.first_bit <= f.last_bit);
                    assert!(
                        f.last_bit < r.length as u16 * 8,
                        "field {} overruns register {}",
                        f.name,
                        r.name
                    );
                }
            }
        }
    }
}
