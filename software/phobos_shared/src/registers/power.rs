//! Register map for the Power & Control board.
//!
//! The PC board runs the detector bias supplies, the temperature sensor
//! chain, and the cooling fans. High-voltage registers are raw DAC/ADC
//! counts; the per-channel scale factors for converting counts to volts live
//! in the calibration registers at the end of the block.

use super::{BitField, ByteOrder, RegisterDescriptor};

/// Bytes to fetch for a full PC board dump
pub const POWER_BLOCK_LENGTH: u16 = 0x48;

/// Number of high-voltage bias channels
pub const HV_CHANNELS: usize = 4;

/// Number of temperature sensors on the detector assembly
pub const TEMP_SENSORS: usize = 16;

/// PC-board registers. Offsets are relative to the board's register base.
pub struct PowerRegisters {
    /// Board type marker (high nibble) and hardware revision (low nibble)
    pub board_version: RegisterDescriptor,
    /// Microcontroller firmware version, main*100 + sub
    pub mc_version: RegisterDescriptor,
    /// Board serial number
    pub serial: RegisterDescriptor,
    /// High-voltage setpoints, raw DAC counts
    pub hv_set: [RegisterDescriptor; HV_CHANNELS],
    /// High-voltage monitor readings, raw ADC counts
    pub hv_mon: [RegisterDescriptor; HV_CHANNELS],
    /// Per-channel and global HV enable bits
    pub hv_enable: RegisterDescriptor,
    /// Detector temperature sensors, tenths of a degree C
    pub temp_sensor: [RegisterDescriptor; TEMP_SENSORS],
    /// Fan PWM duty, 0-255
    pub fan1_speed: RegisterDescriptor,
    pub fan2_speed: RegisterDescriptor,
    /// Millivolts per HV count, one per channel
    pub hv_calib: [RegisterDescriptor; HV_CHANNELS],
}

// HV enable bits
pub const HV1_ENABLE: BitField = BitField::new("hv1_enable", 0, 0, "Channel 1 bias output");
pub const HV2_ENABLE: BitField = BitField::new("hv2_enable", 1, 1, "Channel 2 bias output");
pub const HV3_ENABLE: BitField = BitField::new("hv3_enable", 2, 2, "Channel 3 bias output");
pub const HV4_ENABLE: BitField = BitField::new("hv4_enable", 3, 3, "Channel 4 bias output");
pub const HV_GLOBAL_ENABLE: BitField =
    BitField::new("hv_global_enable", 7, 7, "Master interlock for all bias outputs");

const fn hv_set(i: u32, name: &'static str) -> RegisterDescriptor {
    RegisterDescriptor::plain(name, 0x06 + 2 * i, 2, ByteOrder::Big, false)
}

const fn hv_mon(i: u32, name: &'static str) -> RegisterDescriptor {
    RegisterDescriptor::plain(name, 0x0E + 2 * i, 2, ByteOrder::Big, false)
}

const fn temp(i: u32, name: &'static str) -> RegisterDescriptor {
    RegisterDescriptor::plain(name, 0x18 + 2 * i, 2, ByteOrder::Big, true)
}

const fn calib(i: u32, name: &'static str) -> RegisterDescriptor {
    RegisterDescriptor::plain(name, 0x3A + 2 * i, 2, ByteOrder::Big, false)
}

pub static POWER_GEN1: PowerRegisters = PowerRegisters {
    board_version: RegisterDescriptor::plain("board_version", 0x00, 1, ByteOrder::Big, false),
    mc_version: RegisterDescriptor::plain("mc_version", 0x01, 2, ByteOrder::Big, false),
    serial: RegisterDescriptor::plain("serial", 0x03, 2, ByteOrder::Big, false),
    hv_set: [
        hv_set(0, "hv1_set"),
        hv_set(1, "hv2_set"),
        hv_set(2, "hv3_set"),
        hv_set(3, "hv4_set"),
    ],
    hv_mon: [
        hv_mon(0, "hv1_mon"),
        hv_mon(1, "hv2_mon"),
        hv_mon(2, "hv3_mon"),
        hv_mon(3, "hv4_mon"),
    ],
    hv_enable: RegisterDescriptor::with_bits(
        "hv_enable",
        0x16,
        1,
        ByteOrder::Big,
        &[HV1_ENABLE, HV2_ENABLE, HV3_ENABLE, HV4_ENABLE, HV_GLOBAL_ENABLE],
    ),
    temp_sensor: [
        temp(0, "temp_1"),
        temp(1, "temp_2"),
        temp(2, "temp_3"),
        temp(3, "temp_4"),
        temp(4, "temp_5"),
        temp(5, "temp_6"),
        temp(6, "temp_7"),
        temp(7, "temp_8"),
        temp(8, "temp_9"),
        temp(9, "temp_10"),
        temp(10, "temp_11"),
        temp(11, "temp_12"),
        temp(12, "temp_13"),
        temp(13, "temp_14"),
        temp(14, "temp_15"),
        temp(15, "temp_16"),
    ],
    fan1_speed: RegisterDescriptor::plain("fan1_speed", 0x38, 1, ByteOrder::Big, false),
    fan2_speed: RegisterDescriptor::plain("fan2_speed", 0x39, 1, ByteOrder::Big, false),
    hv_calib: [
        calib(0, "hv1_calib"),
        calib(1, "hv2_calib"),
        calib(2, "hv3_calib"),
        calib(3, "hv4_calib"),
    ],
};

// Gen2 relocates the fan registers behind the calibration block; the freed
// bytes are reserved. Everything else is unchanged.
pub static POWER_GEN2: PowerRegisters = PowerRegisters {
    board_version: RegisterDescriptor::plain("board_version", 0x00, 1, ByteOrder::Big, false),
    mc_version: RegisterDescriptor::plain("mc_version", 0x01, 2, ByteOrder::Big, false),
    serial: RegisterDescriptor::plain("serial", 0x03, 2, ByteOrder::Big, false),
    hv_set: [
        hv_set(0, "hv1_set"),
        hv_set(1, "hv2_set"),
        hv_set(2, "hv3_set"),
        hv_set(3, "hv4_set"),
    ],
    hv_mon: [
        hv_mon(0, "hv1_mon"),
        hv_mon(1, "hv2_mon"),
        hv_mon(2, "hv3_mon"),
        hv_mon(3, "hv4_mon"),
    ],
    hv_enable: RegisterDescriptor::with_bits(
        "hv_enable",
        0x16,
        1,
        ByteOrder::Big,
        &[HV1_ENABLE, HV2_ENABLE, HV3_ENABLE, HV4_ENABLE, HV_GLOBAL_ENABLE],
    ),
    temp_sensor: [
        temp(0, "temp_1"),
        temp(1, "temp_2"),
        temp(2, "temp_3"),
        temp(3, "temp_4"),
        temp(4, "temp_5"),
        temp(5, "temp_6"),
        temp(6, "temp_7"),
        temp(7, "temp_8"),
        temp(8, "temp_9"),
        temp(9, "temp_10"),
        temp(10, "temp_11"),
        temp(11, "temp_12"),
        temp(12, "temp_13"),
        temp(13, "temp_14"),
        temp(14, "temp_15"),
        temp(15, "temp_16"),
    ],
    fan1_speed: RegisterDescriptor::plain("fan1_speed", 0x42, 1, ByteOrder::Big, false),
    fan2_speed: RegisterDescriptor::plain("fan2_speed", 0x43, 1, ByteOrder::Big, false),
    hv_calib: [
        calib(0, "hv1_calib"),
        calib(1, "hv2_calib"),
        calib(2, "hv3_calib"),
        calib(3, "hv4_calib"),
    ],
};

impl PowerRegisters {
    /// Every descriptor in the table, for table-integrity checks
    pub fn all(&self) -> Vec<&RegisterDescriptor> {
        let mut regs = vec![
            &self.board_version,
            &self.mc_version,
            &self.serial,
            &self.hv_enable,
            &self.fan1_speed,
            &self.fan2_speed,
        ];
        regs.extend(self.hv_set.iter());
        regs.extend(self.hv_mon.iter());
        regs.extend(self.temp_sensor.iter());
        regs.extend(self.hv_calib.iter());
        regs
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_no_overlapping_registers() {
        for table in [&POWER_GEN1, &POWER_GEN2] {
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
        for table in [&POWER_GEN1, &POWER_GEN2] {
            for r in table.all() {
                assert!(
                    r.start + r.length as u32 <= POWER_BLOCK_LENGTH as u32,
                    "register {} overruns the PC block",
                    r.name
                );
            }
        }
    }
}
