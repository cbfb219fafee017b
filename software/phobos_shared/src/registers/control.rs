//! Register maps for the Communication & Control board.
//!
//! The CC board exposes two register blocks over PDI: the *settings* block
//! (writable configuration, persisted to flash on request) and the
//! *variables* block (read-only live state). The identity registers at the
//! head of the settings block are guaranteed stable across firmware
//! generations and are the only registers that may be read before the
//! generation is known.

use super::{BitField, ByteOrder, RegisterDescriptor};

/// PDI offset of the settings block within the CC board's address space
pub const SETTINGS_START: u32 = 0x0000;

/// PDI offset of the variables block within the CC board's address space
pub const VARIABLES_START: u32 = 0x0100;

/// Length of the firmware identity string, e.g. `BSF12-0001-105`
pub const FIRMWARE_STRING_LEN: u8 = 14;

/// Settings-block registers. Offsets are relative to [`SETTINGS_START`].
pub struct ControlSettings {
    /// Total bytes to fetch for a full block dump
    pub block_length: u16,

    /// Unit serial number
    pub serial: RegisterDescriptor,
    /// Firmware identity string, `BSF<type>-<batch>-<version>`
    pub firmware_string: RegisterDescriptor,

    /// ADC sampling clock divider relative to the base clock
    pub sample_divider: RegisterDescriptor,
    /// Number of samples per measurement
    pub sample_count: RegisterDescriptor,
    /// Trigger setup bits
    pub trigger_control: RegisterDescriptor,
    /// Delay from trigger to first recorded sample, in base clock ticks
    pub trigger_delay: RegisterDescriptor,
    /// Per-stream enable bits
    pub stream_control: RegisterDescriptor,
    /// Number of 8-byte payload groups per stream packet
    pub octet: RegisterDescriptor,
    /// Clock source selection bits
    pub clock_control: RegisterDescriptor,
    pub base_pll_mult: RegisterDescriptor,
    pub base_pll_div: RegisterDescriptor,
    pub ext_dcm_mult: RegisterDescriptor,
    pub ext_dcm_div: RegisterDescriptor,
    /// SATA link topology bits
    pub sata_control: RegisterDescriptor,
    /// UDP test pattern generator bits
    pub udp_test_control: RegisterDescriptor,
}

/// Variables-block registers. Offsets are relative to [`VARIABLES_START`].
pub struct ControlVariables {
    /// Total bytes to fetch for a full block dump
    pub block_length: u16,

    /// Lock and activity flags
    pub status: RegisterDescriptor,
    /// Overload and fault flags
    pub fault: RegisterDescriptor,
    /// External clock presence flags
    pub ext_clock_status: RegisterDescriptor,
    /// Measured external clock frequency in kHz
    pub ext_clock_freq: RegisterDescriptor,
    /// Last firmware-internal error code, 0 when healthy
    pub error_code: RegisterDescriptor,
    /// Per-stream running bits
    pub stream_status: RegisterDescriptor,
}

// Trigger control bits (both generations; GATE_ENABLE exists in Gen2 only,
// where the register is widened to two bytes)
pub const TRIG_EN_RISING: BitField = BitField::new("en_rising", 0, 0, "Trigger on rising edge");
pub const TRIG_EN_FALLING: BitField = BitField::new("en_falling", 1, 1, "Trigger on falling edge");
pub const TRIG_EXT_SELECT: BitField =
    BitField::new("ext_select", 2, 2, "1 = external trigger input, 0 = internal");
pub const TRIG_GATE_POLARITY: BitField =
    BitField::new("gate_polarity", 3, 3, "Gate input active level");
pub const TRIG_SOFTWARE: BitField =
    BitField::new("software", 4, 4, "Write 1 to fire a software trigger");
pub const TRIG_GATE_ENABLE: BitField =
    BitField::new("gate_enable", 5, 5, "Gate the sample clock on the gate input");

// Stream control / status bits, one per stream
pub const STREAM_1: BitField = BitField::new("stream1", 0, 0, "Stream 1");
pub const STREAM_2: BitField = BitField::new("stream2", 1, 1, "Stream 2");
pub const STREAM_3: BitField = BitField::new("stream3", 2, 2, "Stream 3");
pub const STREAM_4: BitField = BitField::new("stream4", 3, 3, "Stream 4");

// Clock control bits
pub const CLK_ADC_EXTERNAL: BitField =
    BitField::new("adc_external", 0, 0, "ADC clock from external input");
pub const CLK_AUTO_EXTERNAL: BitField = BitField::new(
    "auto_external",
    1,
    1,
    "Fall back to internal clock when the external clock is absent",
);
pub const CLK_OUT_ENABLE: BitField =
    BitField::new("clock_out_enable", 2, 2, "Drive the clock output connector");

// SATA control bits
pub const SATA_DUAL: BitField =
    BitField::new("dual_sata", 0, 0, "Split each board's data across two SATA lanes");
pub const SATA_TEST: BitField = BitField::new("sata_test", 1, 1, "SATA link test pattern");

// UDP test control bits
pub const UDP_TEST_MODE: BitField =
    BitField::new("udp_test_mode", 0, 0, "Emit counter test data instead of ADC data");

// CC status bits
pub const STATUS_BASE_PLL_LOCK: BitField =
    BitField::new("base_pll_lock", 0, 0, "Base PLL locked");
pub const STATUS_EXT_DCM_LOCK: BitField =
    BitField::new("ext_dcm_lock", 1, 1, "External-clock DCM locked");
pub const STATUS_STREAMING: BitField =
    BitField::new("streaming", 2, 2, "At least one stream is running");
pub const EXT_CLOCK_VALID: BitField =
    BitField::new("ext_clock_valid", 0, 0, "External clock present and within range");

pub static SETTINGS_GEN1: ControlSettings = ControlSettings {
    block_length: 0x40,

    serial: RegisterDescriptor::plain("serial", 0x00, 4, ByteOrder::Big, false),
    firmware_string: RegisterDescriptor::plain(
        "firmware_string",
        0x04,
        FIRMWARE_STRING_LEN,
        ByteOrder::Big,
        false,
    ),

    sample_divider: RegisterDescriptor::plain("sample_divider", 0x12, 2, ByteOrder::Big, false),
    sample_count: RegisterDescriptor::plain("sample_count", 0x14, 6, ByteOrder::Big, false),
    trigger_control: RegisterDescriptor::with_bits(
        "trigger_control",
        0x1A,
        1,
        ByteOrder::Big,
        &[
            TRIG_EN_RISING,
            TRIG_EN_FALLING,
            TRIG_EXT_SELECT,
            TRIG_GATE_POLARITY,
            TRIG_SOFTWARE,
        ],
    ),
    trigger_delay: RegisterDescriptor::plain("trigger_delay", 0x1B, 4, ByteOrder::Big, false),
    stream_control: RegisterDescriptor::with_bits(
        "stream_control",
        0x1F,
        1,
        ByteOrder::Big,
        &[STREAM_1, STREAM_2, STREAM_3, STREAM_4],
    ),
    octet: RegisterDescriptor::plain("octet", 0x20, 2, ByteOrder::Big, false),
    clock_control: RegisterDescriptor::with_bits(
        "clock_control",
        0x22,
        1,
        ByteOrder::Big,
        &[CLK_ADC_EXTERNAL, CLK_AUTO_EXTERNAL, CLK_OUT_ENABLE],
    ),
    base_pll_mult: RegisterDescriptor::plain("base_pll_mult", 0x23, 1, ByteOrder::Big, false),
    base_pll_div: RegisterDescriptor::plain("base_pll_div", 0x24, 1, ByteOrder::Big, false),
    ext_dcm_mult: RegisterDescriptor::plain("ext_dcm_mult", 0x25, 1, ByteOrder::Big, false),
    ext_dcm_div: RegisterDescriptor::plain("ext_dcm_div", 0x26, 1, ByteOrder::Big, false),
    sata_control: RegisterDescriptor::with_bits(
        "sata_control",
        0x27,
        1,
        ByteOrder::Big,
        &[SATA_DUAL, SATA_TEST],
    ),
    udp_test_control: RegisterDescriptor::with_bits(
        "udp_test_control",
        0x28,
        1,
        ByteOrder::Big,
        &[UDP_TEST_MODE],
    ),
};

pub static SETTINGS_GEN2: ControlSettings = ControlSettings {
    block_length: 0x40,

    serial: RegisterDescriptor::plain("serial", 0x00, 4, ByteOrder::Big, false),
    firmware_string: RegisterDescriptor::plain(
        "firmware_string",
        0x04,
        FIRMWARE_STRING_LEN,
        ByteOrder::Big,
        false,
    ),

    sample_divider: RegisterDescriptor::plain("sample_divider", 0x12, 2, ByteOrder::Big, false),
    sample_count: RegisterDescriptor::plain("sample_count", 0x14, 6, ByteOrder::Big, false),
    // Widened to two bytes in Gen2 to make room for gating
    trigger_control: RegisterDescriptor::with_bits(
        "trigger_control",
        0x1A,
        2,
        ByteOrder::Big,
        &[
            TRIG_EN_RISING,
            TRIG_EN_FALLING,
            TRIG_EXT_SELECT,
            TRIG_GATE_POLARITY,
            TRIG_SOFTWARE,
            TRIG_GATE_ENABLE,
        ],
    ),
    trigger_delay: RegisterDescriptor::plain("trigger_delay", 0x1C, 4, ByteOrder::Big, false),
    stream_control: RegisterDescriptor::with_bits(
        "stream_control",
        0x20,
        1,
        ByteOrder::Big,
        &[STREAM_1, STREAM_2, STREAM_3, STREAM_4],
    ),
    octet: RegisterDescriptor::plain("octet", 0x21, 2, ByteOrder::Big, false),
    clock_control: RegisterDescriptor::with_bits(
        "clock_control",
        0x23,
        1,
        ByteOrder::Big,
        &[CLK_ADC_EXTERNAL, CLK_AUTO_EXTERNAL, CLK_OUT_ENABLE],
    ),
    base_pll_mult: RegisterDescriptor::plain("base_pll_mult", 0x24, 1, ByteOrder::Big, false),
    base_pll_div: RegisterDescriptor::plain("base_pll_div", 0x25, 1, ByteOrder::Big, false),
    ext_dcm_mult: RegisterDescriptor::plain("ext_dcm_mult", 0x26, 1, ByteOrder::Big, false),
    ext_dcm_div: RegisterDescriptor::plain("ext_dcm_div", 0x27, 1, ByteOrder::Big, false),
    sata_control: RegisterDescriptor::with_bits(
        "sata_control",
        0x28,
        1,
        ByteOrder::Big,
        &[SATA_DUAL, SATA_TEST],
    ),
    udp_test_control: RegisterDescriptor::with_bits(
        "udp_test_control",
        0x29,
        1,
        ByteOrder::Big,
        &[UDP_TEST_MODE],
    ),
};

pub static VARIABLES_GEN1: ControlVariables = ControlVariables {
    block_length: 0x10,

    status: RegisterDescriptor::with_bits(
        "status",
        0x00,
        1,
        ByteOrder::Big,
        &[STATUS_BASE_PLL_LOCK, STATUS_EXT_DCM_LOCK, STATUS_STREAMING],
    ),
    fault: RegisterDescriptor::plain("fault", 0x01, 1, ByteOrder::Big, false),
    ext_clock_status: RegisterDescriptor::with_bits(
        "ext_clock_status",
        0x02,
        1,
        ByteOrder::Big,
        &[EXT_CLOCK_VALID],
    ),
    ext_clock_freq: RegisterDescriptor::plain("ext_clock_freq", 0x03, 2, ByteOrder::Big, false),
    error_code: RegisterDescriptor::plain("error_code", 0x05, 1, ByteOrder::Big, false),
    stream_status: RegisterDescriptor::with_bits(
        "stream_status",
        0x06,
        1,
        ByteOrder::Big,
        &[STREAM_1, STREAM_2, STREAM_3, STREAM_4],
    ),
};

pub static VARIABLES_GEN2: ControlVariables = ControlVariables {
    block_length: 0x10,

    status: RegisterDescriptor::with_bits(
        "status",
        0x00,
        1,
        ByteOrder::Big,
        &[STATUS_BASE_PLL_LOCK, STATUS_EXT_DCM_LOCK, STATUS_STREAMING],
    ),
    fault: RegisterDescriptor::plain("fault", 0x01, 1, ByteOrder::Big, false),
    ext_clock_status: RegisterDescriptor::with_bits(
        "ext_clock_status",
        0x02,
        1,
        ByteOrder::Big,
        &[EXT_CLOCK_VALID],
    ),
    ext_clock_freq: RegisterDescriptor::plain("ext_clock_freq", 0x04, 2, ByteOrder::Big, false),
    error_code: RegisterDescriptor::plain("error_code", 0x06, 1, ByteOrder::Big, false),
    stream_status: RegisterDescriptor::with_bits(
        "stream_status",
        0x07,
        1,
        ByteOrder::Big,
        &[STREAM_1, STREAM_2, STREAM_3, STREAM_4],
    ),
};

/// Parse the numeric version out of a CC firmware identity string.
///
/// The string has the form `BSF<type>-<batch>-<version>`, e.g.
/// `BSF12-0001-105` for firmware 1.05. Returns `None` when the string does
/// not follow that shape.
pub fn parse_firmware_version(firmware: &str) -> Option<u16> {
    let version = firmware.trim_end_matches(char::from(0)).split('-').nth(2)?;
    let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_firmware_version() {
        assert_eq!(parse_firmware_version("BSF12-0001-103"), Some(103));
        assert_eq!(parse_firmware_version("BSF12-0001-110"), Some(110));
        // NUL padding from a fixed-width register read
        assert_eq!(parse_firmware_version("BSF12-0001-105\0\0"), Some(105));
        assert_eq!(parse_firmware_version("garbage"), None);
        assert_eq!(parse_firmware_version("BSF12-0001-x"), None);
    }

    #[test]
    fn test_identity_registers_are_generation_independent() {
        for (a, b) in [
            (&SETTINGS_GEN1.serial, &SETTINGS_GEN2.serial),
            (&SETTINGS_GEN1.firmware_string, &SETTINGS_GEN2.firmware_string),
        ] {
            assert_eq!(a.start, b.start);
            assert_eq!(a.length, b.length);
        }
    }

    fn settings_regs(table: &'static ControlSettings) -> Vec<&'static RegisterDescriptor> {
        vec![
            &table.serial,
            &table.firmware_string,
            &table.sample_divider,
            &table.sample_count,
            &table.trigger_control,
            &table.trigger_delay,
            &table.stream_control,
            &table.octet,
            &table.clock_control,
            &table.base_pll_mult,
            &table.base_pll_div,
            &table.ext_dcm_mult,
            &table.ext_dcm_div,
            &table.sata_control,
            &table.udp_test_control,
        ]
    }

    fn variables_regs(table: &'static ControlVariables) -> Vec<&'static RegisterDescriptor> {
        vec![
            &table.status,
            &table.fault,
            &table.ext_clock_status,
            &table.ext_clock_freq,
            &table.error_code,
            &table.stream_status,
        ]
    }

    #[test]
    fn test_blocks_cover_registers() {
        for table in [&SETTINGS_GEN1, &SETTINGS_GEN2] {
            for r in settings_regs(table) {
                assert!(
                    r.start + r.length as u32 <= table.block_length as u32,
                    "register {} overruns settings block",
                    r.name
                );
            }
        }
        for table in [&VARIABLES_GEN1, &VARIABLES_GEN2] {
            for r in variables_regs(table) {
                assert!(r.start + r.length as u32 <= table.block_length as u32);
            }
        }
    }

    #[test]
    fn test_no_overlapping_registers() {
        let tables: Vec<Vec<&RegisterDescriptor>> = vec![
            settings_regs(&SETTINGS_GEN1),
            settings_regs(&SETTINGS_GEN2),
            variables_regs(&VARIABLES_GEN1),
            variables_regs(&VARIABLES_GEN2),
        ];
        for regs in tables {
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
}
