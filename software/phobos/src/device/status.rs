//! Snapshot of the instrument's identity and live state.
//!
//! The snapshot holds the raw block dumps from the last refresh alongside
//! the values derived from them, so callers can re-decode any register
//! through the shared tables without another round trip to hardware.

use chrono::{DateTime, Utc};

use phobos_shared::registers::control::{
    EXT_CLOCK_VALID, SATA_DUAL, STATUS_BASE_PLL_LOCK, STATUS_EXT_DCM_LOCK,
};
use phobos_shared::registers::power::{HV_CHANNELS, TEMP_SENSORS};
use phobos_shared::registers::{adc, FirmwareGeneration};

use crate::error::{DeviceError, Result};

/// Identity of one discovered ADC board
#[derive(Debug, Clone)]
pub struct AdcBoardInfo {
    pub card_address: u8,
    /// Hardware revision, low nibble of the version-code register
    pub hardware_revision: u8,
    pub mc_version: u16,
    pub serial: u16,
}

/// Identity of the Power & Control board
#[derive(Debug, Clone)]
pub struct PcBoardInfo {
    pub hardware_revision: u8,
    pub mc_version: u16,
    pub serial: u16,
}

/// Process-lifetime snapshot of the instrument, refreshed by
/// [`crate::device::Device::read_status`]
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    // Identity, fixed at connect
    pub serial: u32,
    pub firmware: String,
    pub firmware_version: u16,
    pub generation: FirmwareGeneration,
    pub adc_boards: Vec<AdcBoardInfo>,
    pub pc_board: PcBoardInfo,

    // Derived live state, refreshed on every read_status
    pub base_pll_locked: bool,
    pub ext_dcm_locked: bool,
    pub ext_clock_valid: bool,
    pub ext_clock_freq_khz: u64,
    pub dual_sata: bool,
    /// Per discovered ADC board, in `adc_boards` order
    pub adc_pll_locked: Vec<bool>,
    pub adc_temperatures_c: Vec<f64>,
    pub hv_set_volts: [f64; HV_CHANNELS],
    pub hv_mon_volts: [f64; HV_CHANNELS],
    pub temperatures_c: [f64; TEMP_SENSORS],

    /// When the last refresh completed
    pub refreshed_at: Option<DateTime<Utc>>,

    // Raw block dumps from the last refresh
    pub settings: Vec<u8>,
    pub variables: Vec<u8>,
    /// Per discovered ADC board, in `adc_boards` order
    pub adc_dumps: Vec<Vec<u8>>,
    pub power_dump: Vec<u8>,
}

impl DeviceStatus {
    pub(crate) fn new(
        serial: u32,
        firmware: String,
        firmware_version: u16,
        generation: FirmwareGeneration,
        adc_boards: Vec<AdcBoardInfo>,
        pc_board: PcBoardInfo,
    ) -> Self {
        let n_boards = adc_boards.len();
        Self {
            serial,
            firmware,
            firmware_version,
            generation,
            adc_boards,
            pc_board,
            base_pll_locked: false,
            ext_dcm_locked: false,
            ext_clock_valid: false,
            ext_clock_freq_khz: 0,
            dual_sata: false,
            adc_pll_locked: vec![false; n_boards],
            adc_temperatures_c: vec![0.0; n_boards],
            hv_set_volts: [0.0; HV_CHANNELS],
            hv_mon_volts: [0.0; HV_CHANNELS],
            temperatures_c: [0.0; TEMP_SENSORS],
            refreshed_at: None,
            settings: Vec::new(),
            variables: Vec::new(),
            adc_dumps: Vec::new(),
            power_dump: Vec::new(),
        }
    }

    /// Re-derive every computed field from the raw dumps
    pub(crate) fn derive(&mut self) -> Result<()> {
        let decode_err =
            |e: phobos_shared::registers::RegisterError| DeviceError::protocol(format!("status decode: {e}"));

        let settings = self.generation.control_settings();
        self.dual_sata = settings
            .sata_control
            .decode_bits(&self.settings, &SATA_DUAL)
            .map_err(decode_err)?
            != 0;

        let variables = self.generation.control_variables();
        self.base_pll_locked = variables
            .status
            .decode_bits(&self.variables, &STATUS_BASE_PLL_LOCK)
            .map_err(decode_err)?
            != 0;
        self.ext_dcm_locked = variables
            .status
            .decode_bits(&self.variables, &STATUS_EXT_DCM_LOCK)
            .map_err(decode_err)?
            != 0;
        self.ext_clock_valid = variables
            .ext_clock_status
            .decode_bits(&self.variables, &EXT_CLOCK_VALID)
            .map_err(decode_err)?
            != 0;
        self.ext_clock_freq_khz = variables
            .ext_clock_freq
            .decode_unsigned(&self.variables)
            .map_err(decode_err)?;

        let adc_regs = self.generation.adc();
        self.adc_pll_locked.clear();
        self.adc_temperatures_c.clear();
        for dump in &self.adc_dumps {
            let locked = adc_regs
                .status
                .decode_bits(dump, &adc::ADC_BASE_PLL_LOCK)
                .map_err(decode_err)?
                != 0;
            self.adc_pll_locked.push(locked);

            let counts = adc_regs.temperature.decode(dump).map_err(decode_err)?;
            // Gen1 reports whole degrees, Gen2 tenths
            let temp = match self.generation {
                FirmwareGeneration::Gen1 => counts as f64,
                FirmwareGeneration::Gen2 => counts as f64 * 0.1,
            };
            self.adc_temperatures_c.push(temp);
        }

        let pc_regs = self.generation.power();
        for i in 0..HV_CHANNELS {
            // Calibration registers hold millivolts per count
            let scale = pc_regs.hv_calib[i]
                .decode_unsigned(&self.power_dump)
                .map_err(decode_err)? as f64
                / 1000.0;
            let set = pc_regs.hv_set[i]
                .decode_unsigned(&self.power_dump)
                .map_err(decode_err)? as f64;
            let mon = pc_regs.hv_mon[i]
                .decode_unsigned(&self.power_dump)
                .map_err(decode_err)? as f64;
            self.hv_set_volts[i] = set * scale;
            self.hv_mon_volts[i] = mon * scale;
        }
        for i in 0..TEMP_SENSORS {
            let counts = pc_regs.temp_sensor[i].decode(&self.power_dump).map_err(decode_err)?;
            self.temperatures_c[i] = counts as f64 * 0.1;
        }

        self.refreshed_at = Some(Utc::now());
        Ok(())
    }
}
