//! Device model: connection, discovery, and configuration of one instrument.
//!
//! [`Device::connect`] owns the whole bring-up sequence: open the command
//! socket, read the generation-independent identity registers, pick the
//! firmware generation, discover the ADC and PC boards, resynchronize the
//! ADC sampling clocks, and take the first status snapshot. Apart from the
//! clock sync toggle (required for correct sampling), connecting never
//! changes hardware state.
//!
//! The snapshot in [`DeviceStatus`] is not designed for concurrent
//! mutation: do not call `read_status` concurrently with itself. Register
//! traffic underneath is serialized by the transport lock regardless.

pub mod status;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use phobos_shared::command;
use phobos_shared::registers::adc::{ADC_BLOCK_LENGTH, ADC_DUAL_SATA, ADC_SYNC};
use phobos_shared::registers::control::{
    self, parse_firmware_version, SETTINGS_GEN1, SETTINGS_START, VARIABLES_START,
};
use phobos_shared::registers::power::POWER_BLOCK_LENGTH;
use phobos_shared::registers::{ByteOrder, FirmwareGeneration, TriggerOpcodes};
use phobos_shared::{
    ADC_BOARD_MARKER, ADC_CARD_ADDRESSES, CC_CARD_ADDRESS, PC_BOARD_MARKER, PC_CARD_ADDRESS,
};

use crate::config::DeviceConfig;
use crate::error::{DeviceError, Result};
use crate::pdi::{Pdi, PdiValue, Readback, ReadRequest, WriteRequest};
use crate::stream::{BoardStreamSetup, StreamPlan};
use crate::transport::CommandTransport;

pub use status::{AdcBoardInfo, DeviceStatus, PcBoardInfo};

/// Settling time after each edge of the ADC clock sync toggle
const SYNC_SETTLE: Duration = Duration::from_millis(10);

/// Trigger setup, translated to generation-specific instructions
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerConfig {
    pub rising: bool,
    pub falling: bool,
    /// Use the external trigger input instead of the internal comparators
    pub external: bool,
    pub gate_enable: bool,
    pub gate_active_high: bool,
    /// Delay from trigger to first recorded sample, in base clock ticks
    pub delay_ticks: u32,
}

/// A connected instrument
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    transport: Arc<CommandTransport>,
    pdi: Pdi,
    generation: FirmwareGeneration,
    host_address: Option<IpAddr>,
    status: DeviceStatus,
}

impl Device {
    /// Connect to the instrument described by `config`.
    ///
    /// Fails with a descriptive error, releasing the socket, if any step of
    /// the bring-up sequence fails. At least one ADC board and the PC board
    /// must be present.
    pub fn connect(config: DeviceConfig) -> Result<Self> {
        let transport = Arc::new(CommandTransport::open(
            config.local_port,
            config.command_addr(),
            &config.client_ident,
            config.mtu,
        )?);
        let pdi = Pdi::new(
            transport.clone(),
            config.retry_policy(),
            config.answer_timeout(),
        );
        let wait = config.pdi_wait_ms;

        // Identity registers sit at the same offsets in every generation,
        // so Gen1's descriptors are safe before the generation is known
        let ident = &SETTINGS_GEN1;
        let values = pdi.read(
            &[
                ReadRequest::int(
                    CC_CARD_ADDRESS,
                    SETTINGS_START + ident.serial.start,
                    ident.serial.length as u16,
                    ByteOrder::Big,
                ),
                ReadRequest::raw(
                    CC_CARD_ADDRESS,
                    SETTINGS_START + ident.firmware_string.start,
                    ident.firmware_string.length as u16,
                ),
            ],
            wait,
        )?;
        let serial = values[0].as_int().unwrap_or(0) as u32;
        let firmware = match &values[1] {
            PdiValue::Raw(bytes) => String::from_utf8_lossy(bytes)
                .trim_end_matches(char::from(0))
                .to_owned(),
            PdiValue::Int(_) => String::new(),
        };

        let firmware_version = parse_firmware_version(&firmware).ok_or_else(|| {
            DeviceError::device_state(format!("unrecognized firmware string `{firmware}`"))
        })?;
        let generation = FirmwareGeneration::from_version(firmware_version);
        info!("connected to unit {serial}, firmware `{firmware}` ({generation:?})");

        // Discover ADC boards at the four fixed card addresses
        let mut adc_cards = Vec::new();
        for &card in &ADC_CARD_ADDRESSES {
            match pdi.read_register(card, 0, 1, wait) {
                Ok(bytes) if bytes[0] >> 4 == ADC_BOARD_MARKER => {
                    debug!("ADC board present at card address {card}");
                    adc_cards.push(card);
                }
                Ok(_) => debug!("no ADC board at card address {card}"),
                Err(e) => debug!("probe of card address {card} failed, treating as absent: {e}"),
            }
        }
        if adc_cards.is_empty() {
            return Err(DeviceError::device_state("no ADC boards found"));
        }

        // The PC board is required
        let pc_probe = pdi.read_register(PC_CARD_ADDRESS, 0, 1, wait)?;
        if pc_probe[0] >> 4 != PC_BOARD_MARKER {
            return Err(DeviceError::device_state(format!(
                "no PC board at card address {PC_CARD_ADDRESS} (version code {:#04x})",
                pc_probe[0]
            )));
        }

        // Identity of each discovered board
        let adc_regs = generation.adc();
        let mut adc_boards = Vec::with_capacity(adc_cards.len());
        for &card in &adc_cards {
            let dump = pdi.read_register(card, 0, ADC_BLOCK_LENGTH, wait)?;
            adc_boards.push(AdcBoardInfo {
                card_address: card,
                hardware_revision: (adc_regs.board_version.decode_unsigned(&dump).unwrap_or(0)
                    & 0x0F) as u8,
                mc_version: adc_regs.mc_version.decode_unsigned(&dump).unwrap_or(0) as u16,
                serial: adc_regs.serial.decode_unsigned(&dump).unwrap_or(0) as u16,
            });
        }
        let pc_regs = generation.power();
        let pc_dump = pdi.read_register(PC_CARD_ADDRESS, 0, POWER_BLOCK_LENGTH, wait)?;
        let pc_board = PcBoardInfo {
            hardware_revision: (pc_probe[0] & 0x0F),
            mc_version: pc_regs.mc_version.decode_unsigned(&pc_dump).unwrap_or(0) as u16,
            serial: pc_regs.serial.decode_unsigned(&pc_dump).unwrap_or(0) as u16,
        };

        // The one hardware mutation during connect: resynchronize the chip
        // sampling clocks on every ADC board
        sync_adc_boards(&pdi, generation, &adc_cards, wait)?;

        // Find the host interface on the instrument's subnet; streams are
        // addressed to it when configuring the device
        let host_address = find_host_interface(config.address);
        if host_address.is_none() {
            warn!(
                "no host interface on the same /24 subnet as {}; stream routing must be arranged externally",
                config.address
            );
        }

        let status = DeviceStatus::new(
            serial,
            firmware,
            firmware_version,
            generation,
            adc_boards,
            pc_board,
        );
        let mut device = Self {
            config,
            transport,
            pdi,
            generation,
            host_address,
            status,
        };
        // First snapshot; also answers the dual-SATA mode query
        device.read_status()?;
        Ok(device)
    }

    /// Firmware generation selected at connect
    pub fn generation(&self) -> FirmwareGeneration {
        self.generation
    }

    /// Host address on the instrument's subnet, if one was found
    pub fn host_address(&self) -> Option<IpAddr> {
        self.host_address
    }

    /// Whether the instrument routes each board's data over two SATA lanes
    pub fn dual_sata(&self) -> bool {
        self.status.dual_sata
    }

    /// The snapshot from the last [`Self::read_status`]
    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    /// The register access layer, for callers composing their own batches
    pub fn pdi(&self) -> &Pdi {
        &self.pdi
    }

    /// Refresh the whole status snapshot: settings and variables blocks,
    /// every discovered board's register dump, and the values derived from
    /// them.
    pub fn read_status(&mut self) -> Result<&DeviceStatus> {
        let wait = self.config.pdi_wait_ms;
        let settings_len = self.generation.control_settings().block_length;
        let variables_len = self.generation.control_variables().block_length;

        let mut requests = vec![
            ReadRequest::raw(CC_CARD_ADDRESS, SETTINGS_START, settings_len),
            ReadRequest::raw(CC_CARD_ADDRESS, VARIABLES_START, variables_len),
            ReadRequest::raw(PC_CARD_ADDRESS, 0, POWER_BLOCK_LENGTH),
        ];
        for board in &self.status.adc_boards {
            requests.push(ReadRequest::raw(board.card_address, 0, ADC_BLOCK_LENGTH));
        }

        let mut values = self.pdi.read(&requests, wait)?;
        let adc_dumps: Vec<Vec<u8>> = values
            .split_off(3)
            .into_iter()
            .map(|v| match v {
                PdiValue::Raw(bytes) => bytes,
                PdiValue::Int(_) => Vec::new(),
            })
            .collect();
        let mut drain = values.into_iter();
        let take_raw = |v: Option<PdiValue>| match v {
            Some(PdiValue::Raw(bytes)) => bytes,
            _ => Vec::new(),
        };
        self.status.settings = take_raw(drain.next());
        self.status.variables = take_raw(drain.next());
        self.status.power_dump = take_raw(drain.next());
        self.status.adc_dumps = adc_dumps;

        self.status.derive()?;
        Ok(&self.status)
    }

    /// Resynchronize the ADC sampling clocks; done automatically at connect
    pub fn sync_adc(&self) -> Result<()> {
        let cards: Vec<u8> = self
            .status
            .adc_boards
            .iter()
            .map(|b| b.card_address)
            .collect();
        sync_adc_boards(&self.pdi, self.generation, &cards, self.config.pdi_wait_ms)
    }

    /// Close the connection, releasing the socket. Dropping the device does
    /// the same; this exists for making teardown explicit at call sites.
    pub fn disconnect(self) {}

    // Stateless instrument commands, all single-instruction frames

    /// Number of samples each stream records per measurement
    pub fn set_sample_count(&self, count: u64) -> Result<()> {
        let bytes = count.to_be_bytes();
        self.command_with_ack(command::OP_SET_SAMPLE_COUNT, &bytes[2..8])
    }

    /// ADC sampling clock divider relative to the base clock
    pub fn set_sample_divider(&self, divider: u16) -> Result<()> {
        self.command_with_ack(command::OP_SET_SAMPLE_DIVIDER, &divider.to_be_bytes())
    }

    /// Number of 8-byte payload groups per stream packet
    pub fn set_octet(&self, octet: u16) -> Result<()> {
        self.command_with_ack(command::OP_SET_OCTET, &octet.to_be_bytes())
    }

    /// Choose the ADC clock source
    pub fn select_clock_source(&self, external: bool, auto_fallback: bool) -> Result<()> {
        let reg = &self.generation.control_settings().clock_control;
        // Build the register image the instruction writes verbatim
        let mut block = vec![0u8; (reg.start + reg.length as u32) as usize];
        reg.encode_bits(&mut block, &control::CLK_ADC_EXTERNAL, external as u64)
            .map_err(|e| DeviceError::config(e.to_string()))?;
        reg.encode_bits(&mut block, &control::CLK_AUTO_EXTERNAL, auto_fallback as u64)
            .map_err(|e| DeviceError::config(e.to_string()))?;
        self.command_with_ack(
            command::OP_SELECT_CLOCK_SOURCE,
            &block[reg.start as usize..],
        )
    }

    /// Enable the given streams (bit per stream) and start the measurement
    pub fn start_streams(&self, stream_mask: u8) -> Result<()> {
        self.command_with_ack(command::OP_START_STREAMS, &[stream_mask])
    }

    /// Stop all streams
    pub fn stop_streams(&self) -> Result<()> {
        self.command_with_ack(command::OP_STOP_STREAMS, &[])
    }

    /// Configure triggering, dispatching on the generation's opcode split
    pub fn set_trigger(&self, trigger: TriggerConfig) -> Result<()> {
        let edge_bits = (trigger.rising as u8)
            | (trigger.falling as u8) << 1
            | (trigger.external as u8) << 2;
        let gate_bits = (trigger.gate_active_high as u8) | (trigger.gate_enable as u8) << 1;

        match self.generation.trigger_opcodes() {
            TriggerOpcodes::Combined { control } => {
                let mut payload = vec![edge_bits | gate_bits << 3];
                payload.extend_from_slice(&trigger.delay_ticks.to_be_bytes());
                self.command_with_ack(control, &payload)
            }
            TriggerOpcodes::Split { edge, gate } => {
                let mut payload = vec![edge_bits];
                payload.extend_from_slice(&trigger.delay_ticks.to_be_bytes());
                self.command_with_ack(edge, &payload)?;
                self.command_with_ack(gate, &[gate_bits])
            }
        }
    }

    // Register-backed configuration, verified by readback

    /// Per-chip channel enable masks for one discovered board
    pub fn set_channel_masks(&self, board_index: usize, masks: [u8; 4]) -> Result<()> {
        let card = self.adc_card(board_index)?;
        let regs = self.generation.adc();
        let requests: Vec<WriteRequest> = regs
            .channel_enable
            .iter()
            .zip(masks)
            .map(|(reg, mask)| WriteRequest::raw(card, reg.start, vec![mask]))
            .collect();
        self.pdi
            .write(&requests, self.config.pdi_wait_ms, Readback::Verify)
    }

    /// Bits per sample for one discovered board
    pub fn set_resolution(&self, board_index: usize, bits: u8) -> Result<()> {
        if ![8, 12, 14].contains(&bits) {
            return Err(DeviceError::config(format!(
                "unsupported resolution {bits}; the ADC does 8, 12, or 14 bits"
            )));
        }
        let card = self.adc_card(board_index)?;
        let reg = &self.generation.adc().resolution;
        self.pdi.write(
            &[WriteRequest::raw(card, reg.start, vec![bits])],
            self.config.pdi_wait_ms,
            Readback::Verify,
        )
    }

    /// Bias setpoint in volts for one HV channel, converted through the
    /// channel's calibration factor from the last status snapshot
    pub fn set_hv(&self, channel: usize, volts: f64) -> Result<()> {
        let regs = self.generation.power();
        let calib = regs
            .hv_calib
            .get(channel)
            .ok_or_else(|| DeviceError::config(format!("no HV channel {channel}")))?;
        let mv_per_count = calib
            .decode_unsigned(&self.status.power_dump)
            .map_err(|e| DeviceError::config(format!("no calibration in snapshot: {e}")))?;
        if mv_per_count == 0 {
            return Err(DeviceError::device_state(format!(
                "HV channel {channel} has zero calibration factor"
            )));
        }
        let counts = (volts * 1000.0 / mv_per_count as f64).round();
        if !(0.0..=u16::MAX as f64).contains(&counts) {
            return Err(DeviceError::config(format!(
                "{volts} V is outside HV channel {channel}'s range"
            )));
        }
        let reg = &regs.hv_set[channel];
        self.pdi.write(
            &[WriteRequest::int(
                PC_CARD_ADDRESS,
                reg.start,
                reg.length,
                reg.byte_order,
                counts as u64,
            )],
            self.config.pdi_wait_ms,
            Readback::Verify,
        )
    }

    /// Switch between single and dual SATA lane topology, updating the CC
    /// routing register and every discovered ADC board's control word
    pub fn set_dual_sata(&mut self, enabled: bool) -> Result<()> {
        let reg = &self.generation.control_settings().sata_control;
        let mut settings = self.status.settings.clone();
        if settings.len() < (reg.start + reg.length as u32) as usize {
            return Err(DeviceError::config(
                "no settings snapshot to edit; call read_status first",
            ));
        }
        reg.encode_bits(&mut settings, &control::SATA_DUAL, enabled as u64)
            .map_err(|e| DeviceError::config(e.to_string()))?;
        let image = reg
            .raw(&settings)
            .map_err(|e| DeviceError::config(e.to_string()))?
            .to_vec();

        let mut requests = vec![WriteRequest::raw(
            CC_CARD_ADDRESS,
            SETTINGS_START + reg.start,
            image,
        )];
        let adc_control = &self.generation.adc().control;
        for (board, dump) in self.status.adc_boards.iter().zip(&self.status.adc_dumps) {
            let mut block = dump.clone();
            adc_control
                .encode_bits(&mut block, &ADC_DUAL_SATA, enabled as u64)
                .map_err(|e| DeviceError::config(e.to_string()))?;
            let image = adc_control
                .raw(&block)
                .map_err(|e| DeviceError::config(e.to_string()))?
                .to_vec();
            requests.push(WriteRequest::raw(
                board.card_address,
                adc_control.start,
                image,
            ));
        }

        self.pdi
            .write(&requests, self.config.pdi_wait_ms, Readback::Verify)?;
        self.status.dual_sata = enabled;
        Ok(())
    }

    /// Build the per-board stream layout for a measurement of
    /// `sample_count` samples from the current snapshot's channel masks and
    /// resolutions
    pub fn plan_streams(&self, sample_count: u64) -> Result<StreamPlan> {
        let regs = self.generation.adc();
        let mut boards = Vec::with_capacity(self.status.adc_boards.len());
        for (i, dump) in self.status.adc_dumps.iter().enumerate() {
            let mut chip_masks = [0u8; 4];
            for (chip, reg) in regs.channel_enable.iter().enumerate() {
                chip_masks[chip] = reg
                    .decode_unsigned(dump)
                    .map_err(|e| DeviceError::protocol(format!("channel mask decode: {e}")))?
                    as u8;
            }
            let resolution_bits = regs
                .resolution
                .decode_unsigned(dump)
                .map_err(|e| DeviceError::protocol(format!("resolution decode: {e}")))?
                as u8;
            boards.push(BoardStreamSetup {
                stream_index: i,
                chip_masks,
                resolution_bits,
            });
        }
        StreamPlan::plan(&boards, sample_count, self.config.mtu)
    }

    fn adc_card(&self, board_index: usize) -> Result<u8> {
        self.status
            .adc_boards
            .get(board_index)
            .map(|b| b.card_address)
            .ok_or_else(|| {
                DeviceError::config(format!(
                    "no ADC board {board_index}; {} discovered",
                    self.status.adc_boards.len()
                ))
            })
    }

    /// Send one stateless instruction and require an acknowledgement
    fn command_with_ack(&self, opcode: u16, payload: &[u8]) -> Result<()> {
        let mut guard = self.transport.lock()?;
        guard.reset();
        guard.send_command(Some(opcode), payload, true, None)?;
        let datagram = guard
            .get_answer(self.config.answer_timeout())?
            .ok_or(DeviceError::Timeout(self.config.answer_timeout_ms))?;
        let answer = command::Answer::parse(&datagram)
            .map_err(|e| DeviceError::protocol(e.to_string()))?;
        if !answer.is_ack() {
            return Err(DeviceError::protocol(format!(
                "instruction {opcode:#06x} answered {:#06x} instead of acknowledging",
                answer.code
            )));
        }
        Ok(())
    }
}

/// Toggle the clock sync bit on each board with settling delays. Readback is
/// skipped on purpose: hardware consumes the toggle, so a verify pass would
/// race the bit it checks.
fn sync_adc_boards(
    pdi: &Pdi,
    generation: FirmwareGeneration,
    cards: &[u8],
    wait_ms: u16,
) -> Result<()> {
    let control = &generation.adc().control;
    for &card in cards {
        let image = pdi.read_register(card, control.start, control.length as u16, wait_ms)?;
        let toggled = |value: u64| -> Result<Vec<u8>> {
            let mut block = vec![0u8; control.start as usize];
            block.extend_from_slice(&image);
            control
                .encode_bits(&mut block, &ADC_SYNC, value)
                .map_err(|e| DeviceError::config(e.to_string()))?;
            Ok(block[control.start as usize..].to_vec())
        };

        pdi.write_register(card, control.start, toggled(1)?, wait_ms, Readback::Skip)?;
        std::thread::sleep(SYNC_SETTLE);
        pdi.write_register(card, control.start, toggled(0)?, wait_ms, Readback::Skip)?;
        std::thread::sleep(SYNC_SETTLE);
        debug!("resynchronized ADC clocks on card {card}");
    }
    Ok(())
}

/// Find a host address on the same /24 subnet as the instrument
fn find_host_interface(device: IpAddr) -> Option<IpAddr> {
    let IpAddr::V4(device) = device else {
        return None;
    };
    let netifas = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(e) => {
            warn!("unable to enumerate host interfaces: {e}");
            return None;
        }
    };
    netifas.into_iter().find_map(|(name, ip)| match ip {
        IpAddr::V4(host) if host.octets()[..3] == device.octets()[..3] => {
            debug!("host interface {name} ({host}) shares the instrument's subnet");
            Some(IpAddr::V4(host))
        }
        _ => None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bench::{BenchConfig, BenchDevice};

    fn config_for(bench: &BenchDevice) -> DeviceConfig {
        let mut config = DeviceConfig::for_address(bench.addr().ip());
        config.command_port = bench.addr().port();
        config.local_port = 0;
        config.answer_timeout_ms = 200;
        config.retry_backoff_ms = 1;
        config
    }

    #[test]
    fn test_connect_selects_gen1_tables() {
        let bench = BenchDevice::spawn(BenchConfig {
            firmware: "BSF12-0001-103".to_owned(),
            ..Default::default()
        })
        .unwrap();

        let device = Device::connect(config_for(&bench)).unwrap();
        assert_eq!(device.generation(), FirmwareGeneration::Gen1);
        assert_eq!(device.generation().builtin_adc_freq_divider(), 1);
        assert_eq!(device.status().firmware_version, 103);
    }

    #[test]
    fn test_connect_selects_gen2_tables() {
        let bench = BenchDevice::spawn(BenchConfig {
            firmware: "BSF12-0001-110".to_owned(),
            ..Default::default()
        })
        .unwrap();

        let device = Device::connect(config_for(&bench)).unwrap();
        assert_eq!(device.generation(), FirmwareGeneration::Gen2);
        assert_eq!(device.generation().builtin_adc_freq_divider(), 2);
    }

    #[test]
    fn test_connect_discovers_boards_and_derives_status() {
        let bench = BenchDevice::spawn(BenchConfig {
            adc_cards: vec![8, 10],
            ..Default::default()
        })
        .unwrap();

        let device = Device::connect(config_for(&bench)).unwrap();
        let status = device.status();

        assert_eq!(status.serial, BenchConfig::default().serial);
        let cards: Vec<u8> = status.adc_boards.iter().map(|b| b.card_address).collect();
        assert_eq!(cards, vec![8, 10]);
        assert_eq!(status.adc_boards[0].serial, 1008);
        assert_eq!(status.pc_board.serial, 77);

        assert!(status.base_pll_locked);
        assert!(status.ext_dcm_locked);
        assert!(status.ext_clock_valid);
        assert_eq!(status.ext_clock_freq_khz, 10_000);
        assert_eq!(status.adc_pll_locked, vec![true, true]);
        // Bench Gen2 boards report 425 tenths of a degree
        assert_eq!(status.adc_temperatures_c, vec![42.5, 42.5]);
        // HV: counts * 120 mV
        assert!((status.hv_set_volts[0] - 12.0).abs() < 1e-9);
        assert!((status.hv_mon_volts[3] - 48.12).abs() < 1e-9);
        // PC temperature sensors: (200 + i) * 0.1 C
        assert!((status.temperatures_c[0] - 20.0).abs() < 1e-9);
        assert!((status.temperatures_c[15] - 21.5).abs() < 1e-9);
        assert!(!status.dual_sata);
    }

    #[test]
    fn test_connect_requires_an_adc_board() {
        let bench = BenchDevice::spawn(BenchConfig {
            adc_cards: vec![],
            ..Default::default()
        })
        .unwrap();

        let err = Device::connect(config_for(&bench)).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceState(_)));
    }

    #[test]
    fn test_connect_requires_the_pc_board() {
        let bench = BenchDevice::spawn(BenchConfig {
            pc_card: false,
            ..Default::default()
        })
        .unwrap();

        let err = Device::connect(config_for(&bench)).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceState(_)));
    }

    #[test]
    fn test_stateless_commands_are_acknowledged() {
        let bench = BenchDevice::spawn(BenchConfig::default()).unwrap();
        let device = Device::connect(config_for(&bench)).unwrap();

        device.set_sample_count(100_000).unwrap();
        device.set_sample_divider(7).unwrap();
        device.set_octet(180).unwrap();
        device.start_streams(0b0011).unwrap();
        device.stop_streams().unwrap();
        device
            .set_trigger(TriggerConfig {
                rising: true,
                delay_ticks: 32,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_register_backed_configuration_roundtrips() {
        let bench = BenchDevice::spawn(BenchConfig::default()).unwrap();
        let mut device = Device::connect(config_for(&bench)).unwrap();

        device.set_channel_masks(0, [0xFF, 0x0F, 0x00, 0xAA]).unwrap();
        device.set_resolution(0, 12).unwrap();
        device.set_hv(1, 24.0).unwrap();

        let status = device.read_status().unwrap();
        // 24 V at 120 mV per count = 200 counts
        assert!((status.hv_set_volts[1] - 24.0).abs() < 1e-9);

        let plan = device.plan_streams(1000).unwrap();
        assert_eq!(plan.boards[0].resolution_bits, 12);
        assert_eq!(plan.boards[0].chip_masks, [0xFF, 0x0F, 0x00, 0xAA]);

        assert!(!device.dual_sata());
        device.set_dual_sata(true).unwrap();
        assert!(device.dual_sata());
        let status = device.read_status().unwrap();
        assert!(status.dual_sata);

        assert!(matches!(
            device.set_resolution(0, 10),
            Err(DeviceError::Config(_))
        ));
        assert!(matches!(
            device.set_resolution(9, 12),
            Err(DeviceError::Config(_))
        ));
    }
}
