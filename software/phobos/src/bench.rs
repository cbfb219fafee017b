//! Software imitation of the instrument for hardware-out-of-the-loop testing.
//!
//! [`BenchDevice`] binds a loopback UDP socket, answers command frames the
//! way the CC board does, and backs PDI reads and writes with an in-memory
//! copy of each board's register block. The register content is generated
//! from the same tables the live code uses, so tests exercise the real
//! encode/decode paths end to end without hardware.

use std::collections::BTreeMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use phobos_shared::command::{
    self, AnswerHeader, ByteStruct, ByteStructLen, InstructionHeader, PdiReadPayload,
    PdiWritePrefix, ANSWER_ACK, DEVICE_HEADER_LEN, PREAMBLE_MAGIC,
};
use phobos_shared::registers::control::{
    self, parse_firmware_version, EXT_CLOCK_VALID, STATUS_BASE_PLL_LOCK, STATUS_EXT_DCM_LOCK,
};
use phobos_shared::registers::{adc, power, FirmwareGeneration, RegisterError};
use phobos_shared::{ADC_BOARD_MARKER, CC_CARD_ADDRESS, PC_BOARD_MARKER, PC_CARD_ADDRESS};

use crate::error::{DeviceError, Result};

/// Behavior of the simulated instrument
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Firmware identity string, selects the register layouts
    pub firmware: String,
    /// CC board serial number
    pub serial: u32,
    /// PDI card addresses at which ADC boards exist
    pub adc_cards: Vec<u8>,
    /// Whether the PC board exists
    pub pc_card: bool,
    /// Store every written byte with its low bit flipped, to exercise
    /// write-verification failures
    pub corrupt_writes: bool,
    /// Swallow the answers to this many PDI read instructions before
    /// behaving normally, to exercise the retry path
    pub drop_read_answers: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            firmware: "BSF12-0001-110".to_owned(),
            serial: 4242,
            adc_cards: vec![8, 9],
            pc_card: true,
            corrupt_writes: false,
            drop_read_answers: 0,
        }
    }
}

/// Handle to a running bench device; stops the thread when dropped
pub struct BenchDevice {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl BenchDevice {
    /// Start a simulated instrument on an ephemeral loopback port
    pub fn spawn(config: BenchConfig) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .map_err(|e| DeviceError::link("unable to bind bench device socket", e))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .map_err(|e| DeviceError::link("unable to set bench device timeout", e))?;
        let addr = socket
            .local_addr()
            .map_err(|e| DeviceError::link("unable to read bench device address", e))?;

        let memory = build_memory(&config)?;
        let stop = Arc::new(AtomicBool::new(false));
        let mut runner = BenchRunner {
            socket,
            memory,
            corrupt_writes: config.corrupt_writes,
            drop_read_answers: config.drop_read_answers,
            stop: stop.clone(),
        };
        let join = std::thread::Builder::new()
            .name("bench-device".to_owned())
            .spawn(move || runner.run_loop())
            .map_err(|e| DeviceError::link("unable to spawn bench device thread", e))?;

        debug!("bench device listening on {addr}");
        Ok(Self {
            addr,
            stop,
            join: Some(join),
        })
    }

    /// Address to aim a [`crate::transport::CommandTransport`] at
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal the runner thread to exit and wait for it
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for BenchDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reg_err(e: RegisterError) -> DeviceError {
    DeviceError::config(format!("bench register init: {e}"))
}

/// Populate each simulated board's register memory from the same tables the
/// live code decodes with
fn build_memory(config: &BenchConfig) -> Result<BTreeMap<u8, Vec<u8>>> {
    let version = parse_firmware_version(&config.firmware)
        .ok_or_else(|| DeviceError::config("bench firmware string is not parseable"))?;
    let generation = FirmwareGeneration::from_version(version);

    let mut memory = BTreeMap::new();

    // CC board: settings block at 0, variables block at VARIABLES_START
    let mut cc = vec![0u8; control::VARIABLES_START as usize + 0x40];
    let settings = generation.control_settings();
    settings.serial.encode(&mut cc, config.serial as i64).map_err(reg_err)?;
    {
        let dst = settings.firmware_string.start as usize;
        let bytes = config.firmware.as_bytes();
        let n = bytes.len().min(settings.firmware_string.length as usize);
        cc[dst..dst + n].copy_from_slice(&bytes[..n]);
    }
    settings.sample_divider.encode(&mut cc, 7).map_err(reg_err)?;
    settings.sample_count.encode(&mut cc, 100_000).map_err(reg_err)?;
    settings.octet.encode(&mut cc, 180).map_err(reg_err)?;

    let variables = generation.control_variables();
    {
        let vars = &mut cc[control::VARIABLES_START as usize..];
        variables
            .status
            .encode_bits(vars, &STATUS_BASE_PLL_LOCK, 1)
            .map_err(reg_err)?;
        variables
            .status
            .encode_bits(vars, &STATUS_EXT_DCM_LOCK, 1)
            .map_err(reg_err)?;
        variables
            .ext_clock_status
            .encode_bits(vars, &EXT_CLOCK_VALID, 1)
            .map_err(reg_err)?;
        variables.ext_clock_freq.encode(vars, 10_000).map_err(reg_err)?;
    }
    memory.insert(CC_CARD_ADDRESS, cc);

    // ADC boards
    let adc_regs = generation.adc();
    for &card in &config.adc_cards {
        let mut block = vec![0u8; adc::ADC_BLOCK_LENGTH as usize];
        adc_regs
            .board_version
            .encode(&mut block, ((ADC_BOARD_MARKER as i64) << 4) | 0x3)
            .map_err(reg_err)?;
        adc_regs.mc_version.encode(&mut block, 205).map_err(reg_err)?;
        adc_regs
            .serial
            .encode(&mut block, 1000 + card as i64)
            .map_err(reg_err)?;
        adc_regs
            .status
            .encode_bits(&mut block, &adc::ADC_BASE_PLL_LOCK, 1)
            .map_err(reg_err)?;
        let temp_counts = match generation {
            FirmwareGeneration::Gen1 => 42, // whole degrees
            FirmwareGeneration::Gen2 => 425, // tenths of a degree
        };
        adc_regs.temperature.encode(&mut block, temp_counts).map_err(reg_err)?;
        adc_regs.resolution.encode(&mut block, 14).map_err(reg_err)?;
        adc_regs.ring_buffer_size.encode(&mut block, 1024).map_err(reg_err)?;
        for chip in &adc_regs.channel_enable {
            chip.encode(&mut block, 0xFF).map_err(reg_err)?;
        }
        memory.insert(card, block);
    }

    // PC board
    if config.pc_card {
        let pc_regs = generation.power();
        let mut block = vec![0u8; power::POWER_BLOCK_LENGTH as usize];
        pc_regs
            .board_version
            .encode(&mut block, ((PC_BOARD_MARKER as i64) << 4) | 0x1)
            .map_err(reg_err)?;
        pc_regs.mc_version.encode(&mut block, 112).map_err(reg_err)?;
        pc_regs.serial.encode(&mut block, 77).map_err(reg_err)?;
        for (i, r) in pc_regs.hv_set.iter().enumerate() {
            r.encode(&mut block, 100 * (i as i64 + 1)).map_err(reg_err)?;
        }
        for (i, r) in pc_regs.hv_mon.iter().enumerate() {
            r.encode(&mut block, 100 * (i as i64 + 1) + 1).map_err(reg_err)?;
        }
        for (i, r) in pc_regs.temp_sensor.iter().enumerate() {
            r.encode(&mut block, 200 + i as i64).map_err(reg_err)?;
        }
        for r in &pc_regs.hv_calib {
            // 120 mV per count
            r.encode(&mut block, 120).map_err(reg_err)?;
        }
        memory.insert(PC_CARD_ADDRESS, block);
    }

    Ok(memory)
}

struct BenchRunner {
    socket: UdpSocket,
    /// Register memory per PDI card address; reads of absent cards yield zeros
    memory: BTreeMap<u8, Vec<u8>>,
    corrupt_writes: bool,
    drop_read_answers: usize,
    stop: Arc<AtomicBool>,
}

impl BenchRunner {
    fn run_loop(&mut self) {
        let mut buf = vec![0u8; 1522];
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let (size, from) = match self.socket.recv_from(&mut buf) {
                Ok(hit) => hit,
                Err(_) => continue,
            };
            let frame = buf[..size].to_vec();
            let answers = self.handle_frame(&frame);
            for answer in answers {
                if let Err(e) = self.socket.send_to(&answer, from) {
                    warn!("bench device failed to send answer: {e}");
                    return;
                }
            }
        }
    }

    /// Process one command frame and produce its answer datagrams in order
    fn handle_frame(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let mut answers = Vec::new();
        if frame.len() < 22 || frame[..6] != PREAMBLE_MAGIC {
            warn!("bench device ignoring datagram without preamble");
            return answers;
        }

        let mut idx = 22;
        while idx + InstructionHeader::BYTE_LEN <= frame.len() {
            let header = InstructionHeader::read_bytes(&frame[idx..idx + InstructionHeader::BYTE_LEN]);
            idx += InstructionHeader::BYTE_LEN;
            let end = idx + header.length as usize;
            if end > frame.len() {
                warn!("bench device ignoring truncated instruction");
                break;
            }
            let payload = &frame[idx..end];
            idx = end;

            match header.opcode {
                command::OP_PDI_READ => {
                    if payload.len() != PdiReadPayload::BYTE_LEN {
                        continue;
                    }
                    if self.drop_read_answers > 0 {
                        self.drop_read_answers -= 1;
                        continue;
                    }
                    let read = PdiReadPayload::read_bytes(payload);
                    let data = self.read_memory(read.card_address, read.start, read.length);
                    answers.push(build_answer(command::OP_PDI_READ, &data));
                }
                command::OP_PDI_WRITE => {
                    if payload.len() <= PdiWritePrefix::BYTE_LEN {
                        continue;
                    }
                    let prefix = PdiWritePrefix::read_bytes(&payload[..PdiWritePrefix::BYTE_LEN]);
                    let data = &payload[PdiWritePrefix::BYTE_LEN..];
                    self.write_memory(prefix.card_address, prefix.start, data);
                    answers.push(build_answer(ANSWER_ACK, &[]));
                }
                // Device-side delay between operations; produces no answer
                command::OP_WAIT => {}
                command::OP_TEST_ANSWER => {
                    answers.push(build_answer(command::OP_TEST_ANSWER, payload));
                }
                _ => {
                    answers.push(build_answer(ANSWER_ACK, &[]));
                }
            }
        }
        answers
    }

    fn read_memory(&self, card: u8, start: u32, length: u16) -> Vec<u8> {
        let mut data = vec![0u8; length as usize];
        if let Some(block) = self.memory.get(&card) {
            let start = start as usize;
            for (i, b) in data.iter_mut().enumerate() {
                if let Some(src) = block.get(start + i) {
                    *b = *src;
                }
            }
        }
        data
    }

    fn write_memory(&mut self, card: u8, start: u32, data: &[u8]) {
        let corrupt = self.corrupt_writes;
        if let Some(block) = self.memory.get_mut(&card) {
            let start = start as usize;
            for (i, b) in data.iter().enumerate() {
                if let Some(dst) = block.get_mut(start + i) {
                    *dst = if corrupt { *b ^ 0x01 } else { *b };
                }
            }
        }
    }
}

/// Serialize one answer datagram: opaque device header, answer header, data
fn build_answer(code: u16, data: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0u8; DEVICE_HEADER_LEN];
    let header = AnswerHeader {
        code,
        reserved: 0,
        data_length: data.len() as u16,
    };
    let mut bytes = [0u8; AnswerHeader::BYTE_LEN];
    header.write_bytes(&mut bytes);
    datagram.extend_from_slice(&bytes);
    datagram.extend_from_slice(data);
    datagram
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::CommandTransport;
    use phobos_shared::command::Answer;

    #[test]
    fn test_bench_answers_test_instruction() {
        let bench = BenchDevice::spawn(BenchConfig::default()).unwrap();
        let transport = CommandTransport::open(0, bench.addr(), "bench-test", 1500).unwrap();

        let mut guard = transport.lock().unwrap();
        guard
            .send_command(Some(command::OP_TEST_ANSWER), b"ping", true, None)
            .unwrap();
        let datagram = guard
            .get_answer(Duration::from_millis(500))
            .unwrap()
            .expect("bench device answered");
        let answer = Answer::parse(&datagram).unwrap();
        assert_eq!(answer.code, command::OP_TEST_ANSWER);
        assert_eq!(answer.data, b"ping");
    }

    #[test]
    fn test_bench_serves_identity_registers() {
        let config = BenchConfig {
            firmware: "BSF12-0001-103".to_owned(),
            serial: 99,
            ..Default::default()
        };
        let bench = BenchDevice::spawn(config).unwrap();
        let transport = CommandTransport::open(0, bench.addr(), "bench-test", 1500).unwrap();

        let payload = PdiReadPayload {
            card_address: CC_CARD_ADDRESS,
            start: 0,
            length: 18,
        };
        let mut bytes = [0u8; PdiReadPayload::BYTE_LEN];
        payload.write_bytes(&mut bytes);

        let mut guard = transport.lock().unwrap();
        guard
            .send_command(Some(command::OP_PDI_READ), &bytes, true, None)
            .unwrap();
        let datagram = guard
            .get_answer(Duration::from_millis(500))
            .unwrap()
            .expect("bench device answered");
        let answer = Answer::parse(&datagram).unwrap();
        assert_eq!(answer.code, command::OP_PDI_READ);
        assert_eq!(&answer.data[..4], &99u32.to_be_bytes());
        assert_eq!(&answer.data[4..18], b"BSF12-0001-103");
    }
}
