//! Batched register access over the parallel data interface.
//!
//! Every operation targets `(card address, register start, length)` triples
//! in some board's flat register space. Reads and writes are batched: one
//! command frame carries the whole batch, with a device-side wait
//! instruction after each operation to let the internal bus settle, and the
//! answers are collected in order under the same transport lock. A failed
//! batch is retried from scratch — drain the socket, back off, rebuild the
//! frame — up to the configured attempt budget.
//!
//! Writes are verified by default: the same registers are read back and
//! compared byte-for-byte. Readback doubles the traffic, but this link is
//! lossy enough that an unverified register write is not worth the saved
//! round trip. A readback mismatch is a consistency error and is not
//! retried; a device that acknowledges a write and returns different data
//! will not improve on the second try.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use phobos_shared::command::{
    self, Answer, ByteStruct, ByteStructLen, PdiReadPayload, PdiWritePrefix,
};
use phobos_shared::registers::ByteOrder;

use crate::error::{DeviceError, Result};
use crate::retry::{self, RetryPolicy};
use crate::transport::{CommandTransport, TransportGuard};

/// One register read within a batch
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub card_address: u8,
    pub start: u32,
    pub length: u16,
    pub byte_order: ByteOrder,
    /// Return the raw bytes instead of decoding an integer
    pub as_raw: bool,
}

impl ReadRequest {
    /// Read raw bytes, e.g. a whole block dump
    pub fn raw(card_address: u8, start: u32, length: u16) -> Self {
        Self {
            card_address,
            start,
            length,
            byte_order: ByteOrder::Big,
            as_raw: true,
        }
    }

    /// Read an unsigned integer of up to 8 bytes
    pub fn int(card_address: u8, start: u32, length: u16, byte_order: ByteOrder) -> Self {
        Self {
            card_address,
            start,
            length,
            byte_order,
            as_raw: false,
        }
    }
}

/// One register write within a batch
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub card_address: u8,
    pub start: u32,
    pub data: Vec<u8>,
}

impl WriteRequest {
    /// Write raw bytes
    pub fn raw(card_address: u8, start: u32, data: Vec<u8>) -> Self {
        Self {
            card_address,
            start,
            data,
        }
    }

    /// Write an integer as `length` bytes in the given byte order.
    /// Bits above the register width are discarded.
    pub fn int(
        card_address: u8,
        start: u32,
        length: u8,
        byte_order: ByteOrder,
        value: u64,
    ) -> Self {
        let mut data = vec![0u8; length as usize];
        let mut v = value;
        match byte_order {
            ByteOrder::Big => {
                for b in data.iter_mut().rev() {
                    *b = v as u8;
                    v >>= 8;
                }
            }
            ByteOrder::Little => {
                for b in data.iter_mut() {
                    *b = v as u8;
                    v >>= 8;
                }
            }
        }
        Self {
            card_address,
            start,
            data,
        }
    }
}

/// A decoded read result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdiValue {
    Raw(Vec<u8>),
    Int(u64),
}

impl PdiValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Self::Raw(bytes) => Some(bytes),
            Self::Int(_) => None,
        }
    }
}

/// Whether a write batch verifies itself by reading back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readback {
    Verify,
    Skip,
}

/// The register access layer: batched reads/writes with retry
#[derive(Debug)]
pub struct Pdi {
    transport: Arc<CommandTransport>,
    policy: RetryPolicy,
    answer_timeout: Duration,
}

impl Pdi {
    pub fn new(
        transport: Arc<CommandTransport>,
        policy: RetryPolicy,
        answer_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            answer_timeout,
        }
    }

    /// Read a batch of registers. `wait_ms` is executed device-side after
    /// each read to let the internal bus settle before the next one.
    pub fn read(&self, requests: &[ReadRequest], wait_ms: u16) -> Result<Vec<PdiValue>> {
        if requests.is_empty() {
            return Err(DeviceError::config("empty PDI read batch"));
        }
        for (i, r) in requests.iter().enumerate() {
            if r.length == 0 {
                return Err(DeviceError::config(format!(
                    "PDI read request {i} has zero length"
                )));
            }
            if !r.as_raw && r.length > 8 {
                return Err(DeviceError::config(format!(
                    "PDI read request {i} wants an integer from {} bytes; up to 8 supported",
                    r.length
                )));
            }
        }

        retry::with_backoff(self.policy, |attempt| {
            let mut guard = self.transport.lock()?;
            if attempt > 0 {
                guard.drain();
            }
            guard.reset();
            let result = self.read_attempt(&mut guard, requests, wait_ms);
            if result.is_err() {
                guard.reset();
            }
            result
        })
    }

    fn read_attempt(
        &self,
        guard: &mut TransportGuard<'_>,
        requests: &[ReadRequest],
        wait_ms: u16,
    ) -> Result<Vec<PdiValue>> {
        for r in requests {
            let payload = PdiReadPayload {
                card_address: r.card_address,
                start: r.start,
                length: r.length,
            };
            let mut bytes = [0u8; PdiReadPayload::BYTE_LEN];
            payload.write_bytes(&mut bytes);
            guard.append(command::OP_PDI_READ, &bytes)?;
            guard.append(command::OP_WAIT, &wait_ms.to_be_bytes())?;
        }
        guard.flush()?;

        let mut values = Vec::with_capacity(requests.len());
        for (i, r) in requests.iter().enumerate() {
            let datagram = guard
                .get_answer(self.answer_timeout)?
                .ok_or(DeviceError::Timeout(self.answer_timeout.as_millis() as u64))?;
            let answer = Answer::parse(&datagram)
                .map_err(|e| DeviceError::protocol(format!("read answer {i}: {e}")))?;
            if answer.code != command::OP_PDI_READ {
                return Err(DeviceError::protocol(format!(
                    "read answer {i}: device echoed code {:#06x}",
                    answer.code
                )));
            }
            if answer.data.len() != r.length as usize {
                return Err(DeviceError::protocol(format!(
                    "read answer {i}: expected {} data bytes, got {}",
                    r.length,
                    answer.data.len()
                )));
            }
            values.push(if r.as_raw {
                PdiValue::Raw(answer.data)
            } else {
                PdiValue::Int(int_from_bytes(&answer.data, r.byte_order))
            });
        }
        Ok(values)
    }

    /// Write a batch of registers, then (unless skipped) read the same
    /// registers back and fail on any difference.
    pub fn write(&self, requests: &[WriteRequest], wait_ms: u16, readback: Readback) -> Result<()> {
        if requests.is_empty() {
            return Err(DeviceError::config("empty PDI write batch"));
        }
        for (i, r) in requests.iter().enumerate() {
            if r.data.is_empty() {
                return Err(DeviceError::config(format!(
                    "PDI write request {i} carries no data"
                )));
            }
        }

        retry::with_backoff(self.policy, |attempt| {
            let mut guard = self.transport.lock()?;
            if attempt > 0 {
                guard.drain();
            }
            guard.reset();
            let result = self.write_attempt(&mut guard, requests, wait_ms);
            if result.is_err() {
                guard.reset();
            }
            result
        })?;

        if readback == Readback::Verify {
            let reads: Vec<ReadRequest> = requests
                .iter()
                .map(|r| ReadRequest::raw(r.card_address, r.start, r.data.len() as u16))
                .collect();
            let values = self.read(&reads, wait_ms)?;
            for (i, (request, value)) in requests.iter().zip(values.iter()).enumerate() {
                let got = value.as_raw().unwrap_or(&[]);
                if got != request.data.as_slice() {
                    warn!(
                        "write readback mismatch at card {} start {:#x}",
                        request.card_address, request.start
                    );
                    return Err(DeviceError::consistency(format!(
                        "write {i} readback mismatch at card {} start {:#x}: \
                         wrote {:02x?}, read {:02x?}",
                        request.card_address, request.start, request.data, got
                    )));
                }
            }
        }
        Ok(())
    }

    fn write_attempt(
        &self,
        guard: &mut TransportGuard<'_>,
        requests: &[WriteRequest],
        wait_ms: u16,
    ) -> Result<()> {
        for r in requests {
            let prefix = PdiWritePrefix {
                card_address: r.card_address,
                start: r.start,
            };
            let mut payload = vec![0u8; PdiWritePrefix::BYTE_LEN];
            prefix.write_bytes(&mut payload);
            payload.extend_from_slice(&r.data);
            guard.append(command::OP_PDI_WRITE, &payload)?;
            guard.append(command::OP_WAIT, &wait_ms.to_be_bytes())?;
        }
        guard.flush()?;

        for i in 0..requests.len() {
            let datagram = guard
                .get_answer(self.answer_timeout)?
                .ok_or(DeviceError::Timeout(self.answer_timeout.as_millis() as u64))?;
            let answer = Answer::parse(&datagram)
                .map_err(|e| DeviceError::protocol(format!("write answer {i}: {e}")))?;
            if !answer.is_ack() {
                return Err(DeviceError::protocol(format!(
                    "write answer {i}: device answered {:#06x} instead of acknowledging",
                    answer.code
                )));
            }
        }
        Ok(())
    }

    /// Read one register's raw bytes
    pub fn read_register(&self, card_address: u8, start: u32, length: u16, wait_ms: u16) -> Result<Vec<u8>> {
        let values = self.read(&[ReadRequest::raw(card_address, start, length)], wait_ms)?;
        match values.into_iter().next() {
            Some(PdiValue::Raw(bytes)) => Ok(bytes),
            _ => Err(DeviceError::protocol("single read returned no raw value")),
        }
    }

    /// Write one register's raw bytes
    pub fn write_register(
        &self,
        card_address: u8,
        start: u32,
        data: Vec<u8>,
        wait_ms: u16,
        readback: Readback,
    ) -> Result<()> {
        self.write(&[WriteRequest::raw(card_address, start, data)], wait_ms, readback)
    }
}

fn int_from_bytes(bytes: &[u8], byte_order: ByteOrder) -> u64 {
    let mut value = 0u64;
    match byte_order {
        ByteOrder::Big => {
            for b in bytes {
                value = (value << 8) | *b as u64;
            }
        }
        ByteOrder::Little => {
            for b in bytes.iter().rev() {
                value = (value << 8) | *b as u64;
            }
        }
    }
    value
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bench::{BenchConfig, BenchDevice};
    use phobos_shared::CC_CARD_ADDRESS;

    fn pdi_for(bench: &BenchDevice, attempts: usize) -> Pdi {
        let transport =
            CommandTransport::open(0, bench.addr(), "pdi-test", 1500).unwrap();
        Pdi::new(
            Arc::new(transport),
            RetryPolicy::new(attempts, Duration::from_millis(1)),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn test_read_batch_with_mixed_widths() {
        let bench = BenchDevice::spawn(BenchConfig {
            serial: 31337,
            ..Default::default()
        })
        .unwrap();
        let pdi = pdi_for(&bench, 3);

        let values = pdi
            .read(
                &[
                    ReadRequest::int(CC_CARD_ADDRESS, 0, 4, ByteOrder::Big),
                    ReadRequest::raw(CC_CARD_ADDRESS, 4, 14),
                ],
                1,
            )
            .unwrap();

        assert_eq!(values[0].as_int(), Some(31337));
        assert_eq!(values[1].as_raw(), Some(&b"BSF12-0001-110"[..]));
    }

    #[test]
    fn test_malformed_batches_fail_before_io() {
        let bench = BenchDevice::spawn(BenchConfig::default()).unwrap();
        let pdi = pdi_for(&bench, 3);

        assert!(matches!(
            pdi.read(&[], 1),
            Err(DeviceError::Config(_))
        ));
        assert!(matches!(
            pdi.read(&[ReadRequest::int(CC_CARD_ADDRESS, 0, 10, ByteOrder::Big)], 1),
            Err(DeviceError::Config(_))
        ));
        assert!(matches!(
            pdi.write(&[], 1, Readback::Skip),
            Err(DeviceError::Config(_))
        ));
        assert!(matches!(
            pdi.write(
                &[WriteRequest::raw(CC_CARD_ADDRESS, 0, Vec::new())],
                1,
                Readback::Skip
            ),
            Err(DeviceError::Config(_))
        ));
    }

    #[test]
    fn test_retry_recovers_from_a_lost_answer() {
        let bench = BenchDevice::spawn(BenchConfig {
            drop_read_answers: 1,
            ..Default::default()
        })
        .unwrap();
        let pdi = pdi_for(&bench, 3);

        let values = pdi
            .read(&[ReadRequest::int(CC_CARD_ADDRESS, 0, 4, ByteOrder::Big)], 1)
            .unwrap();
        assert_eq!(values[0].as_int(), Some(BenchConfig::default().serial as u64));
    }

    #[test]
    fn test_retry_budget_exhausts() {
        let bench = BenchDevice::spawn(BenchConfig {
            drop_read_answers: 100,
            ..Default::default()
        })
        .unwrap();
        let pdi = pdi_for(&bench, 2);

        let err = pdi
            .read(&[ReadRequest::int(CC_CARD_ADDRESS, 0, 4, ByteOrder::Big)], 1)
            .unwrap_err();
        match err {
            DeviceError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, DeviceError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_write_then_read_back() {
        let bench = BenchDevice::spawn(BenchConfig::default()).unwrap();
        let pdi = pdi_for(&bench, 3);

        // Sample divider lives at 0x12 in both generations
        pdi.write(
            &[WriteRequest::int(CC_CARD_ADDRESS, 0x12, 2, ByteOrder::Big, 12)],
            1,
            Readback::Verify,
        )
        .unwrap();

        let values = pdi
            .read(&[ReadRequest::int(CC_CARD_ADDRESS, 0x12, 2, ByteOrder::Big)], 1)
            .unwrap();
        assert_eq!(values[0].as_int(), Some(12));
    }

    #[test]
    fn test_readback_mismatch_is_consistency_error() {
        let bench = BenchDevice::spawn(BenchConfig {
            corrupt_writes: true,
            ..Default::default()
        })
        .unwrap();
        let pdi = pdi_for(&bench, 3);

        let request = WriteRequest::int(CC_CARD_ADDRESS, 0x12, 2, ByteOrder::Big, 12);
        let err = pdi
            .write(&[request.clone()], 1, Readback::Verify)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Consistency(_)));

        // The same write without verification reports success; the caller
        // asked for exactly that trade.
        pdi.write(&[request], 1, Readback::Skip).unwrap();
    }
}
