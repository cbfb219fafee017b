//! Command transport: framed instruction batches over a single UDP socket.
//!
//! The physical link allows exactly one outstanding transaction, so all use
//! goes through [`CommandTransport::lock`], which hands out a guard holding
//! the transport mutex. Holding the guard across a whole
//! build-flush-collect-answers exchange is what guarantees at-most-one
//! in-flight frame system-wide; callers on other threads block until their
//! turn.
//!
//! A frame is one UDP datagram: the fixed preamble identifying this client,
//! then zero or more appended instructions. Flushing transmits the frame and
//! resets the builder to a bare preamble, which is itself a legal frame
//! (used to terminate batches).

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace};

use phobos_shared::command::{ByteStruct, ByteStructLen, FramePreamble, InstructionHeader};

use crate::error::{DeviceError, Result};

/// IPv4 + UDP header bytes that count against the link MTU
const IP_UDP_OVERHEAD: usize = 28;

/// Receive buffer size, covering a full ethernet frame
const ANSWER_BUFFER_LEN: usize = 1522;

#[derive(Debug)]
pub struct CommandTransport {
    inner: Mutex<TransportInner>,
}

#[derive(Debug)]
struct TransportInner {
    socket: UdpSocket,
    /// Serialized preamble, re-applied after every flush
    preamble: Vec<u8>,
    /// Frame under construction, always starting with the preamble
    frame: Vec<u8>,
    /// Largest datagram the link carries without fragmenting
    max_datagram: usize,
}

impl CommandTransport {
    /// Bind the local answer port and aim the socket at the instrument's
    /// command port. `local_port` 0 picks an ephemeral port.
    pub fn open(
        local_port: u16,
        device: SocketAddr,
        client_ident: &str,
        mtu: usize,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .map_err(|e| DeviceError::link("unable to bind command socket", e))?;
        // Connecting filters inbound datagrams to the instrument's address
        socket
            .connect(device)
            .map_err(|e| DeviceError::link("unable to connect command socket", e))?;

        let max_datagram = mtu.saturating_sub(IP_UDP_OVERHEAD);
        if max_datagram <= FramePreamble::BYTE_LEN {
            return Err(DeviceError::config(format!(
                "mtu {mtu} leaves no room for instructions"
            )));
        }

        let mut preamble = vec![0u8; FramePreamble::BYTE_LEN];
        FramePreamble::new(client_ident).write_bytes(&mut preamble);
        let frame = preamble.clone();

        debug!("command transport open to {device}");
        Ok(Self {
            inner: Mutex::new(TransportInner {
                socket,
                preamble,
                frame,
                max_datagram,
            }),
        })
    }

    /// Acquire exclusive use of the transport for one exchange
    pub fn lock(&self) -> Result<TransportGuard<'_>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| DeviceError::consistency("command transport lock poisoned"))?;
        Ok(TransportGuard { inner })
    }

    /// Local socket address, mostly useful when bound ephemerally
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.lock()?
            .inner
            .socket
            .local_addr()
            .map_err(|e| DeviceError::link("unable to read local address", e))
    }
}

/// Exclusive handle to the transport for the duration of one exchange
pub struct TransportGuard<'a> {
    inner: MutexGuard<'a, TransportInner>,
}

impl TransportGuard<'_> {
    /// Discard any instructions appended but not yet flushed
    pub fn reset(&mut self) {
        let inner = &mut *self.inner;
        inner.frame.clear();
        inner.frame.extend_from_slice(&inner.preamble);
    }

    /// Append one instruction to the frame under construction.
    /// Fails, leaving the frame unchanged, if the result would not fit in
    /// one datagram; content is never silently truncated.
    pub fn append(&mut self, opcode: u16, payload: &[u8]) -> Result<()> {
        let inner = &mut *self.inner;
        let needed = inner.frame.len() + InstructionHeader::BYTE_LEN + payload.len();
        if needed > inner.max_datagram {
            return Err(DeviceError::consistency(format!(
                "instruction {opcode:#06x} would grow the frame to {needed} bytes; \
                 one datagram holds {}",
                inner.max_datagram
            )));
        }

        let header = InstructionHeader {
            opcode,
            length: payload.len() as u16,
        };
        let mut bytes = [0u8; InstructionHeader::BYTE_LEN];
        header.write_bytes(&mut bytes);
        inner.frame.extend_from_slice(&bytes);
        inner.frame.extend_from_slice(payload);
        Ok(())
    }

    /// Transmit the accumulated frame as one datagram and reset the builder
    pub fn flush(&mut self) -> Result<()> {
        let inner = &mut *self.inner;
        let sent = inner
            .socket
            .send(&inner.frame)
            .map_err(|e| DeviceError::link("failed to send command frame", e))?;
        if sent != inner.frame.len() {
            return Err(DeviceError::protocol(format!(
                "short send: {sent} of {} frame bytes",
                inner.frame.len()
            )));
        }
        trace!("sent command frame of {sent} bytes");

        inner.frame.clear();
        inner.frame.extend_from_slice(&inner.preamble);
        Ok(())
    }

    /// Flush, then give the device time to settle before the next exchange
    pub fn flush_after(&mut self, delay: Duration) -> Result<()> {
        self.flush()?;
        std::thread::sleep(delay);
        Ok(())
    }

    /// The composed convenience used for stateless commands: optionally
    /// append an instruction, optionally flush, optionally settle.
    /// `opcode: None` with `flush_now` flushes without appending, which
    /// terminates a pending batch.
    pub fn send_command(
        &mut self,
        opcode: Option<u16>,
        payload: &[u8],
        flush_now: bool,
        post_delay: Option<Duration>,
    ) -> Result<()> {
        match opcode {
            Some(op) => self.append(op, payload)?,
            None if !payload.is_empty() => {
                return Err(DeviceError::consistency(
                    "command payload provided without an opcode",
                ));
            }
            None => {}
        }
        if flush_now {
            match post_delay {
                Some(delay) => self.flush_after(delay)?,
                None => self.flush()?,
            }
        }
        Ok(())
    }

    /// Blocking receive of one answer datagram.
    ///
    /// `Ok(None)` means nothing arrived within the window, which is a
    /// normal outcome at this layer; callers decide whether silence is an
    /// error. Socket failures are link errors.
    pub fn get_answer(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let inner = &mut *self.inner;
        inner
            .socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| DeviceError::link("unable to set answer timeout", e))?;

        let mut buf = vec![0u8; ANSWER_BUFFER_LEN];
        match inner.socket.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                trace!("received answer of {n} bytes");
                Ok(Some(buf))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(DeviceError::link("failed to receive answer", e)),
        }
    }

    /// Receive and discard stray answers left over from a failed exchange,
    /// so the next attempt starts from a quiet socket.
    pub fn drain(&mut self) {
        let inner = &mut *self.inner;
        if inner.socket.set_nonblocking(true).is_err() {
            return;
        }
        let mut buf = [0u8; ANSWER_BUFFER_LEN];
        let mut drained = 0usize;
        while inner.socket.recv(&mut buf).is_ok() {
            drained += 1;
            if drained >= 1024 {
                break;
            }
        }
        let _ = inner.socket.set_nonblocking(false);
        if drained > 0 {
            debug!("drained {drained} stray answer datagrams");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use phobos_shared::command::{self, PREAMBLE_MAGIC};

    /// A socket standing in for the instrument's command port
    fn fake_device() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[test]
    fn test_frame_layout_on_the_wire() {
        let (device, addr) = fake_device();
        let transport = CommandTransport::open(0, addr, "test-client", 1500).unwrap();

        let mut guard = transport.lock().unwrap();
        guard.append(command::OP_NOP, &[]).unwrap();
        guard.append(command::OP_WAIT, &[0x00, 0x05]).unwrap();
        guard.flush().unwrap();
        drop(guard);

        let mut buf = [0u8; 1522];
        let (n, _) = device.recv_from(&mut buf).unwrap();
        let frame = &buf[..n];

        assert_eq!(&frame[..6], &PREAMBLE_MAGIC);
        assert_eq!(&frame[6..17], b"test-client");
        // First instruction: NOP with no payload
        assert_eq!(&frame[22..26], &[0x00, 0x00, 0x00, 0x00]);
        // Second: WAIT with a 2-byte payload
        assert_eq!(&frame[26..30], &[0x00, 0x01, 0x00, 0x02]);
        assert_eq!(&frame[30..32], &[0x00, 0x05]);
        assert_eq!(n, 32);
    }

    #[test]
    fn test_flush_resets_frame() {
        let (device, addr) = fake_device();
        let transport = CommandTransport::open(0, addr, "test-client", 1500).unwrap();

        let mut guard = transport.lock().unwrap();
        guard.append(command::OP_NOP, &[]).unwrap();
        guard.flush().unwrap();
        // A second flush sends a bare preamble
        guard.flush().unwrap();
        drop(guard);

        let mut buf = [0u8; 1522];
        let (first, _) = device.recv_from(&mut buf).unwrap();
        assert_eq!(first, 26);
        let (second, _) = device.recv_from(&mut buf).unwrap();
        assert_eq!(second, FramePreamble::BYTE_LEN);
    }

    #[test]
    fn test_send_command_without_opcode_flushes_only() {
        let (device, addr) = fake_device();
        let transport = CommandTransport::open(0, addr, "test-client", 1500).unwrap();

        let mut guard = transport.lock().unwrap();
        guard.send_command(None, &[], true, None).unwrap();
        drop(guard);

        let mut buf = [0u8; 1522];
        let (n, _) = device.recv_from(&mut buf).unwrap();
        assert_eq!(n, FramePreamble::BYTE_LEN);
    }

    #[test]
    fn test_oversized_instruction_is_rejected() {
        let (_device, addr) = fake_device();
        let transport = CommandTransport::open(0, addr, "test-client", 100).unwrap();

        let mut guard = transport.lock().unwrap();
        let payload = vec![0u8; 200];
        let err = guard.append(command::OP_TEST_ANSWER, &payload).unwrap_err();
        assert!(matches!(err, DeviceError::Consistency(_)));
        // The frame is untouched and still usable
        guard.append(command::OP_NOP, &[]).unwrap();
    }

    #[test]
    fn test_get_answer_roundtrip_and_timeout() {
        let (device, addr) = fake_device();
        let transport = CommandTransport::open(0, addr, "test-client", 1500).unwrap();

        let mut guard = transport.lock().unwrap();
        guard.send_command(Some(command::OP_NOP), &[], true, None).unwrap();

        let mut buf = [0u8; 1522];
        let (_, client) = device.recv_from(&mut buf).unwrap();
        device.send_to(b"hello from the device", client).unwrap();

        let answer = guard.get_answer(Duration::from_millis(500)).unwrap();
        assert_eq!(answer.unwrap(), b"hello from the device");

        // Nothing else queued: timeout is Ok(None), not an error
        let none = guard.get_answer(Duration::from_millis(10)).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_drain_discards_stray_answers() {
        let (device, addr) = fake_device();
        let transport = CommandTransport::open(0, addr, "test-client", 1500).unwrap();

        let mut guard = transport.lock().unwrap();
        guard.send_command(Some(command::OP_NOP), &[], true, None).unwrap();

        let mut buf = [0u8; 1522];
        let (_, client) = device.recv_from(&mut buf).unwrap();
        device.send_to(b"stale-1", client).unwrap();
        device.send_to(b"stale-2", client).unwrap();
        // Give the datagrams time to land in the receive queue
        std::thread::sleep(Duration::from_millis(50));

        guard.drain();
        let none = guard.get_answer(Duration::from_millis(10)).unwrap();
        assert!(none.is_none());
    }
}
