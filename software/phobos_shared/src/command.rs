//! Command-channel wire format: frame preamble, instruction records, answer
//! records, and the opcode table.
//!
//! A command frame is one UDP datagram: a fixed 22-byte preamble identifying
//! the sender, followed by zero or more instructions. Each instruction is a
//! big-endian `{opcode: u16, length: u16}` header plus `length` payload
//! bytes. A frame with no instructions is legal and terminates a batch.
//!
//! Every answer datagram starts with a 22-byte device header (opaque at this
//! layer), then a big-endian `{code: u16, reserved: u16, data_length: u16}`
//! header plus `data_length` bytes. Data-bearing answers echo the
//! instruction opcode as `code`; acknowledge-only answers carry
//! [`ANSWER_ACK`] and no data.

use byte_struct::*;
pub use byte_struct::{ByteStruct, ByteStructLen};

/// Magic at the start of every outgoing frame
pub const PREAMBLE_MAGIC: [u8; 6] = *b"DDToIP";

/// Length of the client identity string in the preamble
pub const CLIENT_IDENT_LEN: usize = 15;

/// Command protocol version sent in the preamble
pub const PROTOCOL_VERSION: u8 = 3;

/// Length of the opaque device header at the start of every answer
pub const DEVICE_HEADER_LEN: usize = 22;

/// Answer code for an acknowledge-only answer
pub const ANSWER_ACK: u16 = 0xFF00;

/// Fixed 22-byte preamble at the start of every outgoing command frame
#[derive(ByteStruct, Clone, Copy, Debug)]
#[byte_struct_be]
pub struct FramePreamble {
    pub magic: [u8; 6],
    /// NUL-padded ASCII name of the sending client
    pub client_ident: [u8; CLIENT_IDENT_LEN],
    pub version: u8,
}

impl FramePreamble {
    /// Build a preamble for a client identity string, truncating or
    /// NUL-padding to the fixed width
    pub fn new(client_ident: &str) -> Self {
        let mut ident = [0u8; CLIENT_IDENT_LEN];
        for (dst, src) in ident.iter_mut().zip(client_ident.bytes()) {
            *dst = src;
        }
        Self {
            magic: PREAMBLE_MAGIC,
            client_ident: ident,
            version: PROTOCOL_VERSION,
        }
    }
}

/// Header of one instruction within a command frame
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_be]
pub struct InstructionHeader {
    pub opcode: u16,
    pub length: u16,
}

/// Header of the answer body following the 22-byte device header
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_be]
pub struct AnswerHeader {
    pub code: u16,
    pub reserved: u16,
    pub data_length: u16,
}

/// A parsed answer datagram: the answer code and a copy of its data bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub code: u16,
    pub data: Vec<u8>,
}

/// Parse error for malformed answer datagrams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedAnswer {
    pub reason: &'static str,
    pub datagram_len: usize,
}

impl core::fmt::Display for MalformedAnswer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "malformed answer datagram ({} bytes): {}",
            self.datagram_len, self.reason
        )
    }
}

impl std::error::Error for MalformedAnswer {}

impl Answer {
    /// Parse one answer datagram, skipping the opaque device header
    pub fn parse(datagram: &[u8]) -> Result<Self, MalformedAnswer> {
        let body_start = DEVICE_HEADER_LEN;
        let data_start = body_start + AnswerHeader::BYTE_LEN;
        if datagram.len() < data_start {
            return Err(MalformedAnswer {
                reason: "shorter than device header + answer header",
                datagram_len: datagram.len(),
            });
        }
        let header = AnswerHeader::read_bytes(&datagram[body_start..data_start]);
        let data_end = data_start + header.data_length as usize;
        if datagram.len() < data_end {
            return Err(MalformedAnswer {
                reason: "answer data truncated",
                datagram_len: datagram.len(),
            });
        }
        Ok(Self {
            code: header.code,
            data: datagram[data_start..data_end].to_vec(),
        })
    }

    /// Whether this is a plain acknowledgement
    pub fn is_ack(&self) -> bool {
        self.code == ANSWER_ACK
    }
}

// Opcode table. Opcodes are grouped in numeric ranges by concern; both
// firmware generations share the table except where noted.

// General / reset: 0x00xx
pub const OP_NOP: u16 = 0x0000; // No operation, always acknowledged
pub const OP_WAIT: u16 = 0x0001; // Device-side delay; payload u16 milliseconds
pub const OP_LAST_INSTRUCTION: u16 = 0x0002; // Marks the end of a multi-frame batch
pub const OP_RESET_CC: u16 = 0x0010; // Soft-reset the CC board
pub const OP_RESTART_FIRMWARE: u16 = 0x0011; // Restart firmware without power cycle
pub const OP_TEST_ANSWER: u16 = 0x0020; // Echo payload back, link test

// Configuration: 0x01xx
pub const OP_STORE_SETTINGS: u16 = 0x0100; // Persist the settings block to flash
pub const OP_LOAD_SETTINGS: u16 = 0x0101; // Reload the settings block from flash

// Network: 0x02xx
pub const OP_SET_IP: u16 = 0x0200; // Payload: 4-byte device IPv4 address
pub const OP_SET_STREAM_TARGET: u16 = 0x0210; // Payload: stream index u8 + host IPv4 + port u16
pub const OP_SET_MTU: u16 = 0x0220; // Payload: u16 link MTU

// Clock / PLL: 0x03xx
pub const OP_SET_BASE_PLL: u16 = 0x0300; // Payload: mult u8 + div u8
pub const OP_SET_SAMPLE_DIVIDER: u16 = 0x0301; // Payload: u16 divider
pub const OP_SELECT_CLOCK_SOURCE: u16 = 0x0302; // Payload: clock control register image
pub const OP_SET_EXT_DCM: u16 = 0x0303; // Payload: mult u8 + div u8

// Streaming control: 0x04xx
pub const OP_START_STREAMS: u16 = 0x0400; // Payload: stream enable mask u8
pub const OP_STOP_STREAMS: u16 = 0x0401; // No payload, stops all streams
pub const OP_SET_OCTET: u16 = 0x0402; // Payload: u16 8-byte groups per packet
pub const OP_SET_SAMPLE_COUNT: u16 = 0x0403; // Payload: u48 sample count
pub const OP_SET_TRIGGER: u16 = 0x0410; // Gen1 only: combined trigger setup
pub const OP_SET_TRIGGER_EDGE: u16 = 0x0411; // Gen2: edge selection, replaces OP_SET_TRIGGER
pub const OP_SET_TRIGGER_GATE: u16 = 0x0412; // Gen2: gate setup, replaces OP_SET_TRIGGER

// Camera timer: 0x05xx (thin register-write wrappers live outside this core)
pub const OP_TIMER_LOAD: u16 = 0x0500; // Payload: timer program words
pub const OP_TIMER_ARM: u16 = 0x0501; // Payload: u8 arm flag
pub const OP_TIMER_RUN: u16 = 0x0502; // Payload: u8 run flag

// SCB: 0x06xx
pub const OP_SCB_READ: u16 = 0x0600; // Payload: address u16
pub const OP_SCB_WRITE: u16 = 0x0601; // Payload: address u16 + data u8

// Parallel data interface: 0x07xx
pub const OP_PDI_READ: u16 = 0x0700; // Payload: card u8 + start u32 + length u16
pub const OP_PDI_WRITE: u16 = 0x0701; // Payload: card u8 + start u32 + data bytes

// Flash: 0x08xx
pub const OP_FLASH_ERASE: u16 = 0x0800; // Payload: page index u16
pub const OP_FLASH_PAGE_WRITE: u16 = 0x0801; // Payload: page index u16 + page bytes
pub const OP_FLASH_PAGE_READ: u16 = 0x0802; // Payload: page index u16

// Firmware upgrade: 0x09xx (chunked-write loop lives outside this core)
pub const OP_UPGRADE_BEGIN: u16 = 0x0900; // Payload: image length u32
pub const OP_UPGRADE_CHUNK: u16 = 0x0901; // Payload: offset u32 + chunk bytes
pub const OP_UPGRADE_COMMIT: u16 = 0x0902; // Payload: image CRC u32

/// Payload of an [`OP_PDI_READ`] instruction
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_be]
pub struct PdiReadPayload {
    pub card_address: u8,
    pub start: u32,
    pub length: u16,
}

/// Fixed-size prefix of an [`OP_PDI_WRITE`] payload; the register data
/// bytes follow immediately after
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_be]
pub struct PdiWritePrefix {
    pub card_address: u8,
    pub start: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_preamble_layout() {
        let preamble = FramePreamble::new("phobos-host");
        let mut bytes = [0u8; FramePreamble::BYTE_LEN];
        preamble.write_bytes(&mut bytes);

        assert_eq!(FramePreamble::BYTE_LEN, 22);
        assert_eq!(&bytes[..6], b"DDToIP");
        assert_eq!(&bytes[6..17], b"phobos-host");
        assert_eq!(bytes[17..21], [0, 0, 0, 0]);
        assert_eq!(bytes[21], PROTOCOL_VERSION);
    }

    #[test]
    fn test_preamble_truncates_long_ident() {
        let preamble = FramePreamble::new("a-client-name-that-is-too-long");
        assert_eq!(&preamble.client_ident[..], b"a-client-name-t");
    }

    #[test]
    fn test_instruction_header_is_big_endian() {
        let header = InstructionHeader {
            opcode: OP_PDI_READ,
            length: 7,
        };
        let mut bytes = [0u8; InstructionHeader::BYTE_LEN];
        header.write_bytes(&mut bytes);
        assert_eq!(bytes, [0x07, 0x00, 0x00, 0x07]);
    }

    #[test]
    fn test_answer_parse() {
        let mut datagram = vec![0u8; DEVICE_HEADER_LEN];
        datagram.extend_from_slice(&[0x07, 0x00, 0, 0, 0x00, 0x03]); // code, reserved, len
        datagram.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        let answer = Answer::parse(&datagram).unwrap();
        assert_eq!(answer.code, OP_PDI_READ);
        assert_eq!(answer.data, vec![0xAA, 0xBB, 0xCC]);
        assert!(!answer.is_ack());
    }

    #[test]
    fn test_answer_parse_ack() {
        let mut datagram = vec![0u8; DEVICE_HEADER_LEN];
        datagram.extend_from_slice(&[0xFF, 0x00, 0, 0, 0, 0]);
        let answer = Answer::parse(&datagram).unwrap();
        assert!(answer.is_ack());
        assert!(answer.data.is_empty());
    }

    #[test]
    fn test_answer_parse_rejects_short() {
        assert!(Answer::parse(&[0u8; 10]).is_err());

        // Header promises more data than the datagram carries
        let mut datagram = vec![0u8; DEVICE_HEADER_LEN];
        datagram.extend_from_slice(&[0x07, 0x00, 0, 0, 0x00, 0x10]);
        datagram.extend_from_slice(&[0xAA]);
        assert!(Answer::parse(&datagram).is_err());
    }
}
