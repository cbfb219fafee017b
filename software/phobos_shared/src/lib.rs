#![doc = include_str!("../README.md")]
#![allow(clippy::needless_range_loop)]

pub mod command;
pub mod header;
pub mod registers;

pub use registers::{FirmwareGeneration, TriggerOpcodes};

/// The UDP port on which the instrument's CC board listens for command frames
pub const COMMAND_PORT: u16 = 9997;

/// Default local UDP port for receiving command answers.
/// The instrument addresses answers to whatever port the frame came from,
/// so this is configurable on the host side.
pub const DEFAULT_LISTEN_PORT: u16 = 9998;

/// The four UDP ports on which the host receives waveform stream packets,
/// one per stream in order
pub const STREAM_PORTS: [u16; 4] = [10000, 10001, 10002, 10003];

/// PDI card address of the Communication & Control board
pub const CC_CARD_ADDRESS: u8 = 1;

/// PDI card address of the Power & Control board
pub const PC_CARD_ADDRESS: u8 = 2;

/// PDI card addresses probed for ADC boards, in stream order
pub const ADC_CARD_ADDRESSES: [u8; 4] = [8, 9, 10, 11];

/// High nibble of an ADC board's version-code register when a board is present
pub const ADC_BOARD_MARKER: u8 = 0x2;

/// High nibble of the PC board's version-code register when the board is present
pub const PC_BOARD_MARKER: u8 = 0x4;

/// Number of 8-channel ADC chips on one ADC board
pub const CHIPS_PER_BOARD: usize = 4;

/// Number of channels per ADC chip
pub const CHANNELS_PER_CHIP: usize = 8;

/// Number of channels on one ADC board
pub const CHANNELS_PER_BOARD: usize = CHIPS_PER_BOARD * CHANNELS_PER_CHIP;

/// Maximum number of ADC boards (and therefore streams) in one instrument
pub const MAX_ADC_BOARDS: usize = 4;

/// Derive To/From with an added "Unknown" variant catch-all for converting
/// from numerical values that do not match a valid variant in order to
/// avoid either panicking or cumbersome error handling.
///
/// Yoinked shamelessly (with some modification) from smoltcp.
#[macro_export]
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr
            ),+ $(,)?
        }
    ) => {
        #[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
        $( #[$enum_attr] )*
        pub enum $name {
            $(
              $( #[$variant_attr] )*
              $variant
            ),*,
            /// Catch-all for values that do not match a variant
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}
