//! Error taxonomy for the device communication layer.
//!
//! Five categories with distinct handling policies:
//! - link errors are fatal to the current operation and never retried here
//! - protocol errors and timeouts are retried at the PDI layer
//! - consistency errors are caller/logic problems that retrying cannot fix
//! - device-state errors are fatal to `connect`
//!
//! All layers return explicit results; nothing in this crate uses panics
//! for error flow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    /// Socket create/bind/send/receive failure
    #[error("link error: {context}: {source}")]
    Link {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// No answer arrived within the receive window
    #[error("no answer from device within {0} ms")]
    Timeout(u64),

    /// The device answered, but not with what the protocol promises
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A logic or ordering violation that retrying cannot fix:
    /// readback mismatch, sequence regression, malformed batch
    #[error("consistency error: {0}")]
    Consistency(String),

    /// The instrument is not in a usable state: missing boards,
    /// unrecognized firmware
    #[error("device state error: {0}")]
    DeviceState(String),

    /// Bad host-side configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A whole retry budget was exhausted; `last` is the final failure
    #[error("{attempts} attempts failed; last error: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<DeviceError>,
    },
}

impl DeviceError {
    pub fn link(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Link {
            context: context.into(),
            source,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn device_state(msg: impl Into<String>) -> Self {
        Self::DeviceState(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the PDI layer should spend retry budget on this error.
    /// Only protocol violations and timeouts are worth a second attempt;
    /// everything else fails for a reason a resend cannot change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(DeviceError::Timeout(100).is_retryable());
        assert!(DeviceError::protocol("bad opcode echo").is_retryable());
        assert!(!DeviceError::consistency("readback mismatch").is_retryable());
        assert!(!DeviceError::device_state("no ADC boards").is_retryable());
        assert!(!DeviceError::link(
            "send",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "down")
        )
        .is_retryable());
    }

    #[test]
    fn test_exhausted_names_last_failure() {
        let err = DeviceError::RetriesExhausted {
            attempts: 5,
            last: Box::new(DeviceError::Timeout(100)),
        };
        let msg = err.to_string();
        assert!(msg.contains("5 attempts"));
        assert!(msg.contains("100 ms"));
    }
}
