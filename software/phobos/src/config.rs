//! Connection configuration for one instrument.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use phobos_shared::{COMMAND_PORT, DEFAULT_LISTEN_PORT, STREAM_PORTS};

use crate::retry::RetryPolicy;

/// Everything needed to reach and talk to one instrument.
///
/// The defaults match the instrument's factory network setup; tests override
/// the address and ports to run against a loopback bench device.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[non_exhaustive]
pub struct DeviceConfig {
    /// Instrument IPv4 address
    pub address: IpAddr,

    /// UDP port on which the CC board accepts command frames
    pub command_port: u16,

    /// Local UDP port for command answers; 0 picks an ephemeral port
    pub local_port: u16,

    /// Client identity string carried in every frame preamble,
    /// truncated to 15 bytes on the wire
    pub client_ident: String,

    /// How long to wait for each command answer, in milliseconds
    pub answer_timeout_ms: u64,

    /// Receive timeout for each stream socket, in milliseconds
    pub stream_timeout_ms: u64,

    /// Whole-batch retry budget for register access
    pub retry_attempts: usize,

    /// Delay between register access attempts, in milliseconds
    pub retry_backoff_ms: u64,

    /// Device-side settling delay between batched PDI operations,
    /// in milliseconds
    pub pdi_wait_ms: u16,

    /// Link MTU used to size command frames and stream packets
    pub mtu: usize,

    /// Local UDP ports for the four waveform streams; 0 picks ephemeral
    pub stream_ports: [u16; 4],
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::new(10, 123, 8, 100)),
            command_port: COMMAND_PORT,
            local_port: DEFAULT_LISTEN_PORT,
            client_ident: "phobos-host".to_owned(),
            answer_timeout_ms: 100,
            stream_timeout_ms: 5000,
            retry_attempts: 5,
            retry_backoff_ms: 10,
            pdi_wait_ms: 1,
            mtu: 1500,
            stream_ports: STREAM_PORTS,
        }
    }
}

impl DeviceConfig {
    /// Instrument at a specific address, everything else at defaults
    pub fn for_address(address: IpAddr) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Destination of command frames
    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.command_port)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ser_roundtrip() {
        let config = DeviceConfig::default();
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized = serde_json::from_str::<DeviceConfig>(&serialized).unwrap();
        let reserialized = serde_json::to_string(&deserialized).unwrap();
        assert_eq!(serialized, reserialized);
    }

    #[test]
    fn test_defaults_are_wired_to_wellknown_ports() {
        let config = DeviceConfig::default();
        assert_eq!(config.command_port, COMMAND_PORT);
        assert_eq!(config.stream_ports, STREAM_PORTS);
        assert_eq!(config.command_addr().port(), COMMAND_PORT);
    }
}
