#![doc = include_str!("../README.md")]

pub mod bench;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod pdi;
pub mod retry;
pub mod stream;
pub mod transport;

pub use config::DeviceConfig;
pub use device::{Device, DeviceStatus, TriggerConfig};
pub use error::{DeviceError, Result};
pub use stream::{StreamPlan, StreamReceiver};
