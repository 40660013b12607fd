pub mod bootguard;
pub mod command;
pub mod config;
pub mod control;
pub mod display;
pub mod hal;
pub mod identity;
pub mod link;
pub mod sensing;
pub mod spool;
pub mod store;
pub mod telemetry;
pub mod topics;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use command::{handle_payload, CommandOutcome, MAX_COMMAND_BYTES};
pub use config::{ConfigField, GreenhouseConfig};
pub use control::ControlEngine;
pub use spool::{DrainOutcome, TelemetrySpool};
pub use store::SettingsStore;
pub use types::{AirQuality, Mode, Relay, RelayStates, SensorSnapshot};
