//! Capability seams toward the hardware. Sensor and actuator silicon is an
//! external collaborator; the firmware only depends on these contracts, so
//! the same task bodies run against ESP-IDF drivers and the host simulator.

use anyhow::Result;

use crate::types::{AirQuality, Relay};

pub trait Sensors {
    fn read_temp_humidity(&mut self) -> Result<(f32, f32)>;
    /// `Ok(None)` when the sensor has no fresh sample this cycle.
    fn read_air_quality(&mut self) -> Result<Option<AirQuality>>;
    fn read_soil_raw(&mut self) -> Result<i32>;
    /// Errs when the echo never arrives within the measurement timeout.
    fn measure_distance_cm(&mut self) -> Result<f32>;
}

pub trait Relays {
    fn set_relay(&mut self, relay: Relay, on: bool) -> Result<()>;
}

pub trait StatusLcd {
    fn lcd_write(&mut self, row: usize, text: &str) -> Result<()>;
}

pub trait FirmwareUpdater {
    /// Stream the image at `url` into the inactive slot. Returns only on
    /// failure; a successful update ends in a reboot.
    fn flash_update(&mut self, url: &str) -> Result<()>;
    fn flash_rollback(&mut self) -> Result<()>;
    fn rollback_available(&self) -> bool;
}

/// Raw typed key/value backend (NVS on device, a JSON file on the host).
/// The flash-wear guard lives one layer up, in [`crate::store::SettingsStore`].
pub trait KvStore {
    fn get_f32(&self, key: &str) -> Option<f32>;
    fn put_f32(&mut self, key: &str, value: f32) -> Result<()>;
    fn get_i32(&self, key: &str) -> Option<i32>;
    fn put_i32(&mut self, key: &str, value: i32) -> Result<()>;
    fn get_u8(&self, key: &str) -> Option<u8>;
    fn put_u8(&mut self, key: &str, value: u8) -> Result<()>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn put_bool(&mut self, key: &str, value: bool) -> Result<()>;
}

/// Flat-directory filesystem surface used by the telemetry spool. Names are
/// bare file names; the backend owns the base path.
pub trait SpoolFs {
    fn append_line(&mut self, name: &str, line: &str) -> Result<()>;
    fn read_lines(&self, name: &str) -> Result<Vec<String>>;
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;
    fn remove(&mut self, name: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<String>>;
}
