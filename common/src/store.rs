use anyhow::Result;
use log::{info, warn};

use crate::config::{ConfigField, GreenhouseConfig, FLOAT_TOLERANCE};
use crate::hal::KvStore;

/// All keys live in this namespace on the device side.
pub const NAMESPACE: &str = "greenhouse";

pub mod keys {
    pub const TEMP_MIN: &str = "temp_min";
    pub const TEMP_MAX: &str = "temp_max";
    pub const HUM_MAX: &str = "hum_max";
    pub const SOIL_DRY: &str = "soil_dry";
    pub const SOIL_WET: &str = "soil_wet";
    pub const TANK_EMPTY: &str = "tank_empty";
    pub const TANK_FULL: &str = "tank_full";
    pub const CAL_AIR: &str = "cal_air";
    pub const CAL_WATER: &str = "cal_water";
    pub const CRASH_COUNT: &str = "crash_count";
    pub const RB_HAPPENED: &str = "rb_happened";
}

/// Typed settings access over a raw [`KvStore`], with the flash-wear guard:
/// a write that would store the value already present is suppressed, and
/// float writes within [`FLOAT_TOLERANCE`] of the stored value count as
/// already present.
pub struct SettingsStore<K: KvStore> {
    kv: K,
}

impl<K: KvStore> SettingsStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn put_f32(&mut self, key: &str, value: f32) -> Result<()> {
        if let Some(current) = self.kv.get_f32(key) {
            if (current - value).abs() <= FLOAT_TOLERANCE {
                return Ok(());
            }
        }
        self.kv.put_f32(key, value)
    }

    pub fn put_i32(&mut self, key: &str, value: i32) -> Result<()> {
        if self.kv.get_i32(key) == Some(value) {
            return Ok(());
        }
        self.kv.put_i32(key, value)
    }

    pub fn put_u8(&mut self, key: &str, value: u8) -> Result<()> {
        if self.kv.get_u8(key) == Some(value) {
            return Ok(());
        }
        self.kv.put_u8(key, value)
    }

    pub fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        if self.kv.get_bool(key) == Some(value) {
            return Ok(());
        }
        self.kv.put_bool(key, value)
    }

    /// Load the persisted configuration, falling back to defaults for any
    /// missing key. A record that fails validation (corrupted storage) is
    /// replaced wholesale by the defaults.
    pub fn load_config(&self) -> GreenhouseConfig {
        let defaults = GreenhouseConfig::default();
        let config = GreenhouseConfig {
            temp_min: self.kv.get_f32(keys::TEMP_MIN).unwrap_or(defaults.temp_min),
            temp_max: self.kv.get_f32(keys::TEMP_MAX).unwrap_or(defaults.temp_max),
            hum_max: self.kv.get_f32(keys::HUM_MAX).unwrap_or(defaults.hum_max),
            soil_dry: self.kv.get_i32(keys::SOIL_DRY).unwrap_or(defaults.soil_dry),
            soil_wet: self.kv.get_i32(keys::SOIL_WET).unwrap_or(defaults.soil_wet),
            tank_empty_dist: self
                .kv
                .get_i32(keys::TANK_EMPTY)
                .unwrap_or(defaults.tank_empty_dist),
            tank_full_dist: self
                .kv
                .get_i32(keys::TANK_FULL)
                .unwrap_or(defaults.tank_full_dist),
            cal_air_raw: self.kv.get_i32(keys::CAL_AIR).unwrap_or(defaults.cal_air_raw),
            cal_water_raw: self
                .kv
                .get_i32(keys::CAL_WATER)
                .unwrap_or(defaults.cal_water_raw),
        };

        if config.is_valid() {
            config
        } else {
            warn!("persisted configuration failed validation, using defaults");
            defaults
        }
    }

    pub fn save_field(&mut self, config: &GreenhouseConfig, field: ConfigField) -> Result<()> {
        match field {
            ConfigField::TempMin => self.put_f32(keys::TEMP_MIN, config.temp_min),
            ConfigField::TempMax => self.put_f32(keys::TEMP_MAX, config.temp_max),
            ConfigField::HumMax => self.put_f32(keys::HUM_MAX, config.hum_max),
            ConfigField::SoilDry => self.put_i32(keys::SOIL_DRY, config.soil_dry),
            ConfigField::SoilWet => self.put_i32(keys::SOIL_WET, config.soil_wet),
            ConfigField::TankEmptyDist => self.put_i32(keys::TANK_EMPTY, config.tank_empty_dist),
            ConfigField::TankFullDist => self.put_i32(keys::TANK_FULL, config.tank_full_dist),
            ConfigField::CalAir => self.put_i32(keys::CAL_AIR, config.cal_air_raw),
            ConfigField::CalWater => self.put_i32(keys::CAL_WATER, config.cal_water_raw),
        }
    }

    pub fn crash_count(&self) -> u8 {
        self.kv.get_u8(keys::CRASH_COUNT).unwrap_or(0)
    }

    pub fn set_crash_count(&mut self, value: u8) -> Result<()> {
        self.put_u8(keys::CRASH_COUNT, value)
    }

    pub fn rollback_happened(&self) -> bool {
        self.kv.get_bool(keys::RB_HAPPENED).unwrap_or(false)
    }

    pub fn set_rollback_happened(&mut self, value: bool) -> Result<()> {
        if value {
            info!("marking pending rollback alert");
        }
        self.put_bool(keys::RB_HAPPENED, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemKv;

    #[test]
    fn load_config_defaults_when_empty() {
        let store = SettingsStore::new(MemKv::default());
        assert_eq!(store.load_config(), GreenhouseConfig::default());
    }

    #[test]
    fn load_config_rejects_corrupted_record() {
        let mut kv = MemKv::default();
        kv.put_f32(keys::TEMP_MIN, 50.0).unwrap();
        kv.put_f32(keys::TEMP_MAX, 10.0).unwrap();

        let store = SettingsStore::new(kv);
        assert_eq!(store.load_config(), GreenhouseConfig::default());
    }

    #[test]
    fn float_wear_guard_suppresses_near_equal_writes() {
        let mut store = SettingsStore::new(MemKv::default());

        store.put_f32(keys::TEMP_MAX, 30.0).unwrap();
        store.put_f32(keys::TEMP_MAX, 30.05).unwrap();
        assert_eq!(store.kv.write_count(keys::TEMP_MAX), 1);

        store.put_f32(keys::TEMP_MAX, 31.0).unwrap();
        assert_eq!(store.kv.write_count(keys::TEMP_MAX), 2);
    }

    #[test]
    fn integral_wear_guard_suppresses_equal_writes() {
        let mut store = SettingsStore::new(MemKv::default());

        store.put_i32(keys::SOIL_DRY, 40).unwrap();
        store.put_i32(keys::SOIL_DRY, 40).unwrap();
        assert_eq!(store.kv.write_count(keys::SOIL_DRY), 1);

        store.put_bool(keys::RB_HAPPENED, true).unwrap();
        store.put_bool(keys::RB_HAPPENED, true).unwrap();
        assert_eq!(store.kv.write_count(keys::RB_HAPPENED), 1);
    }

    #[test]
    fn save_field_round_trips_through_load() {
        let mut store = SettingsStore::new(MemKv::default());
        let mut config = GreenhouseConfig::default();
        assert!(config.set_soil_dry(30));
        assert!(config.set_temp_max(35.0));

        store.save_field(&config, ConfigField::SoilDry).unwrap();
        store.save_field(&config, ConfigField::TempMax).unwrap();

        let loaded = store.load_config();
        assert_eq!(loaded.soil_dry, 30);
        assert_eq!(loaded.temp_max, 35.0);
        assert_eq!(loaded.soil_wet, 70);
    }
}
