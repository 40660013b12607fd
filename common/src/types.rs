use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Auto,
    Manual,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    Pump,
    Fan,
    Heater,
}

impl Relay {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::Fan => "fan",
            Self::Heater => "heater",
        }
    }
}

/// One fresh air-quality sample. `None` from the driver means the sensor has
/// no new measurement this cycle and the previous values are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AirQuality {
    pub eco2_ppm: i32,
    pub tvoc_ppb: i32,
}

/// Latest coherent sensor readings. Written by the sensing task only;
/// consumers take a copy per cycle so multi-field reads are never torn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSnapshot {
    pub temp_c: f32,
    pub hum_pct: f32,
    pub eco2_ppm: i32,
    pub tvoc_ppb: i32,
    pub soil_pct: i32,
    pub distance_cm: f32,
    pub tank_level_pct: i32,
    pub sampled_at: u64,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self {
            temp_c: 0.0,
            hum_pct: 0.0,
            eco2_ppm: 400,
            tvoc_ppb: 0,
            soil_pct: 0,
            distance_cm: 0.0,
            tank_level_pct: 0,
            sampled_at: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStates {
    pub pump: bool,
    pub fan: bool,
    pub heater: bool,
}

impl RelayStates {
    pub fn get(self, relay: Relay) -> bool {
        match relay {
            Relay::Pump => self.pump,
            Relay::Fan => self.fan,
            Relay::Heater => self.heater,
        }
    }

    pub fn set(&mut self, relay: Relay, on: bool) {
        match relay {
            Relay::Pump => self.pump = on,
            Relay::Fan => self.fan = on,
            Relay::Heater => self.heater = on,
        }
    }
}
