use serde::{Deserialize, Serialize};

/// Float setpoint changes within this band are not worth a flash write.
pub const FLOAT_TOLERANCE: f32 = 0.1;

const ADC_MAX: i32 = 4095;

/// Persisted tunables. Every setter validates the full candidate record and
/// commits only when the invariants hold; a rejected write leaves the record
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreenhouseConfig {
    pub temp_min: f32,
    pub temp_max: f32,
    pub hum_max: f32,
    pub soil_dry: i32,
    pub soil_wet: i32,
    pub tank_empty_dist: i32,
    pub tank_full_dist: i32,
    pub cal_air_raw: i32,
    pub cal_water_raw: i32,
}

impl Default for GreenhouseConfig {
    fn default() -> Self {
        Self {
            temp_min: 20.0,
            temp_max: 30.0,
            hum_max: 75.0,
            soil_dry: 40,
            soil_wet: 70,
            tank_empty_dist: 25,
            tank_full_dist: 5,
            cal_air_raw: 4095,
            cal_water_raw: 1670,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    TempMin,
    TempMax,
    HumMax,
    SoilDry,
    SoilWet,
    TankEmptyDist,
    TankFullDist,
    CalAir,
    CalWater,
}

impl ConfigField {
    pub fn key(self) -> &'static str {
        match self {
            Self::TempMin => "temp_min",
            Self::TempMax => "temp_max",
            Self::HumMax => "hum_max",
            Self::SoilDry => "soil_dry",
            Self::SoilWet => "soil_wet",
            Self::TankEmptyDist => "tank_empty",
            Self::TankFullDist => "tank_full",
            Self::CalAir => "cal_air",
            Self::CalWater => "cal_water",
        }
    }
}

impl GreenhouseConfig {
    pub fn is_valid(&self) -> bool {
        (0.0..=100.0).contains(&self.temp_min)
            && (0.0..=100.0).contains(&self.temp_max)
            && self.temp_min < self.temp_max
            && (0.0..=100.0).contains(&self.hum_max)
            && (0..=100).contains(&self.soil_dry)
            && (0..=100).contains(&self.soil_wet)
            && self.soil_dry < self.soil_wet
            && (1..1000).contains(&self.tank_full_dist)
            && (1..1000).contains(&self.tank_empty_dist)
            && self.tank_full_dist < self.tank_empty_dist
            && (0..=ADC_MAX).contains(&self.cal_air_raw)
            && (0..=ADC_MAX).contains(&self.cal_water_raw)
            && self.cal_air_raw != self.cal_water_raw
    }

    pub fn set_temp_min(&mut self, value: f32) -> bool {
        let previous = self.temp_min;
        self.commit_f32(|c| c.temp_min = value, previous, value)
    }

    pub fn set_temp_max(&mut self, value: f32) -> bool {
        let previous = self.temp_max;
        self.commit_f32(|c| c.temp_max = value, previous, value)
    }

    pub fn set_hum_max(&mut self, value: f32) -> bool {
        let previous = self.hum_max;
        self.commit_f32(|c| c.hum_max = value, previous, value)
    }

    pub fn set_soil_dry(&mut self, value: i32) -> bool {
        let previous = self.soil_dry;
        self.commit_i32(|c| c.soil_dry = value, previous, value)
    }

    pub fn set_soil_wet(&mut self, value: i32) -> bool {
        let previous = self.soil_wet;
        self.commit_i32(|c| c.soil_wet = value, previous, value)
    }

    pub fn set_tank_empty_dist(&mut self, value: i32) -> bool {
        let previous = self.tank_empty_dist;
        self.commit_i32(|c| c.tank_empty_dist = value, previous, value)
    }

    pub fn set_tank_full_dist(&mut self, value: i32) -> bool {
        let previous = self.tank_full_dist;
        self.commit_i32(|c| c.tank_full_dist = value, previous, value)
    }

    pub fn set_cal_air_raw(&mut self, value: i32) -> bool {
        let previous = self.cal_air_raw;
        self.commit_i32(|c| c.cal_air_raw = value, previous, value)
    }

    pub fn set_cal_water_raw(&mut self, value: i32) -> bool {
        let previous = self.cal_water_raw;
        self.commit_i32(|c| c.cal_water_raw = value, previous, value)
    }

    /// Returns whether the accepted value is worth persisting. A write that
    /// would break an invariant is rejected without mutating the record.
    fn commit_f32(&mut self, apply: impl Fn(&mut Self), previous: f32, value: f32) -> bool {
        if !value.is_finite() {
            return false;
        }
        let mut candidate = self.clone();
        apply(&mut candidate);
        if !candidate.is_valid() {
            return false;
        }
        *self = candidate;
        (previous - value).abs() > FLOAT_TOLERANCE
    }

    fn commit_i32(&mut self, apply: impl Fn(&mut Self), previous: i32, value: i32) -> bool {
        let mut candidate = self.clone();
        apply(&mut candidate);
        if !candidate.is_valid() {
            return false;
        }
        *self = candidate;
        previous != value
    }
}
