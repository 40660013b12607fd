//! In-memory fakes for the persistence and sensor seams.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::hal::{KvStore, Sensors, SpoolFs};
use crate::types::AirQuality;

#[derive(Debug, Clone, Copy, PartialEq)]
enum KvValue {
    F32(f32),
    I32(i32),
    U8(u8),
    Bool(bool),
}

#[derive(Debug, Default)]
pub struct MemKv {
    values: HashMap<String, KvValue>,
    writes: HashMap<String, usize>,
}

impl MemKv {
    pub fn write_count(&self, key: &str) -> usize {
        self.writes.get(key).copied().unwrap_or(0)
    }

    fn write(&mut self, key: &str, value: KvValue) {
        self.values.insert(key.to_string(), value);
        *self.writes.entry(key.to_string()).or_insert(0) += 1;
    }
}

impl KvStore for MemKv {
    fn get_f32(&self, key: &str) -> Option<f32> {
        match self.values.get(key) {
            Some(KvValue::F32(value)) => Some(*value),
            _ => None,
        }
    }

    fn put_f32(&mut self, key: &str, value: f32) -> Result<()> {
        self.write(key, KvValue::F32(value));
        Ok(())
    }

    fn get_i32(&self, key: &str) -> Option<i32> {
        match self.values.get(key) {
            Some(KvValue::I32(value)) => Some(*value),
            _ => None,
        }
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<()> {
        self.write(key, KvValue::I32(value));
        Ok(())
    }

    fn get_u8(&self, key: &str) -> Option<u8> {
        match self.values.get(key) {
            Some(KvValue::U8(value)) => Some(*value),
            _ => None,
        }
    }

    fn put_u8(&mut self, key: &str, value: u8) -> Result<()> {
        self.write(key, KvValue::U8(value));
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(KvValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.write(key, KvValue::Bool(value));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemFs {
    files: HashMap<String, Vec<String>>,
}

impl SpoolFs for MemFs {
    fn append_line(&mut self, name: &str, line: &str) -> Result<()> {
        self.files
            .entry(name.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    fn read_lines(&self, name: &str) -> Result<Vec<String>> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {name}"))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let lines = self
            .files
            .remove(from)
            .ok_or_else(|| anyhow!("no such file: {from}"))?;
        self.files.insert(to.to_string(), lines);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        self.files
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no such file: {name}"))
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }
}

/// Fixed-response sensor bank for the acquisition tests.
pub struct ScriptedSensors {
    temp_hum: Result<(f32, f32)>,
    air: Result<Option<AirQuality>>,
    soil: Result<i32>,
    distance: Result<f32>,
}

impl ScriptedSensors {
    pub fn steady(
        temp_c: f32,
        hum_pct: f32,
        air: Option<AirQuality>,
        soil_raw: i32,
        distance_cm: f32,
    ) -> Self {
        Self {
            temp_hum: Ok((temp_c, hum_pct)),
            air: Ok(air),
            soil: Ok(soil_raw),
            distance: Ok(distance_cm),
        }
    }

    pub fn failing() -> Self {
        Self {
            temp_hum: Err(anyhow!("i2c bus error")),
            air: Err(anyhow!("i2c bus error")),
            soil: Err(anyhow!("adc error")),
            distance: Err(anyhow!("echo timeout")),
        }
    }
}

fn clone_result<T: Copy>(result: &Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(*value),
        Err(err) => Err(anyhow!("{err:#}")),
    }
}

impl Sensors for ScriptedSensors {
    fn read_temp_humidity(&mut self) -> Result<(f32, f32)> {
        clone_result(&self.temp_hum)
    }

    fn read_air_quality(&mut self) -> Result<Option<AirQuality>> {
        clone_result(&self.air)
    }

    fn read_soil_raw(&mut self) -> Result<i32> {
        clone_result(&self.soil)
    }

    fn measure_distance_cm(&mut self) -> Result<f32> {
        clone_result(&self.distance)
    }
}
