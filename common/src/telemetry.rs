use serde::Serialize;

use crate::types::{Mode, RelayStates, SensorSnapshot};

/// Bounded RAM batch; reaching this size triggers a flush to the spool file
/// so a long offline stretch costs one flash write per 50 records.
pub const TELEMETRY_BATCH_MAX: usize = 50;

pub const ALERT_ROLLBACK_EXECUTED: &str = "ROLLBACK_EXECUTED";

/// One telemetry publish, wire shape fixed by the cloud side.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord<'a> {
    pub device_id: &'a str,
    pub version: &'static str,
    pub timestamp: u64,
    pub temp: f32,
    pub hum: f32,
    pub soil: i32,
    pub co2: i32,
    pub tvoc: i32,
    pub tank_level: i32,
    pub pump: u8,
    pub fan: u8,
    pub heater: u8,
    pub mode: &'static str,
}

impl<'a> TelemetryRecord<'a> {
    pub fn compose(
        device_id: &'a str,
        snapshot: &SensorSnapshot,
        relays: RelayStates,
        mode: Mode,
        timestamp: u64,
    ) -> Self {
        Self {
            device_id,
            version: crate::FIRMWARE_VERSION,
            timestamp,
            temp: snapshot.temp_c,
            hum: snapshot.hum_pct,
            soil: snapshot.soil_pct,
            co2: snapshot.eco2_ppm,
            tvoc: snapshot.tvoc_ppb,
            tank_level: snapshot.tank_level_pct,
            pump: u8::from(relays.pump),
            fan: u8::from(relays.fan),
            heater: u8::from(relays.heater),
            mode: mode.as_str(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub alert: &'static str,
    pub message: String,
    pub timestamp: u64,
}

impl AlertRecord {
    pub fn rollback_executed(timestamp: u64) -> Self {
        Self {
            alert: ALERT_ROLLBACK_EXECUTED,
            message: "rolled back to previous firmware after repeated boot failures".to_string(),
            timestamp,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// In-memory record accumulator for offline stretches.
#[derive(Debug, Default)]
pub struct TelemetryBatch {
    records: Vec<String>,
}

impl TelemetryBatch {
    /// Returns true when the batch reached the flush threshold.
    pub fn push(&mut self, line: String) -> bool {
        self.records.push(line);
        self.records.len() >= TELEMETRY_BATCH_MAX
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.records)
    }
}
