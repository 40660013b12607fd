//! Broker command dispatch: one JSON object per message, any subset of the
//! recognized fields. Fields are applied in a fixed order (configuration,
//! then mode, then overrides, then update) so a mode switch and an override
//! in the same payload compose the way the app expects. Invalid fields are
//! dropped silently; valid siblings in the same payload still apply.

use log::warn;
use serde_json::{Map, Value};

use crate::config::{ConfigField, GreenhouseConfig};
use crate::control::ControlEngine;
use crate::types::{Mode, Relay};

/// Hard ceiling; anything larger is dropped whole.
pub const MAX_COMMAND_BYTES: usize = 10 * 1024;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommandOutcome {
    /// Config fields that changed enough to be persisted.
    pub persisted: Vec<ConfigField>,
    pub mode_changed: Option<Mode>,
    pub overrides_applied: Vec<(Relay, bool)>,
    pub update_url: Option<String>,
}

impl CommandOutcome {
    pub fn is_empty(&self) -> bool {
        self.persisted.is_empty()
            && self.mode_changed.is_none()
            && self.overrides_applied.is_empty()
            && self.update_url.is_none()
    }
}

/// Returns `None` when the whole payload is dropped (oversized, not JSON,
/// not an object).
pub fn handle_payload(
    payload: &[u8],
    config: &mut GreenhouseConfig,
    engine: &mut ControlEngine,
) -> Option<CommandOutcome> {
    if payload.len() > MAX_COMMAND_BYTES {
        warn!("dropping oversized command payload ({} bytes)", payload.len());
        return None;
    }

    let doc: Value = match serde_json::from_slice(payload) {
        Ok(doc) => doc,
        Err(err) => {
            warn!("dropping malformed command payload: {err}");
            return None;
        }
    };
    let Some(fields) = doc.as_object() else {
        warn!("dropping non-object command payload");
        return None;
    };

    let mut outcome = CommandOutcome::default();
    apply_config_fields(fields, config, &mut outcome);
    apply_mode(fields, engine, &mut outcome);
    apply_overrides(fields, engine, &mut outcome);
    apply_update_url(fields, &mut outcome);

    Some(outcome)
}

fn apply_config_fields(
    fields: &Map<String, Value>,
    config: &mut GreenhouseConfig,
    outcome: &mut CommandOutcome,
) {
    if let Some(value) = field_f32(fields, &["temp_min", "min_temp"]) {
        if config.set_temp_min(value) {
            outcome.persisted.push(ConfigField::TempMin);
        }
    }
    if let Some(value) = field_f32(fields, &["temp_max", "max_temp"]) {
        if config.set_temp_max(value) {
            outcome.persisted.push(ConfigField::TempMax);
        }
    }
    if let Some(value) = field_f32(fields, &["hum_max", "max_hum"]) {
        if config.set_hum_max(value) {
            outcome.persisted.push(ConfigField::HumMax);
        }
    }
    if let Some(value) = field_i32(fields, "soil_dry") {
        if config.set_soil_dry(value) {
            outcome.persisted.push(ConfigField::SoilDry);
        }
    }
    if let Some(value) = field_i32(fields, "soil_wet") {
        if config.set_soil_wet(value) {
            outcome.persisted.push(ConfigField::SoilWet);
        }
    }
    if let Some(value) = field_i32(fields, "tank_empty_dist") {
        if config.set_tank_empty_dist(value) {
            outcome.persisted.push(ConfigField::TankEmptyDist);
        }
    }
    if let Some(value) = field_i32(fields, "tank_full_dist") {
        if config.set_tank_full_dist(value) {
            outcome.persisted.push(ConfigField::TankFullDist);
        }
    }
    if let Some(value) = field_i32(fields, "cal_air") {
        if config.set_cal_air_raw(value) {
            outcome.persisted.push(ConfigField::CalAir);
        }
    }
    if let Some(value) = field_i32(fields, "cal_water") {
        if config.set_cal_water_raw(value) {
            outcome.persisted.push(ConfigField::CalWater);
        }
    }
}

fn apply_mode(fields: &Map<String, Value>, engine: &mut ControlEngine, outcome: &mut CommandOutcome) {
    let Some(value) = fields.get("mode") else {
        return;
    };
    let Some(mode) = parse_mode(value) else {
        warn!("ignoring unrecognized mode value: {value}");
        return;
    };
    if engine.set_mode(mode) {
        outcome.mode_changed = Some(mode);
    }
}

fn apply_overrides(
    fields: &Map<String, Value>,
    engine: &mut ControlEngine,
    outcome: &mut CommandOutcome,
) {
    for (key, relay) in [
        ("pump", Relay::Pump),
        ("fan", Relay::Fan),
        ("heater", Relay::Heater),
    ] {
        let Some(value) = fields.get(key).and_then(Value::as_i64) else {
            continue;
        };
        if value != 0 && value != 1 {
            continue;
        }
        if engine.set_override(relay, value == 1) {
            outcome.overrides_applied.push((relay, value == 1));
        }
    }
}

fn apply_update_url(fields: &Map<String, Value>, outcome: &mut CommandOutcome) {
    let Some(url) = fields.get("update_url").and_then(Value::as_str) else {
        return;
    };
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        outcome.update_url = Some(url.to_string());
    } else {
        warn!("ignoring update_url without an http(s) scheme");
    }
}

/// Case-insensitive "AUTO"/"MANUAL"; "0"/"1" accepted as string or number.
fn parse_mode(value: &Value) -> Option<Mode> {
    match value {
        Value::String(text) => match text.to_ascii_uppercase().as_str() {
            "AUTO" | "0" => Some(Mode::Auto),
            "MANUAL" | "1" => Some(Mode::Manual),
            _ => None,
        },
        Value::Number(number) => match number.as_i64() {
            Some(0) => Some(Mode::Auto),
            Some(1) => Some(Mode::Manual),
            _ => None,
        },
        _ => None,
    }
}

fn field_f32(fields: &Map<String, Value>, names: &[&str]) -> Option<f32> {
    names
        .iter()
        .find_map(|name| fields.get(*name))
        .and_then(Value::as_f64)
        .map(|value| value as f32)
}

fn field_i32(fields: &Map<String, Value>, name: &str) -> Option<i32> {
    fields
        .get(name)
        .and_then(Value::as_i64)
        .and_then(|value| i32::try_from(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch(
        payload: &str,
        config: &mut GreenhouseConfig,
        engine: &mut ControlEngine,
    ) -> Option<CommandOutcome> {
        handle_payload(payload.as_bytes(), config, engine)
    }

    #[test]
    fn setpoint_update_with_alias() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let outcome = dispatch(r#"{"min_temp": 18.5}"#, &mut config, &mut engine).unwrap();

        assert_eq!(config.temp_min, 18.5);
        assert_eq!(outcome.persisted, vec![ConfigField::TempMin]);
    }

    #[test]
    fn invalid_pair_leaves_config_untouched() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let outcome =
            dispatch(r#"{"temp_min": 35, "temp_max": 30}"#, &mut config, &mut engine).unwrap();

        assert_eq!(config, GreenhouseConfig::default());
        assert!(outcome.persisted.is_empty());
    }

    #[test]
    fn invalid_field_does_not_block_siblings() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let outcome =
            dispatch(r#"{"soil_dry": 150, "soil_wet": 80}"#, &mut config, &mut engine).unwrap();

        assert_eq!(config.soil_dry, 40);
        assert_eq!(config.soil_wet, 80);
        assert_eq!(outcome.persisted, vec![ConfigField::SoilWet]);
    }

    #[test]
    fn mistyped_field_is_dropped_alone() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let outcome = dispatch(
            r#"{"temp_max": "hot", "hum_max": 80.0}"#,
            &mut config,
            &mut engine,
        )
        .unwrap();

        assert_eq!(config.temp_max, 30.0);
        assert_eq!(config.hum_max, 80.0);
        assert_eq!(outcome.persisted, vec![ConfigField::HumMax]);
    }

    #[test]
    fn oversized_payload_is_dropped_whole() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let padding = "x".repeat(MAX_COMMAND_BYTES);
        let payload = format!(r#"{{"temp_max": 35, "note": "{padding}"}}"#);

        assert!(handle_payload(payload.as_bytes(), &mut config, &mut engine).is_none());
        assert_eq!(config.temp_max, 30.0);
    }

    #[test]
    fn malformed_json_is_dropped_whole() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        assert!(dispatch("{not json", &mut config, &mut engine).is_none());
        assert!(dispatch(r#"["array"]"#, &mut config, &mut engine).is_none());
    }

    #[test]
    fn mode_parsing_variants() {
        for (payload, expected) in [
            (r#"{"mode": "MANUAL"}"#, Mode::Manual),
            (r#"{"mode": "manual"}"#, Mode::Manual),
            (r#"{"mode": "1"}"#, Mode::Manual),
            (r#"{"mode": 1}"#, Mode::Manual),
        ] {
            let mut config = GreenhouseConfig::default();
            let mut engine = ControlEngine::new();
            let outcome = dispatch(payload, &mut config, &mut engine).unwrap();
            assert_eq!(outcome.mode_changed, Some(expected), "{payload}");
        }

        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();
        engine.set_mode(Mode::Manual);
        let outcome = dispatch(r#"{"mode": "auto"}"#, &mut config, &mut engine).unwrap();
        assert_eq!(outcome.mode_changed, Some(Mode::Auto));
        assert_eq!(engine.mode(), Mode::Auto);
    }

    #[test]
    fn mode_applies_before_override_in_same_payload() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let outcome =
            dispatch(r#"{"mode": "MANUAL", "pump": 1}"#, &mut config, &mut engine).unwrap();

        assert_eq!(outcome.mode_changed, Some(Mode::Manual));
        assert_eq!(outcome.overrides_applied, vec![(Relay::Pump, true)]);
        assert!(engine.overrides().pump);
    }

    #[test]
    fn overrides_are_ignored_in_auto() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let outcome = dispatch(r#"{"pump": 1, "fan": 1}"#, &mut config, &mut engine).unwrap();

        assert!(outcome.overrides_applied.is_empty());
        assert!(!engine.overrides().pump);
    }

    #[test]
    fn override_values_outside_zero_one_are_dropped() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();
        engine.set_mode(Mode::Manual);

        let outcome = dispatch(r#"{"pump": 2, "fan": 0}"#, &mut config, &mut engine).unwrap();

        assert_eq!(outcome.overrides_applied, vec![(Relay::Fan, false)]);
    }

    #[test]
    fn update_url_requires_http_scheme() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let outcome = dispatch(
            r#"{"update_url": "https://fw.example.com/node.bin"}"#,
            &mut config,
            &mut engine,
        )
        .unwrap();
        assert_eq!(
            outcome.update_url.as_deref(),
            Some("https://fw.example.com/node.bin")
        );

        let outcome = dispatch(
            r#"{"update_url": "ftp://fw.example.com/node.bin"}"#,
            &mut config,
            &mut engine,
        )
        .unwrap();
        assert!(outcome.update_url.is_none());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut config = GreenhouseConfig::default();
        let mut engine = ControlEngine::new();

        let outcome = dispatch(
            r#"{"unknown": true, "soil_dry": 30}"#,
            &mut config,
            &mut engine,
        )
        .unwrap();

        assert_eq!(config.soil_dry, 30);
        assert_eq!(outcome.persisted, vec![ConfigField::SoilDry]);
    }
}
