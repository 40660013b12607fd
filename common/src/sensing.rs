use log::warn;

use crate::config::GreenhouseConfig;
use crate::hal::Sensors;
use crate::types::SensorSnapshot;

/// Raw soil ADC counts to percent: clamp into the calibrated span, then map
/// linearly so the air (dry) endpoint reads 0% and the water (wet) endpoint
/// reads 100%. Works for either endpoint ordering.
pub fn soil_percent(raw: i32, cal_air_raw: i32, cal_water_raw: i32) -> i32 {
    if cal_air_raw == cal_water_raw {
        return 0;
    }
    let low = cal_air_raw.min(cal_water_raw);
    let high = cal_air_raw.max(cal_water_raw);
    let clamped = raw.clamp(low, high);

    let span = i64::from(cal_water_raw) - i64::from(cal_air_raw);
    let offset = i64::from(clamped) - i64::from(cal_air_raw);
    ((offset * 100) / span) as i32
}

/// Sensor-to-surface distance to tank fill percent: clamp into
/// [full, empty], map empty distance to 0% and full distance to 100%.
pub fn tank_level_percent(distance_cm: f32, tank_full_dist: i32, tank_empty_dist: i32) -> i32 {
    let full = tank_full_dist as f32;
    let empty = tank_empty_dist as f32;
    if empty <= full {
        return 0;
    }
    let clamped = distance_cm.clamp(full, empty);
    (((empty - clamped) / (empty - full)) * 100.0).round() as i32
}

pub fn tank_has_water(distance_cm: f32, tank_empty_dist: i32) -> bool {
    distance_cm < tank_empty_dist as f32
}

/// One acquisition pass. Driver errors retain the previous reading so no
/// NaN or stale-zero ever reaches the control path; an ultrasonic timeout
/// reports the empty distance so the pump interlock engages.
pub fn acquire<S: Sensors>(
    sensors: &mut S,
    config: &GreenhouseConfig,
    previous: &SensorSnapshot,
    now_epoch: u64,
) -> SensorSnapshot {
    let mut snapshot = *previous;
    snapshot.sampled_at = now_epoch;

    match sensors.read_temp_humidity() {
        Ok((temp_c, hum_pct)) if temp_c.is_finite() && hum_pct.is_finite() => {
            snapshot.temp_c = temp_c;
            snapshot.hum_pct = hum_pct;
        }
        Ok(_) => warn!("temp/humidity sample was non-finite, keeping previous"),
        Err(err) => warn!("temp/humidity read failed: {err:#}"),
    }

    match sensors.read_air_quality() {
        Ok(Some(air)) => {
            snapshot.eco2_ppm = air.eco2_ppm;
            snapshot.tvoc_ppb = air.tvoc_ppb;
        }
        Ok(None) => {}
        Err(err) => warn!("air quality read failed: {err:#}"),
    }

    match sensors.read_soil_raw() {
        Ok(raw) => {
            snapshot.soil_pct = soil_percent(raw, config.cal_air_raw, config.cal_water_raw);
        }
        Err(err) => warn!("soil read failed: {err:#}"),
    }

    let distance_cm = match sensors.measure_distance_cm() {
        Ok(distance) if distance.is_finite() => distance,
        Ok(_) => config.tank_empty_dist as f32,
        Err(err) => {
            warn!("ultrasonic measurement failed, assuming empty tank: {err:#}");
            config.tank_empty_dist as f32
        }
    };
    snapshot.distance_cm = distance_cm;
    snapshot.tank_level_pct =
        tank_level_percent(distance_cm, config.tank_full_dist, config.tank_empty_dist);

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedSensors;
    use crate::types::AirQuality;

    #[test]
    fn soil_mapping_matches_calibration_endpoints() {
        assert_eq!(soil_percent(4095, 4095, 1670), 0);
        assert_eq!(soil_percent(1670, 4095, 1670), 100);
        assert_eq!(soil_percent(2883, 4095, 1670), 49);
    }

    #[test]
    fn soil_mapping_clamps_outside_span() {
        assert_eq!(soil_percent(4500, 4095, 1670), 0);
        assert_eq!(soil_percent(100, 4095, 1670), 100);
    }

    #[test]
    fn soil_mapping_supports_reversed_calibration() {
        assert_eq!(soil_percent(100, 100, 3000), 0);
        assert_eq!(soil_percent(3000, 100, 3000), 100);
        assert_eq!(soil_percent(1550, 100, 3000), 50);
        assert_eq!(soil_percent(50, 100, 3000), 0);
    }

    #[test]
    fn equal_calibration_endpoints_read_zero() {
        assert_eq!(soil_percent(2000, 2000, 2000), 0);
    }

    #[test]
    fn tank_level_maps_and_clamps() {
        assert_eq!(tank_level_percent(25.0, 5, 25), 0);
        assert_eq!(tank_level_percent(5.0, 5, 25), 100);
        assert_eq!(tank_level_percent(15.0, 5, 25), 50);
        assert_eq!(tank_level_percent(40.0, 5, 25), 0);
        assert_eq!(tank_level_percent(1.0, 5, 25), 100);
    }

    #[test]
    fn tank_has_water_uses_strict_empty_threshold() {
        assert!(tank_has_water(24.9, 25));
        assert!(!tank_has_water(25.0, 25));
        assert!(!tank_has_water(30.0, 25));
    }

    #[test]
    fn acquire_retains_previous_on_driver_error() {
        let config = GreenhouseConfig::default();
        let mut previous = SensorSnapshot::default();
        previous.temp_c = 22.5;
        previous.hum_pct = 60.0;
        previous.soil_pct = 55;

        let mut sensors = ScriptedSensors::failing();
        let snapshot = acquire(&mut sensors, &config, &previous, 1_700_000_000);

        assert_eq!(snapshot.temp_c, 22.5);
        assert_eq!(snapshot.hum_pct, 60.0);
        assert_eq!(snapshot.soil_pct, 55);
        assert_eq!(snapshot.sampled_at, 1_700_000_000);
    }

    #[test]
    fn acquire_assumes_empty_tank_on_ultrasonic_timeout() {
        let config = GreenhouseConfig::default();
        let previous = SensorSnapshot::default();

        let mut sensors = ScriptedSensors::failing();
        let snapshot = acquire(&mut sensors, &config, &previous, 0);

        assert_eq!(snapshot.distance_cm, config.tank_empty_dist as f32);
        assert_eq!(snapshot.tank_level_pct, 0);
        assert!(!tank_has_water(snapshot.distance_cm, config.tank_empty_dist));
    }

    #[test]
    fn acquire_takes_fresh_values_when_available() {
        let config = GreenhouseConfig::default();
        let previous = SensorSnapshot::default();

        let mut sensors = ScriptedSensors::steady(
            24.0,
            65.0,
            Some(AirQuality {
                eco2_ppm: 612,
                tvoc_ppb: 40,
            }),
            2883,
            10.0,
        );
        let snapshot = acquire(&mut sensors, &config, &previous, 7);

        assert_eq!(snapshot.temp_c, 24.0);
        assert_eq!(snapshot.hum_pct, 65.0);
        assert_eq!(snapshot.eco2_ppm, 612);
        assert_eq!(snapshot.tvoc_ppb, 40);
        assert_eq!(snapshot.soil_pct, 49);
        assert_eq!(snapshot.tank_level_pct, 75);
    }

    #[test]
    fn acquire_keeps_air_quality_without_fresh_sample() {
        let config = GreenhouseConfig::default();
        let mut previous = SensorSnapshot::default();
        previous.eco2_ppm = 800;
        previous.tvoc_ppb = 120;

        let mut sensors = ScriptedSensors::steady(24.0, 65.0, None, 2000, 10.0);
        let snapshot = acquire(&mut sensors, &config, &previous, 8);

        assert_eq!(snapshot.eco2_ppm, 800);
        assert_eq!(snapshot.tvoc_ppb, 120);
    }
}
