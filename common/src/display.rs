//! 20x4 status rendering. Rows are produced as fixed-width strings and
//! pushed to the panel in one pass, so a slow I2C write never tears a row.

use crate::types::{RelayStates, SensorSnapshot};

pub const LCD_COLS: usize = 20;
pub const LCD_ROWS: usize = 4;

pub const BUTTON_DEBOUNCE_MS: u64 = 200;

/// Broker reachability as shown on the last row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkIndicator {
    /// No WiFi association.
    Off,
    /// WiFi up, broker session down.
    WifiOnly,
    /// Broker session established.
    Online,
}

impl LinkIndicator {
    fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::WifiOnly => "CON",
            Self::Online => "ON ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonIntent {
    StartReconfigure,
    StopPortal,
}

/// A debounced press means "stop the portal" while it runs, otherwise
/// "start reconfiguration". The interface task only raises the intent; the
/// connectivity task consumes it on its next tick.
pub fn button_intent(portal_active: bool) -> ButtonIntent {
    if portal_active {
        ButtonIntent::StopPortal
    } else {
        ButtonIntent::StartReconfigure
    }
}

pub fn render_rows(
    snapshot: &SensorSnapshot,
    relays: RelayStates,
    link: LinkIndicator,
    provisioning: bool,
) -> [String; LCD_ROWS] {
    if provisioning {
        return portal_banner();
    }

    [
        pad(format!(
            "Temp:{:4.1}C  Heat:{}",
            snapshot.temp_c,
            on_off(relays.heater)
        )),
        pad(format!(
            "Hum :{:3}%   Fan :{}",
            snapshot.hum_pct as i32,
            on_off(relays.fan)
        )),
        pad(format!(
            "Soil:{:3}%   Pump:{}",
            snapshot.soil_pct,
            on_off(relays.pump)
        )),
        pad(format!(
            "CO2 :{:<4}   Net :{}",
            snapshot.eco2_ppm,
            link.as_str()
        )),
    ]
}

pub fn portal_banner() -> [String; LCD_ROWS] {
    [
        pad("WiFi Setup Mode".to_string()),
        pad("Connect to AP:".to_string()),
        pad(crate::link::PORTAL_SSID.to_string()),
        pad(String::new()),
    ]
}

pub fn boot_splash() -> [String; LCD_ROWS] {
    [
        pad("Smart Greenhouse".to_string()),
        pad("System Starting...".to_string()),
        pad(String::new()),
        pad(String::new()),
    ]
}

/// Immediate feedback when the button flips the provisioning intent; the
/// periodic render takes over at the next refresh.
pub fn setup_feedback(entering: bool) -> [String; LCD_ROWS] {
    let headline = if entering {
        "Entering Setup..."
    } else {
        "Exiting Setup..."
    };
    [
        pad(headline.to_string()),
        pad("Please Wait...".to_string()),
        pad(String::new()),
        pad(String::new()),
    ]
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON "
    } else {
        "OFF"
    }
}

fn pad(mut text: String) -> String {
    text.truncate(LCD_COLS);
    while text.len() < LCD_COLS {
        text.push(' ');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SensorSnapshot {
        SensorSnapshot {
            temp_c: 23.5,
            hum_pct: 61.0,
            eco2_ppm: 612,
            tvoc_ppb: 40,
            soil_pct: 45,
            distance_cm: 10.0,
            tank_level_pct: 75,
            sampled_at: 0,
        }
    }

    #[test]
    fn every_row_is_exactly_twenty_columns() {
        let relays = RelayStates {
            pump: true,
            fan: false,
            heater: true,
        };

        for row in render_rows(&snapshot(), relays, LinkIndicator::Online, false) {
            assert_eq!(row.len(), LCD_COLS, "{row:?}");
        }
        for row in portal_banner() {
            assert_eq!(row.len(), LCD_COLS, "{row:?}");
        }
        for row in boot_splash() {
            assert_eq!(row.len(), LCD_COLS, "{row:?}");
        }
        for row in setup_feedback(true) {
            assert_eq!(row.len(), LCD_COLS, "{row:?}");
        }
    }

    #[test]
    fn rows_carry_sensor_and_relay_state() {
        let relays = RelayStates {
            pump: true,
            fan: false,
            heater: true,
        };

        let rows = render_rows(&snapshot(), relays, LinkIndicator::WifiOnly, false);

        assert_eq!(rows[0], "Temp:23.5C  Heat:ON ");
        assert_eq!(rows[1], "Hum : 61%   Fan :OFF");
        assert_eq!(rows[2], "Soil: 45%   Pump:ON ");
        assert_eq!(rows[3], "CO2 :612    Net :CON");
    }

    #[test]
    fn provisioning_replaces_the_status_rows() {
        let rows = render_rows(
            &snapshot(),
            RelayStates::default(),
            LinkIndicator::Off,
            true,
        );

        assert!(rows[0].starts_with("WiFi Setup Mode"));
        assert!(rows[2].starts_with(crate::link::PORTAL_SSID));
    }

    #[test]
    fn extreme_values_never_overflow_a_row() {
        let mut snap = snapshot();
        snap.temp_c = 104.2;
        snap.eco2_ppm = 65000;
        snap.soil_pct = 100;

        for row in render_rows(&snap, RelayStates::default(), LinkIndicator::Off, false) {
            assert_eq!(row.len(), LCD_COLS);
        }
    }

    #[test]
    fn button_intent_depends_on_portal_state() {
        assert_eq!(button_intent(false), ButtonIntent::StartReconfigure);
        assert_eq!(button_intent(true), ButtonIntent::StopPortal);
    }
}
