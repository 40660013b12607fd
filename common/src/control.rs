use crate::config::GreenhouseConfig;
use crate::sensing::tank_has_water;
use crate::types::{Mode, Relay, RelayStates, SensorSnapshot};

/// Closed-loop actuator policy. One `tick` per control period consumes a
/// coherent snapshot and yields the three relay states; the engine keeps the
/// pump hysteresis memory and the MANUAL override latches.
#[derive(Debug, Clone)]
pub struct ControlEngine {
    mode: Mode,
    overrides: RelayStates,
    relays: RelayStates,
}

impl Default for ControlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlEngine {
    pub fn new() -> Self {
        Self {
            mode: Mode::Auto,
            overrides: RelayStates::default(),
            relays: RelayStates::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn relays(&self) -> RelayStates {
        self.relays
    }

    pub fn overrides(&self) -> RelayStates {
        self.overrides
    }

    /// Entering AUTO clears all latched overrides.
    pub fn set_mode(&mut self, mode: Mode) -> bool {
        if self.mode == mode {
            return false;
        }
        self.mode = mode;
        if mode == Mode::Auto {
            self.overrides = RelayStates::default();
        }
        true
    }

    /// Overrides are honored in MANUAL only; in AUTO the request is ignored.
    pub fn set_override(&mut self, relay: Relay, on: bool) -> bool {
        if self.mode != Mode::Manual {
            return false;
        }
        self.overrides.set(relay, on);
        true
    }

    pub fn tick(&mut self, snapshot: &SensorSnapshot, config: &GreenhouseConfig) -> RelayStates {
        let next = match self.mode {
            Mode::Manual => self.overrides,
            Mode::Auto => {
                let has_water = tank_has_water(snapshot.distance_cm, config.tank_empty_dist);
                let mut next = self.relays;

                // Pump hysteresis; an empty tank forces OFF regardless of
                // the dry threshold.
                if snapshot.soil_pct < config.soil_dry && has_water {
                    next.pump = true;
                } else if snapshot.soil_pct > config.soil_wet || !has_water {
                    next.pump = false;
                }

                next.fan = snapshot.temp_c > config.temp_max || snapshot.hum_pct > config.hum_max;
                next.heater = snapshot.temp_c < config.temp_min;
                next
            }
        };

        self.relays = next;
        next
    }
}
