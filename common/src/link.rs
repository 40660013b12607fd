//! Connectivity lifecycle as a tick-driven state machine. The connectivity
//! task owns the radio; everything here is pure state plus explicit actions,
//! so the timing rules (boot window, retry cadence, portal timeout) are
//! testable without a network stack.

use crate::display::ButtonIntent;

pub const BOOT_CONNECT_WINDOW_MS: u64 = 10_000;
pub const WIFI_RETRY_PERIOD_MS: u64 = 30_000;
pub const PORTAL_TIMEOUT_MS: u64 = 120_000;
pub const MQTT_RETRY_PERIOD_MS: u64 = 5_000;

pub const PORTAL_SSID: &str = "Greenhouse-Setup";
pub const PORTAL_PASSWORD: &str = "password123";

/// TLS needs plausible wall time; anything below two 8-hour epochs is the
/// boot default, not a synced clock.
pub const TIME_SANITY_EPOCH: u64 = 8 * 3600 * 2;

pub fn time_plausible(epoch_seconds: u64) -> bool {
    epoch_seconds > TIME_SANITY_EPOCH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// Boot attempt with saved credentials, bounded by a deadline.
    ConnectSaved { deadline_ms: u64 },
    Online,
    /// Headless operation; a reconnect fires at each retry mark.
    Offline { next_retry_ms: u64 },
    Portal { deadline_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    BeginConnect,
    RetryConnect,
    StartPortal,
    StopPortal,
}

pub struct LinkStateMachine {
    state: LinkState,
    wifi_up: bool,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self {
            state: LinkState::Idle,
            wifi_up: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn wifi_up(&self) -> bool {
        self.wifi_up
    }

    pub fn portal_active(&self) -> bool {
        matches!(self.state, LinkState::Portal { .. })
    }

    /// Boot entry: open the saved-credentials window. Expiry leads to
    /// OFFLINE, never to an unattended portal.
    pub fn begin_boot_connect(&mut self, now_ms: u64) -> LinkAction {
        self.state = LinkState::ConnectSaved {
            deadline_ms: now_ms + BOOT_CONNECT_WINDOW_MS,
        };
        LinkAction::BeginConnect
    }

    pub fn on_wifi_up(&mut self) {
        self.wifi_up = true;
        if !self.portal_active() {
            self.state = LinkState::Online;
        }
    }

    pub fn on_wifi_down(&mut self, now_ms: u64) {
        self.wifi_up = false;
        if matches!(self.state, LinkState::Online) {
            self.state = LinkState::Offline {
                next_retry_ms: now_ms + WIFI_RETRY_PERIOD_MS,
            };
        }
    }

    pub fn handle_button(&mut self, intent: ButtonIntent, now_ms: u64) -> Option<LinkAction> {
        match intent {
            ButtonIntent::StartReconfigure => self.request_portal(now_ms),
            ButtonIntent::StopPortal => self.request_portal_stop(now_ms),
        }
    }

    pub fn request_portal(&mut self, now_ms: u64) -> Option<LinkAction> {
        if self.portal_active() {
            return None;
        }
        self.state = LinkState::Portal {
            deadline_ms: now_ms + PORTAL_TIMEOUT_MS,
        };
        Some(LinkAction::StartPortal)
    }

    pub fn request_portal_stop(&mut self, now_ms: u64) -> Option<LinkAction> {
        if !self.portal_active() {
            return None;
        }
        self.leave_portal(now_ms);
        Some(LinkAction::StopPortal)
    }

    /// Credentials were submitted through the portal form: close the portal
    /// and reconnect with the fresh credentials.
    pub fn on_portal_submitted(&mut self, now_ms: u64) -> Vec<LinkAction> {
        if !self.portal_active() {
            return Vec::new();
        }
        self.state = LinkState::ConnectSaved {
            deadline_ms: now_ms + BOOT_CONNECT_WINDOW_MS,
        };
        vec![LinkAction::StopPortal, LinkAction::BeginConnect]
    }

    pub fn tick(&mut self, now_ms: u64) -> Option<LinkAction> {
        match self.state {
            LinkState::Idle => None,
            LinkState::Online => None,
            LinkState::ConnectSaved { deadline_ms } => {
                if self.wifi_up {
                    self.state = LinkState::Online;
                    None
                } else if now_ms >= deadline_ms {
                    self.state = LinkState::Offline {
                        next_retry_ms: now_ms + WIFI_RETRY_PERIOD_MS,
                    };
                    None
                } else {
                    None
                }
            }
            LinkState::Offline { next_retry_ms } => {
                if self.wifi_up {
                    self.state = LinkState::Online;
                    None
                } else if now_ms >= next_retry_ms {
                    self.state = LinkState::Offline {
                        next_retry_ms: now_ms + WIFI_RETRY_PERIOD_MS,
                    };
                    Some(LinkAction::RetryConnect)
                } else {
                    None
                }
            }
            LinkState::Portal { deadline_ms } => {
                if now_ms >= deadline_ms {
                    self.leave_portal(now_ms);
                    Some(LinkAction::StopPortal)
                } else {
                    None
                }
            }
        }
    }

    fn leave_portal(&mut self, now_ms: u64) {
        self.state = if self.wifi_up {
            LinkState::Online
        } else {
            LinkState::Offline {
                next_retry_ms: now_ms + WIFI_RETRY_PERIOD_MS,
            }
        };
    }
}

/// Paces repeated attempts (MQTT connects every 5 s at most).
pub struct RetryGate {
    period_ms: u64,
    last_ms: Option<u64>,
}

impl RetryGate {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            last_ms: None,
        }
    }

    pub fn ready(&mut self, now_ms: u64) -> bool {
        let due = match self.last_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.period_ms,
        };
        if due {
            self.last_ms = Some(now_ms);
        }
        due
    }

    pub fn reset(&mut self) {
        self.last_ms = None;
    }
}
