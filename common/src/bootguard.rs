//! Boot-verification protocol: an image is trusted only once it has reached
//! the broker. Every boot advances a persisted crash counter; a successful
//! MQTT connection clears it. Three unverified boots in a row trigger a
//! rollback to the previous slot, announced once through the alerts topic.

use anyhow::Result;
use log::{info, warn};

use crate::hal::KvStore;
use crate::store::SettingsStore;

pub const MAX_UNVERIFIED_BOOTS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootVerdict {
    /// Keep running the current image; the counter has been advanced.
    Continue { crash_count: u8 },
    /// Ask the bootloader for the previous slot and reboot. The rollback
    /// flag is already set and the counter reset.
    RollBack,
}

pub fn evaluate_boot<K: KvStore>(
    store: &mut SettingsStore<K>,
    rollback_available: bool,
) -> Result<BootVerdict> {
    let count = store.crash_count();

    if count >= MAX_UNVERIFIED_BOOTS {
        if rollback_available {
            warn!("{count} unverified boots, requesting firmware rollback");
            store.set_rollback_happened(true)?;
            store.set_crash_count(0)?;
            return Ok(BootVerdict::RollBack);
        }
        warn!("{count} unverified boots but no rollback slot, continuing on current image");
        store.set_crash_count(0)?;
        return Ok(BootVerdict::Continue { crash_count: 0 });
    }

    let next = count.saturating_add(1);
    store.set_crash_count(next)?;
    Ok(BootVerdict::Continue { crash_count: next })
}

/// Reaching the broker is the liveness proof of a good image.
pub fn mark_broker_verified<K: KvStore>(store: &mut SettingsStore<K>) -> Result<()> {
    if store.crash_count() != 0 {
        info!("broker reached, clearing boot crash counter");
    }
    store.set_crash_count(0)
}

pub fn rollback_alert_pending<K: KvStore>(store: &SettingsStore<K>) -> bool {
    store.rollback_happened()
}

/// Call only after the alert publish was accepted, so the alert is emitted
/// at most once per rollback.
pub fn clear_rollback_alert<K: KvStore>(store: &mut SettingsStore<K>) -> Result<()> {
    store.set_rollback_happened(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemKv;

    #[test]
    fn counter_advances_each_unverified_boot() {
        let mut store = SettingsStore::new(MemKv::default());

        for expected in 1..=3u8 {
            let verdict = evaluate_boot(&mut store, true).unwrap();
            assert_eq!(
                verdict,
                BootVerdict::Continue {
                    crash_count: expected
                }
            );
        }
        assert_eq!(store.crash_count(), 3);
    }

    #[test]
    fn fourth_boot_rolls_back_and_arms_alert() {
        let mut store = SettingsStore::new(MemKv::default());
        for _ in 0..3 {
            evaluate_boot(&mut store, true).unwrap();
        }

        let verdict = evaluate_boot(&mut store, true).unwrap();

        assert_eq!(verdict, BootVerdict::RollBack);
        assert!(rollback_alert_pending(&store));
        assert_eq!(store.crash_count(), 0);
    }

    #[test]
    fn without_rollback_slot_the_counter_resets_and_boot_continues() {
        let mut store = SettingsStore::new(MemKv::default());
        store.set_crash_count(5).unwrap();

        let verdict = evaluate_boot(&mut store, false).unwrap();

        assert_eq!(verdict, BootVerdict::Continue { crash_count: 0 });
        assert!(!rollback_alert_pending(&store));
    }

    #[test]
    fn broker_connection_clears_counter() {
        let mut store = SettingsStore::new(MemKv::default());
        evaluate_boot(&mut store, true).unwrap();
        evaluate_boot(&mut store, true).unwrap();

        mark_broker_verified(&mut store).unwrap();

        assert_eq!(store.crash_count(), 0);
        // The next boot starts the count from scratch.
        let verdict = evaluate_boot(&mut store, true).unwrap();
        assert_eq!(verdict, BootVerdict::Continue { crash_count: 1 });
    }

    #[test]
    fn alert_clears_only_on_explicit_acknowledgment() {
        let mut store = SettingsStore::new(MemKv::default());
        store.set_rollback_happened(true).unwrap();

        // A verified boot alone does not consume the alert.
        mark_broker_verified(&mut store).unwrap();
        assert!(rollback_alert_pending(&store));

        clear_rollback_alert(&mut store).unwrap();
        assert!(!rollback_alert_pending(&store));
    }
}
