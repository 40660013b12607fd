//! Host simulation of the node: same control logic, same persistence
//! protocols, simulated sensors and relays. Useful for exercising the
//! telemetry spool and command dispatch against a real broker without
//! hardware. Configuration comes from the environment:
//! `GREENHOUSE_DATA_DIR`, `GREENHOUSE_MQTT_HOST`, `GREENHOUSE_MQTT_PORT`,
//! `GREENHOUSE_MQTT_USER`, `GREENHOUSE_MQTT_PASS`, `GREENHOUSE_MQTT_CA`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use greenhouse_common::bootguard::{self, BootVerdict};
use greenhouse_common::display::{render_rows, LinkIndicator};
use greenhouse_common::hal::{KvStore, Relays, Sensors};
use greenhouse_common::identity::device_id_from_mac;
use greenhouse_common::link::time_plausible;
use greenhouse_common::sensing;
use greenhouse_common::spool::DrainOutcome;
use greenhouse_common::telemetry::{AlertRecord, TelemetryRecord};
use greenhouse_common::{
    handle_payload, topics, AirQuality, ControlEngine, GreenhouseConfig, Relay, SensorSnapshot,
    SettingsStore, TelemetrySpool,
};

use crate::spoolfs::{prepare_base, StdSpoolFs};

const SENSE_PERIOD: Duration = Duration::from_secs(2);
const CONTROL_PERIOD: Duration = Duration::from_secs(1);
const RENDER_PERIOD: Duration = Duration::from_millis(500);
const TELEMETRY_PERIOD: Duration = Duration::from_secs(5);
const MQTT_POLL_BACKOFF: Duration = Duration::from_secs(2);

struct Shared {
    config: Mutex<GreenhouseConfig>,
    snapshot: Mutex<SensorSnapshot>,
    engine: Mutex<ControlEngine>,
    mqtt_up: AtomicBool,
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("GREENHOUSE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.greenhouse"));
    let spool_enabled = prepare_base(&data_dir);

    let kv = FileKv::open(data_dir.join("settings.json"))?;
    let mut settings = SettingsStore::new(kv);

    let device_id = device_id_from_mac(pseudo_mac(&data_dir));
    info!("device id: {device_id}");

    // No second firmware slot on the host; the guard still advances and
    // clears the counter so the protocol is observable end to end.
    match bootguard::evaluate_boot(&mut settings, false)? {
        BootVerdict::Continue { crash_count } => info!("boot crash counter: {crash_count}"),
        BootVerdict::RollBack => unreachable!("rollback without a slot"),
    }

    let config = settings.load_config();
    info!(
        "config: temp [{:.1}, {:.1}]C hum<={:.1}% soil [{}, {}]% tank [{}, {}]cm",
        config.temp_min,
        config.temp_max,
        config.hum_max,
        config.soil_dry,
        config.soil_wet,
        config.tank_full_dist,
        config.tank_empty_dist,
    );

    let spool_fs = StdSpoolFs::new(data_dir.clone());
    let spool = TelemetrySpool::new(spool_enabled);
    let pending = spool.pending_on_disk(&spool_fs);
    if pending > 0 {
        info!("{pending} telemetry records spooled from a previous run");
    }

    if !time_plausible(Utc::now().timestamp().max(0) as u64) {
        warn!("system clock looks unsynced; broker TLS would be deferred on device");
    }

    let shared = Arc::new(Shared {
        config: Mutex::new(config),
        snapshot: Mutex::new(SensorSnapshot::default()),
        engine: Mutex::new(ControlEngine::new()),
        mqtt_up: AtomicBool::new(false),
    });
    let settings = Arc::new(Mutex::new(settings));

    let (client, eventloop) = create_mqtt_client(&device_id)?;

    spawn_sensing(shared.clone());
    spawn_control(shared.clone());
    spawn_interface(shared.clone());
    spawn_telemetry(
        shared.clone(),
        client.clone(),
        device_id.clone(),
        spool,
        StdSpoolFs::new(data_dir),
    );

    drop(spool_fs);

    // The MQTT event loop runs in the foreground; everything else ticks in
    // the background tasks above.
    mqtt_loop(shared, settings, client, eventloop, &device_id).await
}

fn create_mqtt_client(device_id: &str) -> Result<(AsyncClient, rumqttc::EventLoop)> {
    let host = std::env::var("GREENHOUSE_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("GREENHOUSE_MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut options = MqttOptions::new(device_id, host.clone(), port);
    options.set_keep_alive(Duration::from_secs(30));

    let user = std::env::var("GREENHOUSE_MQTT_USER").unwrap_or_default();
    let pass = std::env::var("GREENHOUSE_MQTT_PASS").unwrap_or_default();
    if !user.is_empty() {
        options.set_credentials(user, pass);
    }

    if let Ok(ca_path) = std::env::var("GREENHOUSE_MQTT_CA") {
        let ca = std::fs::read(&ca_path)
            .with_context(|| format!("failed reading pinned CA at {ca_path}"))?;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
        info!("mqtt transport: TLS with pinned CA, {host}:{port}");
    } else {
        info!("mqtt transport: plain TCP, {host}:{port}");
    }

    Ok(AsyncClient::new(options, 64))
}

fn spawn_sensing(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let mut sensors = SimSensors::default();
        let mut interval = tokio::time::interval(SENSE_PERIOD);

        loop {
            interval.tick().await;
            let config = shared.config.lock().await.clone();
            let previous = *shared.snapshot.lock().await;
            let now_epoch = Utc::now().timestamp().max(0) as u64;

            let fresh = sensing::acquire(&mut sensors, &config, &previous, now_epoch);
            *shared.snapshot.lock().await = fresh;
        }
    });
}

fn spawn_control(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let mut relays = LogRelays::default();
        let mut interval = tokio::time::interval(CONTROL_PERIOD);

        loop {
            interval.tick().await;
            let snapshot = *shared.snapshot.lock().await;
            let config = shared.config.lock().await.clone();

            let desired = {
                let mut engine = shared.engine.lock().await;
                engine.tick(&snapshot, &config)
            };

            for relay in [Relay::Pump, Relay::Fan, Relay::Heater] {
                if let Err(err) = relays.set_relay(relay, desired.get(relay)) {
                    warn!("relay drive failed: {err:#}");
                }
            }
        }
    });
}

fn spawn_interface(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RENDER_PERIOD);
        let mut ticks = 0u32;

        loop {
            interval.tick().await;
            ticks += 1;

            let snapshot = *shared.snapshot.lock().await;
            let (relays, _mode) = {
                let engine = shared.engine.lock().await;
                (engine.relays(), engine.mode())
            };
            let link = if shared.mqtt_up.load(Ordering::Relaxed) {
                LinkIndicator::Online
            } else {
                LinkIndicator::WifiOnly
            };

            let rows = render_rows(&snapshot, relays, link, false);
            if ticks % 20 == 0 {
                info!("lcd | {} | {} | {} | {}", rows[0], rows[1], rows[2], rows[3]);
            } else {
                debug!("lcd | {} | {} | {} | {}", rows[0], rows[1], rows[2], rows[3]);
            }
        }
    });
}

fn spawn_telemetry(
    shared: Arc<Shared>,
    client: AsyncClient,
    device_id: String,
    mut spool: TelemetrySpool,
    mut spool_fs: StdSpoolFs,
) {
    tokio::spawn(async move {
        let data_topic = topics::data_topic(&device_id);
        let mut interval = tokio::time::interval(TELEMETRY_PERIOD);

        loop {
            interval.tick().await;

            let snapshot = *shared.snapshot.lock().await;
            let (relays, mode) = {
                let engine = shared.engine.lock().await;
                (engine.relays(), engine.mode())
            };
            let timestamp = Utc::now().timestamp().max(0) as u64;
            let record = TelemetryRecord::compose(&device_id, &snapshot, relays, mode, timestamp);
            let line = match record.to_json() {
                Ok(line) => line,
                Err(err) => {
                    warn!("telemetry serialization failed: {err}");
                    continue;
                }
            };

            if shared.mqtt_up.load(Ordering::Relaxed) {
                match client.try_publish(data_topic.as_str(), QoS::AtLeastOnce, false, line.clone()) {
                    Ok(()) => {
                        debug!("published telemetry");
                        // Make spooled history uploadable, then drain it.
                        spool.flush(&mut spool_fs);
                        let outcome = spool.drain(&mut spool_fs, |staged| {
                            client
                                .try_publish(
                                    data_topic.as_str(),
                                    QoS::AtLeastOnce,
                                    false,
                                    staged.to_string(),
                                )
                                .is_ok()
                        });
                        if outcome == DrainOutcome::Incomplete {
                            debug!("spool drain interrupted, will retry");
                        }
                    }
                    Err(err) => {
                        warn!("telemetry publish failed, spooling: {err}");
                        spool.buffer(&mut spool_fs, line);
                    }
                }
            } else {
                spool.buffer(&mut spool_fs, line);
                debug!("offline, batched {} records", spool.batched());
            }
        }
    });
}

async fn mqtt_loop(
    shared: Arc<Shared>,
    settings: Arc<Mutex<SettingsStore<FileKv>>>,
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    device_id: &str,
) -> Result<()> {
    let commands_topic = topics::commands_topic(device_id);
    let alerts_topic = topics::alerts_topic(device_id);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
                shared.mqtt_up.store(true, Ordering::Relaxed);

                if let Err(err) = client.subscribe(commands_topic.as_str(), QoS::AtLeastOnce).await {
                    warn!("command subscribe failed: {err}");
                }

                let mut settings = settings.lock().await;
                if let Err(err) = bootguard::mark_broker_verified(&mut settings) {
                    warn!("failed clearing crash counter: {err:#}");
                }
                publish_pending_rollback_alert(&client, &alerts_topic, &mut settings).await;
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                if message.topic == commands_topic {
                    handle_command(&shared, &settings, &message.payload).await;
                }
            }
            Ok(_) => {}
            Err(err) => {
                shared.mqtt_up.store(false, Ordering::Relaxed);
                warn!("mqtt poll error: {err}");
                tokio::time::sleep(MQTT_POLL_BACKOFF).await;
            }
        }
    }
}

async fn publish_pending_rollback_alert(
    client: &AsyncClient,
    alerts_topic: &str,
    settings: &mut SettingsStore<FileKv>,
) {
    if !bootguard::rollback_alert_pending(settings) {
        return;
    }

    let alert = AlertRecord::rollback_executed(Utc::now().timestamp().max(0) as u64);
    let payload = match alert.to_json() {
        Ok(payload) => payload,
        Err(err) => {
            warn!("rollback alert serialization failed: {err}");
            return;
        }
    };

    // QoS 1 so acceptance means broker receipt; the flag survives until then.
    match client.publish(alerts_topic, QoS::AtLeastOnce, false, payload).await {
        Ok(()) => {
            if let Err(err) = bootguard::clear_rollback_alert(settings) {
                warn!("failed clearing rollback alert flag: {err:#}");
            } else {
                info!("rollback alert published");
            }
        }
        Err(err) => warn!("rollback alert publish failed, keeping it pending: {err}"),
    }
}

async fn handle_command(
    shared: &Arc<Shared>,
    settings: &Arc<Mutex<SettingsStore<FileKv>>>,
    payload: &[u8],
) {
    let outcome = {
        let mut config = shared.config.lock().await;
        let mut engine = shared.engine.lock().await;
        match handle_payload(payload, &mut config, &mut engine) {
            Some(outcome) => outcome,
            None => return,
        }
    };

    if outcome.is_empty() {
        return;
    }

    if let Some(mode) = outcome.mode_changed {
        info!("mode set to {}", mode.as_str());
    }
    for (relay, on) in &outcome.overrides_applied {
        info!("manual {} -> {}", relay.as_str(), if *on { "ON" } else { "OFF" });
    }

    if !outcome.persisted.is_empty() {
        let config = shared.config.lock().await.clone();
        let mut settings = settings.lock().await;
        for field in &outcome.persisted {
            if let Err(err) = settings.save_field(&config, *field) {
                warn!("failed persisting {}: {err:#}", field.key());
            }
        }
        info!("persisted {} config field(s)", outcome.persisted.len());
    }

    if let Some(url) = outcome.update_url {
        warn!("OTA requested ({url}) but updates need the ESP32 build");
    }
}

/// Stable pseudo-identity for a host deployment, derived from the data
/// directory path the way the device derives its ID from the factory MAC.
fn pseudo_mac(data_dir: &std::path::Path) -> [u8; 6] {
    let canonical = data_dir
        .canonicalize()
        .unwrap_or_else(|_| data_dir.to_path_buf());
    let text = canonical.to_string_lossy();

    // FNV-1a, folded to 48 bits.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }

    let bytes = hash.to_be_bytes();
    [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
}

#[derive(Default)]
struct LogRelays {
    current: [Option<bool>; 3],
}

impl Relays for LogRelays {
    fn set_relay(&mut self, relay: Relay, on: bool) -> Result<()> {
        let slot = match relay {
            Relay::Pump => 0,
            Relay::Fan => 1,
            Relay::Heater => 2,
        };
        if self.current[slot] != Some(on) {
            self.current[slot] = Some(on);
            info!("relay {} -> {}", relay.as_str(), if on { "ON" } else { "OFF" });
        }
        Ok(())
    }
}

/// Deterministic drifting environment so the policy engine has something to
/// react to without any randomness.
#[derive(Default)]
struct SimSensors {
    step: u64,
}

impl SimSensors {
    fn triangle(&self, period: u64, low: f32, high: f32) -> f32 {
        let phase = (self.step % period) as f32 / period as f32;
        let ramp = if phase < 0.5 { phase * 2.0 } else { 2.0 - phase * 2.0 };
        low + (high - low) * ramp
    }
}

impl Sensors for SimSensors {
    fn read_temp_humidity(&mut self) -> Result<(f32, f32)> {
        self.step += 1;
        Ok((self.triangle(90, 16.0, 34.0), self.triangle(70, 45.0, 85.0)))
    }

    fn read_air_quality(&mut self) -> Result<Option<AirQuality>> {
        // The gas sensor produces a fresh sample every third cycle.
        if self.step % 3 != 0 {
            return Ok(None);
        }
        Ok(Some(AirQuality {
            eco2_ppm: 400 + (self.triangle(120, 0.0, 600.0) as i32),
            tvoc_ppb: self.triangle(120, 0.0, 150.0) as i32,
        }))
    }

    fn read_soil_raw(&mut self) -> Result<i32> {
        Ok(self.triangle(150, 1670.0, 4095.0) as i32)
    }

    fn measure_distance_cm(&mut self) -> Result<f32> {
        Ok(self.triangle(200, 6.0, 28.0))
    }
}

/// JSON-file key/value backend, the host stand-in for NVS.
struct FileKv {
    path: PathBuf,
    values: serde_json::Map<String, Value>,
}

impl FileKv {
    fn open(path: PathBuf) -> Result<Self> {
        let values = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("corrupt settings file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", path.display()))
            }
        };
        Ok(Self { path, values })
    }

    fn persist(&self) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&Value::Object(self.values.clone()))?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("failed writing {}", self.path.display()))
    }

    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        self.persist()
    }
}

impl KvStore for FileKv {
    fn get_f32(&self, key: &str) -> Option<f32> {
        self.values.get(key).and_then(Value::as_f64).map(|v| v as f32)
    }

    fn put_f32(&mut self, key: &str, value: f32) -> Result<()> {
        self.put(key, serde_json::json!(value))
    }

    fn get_i32(&self, key: &str) -> Option<i32> {
        self.values
            .get(key)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<()> {
        self.put(key, serde_json::json!(value))
    }

    fn get_u8(&self, key: &str) -> Option<u8> {
        self.values
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u8::try_from(v).ok())
    }

    fn put_u8(&mut self, key: &str, value: u8) -> Result<()> {
        self.put(key, serde_json::json!(value))
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.put(key, serde_json::json!(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_mac_is_stable_for_a_path() {
        let path = std::path::Path::new("/tmp/greenhouse-test-data");
        assert_eq!(pseudo_mac(path), pseudo_mac(path));

        let other = std::path::Path::new("/tmp/greenhouse-other");
        assert_ne!(pseudo_mac(path), pseudo_mac(other));
    }

    #[test]
    fn sim_sensors_stay_in_plausible_ranges() {
        let mut sensors = SimSensors::default();

        for _ in 0..500 {
            let (temp, hum) = sensors.read_temp_humidity().unwrap();
            assert!((16.0..=34.0).contains(&temp));
            assert!((45.0..=85.0).contains(&hum));

            let raw = sensors.read_soil_raw().unwrap();
            assert!((1670..=4095).contains(&raw));

            let distance = sensors.measure_distance_cm().unwrap();
            assert!((6.0..=28.0).contains(&distance));
        }
    }

    #[test]
    fn file_kv_round_trips_values() {
        let dir = std::env::temp_dir().join(format!("greenhouse-kv-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");

        {
            let mut kv = FileKv::open(path.clone()).unwrap();
            kv.put_f32("temp_min", 18.5).unwrap();
            kv.put_i32("soil_dry", 35).unwrap();
            kv.put_u8("crash_count", 2).unwrap();
            kv.put_bool("rb_happened", true).unwrap();
        }

        let kv = FileKv::open(path).unwrap();
        assert_eq!(kv.get_f32("temp_min"), Some(18.5));
        assert_eq!(kv.get_i32("soil_dry"), Some(35));
        assert_eq!(kv.get_u8("crash_count"), Some(2));
        assert_eq!(kv.get_bool("rb_happened"), Some(true));
        assert_eq!(kv.get_f32("missing"), None);

        let _ = std::fs::remove_dir_all(dir);
    }
}
