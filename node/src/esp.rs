//! ESP-IDF runtime: four cooperative tasks over the shared state, with the
//! connectivity task pinned to the radio core. WiFi provisioning, the TLS
//! MQTT session, OTA, and the boot-verification protocol all live here;
//! policy and persistence logic come from `greenhouse-common`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use embedded_svc::http::client::Client as HttpClient;
use embedded_svc::http::{Method, Status};
use embedded_svc::io::{Read, Write};
use embedded_svc::mqtt::client::{Details, EventPayload, QoS};
use embedded_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration,
};
use esp_idf_hal::cpu::Core;
use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_hal::prelude::*;
use esp_idf_hal::task::thread::ThreadSpawnConfiguration;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::http::client::{
    Configuration as HttpClientConfiguration, EspHttpConnection, FollowRedirectsPolicy,
};
use esp_idf_svc::http::server::{Configuration as HttpServerConfiguration, EspHttpServer};
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::ota::EspOta;
use esp_idf_svc::sntp::{EspSntp, SntpConf};
use esp_idf_svc::tls::X509;
use esp_idf_svc::wifi::EspWifi;
use log::{info, warn};
use sha2::{Digest, Sha256};

use greenhouse_common::bootguard::{self, BootVerdict};
use greenhouse_common::display::{
    boot_splash, button_intent, render_rows, setup_feedback, ButtonIntent, LinkIndicator,
    BUTTON_DEBOUNCE_MS,
};
use greenhouse_common::hal::{FirmwareUpdater, KvStore, Relays, Sensors, StatusLcd};
use greenhouse_common::identity::device_id_from_mac;
use greenhouse_common::link::{
    time_plausible, LinkAction, LinkStateMachine, RetryGate, MQTT_RETRY_PERIOD_MS, PORTAL_PASSWORD,
    PORTAL_SSID,
};
use greenhouse_common::sensing;
use greenhouse_common::store;
use greenhouse_common::telemetry::{AlertRecord, TelemetryRecord};
use greenhouse_common::{
    handle_payload, topics, ControlEngine, GreenhouseConfig, Relay, SensorSnapshot, SettingsStore,
    TelemetrySpool,
};

use crate::hw::{Button, EspRelays, EspSensors, I2cLcd, SharedI2c};
use crate::spoolfs::StdSpoolFs;

const WATCHDOG_TIMEOUT_SEC: u32 = 30;

const SENSE_PERIOD_MS: u64 = 2_000;
const CONTROL_PERIOD_MS: u64 = 1_000;
const UI_TICK_MS: u64 = 100;
const LCD_REFRESH_MS: u64 = 500;
const CONN_TICK_MS: u64 = 100;
const TELEMETRY_PERIOD_MS: u64 = 5_000;
const DRAIN_PACING_MS: u64 = 50;

const SPIFFS_BASE: &str = "/spiffs";
const PINNED_CA_FILE: &str = "/spiffs/root_ca.pem";

const NET_NAMESPACE: &str = "net";
const NET_KEY_SSID: &str = "ssid";
const NET_KEY_PASS: &str = "pass";

const MQTT_URL: &str = match option_env!("GREENHOUSE_MQTT_URL") {
    Some(url) => url,
    None => "mqtts://broker.greenhouse.example.com:8883",
};
const MQTT_USER: Option<&str> = option_env!("GREENHOUSE_MQTT_USER");
const MQTT_PASS: Option<&str> = option_env!("GREENHOUSE_MQTT_PASS");

const NTP_SERVERS: [&str; 2] = ["pool.ntp.org", "time.nist.gov"];

const OTA_CHUNK_SIZE: usize = 4096;

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Greenhouse Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#123}
    h1{margin:0 0 .5rem}.card{border:1px solid #cdd;border-radius:8px;padding:1rem}
    label{display:block;margin:.6rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Greenhouse Setup</h1>
  <p>Enter the WiFi network this node should join. The node reconnects as
  soon as the form is saved.</p>
  <div class="card">
    <form method="post" action="/save">
      <label>WiFi SSID</label><input name="ssid" type="text" required>
      <label>WiFi Password</label><input name="pass" type="password">
      <button type="submit">Save &amp; Connect</button>
    </form>
  </div>
</body>
</html>
"#;

const PORTAL_SAVED_HTML: &str =
    "<!doctype html><html><body><h1>Saved</h1><p>The node is reconnecting; \
     you can close this page.</p></body></html>";

#[derive(Clone)]
struct Shared {
    config: Arc<Mutex<GreenhouseConfig>>,
    snapshot: Arc<Mutex<SensorSnapshot>>,
    engine: Arc<Mutex<ControlEngine>>,
    settings: Arc<Mutex<SettingsStore<EspNvsKv>>>,
    wifi_up: Arc<AtomicBool>,
    mqtt_up: Arc<AtomicBool>,
    portal_active: Arc<AtomicBool>,
    reconfigure_pending: Arc<AtomicBool>,
    stop_portal_pending: Arc<AtomicBool>,
}

pub fn run() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let kv = EspNvsKv::open(nvs_partition.clone(), store::NAMESPACE)?;
    let mut settings = SettingsStore::new(kv);

    let device_id = device_id_from_mac(factory_mac());
    info!("device id: {device_id}");

    let mut updater = EspUpdater;
    match bootguard::evaluate_boot(&mut settings, updater.rollback_available())? {
        BootVerdict::Continue { crash_count } => {
            info!("boot crash counter: {crash_count}");
        }
        BootVerdict::RollBack => {
            updater.flash_rollback()?;
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    }

    let spool_enabled = match mount_spiffs() {
        Ok(()) => true,
        Err(err) => {
            warn!("flash filesystem unavailable: {err:#}");
            false
        }
    };

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let i2c_config = I2cConfig::new().baudrate(100u32.kHz().into());
    let i2c: SharedI2c = Arc::new(Mutex::new(
        I2cDriver::new(peripherals.i2c0, pins.gpio21, pins.gpio22, &i2c_config)
            .context("i2c bus init")?,
    ));

    let mut lcd = match I2cLcd::init(i2c.clone()) {
        Ok(lcd) => Some(lcd),
        Err(err) => {
            warn!("status display unavailable: {err:#}");
            None
        }
    };
    push_rows(&mut lcd, &boot_splash());

    let sensors = match EspSensors::init(i2c, peripherals.adc1, pins.gpio32) {
        Ok(sensors) => Some(sensors),
        Err(err) => {
            warn!("sensor bank init failed, readings stay at defaults: {err:#}");
            if let Some(lcd) = lcd.as_mut() {
                let _ = lcd.lcd_write(1, "Sensor Failure!     ");
            }
            None
        }
    };
    let relays = EspRelays::init().context("relay outputs init")?;
    let button = Button::init(BUTTON_DEBOUNCE_MS).context("button init")?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    // Running this image at all counts toward boot verification; the OTA
    // slot is additionally marked valid for the IDF bootloader's own books.
    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running slot valid: {err:?}");
        }
    }

    let shared = Shared {
        config: Arc::new(Mutex::new(settings.load_config())),
        snapshot: Arc::new(Mutex::new(SensorSnapshot::default())),
        engine: Arc::new(Mutex::new(ControlEngine::new())),
        settings: Arc::new(Mutex::new(settings)),
        wifi_up: Arc::new(AtomicBool::new(false)),
        mqtt_up: Arc::new(AtomicBool::new(false)),
        portal_active: Arc::new(AtomicBool::new(false)),
        reconfigure_pending: Arc::new(AtomicBool::new(false)),
        stop_portal_pending: Arc::new(AtomicBool::new(false)),
    };

    let wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition.clone()))?;
    let creds = WifiCreds::open(nvs_partition)?;

    spawn_sensing(shared.clone(), sensors);
    spawn_control(shared.clone(), relays);
    spawn_interface(shared.clone(), lcd, button);
    spawn_connectivity(shared, wifi, creds, device_id, spool_enabled, updater);

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn spawn_task<F>(name: &'static str, cname: &'static [u8], stack: usize, core: Core, body: F)
where
    F: FnOnce() + Send + 'static,
{
    ThreadSpawnConfiguration {
        name: Some(cname),
        stack_size: stack,
        pin_to_core: Some(core),
        ..Default::default()
    }
    .set()
    .expect("failed to apply thread spawn configuration");

    thread::Builder::new()
        .name(name.into())
        .stack_size(stack)
        .spawn(body)
        .expect("failed to spawn task");

    ThreadSpawnConfiguration::default()
        .set()
        .expect("failed to reset thread spawn configuration");
}

fn spawn_sensing(shared: Shared, mut sensors: Option<EspSensors>) {
    spawn_task("sensing", b"sensing\0", 8 * 1024, Core::Core1, move || {
        if let Err(err) = add_current_task_to_watchdog() {
            warn!("sensing task watchdog registration failed: {err:#}");
        }

        loop {
            feed_watchdog();

            if let Some(sensors) = sensors.as_mut() {
                let config = shared.config.lock().unwrap().clone();
                let previous = *shared.snapshot.lock().unwrap();
                let fresh = sensing::acquire(sensors, &config, &previous, epoch_now());
                *shared.snapshot.lock().unwrap() = fresh;
            }

            thread::sleep(Duration::from_millis(SENSE_PERIOD_MS));
        }
    });
}

fn spawn_control(shared: Shared, mut relays: EspRelays) {
    spawn_task("control", b"control\0", 8 * 1024, Core::Core1, move || {
        if let Err(err) = add_current_task_to_watchdog() {
            warn!("control task watchdog registration failed: {err:#}");
        }

        loop {
            feed_watchdog();

            let snapshot = *shared.snapshot.lock().unwrap();
            let config = shared.config.lock().unwrap().clone();
            let desired = {
                let mut engine = shared.engine.lock().unwrap();
                engine.tick(&snapshot, &config)
            };

            for relay in [Relay::Pump, Relay::Fan, Relay::Heater] {
                if let Err(err) = relays.set_relay(relay, desired.get(relay)) {
                    warn!("relay drive failed: {err:#}");
                }
            }

            thread::sleep(Duration::from_millis(CONTROL_PERIOD_MS));
        }
    });
}

fn spawn_interface(shared: Shared, mut lcd: Option<I2cLcd>, mut button: Button) {
    spawn_task("interface", b"interface\0", 8 * 1024, Core::Core1, move || {
        if let Err(err) = add_current_task_to_watchdog() {
            warn!("interface task watchdog registration failed: {err:#}");
        }

        let mut last_render_ms = 0u64;

        loop {
            feed_watchdog();
            let now_ms = monotonic_ms();

            if button.take_press() {
                let portal_active = shared.portal_active.load(Ordering::Relaxed);
                match button_intent(portal_active) {
                    ButtonIntent::StopPortal => {
                        shared.stop_portal_pending.store(true, Ordering::Relaxed);
                        push_rows(&mut lcd, &setup_feedback(false));
                    }
                    ButtonIntent::StartReconfigure => {
                        shared.reconfigure_pending.store(true, Ordering::Relaxed);
                        push_rows(&mut lcd, &setup_feedback(true));
                    }
                }
            }

            if now_ms.saturating_sub(last_render_ms) >= LCD_REFRESH_MS {
                last_render_ms = now_ms;

                let snapshot = *shared.snapshot.lock().unwrap();
                let relays = shared.engine.lock().unwrap().relays();
                let link = if shared.mqtt_up.load(Ordering::Relaxed) {
                    LinkIndicator::Online
                } else if shared.wifi_up.load(Ordering::Relaxed) {
                    LinkIndicator::WifiOnly
                } else {
                    LinkIndicator::Off
                };
                let provisioning = shared.portal_active.load(Ordering::Relaxed)
                    || shared.reconfigure_pending.load(Ordering::Relaxed);

                push_rows(&mut lcd, &render_rows(&snapshot, relays, link, provisioning));
            }

            thread::sleep(Duration::from_millis(UI_TICK_MS));
        }
    });
}

fn push_rows(lcd: &mut Option<I2cLcd>, rows: &[String; 4]) {
    let Some(lcd) = lcd.as_mut() else {
        return;
    };
    for (row, text) in rows.iter().enumerate() {
        if let Err(err) = lcd.lcd_write(row, text) {
            warn!("lcd write failed: {err:#}");
            return;
        }
    }
}

fn spawn_connectivity(
    shared: Shared,
    wifi: EspWifi<'static>,
    creds: WifiCreds,
    device_id: String,
    spool_enabled: bool,
    updater: EspUpdater,
) {
    spawn_task(
        "connectivity",
        b"connectivity\0",
        20 * 1024,
        Core::Core0,
        move || {
            connectivity_loop(shared, wifi, creds, device_id, spool_enabled, updater);
        },
    );
}

fn connectivity_loop(
    shared: Shared,
    mut wifi: EspWifi<'static>,
    creds: WifiCreds,
    device_id: String,
    spool_enabled: bool,
    mut updater: EspUpdater,
) {
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("connectivity task watchdog registration failed: {err:#}");
    }

    let data_topic = topics::data_topic(&device_id);
    let alerts_topic = topics::alerts_topic(&device_id);
    let commands_topic = topics::commands_topic(&device_id);

    let mut link = LinkStateMachine::new();
    let mut spool = TelemetrySpool::new(spool_enabled);
    let mut spool_fs = StdSpoolFs::new(SPIFFS_BASE);
    let pending = spool.pending_on_disk(&spool_fs);
    if pending > 0 {
        info!("{pending} telemetry records spooled from a previous boot");
    }

    let mut portal: Option<PortalRuntime> = None;
    let mut mqtt: Option<Arc<Mutex<EspMqttClient<'static>>>> = None;
    let mut sntp = None;
    let mut mqtt_create_gate = RetryGate::new(MQTT_RETRY_PERIOD_MS);
    let mut was_mqtt_up = false;
    let mut last_telemetry_ms = 0u64;

    let (cmd_tx, cmd_rx) = mpsc::channel::<Vec<u8>>();

    let now_ms = monotonic_ms();
    link.begin_boot_connect(now_ms);
    begin_station_connect(&mut wifi, &creds);

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        let wifi_up = wifi.is_up().unwrap_or(false);
        if wifi_up != link.wifi_up() {
            if wifi_up {
                info!("wifi up");
                link.on_wifi_up();
            } else {
                warn!("wifi down");
                link.on_wifi_down(now_ms);
            }
        }
        shared.wifi_up.store(wifi_up, Ordering::Relaxed);

        // Button intents raised by the interface task.
        if shared.reconfigure_pending.swap(false, Ordering::Relaxed) {
            if let Some(action) = link.handle_button(ButtonIntent::StartReconfigure, now_ms) {
                apply_link_action(action, &mut wifi, &creds, &mut portal);
            }
        }
        if shared.stop_portal_pending.swap(false, Ordering::Relaxed) {
            if let Some(action) = link.handle_button(ButtonIntent::StopPortal, now_ms) {
                apply_link_action(action, &mut wifi, &creds, &mut portal);
            }
        }

        // Credentials submitted through the captive form.
        let submission = portal.as_ref().and_then(PortalRuntime::take_submission);
        if let Some((ssid, pass)) = submission {
            info!("portal submitted credentials for `{ssid}`");
            if let Err(err) = creds.save(&ssid, &pass) {
                warn!("failed saving wifi credentials: {err:#}");
            }
            for action in link.on_portal_submitted(now_ms) {
                apply_link_action(action, &mut wifi, &creds, &mut portal);
            }
        }

        if let Some(action) = link.tick(now_ms) {
            apply_link_action(action, &mut wifi, &creds, &mut portal);
        }
        shared.portal_active.store(link.portal_active(), Ordering::Relaxed);

        // Certificate validation needs wall time before any broker attempt.
        if wifi_up && sntp.is_none() && !time_plausible(epoch_now()) {
            match start_sntp() {
                Ok(client) => {
                    info!("sntp sync requested from {NTP_SERVERS:?}");
                    sntp = Some(client);
                }
                Err(err) => warn!("sntp start failed: {err:#}"),
            }
        }

        if mqtt.is_none() && wifi_up && time_plausible(epoch_now()) && mqtt_create_gate.ready(now_ms)
        {
            match create_mqtt_client(&device_id, &commands_topic, &shared, cmd_tx.clone()) {
                Ok(client) => mqtt = Some(client),
                Err(err) => warn!("mqtt client create failed: {err:#}"),
            }
        }

        let mqtt_up = shared.mqtt_up.load(Ordering::Relaxed);
        if mqtt_up && !was_mqtt_up {
            on_broker_connected(&shared, mqtt.as_ref(), &alerts_topic);
        }
        was_mqtt_up = mqtt_up;

        while let Ok(payload) = cmd_rx.try_recv() {
            process_command(&shared, &payload, &mut updater);
        }

        if now_ms.saturating_sub(last_telemetry_ms) >= TELEMETRY_PERIOD_MS {
            last_telemetry_ms = now_ms;
            publish_or_spool_telemetry(
                &shared,
                mqtt.as_ref(),
                mqtt_up,
                &device_id,
                &data_topic,
                &mut spool,
                &mut spool_fs,
            );
        }

        thread::sleep(Duration::from_millis(CONN_TICK_MS));
    }
}

fn apply_link_action(
    action: LinkAction,
    wifi: &mut EspWifi<'static>,
    creds: &WifiCreds,
    portal: &mut Option<PortalRuntime>,
) {
    match action {
        LinkAction::BeginConnect | LinkAction::RetryConnect => {
            begin_station_connect(wifi, creds);
        }
        LinkAction::StartPortal => match start_portal(wifi, creds) {
            Ok(runtime) => {
                info!("provisioning portal up on `{PORTAL_SSID}`");
                *portal = Some(runtime);
            }
            Err(err) => warn!("portal start failed: {err:#}"),
        },
        LinkAction::StopPortal => {
            if portal.take().is_some() {
                info!("provisioning portal stopped");
            }
            begin_station_connect(wifi, creds);
        }
    }
}

/// Configure station mode with the saved credentials and kick off a
/// non-blocking connect. Without credentials the node stays headless.
fn begin_station_connect(wifi: &mut EspWifi<'static>, creds: &WifiCreds) {
    let Some((ssid, pass)) = creds.load() else {
        warn!("no saved wifi credentials, staying offline until provisioned");
        return;
    };

    if let Err(err) = configure_station(wifi, &ssid, &pass) {
        warn!("wifi station configuration failed: {err:#}");
        return;
    }
    if let Err(err) = wifi.start() {
        warn!("wifi start failed: {err:?}");
        return;
    }
    if let Err(err) = wifi.connect() {
        warn!("wifi connect failed: {err:?}");
    } else {
        info!("connecting to `{ssid}`");
    }
}

fn configure_station(wifi: &mut EspWifi<'static>, ssid: &str, pass: &str) -> Result<()> {
    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Provisioning portal
// ---------------------------------------------------------------------------

struct PortalRuntime {
    _server: EspHttpServer<'static>,
    submission: Arc<Mutex<Option<(String, String)>>>,
}

impl PortalRuntime {
    fn take_submission(&self) -> Option<(String, String)> {
        self.submission.lock().unwrap().take()
    }
}

/// Bring up the setup access point and the captive form. When station
/// credentials exist the AP runs alongside the station so the node keeps
/// operating while reconfigured.
fn start_portal(wifi: &mut EspWifi<'static>, creds: &WifiCreds) -> Result<PortalRuntime> {
    let ap = AccessPointConfiguration {
        ssid: PORTAL_SSID
            .try_into()
            .map_err(|_| anyhow!("portal ssid too long"))?,
        password: PORTAL_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("portal password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    };

    let configuration = match creds.load() {
        Some((ssid, pass)) => {
            let auth_method = if pass.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            };
            Configuration::Mixed(
                ClientConfiguration {
                    ssid: ssid
                        .as_str()
                        .try_into()
                        .map_err(|_| anyhow!("wifi ssid too long"))?,
                    password: pass
                        .as_str()
                        .try_into()
                        .map_err(|_| anyhow!("wifi password too long"))?,
                    auth_method,
                    ..Default::default()
                },
                ap,
            )
        }
        None => Configuration::AccessPoint(ap),
    };

    wifi.set_configuration(&configuration)?;
    wifi.start()?;

    let submission = Arc::new(Mutex::new(None));
    let server = create_portal_server(submission.clone())?;

    Ok(PortalRuntime {
        _server: server,
        submission,
    })
}

fn create_portal_server(
    submission: Arc<Mutex<Option<(String, String)>>>,
) -> Result<EspHttpServer<'static>> {
    let conf = HttpServerConfiguration {
        stack_size: 8 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    // Captive-portal probes all land on the form.
    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?.write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
        let mut body = [0u8; 512];
        let len = req.read(&mut body)?;
        let body = core::str::from_utf8(&body[..len]).unwrap_or_default();

        let ssid = form_param(body, "ssid").unwrap_or_default();
        let pass = form_param(body, "pass").unwrap_or_default();

        if ssid.is_empty() {
            req.into_status_response(400)?
                .write_all(b"ssid must not be empty")?;
            return Ok(());
        }

        *submission.lock().unwrap() = Some((ssid, pass));
        req.into_ok_response()?
            .write_all(PORTAL_SAVED_HTML.as_bytes())?;
        Ok(())
    })?;

    Ok(server)
}

fn form_param(body: &str, key: &str) -> Option<String> {
    for pair in body.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(url_decode(value));
        }
    }
    None
}

fn url_decode(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).unwrap_or_default();
                match core::str::from_utf8(hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// MQTT session
// ---------------------------------------------------------------------------

fn create_mqtt_client(
    device_id: &str,
    commands_topic: &str,
    shared: &Shared,
    cmd_tx: mpsc::Sender<Vec<u8>>,
) -> Result<Arc<Mutex<EspMqttClient<'static>>>> {
    let conf = MqttClientConfiguration {
        client_id: Some(device_id),
        username: MQTT_USER,
        password: MQTT_PASS,
        server_certificate: pinned_ca(),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        reconnect_timeout: Some(Duration::from_millis(MQTT_RETRY_PERIOD_MS)),
        ..Default::default()
    };

    let (client, connection) = EspMqttClient::new(MQTT_URL, &conf)?;
    let client = Arc::new(Mutex::new(client));

    spawn_mqtt_receiver(
        shared.clone(),
        connection,
        client.clone(),
        commands_topic.to_string(),
        cmd_tx,
    );

    info!("mqtt client created for {MQTT_URL}");
    Ok(client)
}

/// The pinned root CA, loaded once from flash. Absent a pinned file the
/// client falls back to the built-in certificate bundle.
fn pinned_ca() -> Option<X509<'static>> {
    static PEM: OnceLock<Option<&'static [u8]>> = OnceLock::new();

    let pem = PEM.get_or_init(|| match std::fs::read(PINNED_CA_FILE) {
        Ok(mut bytes) => {
            bytes.push(0);
            info!("using pinned root CA from {PINNED_CA_FILE}");
            Some(Box::leak(bytes.into_boxed_slice()) as &'static [u8])
        }
        Err(_) => {
            warn!("no pinned CA at {PINNED_CA_FILE}, using certificate bundle");
            None
        }
    });

    pem.map(X509::pem_until_nul)
}

fn spawn_mqtt_receiver(
    shared: Shared,
    mut connection: EspMqttConnection,
    client: Arc<Mutex<EspMqttClient<'static>>>,
    commands_topic: String,
    cmd_tx: mpsc::Sender<Vec<u8>>,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match connection.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        if let Err(err) = client
                            .lock()
                            .unwrap()
                            .subscribe(&commands_topic, QoS::AtLeastOnce)
                        {
                            warn!("command subscribe failed: {err:?}");
                        }
                        shared.mqtt_up.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        shared.mqtt_up.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Partial payloads are never dispatched.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if topic == commands_topic {
                            let _ = cmd_tx.send(data.to_vec());
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    shared.mqtt_up.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

/// Broker reachability is the liveness proof: clear the crash counter and
/// deliver any pending rollback alert exactly once.
fn on_broker_connected(
    shared: &Shared,
    mqtt: Option<&Arc<Mutex<EspMqttClient<'static>>>>,
    alerts_topic: &str,
) {
    {
        let mut settings = shared.settings.lock().unwrap();
        if let Err(err) = bootguard::mark_broker_verified(&mut settings) {
            warn!("failed clearing crash counter: {err:#}");
        }
    }

    let Some(client) = mqtt else {
        return;
    };
    let pending = {
        let settings = shared.settings.lock().unwrap();
        bootguard::rollback_alert_pending(&settings)
    };
    if !pending {
        return;
    }

    let alert = AlertRecord::rollback_executed(epoch_now());
    let payload = match alert.to_json() {
        Ok(payload) => payload,
        Err(err) => {
            warn!("rollback alert serialization failed: {err}");
            return;
        }
    };

    // QoS 1: only broker receipt clears the persisted flag.
    let published = client
        .lock()
        .unwrap()
        .publish(alerts_topic, QoS::AtLeastOnce, false, payload.as_bytes());

    match published {
        Ok(_) => {
            let mut settings = shared.settings.lock().unwrap();
            if let Err(err) = bootguard::clear_rollback_alert(&mut settings) {
                warn!("failed clearing rollback alert flag: {err:#}");
            } else {
                info!("rollback alert published");
            }
        }
        Err(err) => warn!("rollback alert publish failed, keeping it pending: {err:?}"),
    }
}

fn process_command(shared: &Shared, payload: &[u8], updater: &mut EspUpdater) {
    let outcome = {
        let mut config = shared.config.lock().unwrap();
        let mut engine = shared.engine.lock().unwrap();
        match handle_payload(payload, &mut config, &mut engine) {
            Some(outcome) => outcome,
            None => return,
        }
    };

    if let Some(mode) = outcome.mode_changed {
        info!("mode set to {}", mode.as_str());
    }
    for (relay, on) in &outcome.overrides_applied {
        info!("manual {} -> {}", relay.as_str(), if *on { "ON" } else { "OFF" });
    }

    if !outcome.persisted.is_empty() {
        let config = shared.config.lock().unwrap().clone();
        let mut settings = shared.settings.lock().unwrap();
        for field in &outcome.persisted {
            if let Err(err) = settings.save_field(&config, *field) {
                warn!("failed persisting {}: {err:#}", field.key());
            }
        }
        info!("persisted {} config field(s)", outcome.persisted.len());
    }

    if let Some(url) = outcome.update_url {
        run_ota(&url, updater);
    }
}

/// The image download can legitimately exceed the watchdog budget; the task
/// de-registers for the window and re-arms on failure. Success never
/// returns, the updater reboots into the new slot.
fn run_ota(url: &str, updater: &mut EspUpdater) {
    info!("OTA update requested from {url}");
    remove_current_task_from_watchdog();

    if let Err(err) = updater.flash_update(url) {
        warn!("OTA update failed, continuing on current image: {err:#}");
        if let Err(err) = add_current_task_to_watchdog() {
            warn!("failed re-arming watchdog after OTA: {err:#}");
        }
    }
}

fn publish_or_spool_telemetry(
    shared: &Shared,
    mqtt: Option<&Arc<Mutex<EspMqttClient<'static>>>>,
    mqtt_up: bool,
    device_id: &str,
    data_topic: &str,
    spool: &mut TelemetrySpool,
    spool_fs: &mut StdSpoolFs,
) {
    let snapshot = *shared.snapshot.lock().unwrap();
    let (relays, mode) = {
        let engine = shared.engine.lock().unwrap();
        (engine.relays(), engine.mode())
    };
    let record = TelemetryRecord::compose(device_id, &snapshot, relays, mode, epoch_now());
    let line = match record.to_json() {
        Ok(line) => line,
        Err(err) => {
            warn!("telemetry serialization failed: {err}");
            return;
        }
    };

    let client = match (mqtt, mqtt_up) {
        (Some(client), true) => client,
        _ => {
            spool.buffer(spool_fs, line);
            return;
        }
    };

    let published = client
        .lock()
        .unwrap()
        .enqueue(data_topic, QoS::AtMostOnce, false, line.as_bytes());

    match published {
        Ok(_) => {
            // Stage any batched history, then drain the files.
            spool.flush(spool_fs);
            spool.drain(spool_fs, |staged| {
                let accepted = client
                    .lock()
                    .unwrap()
                    .publish(data_topic, QoS::AtMostOnce, false, staged.as_bytes())
                    .is_ok();
                if accepted {
                    thread::sleep(Duration::from_millis(DRAIN_PACING_MS));
                }
                accepted
            });
        }
        Err(err) => {
            warn!("telemetry publish failed, spooling: {err:?}");
            spool.buffer(spool_fs, line);
        }
    }
}

// ---------------------------------------------------------------------------
// Firmware update and rollback
// ---------------------------------------------------------------------------

struct EspUpdater;

impl FirmwareUpdater for EspUpdater {
    fn flash_update(&mut self, url: &str) -> Result<()> {
        let (bytes, digest) = download_and_flash(url)?;
        info!("update image written ({bytes} bytes, sha256 {digest}), rebooting");
        thread::sleep(Duration::from_millis(800));
        unsafe { esp_idf_svc::sys::esp_restart() };
        #[allow(unreachable_code)]
        Ok(())
    }

    fn flash_rollback(&mut self) -> Result<()> {
        let next = unsafe { esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        if next.is_null() {
            return Err(anyhow!("no rollback partition available"));
        }
        let rc = unsafe { esp_idf_svc::sys::esp_ota_set_boot_partition(next) };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(anyhow!("esp_ota_set_boot_partition failed with code {rc}"));
        }
        info!("boot partition switched to previous slot");
        Ok(())
    }

    fn rollback_available(&self) -> bool {
        let next = unsafe { esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        !next.is_null()
    }
}

fn download_and_flash(url: &str) -> Result<(u64, String)> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        follow_redirects_policy: FollowRedirectsPolicy::FollowAll,
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|err| anyhow!("{err:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("image download failed with HTTP {status}"));
    }

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0u64;
    let mut chunk = [0u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|err| anyhow!("{err:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing image data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);
    }

    if total_written == 0 {
        return Err(anyhow!("image download body is empty"));
    }

    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing image: {err:?}"))?;

    let digest = hasher.finalize();
    let mut digest_hex = String::with_capacity(64);
    for byte in digest {
        use core::fmt::Write as _;
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }

    Ok((total_written, digest_hex))
}

// ---------------------------------------------------------------------------
// Persistence backends
// ---------------------------------------------------------------------------

pub struct EspNvsKv {
    nvs: EspNvs<NvsDefault>,
}

impl EspNvsKv {
    fn open(partition: EspDefaultNvsPartition, namespace: &str) -> Result<Self> {
        let nvs = EspNvs::new(partition, namespace, true)
            .with_context(|| format!("failed opening NVS namespace {namespace}"))?;
        Ok(Self { nvs })
    }
}

impl KvStore for EspNvsKv {
    fn get_f32(&self, key: &str) -> Option<f32> {
        let mut buf = [0u8; 4];
        let bytes = self.nvs.get_raw(key, &mut buf).ok().flatten()?;
        if bytes.len() != 4 {
            return None;
        }
        let value = f32::from_le_bytes(buf);
        if value.is_nan() {
            return None;
        }
        Some(value)
    }

    fn put_f32(&mut self, key: &str, value: f32) -> Result<()> {
        self.nvs.set_raw(key, &value.to_le_bytes())?;
        Ok(())
    }

    fn get_i32(&self, key: &str) -> Option<i32> {
        self.nvs.get_i32(key).ok().flatten()
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<()> {
        self.nvs.set_i32(key, value)?;
        Ok(())
    }

    fn get_u8(&self, key: &str) -> Option<u8> {
        self.nvs.get_u8(key).ok().flatten()
    }

    fn put_u8(&mut self, key: &str, value: u8) -> Result<()> {
        self.nvs.set_u8(key, value)?;
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_u8(key).map(|value| value != 0)
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.put_u8(key, u8::from(value))
    }
}

/// Saved station credentials, in their own namespace next to the settings.
struct WifiCreds {
    nvs: Arc<Mutex<EspNvs<NvsDefault>>>,
}

impl WifiCreds {
    fn open(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, NET_NAMESPACE, true)
            .context("failed opening wifi credential namespace")?;
        Ok(Self {
            nvs: Arc::new(Mutex::new(nvs)),
        })
    }

    fn load(&self) -> Option<(String, String)> {
        let nvs = self.nvs.lock().unwrap();
        let mut ssid_buf = [0u8; 64];
        let mut pass_buf = [0u8; 96];

        let ssid = nvs.get_str(NET_KEY_SSID, &mut ssid_buf).ok().flatten()?;
        let ssid = ssid.trim_end_matches('\0').to_string();
        if ssid.is_empty() {
            return None;
        }

        let pass = nvs
            .get_str(NET_KEY_PASS, &mut pass_buf)
            .ok()
            .flatten()
            .map(|pass| pass.trim_end_matches('\0').to_string())
            .unwrap_or_default();

        Some((ssid, pass))
    }

    fn save(&self, ssid: &str, pass: &str) -> Result<()> {
        let mut nvs = self.nvs.lock().unwrap();
        nvs.set_str(NET_KEY_SSID, ssid)?;
        nvs.set_str(NET_KEY_PASS, pass)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform plumbing
// ---------------------------------------------------------------------------

/// Request sync from both NTP hosts. The number of usable slots comes from
/// lwIP (`CONFIG_LWIP_SNTP_MAX_SERVERS`, set to 2 in sdkconfig.defaults).
fn start_sntp() -> Result<EspSntp<'static>> {
    let mut conf = SntpConf::default();
    for (slot, server) in conf.servers.iter_mut().zip(NTP_SERVERS) {
        *slot = server;
    }
    EspSntp::new(&conf).context("failed to start SNTP")
}

fn mount_spiffs() -> Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: b"/spiffs\0".as_ptr().cast(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: true,
    };

    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("flash filesystem mounted at {SPIFFS_BASE}");
        Ok(())
    } else {
        Err(anyhow!("esp_vfs_spiffs_register failed with code {rc}"))
    }
}

fn factory_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

fn init_watchdog(timeout_sec: u32) -> Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {rc}"))
}

fn add_current_task_to_watchdog() -> Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {rc}"))
}

fn remove_current_task_from_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_delete(core::ptr::null_mut()) };
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
