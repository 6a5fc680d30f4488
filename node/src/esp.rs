use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::QoS,
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Gpio0, Gpio2, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{Details, EspMqttClient, EventPayload, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::EspWifi,
};
use log::{debug, info, warn};
use serde::Deserialize;

use sensornode_common::{
    platform::{
        Actuator, ConnectProgress, CredentialStore, DeviceControl, LinkDriver, ResetControl,
        SensorSource, SessionDriver,
    },
    CommandDispatcher, Credential, CredentialSet, DriverError, HallSource, InboundMessage,
    LinkManager, NodeConfig, PortalConfig, ResetTrigger, SessionConfig, SessionManager,
    Supervisor, TelemetryScheduler, TemperatureSource, TickOutcome, REQUIRED_SUBSCRIPTIONS,
    approximate_celsius,
};

const NVS_NAMESPACE: &str = "node";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_PRIMARY_KEY: &str = "primary_json";

const MAX_HTTP_BODY: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Sensor Node Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:520px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Sensor Node Setup</h1>
  <p class="muted">Enter the network this node should join.</p>
  <label>WiFi SSID</label><input id="ssid" type="text">
  <label>WiFi Password</label><input id="password" type="password">
  <button id="save">Save and Connect</button>
  <p id="status" class="muted"></p>
  <script>
    const q=(id)=>document.getElementById(id);
    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const r=await fetch('/api/credentials',{method:'PUT',headers:{'content-type':'application/json'},
          body:JSON.stringify({ssid:q('ssid').value.trim(),password:q('password').value})});
        let b={}; try{b=await r.json();}catch(_){}
        if(!r.ok) throw new Error(b.error||('Request failed: '+r.status));
        q('status').className='ok'; q('status').textContent='Saved. Connecting...';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });
  </script>
</body>
</html>
"#;

extern "C" {
    // Undocumented ESP32 ROM/PHY helpers for the on-die sensors.
    fn temprature_sens_read() -> u8;
    fn hall_sensor_read() -> i32;
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load node config from NVS: {err:#}");
        NodeConfig::default()
    });
    config.sanitize();

    let primary = nvs_store.load_primary().unwrap_or_else(|err| {
        warn!("failed to load stored credentials: {err}");
        None
    });

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))
        .context("failed to initialize wifi driver")?;
    let led = PinDriver::output(pins.gpio2).context("failed to configure LED pin")?;
    let mut button = PinDriver::input(pins.gpio0).context("failed to configure reset pin")?;
    button
        .set_pull(Pull::Up)
        .context("failed to enable reset pin pull-up")?;

    let sources: Vec<Box<dyn SensorSource>> = vec![
        Box::new(TemperatureSource::new(
            || Ok(unsafe { temprature_sens_read() }),
            approximate_celsius,
        )),
        Box::new(HallSource::new(|| Ok(unsafe { hall_sensor_read() }))),
    ];

    let mut supervisor = Supervisor::new(
        LinkManager::new(
            config.link.clone(),
            CredentialSet::new(primary, config.fallback.clone()),
            EspLink::new(wifi, config.portal.clone(), nvs_store.clone()),
        ),
        SessionManager::new(
            config.session.clone(),
            EspSession::new(config.session.clone()),
            || unsafe { esp_idf_svc::sys::esp_random() },
            REQUIRED_SUBSCRIPTIONS,
        ),
        ResetTrigger::new(
            config.reset.clone(),
            ResetButton { pin: button },
            nvs_store,
            EspDevice {
                restart_delay_ms: config.reset.restart_delay_ms,
            },
        ),
        TelemetryScheduler::new(&config.telemetry, sources),
        CommandDispatcher::new(Led { pin: led }),
    );

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    info!(
        "sensor node started (broker {}, tick {} ms)",
        config.session.broker_url(),
        config.tick_interval_ms
    );

    let tick = Duration::from_millis(config.tick_interval_ms);
    loop {
        feed_watchdog();
        if supervisor.tick(monotonic_ms()) == TickOutcome::Restart {
            // The reset path restarts the chip itself; this only guards a
            // restart that did not take.
            warn!("restart did not take effect; retrying");
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        thread::sleep(tick);
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, DriverError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(DriverError::platform)
    }

    fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<NodeConfig>(value)?),
            None => Ok(NodeConfig::default()),
        }
    }
}

impl CredentialStore for NvsStore {
    fn load_primary(&mut self) -> Result<Option<Credential>, DriverError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; 256];

        match nvs
            .get_str(NVS_PRIMARY_KEY, &mut buffer)
            .map_err(DriverError::platform)?
        {
            Some(value) => serde_json::from_str::<Credential>(value)
                .map(Some)
                .map_err(|err| DriverError::InvalidArgument(err.to_string())),
            None => Ok(None),
        }
    }

    fn save_primary(&mut self, credential: &Credential) -> Result<(), DriverError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open()?;
        let payload = serde_json::to_string(credential)
            .map_err(|err| DriverError::InvalidArgument(err.to_string()))?;
        nvs.set_str(NVS_PRIMARY_KEY, &payload)
            .map_err(DriverError::platform)
    }

    fn erase(&mut self) -> Result<(), DriverError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open()?;
        nvs.remove(NVS_PRIMARY_KEY).map_err(DriverError::platform)?;

        // Also drop the station config cached by the wifi driver itself.
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_restore() };
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(DriverError::Platform(format!(
                "esp_wifi_restore failed: esp_err_t={rc}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CredentialUpdate {
    ssid: String,
    #[serde(default)]
    password: String,
}

/// Station link over `EspWifi`, driven without the blocking wrapper so every
/// call returns immediately. While provisioning, the radio also runs the
/// portal access point.
struct EspLink {
    wifi: EspWifi<'static>,
    portal: PortalConfig,
    store: NvsStore,
    server: Option<EspHttpServer<'static>>,
    submitted: Arc<Mutex<Option<Credential>>>,
}

impl EspLink {
    fn new(wifi: EspWifi<'static>, portal: PortalConfig, store: NvsStore) -> Self {
        Self {
            wifi,
            portal,
            store,
            server: None,
            submitted: Arc::new(Mutex::new(None)),
        }
    }

    fn client_configuration(credential: &Credential) -> Result<ClientConfiguration, DriverError> {
        let auth_method = if credential.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        Ok(ClientConfiguration {
            ssid: credential
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| DriverError::InvalidArgument("wifi ssid too long".to_string()))?,
            password: credential
                .password
                .as_str()
                .try_into()
                .map_err(|_| DriverError::InvalidArgument("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        })
    }

    fn access_point_configuration(&self) -> Result<AccessPointConfiguration, DriverError> {
        Ok(AccessPointConfiguration {
            ssid: self
                .portal
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| DriverError::InvalidArgument("portal SSID too long".to_string()))?,
            password: self
                .portal
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| {
                    DriverError::InvalidArgument("portal password too long".to_string())
                })?,
            auth_method: AuthMethod::WPAWPA2Personal,
            channel: 1,
            ..Default::default()
        })
    }

    fn ensure_started(&mut self) -> Result<(), DriverError> {
        if !self.wifi.is_started().map_err(DriverError::platform)? {
            self.wifi.start().map_err(DriverError::platform)?;
        }
        Ok(())
    }

    fn station_configuration(&self) -> Option<ClientConfiguration> {
        match self.wifi.get_configuration().ok()? {
            Configuration::Client(client) | Configuration::Mixed(client, _) => Some(client),
            _ => None,
        }
    }

    /// Picks up credentials posted to the portal since the last poll.
    fn apply_submitted(&mut self) {
        let Some(credential) = self
            .submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        info!("portal submitted credentials for `{}`", credential.ssid);
        let result = self.access_point_configuration().and_then(|ap| {
            let client = Self::client_configuration(&credential)?;
            self.wifi
                .set_configuration(&Configuration::Mixed(client, ap))
                .map_err(DriverError::platform)?;
            self.wifi.connect().map_err(DriverError::platform)
        });
        if let Err(err) = result {
            warn!("failed to join submitted network: {err}");
        }
    }

    fn close_portal(&mut self) {
        if self.server.take().is_none() {
            return;
        }
        info!("closing provisioning portal");
        let client = self.station_configuration().unwrap_or_default();
        if let Err(err) = self.wifi.set_configuration(&Configuration::Client(client)) {
            warn!("failed to return radio to station mode: {err:?}");
        }
    }
}

impl LinkDriver for EspLink {
    fn begin_provisioning(
        &mut self,
        primary: Option<&Credential>,
        window_ms: u64,
    ) -> Result<(), DriverError> {
        let client = match primary {
            Some(credential) => Self::client_configuration(credential)?,
            None => ClientConfiguration::default(),
        };
        let ap = self.access_point_configuration()?;

        self.wifi
            .set_configuration(&Configuration::Mixed(client, ap))
            .map_err(DriverError::platform)?;
        self.ensure_started()?;
        if primary.is_some() {
            self.wifi.connect().map_err(DriverError::platform)?;
        }

        self.server = Some(
            create_portal_server(self.store.clone(), self.submitted.clone())
                .map_err(DriverError::platform)?,
        );
        info!(
            "provisioning portal open on `{}` for {} s",
            self.portal.ap_ssid,
            window_ms / 1_000
        );
        Ok(())
    }

    fn begin_reconnect(&mut self) -> Result<(), DriverError> {
        self.ensure_started()?;
        self.wifi.connect().map_err(DriverError::platform)
    }

    fn begin_join(&mut self, credential: &Credential) -> Result<(), DriverError> {
        let client = Self::client_configuration(credential)?;
        self.wifi
            .set_configuration(&Configuration::Client(client))
            .map_err(DriverError::platform)?;
        self.ensure_started()?;
        self.wifi.connect().map_err(DriverError::platform)
    }

    fn is_connected(&mut self) -> bool {
        if self.server.is_some() {
            self.apply_submitted();
        }

        let connected =
            self.wifi.is_connected().unwrap_or(false) && self.wifi.is_up().unwrap_or(false);
        if connected {
            self.close_portal();
        }
        connected
    }

    fn abandon_attempt(&mut self) {
        self.close_portal();
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect after timeout failed: {err:?}");
        }
    }

    fn network_identity(&self) -> Option<String> {
        self.station_configuration()
            .map(|client| client.ssid.as_str().to_string())
            .filter(|ssid| !ssid.is_empty())
    }
}

fn create_portal_server(
    store: NvsStore,
    submitted: Arc<Mutex<Option<Credential>>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

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
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/credentials", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update: CredentialUpdate =
            serde_json::from_slice(&body).context("invalid credentials payload")?;

        let credential = Credential::new(update.ssid.trim(), update.password);
        if !credential.is_usable() {
            return write_error(req, 400, "ssid is required");
        }
        if credential.ssid.len() > 32 || credential.password.len() > 64 {
            return write_error(req, 400, "ssid or password too long");
        }

        let mut store = store.clone();
        if let Err(err) = store.save_primary(&credential) {
            warn!("failed to persist portal credentials: {err}");
            return write_error(req, 500, "failed to store credentials");
        }
        *submitted.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential);

        write_json(req, &serde_json::json!({ "saved": true }))
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: serde::Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

enum SessionEvent {
    Connected,
    Disconnected,
    Message(InboundMessage),
}

struct Connection {
    client: EspMqttClient<'static>,
    events: Receiver<SessionEvent>,
}

/// MQTT session over `EspMqttClient`. The connection is pumped on its own
/// thread, which forwards events over a channel drained on each call.
struct EspSession {
    config: SessionConfig,
    connection: Option<Connection>,
    progress: ConnectProgress,
    connected: bool,
    inbound: std::collections::VecDeque<InboundMessage>,
}

impl EspSession {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connection: None,
            progress: ConnectProgress::Pending,
            connected: false,
            inbound: std::collections::VecDeque::new(),
        }
    }

    fn drain_events(&mut self) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };

        while let Ok(event) = connection.events.try_recv() {
            match event {
                SessionEvent::Connected => {
                    self.connected = true;
                    self.progress = ConnectProgress::Established;
                }
                SessionEvent::Disconnected => {
                    if !self.connected {
                        self.progress = ConnectProgress::Failed(DriverError::Rejected(
                            "broker closed the connection".to_string(),
                        ));
                    }
                    self.connected = false;
                }
                SessionEvent::Message(message) => self.inbound.push_back(message),
            }
        }
    }
}

fn spawn_pump(
    mut conn: esp_idf_svc::mqtt::client::EspMqttConnection,
    tx: Sender<SessionEvent>,
) -> Result<(), DriverError> {
    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || {
            // Ends once the client is dropped and the connection reports an error.
            while let Ok(event) = conn.next() {
                let forwarded = match event.payload() {
                    EventPayload::Connected(_) => SessionEvent::Connected,
                    EventPayload::Disconnected => SessionEvent::Disconnected,
                    // Chunked payloads are far larger than any command.
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => SessionEvent::Message(InboundMessage {
                        topic: topic.to_string(),
                        payload: data.to_vec(),
                    }),
                    EventPayload::Error(err) => {
                        warn!("mqtt event error: {err:?}");
                        continue;
                    }
                    _ => continue,
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
            debug!("mqtt pump stopped");
        })
        .map(|_| ())
        .map_err(DriverError::platform)
}

impl SessionDriver for EspSession {
    fn begin_connect(&mut self, client_id: &str) -> Result<(), DriverError> {
        self.disconnect();

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            ..Default::default()
        };
        let (client, conn) =
            EspMqttClient::new(&self.config.broker_url(), &conf).map_err(DriverError::platform)?;

        let (tx, events) = mpsc::channel();
        spawn_pump(conn, tx)?;

        self.connection = Some(Connection { client, events });
        self.progress = ConnectProgress::Pending;
        Ok(())
    }

    fn poll_connect(&mut self) -> ConnectProgress {
        self.drain_events();
        self.progress.clone()
    }

    fn is_connected(&mut self) -> bool {
        self.drain_events();
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), DriverError> {
        let connection = self.connection.as_mut().ok_or(DriverError::NotConnected)?;
        connection
            .client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(DriverError::platform)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), DriverError> {
        let connection = match self.connection.as_mut() {
            Some(connection) if self.connected => connection,
            _ => return Err(DriverError::NotConnected),
        };
        connection
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(DriverError::platform)
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        if self.inbound.is_empty() {
            self.drain_events();
        }
        self.inbound.pop_front()
    }

    fn disconnect(&mut self) {
        // Dropping the client stops the underlying ESP-IDF client and its pump.
        self.connection = None;
        self.connected = false;
        self.inbound.clear();
    }
}

/// Active-low push button with the internal pull-up.
struct ResetButton {
    pin: PinDriver<'static, Gpio0, Input>,
}

impl ResetControl for ResetButton {
    fn is_active(&mut self) -> bool {
        self.pin.is_low()
    }
}

struct Led {
    pin: PinDriver<'static, Gpio2, Output>,
}

impl Actuator for Led {
    fn set_active(&mut self, active: bool) -> Result<(), DriverError> {
        let result = if active {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(DriverError::platform)
    }
}

struct EspDevice {
    restart_delay_ms: u64,
}

impl DeviceControl for EspDevice {
    fn restart(&mut self) {
        // Lets the last log lines flush.
        thread::sleep(Duration::from_millis(self.restart_delay_ms));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn monotonic_ms() -> u64 {
    let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    u64::try_from(micros / 1_000).unwrap_or(0)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
