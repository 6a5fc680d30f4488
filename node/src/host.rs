use std::{
    collections::VecDeque,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use rand::Rng;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use sensornode_common::{
    platform::{
        Actuator, ConnectProgress, CredentialStore, DeviceControl, LinkDriver, ResetControl,
        SensorSource, SessionDriver,
    },
    CommandDispatcher, Credential, CredentialSet, DriverError, HallSource, InboundMessage,
    LinkManager, NodeConfig, ResetTrigger, SessionConfig, SessionManager, Supervisor,
    TelemetryScheduler, TemperatureSource, TickOutcome, REQUIRED_SUBSCRIPTIONS,
    approximate_celsius,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let state_dir = std::env::var("NODE_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.sensornode"));

    let mut config = load_config(&state_dir.join("config.json")).unwrap_or_else(|err| {
        warn!("failed to load node config: {err:#}");
        NodeConfig::default()
    });
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.session.broker_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.session.broker_port = port;
    }
    config.sanitize();

    let mut store = FileCredentialStore::new(state_dir.join("credentials.json"));
    let primary = store.load_primary().unwrap_or_else(|err| {
        warn!("failed to load stored credentials: {err}");
        None
    });

    let reset_file = std::env::var("RESET_TRIGGER_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| state_dir.join("reset"));
    let link_down_file = std::env::var("LINK_DOWN_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| state_dir.join("link-down"));

    let mut tick: u8 = 0;
    let sources: Vec<Box<dyn SensorSource>> = vec![
        // Simulated raw die temperature around 100-107 units.
        Box::new(TemperatureSource::new(
            move || {
                tick = tick.wrapping_add(1);
                Ok(100 + tick % 8)
            },
            approximate_celsius,
        )),
        Box::new(HallSource::new(|| Ok(rand::thread_rng().gen_range(-40..=40)))),
    ];

    let mut supervisor = Supervisor::new(
        LinkManager::new(
            config.link.clone(),
            CredentialSet::new(primary, config.fallback.clone()),
            HostLink::new(link_down_file),
        ),
        SessionManager::new(
            config.session.clone(),
            HostSession::new(config.session.clone()),
            rand::random::<u32>,
            REQUIRED_SUBSCRIPTIONS,
        ),
        ResetTrigger::new(
            config.reset.clone(),
            HostButton::new(reset_file),
            store,
            HostDevice,
        ),
        TelemetryScheduler::new(&config.telemetry, sources),
        CommandDispatcher::new(HostLed),
    );

    info!(
        "sensor node started (broker {}:{}, tick {} ms)",
        config.session.broker_host, config.session.broker_port, config.tick_interval_ms
    );

    let mut interval = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if supervisor.tick(monotonic_ms()) == TickOutcome::Restart {
                    tokio::time::sleep(Duration::from_millis(config.reset.restart_delay_ms)).await;
                    info!("exiting after credential reset");
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(
                    "shutting down (link {}, session {}, {} faults)",
                    supervisor.link_state().as_str(),
                    supervisor.session_state().as_str(),
                    supervisor.diagnostics().total()
                );
                return Ok(());
            }
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<NodeConfig> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice::<NodeConfig>(&raw)
            .with_context(|| format!("invalid config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(NodeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

/// Simulated station link. The workstation's own network stands in for the
/// radio; the presence of `down_flag` simulates a lost association.
struct HostLink {
    down_flag: PathBuf,
    identity: Option<String>,
}

impl HostLink {
    fn new(down_flag: PathBuf) -> Self {
        Self {
            down_flag,
            identity: None,
        }
    }
}

impl LinkDriver for HostLink {
    fn begin_provisioning(
        &mut self,
        primary: Option<&Credential>,
        window_ms: u64,
    ) -> Result<(), DriverError> {
        let ssid = primary.map_or("host-network", |cred| cred.ssid.as_str());
        info!("simulated provisioning for `{ssid}` ({window_ms} ms window)");
        self.identity = Some(ssid.to_string());
        Ok(())
    }

    fn begin_reconnect(&mut self) -> Result<(), DriverError> {
        if self.identity.is_none() {
            return Err(DriverError::InvalidArgument(
                "no cached network to reconnect to".to_string(),
            ));
        }
        Ok(())
    }

    fn begin_join(&mut self, credential: &Credential) -> Result<(), DriverError> {
        info!("simulated join of `{}`", credential.ssid);
        self.identity = Some(credential.ssid.clone());
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.identity.is_some() && !self.down_flag.exists()
    }

    fn abandon_attempt(&mut self) {
        debug!("simulated link attempt abandoned");
    }

    fn network_identity(&self) -> Option<String> {
        self.identity.clone()
    }
}

enum SessionEvent {
    Ack(ConnectReturnCode),
    Message(InboundMessage),
    Closed(String),
}

struct Connection {
    client: AsyncClient,
    task: JoinHandle<()>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// MQTT session over `rumqttc`. The event loop runs on its own task and stops
/// at the first connection error, so reconnection stays with the caller.
struct HostSession {
    config: SessionConfig,
    connection: Option<Connection>,
    progress: ConnectProgress,
    connected: bool,
    inbound: VecDeque<InboundMessage>,
}

impl HostSession {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connection: None,
            progress: ConnectProgress::Pending,
            connected: false,
            inbound: VecDeque::new(),
        }
    }

    fn drain_events(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        while let Ok(event) = connection.events.try_recv() {
            match event {
                SessionEvent::Ack(ConnectReturnCode::Success) => {
                    self.connected = true;
                    self.progress = ConnectProgress::Established;
                }
                SessionEvent::Ack(code) => {
                    self.connected = false;
                    self.progress =
                        ConnectProgress::Failed(DriverError::Rejected(format!("{code:?}")));
                }
                SessionEvent::Message(message) => self.inbound.push_back(message),
                SessionEvent::Closed(reason) => {
                    if !self.connected {
                        self.progress = ConnectProgress::Failed(DriverError::Platform(reason));
                    }
                    self.connected = false;
                }
            }
        }
    }
}

impl SessionDriver for HostSession {
    fn begin_connect(&mut self, client_id: &str) -> Result<(), DriverError> {
        self.disconnect();

        let mut options = MqttOptions::new(
            client_id,
            self.config.broker_host.clone(),
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(15));
        if let Ok(user) = std::env::var("MQTT_USER") {
            let pass = std::env::var("MQTT_PASS").unwrap_or_default();
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let (tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => SessionEvent::Ack(ack.code),
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        SessionEvent::Message(InboundMessage {
                            topic: message.topic,
                            payload: message.payload.to_vec(),
                        })
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = tx.send(SessionEvent::Closed(err.to_string()));
                        break;
                    }
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        self.connection = Some(Connection {
            client,
            task,
            events,
        });
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
        let connection = self.connection.as_ref().ok_or(DriverError::NotConnected)?;
        connection
            .client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(DriverError::platform)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), DriverError> {
        let connection = match self.connection.as_ref() {
            Some(connection) if self.connected => connection,
            _ => return Err(DriverError::NotConnected),
        };
        connection
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(DriverError::platform)
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        if self.inbound.is_empty() {
            self.drain_events();
        }
        self.inbound.pop_front()
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.client.try_disconnect();
            connection.task.abort();
        }
        self.connected = false;
        self.inbound.clear();
    }
}

/// The reset control is "pressed" while the trigger file exists.
struct HostButton {
    path: PathBuf,
}

impl HostButton {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ResetControl for HostButton {
    fn is_active(&mut self) -> bool {
        self.path.exists()
    }
}

struct HostLed;

impl Actuator for HostLed {
    fn set_active(&mut self, active: bool) -> Result<(), DriverError> {
        info!("led {}", if active { "on" } else { "off" });
        Ok(())
    }
}

struct HostDevice;

impl DeviceControl for HostDevice {
    fn restart(&mut self) {
        warn!("restart requested");
    }
}

struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_primary(&mut self) -> Result<Option<Credential>, DriverError> {
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice::<Credential>(&raw)
                .map(Some)
                .map_err(|err| DriverError::InvalidArgument(err.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DriverError::platform(err)),
        }
    }

    fn save_primary(&mut self, credential: &Credential) -> Result<(), DriverError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(DriverError::platform)?;
        }
        let payload = serde_json::to_vec_pretty(credential)
            .map_err(|err| DriverError::InvalidArgument(err.to_string()))?;
        std::fs::write(&self.path, payload).map_err(DriverError::platform)
    }

    fn erase(&mut self) -> Result<(), DriverError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DriverError::platform(err)),
        }
    }
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
