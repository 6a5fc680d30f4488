use serde::{Deserialize, Serialize};

use crate::types::Credential;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub provisioning_timeout_ms: u64,
    pub fallback_first_timeout_ms: u64,
    pub fallback_retry_timeout_ms: u64,
    pub reconnect_window_ms: u64,
    pub connect_poll_interval_ms: u64,
    pub reconnect_poll_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            provisioning_timeout_ms: 20_000,
            fallback_first_timeout_ms: 20_000,
            fallback_retry_timeout_ms: 10_000,
            reconnect_window_ms: 5_000,
            connect_poll_interval_ms: 500,
            reconnect_poll_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id_prefix: String,
    pub retry_delay_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broker_host: "broker.hivemq.com".to_string(),
            broker_port: 1883,
            client_id_prefix: "ESP32-".to_string(),
            retry_delay_ms: 5_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn broker_url(&self) -> String {
        format!("mqtt://{}:{}", self.broker_host, self.broker_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    pub hold_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            hold_ms: 3_000,
            restart_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub ap_ssid: String,
    pub ap_password: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "ESP32_Config_AP".to_string(),
            ap_password: "12345678".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub link: LinkConfig,
    pub session: SessionConfig,
    pub reset: ResetConfig,
    pub telemetry: TelemetryConfig,
    pub portal: PortalConfig,
    pub fallback: Credential,
    pub tick_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            session: SessionConfig::default(),
            reset: ResetConfig::default(),
            telemetry: TelemetryConfig::default(),
            portal: PortalConfig::default(),
            fallback: Credential::new(
                option_env!("FALLBACK_SSID").unwrap_or(""),
                option_env!("FALLBACK_PASS").unwrap_or(""),
            ),
            tick_interval_ms: 50,
        }
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.link.sanitize();
        self.session.sanitize();

        self.reset.hold_ms = self.reset.hold_ms.max(500);
        self.reset.restart_delay_ms = self.reset.restart_delay_ms.min(5_000);
        self.telemetry.interval_ms = self.telemetry.interval_ms.max(1_000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 1_000);

        if self.portal.ap_ssid.trim().is_empty() {
            self.portal.ap_ssid = PortalConfig::default().ap_ssid;
        }
        // WPA2 passphrases are 8..=63 bytes.
        if !(8..=63).contains(&self.portal.ap_password.len()) {
            self.portal.ap_password = PortalConfig::default().ap_password;
        }
    }
}

impl LinkConfig {
    pub fn sanitize(&mut self) {
        self.connect_poll_interval_ms = self.connect_poll_interval_ms.clamp(50, 5_000);
        self.reconnect_poll_interval_ms = self.reconnect_poll_interval_ms.clamp(50, 5_000);
        self.provisioning_timeout_ms = self.provisioning_timeout_ms.max(1_000);
        self.fallback_first_timeout_ms = self.fallback_first_timeout_ms.max(1_000);
        self.fallback_retry_timeout_ms = self.fallback_retry_timeout_ms.max(1_000);
        self.reconnect_window_ms = self.reconnect_window_ms.max(500);
    }
}

impl SessionConfig {
    pub fn sanitize(&mut self) {
        if self.broker_host.trim().is_empty() {
            self.broker_host = SessionConfig::default().broker_host;
        }
        if self.broker_port == 0 {
            self.broker_port = 1883;
        }
        if self.client_id_prefix.is_empty() {
            self.client_id_prefix = SessionConfig::default().client_id_prefix;
        }
        self.retry_delay_ms = self.retry_delay_ms.max(500);
        self.handshake_timeout_ms = self.handshake_timeout_ms.max(1_000);
    }
}
