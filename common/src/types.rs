use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Down,
    Provisioning,
    ConnectingFallback,
    Up,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Down => "DOWN",
            Self::Provisioning => "PROVISIONING",
            Self::ConnectingFallback => "CONNECTING_FALLBACK",
            Self::Up => "UP",
        }
    }

    pub fn is_up(self) -> bool {
        self == Self::Up
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

/// An (identity, secret) pair for joining a wireless network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

impl Credential {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// A credential with an empty identity is treated as "not provided".
    pub fn is_usable(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// Primary (persisted, possibly absent) then fallback (fixed) candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    primary: Option<Credential>,
    fallback: Credential,
}

impl CredentialSet {
    pub fn new(primary: Option<Credential>, fallback: Credential) -> Self {
        Self {
            primary: primary.filter(Credential::is_usable),
            fallback,
        }
    }

    pub fn primary(&self) -> Option<&Credential> {
        self.primary.as_ref()
    }

    pub fn fallback(&self) -> Option<&Credential> {
        Some(&self.fallback).filter(|cred| cred.is_usable())
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Credential> {
        self.primary().into_iter().chain(self.fallback())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Decimal(f32),
    Integer(i32),
}

impl Reading {
    /// Wire rendering: decimals carry two fractional digits, integers none.
    pub fn to_payload(self) -> String {
        match self {
            Self::Decimal(value) => format!("{value:.2}"),
            Self::Integer(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub topic: &'static str,
    pub value: Reading,
    pub timestamp_ms: u64,
}

impl TelemetrySample {
    pub fn payload(&self) -> String {
        self.value.to_payload()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}
