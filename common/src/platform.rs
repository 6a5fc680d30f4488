//! Seams between the supervisor and the hardware/network stack.
//!
//! Every method here must return within a bounded time. Long-running work
//! (joining a network, a broker handshake) is split into a `begin_*` call and
//! a cheap status poll so the control loop can re-enter it across ticks.

use crate::{
    error::DriverError,
    types::{Credential, InboundMessage, Reading},
};

/// Link layer: station association plus address acquisition.
pub trait LinkDriver {
    /// Starts the automatic connect flow: join `primary` when present and open
    /// the configuration portal for at most `window_ms`.
    fn begin_provisioning(
        &mut self,
        primary: Option<&Credential>,
        window_ms: u64,
    ) -> Result<(), DriverError>;

    /// Asks the stack to re-associate with whatever it has cached.
    fn begin_reconnect(&mut self) -> Result<(), DriverError>;

    fn begin_join(&mut self, credential: &Credential) -> Result<(), DriverError>;

    /// True only once the stack confirms association and an address.
    fn is_connected(&mut self) -> bool;

    /// Called when an attempt's deadline passes without a connection.
    fn abandon_attempt(&mut self);

    fn network_identity(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectProgress {
    Pending,
    Established,
    Failed(DriverError),
}

/// Publish/subscribe client.
pub trait SessionDriver {
    fn begin_connect(&mut self, client_id: &str) -> Result<(), DriverError>;

    fn poll_connect(&mut self) -> ConnectProgress;

    fn is_connected(&mut self) -> bool;

    fn subscribe(&mut self, topic: &str) -> Result<(), DriverError>;

    /// At-most-once, not retained.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), DriverError>;

    /// Non-blocking; `None` once the inbound buffer is empty.
    fn poll_inbound(&mut self) -> Option<InboundMessage>;

    fn disconnect(&mut self);
}

/// The physical reset control, already normalized so `true` means pressed.
pub trait ResetControl {
    fn is_active(&mut self) -> bool;
}

pub trait Actuator {
    fn set_active(&mut self, active: bool) -> Result<(), DriverError>;
}

pub trait CredentialStore {
    fn load_primary(&mut self) -> Result<Option<Credential>, DriverError>;

    fn save_primary(&mut self, credential: &Credential) -> Result<(), DriverError>;

    fn erase(&mut self) -> Result<(), DriverError>;
}

pub trait DeviceControl {
    /// Unconditional restart. On hardware this does not return.
    fn restart(&mut self);
}

pub trait SensorSource {
    fn topic(&self) -> &'static str;

    fn read(&mut self) -> Result<Reading, DriverError>;
}

/// Randomness for client identifiers.
pub trait Entropy {
    fn next_u32(&mut self) -> u32;
}

impl<F> Entropy for F
where
    F: FnMut() -> u32,
{
    fn next_u32(&mut self) -> u32 {
        self()
    }
}
