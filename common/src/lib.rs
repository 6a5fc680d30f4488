pub mod command;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod link;
pub mod platform;
pub mod reset;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod topics;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{parse_led_command, CommandDispatcher, CommandOutcome};
pub use config::{LinkConfig, NodeConfig, PortalConfig, ResetConfig, SessionConfig, TelemetryConfig};
pub use diagnostics::Diagnostics;
pub use error::{DriverError, Fault, FaultKind};
pub use link::LinkManager;
pub use reset::{ResetEvent, ResetGesture, ResetState, ResetTrigger};
pub use session::SessionManager;
pub use supervisor::{Supervisor, TickOutcome};
pub use telemetry::{approximate_celsius, HallSource, TelemetryScheduler, TemperatureSource};
pub use topics::*;
pub use types::{
    Credential, CredentialSet, InboundMessage, LinkState, Reading, SessionState, TelemetrySample,
};
