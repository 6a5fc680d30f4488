use thiserror::Error;

/// Non-fatal failures reported to the diagnostic sink. None of them stop the
/// control loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("link unavailable: {reason}")]
    LinkUnavailable { reason: String },
    #[error("session unavailable: {reason}")]
    SessionUnavailable { reason: String },
    #[error("publish to `{topic}` failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("unrecognized command on `{topic}`: {payload:?}")]
    UnrecognizedCommand { topic: String, payload: String },
    #[error("reset cancelled after {held_ms} ms")]
    ResetCancelled { held_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    LinkUnavailable,
    SessionUnavailable,
    PublishFailed,
    UnrecognizedCommand,
    ResetCancelled,
}

impl FaultKind {
    pub const COUNT: usize = 5;

    pub const ALL: [FaultKind; Self::COUNT] = [
        Self::LinkUnavailable,
        Self::SessionUnavailable,
        Self::PublishFailed,
        Self::UnrecognizedCommand,
        Self::ResetCancelled,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::LinkUnavailable => 0,
            Self::SessionUnavailable => 1,
            Self::PublishFailed => 2,
            Self::UnrecognizedCommand => 3,
            Self::ResetCancelled => 4,
        }
    }
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::LinkUnavailable { .. } => FaultKind::LinkUnavailable,
            Self::SessionUnavailable { .. } => FaultKind::SessionUnavailable,
            Self::PublishFailed { .. } => FaultKind::PublishFailed,
            Self::UnrecognizedCommand { .. } => FaultKind::UnrecognizedCommand,
            Self::ResetCancelled { .. } => FaultKind::ResetCancelled,
        }
    }

    pub fn link(reason: impl ToString) -> Self {
        Self::LinkUnavailable {
            reason: reason.to_string(),
        }
    }

    pub fn session(reason: impl ToString) -> Self {
        Self::SessionUnavailable {
            reason: reason.to_string(),
        }
    }
}

/// Errors returned by platform drivers across the trait seams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("platform call failed: {0}")]
    Platform(String),
    #[error("rejected by peer: {0}")]
    Rejected(String),
    #[error("not connected")]
    NotConnected,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DriverError {
    pub fn platform(err: impl core::fmt::Debug) -> Self {
        Self::Platform(format!("{err:?}"))
    }
}
