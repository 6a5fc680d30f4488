use log::{debug, info, warn};

use crate::{diagnostics::Diagnostics, error::Fault, platform::Actuator, topics::TOPIC_LED};

const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied { active: bool },
    Ignored,
    Unrecognized,
}

/// Accepted tokens are exact and case-sensitive.
pub fn parse_led_command(payload: &str) -> Option<bool> {
    match payload {
        "ON" | "true" => Some(true),
        "OFF" | "false" => Some(false),
        _ => None,
    }
}

/// Maps inbound commands onto the single actuator. Latest message wins.
pub struct CommandDispatcher<A> {
    actuator: A,
    active: bool,
}

impl<A: Actuator> CommandDispatcher<A> {
    pub fn new(mut actuator: A) -> Self {
        if let Err(err) = actuator.set_active(false) {
            warn!("failed to initialize actuator: {err}");
        }
        Self {
            actuator,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// One-shot indicator for a fresh link.
    pub fn signal_link_up(&mut self) {
        self.apply(true);
    }

    pub fn on_message(
        &mut self,
        topic: &str,
        payload: &[u8],
        diagnostics: &mut Diagnostics,
    ) -> CommandOutcome {
        if topic != TOPIC_LED {
            debug!("ignoring message on unhandled topic `{topic}`");
            return CommandOutcome::Ignored;
        }

        let parsed = if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
            None
        } else {
            core::str::from_utf8(payload).ok().map(|text| (text, parse_led_command(text)))
        };

        match parsed {
            Some((_, Some(active))) => {
                self.apply(active);
                CommandOutcome::Applied { active }
            }
            Some((text, None)) => {
                diagnostics.report(Fault::UnrecognizedCommand {
                    topic: topic.to_string(),
                    payload: text.to_string(),
                });
                CommandOutcome::Unrecognized
            }
            None => {
                diagnostics.report(Fault::UnrecognizedCommand {
                    topic: topic.to_string(),
                    payload: format!("<{} bytes, not accepted>", payload.len()),
                });
                CommandOutcome::Unrecognized
            }
        }
    }

    fn apply(&mut self, active: bool) {
        match self.actuator.set_active(active) {
            Ok(()) => {
                self.active = active;
                info!("actuator -> {}", if active { "ON" } else { "OFF" });
            }
            Err(err) => warn!("failed to drive actuator: {err}"),
        }
    }
}
