use log::{debug, info};

use crate::{
    config::SessionConfig,
    diagnostics::Diagnostics,
    error::{DriverError, Fault},
    platform::{ConnectProgress, Entropy, SessionDriver},
    types::{InboundMessage, LinkState, SessionState},
};

const MAX_INBOUND_PER_TICK: usize = 16;

/// Owns the publish/subscribe session layered on the link.
pub struct SessionManager<S, E> {
    config: SessionConfig,
    driver: S,
    entropy: E,
    required: &'static [&'static str],
    state: SessionState,
    client_id: Option<String>,
    subscriptions: Vec<&'static str>,
    handshake_deadline_ms: u64,
    retry_at_ms: u64,
    consecutive_failures: u32,
}

impl<S: SessionDriver, E: Entropy> SessionManager<S, E> {
    pub fn new(
        config: SessionConfig,
        driver: S,
        entropy: E,
        required: &'static [&'static str],
    ) -> Self {
        Self {
            config,
            driver,
            entropy,
            required,
            state: SessionState::Disconnected,
            client_id: None,
            subscriptions: Vec::new(),
            handshake_deadline_ms: 0,
            retry_at_ms: 0,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn subscriptions(&self) -> &[&'static str] {
        &self.subscriptions
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn ensure_session(
        &mut self,
        link: LinkState,
        now_ms: u64,
        diagnostics: &mut Diagnostics,
    ) -> SessionState {
        if !link.is_up() {
            if self.state != SessionState::Disconnected {
                self.driver.disconnect();
                self.reset_session();
                diagnostics.report(Fault::session("link went down"));
            }
            return self.state;
        }

        match self.state {
            SessionState::Connected => {
                if !self.driver.is_connected() {
                    self.driver.disconnect();
                    self.reset_session();
                    // A dropped session reconnects on the next tick; the
                    // retry delay only follows a failed handshake.
                    self.retry_at_ms = now_ms;
                    diagnostics.report(Fault::session("broker connection lost"));
                }
            }
            SessionState::Connecting => self.step_handshake(now_ms, diagnostics),
            SessionState::Disconnected => {
                if now_ms >= self.retry_at_ms {
                    self.begin_handshake(now_ms, diagnostics);
                }
            }
        }

        self.state
    }

    /// Best-effort, at-most-once. The result is only for logging.
    pub fn publish(&mut self, topic: &str, payload: &[u8], diagnostics: &mut Diagnostics) -> bool {
        let result = if self.state == SessionState::Connected {
            self.driver.publish(topic, payload)
        } else {
            Err(DriverError::NotConnected)
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                diagnostics.report(Fault::PublishFailed {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                });
                false
            }
        }
    }

    /// Drains buffered inbound messages; bounded per tick so a chatty broker
    /// cannot starve the rest of the loop.
    pub fn process_inbound(&mut self) -> Vec<InboundMessage> {
        let mut messages = Vec::new();
        if self.state != SessionState::Connected {
            return messages;
        }

        while messages.len() < MAX_INBOUND_PER_TICK {
            match self.driver.poll_inbound() {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        messages
    }

    fn begin_handshake(&mut self, now_ms: u64, diagnostics: &mut Diagnostics) {
        let client_id = format!(
            "{}{:x}",
            self.config.client_id_prefix,
            self.entropy.next_u32() % 0xffff
        );
        info!(
            "connecting to broker {}:{} as `{client_id}`",
            self.config.broker_host, self.config.broker_port
        );

        let started = self.driver.begin_connect(&client_id);
        self.client_id = Some(client_id);

        match started {
            Ok(()) => {
                self.state = SessionState::Connecting;
                self.handshake_deadline_ms =
                    now_ms.saturating_add(self.config.handshake_timeout_ms);
                self.step_handshake(now_ms, diagnostics);
            }
            Err(err) => self.fail_handshake(now_ms, &err.to_string(), diagnostics),
        }
    }

    fn step_handshake(&mut self, now_ms: u64, diagnostics: &mut Diagnostics) {
        match self.driver.poll_connect() {
            ConnectProgress::Established => self.complete_handshake(now_ms, diagnostics),
            ConnectProgress::Failed(err) => {
                self.driver.disconnect();
                self.fail_handshake(now_ms, &err.to_string(), diagnostics);
            }
            ConnectProgress::Pending if now_ms >= self.handshake_deadline_ms => {
                self.driver.disconnect();
                self.fail_handshake(now_ms, "handshake timed out", diagnostics);
            }
            ConnectProgress::Pending => {}
        }
    }

    fn complete_handshake(&mut self, now_ms: u64, diagnostics: &mut Diagnostics) {
        self.subscriptions.clear();
        for &topic in self.required {
            if let Err(err) = self.driver.subscribe(topic) {
                self.driver.disconnect();
                self.fail_handshake(
                    now_ms,
                    &format!("subscribe to `{topic}` failed: {err}"),
                    diagnostics,
                );
                return;
            }
            debug!("subscribed to `{topic}`");
            self.subscriptions.push(topic);
        }

        self.state = SessionState::Connected;
        self.consecutive_failures = 0;
        info!(
            "session connected as `{}`",
            self.client_id.as_deref().unwrap_or_default()
        );
    }

    fn fail_handshake(&mut self, now_ms: u64, reason: &str, diagnostics: &mut Diagnostics) {
        self.reset_session();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.retry_at_ms = now_ms.saturating_add(self.config.retry_delay_ms);
        diagnostics.report(Fault::session(format!("handshake failed: {reason}")));
        info!(
            "session retry attempt {} in {} ms",
            self.consecutive_failures, self.config.retry_delay_ms
        );
    }

    fn reset_session(&mut self) {
        self.state = SessionState::Disconnected;
        self.subscriptions.clear();
    }
}
