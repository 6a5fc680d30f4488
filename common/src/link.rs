use log::{debug, info};

use crate::{
    config::LinkConfig,
    diagnostics::Diagnostics,
    error::Fault,
    platform::LinkDriver,
    types::{CredentialSet, LinkState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptPhase {
    Provisioning,
    Reconnect,
    Fallback,
}

impl AttemptPhase {
    fn reported_state(self) -> LinkState {
        match self {
            Self::Provisioning => LinkState::Provisioning,
            Self::Reconnect => LinkState::Down,
            Self::Fallback => LinkState::ConnectingFallback,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    phase: AttemptPhase,
    deadline_ms: u64,
    next_poll_ms: u64,
}

/// Owns the link-layer connection. Every attempt is time-boxed and re-entered
/// across ticks, so `ensure_link` never stalls the loop.
pub struct LinkManager<L> {
    config: LinkConfig,
    credentials: CredentialSet,
    driver: L,
    state: LinkState,
    identity: Option<String>,
    last_transition_ms: u64,
    attempt: Option<Attempt>,
    cold_start: bool,
    idle_until_ms: u64,
    up_edge: bool,
}

impl<L: LinkDriver> LinkManager<L> {
    pub fn new(config: LinkConfig, credentials: CredentialSet, driver: L) -> Self {
        Self {
            config,
            credentials,
            driver,
            state: LinkState::Down,
            identity: None,
            last_transition_ms: 0,
            attempt: None,
            cold_start: true,
            idle_until_ms: 0,
            up_edge: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn last_transition_ms(&self) -> u64 {
        self.last_transition_ms
    }

    /// Returns true exactly once per transition into `Up`.
    pub fn take_up_edge(&mut self) -> bool {
        core::mem::take(&mut self.up_edge)
    }

    pub fn ensure_link(&mut self, now_ms: u64, diagnostics: &mut Diagnostics) -> LinkState {
        if self.state == LinkState::Up {
            if self.driver.is_connected() {
                return LinkState::Up;
            }

            let lost = self.identity.take().unwrap_or_else(|| "network".to_string());
            diagnostics.report(Fault::link(format!("lost association with `{lost}`")));
            self.transition(LinkState::Down, now_ms);
            return self.state;
        }

        if self.attempt.is_none() {
            if now_ms < self.idle_until_ms {
                return self.state;
            }

            if core::mem::take(&mut self.cold_start) {
                self.begin_provisioning(now_ms, diagnostics);
            } else {
                self.begin_reconnect(now_ms, diagnostics);
            }

            // The driver refused every attempt; wait a reconnect window
            // before asking again.
            if self.attempt.is_none() {
                self.idle_until_ms = now_ms.saturating_add(self.config.reconnect_window_ms);
                return self.state;
            }
        }

        self.step_attempt(now_ms, diagnostics)
    }

    fn step_attempt(&mut self, now_ms: u64, diagnostics: &mut Diagnostics) -> LinkState {
        let Some(mut attempt) = self.attempt else {
            return self.state;
        };

        if now_ms >= attempt.next_poll_ms {
            if self.driver.is_connected() {
                self.attempt = None;
                self.identity = self.driver.network_identity();
                self.transition(LinkState::Up, now_ms);
                self.up_edge = true;
                info!(
                    "link up on `{}`",
                    self.identity.as_deref().unwrap_or("unknown network")
                );
                return LinkState::Up;
            }
            attempt.next_poll_ms = now_ms.saturating_add(self.poll_interval(attempt.phase));
        }

        if now_ms < attempt.deadline_ms {
            self.attempt = Some(attempt);
            return self.state;
        }

        self.driver.abandon_attempt();
        self.attempt = None;

        match attempt.phase {
            AttemptPhase::Provisioning => {
                diagnostics.report(Fault::link("provisioning window elapsed without a connection"));
                self.begin_fallback(self.config.fallback_first_timeout_ms, now_ms, diagnostics);
            }
            AttemptPhase::Reconnect => {
                diagnostics.report(Fault::link("cached reconnect timed out"));
                self.begin_fallback(self.config.fallback_retry_timeout_ms, now_ms, diagnostics);
            }
            AttemptPhase::Fallback => {
                diagnostics.report(Fault::link("fallback network join timed out"));
                self.transition(LinkState::Down, now_ms);
            }
        }

        self.state
    }

    fn begin_provisioning(&mut self, now_ms: u64, diagnostics: &mut Diagnostics) {
        let window_ms = self.config.provisioning_timeout_ms;
        info!("starting automatic connect (window {window_ms} ms)");

        match self
            .driver
            .begin_provisioning(self.credentials.primary(), window_ms)
        {
            Ok(()) => self.start_attempt(AttemptPhase::Provisioning, window_ms, now_ms),
            Err(err) => {
                diagnostics.report(Fault::link(format!("provisioning failed to start: {err}")));
                self.begin_fallback(self.config.fallback_first_timeout_ms, now_ms, diagnostics);
            }
        }
    }

    fn begin_reconnect(&mut self, now_ms: u64, diagnostics: &mut Diagnostics) {
        debug!("link down; asking stack to reconnect from cached state");

        match self.driver.begin_reconnect() {
            Ok(()) => self.start_attempt(
                AttemptPhase::Reconnect,
                self.config.reconnect_window_ms,
                now_ms,
            ),
            Err(err) => {
                diagnostics.report(Fault::link(format!("reconnect failed to start: {err}")));
                self.begin_fallback(self.config.fallback_retry_timeout_ms, now_ms, diagnostics);
            }
        }
    }

    /// Only the join that follows the cold-start window gets the long timeout.
    fn begin_fallback(&mut self, timeout_ms: u64, now_ms: u64, diagnostics: &mut Diagnostics) {
        let Some(fallback) = self.credentials.fallback() else {
            debug!("fallback network not provided, skipping manual connect");
            self.transition(LinkState::Down, now_ms);
            return;
        };

        info!(
            "joining fallback network `{}` (timeout {timeout_ms} ms)",
            fallback.ssid
        );

        match self.driver.begin_join(fallback) {
            Ok(()) => self.start_attempt(AttemptPhase::Fallback, timeout_ms, now_ms),
            Err(err) => {
                diagnostics.report(Fault::link(format!("fallback join failed to start: {err}")));
                self.transition(LinkState::Down, now_ms);
            }
        }
    }

    fn start_attempt(&mut self, phase: AttemptPhase, timeout_ms: u64, now_ms: u64) {
        self.attempt = Some(Attempt {
            phase,
            deadline_ms: now_ms.saturating_add(timeout_ms),
            next_poll_ms: now_ms,
        });
        self.transition(phase.reported_state(), now_ms);
    }

    fn poll_interval(&self, phase: AttemptPhase) -> u64 {
        match phase {
            AttemptPhase::Reconnect => self.config.reconnect_poll_interval_ms,
            AttemptPhase::Provisioning | AttemptPhase::Fallback => {
                self.config.connect_poll_interval_ms
            }
        }
    }

    fn transition(&mut self, next: LinkState, now_ms: u64) {
        if self.state != next {
            debug!("link {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
            self.last_transition_ms = now_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::FaultKind,
        testing::FakeLink,
        types::Credential,
    };

    fn manager(fallback: Credential) -> (LinkManager<FakeLink>, FakeLink) {
        let link = FakeLink::new();
        let manager = LinkManager::new(
            LinkConfig::default(),
            CredentialSet::new(None, fallback),
            link.clone(),
        );
        (manager, link)
    }

    #[test]
    fn cold_start_provisions_then_comes_up() {
        let (mut manager, link) = manager(Credential::default());
        let mut diagnostics = Diagnostics::new();

        assert_eq!(manager.ensure_link(0, &mut diagnostics), LinkState::Provisioning);
        assert_eq!(link.calls().provisioning, 1);

        link.set_connected(true, "home");
        assert_eq!(manager.ensure_link(500, &mut diagnostics), LinkState::Up);
        assert_eq!(manager.identity(), Some("home"));
        assert_eq!(manager.last_transition_ms(), 500);
        assert!(manager.take_up_edge());
        assert!(!manager.take_up_edge());
        assert_eq!(diagnostics.total(), 0);
    }

    #[test]
    fn status_is_polled_at_fixed_interval() {
        let (mut manager, link) = manager(Credential::default());
        let mut diagnostics = Diagnostics::new();

        manager.ensure_link(0, &mut diagnostics);
        let polls_after_start = link.calls().status_checks;

        manager.ensure_link(100, &mut diagnostics);
        manager.ensure_link(499, &mut diagnostics);
        assert_eq!(link.calls().status_checks, polls_after_start);

        manager.ensure_link(500, &mut diagnostics);
        assert_eq!(link.calls().status_checks, polls_after_start + 1);
    }

    #[test]
    fn provisioning_timeout_falls_back_with_first_timeout() {
        let (mut manager, link) = manager(Credential::new("hidden", "pw"));
        let mut diagnostics = Diagnostics::new();

        manager.ensure_link(0, &mut diagnostics);
        assert_eq!(manager.ensure_link(19_999, &mut diagnostics), LinkState::Provisioning);

        assert_eq!(
            manager.ensure_link(20_000, &mut diagnostics),
            LinkState::ConnectingFallback
        );
        assert_eq!(link.calls().abandoned, 1);
        assert_eq!(link.calls().joined, vec!["hidden".to_string()]);
        assert_eq!(diagnostics.count(FaultKind::LinkUnavailable), 1);

        // First fallback attempt gets the long window.
        assert_eq!(
            manager.ensure_link(39_999, &mut diagnostics),
            LinkState::ConnectingFallback
        );
        assert_eq!(manager.ensure_link(40_000, &mut diagnostics), LinkState::Down);
    }

    #[test]
    fn later_fallback_attempts_use_retry_timeout() {
        let (mut manager, link) = manager(Credential::new("hidden", "pw"));
        let mut diagnostics = Diagnostics::new();

        manager.ensure_link(0, &mut diagnostics);
        manager.ensure_link(20_000, &mut diagnostics);
        assert_eq!(manager.ensure_link(40_000, &mut diagnostics), LinkState::Down);

        // Next tick: cached reconnect for 5 s, then a shorter fallback attempt.
        assert_eq!(manager.ensure_link(40_050, &mut diagnostics), LinkState::Down);
        assert_eq!(link.calls().reconnects, 1);
        assert_eq!(
            manager.ensure_link(45_050, &mut diagnostics),
            LinkState::ConnectingFallback
        );
        assert_eq!(link.calls().joined.len(), 2);
        assert_eq!(
            manager.ensure_link(55_049, &mut diagnostics),
            LinkState::ConnectingFallback
        );
        assert_eq!(manager.ensure_link(55_050, &mut diagnostics), LinkState::Down);
    }

    #[test]
    fn fallback_after_a_fallback_connection_uses_retry_timeout() {
        let (mut manager, link) = manager(Credential::new("hidden", "pw"));
        let mut diagnostics = Diagnostics::new();

        manager.ensure_link(0, &mut diagnostics);
        assert_eq!(
            manager.ensure_link(20_000, &mut diagnostics),
            LinkState::ConnectingFallback
        );
        link.set_connected(true, "hidden");
        assert_eq!(manager.ensure_link(20_500, &mut diagnostics), LinkState::Up);

        link.set_connected(false, "hidden");
        assert_eq!(manager.ensure_link(30_000, &mut diagnostics), LinkState::Down);
        assert_eq!(manager.ensure_link(30_050, &mut diagnostics), LinkState::Down);
        assert_eq!(link.calls().reconnects, 1);

        assert_eq!(
            manager.ensure_link(35_050, &mut diagnostics),
            LinkState::ConnectingFallback
        );
        assert_eq!(link.calls().joined.len(), 2);
        assert_eq!(
            manager.ensure_link(45_049, &mut diagnostics),
            LinkState::ConnectingFallback
        );
        assert_eq!(manager.ensure_link(45_050, &mut diagnostics), LinkState::Down);
    }

    #[test]
    fn refused_reconnect_waits_before_retrying() {
        let (mut manager, link) = manager(Credential::default());
        let mut diagnostics = Diagnostics::new();
        link.refuse_reconnects();

        link.set_connected(true, "home");
        assert_eq!(manager.ensure_link(0, &mut diagnostics), LinkState::Up);
        link.set_connected(false, "home");
        assert_eq!(manager.ensure_link(1_000, &mut diagnostics), LinkState::Down);

        for now in (1_050..=6_000).step_by(50) {
            assert_eq!(manager.ensure_link(now, &mut diagnostics), LinkState::Down);
        }
        assert_eq!(link.calls().reconnects, 1);
        assert_eq!(diagnostics.count(FaultKind::LinkUnavailable), 2);

        manager.ensure_link(6_050, &mut diagnostics);
        assert_eq!(link.calls().reconnects, 2);
        assert_eq!(diagnostics.count(FaultKind::LinkUnavailable), 3);
    }

    #[test]
    fn empty_fallback_identity_is_never_attempted() {
        let (mut manager, link) = manager(Credential::new("", "ignored"));
        let mut diagnostics = Diagnostics::new();

        let mut now = 0;
        while now <= 120_000 {
            let state = manager.ensure_link(now, &mut diagnostics);
            assert_ne!(state, LinkState::ConnectingFallback);
            assert_ne!(state, LinkState::Up);
            now += 100;
        }

        assert!(link.calls().joined.is_empty());
        assert!(link.calls().reconnects > 1);
        assert_eq!(manager.state(), LinkState::Down);
    }

    #[test]
    fn repeated_calls_while_up_have_no_side_effects() {
        let (mut manager, link) = manager(Credential::new("hidden", "pw"));
        let mut diagnostics = Diagnostics::new();

        link.set_connected(true, "home");
        assert_eq!(manager.ensure_link(0, &mut diagnostics), LinkState::Up);
        let before = link.calls();

        for now in (50..5_000).step_by(50) {
            assert_eq!(manager.ensure_link(now, &mut diagnostics), LinkState::Up);
        }

        let after = link.calls();
        assert_eq!(after.provisioning, before.provisioning);
        assert_eq!(after.reconnects, before.reconnects);
        assert_eq!(after.joined, before.joined);
        assert_eq!(after.abandoned, before.abandoned);
    }

    #[test]
    fn lost_link_is_reported_then_reconnected_from_cache() {
        let (mut manager, link) = manager(Credential::default());
        let mut diagnostics = Diagnostics::new();

        link.set_connected(true, "home");
        manager.ensure_link(0, &mut diagnostics);
        assert!(manager.take_up_edge());

        link.set_connected(false, "home");
        assert_eq!(manager.ensure_link(1_000, &mut diagnostics), LinkState::Down);
        assert_eq!(diagnostics.count(FaultKind::LinkUnavailable), 1);
        assert_eq!(manager.identity(), None);

        assert_eq!(manager.ensure_link(1_050, &mut diagnostics), LinkState::Down);
        assert_eq!(link.calls().reconnects, 1);

        link.set_connected(true, "home");
        assert_eq!(manager.ensure_link(1_250, &mut diagnostics), LinkState::Up);
        assert!(manager.take_up_edge());
    }

    #[test]
    fn primary_credentials_are_handed_to_provisioning() {
        let link = FakeLink::new();
        let mut manager = LinkManager::new(
            LinkConfig::default(),
            CredentialSet::new(Some(Credential::new("home", "secret")), Credential::default()),
            link.clone(),
        );

        manager.ensure_link(0, &mut Diagnostics::new());

        assert_eq!(link.calls().provisioning_primary, Some("home".to_string()));
    }
}
