use log::debug;

use crate::{
    command::CommandDispatcher,
    diagnostics::Diagnostics,
    link::LinkManager,
    platform::{
        Actuator, CredentialStore, DeviceControl, Entropy, LinkDriver, ResetControl,
        SessionDriver,
    },
    reset::{ResetEvent, ResetTrigger},
    session::SessionManager,
    telemetry::TelemetryScheduler,
    types::{LinkState, SessionState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// A reset was confirmed; the caller should stop ticking.
    Restart,
}

/// One cooperative loop over the five components. Each `tick` polls every
/// component once, in dependency order, and never blocks.
pub struct Supervisor<L, S, E, B, C, D, A> {
    link: LinkManager<L>,
    session: SessionManager<S, E>,
    reset: ResetTrigger<B, C, D>,
    telemetry: TelemetryScheduler,
    commands: CommandDispatcher<A>,
    diagnostics: Diagnostics,
    halted: bool,
}

impl<L, S, E, B, C, D, A> Supervisor<L, S, E, B, C, D, A>
where
    L: LinkDriver,
    S: SessionDriver,
    E: Entropy,
    B: ResetControl,
    C: CredentialStore,
    D: DeviceControl,
    A: Actuator,
{
    pub fn new(
        link: LinkManager<L>,
        session: SessionManager<S, E>,
        reset: ResetTrigger<B, C, D>,
        telemetry: TelemetryScheduler,
        commands: CommandDispatcher<A>,
    ) -> Self {
        Self {
            link,
            session,
            reset,
            telemetry,
            commands,
            diagnostics: Diagnostics::new(),
            halted: false,
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn link_identity(&self) -> Option<&str> {
        self.link.identity()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn actuator_active(&self) -> bool {
        self.commands.is_active()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn tick(&mut self, now_ms: u64) -> TickOutcome {
        if self.halted {
            return TickOutcome::Restart;
        }

        if self.reset.poll(now_ms, &mut self.diagnostics) == ResetEvent::Confirmed {
            self.halted = true;
            return TickOutcome::Restart;
        }

        let link = self.link.ensure_link(now_ms, &mut self.diagnostics);
        if self.link.take_up_edge() {
            self.commands.signal_link_up();
        }

        let session = self
            .session
            .ensure_session(link, now_ms, &mut self.diagnostics);
        debug_assert!(session != SessionState::Connected || link.is_up());

        for message in self.session.process_inbound() {
            self.commands
                .on_message(&message.topic, &message.payload, &mut self.diagnostics);
        }

        if let Some(samples) = self.telemetry.tick(now_ms) {
            if session == SessionState::Connected {
                for sample in &samples {
                    let payload = sample.payload();
                    if self
                        .session
                        .publish(sample.topic, payload.as_bytes(), &mut self.diagnostics)
                    {
                        debug!("published {} = {payload}", sample.topic);
                    }
                }
            } else {
                debug!(
                    "session {}; discarding {} samples",
                    session.as_str(),
                    samples.len()
                );
            }
        }

        TickOutcome::Continue
    }
}
