use log::{info, warn};

use crate::{
    config::ResetConfig,
    diagnostics::Diagnostics,
    error::Fault,
    platform::{CredentialStore, DeviceControl, ResetControl},
};

/// An in-progress press of the reset control. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetGesture {
    pub pressed: bool,
    pub press_start_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Idle,
    Held(ResetGesture),
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    None,
    Armed,
    Cancelled,
    Confirmed,
}

/// Debounced hold-to-wipe gesture. Confirmation is the only path in the
/// system that erases stored credentials.
pub struct ResetTrigger<B, C, D> {
    config: ResetConfig,
    control: B,
    store: C,
    device: D,
    state: ResetState,
}

impl<B, C, D> ResetTrigger<B, C, D>
where
    B: ResetControl,
    C: CredentialStore,
    D: DeviceControl,
{
    pub fn new(config: ResetConfig, control: B, store: C, device: D) -> Self {
        Self {
            config,
            control,
            store,
            device,
            state: ResetState::Idle,
        }
    }

    pub fn state(&self) -> ResetState {
        self.state
    }

    pub fn poll(&mut self, now_ms: u64, diagnostics: &mut Diagnostics) -> ResetEvent {
        let active = self.control.is_active();

        match (self.state, active) {
            (ResetState::Confirmed, _) | (ResetState::Idle, false) => ResetEvent::None,
            (ResetState::Idle, true) => {
                info!(
                    "reset control pressed; hold {} ms to clear network credentials",
                    self.config.hold_ms
                );
                self.state = ResetState::Held(ResetGesture {
                    pressed: true,
                    press_start_ms: now_ms,
                });
                ResetEvent::Armed
            }
            (ResetState::Held(gesture), true) => {
                if now_ms.saturating_sub(gesture.press_start_ms) < self.config.hold_ms {
                    return ResetEvent::None;
                }
                self.state = ResetState::Confirmed;
                self.wipe_and_restart();
                ResetEvent::Confirmed
            }
            (ResetState::Held(gesture), false) => {
                self.state = ResetState::Idle;
                diagnostics.report(Fault::ResetCancelled {
                    held_ms: now_ms.saturating_sub(gesture.press_start_ms),
                });
                ResetEvent::Cancelled
            }
        }
    }

    fn wipe_and_restart(&mut self) {
        warn!("reset confirmed; clearing stored credentials and restarting");
        if let Err(err) = self.store.erase() {
            warn!("failed to erase stored credentials: {err}");
        }
        self.device.restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::FaultKind,
        testing::{FakeButton, FakeDevice, FakeStore},
        types::Credential,
    };

    fn trigger() -> (
        ResetTrigger<FakeButton, FakeStore, FakeDevice>,
        FakeButton,
        FakeStore,
        FakeDevice,
    ) {
        let button = FakeButton::new();
        let store = FakeStore::with_primary(Credential::new("home", "secret"));
        let device = FakeDevice::new();
        let trigger = ResetTrigger::new(
            ResetConfig::default(),
            button.clone(),
            store.clone(),
            device.clone(),
        );
        (trigger, button, store, device)
    }

    #[test]
    fn release_before_threshold_cancels() {
        let (mut trigger, button, store, device) = trigger();
        let mut diagnostics = Diagnostics::new();

        button.set(true);
        assert_eq!(trigger.poll(0, &mut diagnostics), ResetEvent::Armed);
        for now in (100..=2_800).step_by(100) {
            assert_eq!(trigger.poll(now, &mut diagnostics), ResetEvent::None);
        }

        button.set(false);
        assert_eq!(trigger.poll(2_900, &mut diagnostics), ResetEvent::Cancelled);
        assert_eq!(trigger.state(), ResetState::Idle);
        assert_eq!(diagnostics.count(FaultKind::ResetCancelled), 1);
        assert!(store.primary().is_some());
        assert_eq!(device.restarts(), 0);
    }

    #[test]
    fn sustained_hold_confirms_exactly_once() {
        let (mut trigger, button, store, device) = trigger();
        let mut diagnostics = Diagnostics::new();

        button.set(true);
        let mut confirmations = 0;
        for now in (0..=6_000).step_by(100) {
            if trigger.poll(now, &mut diagnostics) == ResetEvent::Confirmed {
                confirmations += 1;
                assert_eq!(now, 3_000);
            }
        }

        assert_eq!(confirmations, 1);
        assert_eq!(trigger.state(), ResetState::Confirmed);
        assert!(store.primary().is_none());
        assert_eq!(device.restarts(), 1);
    }

    #[test]
    fn release_at_resample_does_not_trigger() {
        let (mut trigger, button, store, device) = trigger();
        let mut diagnostics = Diagnostics::new();

        button.set(true);
        trigger.poll(0, &mut diagnostics);
        trigger.poll(2_990, &mut diagnostics);

        // Timer has elapsed but the control reads released on the re-sample.
        button.set(false);
        assert_eq!(trigger.poll(3_050, &mut diagnostics), ResetEvent::Cancelled);
        assert!(store.primary().is_some());
        assert_eq!(device.restarts(), 0);
    }

    #[test]
    fn restart_happens_even_if_erase_fails() {
        let (mut trigger, button, store, device) = trigger();
        let mut diagnostics = Diagnostics::new();
        store.fail_erase(true);

        button.set(true);
        trigger.poll(0, &mut diagnostics);
        assert_eq!(trigger.poll(3_000, &mut diagnostics), ResetEvent::Confirmed);
        assert_eq!(device.restarts(), 1);
    }

    #[test]
    fn a_new_press_after_cancel_restarts_the_timer() {
        let (mut trigger, button, _store, device) = trigger();
        let mut diagnostics = Diagnostics::new();

        button.set(true);
        trigger.poll(0, &mut diagnostics);
        button.set(false);
        trigger.poll(1_000, &mut diagnostics);

        button.set(true);
        assert_eq!(trigger.poll(1_500, &mut diagnostics), ResetEvent::Armed);
        assert_eq!(trigger.poll(4_000, &mut diagnostics), ResetEvent::None);
        assert_eq!(trigger.poll(4_500, &mut diagnostics), ResetEvent::Confirmed);
        assert_eq!(device.restarts(), 1);
    }
}
