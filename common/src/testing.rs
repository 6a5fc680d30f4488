//! In-memory platform doubles. Each fake is a cheap handle over shared state
//! so a test can keep one clone while the component under test owns another.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use crate::{
    error::DriverError,
    platform::{
        Actuator, ConnectProgress, CredentialStore, DeviceControl, LinkDriver, ResetControl,
        SessionDriver,
    },
    types::{Credential, InboundMessage},
};

/// Entropy that counts up from `start`.
pub fn counter_entropy(start: u32) -> impl FnMut() -> u32 {
    let mut next = start;
    move || {
        let value = next;
        next = next.wrapping_add(1);
        value
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkCalls {
    pub provisioning: u32,
    pub provisioning_primary: Option<String>,
    pub reconnects: u32,
    pub joined: Vec<String>,
    pub abandoned: u32,
    pub status_checks: u32,
}

#[derive(Default)]
struct LinkInner {
    connected: bool,
    identity: Option<String>,
    refuse_reconnects: bool,
    calls: LinkCalls,
}

#[derive(Clone, Default)]
pub struct FakeLink {
    inner: Rc<RefCell<LinkInner>>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool, ssid: &str) {
        let mut inner = self.inner.borrow_mut();
        inner.connected = connected;
        inner.identity = Some(ssid.to_string());
    }

    pub fn refuse_reconnects(&self) {
        self.inner.borrow_mut().refuse_reconnects = true;
    }

    pub fn calls(&self) -> LinkCalls {
        self.inner.borrow().calls.clone()
    }
}

impl LinkDriver for FakeLink {
    fn begin_provisioning(
        &mut self,
        primary: Option<&Credential>,
        _window_ms: u64,
    ) -> Result<(), DriverError> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.provisioning += 1;
        inner.calls.provisioning_primary = primary.map(|cred| cred.ssid.clone());
        Ok(())
    }

    fn begin_reconnect(&mut self) -> Result<(), DriverError> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.reconnects += 1;
        if inner.refuse_reconnects {
            return Err(DriverError::Platform("station not started".to_string()));
        }
        Ok(())
    }

    fn begin_join(&mut self, credential: &Credential) -> Result<(), DriverError> {
        self.inner
            .borrow_mut()
            .calls
            .joined
            .push(credential.ssid.clone());
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.calls.status_checks += 1;
        inner.connected
    }

    fn abandon_attempt(&mut self) {
        self.inner.borrow_mut().calls.abandoned += 1;
    }

    fn network_identity(&self) -> Option<String> {
        let inner = self.inner.borrow();
        inner.identity.clone().filter(|_| inner.connected)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCalls {
    pub connects: Vec<String>,
    pub subscribed: Vec<String>,
    pub disconnects: u32,
    pub published: Vec<(String, String)>,
}

#[derive(Default)]
struct SessionInner {
    connected: bool,
    failing_connects: u32,
    hold_handshakes: bool,
    fail_publishes: bool,
    inbound: VecDeque<InboundMessage>,
    calls: SessionCalls,
}

#[derive(Clone, Default)]
pub struct FakeSession {
    inner: Rc<RefCell<SessionInner>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> SessionCalls {
        self.inner.borrow().calls.clone()
    }

    /// Simulates the broker closing the connection.
    pub fn drop_connection(&self) {
        self.inner.borrow_mut().connected = false;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.inner.borrow_mut().failing_connects = count;
    }

    pub fn hold_handshakes(&self, hold: bool) {
        self.inner.borrow_mut().hold_handshakes = hold;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.borrow_mut().fail_publishes = fail;
    }

    pub fn push_inbound(&self, topic: &str, payload: &str) {
        self.inner.borrow_mut().inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }
}

impl SessionDriver for FakeSession {
    fn begin_connect(&mut self, client_id: &str) -> Result<(), DriverError> {
        self.inner
            .borrow_mut()
            .calls
            .connects
            .push(client_id.to_string());
        Ok(())
    }

    fn poll_connect(&mut self) -> ConnectProgress {
        let mut inner = self.inner.borrow_mut();
        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return ConnectProgress::Failed(DriverError::Rejected("broker refused".to_string()));
        }
        if inner.hold_handshakes {
            return ConnectProgress::Pending;
        }
        inner.connected = true;
        ConnectProgress::Established
    }

    fn is_connected(&mut self) -> bool {
        self.inner.borrow().connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), DriverError> {
        self.inner
            .borrow_mut()
            .calls
            .subscribed
            .push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), DriverError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_publishes || !inner.connected {
            return Err(DriverError::NotConnected);
        }
        inner.calls.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        self.inner.borrow_mut().inbound.pop_front()
    }

    fn disconnect(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.connected = false;
        inner.calls.disconnects += 1;
    }
}

#[derive(Clone, Default)]
pub struct FakeButton {
    pressed: Rc<Cell<bool>>,
}

impl FakeButton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pressed: bool) {
        self.pressed.set(pressed);
    }
}

impl ResetControl for FakeButton {
    fn is_active(&mut self) -> bool {
        self.pressed.get()
    }
}

#[derive(Default)]
struct StoreInner {
    primary: Option<Credential>,
    fail_erase: bool,
}

#[derive(Clone, Default)]
pub struct FakeStore {
    inner: Rc<RefCell<StoreInner>>,
}

impl FakeStore {
    pub fn with_primary(credential: Credential) -> Self {
        let store = Self::default();
        store.inner.borrow_mut().primary = Some(credential);
        store
    }

    pub fn primary(&self) -> Option<Credential> {
        self.inner.borrow().primary.clone()
    }

    pub fn fail_erase(&self, fail: bool) {
        self.inner.borrow_mut().fail_erase = fail;
    }
}

impl CredentialStore for FakeStore {
    fn load_primary(&mut self) -> Result<Option<Credential>, DriverError> {
        Ok(self.primary())
    }

    fn save_primary(&mut self, credential: &Credential) -> Result<(), DriverError> {
        self.inner.borrow_mut().primary = Some(credential.clone());
        Ok(())
    }

    fn erase(&mut self) -> Result<(), DriverError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_erase {
            return Err(DriverError::Platform("flash write failed".to_string()));
        }
        inner.primary = None;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeDevice {
    restarts: Rc<Cell<u32>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.get()
    }
}

impl DeviceControl for FakeDevice {
    fn restart(&mut self) {
        self.restarts.set(self.restarts.get() + 1);
    }
}

#[derive(Default)]
struct LedInner {
    on: bool,
    fail_writes: bool,
}

#[derive(Clone, Default)]
pub struct FakeLed {
    inner: Rc<RefCell<LedInner>>,
}

impl FakeLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.inner.borrow().on
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.borrow_mut().fail_writes = fail;
    }
}

impl Actuator for FakeLed {
    fn set_active(&mut self, active: bool) -> Result<(), DriverError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_writes {
            return Err(DriverError::Platform("gpio write failed".to_string()));
        }
        inner.on = active;
        Ok(())
    }
}
