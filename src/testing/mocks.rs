//! Mock implementations for testing
//!
//! Provides mock protocol client, identity, clock, session factory and
//! callbacks so the connection core can be exercised without a broker.
//! Every mock is cheaply cloneable and clones share recorded state.

use crate::clock::Clock;
use crate::config::DeviceSection;
use crate::handler::SessionFactory;
use crate::identity::{DeviceIdentity, IdentityError};
use crate::transport::mqtt::connection::{ClientSettings, ConnectionState, Endpoint};
use crate::transport::mqtt::message_handler::CloudCallbacks;
use crate::transport::{MessageSink, MqttError, ProtocolClient, QoS, ReturnCode};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Arguments of one `connect` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub clean_session: bool,
}

#[derive(Default)]
struct MockClientState {
    begun: Vec<Endpoint>,
    connects: Vec<ConnectCall>,
    subscriptions: Vec<(String, QoS)>,
    published: Vec<(String, Vec<u8>)>,
    disconnects: usize,
    polls: usize,
    connected: bool,
    status_reads: usize,
    stale_reads: usize,
    connect_outcomes: VecDeque<Result<(), MqttError>>,
    fail_publish: bool,
    last_error: Option<MqttError>,
    return_code: ReturnCode,
    sink: Option<MessageSink>,
}

/// Scriptable protocol client recording every call
#[derive(Clone, Default)]
pub struct MockProtocolClient {
    state: Arc<Mutex<MockClientState>>,
}

impl MockProtocolClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of a future `connect`; unscripted connects succeed
    pub fn push_connect_outcome(&self, outcome: Result<(), MqttError>) {
        lock(&self.state).connect_outcomes.push_back(outcome);
    }

    /// Queue a broker rejection with the given return code
    pub fn reject_next_connect(&self, code: ReturnCode) {
        self.push_connect_outcome(Err(MqttError::ConnectionDenied(code)));
    }

    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    /// Report `false` for the next `reads` status checks regardless of the session
    pub fn lag_status(&self, reads: usize) {
        lock(&self.state).stale_reads = reads;
    }

    /// Number of `connected()` checks made so far
    pub fn status_reads(&self) -> usize {
        lock(&self.state).status_reads
    }

    pub fn set_fail_publish(&self, fail: bool) {
        lock(&self.state).fail_publish = fail;
    }

    /// Simulate an inbound publish through the registered sink
    pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        let sink = lock(&self.state).sink.clone();
        match sink {
            Some(sink) => {
                sink(topic, payload);
                true
            }
            None => false,
        }
    }

    pub fn begun(&self) -> Vec<Endpoint> {
        lock(&self.state).begun.clone()
    }

    pub fn connects(&self) -> Vec<ConnectCall> {
        lock(&self.state).connects.clone()
    }

    /// Credential secrets presented, in order
    pub fn connect_passwords(&self) -> Vec<String> {
        lock(&self.state)
            .connects
            .iter()
            .map(|c| c.password.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state).published.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn poll_count(&self) -> usize {
        lock(&self.state).polls
    }

    /// Calls that would touch the network (begin, connect, publish, subscribe, disconnect)
    pub fn io_call_count(&self) -> usize {
        let state = lock(&self.state);
        state.begun.len()
            + state.connects.len()
            + state.published.len()
            + state.subscriptions.len()
            + state.disconnects
    }

    pub fn clear_history(&self) {
        let mut state = lock(&self.state);
        state.begun.clear();
        state.connects.clear();
        state.subscriptions.clear();
        state.published.clear();
        state.disconnects = 0;
        state.polls = 0;
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    fn begin(&mut self, endpoint: &Endpoint) {
        lock(&self.state).begun.push(endpoint.clone());
    }

    async fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
        clean_session: bool,
    ) -> bool {
        let mut state = lock(&self.state);
        state.connects.push(ConnectCall {
            client_id: client_id.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            clean_session,
        });

        match state.connect_outcomes.pop_front().unwrap_or(Ok(())) {
            Ok(()) => {
                state.connected = true;
                state.last_error = None;
                state.return_code = ReturnCode::Accepted;
                true
            }
            Err(e) => {
                state.connected = false;
                state.return_code = e.return_code();
                state.last_error = Some(e);
                false
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let mut state = lock(&self.state);
        state.published.push((topic.to_string(), payload.to_vec()));
        state.connected && !state.fail_publish
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> bool {
        let mut state = lock(&self.state);
        state.subscriptions.push((topic.to_string(), qos));
        state.connected
    }

    async fn disconnect(&mut self) {
        let mut state = lock(&self.state);
        state.disconnects += 1;
        state.connected = false;
    }

    async fn poll(&mut self) {
        lock(&self.state).polls += 1;
    }

    fn connected(&self) -> bool {
        let mut state = lock(&self.state);
        state.status_reads += 1;
        if state.stale_reads > 0 {
            state.stale_reads -= 1;
            return false;
        }
        state.connected
    }

    fn last_error(&self) -> Option<MqttError> {
        lock(&self.state).last_error.clone()
    }

    fn return_code(&self) -> ReturnCode {
        lock(&self.state).return_code
    }

    fn on_message(&mut self, sink: MessageSink) {
        lock(&self.state).sink = Some(sink);
    }
}

#[derive(Default)]
struct MockIdentityState {
    current: Option<String>,
    loaded: Vec<String>,
}

/// Identity producing readable fake tokens (`token-<key>-<iat>`)
#[derive(Clone)]
pub struct MockIdentity {
    device_id: String,
    rejected: Arc<Vec<String>>,
    state: Arc<Mutex<MockIdentityState>>,
}

impl MockIdentity {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            rejected: Arc::new(Vec::new()),
            state: Arc::new(Mutex::new(MockIdentityState::default())),
        }
    }

    /// Treat `key` as malformed
    pub fn rejecting(mut self, key: &str) -> Self {
        let mut rejected = (*self.rejected).clone();
        rejected.push(key.to_string());
        self.rejected = Arc::new(rejected);
        self
    }

    /// Every key passed to `set_private_key`, in order
    pub fn loaded_keys(&self) -> Vec<String> {
        lock(&self.state).loaded.clone()
    }
}

impl DeviceIdentity for MockIdentity {
    fn set_private_key(&mut self, key: &str) -> Result<(), IdentityError> {
        let mut state = lock(&self.state);
        state.loaded.push(key.to_string());
        if self.rejected.iter().any(|k| k == key) {
            state.current = None;
            return Err(IdentityError::InvalidKey(format!("mock rejects {key}")));
        }
        state.current = Some(key.to_string());
        Ok(())
    }

    fn create_jwt(
        &self,
        issued_at: DateTime<Utc>,
        _ttl: Duration,
    ) -> Result<String, IdentityError> {
        let state = lock(&self.state);
        let key = state.current.as_ref().ok_or(IdentityError::NoKey)?;
        Ok(format!("token-{key}-{}", issued_at.timestamp()))
    }

    fn client_id(&self) -> String {
        format!("projects/test/locations/test/registries/test/devices/{}", self.device_id)
    }

    fn events_topic(&self) -> String {
        format!("/devices/{}/events", self.device_id)
    }

    fn state_topic(&self) -> String {
        format!("/devices/{}/state", self.device_id)
    }

    fn config_topic(&self) -> String {
        format!("/devices/{}/config", self.device_id)
    }

    fn commands_topic(&self) -> String {
        format!("/devices/{}/commands/#", self.device_id)
    }
}

/// Hand-driven clock; clones share the same time
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<(DateTime<Utc>, u64)>>,
}

impl ManualClock {
    fn at(now: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new((now, 0))),
        }
    }

    /// Clock already synchronised (mid 2024)
    pub fn synced() -> Self {
        Self::at(synced_time())
    }

    /// Clock still at the epoch, as after a cold boot without NTP
    pub fn unsynced() -> Self {
        Self::at(Utc.timestamp_opt(0, 0).single().unwrap_or_default())
    }

    /// Jump the wall clock to a synchronised time
    pub fn sync(&self) {
        lock(&self.state).0 = synced_time();
    }

    /// Advance both wall and monotonic time
    pub fn advance_millis(&self, millis: u64) {
        let mut state = lock(&self.state);
        let delta = chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX));
        state.0 = state.0 + delta;
        state.1 += millis;
    }
}

fn synced_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        lock(&self.state).0
    }

    fn millis(&self) -> u64 {
        lock(&self.state).1
    }
}

/// Callbacks recording everything they receive
#[derive(Default)]
pub struct RecordingCallbacks {
    commands: Mutex<Vec<(String, Vec<u8>)>>,
    configs: Mutex<Vec<Vec<u8>>>,
    states: Mutex<Vec<ConnectionState>>,
    connected: AtomicUsize,
}

impl RecordingCallbacks {
    pub fn commands(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.commands).clone()
    }

    pub fn configs(&self) -> Vec<Vec<u8>> {
        lock(&self.configs).clone()
    }

    /// Every state transition observed, in order
    pub fn states(&self) -> Vec<ConnectionState> {
        lock(&self.states).clone()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }
}

impl CloudCallbacks for RecordingCallbacks {
    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_command(&self, topic: &str, payload: &[u8]) {
        lock(&self.commands).push((topic.to_string(), payload.to_vec()));
    }

    fn on_config_update(&self, payload: &[u8]) {
        lock(&self.configs).push(payload.to_vec());
    }

    fn on_state_change(&self, state: ConnectionState) {
        lock(&self.states).push(state);
    }
}

/// Session factory handing out clones of one mock client and identity
#[derive(Clone)]
pub struct MockFactory {
    pub client: MockProtocolClient,
    pub identity: MockIdentity,
    sessions: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new(device_id: &str) -> Self {
        Self {
            client: MockProtocolClient::new(),
            identity: MockIdentity::new(device_id),
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of client/identity pairs built so far
    pub fn sessions_created(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MockFactory {
    fn create_identity(
        &self,
        _device: &DeviceSection,
    ) -> Result<Box<dyn DeviceIdentity>, IdentityError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.identity.clone()))
    }

    fn create_client(&self, _settings: &ClientSettings) -> Box<dyn ProtocolClient> {
        Box::new(self.client.clone())
    }
}
