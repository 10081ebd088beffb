//! Backoff-driven reconnector
//!
//! [`Reconnector`] exclusively owns the protocol client, the device identity,
//! the credential rotator and the connection state. One [`Reconnector::tick`]
//! is one iteration of the driving loop: service the protocol loop, probe
//! health, and retry the connection when the backoff policy allows.

use crate::clock::Clock;
use crate::credentials::CredentialRotator;
use crate::identity::DeviceIdentity;
use crate::transport::mqtt::connection::{ConnectionState, Endpoint};
use crate::transport::mqtt::health_monitor::{Backoff, BackoffPolicy, HealthProbe};
use crate::transport::mqtt::message_handler::{CloudCallbacks, MessageRouter};
use crate::transport::{Link, MessageSink, MqttError, ProtocolClient, ReturnCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// The broker ignores the username; the token travels as the password
pub const CONNECT_USERNAME: &str = "unused";

/// Point-in-time view of the connection state machine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub enabled: bool,
    pub state: ConnectionState,
    pub interval_ms: u64,
    pub last_attempt_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_return_code: ReturnCode,
    /// Key slot that signed the cached token
    pub key_index: Option<usize>,
}

pub struct Reconnector {
    client: Box<dyn ProtocolClient>,
    identity: Box<dyn DeviceIdentity>,
    rotator: CredentialRotator,
    router: Arc<MessageRouter>,
    backoff: Backoff,
    probe: HealthProbe,
    endpoint: Endpoint,
    clean_session: bool,
    link: Arc<dyn Link>,
    clock: Arc<dyn Clock>,
    state: ConnectionState,
    last_error: Option<MqttError>,
    last_return_code: ReturnCode,
}

impl Reconnector {
    /// Wire a session together and register the inbound message sink
    pub fn new(
        mut client: Box<dyn ProtocolClient>,
        identity: Box<dyn DeviceIdentity>,
        rotator: CredentialRotator,
        endpoint: Endpoint,
        callbacks: Arc<dyn CloudCallbacks>,
        link: Arc<dyn Link>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let router = Arc::new(MessageRouter::new(identity.as_ref(), callbacks));

        let sink_router = Arc::clone(&router);
        let sink: MessageSink = Arc::new(move |topic: &str, payload: &[u8]| {
            sink_router.dispatch(topic, payload);
        });
        client.on_message(sink);

        Self {
            client,
            identity,
            rotator,
            router,
            backoff: Backoff::new(BackoffPolicy::default()),
            probe: HealthProbe::default(),
            endpoint,
            clean_session: true,
            link,
            clock,
            state: ConnectionState::Disconnected,
            last_error: None,
            last_return_code: ReturnCode::Unknown,
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Backoff::new(policy);
        self
    }

    pub fn with_probe(mut self, probe: HealthProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> &dyn DeviceIdentity {
        self.identity.as_ref()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn rotator(&self) -> &CredentialRotator {
        &self.rotator
    }

    /// One driving-loop iteration
    pub async fn tick(&mut self) {
        self.client.poll().await;

        if self.is_healthy().await {
            self.backoff.on_healthy();
            self.set_state(ConnectionState::Connected);
            return;
        }

        if self.state == ConnectionState::Connected {
            warn!(error = ?self.client.last_error(), "Cloud connection lost");
            self.set_state(ConnectionState::Disconnected);
        }

        let now = self.clock.millis();
        if self.backoff.on_unhealthy(now) {
            self.backoff.record_attempt(now);
            self.reconnect().await;
        }
    }

    /// Probe the protocol client's connected status
    ///
    /// Status can lag right after a send, so the probe is repeated before the
    /// connection is declared unhealthy. A down link short-circuits to false.
    pub async fn is_healthy(&mut self) -> bool {
        if !self.link.is_up() {
            return false;
        }

        for attempt in 0..self.probe.attempts {
            if self.client.connected() {
                return true;
            }
            if attempt + 1 < self.probe.attempts && !self.probe.delay.is_zero() {
                tokio::time::sleep(self.probe.delay).await;
            }
        }
        false
    }

    /// Run one connection attempt; returns whether the session is up afterwards
    pub async fn reconnect(&mut self) -> bool {
        if !self.link.is_up() {
            debug!("Network link down, skipping reconnect");
            return false;
        }
        if self.client.connected() {
            self.set_state(ConnectionState::Connected);
            return true;
        }

        let span = crate::connection_span!(endpoint = %self.endpoint);
        self.attempt().instrument(span).await
    }

    async fn attempt(&mut self) -> bool {
        self.set_state(ConnectionState::Connecting);
        self.client.begin(&self.endpoint);

        let Some(token) = self.rotator.token(self.identity.as_mut()) else {
            debug!("No device token yet, deferring connect");
            self.set_state(ConnectionState::Disconnected);
            return false;
        };

        let client_id = self.identity.client_id();
        info!(key_index = token.key_index(), "Connecting to cloud");

        if self
            .client
            .connect(&client_id, CONNECT_USERNAME, token.as_str(), self.clean_session)
            .await
        {
            self.last_error = None;
            self.last_return_code = self.client.return_code();
            self.set_state(ConnectionState::Connected);
            self.router
                .on_connected(self.client.as_mut(), self.clock.as_ref())
                .await;
            return true;
        }

        let error = self.client.last_error();
        let code = self.client.return_code();
        match &error {
            Some(e) => warn!(kind = ?e.kind(), error = %e, return_code = %code, "Cloud connect failed"),
            None => warn!(return_code = %code, "Cloud connect failed"),
        }

        if code.is_credential_rejection() {
            self.rotator.invalidate();
            info!(next_key = self.rotator.cursor(), "Credentials rejected, rotating signing key");
        }

        self.client.disconnect().await;
        self.last_error = error;
        self.last_return_code = code;
        self.set_state(ConnectionState::Disconnected);
        false
    }

    /// Best-effort single publish; no retry or queueing
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let sent = self.client.publish(topic, payload).await;
        if !sent {
            debug!(topic, error = ?self.client.last_error(), "Publish failed");
        }
        sent
    }

    /// Current token, minting one if needed; `None` until the clock is synchronised
    pub fn device_token(&mut self) -> Option<String> {
        self.rotator
            .token(self.identity.as_mut())
            .map(|token| token.as_str().to_string())
    }

    /// Replace the key ring without touching the live session
    pub fn set_keys(&mut self, keys: Vec<String>) {
        self.rotator.set_keys(keys);
    }

    pub fn status(&self, enabled: bool) -> ConnectionStatus {
        ConnectionStatus {
            enabled,
            state: self.state,
            interval_ms: self.backoff.interval_ms(),
            last_attempt_ms: self.backoff.last_attempt_ms(),
            last_error: self.last_error.as_ref().map(ToString::to_string),
            last_return_code: self.last_return_code,
            key_index: self.rotator.cached().map(|token| token.key_index()),
        }
    }

    /// Tear the session down: rotation cursor, identity, then client
    pub async fn shutdown(self) {
        let Self {
            mut rotator,
            identity,
            mut client,
            ..
        } = self;

        rotator.reset();
        drop(identity);
        client.disconnect().await;
        drop(client);
        debug!("Cloud session torn down");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Connection state changed");
        self.state = state;
        self.router.callbacks().on_state_change(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{ManualClock, MockIdentity, MockProtocolClient, RecordingCallbacks};
    use crate::transport::mqtt::connection::EndpointMode;
    use crate::transport::LinkFlag;
    use std::time::Duration;

    struct Fixture {
        client: MockProtocolClient,
        identity: MockIdentity,
        clock: ManualClock,
        link: LinkFlag,
        callbacks: Arc<RecordingCallbacks>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                client: MockProtocolClient::new(),
                identity: MockIdentity::new("dev-1"),
                clock: ManualClock::synced(),
                link: LinkFlag::new(true),
                callbacks: Arc::new(RecordingCallbacks::default()),
            }
        }

        fn reconnector(&self, keys: &[&str]) -> Reconnector {
            let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
            let rotator = CredentialRotator::new(
                keys.iter().map(|k| k.to_string()).collect(),
                Duration::from_secs(3600),
                Arc::clone(&clock),
            );
            Reconnector::new(
                Box::new(self.client.clone()),
                Box::new(self.identity.clone()),
                rotator,
                Endpoint::for_mode(EndpointMode::Lts),
                self.callbacks.clone(),
                Arc::new(self.link.clone()),
                clock,
            )
            .with_probe(HealthProbe {
                attempts: 2,
                delay: Duration::ZERO,
            })
        }
    }

    #[tokio::test]
    async fn test_successful_connect_sequence() {
        let fx = Fixture::new();
        let mut reconnector = fx.reconnector(&["A"]);

        assert_eq!(reconnector.state(), ConnectionState::Disconnected);
        assert!(reconnector.reconnect().await);

        assert_eq!(
            fx.callbacks.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(fx.client.subscriptions().len(), 2);
        assert_eq!(fx.client.published().len(), 1);
        assert_eq!(fx.callbacks.connected_count(), 1);

        let connects = fx.client.connects();
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].username, CONNECT_USERNAME);
        assert!(connects[0].password.starts_with("token-A-"));
        assert!(connects[0].clean_session);
        assert_eq!(connects[0].client_id, fx.identity.client_id());
    }

    #[tokio::test]
    async fn test_link_down_makes_no_transport_calls() {
        let fx = Fixture::new();
        fx.link.set_up(false);
        let mut reconnector = fx.reconnector(&["A"]);

        assert!(!reconnector.reconnect().await);
        assert_eq!(fx.client.io_call_count(), 0);
        assert!(fx.callbacks.states().is_empty());
    }

    #[tokio::test]
    async fn test_link_down_is_unhealthy_without_probing() {
        let fx = Fixture::new();
        fx.client.set_connected(true);
        fx.link.set_up(false);
        let mut reconnector = fx.reconnector(&["A"]);

        assert!(!reconnector.is_healthy().await);
    }

    #[tokio::test]
    async fn test_already_connected_skips_attempt() {
        let fx = Fixture::new();
        fx.client.set_connected(true);
        let mut reconnector = fx.reconnector(&["A"]);

        assert!(reconnector.reconnect().await);
        assert!(fx.client.connects().is_empty());
    }

    #[tokio::test]
    async fn test_unsynced_clock_aborts_silently() {
        let mut fx = Fixture::new();
        fx.clock = ManualClock::unsynced();
        let mut reconnector = fx.reconnector(&["A", "B"]);

        assert!(!reconnector.reconnect().await);
        assert!(fx.client.connects().is_empty());
        assert_eq!(reconnector.rotator().cursor(), 0);
        assert_eq!(reconnector.state(), ConnectionState::Disconnected);
        assert!(reconnector.status(true).last_error.is_none());
    }

    #[tokio::test]
    async fn test_credential_rejection_rotates_keys() {
        let fx = Fixture::new();
        for _ in 0..3 {
            fx.client.reject_next_connect(ReturnCode::BadCredentials);
        }
        let mut reconnector = fx.reconnector(&["A", "B", "C"]);

        for _ in 0..4 {
            reconnector.reconnect().await;
        }

        let keys: Vec<String> = fx
            .client
            .connect_passwords()
            .iter()
            .map(|p| p.split('-').nth(1).unwrap_or_default().to_string())
            .collect();
        assert_eq!(keys, vec!["A", "B", "C", "A"]);
        assert_eq!(reconnector.state(), ConnectionState::Connected);
        assert_eq!(fx.client.disconnect_count(), 3);
    }

    #[tokio::test]
    async fn test_other_rejections_keep_the_key() {
        let fx = Fixture::new();
        fx.client.reject_next_connect(ReturnCode::ServerUnavailable);
        fx.client
            .push_connect_outcome(Err(MqttError::ConnectFailed("refused".to_string())));
        let mut reconnector = fx.reconnector(&["A", "B"]);

        assert!(!reconnector.reconnect().await);
        let status = reconnector.status(true);
        assert_eq!(status.last_return_code, ReturnCode::ServerUnavailable);
        assert!(status.last_error.is_some());

        assert!(!reconnector.reconnect().await);
        assert!(reconnector.reconnect().await);

        let passwords = fx.client.connect_passwords();
        assert_eq!(passwords.len(), 3);
        assert!(passwords.iter().all(|p| p.starts_with("token-A-")));
    }

    #[tokio::test]
    async fn test_tick_resets_backoff_when_healthy() {
        let fx = Fixture::new();
        fx.link.set_up(false);
        let mut reconnector = fx.reconnector(&["A"]);

        reconnector.tick().await;
        reconnector.tick().await;
        assert_eq!(reconnector.backoff().interval_ms(), 4000);

        fx.client.set_connected(true);
        fx.link.set_up(true);
        reconnector.tick().await;
        assert_eq!(reconnector.backoff().interval_ms(), 1000);
    }

    #[tokio::test]
    async fn test_tick_respects_backoff_window() {
        let fx = Fixture::new();
        fx.client.push_connect_outcome(Err(MqttError::Timeout));
        fx.client.push_connect_outcome(Err(MqttError::Timeout));
        let mut reconnector = fx.reconnector(&["A"]);

        reconnector.tick().await;
        assert_eq!(fx.client.connects().len(), 1);

        // the interval doubles on every unhealthy tick: 4000 ms here
        fx.clock.advance_millis(1000);
        reconnector.tick().await;
        assert_eq!(fx.client.connects().len(), 1);

        // 8000 ms on the third tick
        fx.clock.advance_millis(7500);
        reconnector.tick().await;
        assert_eq!(fx.client.connects().len(), 2);
        assert_eq!(reconnector.status(true).last_attempt_ms, Some(8500));
    }

    #[tokio::test]
    async fn test_lost_connection_reports_state_change() {
        let fx = Fixture::new();
        let mut reconnector = fx.reconnector(&["A"]);
        assert!(reconnector.reconnect().await);

        fx.client.set_connected(false);
        fx.client.push_connect_outcome(Err(MqttError::Timeout));
        reconnector.tick().await;

        assert_eq!(
            fx.callbacks.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_link_flap_with_live_session_restores_connected() {
        let fx = Fixture::new();
        let mut reconnector = fx.reconnector(&["A"]);
        assert!(reconnector.reconnect().await);

        fx.link.set_up(false);
        reconnector.tick().await;
        assert_eq!(reconnector.state(), ConnectionState::Disconnected);

        fx.link.set_up(true);
        for _ in 0..5 {
            fx.clock.advance_millis(200_000);
            reconnector.tick().await;
        }

        assert!(fx.client.connected());
        assert_eq!(reconnector.state(), ConnectionState::Connected);
        assert_eq!(reconnector.status(true).state, ConnectionState::Connected);
        assert_eq!(
            fx.callbacks.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(fx.client.connects().len(), 1);
        assert_eq!(reconnector.backoff().interval_ms(), 1000);
    }

    #[tokio::test]
    async fn test_already_connected_reconnect_reports_connected() {
        let fx = Fixture::new();
        let mut reconnector = fx.reconnector(&["A"]);
        fx.client.set_connected(true);

        assert!(reconnector.reconnect().await);
        assert_eq!(reconnector.state(), ConnectionState::Connected);
        assert_eq!(fx.callbacks.states(), vec![ConnectionState::Connected]);
    }

    #[tokio::test]
    async fn test_lagging_status_is_retried_before_unhealthy() {
        let fx = Fixture::new();
        let mut reconnector = fx.reconnector(&["A"]).with_probe(HealthProbe {
            attempts: 4,
            delay: Duration::from_millis(1),
        });
        assert!(reconnector.reconnect().await);

        // widen the interval so a reset is observable
        fx.link.set_up(false);
        reconnector.tick().await;
        reconnector.tick().await;
        assert_eq!(reconnector.backoff().interval_ms(), 4000);
        fx.link.set_up(true);

        fx.client.clear_history();
        fx.client.lag_status(3);
        let reads_before = fx.client.status_reads();

        assert!(reconnector.is_healthy().await);
        assert_eq!(fx.client.status_reads() - reads_before, 4);

        fx.client.lag_status(3);
        reconnector.tick().await;
        assert_eq!(reconnector.backoff().interval_ms(), 1000);
        assert_eq!(reconnector.state(), ConnectionState::Connected);
        assert!(fx.client.connects().is_empty());
        assert_eq!(fx.client.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_status_lagging_past_retry_budget_is_unhealthy() {
        let fx = Fixture::new();
        let mut reconnector = fx.reconnector(&["A"]);
        assert!(reconnector.reconnect().await);

        fx.client.lag_status(2);
        assert!(!reconnector.is_healthy().await);
        assert!(reconnector.is_healthy().await);
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_callbacks() {
        let fx = Fixture::new();
        let _reconnector = fx.reconnector(&["A"]);

        assert!(fx.client.inject("/devices/dev-1/commands/reboot", b"now"));
        assert!(fx.client.inject("/devices/dev-1/config", b"{}"));
        assert!(fx.client.inject("/devices/other/config", b"{}"));

        assert_eq!(
            fx.callbacks.commands(),
            vec![("/devices/dev-1/commands/reboot".to_string(), b"now".to_vec())]
        );
        assert_eq!(fx.callbacks.configs(), vec![b"{}".to_vec()]);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_client() {
        let fx = Fixture::new();
        let mut reconnector = fx.reconnector(&["A"]);
        assert!(reconnector.reconnect().await);

        reconnector.shutdown().await;

        assert_eq!(fx.client.disconnect_count(), 1);
        assert!(!fx.client.connected());
    }
}
