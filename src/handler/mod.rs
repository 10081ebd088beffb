//! Cloud handler: lifecycle, driving loop and publish operations
//!
//! [`CloudHandler`] assembles a [`Reconnector`] session from configuration on
//! `setup()`, drives it either from a background task or from the caller's
//! own loop via [`CloudHandler::step`], and tears it down on `cleanup()`.
//! The session sits behind an async mutex so publishes from any task are
//! serialised with the driving loop.

pub mod reconnector;

pub use reconnector::{ConnectionStatus, Reconnector, CONNECT_USERNAME};

use crate::clock::{Clock, SystemClock};
use crate::config::{CloudLinkConfig, DeviceSection};
use crate::credentials::CredentialRotator;
use crate::error::CloudResult;
use crate::identity::{CloudIotDevice, DeviceIdentity, IdentityError};
use crate::transport::mqtt::client::RumqttcClient;
use crate::transport::mqtt::connection::{ClientSettings, ConnectionState};
use crate::transport::mqtt::message_handler::{CloudCallbacks, NoopCallbacks};
use crate::transport::{Link, LinkFlag, ProtocolClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How the reconnector is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// A spawned task ticks the session, sleeping `tick` between iterations
    Background { tick: Duration },
    /// The application calls [`CloudHandler::step`] from its own loop
    Cooperative,
}

impl Default for DriveMode {
    fn default() -> Self {
        DriveMode::Background {
            tick: Duration::from_millis(50),
        }
    }
}

/// Builds the per-session collaborators on every `setup()`
pub trait SessionFactory: Send + Sync {
    fn create_identity(
        &self,
        device: &DeviceSection,
    ) -> Result<Box<dyn DeviceIdentity>, IdentityError>;

    fn create_client(&self, settings: &ClientSettings) -> Box<dyn ProtocolClient>;
}

/// Production factory: ES256 device identity over a `rumqttc` client
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttcFactory;

impl SessionFactory for RumqttcFactory {
    fn create_identity(
        &self,
        device: &DeviceSection,
    ) -> Result<Box<dyn DeviceIdentity>, IdentityError> {
        Ok(Box::new(CloudIotDevice::new(device.clone())))
    }

    fn create_client(&self, settings: &ClientSettings) -> Box<dyn ProtocolClient> {
        Box::new(RumqttcClient::new(settings.clone()))
    }
}

type SharedSession = Arc<Mutex<Option<Reconnector>>>;

pub struct CloudHandler {
    config: CloudLinkConfig,
    mode: DriveMode,
    factory: Arc<dyn SessionFactory>,
    clock: Arc<dyn Clock>,
    link: Arc<dyn Link>,
    callbacks: Arc<dyn CloudCallbacks>,
    session: SharedSession,
    task: Option<JoinHandle<()>>,
    /// Connectivity switch captured by the last `setup()`
    enabled: bool,
}

impl CloudHandler {
    /// Handler with the production factory, system clock and an always-up link
    pub fn new(config: CloudLinkConfig) -> Self {
        let mode = config.drive_mode();
        Self {
            config,
            mode,
            factory: Arc::new(RumqttcFactory),
            clock: Arc::new(SystemClock::new()),
            link: Arc::new(LinkFlag::default()),
            callbacks: Arc::new(NoopCallbacks),
            session: Arc::new(Mutex::new(None)),
            task: None,
            enabled: false,
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn CloudCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_link(mut self, link: Arc<dyn Link>) -> Self {
        self.link = link;
        self
    }

    pub fn with_mode(mut self, mode: DriveMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(&self) -> &CloudLinkConfig {
        &self.config
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    /// Whether the last `setup()` ran with connectivity enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a background driving task is alive
    pub fn has_background_task(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// (Re)build the session from the current configuration
    ///
    /// Any previous session is torn down first, so calling this again after
    /// `cleanup()` or a configuration change fully reinitialises state.
    pub async fn setup(&mut self) -> CloudResult<()> {
        self.cleanup().await;

        self.enabled = self.config.connection.enabled;
        if !self.enabled {
            info!("Cloud connectivity disabled, no session created");
            return Ok(());
        }

        let endpoint = self.config.endpoint()?;
        let settings = self.config.client_settings()?;
        let identity = self.factory.create_identity(&self.config.device)?;
        info!(
            device_id = %self.config.device.device_id,
            endpoint = %endpoint,
            "Cloud device created"
        );

        let client = self.factory.create_client(&settings);
        let rotator = CredentialRotator::new(
            self.config.signing_keys(),
            self.config.token_ttl(),
            Arc::clone(&self.clock),
        );

        let reconnector = Reconnector::new(
            client,
            identity,
            rotator,
            endpoint,
            Arc::clone(&self.callbacks),
            Arc::clone(&self.link),
            Arc::clone(&self.clock),
        )
        .with_backoff(self.config.backoff_policy())
        .with_probe(self.config.health_probe())
        .with_clean_session(settings.clean_session);

        *self.session.lock().await = Some(reconnector);

        if let DriveMode::Background { tick } = self.mode {
            self.task = Some(Self::spawn_driver(Arc::clone(&self.session), tick));
        }

        Ok(())
    }

    fn spawn_driver(session: SharedSession, tick: Duration) -> JoinHandle<()> {
        debug!(tick_ms = tick.as_millis() as u64, "Starting cloud driving task");
        tokio::spawn(async move {
            loop {
                {
                    let mut guard = session.lock().await;
                    match guard.as_mut() {
                        Some(reconnector) => reconnector.tick().await,
                        None => break,
                    }
                }
                tokio::time::sleep(tick).await;
            }
            debug!("Cloud driving task finished");
        })
    }

    /// Tear down the session: rotation cursor, identity, client, then the task
    pub async fn cleanup(&mut self) {
        let previous = self.session.lock().await.take();
        if let Some(reconnector) = previous {
            reconnector.shutdown().await;
            info!("Cloud session cleaned up");
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Update identity and keys without dropping a live connection
    ///
    /// The key ring of a running session is replaced immediately (cursor back
    /// to slot 0); identity changes take effect on the next `setup()`.
    pub async fn set_configuration(
        &mut self,
        device: DeviceSection,
        private_keys: Vec<String>,
    ) -> CloudResult<()> {
        let mut next = self.config.clone();
        next.device = device;
        next.credentials.private_keys = private_keys;
        next.credentials.private_keys_env.clear();
        next.validate()?;

        let keys = next.signing_keys();
        self.config = next;

        if let Some(reconnector) = self.session.lock().await.as_mut() {
            reconnector.set_keys(keys);
        }
        debug!("Cloud configuration updated");
        Ok(())
    }

    /// Toggle connectivity; takes effect on the next `setup()`
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.connection.enabled = enabled;
    }

    /// One driving-loop iteration for [`DriveMode::Cooperative`]
    ///
    /// Does nothing in background mode, where the spawned task owns ticking.
    pub async fn step(&self) {
        if self.mode != DriveMode::Cooperative {
            return;
        }
        if let Some(reconnector) = self.session.lock().await.as_mut() {
            reconnector.tick().await;
        }
    }

    /// Publish to the device's events topic
    pub async fn publish_telemetry(&self, data: &[u8]) -> bool {
        self.publish_to(|identity| identity.events_topic(), None, data)
            .await
    }

    /// Publish to a sub-folder of the device's events topic
    pub async fn publish_telemetry_to(&self, subtopic: &str, data: &[u8]) -> bool {
        self.publish_to(|identity| identity.events_topic(), Some(subtopic), data)
            .await
    }

    /// Publish to the device's state topic
    pub async fn publish_state(&self, data: &[u8]) -> bool {
        self.publish_to(|identity| identity.state_topic(), None, data)
            .await
    }

    /// Publish to a sub-folder of the device's state topic
    pub async fn publish_state_to(&self, subtopic: &str, data: &[u8]) -> bool {
        self.publish_to(|identity| identity.state_topic(), Some(subtopic), data)
            .await
    }

    async fn publish_to(
        &self,
        base: impl Fn(&dyn DeviceIdentity) -> String + Send,
        subtopic: Option<&str>,
        data: &[u8],
    ) -> bool {
        if !self.enabled {
            return false;
        }

        let mut guard = self.session.lock().await;
        let Some(reconnector) = guard.as_mut() else {
            return false;
        };

        let topic = join_topic(&base(reconnector.identity()), subtopic);
        let span = crate::publish_span!(topic = %topic, bytes = data.len());
        let sent = reconnector.publish(&topic, data).instrument(span).await;
        if !sent {
            warn!(topic = %topic, "Publish failed");
        }
        sent
    }

    /// Current device token, minting one if needed
    ///
    /// `None` while disabled, before `setup()`, or until the clock is synchronised.
    pub async fn device_token(&self) -> Option<String> {
        self.session.lock().await.as_mut()?.device_token()
    }

    pub async fn state(&self) -> ConnectionState {
        self.session
            .lock()
            .await
            .as_ref()
            .map(Reconnector::state)
            .unwrap_or_default()
    }

    /// Snapshot of the connection state machine
    pub async fn status(&self) -> ConnectionStatus {
        match self.session.lock().await.as_ref() {
            Some(reconnector) => reconnector.status(self.enabled),
            None => {
                let policy = self.config.backoff_policy();
                ConnectionStatus {
                    enabled: self.enabled,
                    state: ConnectionState::Disconnected,
                    interval_ms: policy.floor_ms,
                    last_attempt_ms: None,
                    last_error: None,
                    last_return_code: Default::default(),
                    key_index: None,
                }
            }
        }
    }
}

/// Best-effort teardown; await `cleanup()` for an orderly disconnect
///
/// The session is handed to the runtime for shutdown when one is available
/// and the session is not mid-tick. Otherwise it is dropped in place.
impl Drop for CloudHandler {
    fn drop(&mut self) {
        let session = self
            .session
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take());

        if let Some(reconnector) = session {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    debug!("Handler dropped with a live session, disconnecting");
                    runtime.spawn(reconnector.shutdown());
                }
                Err(_) => warn!("Handler dropped outside a runtime, session discarded"),
            }
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Append a sub-folder to a base topic, adding the separator when missing
fn join_topic(base: &str, subtopic: Option<&str>) -> String {
    match subtopic {
        Some(sub) if !sub.is_empty() => {
            if sub.starts_with('/') {
                format!("{base}{sub}")
            } else {
                format!("{base}/{sub}")
            }
        }
        _ => base.to_string(),
    }
}
