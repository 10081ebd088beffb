//! `rumqttc`-backed protocol client
//!
//! The event loop is driven only from [`ProtocolClient::poll`] and the other
//! trait calls, never from a background task, so every network step happens
//! on the task that owns the connection core. A transport failure drops the
//! session instead of letting `rumqttc` reconnect on its own; reconnection
//! timing belongs to the caller.

use super::connection::{configure_mqtt_options, ClientSettings, Endpoint, MqttError, ReturnCode};
use crate::transport::{MessageSink, ProtocolClient, QoS};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Packet};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on events handled by a single `poll`
const MAX_EVENTS_PER_POLL: usize = 32;

/// Live session: request handle plus the event loop that performs the I/O
struct Session {
    client: AsyncClient,
    event_loop: EventLoop,
}

pub struct RumqttcClient {
    settings: ClientSettings,
    endpoint: Option<Endpoint>,
    session: Option<Session>,
    connected: bool,
    last_error: Option<MqttError>,
    return_code: ReturnCode,
    sink: Option<MessageSink>,
}

impl RumqttcClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            endpoint: None,
            session: None,
            connected: false,
            last_error: None,
            return_code: ReturnCode::Unknown,
            sink: None,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Wait for the broker's CONNACK, bounded by `timeout`
    async fn wait_for_connack(
        event_loop: &mut EventLoop,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match ack.code {
                            ConnectReturnCode::Success => Ok(()),
                            code => Err(MqttError::ConnectionDenied(ReturnCode::from(code))),
                        };
                    }
                    Ok(event) => trace!(?event, "Event before CONNACK"),
                    Err(e) => return Err(MqttError::from(e)),
                }
            }
        })
        .await;

        result.unwrap_or(Err(MqttError::Timeout))
    }

    /// Record a failure that ends the session
    fn lose_session(&mut self, error: MqttError) {
        if self.connected {
            error!(kind = ?error.kind(), error = %error, "MQTT session lost");
        } else {
            debug!(kind = ?error.kind(), error = %error, "MQTT session closed");
        }
        self.session = None;
        self.connected = false;
        self.last_error = Some(error);
    }

    /// Run the event loop until it idles for one poll window
    async fn drive(&mut self) {
        let window = self.settings.poll_window;

        for _ in 0..MAX_EVENTS_PER_POLL {
            let Some(session) = self.session.as_mut() else {
                return;
            };

            match tokio::time::timeout(window, session.event_loop.poll()).await {
                Err(_) => return,
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    trace!(topic = %publish.topic, bytes = publish.payload.len(), "Inbound publish");
                    if let Some(sink) = &self.sink {
                        sink(publish.topic.as_str(), &publish.payload[..]);
                    }
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    self.lose_session(MqttError::ReadFailed(
                        "broker closed the session".to_string(),
                    ));
                    return;
                }
                Ok(Ok(event)) => trace!(?event, "MQTT event"),
                Ok(Err(e)) => {
                    self.lose_session(MqttError::from(e));
                    return;
                }
            }
        }
    }

    /// Guard shared by the request operations
    fn live_client(&mut self) -> Option<AsyncClient> {
        match (&self.session, self.connected) {
            (Some(session), true) => Some(session.client.clone()),
            _ => {
                if self.endpoint.is_none() {
                    self.last_error = Some(MqttError::NotStarted);
                }
                None
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for RumqttcClient {
    fn begin(&mut self, endpoint: &Endpoint) {
        debug!(endpoint = %endpoint, tls = endpoint.tls, "Broker selected");
        self.endpoint = Some(endpoint.clone());
    }

    async fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
        clean_session: bool,
    ) -> bool {
        let Some(endpoint) = self.endpoint.clone() else {
            self.last_error = Some(MqttError::NotStarted);
            return false;
        };

        self.session = None;
        self.connected = false;

        let mut settings = self.settings.clone();
        settings.clean_session = clean_session;
        let options = configure_mqtt_options(client_id, username, password, &endpoint, &settings);
        let (client, mut event_loop) = AsyncClient::new(options, settings.request_capacity);

        match Self::wait_for_connack(&mut event_loop, settings.connect_timeout).await {
            Ok(()) => {
                info!(endpoint = %endpoint, "MQTT session established");
                self.session = Some(Session { client, event_loop });
                self.connected = true;
                self.last_error = None;
                self.return_code = ReturnCode::Accepted;
                true
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "MQTT connect failed");
                self.return_code = e.return_code();
                self.last_error = Some(e);
                false
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let Some(client) = self.live_client() else {
            return false;
        };

        if let Err(e) = client.try_publish(topic, QoS::AtMostOnce, false, payload.to_vec()) {
            self.last_error = Some(MqttError::WriteFailed(e.to_string()));
            return false;
        }

        self.drive().await;
        self.connected
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> bool {
        let Some(client) = self.live_client() else {
            return false;
        };

        if let Err(e) = client.try_subscribe(topic, qos) {
            self.last_error = Some(MqttError::SubscriptionFailed(e.to_string()));
            return false;
        }

        self.drive().await;
        self.connected
    }

    async fn disconnect(&mut self) {
        let Some(session) = self.session.as_mut() else {
            self.connected = false;
            return;
        };

        if self.connected && session.client.try_disconnect().is_ok() {
            let window = self.settings.poll_window;
            let _ = tokio::time::timeout(window, session.event_loop.poll()).await;
        }

        debug!("MQTT session dropped");
        self.session = None;
        self.connected = false;
    }

    async fn poll(&mut self) {
        if self.session.is_some() {
            self.drive().await;
        }
    }

    fn connected(&self) -> bool {
        self.connected && self.session.is_some()
    }

    fn last_error(&self) -> Option<MqttError> {
        self.last_error.clone()
    }

    fn return_code(&self) -> ReturnCode {
        self.return_code
    }

    fn on_message(&mut self, sink: MessageSink) {
        self.sink = Some(sink);
    }
}
