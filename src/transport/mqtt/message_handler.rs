//! Inbound message routing and the on-connected sequence
//!
//! The router only knows the device's topic strings and the injected
//! [`CloudCallbacks`]; transport resources are borrowed per call.

use super::connection::ConnectionState;
use crate::clock::Clock;
use crate::identity::DeviceIdentity;
use crate::transport::{ProtocolClient, QoS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Application hooks invoked by the cloud link
///
/// All methods default to no-ops so implementors override only what they use.
/// Hooks run on the task driving the link and should return quickly.
pub trait CloudCallbacks: Send + Sync {
    /// Session established, subscriptions issued
    fn on_connected(&self) {}

    /// Message on the commands topic or one of its sub-folders
    fn on_command(&self, _topic: &str, _payload: &[u8]) {}

    /// Message on the configuration topic
    fn on_config_update(&self, _payload: &[u8]) {}

    fn on_state_change(&self, _state: ConnectionState) {}
}

/// Callbacks that ignore everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl CloudCallbacks for NoopCallbacks {}

/// Initial state payload published after each connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceAnnouncement {
    pub timestamp: String,
    pub connected: bool,
}

impl PresenceAnnouncement {
    pub fn connected_at(now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            connected: true,
        }
    }
}

/// Routing decision for an inbound topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRoute {
    Command,
    Config,
    Unmatched,
}

/// Topic-prefix dispatcher for inbound messages
pub struct MessageRouter {
    commands_topic: String,
    config_topic: String,
    state_topic: String,
    callbacks: Arc<dyn CloudCallbacks>,
}

impl MessageRouter {
    pub fn new(identity: &dyn DeviceIdentity, callbacks: Arc<dyn CloudCallbacks>) -> Self {
        Self {
            commands_topic: identity.commands_topic(),
            config_topic: identity.config_topic(),
            state_topic: identity.state_topic(),
            callbacks,
        }
    }

    pub fn callbacks(&self) -> &Arc<dyn CloudCallbacks> {
        &self.callbacks
    }

    /// Subscriptions installed on every connect (pure function)
    ///
    /// Configuration is delivered at least once; commands at most once since
    /// the cloud re-sends them on demand.
    pub fn subscription_plan(&self) -> [(String, QoS); 2] {
        [
            (self.config_topic.clone(), QoS::AtLeastOnce),
            (self.commands_topic.clone(), QoS::AtMostOnce),
        ]
    }

    /// Classify a topic; commands are checked first (pure function)
    pub fn route(&self, topic: &str) -> TopicRoute {
        if topic_matches(&self.commands_topic, topic) {
            TopicRoute::Command
        } else if topic_matches(&self.config_topic, topic) {
            TopicRoute::Config
        } else {
            TopicRoute::Unmatched
        }
    }

    /// Deliver an inbound message to the matching callback
    pub fn dispatch(&self, topic: &str, payload: &[u8]) {
        match self.route(topic) {
            TopicRoute::Command => {
                debug!(topic, bytes = payload.len(), "Command received");
                self.callbacks.on_command(topic, payload);
            }
            TopicRoute::Config => {
                debug!(topic, bytes = payload.len(), "Configuration update received");
                self.callbacks.on_config_update(payload);
            }
            TopicRoute::Unmatched => {
                warn!(
                    target: "iot_cloud_link::router",
                    topic,
                    payload = %String::from_utf8_lossy(payload),
                    "Message on unexpected topic"
                );
            }
        }
    }

    /// Subscribe to both device topics and announce presence
    ///
    /// The announcement is skipped (and logged) while the clock is unsynchronised.
    pub async fn on_connected(&self, client: &mut dyn ProtocolClient, clock: &dyn Clock) {
        for (topic, qos) in self.subscription_plan() {
            if client.subscribe(&topic, qos).await {
                info!(topic = %topic, ?qos, "Subscribed");
            } else {
                warn!(topic = %topic, error = ?client.last_error(), "Subscription failed");
            }
        }

        match clock.synced_now() {
            Some(now) => self.announce(client, now).await,
            None => warn!("Failed to obtain time, skipping state announcement"),
        }

        self.callbacks.on_connected();
    }

    async fn announce(&self, client: &mut dyn ProtocolClient, now: DateTime<Utc>) {
        let payload = match serde_json::to_vec(&PresenceAnnouncement::connected_at(now)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode state announcement");
                return;
            }
        };

        if !client.publish(&self.state_topic, &payload).await {
            warn!(topic = %self.state_topic, "State announcement not published");
        }
    }
}

/// Broker-visible base of a subscription: the filter without a trailing `/#`
fn topic_base(subscription: &str) -> &str {
    subscription.strip_suffix("/#").unwrap_or(subscription)
}

/// Topic equals the subscription base or extends it with further levels
fn topic_matches(subscription: &str, topic: &str) -> bool {
    let base = topic_base(subscription);
    topic == base
        || topic
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}
