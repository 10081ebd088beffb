//! Transport layer for the cloud link
//!
//! This module defines the narrow seams the connection core drives: the
//! publish/subscribe protocol client and the network carrier. The MQTT
//! implementation lives in [`mqtt`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod mqtt;

pub use mqtt::connection::{Endpoint, MqttError, ReturnCode};
pub use rumqttc::QoS;

/// Callback invoked by the protocol client for every inbound publish
pub type MessageSink = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Publish/subscribe protocol client
///
/// This trait abstracts the wire-level client so the reconnector can be driven
/// against a real broker or a test double. Every operation reports failure
/// through its return value and [`ProtocolClient::last_error`]; none panic.
#[async_trait::async_trait]
pub trait ProtocolClient: Send {
    /// Select the broker for the next `connect`
    fn begin(&mut self, endpoint: &Endpoint);

    /// Open the socket and run the authentication handshake
    async fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
        clean_session: bool,
    ) -> bool;

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> bool;

    async fn disconnect(&mut self);

    /// Service inbound data and keepalive without blocking for long
    async fn poll(&mut self);

    /// Protocol-level connected status
    fn connected(&self) -> bool;

    fn last_error(&self) -> Option<MqttError>;

    fn return_code(&self) -> ReturnCode;

    /// Register the inbound message callback
    fn on_message(&mut self, sink: MessageSink);
}

/// Underlying network carrier (e.g. radio association)
pub trait Link: Send + Sync {
    fn is_up(&self) -> bool;
}

/// Link whose status is set by the application's network manager
#[derive(Debug, Clone)]
pub struct LinkFlag(Arc<AtomicBool>);

impl LinkFlag {
    pub fn new(up: bool) -> Self {
        Self(Arc::new(AtomicBool::new(up)))
    }

    pub fn set_up(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

impl Default for LinkFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Link for LinkFlag {
    fn is_up(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
