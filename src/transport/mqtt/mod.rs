//! MQTT implementation of the cloud link transport
//!
//! # Architecture
//!
//! The module is split into four focused sub-modules:
//!
//! - [`connection`] - Connection states, error taxonomy, endpoints and options
//! - [`health_monitor`] - Pure backoff and health-probe logic
//! - [`message_handler`] - Pure topic routing and the on-connected sequence
//! - [`client`] - Impure I/O on top of `rumqttc`
//!
//! # Example
//!
//! ```rust,no_run
//! use iot_cloud_link::transport::mqtt::{ClientSettings, Endpoint, EndpointMode, RumqttcClient};
//! use iot_cloud_link::transport::{ProtocolClient, QoS};
//!
//! # tokio_test::block_on(async {
//! let mut client = RumqttcClient::new(ClientSettings::default());
//! client.begin(&Endpoint::for_mode(EndpointMode::Lts));
//!
//! let client_id = "projects/p/locations/l/registries/r/devices/d";
//! if client.connect(client_id, "unused", "<signed token>", true).await {
//!     client.subscribe("/devices/d/config", QoS::AtLeastOnce).await;
//!     client.publish("/devices/d/events", b"{}").await;
//! }
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::RumqttcClient;
pub use connection::{
    ClientSettings, ConnectionState, Endpoint, EndpointMode, ErrorKind, MqttError, ReturnCode,
};
pub use health_monitor::{Backoff, BackoffPolicy, HealthProbe};
pub use message_handler::{CloudCallbacks, MessageRouter, NoopCallbacks, PresenceAnnouncement};
