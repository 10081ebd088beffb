//! IoT Cloud Link
//!
//! Keeps a token-authenticated MQTT session between a device and a cloud IoT
//! bridge alive without supervision.
//!
//! # Overview
//!
//! - [`credentials`] signs short-lived ES256 tokens and rotates through a key
//!   ring when the broker rejects a credential
//! - [`handler::reconnector`] probes connection health and retries with an
//!   exponential backoff that wraps back to its floor
//! - [`transport::mqtt::message_handler`] routes inbound commands and
//!   configuration to application callbacks
//! - [`handler`] drives everything from a background task or from the
//!   application's own loop
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use iot_cloud_link::{CloudHandler, CloudLinkConfig, DeviceSection};
//!
//! # async fn run() -> iot_cloud_link::CloudResult<()> {
//! let device = DeviceSection {
//!     project_id: "my-project".to_string(),
//!     location: "europe-west1".to_string(),
//!     registry_id: "sensors".to_string(),
//!     device_id: "sensor-7".to_string(),
//! };
//! let config = CloudLinkConfig::new(device, vec!["<hex private key>".to_string()]);
//!
//! let mut handler = CloudHandler::new(config);
//! handler.setup().await?;
//! handler.publish_telemetry(br#"{"temp":21.5}"#).await;
//! handler.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handler;
pub mod identity;
pub mod observability;
pub mod testing;
pub mod transport;

pub use clock::{Clock, SystemClock};
pub use config::*;
pub use credentials::{CredentialRotator, Token};
pub use error::{CloudError, CloudResult};
pub use handler::{CloudHandler, ConnectionStatus, DriveMode, SessionFactory};
pub use identity::{CloudIotDevice, DeviceIdentity};
pub use transport::mqtt::{CloudCallbacks, ConnectionState, RumqttcClient};
pub use transport::{Link, LinkFlag, ProtocolClient};
