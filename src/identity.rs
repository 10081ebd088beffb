//! Device identity and signed token generation
//!
//! [`DeviceIdentity`] is the seam between the connection core and whatever
//! knows how to name the device and sign its credentials. [`CloudIotDevice`]
//! is the production implementation: ES256 tokens over P-256 keys and the
//! cloud bridge's topic layout.

use crate::config::DeviceSection;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use p256::ecdsa::{signature::Signer as _, Signature, SigningKey};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Identity and signing failures
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("No private key loaded")]
    NoKey,
    #[error("Token encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Identity collaborator: naming, topics and token signing for one device
pub trait DeviceIdentity: Send {
    /// Load the signing secret used by subsequent [`DeviceIdentity::create_jwt`] calls
    fn set_private_key(&mut self, key: &str) -> Result<(), IdentityError>;

    fn create_jwt(&self, issued_at: DateTime<Utc>, ttl: Duration)
        -> Result<String, IdentityError>;

    fn client_id(&self) -> String;

    fn events_topic(&self) -> String;

    fn state_topic(&self) -> String;

    fn config_topic(&self) -> String;

    fn commands_topic(&self) -> String;
}

const JWT_HEADER: &str = r#"{"alg":"ES256","typ":"JWT"}"#;

#[derive(Serialize)]
struct Claims<'a> {
    iat: i64,
    exp: i64,
    aud: &'a str,
}

/// Cloud IoT device identity with ES256 token signing
pub struct CloudIotDevice {
    device: DeviceSection,
    signing_key: Option<SigningKey>,
}

impl CloudIotDevice {
    pub fn new(device: DeviceSection) -> Self {
        Self {
            device,
            signing_key: None,
        }
    }

    pub fn device(&self) -> &DeviceSection {
        &self.device
    }
}

impl DeviceIdentity for CloudIotDevice {
    fn set_private_key(&mut self, key: &str) -> Result<(), IdentityError> {
        self.signing_key = Some(parse_private_key(key)?);
        Ok(())
    }

    fn create_jwt(
        &self,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<String, IdentityError> {
        let key = self.signing_key.as_ref().ok_or(IdentityError::NoKey)?;

        let iat = issued_at.timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            iat,
            exp: iat.saturating_add(ttl_secs),
            aud: &self.device.project_id,
        };

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let signature: Signature = key.sign(signing_input.as_bytes());

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.device.project_id,
            self.device.location,
            self.device.registry_id,
            self.device.device_id
        )
    }

    fn events_topic(&self) -> String {
        format!("/devices/{}/events", self.device.device_id)
    }

    fn state_topic(&self) -> String {
        format!("/devices/{}/state", self.device.device_id)
    }

    fn config_topic(&self) -> String {
        format!("/devices/{}/config", self.device.device_id)
    }

    fn commands_topic(&self) -> String {
        format!("/devices/{}/commands/#", self.device.device_id)
    }
}

/// Parse a P-256 private scalar from hex
///
/// Accepts the colon-separated `priv:` dump printed by `openssl ec -text`
/// (a leading `00` byte on a 33-byte dump is dropped) or plain hex.
pub fn parse_private_key(key: &str) -> Result<SigningKey, IdentityError> {
    let cleaned: String = key
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if cleaned.is_empty() {
        return Err(IdentityError::InvalidKey("empty key".to_string()));
    }

    let mut bytes =
        hex::decode(&cleaned).map_err(|e| IdentityError::InvalidKey(format!("not hex: {e}")))?;
    if bytes.len() == 33 && bytes[0] == 0 {
        bytes.remove(0);
    }
    if bytes.len() != 32 {
        return Err(IdentityError::InvalidKey(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }

    let secret = p256::SecretKey::from_slice(&bytes)
        .map_err(|_| IdentityError::InvalidKey("scalar out of range".to_string()))?;
    Ok(SigningKey::from(secret))
}
