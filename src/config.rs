//! Device configuration for the cloud link
//!
//! Configuration is a sectioned TOML document. Signing secrets may be given
//! inline or through environment variables; both are folded into one ordered
//! key ring at load time.

use crate::handler::DriveMode;
use crate::transport::mqtt::connection::{ClientSettings, Endpoint, EndpointMode};
use crate::transport::mqtt::health_monitor::{
    BackoffPolicy, HealthProbe, MAX_BACKOFF_MS, MIN_BACKOFF_MS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Hard protocol ceiling on token lifetime
pub const MAX_TOKEN_TTL_SECS: u64 = 24 * 3600;
/// Token lifetime used when none is configured
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Main cloud link configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudLinkConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Device identity tuple
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSection {
    pub project_id: String,
    pub location: String,
    pub registry_id: String,
    pub device_id: String,
}

/// Signing keys and token lifetime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    /// Ordered key ring; the first entry is tried first
    #[serde(default)]
    pub private_keys: Vec<String>,
    /// Environment variables holding further keys, appended in order
    #[serde(default)]
    pub private_keys_env: Vec<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            private_keys: Vec::new(),
            private_keys_env: Vec::new(),
            token_ttl_secs: default_token_ttl(),
        }
    }
}

/// Broker connection options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Cloud connectivity switch; takes effect on the next setup
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: EndpointMode,
    /// Private broker override, e.g. `mqtts://broker.local:8883`
    pub broker_url: Option<String>,
    /// PEM trust root; the embedded default is used when absent
    pub root_cert_path: Option<PathBuf>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: EndpointMode::default(),
            broker_url: None,
            root_cert_path: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
            clean_session: true,
        }
    }
}

/// Backoff and health probe tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_backoff_floor")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_ms: u64,
    #[serde(default = "default_probe_attempts")]
    pub health_probe_attempts: u32,
    #[serde(default = "default_probe_delay")]
    pub health_probe_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff_floor_ms: default_backoff_floor(),
            backoff_ceiling_ms: default_backoff_ceiling(),
            health_probe_attempts: default_probe_attempts(),
            health_probe_delay_ms: default_probe_delay(),
        }
    }
}

/// Scheduling model selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Dedicated task drives the link
    #[default]
    Background,
    /// The application calls `step()` from its own loop
    Cooperative,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSection {
    #[serde(default)]
    pub mode: RuntimeMode,
    /// Pause between background ticks
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            tick_ms: default_tick(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_token_ttl() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_keep_alive() -> u64 {
    180
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_backoff_floor() -> u64 {
    MIN_BACKOFF_MS
}

fn default_backoff_ceiling() -> u64 {
    MAX_BACKOFF_MS
}

fn default_probe_attempts() -> u32 {
    10
}

fn default_probe_delay() -> u64 {
    5
}

fn default_tick() -> u64 {
    50
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CloudLinkConfig {
    /// Programmatic configuration with defaults for everything but identity and keys
    pub fn new(device: DeviceSection, private_keys: Vec<String>) -> Self {
        Self {
            device,
            credentials: CredentialsSection {
                private_keys,
                ..Default::default()
            },
            connection: ConnectionSection::default(),
            reconnect: ReconnectSection::default(),
            runtime: RuntimeSection::default(),
        }
    }

    /// Load configuration from TOML file with environment variable resolution
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse, resolve and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: CloudLinkConfig = toml::from_str(content)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Fold env-provided keys into the ring, after the inline keys
    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        for name in std::mem::take(&mut self.credentials.private_keys_env) {
            let key =
                std::env::var(&name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))?;
            self.credentials.private_keys.push(key);
        }
        Ok(())
    }

    /// Check identifiers, key ring and tuning bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_non_empty("project_id", &self.device.project_id)?;
        validate_non_empty("location", &self.device.location)?;
        validate_identifier("registry_id", &self.device.registry_id)?;
        validate_identifier("device_id", &self.device.device_id)?;

        if self.signing_keys().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one private key is required".to_string(),
            ));
        }
        if self.credentials.token_ttl_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "token_ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.credentials.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            warn!(
                requested = self.credentials.token_ttl_secs,
                ceiling = MAX_TOKEN_TTL_SECS,
                "Token lifetime above protocol ceiling, clamping"
            );
        }

        self.backoff_policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;
        if self.reconnect.health_probe_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "health_probe_attempts must be greater than 0".to_string(),
            ));
        }
        if self.connection.keep_alive_secs != 0 && self.connection.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be 0 or at least 5".to_string(),
            ));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        self.endpoint()?;

        Ok(())
    }

    /// Non-empty keys in ring order
    pub fn signing_keys(&self) -> Vec<String> {
        self.credentials
            .private_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Token lifetime bounded by [`MAX_TOKEN_TTL_SECS`]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.credentials.token_ttl_secs.min(MAX_TOKEN_TTL_SECS))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            floor_ms: self.reconnect.backoff_floor_ms,
            ceiling_ms: self.reconnect.backoff_ceiling_ms,
        }
    }

    pub fn health_probe(&self) -> HealthProbe {
        HealthProbe {
            attempts: self.reconnect.health_probe_attempts,
            delay: Duration::from_millis(self.reconnect.health_probe_delay_ms),
        }
    }

    /// Broker for this configuration: the override URL or the fixed bridge
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        match &self.connection.broker_url {
            Some(url) => Endpoint::parse(url).map_err(|e| ConfigError::InvalidConfig(e.to_string())),
            None => Ok(Endpoint::for_mode(self.connection.endpoint)),
        }
    }

    /// Protocol client settings, reading the trust root from disk if configured
    pub fn client_settings(&self) -> Result<ClientSettings, ConfigError> {
        let root_cert = match &self.connection.root_cert_path {
            Some(path) => Some(std::fs::read(path)?),
            None => None,
        };

        Ok(ClientSettings {
            keep_alive: Duration::from_secs(self.connection.keep_alive_secs),
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            clean_session: self.connection.clean_session,
            root_cert,
            ..Default::default()
        })
    }

    pub fn drive_mode(&self) -> DriveMode {
        match self.runtime.mode {
            RuntimeMode::Cooperative => DriveMode::Cooperative,
            RuntimeMode::Background => DriveMode::Background {
                tick: Duration::from_millis(self.runtime.tick_ms),
            },
        }
    }

    /// Copy safe to print: signing secrets replaced by placeholders
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.credentials.private_keys = copy
            .credentials
            .private_keys
            .iter()
            .enumerate()
            .map(|(i, _)| format!("<key {i} redacted>"))
            .collect();
        copy
    }
}

fn validate_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidIdentifier(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

/// Registry and device ids: `[a-zA-Z0-9._~+%-]+`
fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '~' | '+' | '%'));

    if value.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidIdentifier(format!(
            "{field} '{value}' must match pattern [a-zA-Z0-9._~+%-]+"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[device]
project_id = "demo-project"
location = "europe-west1"
registry_id = "sensors"
device_id = "esp32-01"

[credentials]
private_keys = ["aa:bb"]
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = CloudLinkConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.device.device_id, "esp32-01");
        assert!(config.connection.enabled);
        assert_eq!(config.connection.endpoint, EndpointMode::Lts);
        assert_eq!(config.token_ttl(), Duration::from_secs(3600));
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
        assert_eq!(config.health_probe(), HealthProbe::default());
        assert_eq!(config.runtime.mode, RuntimeMode::Background);
        assert_eq!(
            config.drive_mode(),
            DriveMode::Background {
                tick: Duration::from_millis(50)
            }
        );
    }

    #[test]
    fn test_token_ttl_is_clamped() {
        let content = MINIMAL.replace(
            "private_keys = [\"aa:bb\"]",
            "private_keys = [\"aa:bb\"]\ntoken_ttl_secs = 172800",
        );
        let config = CloudLinkConfig::from_toml(&content).unwrap();
        assert_eq!(config.token_ttl(), Duration::from_secs(MAX_TOKEN_TTL_SECS));
    }

    #[test]
    fn test_empty_keys_are_dropped_from_ring() {
        let mut config = CloudLinkConfig::from_toml(MINIMAL).unwrap();
        config.credentials.private_keys =
            vec!["a".to_string(), "".to_string(), "  ".to_string(), "b".to_string()];
        assert_eq!(config.signing_keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_missing_keys_rejected() {
        let content = MINIMAL.replace("private_keys = [\"aa:bb\"]", "private_keys = []");
        assert!(matches!(
            CloudLinkConfig::from_toml(&content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_device_id() {
        let content = MINIMAL.replace("esp32-01", "bad/device");
        assert!(matches!(
            CloudLinkConfig::from_toml(&content),
            Err(ConfigError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_standard_endpoint_and_override() {
        let content = format!("{MINIMAL}\n[connection]\nendpoint = \"standard\"\n");
        let config = CloudLinkConfig::from_toml(&content).unwrap();
        assert_eq!(
            config.endpoint().unwrap(),
            Endpoint::for_mode(EndpointMode::Standard)
        );

        let content = format!("{MINIMAL}\n[connection]\nbroker_url = \"mqtt://localhost:1883\"\n");
        let config = CloudLinkConfig::from_toml(&content).unwrap();
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert!(!endpoint.tls);
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let content =
            format!("{MINIMAL}\n[reconnect]\nbackoff_floor_ms = 5000\nbackoff_ceiling_ms = 100\n");
        assert!(matches!(
            CloudLinkConfig::from_toml(&content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_cooperative_mode() {
        let content = format!("{MINIMAL}\n[runtime]\nmode = \"cooperative\"\n");
        let config = CloudLinkConfig::from_toml(&content).unwrap();
        assert_eq!(config.drive_mode(), DriveMode::Cooperative);
    }

    #[test]
    fn test_redacted_hides_keys() {
        let config = CloudLinkConfig::from_toml(MINIMAL).unwrap();
        let redacted = config.redacted();
        assert_eq!(redacted.credentials.private_keys, vec!["<key 0 redacted>"]);
        assert_eq!(config.credentials.private_keys, vec!["aa:bb"]);
    }
}
