//! Pure connection state management for the cloud MQTT link
//!
//! This module contains the connection state machine states, the error taxonomy
//! surfaced by the protocol client, broker endpoints and the pure translation of
//! settings into `rumqttc` options.

use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions, StateError, TlsConfiguration};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Hostname of the standard cloud MQTT bridge
pub const STANDARD_HOST: &str = "mqtt.googleapis.com";
/// Hostname of the long-term-support regional bridge
pub const LTS_HOST: &str = "mqtt.2030.ltsapis.goog";
/// Port shared by both bridges
pub const CLOUD_PORT: u16 = 8883;

/// Trust root used when no certificate is configured
pub const DEFAULT_ROOT_CERT: &str = "-----BEGIN CERTIFICATE-----
MIIErjCCA5agAwIBAgIQW+5sTJWKajts11BgHkBRwjANBgkqhkiG9w0BAQsFADBU
MQswCQYDVQQGEwJVUzEeMBwGA1UEChMVR29vZ2xlIFRydXN0IFNlcnZpY2VzMSUw
IwYDVQQDExxHb29nbGUgSW50ZXJuZXQgQXV0aG9yaXR5IEczMB4XDTE5MDYxMTEy
MzE1OVoXDTE5MDkwMzEyMjAwMFowbTELMAkGA1UEBhMCVVMxEzARBgNVBAgMCkNh
bGlmb3JuaWExFjAUBgNVBAcMDU1vdW50YWluIFZpZXcxEzARBgNVBAoMCkdvb2ds
ZSBMTEMxHDAaBgNVBAMME21xdHQuZ29vZ2xlYXBpcy5jb20wggEiMA0GCSqGSIb3
DQEBAQUAA4IBDwAwggEKAoIBAQDHuQUoDZWl2155WvaQ9AmhTRNC+mHassokdQK7
NxkZVZfrS8EhRkZop6SJGHdvozBP3Ko3g1MgGIZFzqb5fRohkRKB6mteHHi/W7Uo
7d8+wuTTz3llUZ2gHF/hrXFJfztwnaZub/KB+fXwSqWgMyo1EBme4ULV0rQZGFu6
7U38HK+mFRbeJkh1SDOureI2dxkC4ACGiqWfX/vSyzpZkWGRuxK2F5cnBHqRbcKs
OfmYyUuxZjGah+fC5ePgDbAntLUuYNppkdgT8yt/13ae/V7+rRhKOZC4q76HBEaQ
4Wn5UC+ShVaAGuo7BtfoIFSyZi8/DU2eTQcHWewIXU6V5InhAgMBAAGjggFhMIIB
XTATBgNVHSUEDDAKBggrBgEFBQcDATA4BgNVHREEMTAvghNtcXR0Lmdvb2dsZWFw
aXMuY29tghhtcXR0LW10bHMuZ29vZ2xlYXBpcy5jb20waAYIKwYBBQUHAQEEXDBa
MC0GCCsGAQUFBzAChiFodHRwOi8vcGtpLmdvb2cvZ3NyMi9HVFNHSUFHMy5jcnQw
KQYIKwYBBQUHMAGGHWh0dHA6Ly9vY3NwLnBraS5nb29nL0dUU0dJQUczMB0GA1Ud
DgQWBBSKWpFfG/yH1dkkJT05y/ZnRm/M4DAMBgNVHRMBAf8EAjAAMB8GA1UdIwQY
MBaAFHfCuFCaZ3Z2sS3ChtCDoH6mfrpLMCEGA1UdIAQaMBgwDAYKKwYBBAHWeQIF
AzAIBgZngQwBAgIwMQYDVR0fBCowKDAmoCSgIoYgaHR0cDovL2NybC5wa2kuZ29v
Zy9HVFNHSUFHMy5jcmwwDQYJKoZIhvcNAQELBQADggEBAKMoXHxmLI1oKnraV0tL
NzznlVnle4ljS/pqNI8LUM4/5QqD3qGqnI4fBxX1l+WByCitbTiNvL2KRNi9xau5
oqvsuSVkjRQxky2eesjkdrp+rrxTwFhQ6NAbUeZgUV0zfm5XZE76kInbcukwXxAx
lneyQy2git0voUWTK4mipfCU946rcK3+ArcanV7EDSXbRxfjBSRBD6K+XGUhIPHW
brk0v1wzED1RFEHTdzLAecU50Xwic6IniM3B9URfSOmjlBRebg2sEVQavMHbzURg
94aDC+EkNlHh3pOmQ/V89MBiF1xDHbZZ1gB0GszYKPHec9omSwQ5HbIDV3uf3/DQ
his=
-----END CERTIFICATE-----
";

/// Connection state of the cloud link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No broker session; the backoff policy decides when to retry
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Authenticated session established and subscriptions installed
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// CONNACK return codes reported by the broker (MQTT 3.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCode {
    /// No CONNACK seen yet
    #[default]
    Unknown,
    Accepted,
    UnacceptableProtocol,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ReturnCode {
    /// True when the broker rejected the credential itself, which warrants
    /// moving on to the next signing key.
    pub fn is_credential_rejection(self) -> bool {
        matches!(self, ReturnCode::BadCredentials | ReturnCode::NotAuthorized)
    }
}

impl From<ConnectReturnCode> for ReturnCode {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => ReturnCode::Accepted,
            ConnectReturnCode::RefusedProtocolVersion => ReturnCode::UnacceptableProtocol,
            ConnectReturnCode::BadClientId => ReturnCode::IdentifierRejected,
            ConnectReturnCode::ServiceUnavailable => ReturnCode::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => ReturnCode::BadCredentials,
            ConnectReturnCode::NotAuthorized => ReturnCode::NotAuthorized,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReturnCode::Unknown => "unknown",
            ReturnCode::Accepted => "accepted",
            ReturnCode::UnacceptableProtocol => "unacceptable protocol",
            ReturnCode::IdentifierRejected => "identifier rejected",
            ReturnCode::ServerUnavailable => "server unavailable",
            ReturnCode::BadCredentials => "bad username or password",
            ReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// Coarse classification of [`MqttError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket level: connect, read, write, timeout
    Transport,
    /// Malformed, unexpected or oversized packets
    Framing,
    /// Broker refused the session
    Auth,
}

/// Failures surfaced by the protocol client
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MqttError {
    #[error("network connect failed: {0}")]
    ConnectFailed(String),
    #[error("network timeout")]
    Timeout,
    #[error("network read failed: {0}")]
    ReadFailed(String),
    #[error("network write failed: {0}")]
    WriteFailed(String),
    #[error("ping response timeout")]
    PongTimeout,
    #[error("client used before an endpoint was selected")]
    NotStarted,
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("missing or unexpected packet: {0}")]
    UnexpectedPacket(String),
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("connection denied: {0}")]
    ConnectionDenied(ReturnCode),
}

impl MqttError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MqttError::ConnectFailed(_)
            | MqttError::Timeout
            | MqttError::ReadFailed(_)
            | MqttError::WriteFailed(_)
            | MqttError::PongTimeout
            | MqttError::NotStarted
            | MqttError::InvalidBrokerUrl(_) => ErrorKind::Transport,
            MqttError::MalformedPacket(_)
            | MqttError::UnexpectedPacket(_)
            | MqttError::SubscriptionFailed(_) => ErrorKind::Framing,
            MqttError::ConnectionDenied(_) => ErrorKind::Auth,
        }
    }

    /// Return code carried by an authentication failure, `Unknown` otherwise
    pub fn return_code(&self) -> ReturnCode {
        match self {
            MqttError::ConnectionDenied(code) => *code,
            _ => ReturnCode::Unknown,
        }
    }
}

impl From<ConnectionError> for MqttError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::Io(e) => match e.kind() {
                IoErrorKind::TimedOut | IoErrorKind::WouldBlock => MqttError::Timeout,
                IoErrorKind::UnexpectedEof
                | IoErrorKind::ConnectionReset
                | IoErrorKind::ConnectionAborted => MqttError::ReadFailed(e.to_string()),
                IoErrorKind::BrokenPipe | IoErrorKind::WriteZero => {
                    MqttError::WriteFailed(e.to_string())
                }
                _ => MqttError::ConnectFailed(e.to_string()),
            },
            ConnectionError::NetworkTimeout => MqttError::Timeout,
            ConnectionError::FlushTimeout => MqttError::WriteFailed("flush timeout".to_string()),
            ConnectionError::ConnectionRefused(code) => {
                MqttError::ConnectionDenied(ReturnCode::from(code))
            }
            ConnectionError::NotConnAck(packet) => {
                MqttError::UnexpectedPacket(format!("expected CONNACK, got {packet:?}"))
            }
            ConnectionError::MqttState(state) => match state {
                StateError::AwaitPingResp => MqttError::PongTimeout,
                StateError::Io(e) => MqttError::ReadFailed(e.to_string()),
                StateError::Deserialization(e) => MqttError::MalformedPacket(e.to_string()),
                StateError::WrongPacket => {
                    MqttError::UnexpectedPacket("packet out of sequence".to_string())
                }
                other => MqttError::UnexpectedPacket(other.to_string()),
            },
            other => MqttError::ConnectFailed(other.to_string()),
        }
    }
}

/// Which of the two cloud bridges to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    Standard,
    #[default]
    Lts,
}

/// Broker address selected for a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    /// Fixed cloud bridge for the given mode
    pub fn for_mode(mode: EndpointMode) -> Self {
        let host = match mode {
            EndpointMode::Standard => STANDARD_HOST,
            EndpointMode::Lts => LTS_HOST,
        };
        Self {
            host: host.to_string(),
            port: CLOUD_PORT,
            tls: true,
        }
    }

    /// Parse an `mqtts://host[:port]` or `mqtt://host[:port]` broker override
    pub fn parse(broker_url: &str) -> Result<Self, MqttError> {
        let url =
            Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.into()))?;

        let tls = match url.scheme() {
            "mqtts" | "ssl" => true,
            "mqtt" | "tcp" => false,
            _ => return Err(MqttError::InvalidBrokerUrl(broker_url.into())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.into()))?;
        let port = url.port().unwrap_or(if tls { CLOUD_PORT } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Options applied to every protocol client session
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub keep_alive: Duration,
    /// Upper bound on the connect/handshake exchange
    pub connect_timeout: Duration,
    pub clean_session: bool,
    /// PEM trust root; `None` uses [`DEFAULT_ROOT_CERT`]
    pub root_cert: Option<Vec<u8>>,
    /// How long a single `poll` may wait for inbound traffic
    pub poll_window: Duration,
    pub request_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(180),
            connect_timeout: Duration::from_millis(1000),
            clean_session: true,
            root_cert: None,
            poll_window: Duration::from_millis(5),
            request_capacity: 10,
        }
    }
}

impl ClientSettings {
    pub fn root_cert_pem(&self) -> Vec<u8> {
        self.root_cert
            .clone()
            .unwrap_or_else(|| DEFAULT_ROOT_CERT.as_bytes().to_vec())
    }
}

/// Pure function building `rumqttc` options for one connection attempt
pub fn configure_mqtt_options(
    client_id: &str,
    username: &str,
    password: &str,
    endpoint: &Endpoint,
    settings: &ClientSettings,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
    mqtt_options.set_credentials(username, password);
    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_session(settings.clean_session);

    if endpoint.tls {
        let tls = TlsConfiguration::Simple {
            ca: settings.root_cert_pem(),
            alpn: None,
            client_auth: None,
        };
        mqtt_options.set_transport(rumqttc::Transport::tls_with_config(tls));
    }

    mqtt_options
}
