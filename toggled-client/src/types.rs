//! Public types for the toggled-client crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_tungstenite::tungstenite;

use crate::backoff::BackoffPolicy;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
pub(crate) const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Hub method the server invokes to announce a flag change.
pub const FEATURE_CHANGED_TARGET: &str = "SendMessage";

/// A flag change decoded from an inbound `SendMessage` payload.
///
/// The wire object carries no version or timestamp, so events for the same
/// flag are applied strictly in arrival order (last write wins). Unknown
/// fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeatureChangeEvent {
    #[serde(rename = "FeatureToggleName")]
    pub feature_name: String,
    #[serde(rename = "NewValue")]
    pub new_value: bool,
}

impl FeatureChangeEvent {
    pub fn new(feature_name: impl Into<String>, new_value: bool) -> Self {
        Self {
            feature_name: feature_name.into(),
            new_value,
        }
    }

    /// Decode a `SendMessage` payload string.
    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Lifecycle of the client's single hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial connect in progress.
    Connecting,
    /// Connected; inbound changes are being applied.
    Open,
    /// Connection lost; waiting for or performing a reconnect attempt.
    Reconnecting,
    /// Disposed. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Timing knobs for connecting and keeping the hub connection alive.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Upper bound for a single connect attempt (negotiate + handshake).
    pub connect_timeout: Duration,
    /// Lifetime of each minted access token.
    pub token_lifetime: Duration,
    /// How often the client pings the hub.
    pub keep_alive_interval: Duration,
    /// The connection is considered lost if nothing arrives for this long.
    pub server_timeout: Duration,
    /// Upper bound for the protocol handshake after the socket opens.
    pub handshake_timeout: Duration,
    /// Connect the WebSocket directly without the negotiate round-trip.
    pub skip_negotiation: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            token_lifetime: DEFAULT_TOKEN_LIFETIME,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            skip_negotiation: false,
        }
    }
}

/// Configuration for [`ToggledClient::connect`](crate::ToggledClient::connect).
pub struct ClientConfig {
    /// `Endpoint=...;AccessKey=...` connection string.
    pub connection_string: String,
    /// Hub to subscribe to, embedded in the client URL as `?hub=<name>`.
    pub hub_name: String,
    /// Token subject (name identifier claim) for this client.
    pub client_identity: String,
    /// Timing overrides. Defaults apply when `None`.
    pub timing: Option<TimingConfig>,
    /// Reconnect delay policy. Defaults to uniform jitter in `[0, 5s)`.
    pub backoff: Option<Arc<dyn BackoffPolicy>>,
}

impl ClientConfig {
    pub fn new(
        connection_string: impl Into<String>,
        hub_name: impl Into<String>,
        client_identity: impl Into<String>,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            hub_name: hub_name.into(),
            client_identity: client_identity.into(),
            timing: None,
            backoff: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connection_string", &"<redacted>")
            .field("hub_name", &self.hub_name)
            .field("client_identity", &self.client_identity)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed connection string: {0}")]
    MalformedConnectionString(String),

    #[error("Duplicate properties found in connection string: {0}")]
    DuplicateProperty(String),

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("Negotiate HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Hub protocol error: {0}")]
    Protocol(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Payload decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("There was no feature switch called {0}")]
    UnknownFeature(String),
}

impl Error {
    /// Whether this error is a failure to reach or talk to the hub.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_)
                | Error::Http(_)
                | Error::Protocol(_)
                | Error::ConnectTimeout(_)
                | Error::NotConnected
        )
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
