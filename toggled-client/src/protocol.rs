//! SignalR JSON hub protocol: record framing, message types, negotiate payloads.

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// Terminates every JSON record on the wire.
pub const RECORD_SEPARATOR: char = '\u{1e}';

// ---------------------------------------------------------------------------
// Message type constants
// ---------------------------------------------------------------------------

pub mod message_type {
    pub const INVOCATION: i32 = 1;
    pub const STREAM_ITEM: i32 = 2;
    pub const COMPLETION: i32 = 3;
    pub const STREAM_INVOCATION: i32 = 4;
    pub const CANCEL_INVOCATION: i32 = 5;
    pub const PING: i32 = 6;
    pub const CLOSE: i32 = 7;
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: "json".to_string(),
            version: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Hub messages
// ---------------------------------------------------------------------------

/// Any hub message. Fields that do not apply to `kind` stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
}

impl HubMessage {
    pub fn ping() -> Self {
        Self {
            kind: message_type::PING,
            ..Default::default()
        }
    }

    pub fn invocation(target: &str, arguments: Vec<serde_json::Value>) -> Self {
        Self {
            kind: message_type::INVOCATION,
            target: Some(target.to_string()),
            arguments: Some(arguments),
            ..Default::default()
        }
    }

    pub fn close(error: Option<String>, allow_reconnect: Option<bool>) -> Self {
        Self {
            kind: message_type::CLOSE,
            error,
            allow_reconnect,
            ..Default::default()
        }
    }

    /// The two string arguments of an `(origin, payload)` invocation.
    pub fn string_pair(&self) -> Option<(&str, &str)> {
        match self.arguments.as_deref() {
            Some([first, second]) => Some((first.as_str()?, second.as_str()?)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Negotiate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    pub transfer_formats: Vec<String>,
}

/// Response of `POST .../negotiate`. Either a connection descriptor, a
/// redirect (`url` + `access_token`) or an `error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub negotiate_version: u32,
    pub connection_id: Option<String>,
    pub connection_token: Option<String>,
    pub available_transports: Vec<AvailableTransport>,
    pub url: Option<String>,
    pub access_token: Option<String>,
    pub error: Option<String>,
}

impl NegotiateResponse {
    /// The `id` query value for the WebSocket URL.
    pub fn connection_id_for_transport(&self) -> Option<&str> {
        if self.negotiate_version >= 1 {
            self.connection_token.as_deref()
        } else {
            self.connection_id.as_deref()
        }
    }

    pub fn supports_websockets(&self) -> bool {
        self.available_transports.is_empty()
            || self
                .available_transports
                .iter()
                .any(|t| t.transport == "WebSockets")
    }
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

/// Serialize `msg` and append the record separator.
pub fn encode_record<T: Serialize>(msg: &T) -> Result<String> {
    let mut text = serde_json::to_string(msg)?;
    text.push(RECORD_SEPARATOR);
    Ok(text)
}

/// Split a text frame into its records. A trailing partial record is an error.
pub fn split_records(frame: &str) -> Result<Vec<&str>> {
    let Some(complete) = frame.strip_suffix(RECORD_SEPARATOR) else {
        return Err(Error::Protocol(
            "frame does not end with a record separator".to_string(),
        ));
    };
    Ok(complete.split(RECORD_SEPARATOR).collect())
}

pub fn decode_message(record: &str) -> Result<HubMessage> {
    serde_json::from_str(record)
        .map_err(|e| Error::Protocol(format!("hub message decode error: {e}")))
}

pub fn decode_handshake(record: &str) -> Result<HandshakeResponse> {
    serde_json::from_str(record)
        .map_err(|e| Error::Protocol(format!("handshake response decode error: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
