//! SignalR hub connection over WebSocket: negotiate, handshake, keep-alive
//! and invocation dispatch.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use url::Url;

use crate::protocol::{
    HandshakeRequest, HubMessage, NegotiateResponse, decode_handshake, decode_message,
    encode_record, message_type, split_records,
};
use crate::transport::{AccessTokenProvider, InvocationHandler, Transport};
use crate::types::{Error, Result, TimingConfig};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const NEGOTIATE_VERSION: &str = "1";
const MAX_NEGOTIATE_REDIRECTS: usize = 10;

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Negotiate
// ---------------------------------------------------------------------------

/// `<path>/negotiate?<query>&negotiateVersion=1` for a hub URL.
fn negotiate_url(url: &Url) -> Url {
    let mut u = url.clone();
    let path = format!("{}/negotiate", u.path().trim_end_matches('/'));
    u.set_path(&path);
    u.query_pairs_mut()
        .append_pair("negotiateVersion", NEGOTIATE_VERSION);
    u
}

/// A negotiated endpoint: where to open the WebSocket and with which token.
#[derive(Debug)]
pub(crate) struct NegotiatedEndpoint {
    pub url: Url,
    pub access_token: String,
    pub connection_id: Option<String>,
}

/// Run negotiate against `url`, following redirects.
pub(crate) async fn negotiate(
    http: &reqwest::Client,
    url: &Url,
    access_token: String,
) -> Result<NegotiatedEndpoint> {
    let mut url = url.clone();
    let mut access_token = access_token;

    for _ in 0..MAX_NEGOTIATE_REDIRECTS {
        let resp = http
            .post(negotiate_url(&url))
            .bearer_auth(&access_token)
            .send()
            .await?
            .error_for_status()?
            .json::<NegotiateResponse>()
            .await?;

        if let Some(error) = resp.error {
            return Err(Error::Protocol(format!("negotiate failed: {error}")));
        }
        if let Some(redirect) = resp.url {
            tracing::debug!(url = %redirect, "Negotiate redirected");
            url = Url::parse(&redirect)?;
            if let Some(token) = resp.access_token {
                access_token = token;
            }
            continue;
        }
        if !resp.supports_websockets() {
            return Err(Error::Protocol(
                "server does not offer the WebSockets transport".to_string(),
            ));
        }
        let connection_id = resp.connection_id_for_transport().map(str::to_string);
        return Ok(NegotiatedEndpoint {
            url,
            access_token,
            connection_id,
        });
    }

    Err(Error::Protocol(format!(
        "negotiate exceeded {MAX_NEGOTIATE_REDIRECTS} redirects"
    )))
}

// ---------------------------------------------------------------------------
// WebSocket URL construction
// ---------------------------------------------------------------------------

fn build_ws_url(url: &Url, access_token: &str, connection_id: Option<&str>) -> Result<Url> {
    let mut u = url.clone();
    let scheme = match u.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::Protocol(format!("unsupported URL scheme '{other}'")));
        }
    };
    u.set_scheme(scheme)
        .map_err(|()| Error::Protocol(format!("cannot switch URL to {scheme}")))?;
    {
        let mut q = u.query_pairs_mut();
        if let Some(id) = connection_id {
            q.append_pair("id", id);
        }
        q.append_pair("access_token", access_token);
    }
    Ok(u)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    ws_read: WsRead,
    ws_write: WsWrite,
    /// Records that arrived in the same frame as the handshake response.
    pending: VecDeque<String>,
}

async fn connect_and_handshake(ws_url: &Url, handshake_timeout: Duration) -> Result<Session> {
    let (ws, _resp) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;
    let (mut ws_write, mut ws_read) = ws.split();

    let request = encode_record(&HandshakeRequest::default())?;
    ws_write
        .send(tungstenite::Message::Text(request.into()))
        .await?;

    let pending = tokio::time::timeout(handshake_timeout, wait_for_handshake(&mut ws_read))
        .await
        .map_err(|_| Error::Protocol("handshake timed out".to_string()))??;

    Ok(Session {
        ws_read,
        ws_write,
        pending,
    })
}

/// Wait for the handshake response record; returns any records after it.
async fn wait_for_handshake(ws_read: &mut WsRead) -> Result<VecDeque<String>> {
    while let Some(frame) = ws_read.next().await {
        match frame? {
            tungstenite::Message::Text(text) => {
                let records = split_records(text.as_str())?;
                let mut records = records.into_iter();
                let Some(first) = records.next() else {
                    continue;
                };
                let resp = decode_handshake(first)?;
                if let Some(error) = resp.error {
                    return Err(Error::Protocol(format!("handshake rejected: {error}")));
                }
                tracing::debug!("Handshake complete");
                return Ok(records.map(str::to_string).collect());
            }
            tungstenite::Message::Close(frame) => {
                return Err(Error::Protocol(format!(
                    "connection closed during handshake: {}",
                    frame.map_or_else(|| "no reason".to_string(), |f| f.reason.as_str().to_string())
                )));
            }
            _ => {
                tracing::debug!("Ignoring non-text frame before handshake");
            }
        }
    }
    Err(Error::Protocol(
        "connection closed before handshake response".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// [`Transport`] speaking the SignalR JSON hub protocol over WebSocket.
pub struct SignalRTransport {
    http: reqwest::Client,
    handlers: HashMap<String, InvocationHandler>,
    session: Option<Session>,
    timing: TimingConfig,
}

impl SignalRTransport {
    pub fn new(timing: TimingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timing.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            handlers: HashMap::new(),
            session: None,
            timing,
        })
    }

    fn dispatch(&self, record: &str) -> Dispatch {
        let msg = match decode_message(record) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Failed to decode hub message: {e}");
                return Dispatch::Continue;
            }
        };
        match msg.kind {
            message_type::INVOCATION => {
                let method = msg.target.as_deref().unwrap_or_default();
                let Some(handler) = self.handlers.get(method) else {
                    tracing::debug!(method, "No handler registered for invocation");
                    return Dispatch::Continue;
                };
                match msg.string_pair() {
                    Some((origin, payload)) => handler(origin, payload),
                    None => {
                        tracing::warn!(method, "Invocation arguments are not two strings");
                    }
                }
            }
            message_type::PING => {
                tracing::trace!("Ping received");
            }
            message_type::CLOSE => {
                tracing::info!(
                    error = msg.error.as_deref(),
                    allow_reconnect = msg.allow_reconnect,
                    "Hub sent close"
                );
                return Dispatch::Closed(match msg.error {
                    Some(error) => Err(Error::Protocol(format!("server closed connection: {error}"))),
                    None => Ok(()),
                });
            }
            other => {
                tracing::debug!(kind = other, "Ignoring hub message");
            }
        }
        Dispatch::Continue
    }
}

enum Dispatch {
    Continue,
    Closed(Result<()>),
}

#[async_trait]
impl Transport for SignalRTransport {
    fn on(&mut self, target: &str, handler: InvocationHandler) {
        self.handlers.insert(target.to_string(), handler);
    }

    async fn start(&mut self, url: &Url, tokens: &dyn AccessTokenProvider) -> Result<()> {
        self.stop().await;

        let access_token = tokens.access_token()?;
        let ws_url = if self.timing.skip_negotiation {
            build_ws_url(url, &access_token, None)?
        } else {
            let endpoint = negotiate(&self.http, url, access_token).await?;
            build_ws_url(
                &endpoint.url,
                &endpoint.access_token,
                endpoint.connection_id.as_deref(),
            )?
        };

        let session = connect_and_handshake(&ws_url, self.timing.handshake_timeout).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        // Drain records that arrived with the handshake response first.
        loop {
            let Some(record) = self
                .session
                .as_mut()
                .and_then(|s| s.pending.pop_front())
            else {
                break;
            };
            if let Dispatch::Closed(result) = self.dispatch(&record) {
                self.session = None;
                return result;
            }
        }

        let keep_alive = self.timing.keep_alive_interval;
        let server_timeout = self.timing.server_timeout;
        let mut next_ping = Instant::now() + keep_alive;
        let mut idle_deadline = Instant::now() + server_timeout;

        loop {
            let Some(session) = self.session.as_mut() else {
                return Err(Error::NotConnected);
            };

            tokio::select! {
                frame = session.ws_read.next() => {
                    match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            idle_deadline = Instant::now() + server_timeout;
                            let records = match split_records(text.as_str()) {
                                Ok(records) => records,
                                Err(e) => {
                                    tracing::warn!("Dropping malformed frame: {e}");
                                    continue;
                                }
                            };
                            for record in records {
                                if let Dispatch::Closed(result) = self.dispatch(record) {
                                    self.session = None;
                                    return result;
                                }
                            }
                        }
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            tracing::info!(frame = ?frame, "WebSocket closed by server");
                            self.session = None;
                            return Err(Error::Protocol("WebSocket closed by server".to_string()));
                        }
                        Some(Ok(_)) => {
                            // Binary, ping and pong frames still prove liveness.
                            idle_deadline = Instant::now() + server_timeout;
                        }
                        Some(Err(e)) => {
                            tracing::warn!("WebSocket error: {e}");
                            self.session = None;
                            return Err(e.into());
                        }
                        None => {
                            tracing::info!("WebSocket stream ended");
                            self.session = None;
                            return Err(Error::Protocol("WebSocket stream ended".to_string()));
                        }
                    }
                }

                _ = tokio::time::sleep_until(next_ping) => {
                    next_ping = Instant::now() + keep_alive;
                    let ping = encode_record(&HubMessage::ping())?;
                    if let Err(e) = session.ws_write.send(tungstenite::Message::Text(ping.into())).await {
                        tracing::warn!("Failed to send ping: {e}");
                        self.session = None;
                        return Err(e.into());
                    }
                    tracing::trace!("Ping sent");
                }

                _ = tokio::time::sleep_until(idle_deadline) => {
                    tracing::warn!(?server_timeout, "Server timeout, no message received");
                    self.session = None;
                    return Err(Error::Protocol(format!(
                        "no message received from server within {server_timeout:?}"
                    )));
                }
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Ok(close) = encode_record(&HubMessage::close(None, None)) {
                let _ = session
                    .ws_write
                    .send(tungstenite::Message::Text(close.into()))
                    .await;
            }
            let _ = session.ws_write.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_url() -> Url {
        Url::parse("https://example.com/client/?hub=flags").unwrap()
    }

    #[test]
    fn negotiate_url_appends_path_and_version() {
        let u = negotiate_url(&hub_url());
        assert_eq!(u.path(), "/client/negotiate");
        assert_eq!(u.query(), Some("hub=flags&negotiateVersion=1"));
    }

    #[test]
    fn build_ws_url_secure() {
        let u = build_ws_url(&hub_url(), "tok", Some("conn-1")).unwrap();
        assert_eq!(u.scheme(), "wss");
        assert_eq!(u.path(), "/client/");
        let query = u.query().unwrap();
        assert!(query.starts_with("hub=flags"));
        assert!(query.contains("id=conn-1"));
        assert!(query.contains("access_token=tok"));
    }

    #[test]
    fn build_ws_url_plain() {
        let url = Url::parse("http://127.0.0.1:8080/client/?hub=flags").unwrap();
        let u = build_ws_url(&url, "tok", None).unwrap();
        assert_eq!(u.scheme(), "ws");
        assert!(!u.query().unwrap().contains("id="));
    }

    #[test]
    fn build_ws_url_rejects_unknown_scheme() {
        let url = Url::parse("ftp://example.com/client/?hub=flags").unwrap();
        assert!(matches!(
            build_ws_url(&url, "tok", None),
            Err(Error::Protocol(_))
        ));
    }

    fn mock_url(server: &httpmock::MockServer, path: &str) -> Url {
        Url::parse(&server.url(path)).unwrap()
    }

    #[tokio::test]
    async fn negotiate_returns_connection_token() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/client/negotiate")
                    .query_param("hub", "flags")
                    .query_param("negotiateVersion", "1")
                    .header("authorization", "Bearer tok");
                then.status(200).json_body(serde_json::json!({
                    "negotiateVersion": 1,
                    "connectionId": "conn-id",
                    "connectionToken": "conn-token",
                    "availableTransports": [
                        {"transport": "WebSockets", "transferFormats": ["Text"]}
                    ]
                }));
            })
            .await;

        let http = reqwest::Client::new();
        let endpoint = negotiate(&http, &mock_url(&server, "/client/?hub=flags"), "tok".into())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(endpoint.connection_id.as_deref(), Some("conn-token"));
        assert_eq!(endpoint.access_token, "tok");
        assert_eq!(endpoint.url.path(), "/client/");
    }

    #[tokio::test]
    async fn negotiate_follows_redirect_with_new_token() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let redirect = server.url("/service/client/?hub=flags");
        server
            .mock_async(|when, then| {
                when.method(POST).path("/client/negotiate");
                then.status(200).json_body(serde_json::json!({
                    "url": redirect,
                    "accessToken": "service-token"
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/service/client/negotiate")
                    .header("authorization", "Bearer service-token");
                then.status(200).json_body(serde_json::json!({
                    "negotiateVersion": 1,
                    "connectionId": "c",
                    "connectionToken": "t",
                    "availableTransports": []
                }));
            })
            .await;

        let http = reqwest::Client::new();
        let endpoint = negotiate(&http, &mock_url(&server, "/client/?hub=flags"), "tok".into())
            .await
            .unwrap();
        assert_eq!(endpoint.url.path(), "/service/client/");
        assert_eq!(endpoint.access_token, "service-token");
        assert_eq!(endpoint.connection_id.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn negotiate_error_body() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/client/negotiate");
                then.status(200)
                    .json_body(serde_json::json!({"error": "hub not found"}));
            })
            .await;

        let http = reqwest::Client::new();
        let err = negotiate(&http, &mock_url(&server, "/client/?hub=flags"), "tok".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("hub not found")));
    }

    #[tokio::test]
    async fn negotiate_http_failure() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/client/negotiate");
                then.status(401).body("Unauthorized");
            })
            .await;

        let http = reqwest::Client::new();
        let err = negotiate(&http, &mock_url(&server, "/client/?hub=flags"), "tok".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn build_ws_url_encodes_token() {
        let u = build_ws_url(&hub_url(), "a.b+c/d", None).unwrap();
        assert!(u.query().unwrap().contains("access_token=a.b%2Bc%2Fd"));
    }
}
