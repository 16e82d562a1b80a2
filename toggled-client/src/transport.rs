//! Seam between the client state machine and the hub connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::token::TokenIssuer;
use crate::types::Result;

/// Handler for a hub invocation carrying `(origin, payload)` string arguments.
pub type InvocationHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Supplies a bearer token for one connection attempt.
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self) -> Result<String>;
}

/// Mints a fresh token per call, bound to one audience and subject.
#[derive(Clone)]
pub struct HubCredentials {
    issuer: TokenIssuer,
    audience: String,
    subject: Option<String>,
    lifetime: Duration,
}

impl HubCredentials {
    pub fn new(
        issuer: TokenIssuer,
        audience: impl Into<String>,
        subject: Option<String>,
        lifetime: Duration,
    ) -> Self {
        Self {
            issuer,
            audience: audience.into(),
            subject,
            lifetime,
        }
    }
}

impl AccessTokenProvider for HubCredentials {
    fn access_token(&self) -> Result<String> {
        let token = self
            .issuer
            .issue(&self.audience, self.subject.as_deref(), self.lifetime)?;
        tracing::debug!(
            audience = %token.audience,
            expires_at = %token.expires_at,
            "Minted access token"
        );
        Ok(token.value)
    }
}

impl fmt::Debug for HubCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubCredentials")
            .field("audience", &self.audience)
            .field("subject", &self.subject)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// A realtime hub connection.
///
/// The client owns its transport exclusively: it registers handlers once,
/// calls [`start`](Transport::start) for the initial connect and every
/// reconnect, then drives the open connection with [`run`](Transport::run).
#[async_trait]
pub trait Transport: Send + 'static {
    /// Register `handler` for invocations of hub method `target`.
    fn on(&mut self, target: &str, handler: InvocationHandler);

    /// Open a connection to `url`, authenticating with a token taken from
    /// `tokens`. Any previous connection is discarded.
    async fn start(&mut self, url: &Url, tokens: &dyn AccessTokenProvider) -> Result<()>;

    /// Process the open connection, dispatching invocations to handlers,
    /// until it closes. `Ok` means the server closed it cleanly.
    ///
    /// Must be cancel-safe: the client drops this future on shutdown.
    async fn run(&mut self) -> Result<()>;

    /// Close the connection if one is open.
    async fn stop(&mut self);
}
