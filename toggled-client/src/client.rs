//! Public entry point: [`ToggledClient`] and its background reconnect loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::backoff::{BackoffPolicy, UniformJitter};
use crate::cache::FeatureStateCache;
use crate::connection::SignalRTransport;
use crate::connection_string::ConnectionDescriptor;
use crate::token::TokenIssuer;
use crate::transport::{AccessTokenProvider, HubCredentials, InvocationHandler, Transport};
use crate::types::{
    ClientConfig, ConnectionState, Error, FEATURE_CHANGED_TARGET, FeatureChangeEvent, Result,
    TimingConfig,
};

/// `<endpoint>/client/?hub=<hub_name>`, verbatim. Tokens are bound to this
/// exact string, so it is not normalized or re-encoded.
pub(crate) fn client_url(endpoint: &str, hub_name: &str) -> String {
    format!("{endpoint}/client/?hub={hub_name}")
}

/// Handle to a live feature-flag cache.
///
/// Reads are synchronous and never block on the network. While the
/// connection is down, reads return the last known values.
pub struct ToggledClient {
    cache: FeatureStateCache,
    state_rx: watch::Receiver<ConnectionState>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ToggledClient {
    /// Connect using the built-in SignalR transport.
    ///
    /// Returns once the first connection attempt has completed. A failure
    /// here is returned to the caller and not retried.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let timing = config.timing.clone().unwrap_or_default();
        let transport = SignalRTransport::new(timing)?;
        Self::connect_with_transport(config, transport).await
    }

    /// Connect using a caller-supplied transport.
    pub async fn connect_with_transport<T: Transport>(
        config: ClientConfig,
        mut transport: T,
    ) -> Result<Self> {
        let timing = config.timing.unwrap_or_default();
        let backoff = config
            .backoff
            .unwrap_or_else(|| Arc::new(UniformJitter::default()));

        let descriptor = ConnectionDescriptor::parse(&config.connection_string)?;
        let audience = client_url(descriptor.endpoint(), &config.hub_name);
        let url = Url::parse(&audience)?;
        let tokens = Arc::new(HubCredentials::new(
            TokenIssuer::new(descriptor.secret()),
            audience,
            Some(config.client_identity),
            timing.token_lifetime,
        ));

        let cache = FeatureStateCache::new();
        transport.on(FEATURE_CHANGED_TARGET, feature_changed_handler(cache.clone()));

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tracing::info!(url = %url, "Connecting to hub");
        tokio::time::timeout(timing.connect_timeout, transport.start(&url, &*tokens))
            .await
            .map_err(|_| Error::ConnectTimeout(timing.connect_timeout))??;
        state_tx.send_replace(ConnectionState::Open);
        tracing::info!("Connected to hub");

        let (close_tx, close_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(run_event_loop(
            EventLoopState {
                transport,
                url,
                tokens,
                backoff,
                timing,
                state_tx,
            },
            close_rx,
        ));

        Ok(Self {
            cache,
            state_rx,
            close_tx: Mutex::new(Some(close_tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Last known value of `feature_name`.
    ///
    /// Fails with [`Error::UnknownFeature`] if no change event for the name
    /// has been received yet.
    pub fn get_feature_value(&self, feature_name: &str) -> Result<bool> {
        self.cache.get(feature_name)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every connection state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Close the connection and stop reconnecting. Safe to call repeatedly
    /// and while a reconnect attempt is in flight.
    pub async fn dispose(&self) {
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.lock().await.take()
            && let Err(e) = task.await
        {
            tracing::warn!("Connection task ended abnormally: {e}");
        }
    }
}

impl Drop for ToggledClient {
    fn drop(&mut self) {
        if let Some(tx) = self.close_tx.get_mut().take() {
            let _ = tx.send(());
        }
    }
}

/// Decode `SendMessage` payloads and apply them to `cache`.
fn feature_changed_handler(cache: FeatureStateCache) -> InvocationHandler {
    Arc::new(move |origin: &str, payload: &str| {
        tracing::debug!(origin, payload, "Received message from server");
        let event = match FeatureChangeEvent::from_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(origin, "Dropping undecodable feature change: {e}");
                return;
            }
        };
        let feature = event.feature_name.clone();
        let value = event.new_value;
        match cache.apply(event) {
            Some(_) => tracing::info!(feature = %feature, value, "Updating feature switch value"),
            None => tracing::info!(feature = %feature, value, "Adding new feature switch"),
        }
    })
}

// ---------------------------------------------------------------------------
// Background event loop
// ---------------------------------------------------------------------------

struct EventLoopState<T> {
    transport: T,
    url: Url,
    tokens: Arc<HubCredentials>,
    backoff: Arc<dyn BackoffPolicy>,
    timing: TimingConfig,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T> EventLoopState<T> {
    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(%state, "Connection state changed");
        self.state_tx.send_replace(state);
    }
}

async fn run_event_loop<T: Transport>(mut p: EventLoopState<T>, mut close_rx: oneshot::Receiver<()>) {
    'outer: loop {
        tokio::select! {
            result = p.transport.run() => {
                match result {
                    Ok(()) => tracing::warn!("The connection to the hub was closed. Trying to reconnect..."),
                    Err(e) => tracing::warn!("The connection to the hub has been lost ({e}). Trying to reconnect..."),
                }
            }
            _ = &mut close_rx => break 'outer,
        }

        p.set_state(ConnectionState::Reconnecting);

        let mut attempt: u32 = 0;
        loop {
            let delay = p.backoff.next_delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut close_rx => break 'outer,
            }

            let connect_timeout = p.timing.connect_timeout;
            let tokens: &dyn AccessTokenProvider = &*p.tokens;
            let result = tokio::select! {
                r = tokio::time::timeout(connect_timeout, p.transport.start(&p.url, tokens)) => r,
                _ = &mut close_rx => break 'outer,
            };
            match result {
                Ok(Ok(())) => {
                    tracing::info!(attempt, "Reconnected to hub");
                    p.set_state(ConnectionState::Open);
                    continue 'outer;
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, "Reconnect attempt failed: {e}");
                }
                Err(_) => {
                    tracing::warn!(attempt, ?connect_timeout, "Reconnect attempt timed out");
                }
            }
        }
    }

    tracing::info!("Close requested");
    p.transport.stop().await;
    p.set_state(ConnectionState::Closed);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
