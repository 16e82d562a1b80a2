//! Live feature-flag cache kept in sync over a SignalR hub connection.
//!
//! A server publishes `SendMessage` invocations carrying
//! `{"FeatureToggleName": ..., "NewValue": ...}` payloads. The client holds
//! the latest value per flag and serves synchronous reads while a background
//! task keeps the connection alive.
//!
//! # Features
//! - `Endpoint=...;AccessKey=...` connection strings
//! - HS256 bearer tokens minted fresh for every connection attempt
//! - Automatic reconnect with a pluggable [`BackoffPolicy`]
//! - Keep-alive pings and server-timeout detection
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), toggled_client::Error> {
//! use toggled_client::{ClientConfig, ToggledClient};
//!
//! let config = ClientConfig::new(
//!     "Endpoint=https://toggled.service.signalr.net;AccessKey=<key>",
//!     "flags",
//!     "checkout-service-1",
//! );
//! let client = ToggledClient::connect(config).await?;
//!
//! // Unknown flags are an error; treat them as "off".
//! let enabled = client.get_feature_value("new-checkout").unwrap_or(false);
//! println!("new-checkout: {enabled}");
//!
//! client.dispose().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod cache;
mod client;
mod connection;
mod connection_string;
pub mod protocol;
mod token;
mod transport;
mod types;

pub use backoff::{BackoffPolicy, DEFAULT_MAX_JITTER, ExponentialBackoff, UniformJitter};
pub use cache::FeatureStateCache;
pub use client::ToggledClient;
pub use connection::SignalRTransport;
pub use connection_string::ConnectionDescriptor;
pub use token::{AccessToken, TokenIssuer};
pub use transport::{AccessTokenProvider, HubCredentials, InvocationHandler, Transport};
pub use types::{
    ClientConfig, ConnectionState, Error, FEATURE_CHANGED_TARGET, FeatureChangeEvent, Result,
    TimingConfig,
};
