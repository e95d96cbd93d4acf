//! Client builder
//!
//! The `ClientBuilder` provides a fluent API for configuring a [`SyncClient`]
//! before connecting:
//! - the instance id sent as `client_id` on the connection URL
//! - the reconnect strategy (fixed one-second delay by default)
//! - the debounce window for push-triggered refreshes
//! - the per-phase poll intervals
//! - where the session token is persisted
//! - observability (OpenTelemetry) and the service name
//!
//! # Examples
//!
//! ```rust,no_run
//! use segsync_client::{ClientBuilder, ExponentialBackoff, SledSessionStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> segsync_core::Result<()> {
//! let client = ClientBuilder::new("ws://localhost:8000/ws")
//!     .with_reconnect(Box::new(ExponentialBackoff::new(
//!         Duration::from_millis(500),
//!         Duration::from_secs(15),
//!     )))
//!     .with_session_store(Arc::new(SledSessionStore::open("segsync.db")?))
//!     .with_default_observability()
//!     .service_name("seg-dashboard")
//!     .connect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::client::SyncClient;
use crate::notification::DEFAULT_DEBOUNCE_WINDOW;
use crate::reconnect::{FixedDelay, ReconnectionStrategy};
use crate::scheduler::PollIntervals;
use crate::storage::{MemorySessionStore, SessionStore};
use segsync_core::{Error, ObservabilityConfig, Result};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Builder for configuring and creating a [`SyncClient`]
pub struct ClientBuilder {
    address: String,
    instance_id: Option<String>,
    reconnect_strategy: Option<Box<dyn ReconnectionStrategy>>,
    debounce_window: Duration,
    poll_intervals: PollIntervals,
    session_store: Option<Arc<dyn SessionStore>>,
    observability_config: Option<ObservabilityConfig>,
    service_name: Option<String>,
}

impl ClientBuilder {
    /// Create a builder for the given server address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            instance_id: None,
            reconnect_strategy: None,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            poll_intervals: PollIntervals::default(),
            session_store: None,
            observability_config: None,
            service_name: None,
        }
    }

    /// Set the instance id sent to the server for diagnostics
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Reconnect with the given strategy after unexpected closes
    pub fn with_reconnect(mut self, strategy: Box<dyn ReconnectionStrategy>) -> Self {
        self.reconnect_strategy = Some(strategy);
        self
    }

    /// Quiet window for debounced refreshes
    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Poll period per phase
    pub fn poll_intervals(mut self, intervals: PollIntervals) -> Self {
        self.poll_intervals = intervals;
        self
    }

    /// Persist the session token in the given store
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    /// Enable OpenTelemetry observability with custom configuration
    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Enable OpenTelemetry observability with default configuration
    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(ObservabilityConfig::default());
        self
    }

    /// Set service name for observability (used if observability is enabled)
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Full connection URL: the address plus the `client_id` query parameter
    pub fn url(&self) -> String {
        let separator = if self.address.contains('?') { '&' } else { '?' };
        format!(
            "{}{}client_id={}",
            self.address,
            separator,
            self.resolved_instance_id()
        )
    }

    fn resolved_instance_id(&self) -> String {
        self.instance_id.clone().unwrap_or_else(default_instance_id)
    }

    /// Build the client without connecting
    pub fn build(mut self) -> Result<SyncClient> {
        // Pin the generated id so url() and the client agree.
        self.instance_id = Some(self.resolved_instance_id());
        let url = self.url();

        let metrics = if let Some(mut config) = self.observability_config {
            if let Some(name) = self.service_name {
                config.service_name = name;
            }

            segsync_core::init_observability(config.clone())
                .map_err(|e| Error::Internal(format!("Failed to initialize observability: {}", e)))?;

            Some(Arc::new(crate::ClientMetrics::new(config.service_name)))
        } else {
            None
        };

        let strategy = self
            .reconnect_strategy
            .unwrap_or_else(|| Box::new(FixedDelay::default()));
        let store = self
            .session_store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        Ok(SyncClient::new(
            url,
            strategy,
            self.debounce_window,
            self.poll_intervals,
            store,
            metrics,
        ))
    }

    /// Build the client and open the connection
    ///
    /// Fails when the first attempt fails. The client keeps reconnecting in
    /// the background regardless; use [`build`](Self::build) followed by
    /// [`SyncClient::connect`] to keep the handle in that case.
    pub async fn connect(self) -> Result<SyncClient> {
        let client = self.build()?;
        client.connect().await?;
        Ok(client)
    }
}

fn default_instance_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("rust_{}", millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = ClientBuilder::new("ws://localhost:8000/ws");
        assert_eq!(builder.debounce_window, Duration::from_secs(1));
        assert_eq!(builder.poll_intervals, PollIntervals::default());
        assert!(builder.reconnect_strategy.is_none());
        assert!(builder.session_store.is_none());
        assert!(builder.observability_config.is_none());
        assert!(builder.service_name.is_none());
    }

    #[test]
    fn test_url_carries_instance_id() {
        let builder = ClientBuilder::new("ws://localhost:8000/ws").instance_id("panel_7");
        assert_eq!(builder.url(), "ws://localhost:8000/ws?client_id=panel_7");

        let builder = ClientBuilder::new("ws://host/ws?token=x").instance_id("a");
        assert_eq!(builder.url(), "ws://host/ws?token=x&client_id=a");
    }

    #[test]
    fn test_default_instance_id() {
        let url = ClientBuilder::new("ws://h").url();
        let id = url.strip_prefix("ws://h?client_id=rust_").unwrap();
        assert!(id.parse::<u128>().is_ok());
    }

    #[test]
    fn test_builder_chaining() {
        let intervals = PollIntervals {
            active: Duration::from_secs(2),
            ..PollIntervals::default()
        };
        let builder = ClientBuilder::new("ws://localhost:8000/ws")
            .with_reconnect(Box::new(FixedDelay::new(Duration::from_millis(250))))
            .debounce_window(Duration::from_millis(300))
            .poll_intervals(intervals)
            .with_session_store(Arc::new(MemorySessionStore::with_token("S1")))
            .service_name("test-service")
            .with_default_observability();

        assert!(builder.reconnect_strategy.is_some());
        assert_eq!(builder.debounce_window, Duration::from_millis(300));
        assert_eq!(builder.poll_intervals.active, Duration::from_secs(2));
        assert!(builder.session_store.is_some());
        assert_eq!(builder.service_name.as_deref(), Some("test-service"));
        assert_eq!(
            builder.observability_config.map(|c| c.service_name),
            Some("segsync".to_string())
        );
    }

    #[test]
    fn test_builder_observability_config() {
        let config = ObservabilityConfig::new("dash")
            .with_endpoint("http://localhost:4317")
            .with_log_level("debug");
        let builder = ClientBuilder::new("ws://h").with_observability(config);

        let config = builder.observability_config.unwrap();
        assert_eq!(config.service_name, "dash");
        assert_eq!(config.log_level, "debug");
    }

    #[tokio::test]
    async fn test_build_without_connecting() {
        let client = ClientBuilder::new("ws://127.0.0.1:1/ws")
            .instance_id("t")
            .build()
            .unwrap();
        assert_eq!(client.url(), "ws://127.0.0.1:1/ws?client_id=t");
        assert_eq!(
            client.connection_state().await,
            crate::ConnectionState::Disconnected
        );
    }
}
