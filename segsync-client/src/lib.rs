//! Game-state synchronization client over WebSocket
//!
//! This crate keeps a local mirror of a game server's state in sync over a
//! single WebSocket channel. Requests and responses share the channel with
//! unsolicited push notifications.
//!
//! # Core Features
//!
//! - **Correlation**: requests carry unique ids; responses are routed by the
//!   kind recorded at send time
//! - **Auto-Reconnection**: fixed-delay or exponential-backoff strategies
//! - **Session Resumption**: the joined session's token is persisted and
//!   rejoined on every reconnect
//! - **Adaptive Polling**: full refreshes at an interval set by the game phase
//! - **Debounced Pushes**: bursts of notifications collapse into one refetch
//! - **Local Cache**: snapshots plus a change-event subscription
//! - **Observability**: request statistics and OpenTelemetry instruments
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use segsync_client::{ClientBuilder, SyncEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new("ws://localhost:8000/ws").connect().await?;
//!     let mut events = client.subscribe();
//!
//!     client.join_session("AB12CD").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let SyncEvent::CollectionChanged(collection) = event {
//!             println!("{:?} changed", collection);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod cache;
mod client;
mod client_builder;
mod connection_state;
mod handlers;
mod metrics;
mod notification;
mod reconnect;
mod request;
mod scheduler;
mod storage;

pub use cache::{
    CacheState, Collection, LocalCache, SessionHandle, SyncEvent, EXCHANGE_ACTIVITY_CAP,
    RECENT_UPGRADES_CAP,
};
pub use client::SyncClient;
pub use client_builder::ClientBuilder;
pub use connection_state::{ConnectionManager, ConnectionState};
pub use metrics::{ClientMetrics, RequestCounter, RequestStats};
pub use notification::{route, Action, Debouncer, Inline, Refresh, DEFAULT_DEBOUNCE_WINDOW};
pub use reconnect::{
    ExponentialBackoff, FixedDelay, NoReconnect, ReconnectionStrategy, DEFAULT_RECONNECT_DELAY,
};
pub use request::{Continuation, PendingRequest, RequestManager};
pub use scheduler::{PollIntervals, PollScheduler};
pub use storage::{MemorySessionStore, SessionStore, SledSessionStore, SESSION_KEY};
