//! segsync - game-state synchronization over a single WebSocket channel
//!
//! This is the convenience crate that re-exports the sub-crates. Depend on it
//! when you want one dependency for the client and its wire types.
//!
//! # Architecture
//!
//! - **segsync-core**: frame types, codec, errors, observability bootstrap
//! - **segsync-client**: the sync client with its cache, correlator,
//!   reconnecting connection, poll scheduler and push router
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use segsync::{ClientBuilder, SyncEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new("ws://localhost:8000/ws")
//!         .instance_id("dashboard")
//!         .connect()
//!         .await?;
//!
//!     client.join_session("AB12CD").await?;
//!     let companies = client.snapshot().await.companies;
//!     println!("{} companies", companies.len());
//!
//!     let mut events = client.subscribe();
//!     while let Ok(SyncEvent::CollectionChanged(collection)) = events.recv().await {
//!         println!("{:?} refreshed", collection);
//!     }
//!     Ok(())
//! }
//! ```

pub use segsync_client as client;
pub use segsync_core as core;

pub use segsync_client::{ClientBuilder, SyncClient, SyncEvent};
pub use segsync_core::{Error, Result};
