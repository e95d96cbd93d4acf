//! Wire types, codec and telemetry bootstrap for segsync
//!
//! segsync keeps a local copy of a multiplayer economic game's state in sync
//! with a server over one WebSocket channel. This crate holds the parts that
//! have no runtime behaviour of their own:
//!
//! - **Types**: request kinds, session phases and the inbound frame model
//! - **Codec**: encoding requests and classifying inbound frames
//! - **Errors**: the error enum shared by every layer
//! - **Observability**: tracing-subscriber and OpenTelemetry setup
//!
//! The `segsync-client` crate builds the connection, correlator, poller and
//! push router on top of these.
//!
//! # Example
//!
//! ```rust
//! use segsync_core::{codec, InboundFrame, Phase, RequestFrame, RequestKind};
//!
//! let frame = RequestFrame::new(&RequestKind::Companies, "get_companies_1".into())
//!     .with_field("session_id", serde_json::json!("ABC"));
//! let json = codec::encode_request(&frame).unwrap();
//! assert!(json.contains("get-companies"));
//!
//! let inbound = codec::decode(r#"{"type":"pong"}"#).unwrap();
//! assert_eq!(inbound, InboundFrame::Pong);
//! assert_eq!(Phase::from_stage("ChangeTurn"), Phase::Between);
//! ```

pub mod codec;
pub mod error;
pub mod observability;
pub mod types;

pub use error::{Error, Result};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use types::{
    InboundFrame, Phase, PushFrame, RequestFrame, RequestId, RequestKind, ResponseFrame, Source,
    LEGACY_EVENT_PUSH, PUSH_PREFIX,
};
