//! Wire-level types shared by the client
//!
//! Every frame on the channel is a UTF-8 JSON object with at least a `type`
//! discriminator:
//!
//! - **Outbound request**: `{ "type": <request>, "request_id": <string>, ... }`
//! - **Inbound response**: `{ "type": "response", "request_id": <string>, "data"?, "error"? }`
//! - **Inbound push**: `{ "type": "api-…", "data"? }` (no `request_id`)
//! - **Inbound error**: `{ "type": "error", "message": <string> }`
//! - **Liveness**: `ping` / `pong`, used for diagnostics only
//!
//! Request identifiers embed the request kind's tag for readability in server
//! logs, but correlation never parses them: the client keeps a side table from
//! identifier to [`RequestKind`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved prefix of push notification types
pub const PUSH_PREFIX: &str = "api-";

/// Legacy push type that predates the `api-` prefix
pub const LEGACY_EVENT_PUSH: &str = "event_update";

/// Opaque request identifier
///
/// Serializes as a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an identifier string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of an outgoing request
///
/// The kind decides the wire `type`, the tag embedded in the request id,
/// whether the request needs an active session, and which handler processes
/// the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Join (or resume) a session by token
    JoinSession,
    /// Look up a session without joining it
    CheckSession,
    /// Refresh the current session
    Session,
    /// List joinable sessions
    Sessions,
    /// Current session event
    SessionEvent,
    /// Seconds until the next stage, plus step counters
    TimeToNextStage,
    /// End-of-game statistics
    Statistics,
    /// End-of-game leaders
    Leaders,
    /// All companies
    Companies,
    /// A single company
    Company,
    /// All users
    Users,
    /// Factories of one company
    Factories,
    /// Exchange offers
    Exchanges,
    /// Item prices
    ItemPrices,
    /// All cities
    Cities,
    /// A single city
    City,
    /// Demands of one city
    CityDemands,
    /// Contracts
    Contracts,
    /// Sell goods to a city
    SellToCity,
    /// Liveness check
    Ping,
    /// Any other request type; its response goes to the generic handler
    Custom(String),
}

impl RequestKind {
    /// The `type` field sent on the wire
    pub fn wire_type(&self) -> &str {
        match self {
            RequestKind::JoinSession | RequestKind::CheckSession | RequestKind::Session => {
                "get-session"
            }
            RequestKind::Sessions => "get-sessions",
            RequestKind::SessionEvent => "get-session-event",
            RequestKind::TimeToNextStage => "get-session-time-to-next-stage",
            RequestKind::Statistics => "get-all-session-statistics",
            RequestKind::Leaders => "get-session-leaders",
            RequestKind::Companies => "get-companies",
            RequestKind::Company => "get-company",
            RequestKind::Users => "get-users",
            RequestKind::Factories => "get-factories",
            RequestKind::Exchanges => "get-exchanges",
            RequestKind::ItemPrices => "get-items-price",
            RequestKind::Cities => "get-cities",
            RequestKind::City => "get-city",
            RequestKind::CityDemands => "get-city-demands",
            RequestKind::Contracts => "get-contracts",
            RequestKind::SellToCity => "sell-to-city",
            RequestKind::Ping => "ping",
            RequestKind::Custom(wire) => wire,
        }
    }

    /// The tag embedded at the front of request identifiers
    pub fn tag(&self) -> String {
        let tag = match self {
            RequestKind::JoinSession => "join_session",
            RequestKind::CheckSession => "check_session",
            RequestKind::Session => "get_session",
            RequestKind::Sessions => "get_sessions",
            RequestKind::SessionEvent => "get_session_event",
            RequestKind::TimeToNextStage => "get_time",
            RequestKind::Statistics => "get_statistics",
            RequestKind::Leaders => "get_leaders",
            RequestKind::Companies => "get_companies",
            RequestKind::Company => "get_company",
            RequestKind::Users => "get_users",
            RequestKind::Factories => "get_factories",
            RequestKind::Exchanges => "get_exchanges",
            RequestKind::ItemPrices => "get_all_item_prices",
            RequestKind::Cities => "get_cities",
            RequestKind::City => "get_city",
            RequestKind::CityDemands => "get_city_demands",
            RequestKind::Contracts => "get_contracts",
            RequestKind::SellToCity => "sell_to_city",
            RequestKind::Ping => "ping",
            RequestKind::Custom(wire) => return wire.replace('-', "_"),
        };
        tag.to_string()
    }

    /// Whether the request is scoped to the current session
    ///
    /// Such requests are rejected with `NoActiveSession` when no token is set.
    pub fn requires_session(&self) -> bool {
        matches!(
            self,
            RequestKind::Session
                | RequestKind::SessionEvent
                | RequestKind::TimeToNextStage
                | RequestKind::Statistics
                | RequestKind::Leaders
        )
    }

    /// Whether the request should carry the current session id when one is known
    pub fn attaches_session(&self) -> bool {
        self.requires_session()
            || matches!(
                self,
                RequestKind::Companies
                    | RequestKind::Users
                    | RequestKind::Exchanges
                    | RequestKind::ItemPrices
                    | RequestKind::Cities
                    | RequestKind::Contracts
            )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_type())
    }
}

/// Who caused a request to be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Explicit caller action
    Manual,
    /// The poll scheduler
    Polling,
    /// A push notification
    Broadcast,
}

impl Source {
    /// Lowercase label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Manual => "manual",
            Source::Polling => "polling",
            Source::Broadcast => "broadcast",
        }
    }
}

/// Coarse-grained stage of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Phase {
    /// Players joining or picking cells
    Lobby,
    /// Between two turns
    Between,
    /// A turn is being played
    Active,
    /// The game is over
    End,
    /// No session, or a stage this client does not know
    #[default]
    Unknown,
}

impl Phase {
    /// Map a server stage name onto a phase
    pub fn from_stage(stage: &str) -> Self {
        match stage {
            "FreeUserConnect" | "CellSelect" | "Setup" | "Lobby" => Phase::Lobby,
            "ChangeTurn" | "Between" => Phase::Between,
            "Game" | "Active" => Phase::Active,
            "End" => Phase::End,
            _ => Phase::Unknown,
        }
    }

    /// Terminal phases never poll and suppress refetches
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::End)
    }
}

/// Outbound request frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestFrame {
    /// Request type
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation identifier
    pub request_id: RequestId,
    /// Request-specific fields, flattened into the frame
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RequestFrame {
    /// Create a frame with no extra fields
    pub fn new(kind: &RequestKind, request_id: RequestId) -> Self {
        Self {
            kind: kind.wire_type().to_string(),
            request_id,
            fields: serde_json::Map::new(),
        }
    }

    /// Add a field, replacing any previous value with the same name
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Inbound response to a request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseFrame {
    /// Identifier of the request being answered
    pub request_id: RequestId,
    /// Payload, if any
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Server-side failure description, if any
    #[serde(default)]
    pub error: Option<String>,
}

/// Inbound push notification
#[derive(Debug, Clone, PartialEq)]
pub struct PushFrame {
    /// Topic (the frame's `type`)
    pub topic: String,
    /// Payload, if any
    pub data: Option<serde_json::Value>,
}

impl PushFrame {
    /// Create a push frame
    pub fn new(topic: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }

    /// Look up a field of the payload
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|d| d.get(name))
    }
}

/// Any inbound frame, classified by its `type`
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `type: "response"` with a `request_id`
    Response(ResponseFrame),
    /// `type` carries the push prefix
    Push(PushFrame),
    /// `type: "error"`
    Error {
        /// Server-provided description
        message: String,
    },
    /// `type: "pong"`
    Pong,
    /// Anything this client does not understand
    Other {
        /// The frame's `type`, if it had one
        kind: Option<String>,
    },
}
