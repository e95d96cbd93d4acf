//! Push notification routing and debouncing
//!
//! Pushes are unsolicited frames whose `type` carries the `api-` prefix (or
//! the legacy bare `event_update`). [`route`] maps one push to the list of
//! [`Action`]s the client should take. It is a pure function of the frame,
//! which keeps the topic table testable without a connection.
//!
//! Most topics do not carry enough data to patch the cache, so they trigger
//! a refetch of the affected collection. Bursts of the same topic are common
//! (a trade touches both cities and companies, a tick touches every factory)
//! so those refetches go through a [`Debouncer`]: the refresh fires once the
//! key has been quiet for the debounce window.
//!
//! # Debounce keys
//!
//! | refresh             | key                |
//! |---------------------|--------------------|
//! | companies           | `companies`        |
//! | cities              | `cities`           |
//! | one city            | `city:{id}`        |
//! | factories of a firm | `factories:{id}`   |
//! | item prices         | `prices`           |

use segsync_core::{Phase, PushFrame, RequestKind, LEGACY_EVENT_PUSH};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default quiet window before a debounced refresh fires
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

const EVENT_TOPICS: [&str; 5] = [
    "api-event_generated",
    "api-event_started",
    "api-event_ended",
    "api-event_updated",
    LEGACY_EVENT_PUSH,
];

/// A collection refetch
#[derive(Debug, Clone, PartialEq)]
pub enum Refresh {
    Session,
    TimeToNextStage,
    Event,
    Companies,
    Users,
    /// Factories of the company with this id
    Factories(Value),
    Exchanges,
    Cities,
    /// One city by id
    City(Value),
    Prices,
    Contracts,
    Statistics,
    Leaders,
}

impl Refresh {
    /// Debounce key; refreshes with equal keys coalesce
    pub fn key(&self) -> String {
        match self {
            Refresh::Session => "session".into(),
            Refresh::TimeToNextStage => "time".into(),
            Refresh::Event => "event".into(),
            Refresh::Companies => "companies".into(),
            Refresh::Users => "users".into(),
            Refresh::Factories(company) => format!("factories:{}", key_part(company)),
            Refresh::Exchanges => "exchanges".into(),
            Refresh::Cities => "cities".into(),
            Refresh::City(city) => format!("city:{}", key_part(city)),
            Refresh::Prices => "prices".into(),
            Refresh::Contracts => "contracts".into(),
            Refresh::Statistics => "statistics".into(),
            Refresh::Leaders => "leaders".into(),
        }
    }

    /// Request that performs the refresh
    pub fn kind(&self) -> RequestKind {
        match self {
            Refresh::Session => RequestKind::Session,
            Refresh::TimeToNextStage => RequestKind::TimeToNextStage,
            Refresh::Event => RequestKind::SessionEvent,
            Refresh::Companies => RequestKind::Companies,
            Refresh::Users => RequestKind::Users,
            Refresh::Factories(_) => RequestKind::Factories,
            Refresh::Exchanges => RequestKind::Exchanges,
            Refresh::Cities => RequestKind::Cities,
            Refresh::City(_) => RequestKind::City,
            Refresh::Prices => RequestKind::ItemPrices,
            Refresh::Contracts => RequestKind::Contracts,
            Refresh::Statistics => RequestKind::Statistics,
            Refresh::Leaders => RequestKind::Leaders,
        }
    }

    /// Extra request fields
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        match self {
            Refresh::Factories(company) => {
                fields.insert("company_id".into(), company.clone());
            }
            Refresh::City(city) => {
                fields.insert("id".into(), city.clone());
            }
            _ => {}
        }
        fields
    }
}

fn key_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Data carried by a push that is written straight into the cache
#[derive(Debug, Clone, PartialEq)]
pub enum Inline {
    /// Newest entry of the recent-upgrades feed
    Upgrade(Value),
    /// Newest entry of the exchange-activity feed
    ExchangeActivity(Value),
    /// Goods sold to a city
    ProductSale { resource: String, amount: f64 },
    /// One item's new price
    ItemPrice { item_id: Value, price: Value },
    /// Current event; `None`, null and `{}` clear it
    Event(Option<Value>),
    /// End-of-game winners
    Winners(Value),
}

/// What the client does in response to a push
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Refetch once the key has been quiet for the debounce window
    Debounce(Refresh),
    /// Refetch now, superseding any pending timer for the key
    Immediate(Refresh),
    /// Write push data into the cache
    Apply(Inline),
    /// The session moved to a new non-terminal stage
    StageChanged(String),
    /// The session reached its terminal phase
    Terminal,
    /// Fetch once after termination; never suppressed
    FinalFetch(Refresh),
    /// A session was deleted on the server
    SessionDeleted(String),
}

/// Map a push to the actions it triggers
///
/// Unknown topics produce no actions; they are still surfaced to listeners
/// by the caller.
pub fn route(push: &PushFrame) -> Vec<Action> {
    use Action::*;

    let topic = push.topic.as_str();
    let mut actions = Vec::new();

    match topic {
        "api-create_company"
        | "api-company_deleted"
        | "api-user_added_to_company"
        | "api-user_left_company"
        | "api-company_set_position"
        | "api-company_position_changed"
        | "api-company_name_updated" => actions.push(Debounce(Refresh::Companies)),

        "api-company_improvement_upgraded" => {
            if let Some(data) = push.data.as_ref().filter(|d| !d.is_null()) {
                actions.push(Apply(Inline::Upgrade(data.clone())));
            }
            actions.push(Debounce(Refresh::Companies));
        }

        "api-create_user" | "api-update_user" | "api-user_deleted" => {
            actions.push(Debounce(Refresh::Users))
        }

        "api-update_session_stage" => {
            let stage = push.field("new_stage").and_then(Value::as_str);
            if stage.map(Phase::from_stage).is_some_and(|p| p.is_terminal()) {
                actions.push(Terminal);
            } else {
                actions.push(Immediate(Refresh::Session));
                actions.push(Immediate(Refresh::TimeToNextStage));
                actions.push(Immediate(Refresh::Event));
                if let Some(stage) = stage {
                    actions.push(StageChanged(stage.to_string()));
                }
            }
        }

        "api-game_ended" => {
            actions.push(Terminal);
            if let Some(winners) = push.field("winners").filter(|w| !w.is_null()) {
                actions.push(Apply(Inline::Winners(winners.clone())));
            }
            actions.push(FinalFetch(Refresh::Session));
            actions.push(FinalFetch(Refresh::Statistics));
            actions.push(FinalFetch(Refresh::Leaders));
        }

        "api-session_deleted" => {
            if let Some(id) = push.field("session_id").and_then(id_string) {
                actions.push(SessionDeleted(id));
            }
        }

        "api-factory-start-complectation"
        | "api-factory-end-complectation"
        | "api-factory-end-production"
        | "api-factory-create"
        | "api-factory-delete" => {
            if let Some(company) = push.field("company_id").filter(|c| !c.is_null()) {
                actions.push(Debounce(Refresh::Factories(company.clone())));
            }
        }

        "api-exchange_offer_created" => {
            if let Some(offer) = push.field("offer").and_then(Value::as_object) {
                let mut activity = Map::new();
                activity.insert("type".into(), "offer_created".into());
                activity.extend(offer.iter().map(|(k, v)| (k.clone(), v.clone())));
                actions.push(Apply(Inline::ExchangeActivity(Value::Object(activity))));
            }
            actions.push(Debounce(Refresh::Exchanges));
        }

        "api-exchange_offer_updated" | "api-exchange_offer_cancelled" => {
            actions.push(Debounce(Refresh::Exchanges))
        }

        "api-exchange_trade_completed" => {
            if let Some(data) = push.data.as_ref().and_then(Value::as_object) {
                let mut activity = Map::new();
                activity.insert("type".into(), "trade_completed".into());
                activity.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
                actions.push(Apply(Inline::ExchangeActivity(Value::Object(activity))));
            }
            actions.push(Debounce(Refresh::Exchanges));
            actions.push(Debounce(Refresh::Companies));
        }

        "api-city-create" | "api-city-delete" => actions.push(Debounce(Refresh::Cities)),

        "api-city-update-demands" => match push.field("city_id").filter(|c| !c.is_null()) {
            Some(city) => actions.push(Debounce(Refresh::City(city.clone()))),
            None => actions.push(Debounce(Refresh::Cities)),
        },

        "api-city-trade" => {
            let resource = push.field("resource_id").and_then(id_string);
            let amount = push.field("amount").and_then(Value::as_f64);
            if let (Some(resource), Some(amount)) = (resource, amount) {
                if amount != 0.0 {
                    actions.push(Apply(Inline::ProductSale { resource, amount }));
                }
            }
            actions.push(Debounce(Refresh::Cities));
            actions.push(Debounce(Refresh::Companies));
        }

        "api-item_price_updated" => {
            let item_id = push.field("item_id").filter(|i| !i.is_null());
            if let (Some(item_id), Some(price)) = (item_id, push.field("price")) {
                actions.push(Apply(Inline::ItemPrice {
                    item_id: item_id.clone(),
                    price: price.clone(),
                }));
            }
            actions.push(Debounce(Refresh::Prices));
        }

        t if t.starts_with("api-contract_") => actions.push(Debounce(Refresh::Contracts)),

        t if EVENT_TOPICS.contains(&t) => {
            if push.field("event").is_none() {
                actions.push(Immediate(Refresh::Event));
            }
        }

        _ => {}
    }

    // Any push carrying an event updates the event inline, whatever its topic.
    if let Some(event) = push.field("event") {
        actions.push(Apply(Inline::Event(Some(event.clone()))));
    }

    actions
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Called when a debounce timer fires
pub type FireFn = Arc<dyn Fn(Refresh) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-key trailing-edge debounce timers
///
/// Scheduling a key that already has a timer resets it, so the refresh
/// fires one window after the last notification of a burst.
#[derive(Clone)]
pub struct Debouncer {
    window: Duration,
    fire: FireFn,
    timers: Arc<Mutex<HashMap<String, Timer>>>,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    /// Create a debouncer that hands fired refreshes to `fire`
    pub fn new<F, Fut>(window: Duration, fire: F) -> Self
    where
        F: Fn(Refresh) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fire: FireFn = Arc::new(move |refresh| Box::pin(fire(refresh)));
        Self {
            window,
            fire,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Quiet window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Arm or reset the timer for the refresh's key
    ///
    /// Returns true when an existing timer was reset, i.e. the notification
    /// was coalesced into a refresh that was already pending.
    pub async fn schedule(&self, refresh: Refresh) -> bool {
        let key = refresh.key();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);

        let timers = Arc::clone(&self.timers);
        let fire = Arc::clone(&self.fire);
        let window = self.window;
        let task_key = key.clone();

        let mut table = self.timers.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut table = timers.lock().await;
                match table.get(&task_key) {
                    Some(timer) if timer.generation == generation => {
                        table.remove(&task_key);
                    }
                    _ => return,
                }
            }
            tracing::debug!(key = %task_key, "debounced refresh firing");
            fire(refresh).await;
        });

        let previous = table.insert(key, Timer { generation, handle });
        match previous {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel the timer for a key; returns whether one was pending
    pub async fn cancel(&self, key: &str) -> bool {
        match self.timers.lock().await.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer; returns how many were pending
    pub async fn cancel_all(&self) -> usize {
        let mut table = self.timers.lock().await;
        let count = table.len();
        for (_, timer) in table.drain() {
            timer.handle.abort();
        }
        count
    }

    /// Keys with a pending timer, sorted
    pub async fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.timers.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
