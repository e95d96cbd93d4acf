//! Local cache of synchronized game state
//!
//! The cache is the only state surface presentation code sees. It holds the
//! last-known-good value of every tracked collection plus the connection
//! status flags, and broadcasts a [`SyncEvent`] after every change.
//!
//! Entities are opaque JSON values. The only field the cache interprets is
//! `id`, used to patch single entities in place.
//!
//! Writes come from the client's frame handlers; reads are unrestricted and
//! always return clones.

use segsync_core::Phase;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Newest-first cap on [`CacheState::recent_upgrades`]
pub const RECENT_UPGRADES_CAP: usize = 10;

/// Newest-first cap on [`CacheState::exchange_activity`]
pub const EXCHANGE_ACTIVITY_CAP: usize = 20;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A tracked collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Session,
    Sessions,
    Companies,
    Users,
    Factories,
    Exchanges,
    Cities,
    Contracts,
    Prices,
    Event,
    Winners,
    Statistics,
    RecentUpgrades,
    ExchangeActivity,
    ProductSales,
}

impl Collection {
    /// Every collection, in declaration order
    pub const ALL: [Collection; 15] = [
        Collection::Session,
        Collection::Sessions,
        Collection::Companies,
        Collection::Users,
        Collection::Factories,
        Collection::Exchanges,
        Collection::Cities,
        Collection::Contracts,
        Collection::Prices,
        Collection::Event,
        Collection::Winners,
        Collection::Statistics,
        Collection::RecentUpgrades,
        Collection::ExchangeActivity,
        Collection::ProductSales,
    ];
}

/// Change notification for observers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A cached collection was written
    CollectionChanged(Collection),
    /// Raw push notification, delivered once per inbound push
    Push {
        /// Push type
        topic: String,
        /// Push payload
        data: Option<Value>,
    },
    /// Connection flags changed
    ConnectionChanged {
        /// Channel is open
        connected: bool,
        /// An attempt is in progress
        connecting: bool,
    },
    /// `last_error` was set
    Error(String),
}

/// The current session, as last reported by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionHandle {
    /// Session token
    pub id: Option<String>,
    /// Raw stage string
    pub stage: Option<String>,
    /// Phase derived from `stage`
    pub phase: Phase,
    pub step: Option<u64>,
    pub max_steps: Option<u64>,
    pub cells: Option<Value>,
    pub map_size: Option<Value>,
    pub map_pattern: Option<Value>,
    /// Seconds until the next stage
    pub time_to_next_stage: Option<f64>,
}

impl SessionHandle {
    fn set_stage(&mut self, stage: &str) {
        self.stage = Some(stage.to_string());
        self.phase = Phase::from_stage(stage);
    }
}

/// Everything the cache holds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheState {
    pub session: SessionHandle,
    pub sessions: Vec<Value>,
    pub companies: Vec<Value>,
    pub users: Vec<Value>,
    pub factories: Vec<Value>,
    pub exchanges: Vec<Value>,
    pub cities: Vec<Value>,
    pub contracts: Vec<Value>,
    pub prices: Vec<Value>,
    pub event: Option<Value>,
    pub winners: Option<Value>,
    pub statistics: Vec<Value>,
    pub recent_upgrades: Vec<Value>,
    pub exchange_activity: Vec<Value>,
    /// Resource id to cumulative amount sold to cities
    pub product_sales: BTreeMap<String, f64>,
    pub connected: bool,
    pub connecting: bool,
    pub last_error: Option<String>,
}

impl CacheState {
    /// Borrow a list-shaped collection
    pub fn list(&self, collection: Collection) -> Option<&Vec<Value>> {
        match collection {
            Collection::Sessions => Some(&self.sessions),
            Collection::Companies => Some(&self.companies),
            Collection::Users => Some(&self.users),
            Collection::Factories => Some(&self.factories),
            Collection::Exchanges => Some(&self.exchanges),
            Collection::Cities => Some(&self.cities),
            Collection::Contracts => Some(&self.contracts),
            Collection::Prices => Some(&self.prices),
            Collection::Statistics => Some(&self.statistics),
            Collection::RecentUpgrades => Some(&self.recent_upgrades),
            Collection::ExchangeActivity => Some(&self.exchange_activity),
            _ => None,
        }
    }

    fn list_mut(&mut self, collection: Collection) -> Option<&mut Vec<Value>> {
        match collection {
            Collection::Sessions => Some(&mut self.sessions),
            Collection::Companies => Some(&mut self.companies),
            Collection::Users => Some(&mut self.users),
            Collection::Factories => Some(&mut self.factories),
            Collection::Exchanges => Some(&mut self.exchanges),
            Collection::Cities => Some(&mut self.cities),
            Collection::Contracts => Some(&mut self.contracts),
            Collection::Prices => Some(&mut self.prices),
            Collection::Statistics => Some(&mut self.statistics),
            Collection::RecentUpgrades => Some(&mut self.recent_upgrades),
            Collection::ExchangeActivity => Some(&mut self.exchange_activity),
            _ => None,
        }
    }
}

fn string_field(data: &Value, name: &str) -> Option<String> {
    match data.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn push_capped(list: &mut Vec<Value>, item: Value, cap: usize) {
    list.insert(0, item);
    list.truncate(cap);
}

/// Shared handle to the cache
#[derive(Clone)]
pub struct LocalCache {
    state: Arc<RwLock<CacheState>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCache {
    /// Empty cache
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            events,
        }
    }

    /// Receive every future [`SyncEvent`]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Clone of the whole cache
    pub async fn snapshot(&self) -> CacheState {
        self.state.read().await.clone()
    }

    /// Run a closure against the current state without cloning it
    pub async fn read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        f(&*self.state.read().await)
    }

    /// Current session token
    pub async fn session_id(&self) -> Option<String> {
        self.state.read().await.session.id.clone()
    }

    /// Current phase
    pub async fn phase(&self) -> Phase {
        self.state.read().await.session.phase
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn changed(&self, collection: Collection) {
        self.emit(SyncEvent::CollectionChanged(collection));
    }

    /// Replace a list collection wholesale
    pub(crate) async fn replace(&self, collection: Collection, items: Vec<Value>) {
        {
            let mut state = self.state.write().await;
            match state.list_mut(collection) {
                Some(list) => *list = items,
                None => return,
            }
        }
        self.changed(collection);
    }

    /// Replace the element with the same `id`, or append
    pub(crate) async fn upsert(&self, collection: Collection, entity: Value) {
        {
            let mut state = self.state.write().await;
            let Some(list) = state.list_mut(collection) else {
                return;
            };
            let position = entity
                .get("id")
                .and_then(|id| list.iter().position(|e| e.get("id") == Some(id)));
            match position {
                Some(i) => list[i] = entity,
                None => list.push(entity),
            }
        }
        self.changed(collection);
    }

    /// Patch fields into the element with the given `id`
    ///
    /// Returns false when no element matches.
    pub(crate) async fn patch(
        &self,
        collection: Collection,
        id: &Value,
        fields: &serde_json::Map<String, Value>,
    ) -> bool {
        let patched = {
            let mut state = self.state.write().await;
            let target = state
                .list_mut(collection)
                .and_then(|list| list.iter_mut().find(|e| e.get("id") == Some(id)))
                .and_then(Value::as_object_mut);
            match target {
                Some(obj) => {
                    for (k, v) in fields {
                        obj.insert(k.clone(), v.clone());
                    }
                    true
                }
                None => false,
            }
        };
        if patched {
            self.changed(collection);
        }
        patched
    }

    /// Merge a session payload into the handle; returns the resulting phase
    ///
    /// Absent fields keep their previous values.
    pub(crate) async fn apply_session(&self, data: &Value) -> Phase {
        let phase = {
            let mut state = self.state.write().await;
            let session = &mut state.session;
            if let Some(id) = string_field(data, "session_id") {
                session.id = Some(id);
            }
            if let Some(stage) = data.get("stage").and_then(Value::as_str) {
                session.set_stage(stage);
            }
            if let Some(step) = data.get("step").and_then(Value::as_u64) {
                session.step = Some(step);
            }
            if let Some(max) = data.get("max_steps").and_then(Value::as_u64) {
                session.max_steps = Some(max);
            }
            for (name, slot) in [
                ("cells", &mut session.cells),
                ("map_size", &mut session.map_size),
                ("map_pattern", &mut session.map_pattern),
            ] {
                if let Some(v) = data.get(name).filter(|v| !v.is_null()) {
                    *slot = Some(v.clone());
                }
            }
            if let Some(t) = data.get("time_to_next_stage") {
                session.time_to_next_stage = t.as_f64().map(|s| s.max(0.0));
            }
            session.phase
        };
        self.changed(Collection::Session);
        phase
    }

    /// Apply a time-to-next-stage payload; returns the resulting phase
    pub(crate) async fn apply_time(&self, data: &Value) -> Phase {
        let phase = {
            let mut state = self.state.write().await;
            let session = &mut state.session;
            if let Some(t) = data.get("time_to_next_stage") {
                session.time_to_next_stage = t.as_f64().map(|s| s.max(0.0));
            }
            if let Some(step) = data.get("step").and_then(Value::as_u64) {
                session.step = Some(step);
            }
            if let Some(max) = data.get("max_steps").and_then(Value::as_u64) {
                session.max_steps = Some(max);
            }
            if let Some(stage) = data.get("stage_now").and_then(Value::as_str) {
                session.set_stage(stage);
            }
            session.phase
        };
        self.changed(Collection::Session);
        phase
    }

    /// Set or clear the current event
    ///
    /// Null, empty objects and events without an `id` clear it.
    pub(crate) async fn set_event(&self, event: Option<Value>) {
        let event = event.filter(|e| e.get("id").is_some_and(|id| !id.is_null()));
        self.state.write().await.event = event;
        self.changed(Collection::Event);
    }

    /// Store winners from a leaders payload
    pub(crate) async fn set_winners(&self, data: &Value) {
        let winners = json!({
            "capital": data.get("capital").cloned().unwrap_or(Value::Null),
            "reputation": data.get("reputation").cloned().unwrap_or(Value::Null),
            "economic": data.get("economic").cloned().unwrap_or(Value::Null),
        });
        self.state.write().await.winners = Some(winners);
        self.changed(Collection::Winners);
    }

    pub(crate) async fn push_upgrade(&self, upgrade: Value) {
        push_capped(
            &mut self.state.write().await.recent_upgrades,
            upgrade,
            RECENT_UPGRADES_CAP,
        );
        self.changed(Collection::RecentUpgrades);
    }

    pub(crate) async fn push_exchange_activity(&self, activity: Value) {
        push_capped(
            &mut self.state.write().await.exchange_activity,
            activity,
            EXCHANGE_ACTIVITY_CAP,
        );
        self.changed(Collection::ExchangeActivity);
    }

    pub(crate) async fn add_product_sale(&self, resource: String, amount: f64) {
        *self
            .state
            .write()
            .await
            .product_sales
            .entry(resource)
            .or_insert(0.0) += amount;
        self.changed(Collection::ProductSales);
    }

    /// Patch one item's price, appending an entry for unknown items
    pub(crate) async fn set_item_price(&self, item_id: &Value, price: Value) {
        {
            let mut state = self.state.write().await;
            let existing = state.prices.iter_mut().find(|p| {
                p.get("id") == Some(item_id) || p.get("item_id") == Some(item_id)
            });
            match existing.and_then(Value::as_object_mut) {
                Some(obj) => {
                    obj.insert("price".into(), price);
                }
                None => state.prices.push(json!({ "id": item_id, "price": price })),
            }
        }
        self.changed(Collection::Prices);
    }

    /// Update connection flags; emits only when they change
    pub(crate) async fn set_connection(&self, connected: bool, connecting: bool) {
        {
            let mut state = self.state.write().await;
            if state.connected == connected && state.connecting == connecting {
                return;
            }
            state.connected = connected;
            state.connecting = connecting;
        }
        self.emit(SyncEvent::ConnectionChanged {
            connected,
            connecting,
        });
    }

    /// Record the last error, or clear it
    pub(crate) async fn set_error(&self, error: Option<String>) {
        self.state.write().await.last_error = error.clone();
        if let Some(message) = error {
            self.emit(SyncEvent::Error(message));
        }
    }

    /// Clear the session and every collection; status flags survive
    pub(crate) async fn reset(&self) {
        {
            let mut state = self.state.write().await;
            let (connected, connecting, last_error) =
                (state.connected, state.connecting, state.last_error.take());
            *state = CacheState {
                connected,
                connecting,
                last_error,
                ..CacheState::default()
            };
        }
        for collection in Collection::ALL {
            self.changed(collection);
        }
    }
}
