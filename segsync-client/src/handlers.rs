//! Response handlers
//!
//! One handler per [`RequestKind`]. A handler validates the response payload,
//! writes it into the [`LocalCache`], and returns the value delivered to the
//! request's continuation. Follow-up traffic (session initialization after a
//! join, refreshes after a sale) is the client's business, not the handler's.

use crate::cache::{Collection, LocalCache};
use segsync_core::{Error, Phase, RequestKind, Result};
use serde_json::{json, Map, Value};

/// What a handler produced
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    /// Value for the continuation
    pub value: Value,
    /// Phase after the write, when the session handle was touched
    pub phase: Option<Phase>,
}

impl Handled {
    fn value(value: Value) -> Self {
        Self { value, phase: None }
    }

    fn session(value: Value, phase: Phase) -> Self {
        Self {
            value,
            phase: Some(phase),
        }
    }
}

/// Apply a successful response to the cache
///
/// `fields` are the fields the request was sent with. A response without
/// `data` is a `MalformedResponse` except for kinds whose empty answer has a
/// meaning of its own (no current event, bare ping).
pub async fn apply(
    cache: &LocalCache,
    kind: &RequestKind,
    data: Option<Value>,
    fields: &Map<String, Value>,
) -> Result<Handled> {
    match kind {
        RequestKind::JoinSession | RequestKind::Session => {
            let mut data = require_object(kind, data, "Session not found")?;
            // Only a join may establish the session handle.
            if *kind == RequestKind::JoinSession && !data.contains_key("session_id") {
                if let Some(id) = fields.get("session_id") {
                    data.insert("session_id".into(), id.clone());
                }
            }
            let data = Value::Object(data);
            let phase = cache.apply_session(&data).await;
            Ok(Handled::session(data, phase))
        }
        RequestKind::CheckSession => {
            let data = require_object(kind, data, "Session not found")?;
            Ok(Handled::value(Value::Object(data)))
        }
        RequestKind::TimeToNextStage => {
            let data = require(kind, data, "No time data")?;
            let phase = cache.apply_time(&data).await;
            Ok(Handled::session(data, phase))
        }
        RequestKind::SessionEvent => {
            let event = data
                .and_then(|d| d.get("event").cloned())
                .filter(|e| e.get("id").is_some_and(|id| !id.is_null()));
            cache.set_event(event.clone()).await;
            Ok(Handled::value(event.unwrap_or(Value::Null)))
        }
        RequestKind::Sessions => replace_list(cache, kind, data, Collection::Sessions, "sessions").await,
        RequestKind::Companies => {
            replace_list(cache, kind, data, Collection::Companies, "companies").await
        }
        RequestKind::Users => replace_list(cache, kind, data, Collection::Users, "users").await,
        RequestKind::Factories => {
            replace_list(cache, kind, data, Collection::Factories, "factories").await
        }
        RequestKind::Exchanges => {
            replace_list(cache, kind, data, Collection::Exchanges, "exchanges").await
        }
        RequestKind::Cities => replace_list(cache, kind, data, Collection::Cities, "cities").await,
        RequestKind::Contracts => {
            replace_list(cache, kind, data, Collection::Contracts, "contracts").await
        }
        RequestKind::Statistics => {
            replace_list(cache, kind, data, Collection::Statistics, "statistics").await
        }
        RequestKind::ItemPrices => {
            let data = require(kind, data, "No item prices data")?;
            let prices = price_entries(&data).ok_or_else(|| Error::malformed(kind, "No item prices data"))?;
            cache.replace(Collection::Prices, prices.clone()).await;
            Ok(Handled::value(Value::Array(prices)))
        }
        RequestKind::Company => {
            let data = require_object(kind, data, "No company data")?;
            let entity = Value::Object(data);
            cache.upsert(Collection::Companies, entity.clone()).await;
            Ok(Handled::value(entity))
        }
        RequestKind::City => {
            let data = require_object(kind, data, "No city data")?;
            let entity = Value::Object(data);
            cache.upsert(Collection::Cities, entity.clone()).await;
            Ok(Handled::value(entity))
        }
        RequestKind::CityDemands => {
            let data = require_object(kind, data, "No city demands data")?;
            if let Some(city_id) = data.get("city_id").or_else(|| fields.get("city_id")) {
                let mut patch = Map::new();
                for name in ["demands", "branch"] {
                    if let Some(v) = data.get(name) {
                        patch.insert(name.into(), v.clone());
                    }
                }
                if !cache.patch(Collection::Cities, city_id, &patch).await {
                    tracing::debug!(%city_id, "demands for a city not in the cache");
                }
            }
            Ok(Handled::value(Value::Object(data)))
        }
        RequestKind::Leaders => {
            let data = require_object(kind, data, "Invalid leaders data")?;
            let data = Value::Object(data);
            cache.set_winners(&data).await;
            Ok(Handled::value(data))
        }
        RequestKind::Ping => Ok(Handled::value(data.unwrap_or(Value::Null))),
        RequestKind::SellToCity | RequestKind::Custom(_) => {
            let data = require(kind, data, "No data in response")?;
            Ok(Handled::value(data))
        }
    }
}

fn require(kind: &RequestKind, data: Option<Value>, reason: &str) -> Result<Value> {
    data.filter(|d| !d.is_null())
        .ok_or_else(|| Error::malformed(kind, reason))
}

fn require_object(kind: &RequestKind, data: Option<Value>, reason: &str) -> Result<Map<String, Value>> {
    match data {
        Some(Value::Object(obj)) => Ok(obj),
        _ => Err(Error::malformed(kind, reason)),
    }
}

/// A bare array, or an object wrapping one under `name`
fn list_payload(data: Value, name: &str) -> Option<Vec<Value>> {
    match data {
        Value::Array(items) => Some(items),
        Value::Object(mut obj) => match obj.remove(name) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

async fn replace_list(
    cache: &LocalCache,
    kind: &RequestKind,
    data: Option<Value>,
    collection: Collection,
    name: &str,
) -> Result<Handled> {
    let data = require(kind, data, &format!("No {} data", name))?;
    let items = list_payload(data, name)
        .ok_or_else(|| Error::malformed(kind, format!("expected a {} array", name)))?;
    cache.replace(collection, items.clone()).await;
    Ok(Handled::value(Value::Array(items)))
}

/// Normalize the three price payload shapes into a list of entries
///
/// `[..]` and `{prices: [..]}` pass through; `{prices: {id: price}}` becomes
/// `[{id, price}]`.
fn price_entries(data: &Value) -> Option<Vec<Value>> {
    match data {
        Value::Array(items) => Some(items.clone()),
        Value::Object(obj) => match obj.get("prices")? {
            Value::Array(items) => Some(items.clone()),
            Value::Object(map) => Some(
                map.iter()
                    .map(|(id, price)| json!({ "id": id, "price": price }))
                    .collect(),
            ),
            _ => None,
        },
        _ => None,
    }
}
