//! Request statistics and OpenTelemetry instruments
//!
//! [`RequestStats`] is always kept and answers "how much traffic is this
//! client generating, and why". It counts requests by wire type and by
//! source, plus notifications that were coalesced by debouncing.
//!
//! [`ClientMetrics`] mirrors the same events into OTel instruments when the
//! builder enables observability:
//!
//! - **connection_state**: 0=disconnected, 1=connecting, 2=open, 3=closing (gauge)
//! - **requests_total**: requests sent, by `type` and `source` (counter)
//! - **response_latency**: seconds from send to response (histogram)
//! - **errors_total**: errors by `error_type` (counter)
//! - **reconnection_attempts** / **reconnection_success** (counters)
//! - **pushes_received**: push notifications by `topic` (counter)
//! - **debounced_total**: notifications absorbed by debouncing (counter)

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};
use segsync_core::Source;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Point-in-time view of request statistics
#[derive(Debug, Clone, PartialEq)]
pub struct RequestStats {
    /// Requests sent since the last reset
    pub total: u64,
    /// Requests by wire type
    pub by_type: BTreeMap<String, u64>,
    /// Requests by source (`manual`, `polling`, `broadcast`)
    pub by_source: BTreeMap<&'static str, u64>,
    /// Notifications coalesced into an already-pending refresh
    pub debounced: u64,
    /// Time since the last reset
    pub elapsed: Duration,
}

impl RequestStats {
    /// Average requests per minute since the last reset
    pub fn per_minute(&self) -> f64 {
        let minutes = self.elapsed.as_secs_f64() / 60.0;
        if minutes > 0.0 {
            self.total as f64 / minutes
        } else {
            0.0
        }
    }

    /// Requests attributed to one source
    pub fn from_source(&self, source: Source) -> u64 {
        self.by_source.get(source.as_str()).copied().unwrap_or(0)
    }
}

struct Counts {
    total: u64,
    by_type: BTreeMap<String, u64>,
    by_source: BTreeMap<&'static str, u64>,
    debounced: u64,
    since: Instant,
}

impl Counts {
    fn new() -> Self {
        Self {
            total: 0,
            by_type: BTreeMap::new(),
            by_source: BTreeMap::new(),
            debounced: 0,
            since: Instant::now(),
        }
    }
}

/// Accumulates [`RequestStats`]
#[derive(Clone)]
pub struct RequestCounter {
    counts: Arc<Mutex<Counts>>,
}

impl Default for RequestCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCounter {
    /// Start counting from now
    pub fn new() -> Self {
        Self {
            counts: Arc::new(Mutex::new(Counts::new())),
        }
    }

    /// Count one sent request
    pub async fn record_request(&self, wire_type: &str, source: Source) {
        let mut counts = self.counts.lock().await;
        counts.total += 1;
        *counts.by_type.entry(wire_type.to_string()).or_insert(0) += 1;
        *counts.by_source.entry(source.as_str()).or_insert(0) += 1;
    }

    /// Count one coalesced notification
    pub async fn record_debounced(&self) {
        self.counts.lock().await.debounced += 1;
    }

    /// Current statistics
    pub async fn snapshot(&self) -> RequestStats {
        let counts = self.counts.lock().await;
        RequestStats {
            total: counts.total,
            by_type: counts.by_type.clone(),
            by_source: counts.by_source.clone(),
            debounced: counts.debounced,
            elapsed: counts.since.elapsed(),
        }
    }

    /// Zero every counter and restart the clock
    pub async fn reset(&self) {
        *self.counts.lock().await = Counts::new();
    }
}

/// OpenTelemetry instruments for the client
pub struct ClientMetrics {
    pub connection_state: Gauge<i64>,
    pub requests_total: Counter<u64>,
    pub response_latency: Histogram<f64>,
    pub errors_total: Counter<u64>,
    pub reconnection_attempts: Counter<u64>,
    pub reconnection_success: Counter<u64>,
    pub pushes_received: Counter<u64>,
    pub debounced_total: Counter<u64>,
}

impl ClientMetrics {
    /// Instruments on the global meter provider
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    /// Instruments on a specific meter
    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connection_state: meter
                .i64_gauge("segsync.client.connection.state")
                .with_description("Connection state (0=disconnected, 1=connecting, 2=open, 3=closing)")
                .build(),
            requests_total: meter
                .u64_counter("segsync.client.requests.total")
                .with_description("Requests sent, by type and source")
                .build(),
            response_latency: meter
                .f64_histogram("segsync.client.response.latency")
                .with_description("Seconds from request send to response")
                .build(),
            errors_total: meter
                .u64_counter("segsync.client.errors.total")
                .with_description("Errors encountered, by type")
                .build(),
            reconnection_attempts: meter
                .u64_counter("segsync.client.reconnection.attempts")
                .with_description("Reconnect attempts")
                .build(),
            reconnection_success: meter
                .u64_counter("segsync.client.reconnection.success")
                .with_description("Reconnect attempts that opened a channel")
                .build(),
            pushes_received: meter
                .u64_counter("segsync.client.pushes.received")
                .with_description("Push notifications received, by topic")
                .build(),
            debounced_total: meter
                .u64_counter("segsync.client.debounced.total")
                .with_description("Notifications coalesced by debouncing")
                .build(),
        }
    }

    pub fn update_connection_state(&self, code: i64) {
        self.connection_state.record(code, &[]);
    }

    pub fn record_request(&self, wire_type: &str, source: Source) {
        self.requests_total.add(
            1,
            &[
                KeyValue::new("type", wire_type.to_string()),
                KeyValue::new("source", source.as_str()),
            ],
        );
    }

    pub fn record_response(&self, wire_type: &str, status: &'static str, latency: Duration) {
        self.response_latency.record(
            latency.as_secs_f64(),
            &[
                KeyValue::new("type", wire_type.to_string()),
                KeyValue::new("status", status),
            ],
        );
    }

    pub fn record_error(&self, error_type: &'static str) {
        self.errors_total
            .add(1, &[KeyValue::new("error_type", error_type)]);
    }

    pub fn record_reconnection_attempt(&self) {
        self.reconnection_attempts.add(1, &[]);
    }

    pub fn record_reconnection_success(&self) {
        self.reconnection_success.add(1, &[]);
    }

    pub fn record_push(&self, topic: &str) {
        self.pushes_received
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }

    pub fn record_debounced(&self) {
        self.debounced_total.add(1, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    #[tokio::test]
    async fn test_counter_by_type_and_source() {
        let counter = RequestCounter::new();
        counter.record_request("get-companies", Source::Polling).await;
        counter.record_request("get-companies", Source::Broadcast).await;
        counter.record_request("get-users", Source::Polling).await;
        counter.record_debounced().await;
        counter.record_debounced().await;

        let stats = counter.snapshot().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type.get("get-companies"), Some(&2));
        assert_eq!(stats.by_type.get("get-users"), Some(&1));
        assert_eq!(stats.from_source(Source::Polling), 2);
        assert_eq!(stats.from_source(Source::Broadcast), 1);
        assert_eq!(stats.from_source(Source::Manual), 0);
        assert_eq!(stats.debounced, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_minute_rate() {
        let counter = RequestCounter::new();
        for _ in 0..30 {
            counter.record_request("ping", Source::Manual).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let stats = counter.snapshot().await;
        assert_eq!(stats.elapsed, Duration::from_secs(30));
        assert!((stats.per_minute() - 60.0).abs() < 1e-9);

        counter.reset().await;
        let stats = counter.snapshot().await;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.per_minute(), 0.0);
    }

    #[test]
    fn test_instruments_record() {
        let provider = SdkMeterProvider::builder().build();
        let meter = provider.meter("segsync-test");
        let metrics = ClientMetrics::new_with_meter(&meter);

        metrics.update_connection_state(2);
        metrics.record_request("get-cities", Source::Polling);
        metrics.record_response("get-cities", "ok", Duration::from_millis(12));
        metrics.record_error("server");
        metrics.record_reconnection_attempt();
        metrics.record_reconnection_success();
        metrics.record_push("api-city-trade");
        metrics.record_debounced();
    }

    #[test]
    fn test_global_meter() {
        let metrics = ClientMetrics::new("segsync-global-test");
        metrics.update_connection_state(0);
        metrics.record_push("api-game_ended");
    }
}
