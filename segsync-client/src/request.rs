//! Request tracking and correlation
//!
//! Every outgoing request gets an identifier of the form
//! `{tag}_{unix_millis}_{suffix}` where `tag` names the request kind and the
//! suffix is nine random base-36 characters. The identifier is for humans and
//! server logs; routing uses the side table kept here, which records the
//! [`RequestKind`] of each in-flight identifier at send time.
//!
//! # Lifecycle of a request
//!
//! 1. `send` checks that a channel is attached, else fails with
//!    `ChannelNotOpen` and hands the failure to the continuation
//! 2. an identifier is drawn and the pending entry registered
//! 3. the encoded frame is queued on the outbound channel
//! 4. the receive task calls `take` when the response arrives and runs the
//!    kind's handler, then the continuation
//!
//! When the channel closes, `abandon_all` drops every pending entry without
//! invoking its continuation. Callers awaiting through a oneshot see the
//! sender dropped.

use segsync_core::{codec, Error, RequestFrame, RequestId, RequestKind, Result, Source};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// Callback receiving the outcome of one request
pub type Continuation = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

const SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A request waiting for its response
pub struct PendingRequest {
    pub kind: RequestKind,
    pub source: Source,
    pub issued_at: Instant,
    /// Fields sent with the request, kept for handlers that need them
    pub fields: Map<String, Value>,
    pub continuation: Option<Continuation>,
}

impl PendingRequest {
    /// Deliver the outcome, if anyone is listening
    pub fn complete(self, outcome: Result<Value>) {
        if let Some(continuation) = self.continuation {
            continuation(outcome);
        }
    }
}

/// Draws identifiers that never repeat within the process
#[derive(Default)]
struct IdGenerator {
    millis: u64,
    used: HashSet<String>,
}

impl IdGenerator {
    fn next(&mut self, tag: &str) -> RequestId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        // Clamp so a clock step backwards cannot revisit an old millisecond.
        if now > self.millis {
            self.millis = now;
            self.used.clear();
        }

        loop {
            let suffix = random_suffix();
            if self.used.insert(suffix.clone()) {
                return RequestId::new(format!("{}_{}_{}", tag, self.millis, suffix));
            }
        }
    }
}

fn random_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// Correlates outgoing requests with incoming responses
#[derive(Clone, Default)]
pub struct RequestManager {
    pending: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    ids: Arc<Mutex<IdGenerator>>,
}

impl RequestManager {
    /// Create a manager with no channel attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the outbound queue of a freshly opened channel
    pub async fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        *self.outbound.lock().await = Some(tx);
    }

    /// Detach the outbound queue; the writer drains and closes the socket
    pub async fn detach(&self) {
        self.outbound.lock().await.take();
    }

    /// Whether a channel is attached
    pub async fn is_open(&self) -> bool {
        self.outbound
            .lock()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Draw a fresh identifier for a request kind
    pub async fn next_id(&self, kind: &RequestKind) -> RequestId {
        self.ids.lock().await.next(&kind.tag())
    }

    /// Send a request and register it for correlation
    ///
    /// Fails with `ChannelNotOpen` when no channel is attached; the
    /// continuation then receives the same error before this returns.
    pub async fn send(
        &self,
        kind: RequestKind,
        fields: Map<String, Value>,
        source: Source,
        continuation: Option<Continuation>,
    ) -> Result<RequestId> {
        // Held until the entry is registered, so `detach` followed by
        // `abandon_all` never misses a request queued on the old channel.
        let outbound = self.outbound.lock().await;
        let Some(tx) = outbound.as_ref().filter(|tx| !tx.is_closed()).cloned() else {
            drop(outbound);
            return fail(continuation, Error::ChannelNotOpen);
        };

        let id = self.next_id(&kind).await;
        let frame = RequestFrame {
            kind: kind.wire_type().to_string(),
            request_id: id.clone(),
            fields: fields.clone(),
        };
        let text = match codec::encode_request(&frame) {
            Ok(text) => text,
            Err(e) => {
                drop(outbound);
                return fail(continuation, e);
            }
        };

        // Register first so a fast response cannot miss the entry.
        self.pending.lock().await.insert(
            id.clone(),
            PendingRequest {
                kind,
                source,
                issued_at: Instant::now(),
                fields,
                continuation,
            },
        );

        let sent = tx.send(text).is_ok();
        drop(outbound);
        if !sent {
            let pending = self.pending.lock().await.remove(&id);
            if let Some(pending) = pending {
                pending.complete(Err(Error::ChannelNotOpen));
            }
            return Err(Error::ChannelNotOpen);
        }

        tracing::debug!(request_id = %id, source = source.as_str(), "request queued");
        Ok(id)
    }

    /// Remove and return the entry for a response
    pub async fn take(&self, id: &RequestId) -> Option<PendingRequest> {
        self.pending.lock().await.remove(id)
    }

    /// Drop every pending entry without invoking continuations
    ///
    /// Returns how many were abandoned.
    pub async fn abandon_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        count
    }

    /// Number of requests waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn fail(continuation: Option<Continuation>, error: Error) -> Result<RequestId> {
    if let Some(continuation) = continuation {
        continuation(Err(error.clone()));
    }
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn counting_continuation(counter: &Arc<AtomicUsize>) -> Continuation {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_ids_are_distinct_and_tagged() {
        let manager = RequestManager::new();
        let mut seen = HashSet::new();
        for _ in 0..5000 {
            let id = manager.next_id(&RequestKind::Companies).await;
            assert!(id.as_str().starts_with("get_companies_"));
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn test_id_format() {
        let manager = RequestManager::new();
        let id = manager.next_id(&RequestKind::SessionEvent).await;
        let rest = id.as_str().strip_prefix("get_session_event_").unwrap();
        let (millis, suffix) = rest.split_once('_').unwrap();
        assert!(millis.parse::<u64>().is_ok());
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| BASE36.contains(&b)));
    }

    #[tokio::test]
    async fn test_send_without_channel_fails_synchronously() {
        let manager = RequestManager::new();
        let seen: Arc<StdMutex<Option<Result<Value>>>> = Arc::new(StdMutex::new(None));
        let seen_clone = Arc::clone(&seen);

        let result = manager
            .send(
                RequestKind::Companies,
                Map::new(),
                Source::Manual,
                Some(Box::new(move |outcome| {
                    *seen_clone.lock().unwrap() = Some(outcome);
                })),
            )
            .await;

        assert_eq!(result, Err(Error::ChannelNotOpen));
        assert_eq!(
            seen.lock().unwrap().take(),
            Some(Err(Error::ChannelNotOpen))
        );
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_writes_frame_and_registers() {
        let manager = RequestManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.attach(tx).await;

        let mut fields = Map::new();
        fields.insert("company_id".into(), serde_json::json!(3));
        let id = manager
            .send(RequestKind::Factories, fields, Source::Polling, None)
            .await
            .unwrap();

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "get-factories");
        assert_eq!(frame["request_id"], id.as_str());
        assert_eq!(frame["company_id"], 3);

        let pending = manager.take(&id).await.unwrap();
        assert_eq!(pending.kind, RequestKind::Factories);
        assert_eq!(pending.source, Source::Polling);
        assert!(manager.take(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_id_does_not_disturb_pending() {
        let manager = RequestManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.attach(tx).await;

        manager
            .send(RequestKind::Users, Map::new(), Source::Manual, None)
            .await
            .unwrap();
        assert!(manager.take(&RequestId::from("get_users_0_zzzzzzzzz")).await.is_none());
        assert_eq!(manager.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_abandon_all_never_invokes_continuations() {
        let manager = RequestManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.attach(tx).await;

        let invoked = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            manager
                .send(
                    RequestKind::Cities,
                    Map::new(),
                    Source::Manual,
                    Some(counting_continuation(&invoked)),
                )
                .await
                .unwrap();
        }

        assert_eq!(manager.abandon_all().await, 3);
        assert_eq!(manager.pending_count().await, 0);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_never_strands_a_pending_entry() {
        for _ in 0..50 {
            let manager = RequestManager::new();
            let (tx, _rx) = mpsc::unbounded_channel();
            manager.attach(tx).await;

            let senders: Vec<_> = (0..8)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        for _ in 0..20 {
                            let _ = manager
                                .send(RequestKind::Users, Map::new(), Source::Polling, None)
                                .await;
                        }
                    })
                })
                .collect();

            tokio::task::yield_now().await;
            manager.detach().await;
            manager.abandon_all().await;

            for sender in senders {
                sender.await.unwrap();
            }
            assert_eq!(manager.pending_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_detach_closes_channel() {
        let manager = RequestManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.attach(tx).await;
        assert!(manager.is_open().await);

        manager.detach().await;
        assert!(!manager.is_open().await);
        assert!(rx.recv().await.is_none());

        let result = manager
            .send(RequestKind::Ping, Map::new(), Source::Manual, None)
            .await;
        assert_eq!(result, Err(Error::ChannelNotOpen));
    }

    #[tokio::test]
    async fn test_closed_receiver_counts_as_not_open() {
        let manager = RequestManager::new();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        manager.attach(tx).await;
        drop(rx);

        let invoked = Arc::new(AtomicUsize::new(0));
        let result = manager
            .send(
                RequestKind::Ping,
                Map::new(),
                Source::Manual,
                Some(counting_continuation(&invoked)),
            )
            .await;
        assert_eq!(result, Err(Error::ChannelNotOpen));
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }
}
