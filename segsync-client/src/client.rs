//! The synchronization client
//!
//! [`SyncClient`] owns one WebSocket channel to the game server and keeps a
//! [`LocalCache`] in step with it. Four mechanisms cooperate:
//!
//! - **Correlation**: every request carries a fresh `request_id`; the
//!   response is routed by the request kind recorded at send time.
//! - **Lifecycle**: a supervisor task opens the channel, reconnects after
//!   unexpected closes, and resumes the stored session on every open.
//! - **Polling**: once a session is joined, a full-refresh batch runs on a
//!   timer whose period follows the session phase.
//! - **Pushes**: server notifications are routed to debounced refetches,
//!   immediate refetches or inline cache writes.
//!
//! # Client Lifecycle
//!
//! 1. **Connect**: `connect()` spawns the supervisor and waits for the first
//!    attempt
//! 2. **Join**: `join_session()` (or the stored token, on open) starts
//!    polling
//! 3. **Observe**: `subscribe()` for change events, `snapshot()` for data
//! 4. **Disconnect**: `disconnect()` closes the channel and suppresses
//!    reconnection until the next `connect()`; `dispose()` makes the client
//!    inert
//!
//! # Cloning
//!
//! `SyncClient` is cheaply cloneable using `Arc` internally. All clones
//! share the same connection, cache and timers.
//!
//! # Ordering
//!
//! Inbound frames are handled one at a time on the connection's receive
//! task, so handlers and continuations never run concurrently with each
//! other. Responses may arrive in any order; cache writes are
//! last-write-wins by arrival.
//!
//! Closing the channel abandons pending requests without invoking their
//! continuations. There is no per-request timeout.

use crate::cache::{CacheState, LocalCache, SyncEvent};
use crate::connection_state::{ConnectionManager, ConnectionState};
use crate::handlers::{self, Handled};
use crate::metrics::{ClientMetrics, RequestCounter, RequestStats};
use crate::notification::{self, Action, Debouncer, Inline, Refresh};
use crate::reconnect::ReconnectionStrategy;
use crate::request::{Continuation, RequestManager};
use crate::scheduler::{PollIntervals, PollScheduler};
use crate::storage::SessionStore;
use futures::{SinkExt, StreamExt};
use segsync_core::{
    codec, Error, InboundFrame, Phase, PushFrame, RequestId, RequestKind, ResponseFrame, Result,
    Source,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Collections fetched by one polling batch, in issue order
const FULL_REFRESH: [Refresh; 8] = [
    Refresh::Session,
    Refresh::TimeToNextStage,
    Refresh::Event,
    Refresh::Companies,
    Refresh::Users,
    Refresh::Cities,
    Refresh::Exchanges,
    Refresh::Prices,
];

/// How long a closing channel gets to flush queued frames
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Game-state synchronization client
#[derive(Clone)]
pub struct SyncClient {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    cache: LocalCache,
    requests: RequestManager,
    connection: ConnectionManager,
    scheduler: PollScheduler,
    debouncer: Debouncer,
    /// Set by a terminal-phase push; cleared by the next successful join
    terminal: AtomicBool,
    disposed: AtomicBool,
    counter: RequestCounter,
    metrics: Option<Arc<ClientMetrics>>,
    store: Arc<dyn SessionStore>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub(crate) fn new(
        url: String,
        strategy: Box<dyn ReconnectionStrategy>,
        debounce_window: Duration,
        intervals: PollIntervals,
        store: Arc<dyn SessionStore>,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let poll_target = weak.clone();
            let scheduler = PollScheduler::new(intervals, move || {
                let target = poll_target.clone();
                async move {
                    if let Some(inner) = target.upgrade() {
                        inner.poll_batch().await;
                    }
                }
            });

            let fire_target = weak.clone();
            let debouncer = Debouncer::new(debounce_window, move |refresh| {
                let target = fire_target.clone();
                async move {
                    if let Some(inner) = target.upgrade() {
                        inner.refetch(refresh).await;
                    }
                }
            });

            Inner {
                cache: LocalCache::new(),
                requests: RequestManager::new(),
                connection: ConnectionManager::new(url, strategy),
                scheduler,
                debouncer,
                terminal: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                counter: RequestCounter::new(),
                metrics,
                store,
                shutdown,
                supervisor: Mutex::new(None),
            }
        });

        Self { inner }
    }

    /// Connection URL, including the `client_id` parameter
    pub fn url(&self) -> &str {
        self.inner.connection.url()
    }

    /// Open the channel
    ///
    /// Returns the outcome of the first attempt. After a failed attempt the
    /// client keeps retrying under its reconnect strategy until
    /// [`disconnect`](Self::disconnect). Calling this while already
    /// connected or reconnecting is a no-op.
    #[tracing::instrument(skip(self), fields(url = %self.url()))]
    pub async fn connect(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Internal("client has been disposed".into()));
        }

        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("already connected or connecting");
            return Ok(());
        }

        self.inner.connection.begin();
        self.inner.shutdown.send_replace(false);

        let (first_tx, first_rx) = oneshot::channel();
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.inner), first_tx)));
        drop(supervisor);

        first_rx.await.unwrap_or(Err(Error::TransportClosed))
    }

    /// Close the channel and suppress reconnection
    ///
    /// Stops polling, cancels debounce timers and abandons pending requests.
    /// Returns once the channel is closed.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.connection.closing().await;
        if let Some(m) = &inner.metrics {
            m.update_connection_state(ConnectionState::Closing.code());
        }
        inner.scheduler.stop().await;
        inner.debouncer.cancel_all().await;
        inner.shutdown.send_replace(true);

        let handle = inner.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "connection supervisor ended abnormally");
            }
        }
        inner.connection.closed().await;
        inner.publish_connection(false, false).await;
        tracing::info!("disconnected");
    }

    /// Disconnect and refuse further use
    pub async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.disconnect().await;
    }

    /// Current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state().await
    }

    /// Whether the channel is open
    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Open
    }

    /// The local cache
    pub fn cache(&self) -> &LocalCache {
        &self.inner.cache
    }

    /// Clone of everything cached
    pub async fn snapshot(&self) -> CacheState {
        self.inner.cache.snapshot().await
    }

    /// Receive change events, pushes and connection changes
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.inner.cache.subscribe()
    }

    /// Request statistics since creation or the last reset
    pub async fn request_stats(&self) -> RequestStats {
        self.inner.counter.snapshot().await
    }

    /// Zero the request statistics
    pub async fn reset_request_stats(&self) {
        self.inner.counter.reset().await
    }

    /// Whether a terminal-phase notification is suppressing background traffic
    pub fn is_terminal(&self) -> bool {
        self.inner.terminal.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response
    pub async fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count().await
    }

    /// Send a request; the continuation receives the outcome
    ///
    /// Fails synchronously with `ChannelNotOpen` when disconnected, or
    /// `NoActiveSession` for session-scoped kinds without a session. The
    /// continuation sees the same failure before this returns.
    #[tracing::instrument(skip(self, payload, continuation), fields(kind = %kind))]
    pub async fn send(
        &self,
        kind: RequestKind,
        payload: Map<String, Value>,
        continuation: Option<Continuation>,
    ) -> Result<RequestId> {
        self.inner
            .issue(kind, payload, Source::Manual, continuation)
            .await?
            .ok_or_else(|| Error::Internal("manual request suppressed".into()))
    }

    /// Send a request and wait for its outcome
    ///
    /// Resolves with `TransportClosed` if the channel closes first.
    pub async fn request(&self, kind: RequestKind, payload: Map<String, Value>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send(
            kind,
            payload,
            Some(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })),
        )
        .await?;
        rx.await.unwrap_or(Err(Error::TransportClosed))
    }

    /// Join a session by token
    ///
    /// On success the token is persisted and polling starts.
    #[tracing::instrument(skip(self, token))]
    pub async fn join_session(&self, token: impl Into<String>) -> Result<Value> {
        self.request(RequestKind::JoinSession, session_fields(token.into()))
            .await
    }

    /// Look up a session without joining it
    pub async fn check_session(&self, token: impl Into<String>) -> Result<Value> {
        self.request(RequestKind::CheckSession, session_fields(token.into()))
            .await
    }

    /// Forget the current session
    ///
    /// Stops polling, clears every cached collection and erases the stored
    /// token.
    #[tracing::instrument(skip(self))]
    pub async fn leave_session(&self) -> Result<()> {
        self.inner.leave_session().await
    }

    pub async fn get_session(&self) -> Result<Value> {
        self.request(RequestKind::Session, Map::new()).await
    }

    pub async fn get_sessions(&self) -> Result<Value> {
        self.request(RequestKind::Sessions, Map::new()).await
    }

    pub async fn get_session_event(&self) -> Result<Value> {
        self.request(RequestKind::SessionEvent, Map::new()).await
    }

    pub async fn get_time_to_next_stage(&self) -> Result<Value> {
        self.request(RequestKind::TimeToNextStage, Map::new()).await
    }

    pub async fn get_statistics(&self) -> Result<Value> {
        self.request(RequestKind::Statistics, Map::new()).await
    }

    pub async fn get_leaders(&self) -> Result<Value> {
        self.request(RequestKind::Leaders, Map::new()).await
    }

    pub async fn get_companies(&self) -> Result<Value> {
        self.request(RequestKind::Companies, Map::new()).await
    }

    pub async fn get_company(&self, company_id: impl Into<Value>) -> Result<Value> {
        self.request(RequestKind::Company, one_field("id", company_id))
            .await
    }

    pub async fn get_users(&self) -> Result<Value> {
        self.request(RequestKind::Users, Map::new()).await
    }

    pub async fn get_factories(&self, company_id: impl Into<Value>) -> Result<Value> {
        self.request(RequestKind::Factories, one_field("company_id", company_id))
            .await
    }

    pub async fn get_exchanges(&self) -> Result<Value> {
        self.request(RequestKind::Exchanges, Map::new()).await
    }

    pub async fn get_item_prices(&self) -> Result<Value> {
        self.request(RequestKind::ItemPrices, Map::new()).await
    }

    pub async fn get_cities(&self) -> Result<Value> {
        self.request(RequestKind::Cities, Map::new()).await
    }

    pub async fn get_city(&self, city_id: impl Into<Value>) -> Result<Value> {
        self.request(RequestKind::City, one_field("id", city_id)).await
    }

    pub async fn get_city_demands(&self, city_id: impl Into<Value>) -> Result<Value> {
        self.request(RequestKind::CityDemands, one_field("city_id", city_id))
            .await
    }

    pub async fn get_contracts(&self) -> Result<Value> {
        self.request(RequestKind::Contracts, Map::new()).await
    }

    /// Sell goods to a city
    ///
    /// A successful sale refreshes companies and cities.
    pub async fn sell_to_city(
        &self,
        city_id: impl Into<Value>,
        company_id: impl Into<Value>,
        resource_id: impl Into<Value>,
        amount: u64,
        password: impl Into<String>,
    ) -> Result<Value> {
        let mut fields = Map::new();
        fields.insert("city_id".into(), city_id.into());
        fields.insert("company_id".into(), company_id.into());
        fields.insert("resource_id".into(), resource_id.into());
        fields.insert("amount".into(), amount.into());
        fields.insert("password".into(), Value::String(password.into()));
        self.request(RequestKind::SellToCity, fields).await
    }

    /// Liveness check; the reply is logged only
    pub async fn ping(&self) -> Result<RequestId> {
        self.send(RequestKind::Ping, Map::new(), None).await
    }
}

fn session_fields(token: String) -> Map<String, Value> {
    one_field("session_id", token)
}

fn one_field(name: &str, value: impl Into<Value>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(name.to_string(), value.into());
    fields
}

fn report(first: &mut Option<oneshot::Sender<Result<()>>>, outcome: Result<()>) {
    if let Some(tx) = first.take() {
        let _ = tx.send(outcome);
    }
}

/// Connect, run and reconnect until shut down or the strategy gives up
async fn supervise(inner: Arc<Inner>, first: oneshot::Sender<Result<()>>) {
    let mut first = Some(first);
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }

        inner.connection.connecting().await;
        inner.publish_connection(false, true).await;
        tracing::info!(url = %inner.connection.url(), "connecting");

        let attempt = tokio::select! {
            attempt = connect_async(inner.connection.url()) => attempt,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok((ws, _)) => {
                report(&mut first, Ok(()));
                inner.run_channel(ws, &mut shutdown).await;
            }
            Err(e) => {
                let error = Error::WebSocket(e.to_string());
                tracing::warn!(error = %error, "connection attempt failed");
                if let Some(m) = &inner.metrics {
                    m.record_error("connect");
                }
                inner.cache.set_error(Some(error.to_string())).await;
                report(&mut first, Err(error));
            }
        }

        inner.connection.closed().await;
        inner.publish_connection(false, false).await;

        if inner.connection.is_manual() || *shutdown.borrow() {
            break;
        }

        match inner.connection.next_reconnect_delay().await {
            Some(delay) => {
                tracing::info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = inner.connection.attempts(),
                    "reconnecting"
                );
                if let Some(m) = &inner.metrics {
                    m.record_reconnection_attempt();
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
            None => {
                tracing::error!("reconnection abandoned");
                inner
                    .cache
                    .set_error(Some("Reconnection abandoned".to_string()))
                    .await;
                break;
            }
        }
    }

    inner.connection.closed().await;
    inner.publish_connection(false, false).await;
}

impl Inner {
    async fn publish_connection(&self, connected: bool, connecting: bool) {
        self.cache.set_connection(connected, connecting).await;
        if let Some(m) = &self.metrics {
            m.update_connection_state(self.connection.state().await.code());
        }
    }

    /// Drive one open channel until either side closes it
    async fn run_channel(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // Drains the outbound queue; closes the socket once the queue is detached.
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!(error = %e, "write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reconnected = self.connection.attempts() > 0;
        self.requests.attach(tx).await;
        self.connection.opened().await;
        self.publish_connection(true, false).await;
        if reconnected {
            if let Some(m) = &self.metrics {
                m.record_reconnection_success();
            }
        }
        tracing::info!("connected");

        self.on_open().await;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("connection closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let error = Error::WebSocket(e.to_string());
                        tracing::warn!(error = %error, "socket error");
                        if let Some(m) = &self.metrics {
                            m.record_error("websocket");
                        }
                        self.cache.set_error(Some(error.to_string())).await;
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    tracing::info!("closing connection");
                    break;
                }
            }
        }

        self.on_close().await;
        if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
            tracing::debug!("writer did not finish flushing before close");
        }
    }

    /// Clear the last error and resume the stored session, if any
    async fn on_open(&self) {
        self.cache.set_error(None).await;
        match self.store.load().await {
            Ok(Some(token)) => {
                tracing::info!(session_id = %token, "resuming stored session");
                if let Err(e) = self
                    .issue(
                        RequestKind::JoinSession,
                        session_fields(token),
                        Source::Manual,
                        None,
                    )
                    .await
                {
                    tracing::warn!(error = %e, "could not send resume request");
                }
            }
            Ok(None) => tracing::debug!("no stored session"),
            Err(e) => tracing::warn!(error = %e, "could not read stored session"),
        }
    }

    /// Tear down per-connection state
    ///
    /// Pending continuations are dropped, never invoked.
    async fn on_close(&self) {
        self.requests.detach().await;
        let abandoned = self.requests.abandon_all().await;
        if abandoned > 0 {
            tracing::debug!(abandoned, "pending requests abandoned");
        }
        self.scheduler.stop().await;
        self.debouncer.cancel_all().await;
    }

    /// Issue a request on behalf of some source
    ///
    /// Returns `Ok(None)` when a background request is suppressed by the
    /// terminal latch.
    async fn issue(
        &self,
        kind: RequestKind,
        mut fields: Map<String, Value>,
        source: Source,
        continuation: Option<Continuation>,
    ) -> Result<Option<RequestId>> {
        if source != Source::Manual && self.terminal.load(Ordering::SeqCst) {
            tracing::debug!(kind = %kind, source = source.as_str(), "suppressed after terminal phase");
            return Ok(None);
        }

        if kind.attaches_session() && !fields.contains_key("session_id") {
            match self.cache.session_id().await {
                Some(id) => {
                    fields.insert("session_id".into(), Value::String(id));
                }
                None if kind.requires_session() => {
                    if let Some(continuation) = continuation {
                        continuation(Err(Error::NoActiveSession));
                    }
                    return Err(Error::NoActiveSession);
                }
                None => {}
            }
        }

        let wire_type = kind.wire_type().to_string();
        match self.requests.send(kind, fields, source, continuation).await {
            Ok(id) => {
                self.counter.record_request(&wire_type, source).await;
                if let Some(m) = &self.metrics {
                    m.record_request(&wire_type, source);
                }
                Ok(Some(id))
            }
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.record_error("send");
                }
                if e == Error::ChannelNotOpen {
                    self.cache.set_error(Some(e.to_string())).await;
                }
                Err(e)
            }
        }
    }

    /// Background refetch; failures are logged only
    async fn refetch(&self, refresh: Refresh) {
        if let Err(e) = self
            .issue(refresh.kind(), refresh.fields(), Source::Broadcast, None)
            .await
        {
            tracing::debug!(key = %refresh.key(), error = %e, "refetch not sent");
        }
    }

    /// One polling batch; a no-op in the terminal phase
    async fn poll_batch(&self) {
        if self.terminal.load(Ordering::SeqCst) || self.cache.phase().await.is_terminal() {
            tracing::debug!("skipping poll in terminal phase");
            return;
        }
        for refresh in FULL_REFRESH {
            if let Err(e) = self
                .issue(refresh.kind(), refresh.fields(), Source::Polling, None)
                .await
            {
                tracing::debug!(key = %refresh.key(), error = %e, "poll request not sent");
            }
        }
    }

    /// Demultiplex one inbound text frame
    pub(crate) async fn handle_frame(&self, text: &str) {
        let frame = match codec::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame");
                return;
            }
        };

        match frame {
            InboundFrame::Response(response) => self.handle_response(response).await,
            InboundFrame::Push(push) => self.handle_push(push).await,
            InboundFrame::Error { message } => {
                let error = Error::Server(message);
                tracing::warn!(error = %error, "server error");
                if let Some(m) = &self.metrics {
                    m.record_error("server");
                }
                self.cache.set_error(Some(error.to_string())).await;
            }
            InboundFrame::Pong => tracing::debug!("pong"),
            InboundFrame::Other { kind } => tracing::debug!(?kind, "ignoring frame"),
        }
    }

    async fn handle_response(&self, response: ResponseFrame) {
        let Some(pending) = self.requests.take(&response.request_id).await else {
            tracing::debug!(request_id = %response.request_id, "response for unknown request");
            return;
        };

        let kind = pending.kind.clone();
        let current = self.cache.session_id().await;
        if sent_for_other_session(&pending.kind, &pending.fields, current.as_deref()) {
            tracing::debug!(request_id = %response.request_id, "response for a session no longer joined");
            if let Some(m) = &self.metrics {
                m.record_response(kind.wire_type(), "stale", pending.issued_at.elapsed());
            }
            pending.complete(Err(Error::NoActiveSession));
            return;
        }

        let phase_before = self.cache.phase().await;
        let outcome = match response.error {
            Some(message) => Err(Error::Server(message)),
            None => handlers::apply(&self.cache, &kind, response.data, &pending.fields).await,
        };

        if let Some(m) = &self.metrics {
            let status = if outcome.is_ok() { "ok" } else { "error" };
            m.record_response(kind.wire_type(), status, pending.issued_at.elapsed());
        }
        if let Err(e) = &outcome {
            tracing::debug!(request_id = %response.request_id, error = %e, "request failed");
        }

        match (&kind, &outcome) {
            (RequestKind::JoinSession, Ok(handled)) => {
                self.session_joined(handled.phase.unwrap_or_default()).await
            }
            (RequestKind::JoinSession, Err(_)) => self.join_rejected(&pending.fields).await,
            (
                RequestKind::Session | RequestKind::TimeToNextStage,
                Ok(Handled {
                    phase: Some(phase), ..
                }),
            ) if *phase != phase_before => self.phase_changed(*phase).await,
            (RequestKind::SellToCity, Ok(handled)) if sale_succeeded(&handled.value) => {
                for refresh in [Refresh::Companies, Refresh::Cities] {
                    if let Err(e) = self
                        .issue(refresh.kind(), refresh.fields(), pending.source, None)
                        .await
                    {
                        tracing::debug!(error = %e, "post-sale refresh not sent");
                    }
                }
            }
            _ => {}
        }

        pending.complete(outcome.map(|handled| handled.value));
    }

    async fn session_joined(&self, phase: Phase) {
        self.terminal.store(false, Ordering::SeqCst);
        if let Some(id) = self.cache.session_id().await {
            if let Err(e) = self.store.save(&id).await {
                tracing::warn!(error = %e, "could not persist session token");
            }
            tracing::info!(session_id = %id, ?phase, "session joined");
        }
        self.scheduler.start(phase).await;
    }

    /// Forget a stored token the server refused
    async fn join_rejected(&self, fields: &Map<String, Value>) {
        let Some(token) = fields.get("session_id").and_then(Value::as_str) else {
            return;
        };
        match self.store.load().await {
            Ok(Some(stored)) if stored == token => {
                tracing::info!(session_id = %token, "stored session rejected, forgetting it");
                if let Err(e) = self.store.clear().await {
                    tracing::warn!(error = %e, "could not erase session token");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not read stored session"),
        }
    }

    async fn phase_changed(&self, phase: Phase) {
        if self.cache.session_id().await.is_none() {
            tracing::debug!(?phase, "phase change without a session");
            return;
        }
        tracing::info!(?phase, "phase changed");
        if !self.terminal.load(Ordering::SeqCst) {
            self.scheduler.restart(phase).await;
        }
    }

    async fn handle_push(&self, push: PushFrame) {
        tracing::debug!(topic = %push.topic, "push received");
        if let Some(m) = &self.metrics {
            m.record_push(&push.topic);
        }
        self.cache.emit(SyncEvent::Push {
            topic: push.topic.clone(),
            data: push.data.clone(),
        });

        for action in notification::route(&push) {
            self.perform(action).await;
        }
    }

    async fn perform(&self, action: Action) {
        match action {
            Action::Debounce(refresh) => {
                if self.terminal.load(Ordering::SeqCst) {
                    tracing::debug!(key = %refresh.key(), "debounce suppressed after terminal phase");
                    return;
                }
                if self.debouncer.schedule(refresh).await {
                    self.counter.record_debounced().await;
                    if let Some(m) = &self.metrics {
                        m.record_debounced();
                    }
                }
            }
            Action::Immediate(refresh) => {
                if self.terminal.load(Ordering::SeqCst) {
                    return;
                }
                self.debouncer.cancel(&refresh.key()).await;
                self.refetch(refresh).await;
            }
            Action::Apply(inline) => self.apply_inline(inline).await,
            Action::StageChanged(stage) => {
                if self.cache.session_id().await.is_none() {
                    return;
                }
                let phase = self.cache.apply_session(&json!({ "stage": stage })).await;
                self.phase_changed(phase).await;
            }
            Action::Terminal => self.enter_terminal().await,
            Action::FinalFetch(refresh) => {
                if let Err(e) = self
                    .issue(refresh.kind(), refresh.fields(), Source::Manual, None)
                    .await
                {
                    tracing::debug!(key = %refresh.key(), error = %e, "final fetch not sent");
                }
            }
            Action::SessionDeleted(id) => {
                if self.cache.session_id().await.as_deref() == Some(id.as_str()) {
                    tracing::info!(session_id = %id, "current session deleted");
                    if let Err(e) = self.leave_session().await {
                        tracing::warn!(error = %e, "could not erase session token");
                    }
                }
            }
        }
    }

    async fn apply_inline(&self, inline: Inline) {
        match inline {
            Inline::Upgrade(upgrade) => self.cache.push_upgrade(upgrade).await,
            Inline::ExchangeActivity(activity) => self.cache.push_exchange_activity(activity).await,
            Inline::ProductSale { resource, amount } => {
                self.cache.add_product_sale(resource, amount).await
            }
            Inline::ItemPrice { item_id, price } => self.cache.set_item_price(&item_id, price).await,
            Inline::Event(event) => self.cache.set_event(event).await,
            Inline::Winners(winners) => self.cache.set_winners(&winners).await,
        }
    }

    /// Latch the terminal phase: stop polling and drop pending refetches
    async fn enter_terminal(&self) {
        self.terminal.store(true, Ordering::SeqCst);
        self.scheduler.stop().await;
        let cancelled = self.debouncer.cancel_all().await;
        self.cache.apply_session(&json!({ "stage": "End" })).await;
        tracing::info!(cancelled, "session reached its terminal phase");
    }

    async fn leave_session(&self) -> Result<()> {
        self.scheduler.stop().await;
        self.debouncer.cancel_all().await;
        self.cache.reset().await;
        self.store.clear().await
    }
}

/// Whether a response was issued for a session other than the joined one
///
/// Covers kinds that carry the session id; a leave or a join elsewhere makes
/// their in-flight responses stale.
fn sent_for_other_session(
    kind: &RequestKind,
    fields: &Map<String, Value>,
    current: Option<&str>,
) -> bool {
    if !kind.attaches_session() {
        return false;
    }
    match fields.get("session_id").and_then(Value::as_str) {
        Some(sent_for) => current != Some(sent_for),
        None => false,
    }
}

fn sale_succeeded(value: &Value) -> bool {
    matches!(value.get("success"), Some(Value::Bool(true)))
}

#[cfg(test)]
impl SyncClient {
    /// Attach an in-memory outbound queue as if a channel had opened
    pub(crate) async fn attach_test_channel(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.requests.attach(tx).await;
        self.inner.connection.opened().await;
        rx
    }
}
