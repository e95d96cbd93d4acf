//! Connection state tracking
//!
//! ```text
//! disconnected --connect()--> connecting --open--> open
//!      ^                          |                 |
//!      |<------- failed ----------+                 |
//!      |<--------------------- closed --------------+
//!      |<-- closing <-- disconnect() ---------------+
//! ```
//!
//! After an unexpected close the manager consults its
//! [`ReconnectionStrategy`] for the delay before the next attempt. A manual
//! `disconnect()` sets a flag that suppresses reconnection until the next
//! explicit `connect()`.

use crate::reconnect::ReconnectionStrategy;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel, no attempt in progress
    Disconnected,
    /// An attempt is in progress
    Connecting,
    /// The channel is open
    Open,
    /// A manual disconnect is tearing the channel down
    Closing,
}

impl ConnectionState {
    /// Numeric code used by the connection-state gauge
    pub fn code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Open => 2,
            ConnectionState::Closing => 3,
        }
    }
}

/// Owns the connection state, the manual flag and the reconnect policy
pub struct ConnectionManager {
    state: Arc<RwLock<ConnectionState>>,
    strategy: Arc<Mutex<Box<dyn ReconnectionStrategy>>>,
    manual: AtomicBool,
    attempt: AtomicU32,
    url: String,
}

impl ConnectionManager {
    /// Create a manager for the given URL
    pub fn new(url: String, strategy: Box<dyn ReconnectionStrategy>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            strategy: Arc::new(Mutex::new(strategy)),
            manual: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            url,
        }
    }

    /// Full connection URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// An explicit `connect()` was requested
    pub fn begin(&self) {
        self.manual.store(false, Ordering::SeqCst);
        self.attempt.store(0, Ordering::SeqCst);
    }

    /// Whether the last disconnect was user-initiated
    pub fn is_manual(&self) -> bool {
        self.manual.load(Ordering::SeqCst)
    }

    /// Transition to connecting
    pub async fn connecting(&self) {
        self.set_state(ConnectionState::Connecting).await;
    }

    /// Transition to open and reset the reconnect policy
    pub async fn opened(&self) {
        self.set_state(ConnectionState::Open).await;
        self.attempt.store(0, Ordering::SeqCst);
        self.strategy.lock().await.reset();
    }

    /// Transition to disconnected
    pub async fn closed(&self) {
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Start a manual disconnect
    pub async fn closing(&self) {
        self.manual.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Closing).await;
    }

    /// Delay before the next reconnect attempt
    ///
    /// `None` when the disconnect was manual or the policy gave up.
    pub async fn next_reconnect_delay(&self) -> Option<Duration> {
        if self.is_manual() {
            return None;
        }
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        self.strategy.lock().await.next_delay(attempt)
    }

    /// Failed attempts since the last open
    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::{ExponentialBackoff, FixedDelay};

    fn manager(strategy: Box<dyn ReconnectionStrategy>) -> ConnectionManager {
        ConnectionManager::new("ws://localhost:8080?client_id=t".to_string(), strategy)
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let manager = manager(Box::new(FixedDelay::default()));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        manager.connecting().await;
        assert_eq!(manager.state().await, ConnectionState::Connecting);

        manager.opened().await;
        assert_eq!(manager.state().await, ConnectionState::Open);

        manager.closing().await;
        assert_eq!(manager.state().await, ConnectionState::Closing);
        assert!(manager.is_manual());

        manager.closed().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_manual_flag_suppresses_reconnect_until_begin() {
        let manager = manager(Box::new(FixedDelay::default()));
        manager.closing().await;
        assert!(manager.next_reconnect_delay().await.is_none());

        manager.begin();
        assert!(!manager.is_manual());
        assert_eq!(
            manager.next_reconnect_delay().await,
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn test_attempts_reset_on_open() {
        let strategy =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let manager = manager(Box::new(strategy));

        assert_eq!(
            manager.next_reconnect_delay().await,
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            manager.next_reconnect_delay().await,
            Some(Duration::from_millis(200))
        );
        assert_eq!(manager.attempts(), 2);

        manager.opened().await;
        assert_eq!(manager.attempts(), 0);
        assert_eq!(
            manager.next_reconnect_delay().await,
            Some(Duration::from_millis(100))
        );
    }

    #[tokio::test]
    async fn test_policy_gives_up() {
        let manager = manager(Box::new(FixedDelay::default().with_max_attempts(1)));
        assert!(manager.next_reconnect_delay().await.is_some());
        assert!(manager.next_reconnect_delay().await.is_none());
    }
}
