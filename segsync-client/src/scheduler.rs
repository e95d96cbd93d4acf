//! Adaptive poll scheduler
//!
//! Runs a full-refresh batch on a timer whose period depends on the session
//! phase. `start()` runs one batch immediately and then arms the timer;
//! a zero interval (the terminal phase) arms nothing. `restart()` re-derives
//! the interval after a phase change and swaps the timer without running a
//! batch. `stop()` cancels the timer only; requests already sent stay in
//! flight.

use segsync_core::Phase;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The batch run on every tick
pub type BatchFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Poll period per phase; zero disables polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub lobby: Duration,
    pub between: Duration,
    pub active: Duration,
    pub end: Duration,
    pub unknown: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            lobby: Duration::from_secs(10),
            between: Duration::from_secs(7),
            active: Duration::from_secs(5),
            end: Duration::ZERO,
            unknown: Duration::from_secs(5),
        }
    }
}

impl PollIntervals {
    /// Period for a phase
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Lobby => self.lobby,
            Phase::Between => self.between,
            Phase::Active => self.active,
            Phase::End => self.end,
            Phase::Unknown => self.unknown,
        }
    }
}

struct Timer {
    period: Duration,
    handle: JoinHandle<()>,
}

/// Periodically runs a refresh batch
pub struct PollScheduler {
    intervals: PollIntervals,
    batch: BatchFn,
    timer: Mutex<Option<Timer>>,
}

impl PollScheduler {
    /// Create a stopped scheduler
    pub fn new<F, Fut>(intervals: PollIntervals, batch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let batch: BatchFn = Arc::new(move || Box::pin(batch()));
        Self {
            intervals,
            batch,
            timer: Mutex::new(None),
        }
    }

    /// Configured intervals
    pub fn intervals(&self) -> &PollIntervals {
        &self.intervals
    }

    /// Run one batch now, then poll at the phase's interval
    pub async fn start(&self, phase: Phase) {
        self.stop().await;
        (self.batch)().await;
        self.arm(phase).await;
    }

    /// Re-derive the interval; the countdown starts over
    ///
    /// A zero interval stops polling.
    pub async fn restart(&self, phase: Phase) {
        self.stop().await;
        self.arm(phase).await;
    }

    /// Cancel the timer
    pub async fn stop(&self) {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.handle.abort();
            tracing::debug!("polling stopped");
        }
    }

    /// Current period, if the timer is armed
    pub async fn period(&self) -> Option<Duration> {
        self.timer.lock().await.as_ref().map(|t| t.period)
    }

    async fn arm(&self, phase: Phase) {
        let period = self.intervals.for_phase(phase);
        if period.is_zero() {
            tracing::debug!(?phase, "polling disabled for phase");
            return;
        }

        let batch = Arc::clone(&self.batch);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                batch().await;
            }
        });

        let previous = self.timer.lock().await.replace(Timer { period, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        tracing::debug!(?phase, period_ms = period.as_millis() as u64, "polling started");
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.try_lock() {
            if let Some(timer) = timer.take() {
                timer.handle.abort();
            }
        }
    }
}
