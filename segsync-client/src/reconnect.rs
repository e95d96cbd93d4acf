//! Reconnection policies
//!
//! After an unexpected close the lifecycle manager asks its strategy how long
//! to wait before the next attempt. Returning `None` stops reconnecting until
//! the next explicit `connect()`.
//!
//! - **FixedDelay**: the same delay every time (default, 1 s, unlimited)
//! - **ExponentialBackoff**: doubling delays with optional jitter and cap
//! - **NoReconnect**: never retry
//!
//! ```rust
//! use segsync_client::{ExponentialBackoff, FixedDelay, ReconnectionStrategy};
//! use std::time::Duration;
//!
//! let mut fixed = FixedDelay::default();
//! assert_eq!(fixed.next_delay(7), Some(Duration::from_secs(1)));
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(8))
//!     .with_max_attempts(5);
//! assert_eq!(backoff.next_delay(2), Some(Duration::from_secs(1)));
//! ```

use std::time::Duration;

/// Delay used between reconnect attempts unless configured otherwise
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Decides the delay before each reconnect attempt
///
/// `attempt` counts failed attempts since the last successful open, starting
/// at 0. `reset()` is called whenever a connection opens.
///
/// # Examples
///
/// A policy that retries quickly three times, then slowly forever:
///
/// ```rust
/// use segsync_client::ReconnectionStrategy;
/// use std::time::Duration;
///
/// struct FastThenSlow;
///
/// impl ReconnectionStrategy for FastThenSlow {
///     fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
///         if attempt < 3 {
///             Some(Duration::from_millis(200))
///         } else {
///             Some(Duration::from_secs(10))
///         }
///     }
///
///     fn reset(&mut self) {}
/// }
///
/// let mut strategy = FastThenSlow;
/// assert_eq!(strategy.next_delay(0), Some(Duration::from_millis(200)));
/// assert_eq!(strategy.next_delay(3), Some(Duration::from_secs(10)));
/// ```
pub trait ReconnectionStrategy: Send + Sync {
    /// Delay before the next attempt
    ///
    /// # Arguments
    ///
    /// * `attempt` - Failed attempts since the last open (0-indexed)
    ///
    /// # Returns
    ///
    /// - `Some(duration)`: wait this long, then try again
    /// - `None`: stop reconnecting until the next explicit `connect()`
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;

    /// Forget accumulated state after a successful open
    ///
    /// The supervisor calls this on every open, including the first.
    fn reset(&mut self);
}

/// Exponential backoff with optional jitter
///
/// The delay for attempt `n` is `min_delay * 2^n`, capped at `max_delay`.
/// With jitter a random extra of up to a quarter of that delay is added.
///
/// # Examples
///
/// ```rust
/// use segsync_client::{ExponentialBackoff, ReconnectionStrategy};
/// use std::time::Duration;
///
/// let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
///     .with_max_attempts(6);
///
/// assert_eq!(backoff.next_delay(0), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next_delay(3), Some(Duration::from_millis(800)));
/// assert_eq!(backoff.next_delay(5), Some(Duration::from_secs(1)));
/// assert_eq!(backoff.next_delay(6), None);
/// ```
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: bool,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Doubling delays with unlimited attempts and no jitter
    ///
    /// # Arguments
    ///
    /// * `min_delay` - Delay before the first attempt
    /// * `max_delay` - Upper bound for any delay before jitter
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            max_attempts: None,
            jitter: false,
            current_attempt: 0,
        }
    }

    /// Give up after this many attempts
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Number of retries allowed; 0 never retries
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Add up to 25% random extra delay
    ///
    /// Spreads out clients that lost the same server at the same moment.
    /// Delays under 4 ms are left as they are.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY, Duration::from_secs(30)).with_jitter()
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        self.current_attempt = attempt;

        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let base = (self.min_delay.as_millis() as u64).saturating_mul(factor);
        let delay = base.min(self.max_delay.as_millis() as u64);

        if self.jitter && delay >= 4 {
            use rand::Rng;
            let extra = rand::thread_rng().gen_range(0..=(delay / 4));
            return Some(Duration::from_millis(delay + extra));
        }

        Some(Duration::from_millis(delay))
    }

    fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// The same delay before every attempt
///
/// This is the client's default policy, with [`DEFAULT_RECONNECT_DELAY`] and
/// no attempt limit.
///
/// # Examples
///
/// ```rust
/// use segsync_client::{FixedDelay, ReconnectionStrategy};
/// use std::time::Duration;
///
/// let mut fixed = FixedDelay::new(Duration::from_millis(500)).with_max_attempts(2);
/// assert_eq!(fixed.next_delay(1), Some(Duration::from_millis(500)));
/// assert_eq!(fixed.next_delay(2), None);
/// ```
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedDelay {
    /// Fixed delay, unlimited attempts
    ///
    /// # Arguments
    ///
    /// * `delay` - Wait before every attempt
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Give up after this many attempts
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Number of retries allowed; 0 never retries
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectionStrategy for FixedDelay {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt >= max => None,
            _ => Some(self.delay),
        }
    }

    fn reset(&mut self) {}
}

/// Never reconnect
///
/// An unexpected close leaves the client disconnected until the caller
/// connects again.
pub struct NoReconnect;

impl ReconnectionStrategy for NoReconnect {
    fn next_delay(&mut self, _attempt: u32) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_default_is_one_second_forever() {
        let mut strategy = FixedDelay::default();
        for attempt in [0, 1, 10, 1000] {
            assert_eq!(strategy.next_delay(attempt), Some(Duration::from_secs(1)));
        }
    }

    #[test]
    fn test_fixed_delay_max_attempts() {
        let mut strategy = FixedDelay::new(Duration::from_millis(50)).with_max_attempts(2);
        assert_eq!(strategy.next_delay(0), Some(Duration::from_millis(50)));
        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(50)));
        assert!(strategy.next_delay(2).is_none());
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let mut strategy =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(strategy.next_delay(0), Some(Duration::from_millis(100)));
        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(200)));
        assert_eq!(strategy.next_delay(3), Some(Duration::from_millis(800)));
        assert_eq!(strategy.next_delay(4), Some(Duration::from_secs(1)));
        assert_eq!(strategy.next_delay(63), Some(Duration::from_secs(1)));
        assert_eq!(strategy.next_delay(200), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_exponential_backoff_gives_up_and_resets() {
        let mut strategy =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
                .with_max_attempts(3);
        assert!(strategy.next_delay(2).is_some());
        assert_eq!(strategy.current_attempt, 2);
        assert!(strategy.next_delay(3).is_none());

        strategy.reset();
        assert_eq!(strategy.current_attempt, 0);
    }

    #[test]
    fn test_exponential_backoff_jitter_bounds() {
        let mut strategy =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
                .with_jitter();
        for _ in 0..20 {
            let delay = strategy.next_delay(0).unwrap();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_no_reconnect() {
        let mut strategy = NoReconnect;
        assert!(strategy.next_delay(0).is_none());
    }
}
