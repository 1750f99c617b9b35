//! Configuration for the client.

use crate::auth::{MemorySessionStore, SessionStore};
use crate::clock::{Clock, SystemClock};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`Database`](crate::Database).
#[derive(Clone)]
pub struct ClientConfig {
    /// Root URL of the database, without a trailing slash.
    pub url: String,
    /// Reconnection behavior.
    pub retry: RetryConfig,
    /// How often the driver checks for an expired auth session.
    pub expiry_check_interval: Duration,
    /// Re-register every on-disconnect action after each reconnect.
    ///
    /// When false, actions the server acknowledged before a drop are treated
    /// as consumed and only unacknowledged ones are sent again.
    pub rearm_on_disconnect: bool,
    /// Time source for auth expiry and push keys.
    pub clock: Arc<dyn Clock>,
    /// Where remembered sessions are kept.
    pub session_store: Arc<dyn SessionStore>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("retry", &self.retry)
            .field("expiry_check_interval", &self.expiry_check_interval)
            .field("rearm_on_disconnect", &self.rearm_on_disconnect)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Creates a configuration for the database at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
            retry: RetryConfig::default(),
            expiry_check_interval: Duration::from_secs(1),
            rearm_on_disconnect: true,
            clock: Arc::new(SystemClock),
            session_store: Arc::new(MemorySessionStore::new()),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the auth expiry check interval.
    pub fn with_expiry_check_interval(mut self, interval: Duration) -> Self {
        self.expiry_check_interval = interval;
        self
    }

    /// Sets the on-disconnect re-arm policy.
    pub fn with_rearm_on_disconnect(mut self, rearm: bool) -> Self {
        self.rearm_on_disconnect = rearm;
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the session store.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = store;
        self
    }

    /// Host part of the URL, used as the namespace in the handshake.
    pub fn namespace(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(_, rest)| rest);
        rest.split('/').next().unwrap_or(rest)
    }
}

/// Configuration for reconnection backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failed connection attempts allowed before giving up.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration that gives up after `max_attempts` failures.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    /// Creates a configuration that retries forever.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Whether `failures` consecutive failures exhaust the retry budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }

    /// Calculates the delay before attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.3,
            add_jitter: true,
        }
    }
}
