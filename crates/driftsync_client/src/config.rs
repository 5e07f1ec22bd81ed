//! Configuration for the sync client.

use std::time::Duration;

/// Transport selection passed through to the connector.
///
/// Opaque to the core; connectors map it to whatever their platform
/// supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMethod {
    /// Long-lived socket stream.
    #[default]
    WebSocket,
    /// Chunked HTTP stream.
    Http,
}

/// Options for a sync session.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Minimum spacing between upload attempts. Zero disables throttling
    /// (used to keep tests fast).
    pub crud_upload_throttle: Duration,
    /// Transport selection, forwarded to the connector.
    pub connection_method: ConnectionMethod,
    /// Retry configuration shared by the download and upload loops.
    pub retry: RetryConfig,
}

impl SyncOptions {
    /// Creates options with default throttling and retry behavior.
    pub fn new() -> Self {
        Self {
            crud_upload_throttle: Duration::from_millis(1000),
            connection_method: ConnectionMethod::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the upload throttle.
    pub fn with_crud_upload_throttle(mut self, throttle: Duration) -> Self {
        self.crud_upload_throttle = throttle;
        self
    }

    /// Sets the connection method.
    pub fn with_connection_method(mut self, method: ConnectionMethod) -> Self {
        self.connection_method = method;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
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
    /// Creates a configuration with effectively no delay, for tests.
    pub fn immediate() -> Self {
        Self {
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

    /// Calculates the delay for a given attempt (0-indexed).
    ///
    /// The first attempt has no delay; later attempts grow exponentially
    /// up to the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

/// A backoff cursor over a [`RetryConfig`].
///
/// Reset on the first success so a healthy connection starts over from
/// the initial delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh cursor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the delay to wait before the next attempt and advances.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

    /// Resets the cursor after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the number of failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Simple deterministic "jitter" (no external RNG dependency).
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
