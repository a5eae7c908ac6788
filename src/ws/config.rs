#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(25);
const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(12);
const DEFAULT_WARMUP_TIMEOUT_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(2);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
const DEFAULT_QUEUE_CAPACITY: usize = 200;
const DEFAULT_WARMUP_PATH: &str = "/health";
const DEFAULT_SESSION_ID_PARAM: &str = "sessionId";

/// Configuration for the realtime session client.
///
/// Every field has a default; use [`Config::builder`] to override individual values.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Interval between heartbeat checks. The liveness timeout is always twice this value.
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// How long a socket may stay in the connecting state before it is abandoned
    #[builder(default = DEFAULT_HANDSHAKE_TIMEOUT_DURATION)]
    pub handshake_timeout: Duration,
    /// Maximum number of outbound messages held while the session cannot send
    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
    /// Client-side timeout for the warmup ping
    #[builder(default = DEFAULT_WARMUP_TIMEOUT_DURATION)]
    pub warmup_timeout: Duration,
    /// Path of the health-check endpoint hit by the warmup ping
    #[builder(default = DEFAULT_WARMUP_PATH.to_owned(), into)]
    pub warmup_path: String,
    /// Query parameter carrying the session identifier on the socket address
    #[builder(default = DEFAULT_SESSION_ID_PARAM.to_owned(), into)]
    pub session_id_param: String,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Silence after which an authenticated connection is considered dead.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(2)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` (or `Some(0)`) means infinite retries.
    pub max_attempts: Option<u32>,
    /// Backoff duration for the first reconnection attempt
    #[builder(default = DEFAULT_INITIAL_BACKOFF_DURATION)]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[builder(default = DEFAULT_MAX_BACKOFF_DURATION)]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-based):
    /// `min(initial_backoff * multiplier^(attempt - 1), max_backoff)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);

        #[expect(
            clippy::float_arithmetic,
            reason = "Exponential growth is defined over fractional multipliers"
        )]
        let seconds = self.initial_backoff.as_secs_f64() * factor;

        Duration::try_from_secs_f64(seconds)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    fn budget(&self) -> Option<u32> {
        self.max_attempts.filter(|max| *max > 0)
    }
}

/// Deterministic reconnect schedule driven by a [`ReconnectConfig`].
///
/// Each call to [`Backoff::next_backoff`] counts one reconnection attempt. Once the attempt
/// budget is spent it yields `None`, which the connection manager treats as terminal.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectBackoff {
    /// Number of reconnection attempts scheduled since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Backoff for ReconnectBackoff {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.budget()
            && self.attempts >= max
        {
            return None;
        }

        self.attempts = self.attempts.saturating_add(1);
        Some(self.config.delay_for(self.attempts))
    }
}

impl From<ReconnectConfig> for ReconnectBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }
}
