use std::{sync::Arc, time::Duration};

/// Runtime configuration for the broker.
///
/// Controls the broker's own identity, the correlation table limits and the
/// cadence of background housekeeping. Use the builder pattern to customize,
/// or use [`Default`] for sensible defaults.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use switchboard::Config;
///
/// let config = Config::default()
///     .with_max_pending(256)                          // Tighter backpressure
///     .with_default_timeout(Duration::from_secs(2));  // Fail fast
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity stamped as `source` on envelopes the broker originates
    /// itself, e.g. replies sent with [`Broker::respond`](crate::Broker::respond).
    /// Default: "main"
    pub identity: Arc<str>,

    /// Maximum number of requests awaiting a reply at any time.
    /// Further requests are answered with `over_capacity` immediately.
    /// Default: 1000
    pub max_pending: usize,

    /// Timeout applied to requests that don't specify one.
    /// Default: 8 s
    pub default_timeout: Duration,

    /// Interval of the sweep evicting expired pending requests.
    /// Default: 5 s
    pub sweep_interval: Duration,

    /// How often a watched policy file is checked for modifications.
    /// Default: 2 s
    pub policy_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            identity: Arc::from("main"),
            max_pending: 1000,
            default_timeout: Duration::from_millis(8000),
            sweep_interval: Duration::from_secs(5),
            policy_poll_interval: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Set the identity the broker uses for envelopes it emits itself.
    pub fn with_identity(mut self, identity: impl Into<Arc<str>>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Set the capacity of the pending-request table.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Set the timeout used when a request carries none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the interval of the sweep evicting expired requests.
    ///
    /// The sweep only catches entries whose timers failed to fire, so it can
    /// run far less often than typical request timeouts.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_policy_poll_interval(mut self, interval: Duration) -> Self {
        self.policy_poll_interval = interval;
        self
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// How long to wait for a reply. `None` falls back to
    /// [`Config::default_timeout`].
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn timeout_ms(&self) -> Option<u64> {
        self.timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn from_millis(timeout_ms: Option<u64>) -> Self {
        RequestOptions {
            timeout: timeout_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ms() {
        assert_eq!(RequestOptions::default().timeout_ms(), None);
        let options = RequestOptions::default().with_timeout(Duration::from_millis(1500));
        assert_eq!(options.timeout_ms(), Some(1500));
    }

    #[test]
    fn test_timeout_ms_saturates() {
        let options = RequestOptions::default().with_timeout(Duration::MAX);
        assert_eq!(options.timeout_ms(), Some(u64::MAX));
        assert_eq!(
            RequestOptions::from_millis(options.timeout_ms()).timeout,
            Some(Duration::from_millis(u64::MAX))
        );
    }
}
