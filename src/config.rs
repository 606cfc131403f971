//! Configuration for the reliability core.
//!
//! All tunables live here, with the defaults the system was designed
//! around. Values are validated by [`Config::validate`], which components
//! call at construction time; an invalid interval is fatal at setup,
//! never deferred to the background task that would have used it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// Callback invoked when stranded jobs are moved back to pending.
///
/// Receives the queue name and the number of jobs resurrected from it.
pub type ResurrectionCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Default sleep between fetch attempts when no queue yielded a job.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Default back-off for a queue observed empty during a fetch pass.
pub const DEFAULT_EMPTY_BACKOFF: Duration = Duration::from_secs(5);

/// Default back-off for a queue whose last job was throttled.
pub const DEFAULT_THROTTLE_BACKOFF: Duration = Duration::from_secs(15);

/// Default interval between empty-queue cache refreshes.
pub const DEFAULT_EMPTY_QUEUES_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between process-registry heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between crash-recovery sweeps. Doubles as the
/// minimum-interval guard on the sweep lease.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables for fetch, crash recovery and the background timers.
#[derive(Clone)]
pub struct Config {
    /// Stable identity of this process, supplied by the host. The host is
    /// responsible for keeping a liveness key of the same name alive in
    /// Redis for as long as the process runs.
    pub identity: String,
    /// Queue names this process watches, in configured order.
    pub queues: Vec<String>,
    /// Preserve configured queue order instead of shuffling for fairness.
    pub strict: bool,
    /// Sleep between fetch attempts when no work was found.
    pub fetch_timeout: Duration,
    /// How long to skip a queue after observing it empty.
    pub empty_backoff: Duration,
    /// How long to skip a queue after fetching a throttled job from it.
    pub throttle_backoff: Duration,
    /// How often the empty-queue cache is refreshed. Also the maximum
    /// delay before a job pushed to a previously-empty queue is noticed.
    pub empty_queues_refresh_interval: Duration,
    /// How often this process re-registers its watched queues.
    pub heartbeat_interval: Duration,
    /// How often dead processes are swept for stranded jobs.
    pub sweep_interval: Duration,
    /// Maintain a per-job resurrection counter (24 h expiry) for telemetry.
    pub enable_resurrection_counter: bool,
    /// Invoked after jobs are resurrected from a dead process's queue.
    pub on_resurrection: Option<ResurrectionCallback>,
}

impl Config {
    /// Creates a configuration with default tunables for the given
    /// process identity and watched queues.
    pub fn new(identity: impl Into<String>, queues: Vec<String>) -> Self {
        Self {
            identity: identity.into(),
            queues,
            strict: false,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            empty_backoff: DEFAULT_EMPTY_BACKOFF,
            throttle_backoff: DEFAULT_THROTTLE_BACKOFF,
            empty_queues_refresh_interval: DEFAULT_EMPTY_QUEUES_REFRESH_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            enable_resurrection_counter: false,
            on_resurrection: None,
        }
    }

    /// Enables strict (configured-order) queue polling.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Sets the sleep between fetch attempts when no work was found.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the back-off applied to queues observed empty.
    pub fn with_empty_backoff(mut self, backoff: Duration) -> Self {
        self.empty_backoff = backoff;
        self
    }

    /// Sets the back-off applied to queues that served a throttled job.
    pub fn with_throttle_backoff(mut self, backoff: Duration) -> Self {
        self.throttle_backoff = backoff;
        self
    }

    /// Sets the empty-queue cache refresh interval.
    pub fn with_empty_queues_refresh_interval(mut self, interval: Duration) -> Self {
        self.empty_queues_refresh_interval = interval;
        self
    }

    /// Sets the registry heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the crash-recovery sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Enables the per-job resurrection counter.
    pub fn with_resurrection_counter(mut self, enabled: bool) -> Self {
        self.enable_resurrection_counter = enabled;
        self
    }

    /// Sets the resurrection callback.
    pub fn with_on_resurrection<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, u64) + Send + Sync + 'static,
    {
        self.on_resurrection = Some(Arc::new(callback));
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the identity is empty, no queues are
    /// configured, or any interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.is_empty() {
            return Err(ConfigError::EmptyIdentity);
        }
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }

        let intervals = [
            ("fetch_timeout", self.fetch_timeout),
            ("empty_backoff", self.empty_backoff),
            ("throttle_backoff", self.throttle_backoff),
            (
                "empty_queues_refresh_interval",
                self.empty_queues_refresh_interval,
            ),
            ("heartbeat_interval", self.heartbeat_interval),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::InvalidInterval { name, value });
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("identity", &self.identity)
            .field("queues", &self.queues)
            .field("strict", &self.strict)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("empty_backoff", &self.empty_backoff)
            .field("throttle_backoff", &self.throttle_backoff)
            .field(
                "empty_queues_refresh_interval",
                &self.empty_queues_refresh_interval,
            )
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("sweep_interval", &self.sweep_interval)
            .field(
                "enable_resurrection_counter",
                &self.enable_resurrection_counter,
            )
            .field(
                "on_resurrection",
                &self.on_resurrection.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::new("host:123:abc", vec!["default".to_string()])
    }

    #[test]
    fn test_defaults() {
        let config = base_config();

        assert!(!config.strict);
        assert_eq!(config.fetch_timeout, Duration::from_secs(2));
        assert_eq!(config.empty_backoff, Duration::from_secs(5));
        assert_eq!(config.throttle_backoff, Duration::from_secs(15));
        assert_eq!(
            config.empty_queues_refresh_interval,
            Duration::from_secs(30)
        );
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert!(!config.enable_resurrection_counter);
        assert!(config.on_resurrection.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = base_config()
            .with_strict(true)
            .with_fetch_timeout(Duration::from_secs(1))
            .with_throttle_backoff(Duration::from_secs(30))
            .with_sweep_interval(Duration::from_secs(120))
            .with_resurrection_counter(true)
            .with_on_resurrection(|_queue, _count| {});

        assert!(config.strict);
        assert_eq!(config.fetch_timeout, Duration::from_secs(1));
        assert_eq!(config.throttle_backoff, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(120));
        assert!(config.enable_resurrection_counter);
        assert!(config.on_resurrection.is_some());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = base_config().with_sweep_interval(Duration::ZERO);

        match config.validate() {
            Err(ConfigError::InvalidInterval { name, .. }) => {
                assert_eq!(name, "sweep_interval");
            }
            other => panic!("Expected InvalidInterval, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_queues_and_identity() {
        let config = Config::new("host:123:abc", vec![]);
        assert!(matches!(config.validate(), Err(ConfigError::NoQueues)));

        let config = Config::new("", vec!["default".to_string()]);
        assert!(matches!(config.validate(), Err(ConfigError::EmptyIdentity)));
    }

    #[test]
    fn test_debug_elides_callback() {
        let config = base_config().with_on_resurrection(|_, _| {});
        let rendered = format!("{:?}", config);

        assert!(rendered.contains("<callback>"));
    }
}
