//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityPolicy {
    /// Refuse the new operation with `CapacityExceeded`.
    #[default]
    RejectNew,
    /// Move the newest pending operation of a lower priority to the
    /// dead-letter view and accept the new one.
    DropLowestPriority,
}

/// Configuration for the sync manager.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on a single executor call.
    pub executor_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Full-queue behavior.
    pub capacity_policy: CapacityPolicy,
    /// Largest accepted payload, in encoded JSON bytes.
    pub max_payload_bytes: usize,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            executor_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            capacity_policy: CapacityPolicy::RejectNew,
            max_payload_bytes: 1024 * 1024,
        }
    }

    /// Sets the executor timeout.
    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the capacity policy.
    pub fn with_capacity_policy(mut self, policy: CapacityPolicy) -> Self {
        self.capacity_policy = policy;
        self
    }

    /// Sets the payload size limit.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before an operation fails permanently.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
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
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Returns true if an operation that has been attempted `attempts`
    /// times may be tried again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the backoff after `attempts` failed attempts.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * rand::thread_rng().gen_range(0.0..=0.25);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for the durable queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of active (pending or in-flight) operations.
    pub max_pending: usize,
    /// Maximum number of dead letters kept; the oldest are evicted.
    pub dead_letter_capacity: usize,
}

impl QueueConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_pending: 10_000,
            dead_letter_capacity: 1_000,
        }
    }

    /// Sets the active operation limit.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Sets the dead-letter capacity.
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the network monitor.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// How long connectivity must hold before a reconnect triggers a sync.
    pub stable_for: Duration,
    /// Periodic sync interval while online.
    pub poll_interval: Option<Duration>,
}

impl NetworkConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            stable_for: Duration::from_secs(2),
            poll_interval: None,
        }
    }

    /// Sets the stability window.
    pub fn with_stable_for(mut self, window: Duration) -> Self {
        self.stable_for = window;
        self
    }

    /// Enables periodic syncs.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new()
    }
}
