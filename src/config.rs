//! Configuration types for bokchoy.
//!
//! [`Config`] carries the system-wide defaults handed to the coordinator;
//! [`TaskOptions`] is the per-publish overlay applied on top of a queue's
//! defaults when a single task needs different retry, TTL, timeout or
//! countdown settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_CONCURRENCY: i8 = 1;
pub(crate) const DEFAULT_MAX_RETRIES: i8 = 3;
pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(180);
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

pub(crate) fn default_retry_intervals() -> Vec<Duration> {
    vec![
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(180),
    ]
}

/// System-wide configuration.
///
/// # Examples
///
/// ```rust
/// use bokchoy::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_concurrency(4)
///     .with_max_retries(5)
///     .with_timeout(Duration::from_secs(30))
///     .with_queues(["emails", "reports"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of consumer slots per queue. Values below 1 are treated as 1.
    pub concurrency: i8,

    /// Retry budget for failed tasks
    pub max_retries: i8,

    /// Backoff schedule, indexed by attempt number
    pub retry_intervals: Vec<Duration>,

    /// How long a finished task record is retained
    pub ttl: Duration,

    /// Hard cap on a single handler execution; zero disables
    pub timeout: Duration,

    /// Delay between publish and eligibility, for delayed-by-default queues
    pub countdown: Option<Duration>,

    /// Queue names declared at startup
    pub queues: Vec<String>,

    /// Whether the broker should preload its server-side scripts
    pub initialize: bool,

    /// Suppress the startup banner
    pub disable_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_intervals: default_retry_intervals(),
            ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
            countdown: None,
            queues: Vec::new(),
            initialize: true,
            disable_output: false,
        }
    }
}

impl Config {
    /// Set the number of consumer slots per queue.
    pub fn with_concurrency(mut self, concurrency: i8) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: i8) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff schedule.
    pub fn with_retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.retry_intervals = intervals;
        self
    }

    /// Set the record retention after a terminal status.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the handler execution cap. Zero disables the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set a default publish-to-eligibility delay.
    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    /// Declare queues at startup.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Control broker script preloading.
    pub fn with_initialize(mut self, initialize: bool) -> Self {
        self.initialize = initialize;
        self
    }

    /// Suppress the startup banner.
    pub fn with_disable_output(mut self, disable_output: bool) -> Self {
        self.disable_output = disable_output;
        self
    }

    /// Number of worker slots to create, with invalid concurrency coerced.
    pub(crate) fn worker_slots(&self) -> usize {
        if self.concurrency < 1 {
            1
        } else {
            self.concurrency as usize
        }
    }

    pub(crate) fn retry_intervals_display(&self) -> String {
        self.retry_intervals
            .iter()
            .map(|d| format!("{d:?}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Per-publish overrides, overlaid on the queue defaults.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Override the retry budget for this task
    pub max_retries: Option<i8>,

    /// Override the backoff schedule for this task
    pub retry_intervals: Option<Vec<Duration>>,

    /// Override the record retention for this task
    pub ttl: Option<Duration>,

    /// Override the handler execution cap for this task
    pub timeout: Option<Duration>,

    /// Delay eligibility of this task by the given duration
    pub countdown: Option<Duration>,
}

impl TaskOptions {
    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: i8) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the backoff schedule.
    pub fn with_retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.retry_intervals = Some(intervals);
        self
    }

    /// Override the record retention.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Override the handler execution cap.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay eligibility by the given duration.
    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }
}
