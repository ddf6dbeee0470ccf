//! Retry policy values per task class.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry shape of an action class.
///
/// The substrate decides whether to retry from this value and the error kind;
/// actions never retry themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied per retry.
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay.
    pub maximum_interval: Duration,
    /// Total attempts, including the first one.
    pub maximum_attempts: u32,
    /// Longest a single attempt may run.
    pub start_to_close_timeout: Duration,
    /// Longest an attempt may go without a heartbeat.
    pub heartbeat_timeout: Option<Duration>,
}

impl RetryPolicy {
    fn with_shape(
        maximum_attempts: u32,
        start_to_close_timeout: Duration,
        heartbeat_timeout: Option<Duration>,
    ) -> Self {
        Self {
            initial_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(15 * 60),
            maximum_attempts,
            start_to_close_timeout,
            heartbeat_timeout,
        }
    }

    /// Delay after failed attempt number `attempt` (1-indexed).
    ///
    /// Non-decreasing in `attempt` and never above `maximum_interval`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let coefficient = self.backoff_coefficient.max(1.0);
        let delay_ms = self.initial_interval.as_millis() as f64 * coefficient.powi(exponent);
        let capped = delay_ms.min(self.maximum_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` tries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.maximum_attempts
    }
}

/// Kind of work an action performs, which selects its retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TaskClass {
    /// Folder creation, metadata save, thumbnails.
    Fast,
    /// Downloads, conversions, renders.
    Long,
    /// Live video download and live chat capture. Never retried.
    LiveCapture,
}

/// Retry policy for every task class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    pub fast: RetryPolicy,
    pub long: RetryPolicy,
    pub live_capture: RetryPolicy,
}

const SEVEN_DAYS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            fast: RetryPolicy::with_shape(5, Duration::from_secs(10), None),
            long: RetryPolicy::with_shape(3, SEVEN_DAYS, Some(Duration::from_secs(90))),
            live_capture: RetryPolicy::with_shape(1, SEVEN_DAYS, Some(Duration::from_secs(90))),
        }
    }
}

impl PolicyTable {
    pub fn for_class(&self, class: TaskClass) -> &RetryPolicy {
        match class {
            TaskClass::Fast => &self.fast,
            TaskClass::Long => &self.long,
            TaskClass::LiveCapture => &self.live_capture,
        }
    }
}
