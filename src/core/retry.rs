//! Retry backoff for failed tasks.
//!
//! Delays grow exponentially from `base_delay` until they reach `max_delay`,
//! then keep growing linearly by `base_delay` per retry. The curve is strictly
//! increasing in the retry count for any `multiplier > 1`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Backoff policy applied when a failed task still has retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "serde_duration")]
    pub base_delay: Duration,

    /// Point at which exponential growth switches to linear growth.
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,

    /// Growth factor between consecutive retries while below `max_delay`.
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Create a backoff policy.
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
        }
    }

    /// Delay before retry number `retry_count` (1-based; 0 is treated as 1).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let n = retry_count.max(1);
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();

        let mut delay = base;
        for step in 1..n {
            if delay >= max {
                let linear = f64::from(n - step) * base;
                return seconds(max + linear);
            }
            delay *= self.multiplier;
        }

        seconds(delay.min(max))
    }
}

impl Default for BackoffPolicy {
    /// 5s base, 5 minute ceiling, doubling.
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300), 2.0)
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Coarse classification of a task failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Timeouts and unreachable peers.
    Network,
    /// Locks and temporary unavailability.
    Transient,
    /// Access denied; retrying will not help.
    Permission,
    /// Missing or corrupt repository; retrying will not help.
    Repository,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// Categories whose markers are all permanent. A message filed under
    /// another category can still be permanent, see [`is_permanent_error`].
    pub fn is_permanent(&self) -> bool {
        matches!(self, ErrorCategory::Permission | ErrorCategory::Repository)
    }

    /// Stable lowercase name, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Repository => "repository",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(ErrorCategory::Network),
            "transient" => Ok(ErrorCategory::Transient),
            "permission" => Ok(ErrorCategory::Permission),
            "repository" => Ok(ErrorCategory::Repository),
            "unknown" => Ok(ErrorCategory::Unknown),
            other => Err(format!("unknown error category: {}", other)),
        }
    }
}

const NETWORK_MARKERS: &[&str] = &["timeout", "connection refused", "network"];
const TRANSIENT_MARKERS: &[&str] = &["locked", "temporarily unavailable"];
const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "access denied",
    "forbidden",
    "unauthorized",
    "authentication failed",
];
const REPOSITORY_MARKERS: &[&str] = &["not found", "invalid repository"];

/// Classify a failure message by case-insensitive substring match.
///
/// Markers are checked in order network, transient, permission, repository.
pub fn categorize_error(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if contains_any(NETWORK_MARKERS) {
        ErrorCategory::Network
    } else if contains_any(TRANSIENT_MARKERS) {
        ErrorCategory::Transient
    } else if contains_any(PERMISSION_MARKERS) {
        ErrorCategory::Permission
    } else if contains_any(REPOSITORY_MARKERS) {
        ErrorCategory::Repository
    } else {
        ErrorCategory::Unknown
    }
}

/// Whether a failure message names a permanent condition.
///
/// Checked against every permission and repository marker, regardless of
/// which category the message was filed under.
pub fn is_permanent_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMISSION_MARKERS
        .iter()
        .chain(REPOSITORY_MARKERS)
        .any(|m| lower.contains(m))
}

/// Whether a failed task gets another attempt.
pub fn should_retry(retry_count: u32, max_retries: u32, error_message: &str) -> bool {
    retry_count < max_retries && !is_permanent_error(error_message)
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as whole seconds.
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
