use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallLevel {
    Active,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallThresholds {
    pub warning: Duration,
    pub critical: Duration,
}

/// Classify how long a session has gone without new output.
pub fn classify(idle: Duration, thresholds: &StallThresholds) -> StallLevel {
    if idle > thresholds.critical {
        StallLevel::Critical
    } else if idle > thresholds.warning {
        StallLevel::Warn
    } else {
        StallLevel::Active
    }
}

/// What to do once a session crosses the critical threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StallAction {
    /// Log and keep waiting.
    Warn,
    /// Park the item behind a pause marker and end the session.
    Pause,
    /// End the session so the item is re-dispatched.
    Restart,
    /// Same as `restart`; kept as a separate name for operators.
    Retry,
}

impl StallAction {
    /// Whether the action hands the item back for another attempt.
    pub const fn redispatches(self) -> bool {
        matches!(self, Self::Restart | Self::Retry)
    }
}

impl fmt::Display for StallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warn => "warn",
            Self::Pause => "pause",
            Self::Restart => "restart",
            Self::Retry => "retry",
        })
    }
}
