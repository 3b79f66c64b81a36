use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::probe::{ProbeKey, SequenceCursor};

// ─── Failure classification ──────────────────────────────────────

/// Coarse failure class used by the reporting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Stalled,
    Exhausted,
    NotFound,
    Infra,
    ClockAnomaly,
    Config,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stalled => "stalled",
            Self::Exhausted => "exhausted",
            Self::NotFound => "not_found",
            Self::Infra => "infra",
            Self::ClockAnomaly => "clock_anomaly",
            Self::Config => "config",
        };
        f.write_str(s)
    }
}

/// Which budget ran out when a poll gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Wall-clock `max_wait` since the poll started.
    Time(Duration),
    /// `max_retries` ticks.
    Retries(u32),
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time(d) => write!(f, "time budget of {d:?}"),
            Self::Retries(n) => write!(f, "retry budget of {n} attempts"),
        }
    }
}

/// A metric that had not reached its target when polling stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMetric {
    pub name: String,
    /// `None` if the metric was never sampled (or never reported a value).
    pub last_value: Option<f64>,
}

impl fmt::Display for PendingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => write!(f, "{}=<absent>", self.name),
        }
    }
}

fn join_pending(pending: &[PendingMetric]) -> String {
    pending
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ─── Error type ──────────────────────────────────────────────────

/// Every fatal condition raised by the polling and probing layers.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A progress value stayed put for longer than the hang timeout.
    #[error("`{metric}` stalled at {last_value} for {stalled_for:?}")]
    Stalled {
        metric: String,
        last_value: f64,
        stalled_for: Duration,
    },

    /// Time or retry budget spent with metrics still short of the target.
    #[error("monitoring exhausted its {budget}: {} (expected {expected})", join_pending(.pending))]
    Exhausted {
        budget: Budget,
        pending: Vec<PendingMetric>,
        expected: String,
    },

    /// Nodes still unhealthy once the budget ran out.
    #[error("some nodes are not healthy after the {budget}: {}", .nodes.join(", "))]
    Unhealthy { nodes: Vec<String>, budget: Budget },

    /// The observer never saw the probe key before the timeout.
    #[error("key `{key}` not observed in change feed after {waited:?} (since {cursor})")]
    NotFound {
        key: ProbeKey,
        cursor: SequenceCursor,
        waited: Duration,
    },

    /// Non-success response or transport failure from a collaborator.
    #[error("{target}: {message}")]
    Infra { target: String, message: String },

    /// Observation confirmed before the write completed.
    #[error("observation of `{key}` precedes its write by {skew:?}")]
    ClockAnomaly { key: ProbeKey, skew: Duration },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MonitorError {
    #[must_use]
    pub fn infra(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Infra {
            target: target.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Stalled { .. } => FailureKind::Stalled,
            Self::Exhausted { .. } | Self::Unhealthy { .. } => FailureKind::Exhausted,
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::Infra { .. } | Self::InvalidState(_) => FailureKind::Infra,
            Self::ClockAnomaly { .. } => FailureKind::ClockAnomaly,
            Self::Config(_) => FailureKind::Config,
        }
    }
}

impl From<redis::RedisError> for MonitorError {
    fn from(err: redis::RedisError) -> Self {
        Self::infra("redis", err.to_string())
    }
}

impl From<tokio::task::JoinError> for MonitorError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::InvalidState(format!("probe task failed: {err}"))
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_metrics_and_expectation() {
        let err = MonitorError::Exhausted {
            budget: Budget::Retries(3),
            pending: vec![PendingMetric {
                name: "curr_items".into(),
                last_value: Some(998.0),
            }],
            expected: "1000".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("curr_items=998"), "{msg}");
        assert!(msg.contains("expected 1000"), "{msg}");
        assert!(msg.contains("3 attempts"), "{msg}");
        assert_eq!(err.kind(), FailureKind::Exhausted);
    }

    #[test]
    fn absent_pending_metric_is_marked() {
        let p = PendingMetric {
            name: "ep_queue_size".into(),
            last_value: None,
        };
        assert_eq!(p.to_string(), "ep_queue_size=<absent>");
    }

    #[test]
    fn kinds_cover_taxonomy() {
        let key = ProbeKey::from("K2");
        let not_found = MonitorError::NotFound {
            key: key.clone(),
            cursor: SequenceCursor::from("17"),
            waited: Duration::from_millis(5000),
        };
        assert_eq!(not_found.kind(), FailureKind::NotFound);
        assert!(not_found.to_string().contains("K2"));

        let skew = MonitorError::ClockAnomaly {
            key,
            skew: Duration::from_millis(5),
        };
        assert_eq!(skew.kind(), FailureKind::ClockAnomaly);
        assert_eq!(
            MonitorError::infra("sync_gateway", "503").kind(),
            FailureKind::Infra
        );
    }
}
