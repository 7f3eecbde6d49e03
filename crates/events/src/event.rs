//! Event type definitions for structured cache events.
//!
//! Every cache decision made during a run (hit, miss, bypass, save) and the
//! one-off "remote cache degraded" notice are represented here so that a
//! frontend can build a run summary without scraping log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A structured cache event with its capture metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    /// When the event was captured.
    pub timestamp: DateTime<Utc>,
    /// The tracing target the event was emitted under.
    pub target: String,
    /// The event payload.
    pub kind: CacheEventKind,
}

impl CacheEvent {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(target: impl Into<String>, kind: CacheEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            target: target.into(),
            kind,
        }
    }
}

/// Where a cache hit was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    /// The on-disk store.
    Local,
    /// The HTTP artifact store.
    Remote,
}

impl std::fmt::Display for HitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for HitSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("Unknown hit source: {other}")),
        }
    }
}

/// Cache event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEventKind {
    /// Outputs were restored (or already on disk) for the task.
    Hit {
        /// Task identifier (`package#task`).
        task: String,
        /// Task hash.
        hash: String,
        /// Which store served the hit.
        source: HitSource,
    },
    /// No artifact exists for the task hash.
    Miss {
        /// Task identifier.
        task: String,
        /// Task hash.
        hash: String,
    },
    /// Cache reads are disabled for the task.
    Bypass {
        /// Task identifier.
        task: String,
        /// Task hash.
        hash: String,
    },
    /// Outputs were archived after execution.
    Saved {
        /// Task identifier.
        task: String,
        /// Task hash.
        hash: String,
        /// Number of archived paths, log file included.
        file_count: u64,
    },
    /// Remote cache calls were switched off for the rest of the run.
    RemoteDegraded {
        /// Failures recorded when the breaker tripped.
        failures: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CacheEvent::new(
            "cachet::cache",
            CacheEventKind::Miss {
                task: "web#build".to_string(),
                hash: "abc123".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "miss");
        assert_eq!(json["kind"]["task"], "web#build");
    }

    #[test]
    fn test_hit_source_round_trips_through_display() {
        for source in [HitSource::Local, HitSource::Remote] {
            assert_eq!(source.to_string().parse::<HitSource>().unwrap(), source);
        }
        assert!("disk".parse::<HitSource>().is_err());
    }
}
