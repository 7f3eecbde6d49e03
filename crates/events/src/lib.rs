//! Structured cache events for cachet.
//!
//! Cache decisions are emitted as `tracing` events under the
//! `cachet::cache` target with an `event_type` field. A frontend that wants a
//! typed stream installs [`CacheEventLayer`]; everything else just sees
//! ordinary log records.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cachet_events::{CacheEventLayer, emit_cache_hit};
//! use tracing_subscriber::layer::SubscriberExt;
//! use tracing_subscriber::util::SubscriberInitExt;
//!
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! tracing_subscriber::registry()
//!     .with(CacheEventLayer::new(tx))
//!     .init();
//!
//! emit_cache_hit!("web#build", "4f1c2d0e9a8b7c6d", "local");
//! ```

pub mod event;
pub mod layer;
pub mod redaction;
pub mod tracing;

pub use event::{CacheEvent, CacheEventKind, HitSource};
pub use layer::{CACHE_EVENT_TARGET, CacheEventLayer};
pub use redaction::{REDACTED_PLACEHOLDER, redact, register_secret};

// ============================================================================
// Emit Macros
// ============================================================================

/// Emit a cache hit event.
///
/// # Example
/// ```rust,ignore
/// emit_cache_hit!("web#build", "4f1c2d0e9a8b7c6d", "remote");
/// ```
#[macro_export]
macro_rules! emit_cache_hit {
    ($task:expr, $hash:expr, $source:expr) => {
        ::tracing::info!(
            target: "cachet::cache",
            event_type = "cache.hit",
            task = %$task,
            hash = %$hash,
            source = %$source,
        )
    };
}

/// Emit a cache miss event.
#[macro_export]
macro_rules! emit_cache_miss {
    ($task:expr, $hash:expr) => {
        ::tracing::info!(
            target: "cachet::cache",
            event_type = "cache.miss",
            task = %$task,
            hash = %$hash,
        )
    };
}

/// Emit a cache bypass event (reads disabled or caching off for the task).
#[macro_export]
macro_rules! emit_cache_bypass {
    ($task:expr, $hash:expr) => {
        ::tracing::info!(
            target: "cachet::cache",
            event_type = "cache.bypass",
            task = %$task,
            hash = %$hash,
        )
    };
}

/// Emit an outputs-saved event.
///
/// # Example
/// ```rust,ignore
/// emit_cache_saved!("web#build", "4f1c2d0e9a8b7c6d", 12_u64);
/// ```
#[macro_export]
macro_rules! emit_cache_saved {
    ($task:expr, $hash:expr, $file_count:expr) => {
        ::tracing::info!(
            target: "cachet::cache",
            event_type = "cache.saved",
            task = %$task,
            hash = %$hash,
            file_count = $file_count,
        )
    };
}

/// Emit the one-per-run notice that the remote cache was switched off.
#[macro_export]
macro_rules! emit_remote_degraded {
    ($failures:expr) => {
        ::tracing::warn!(
            target: "cachet::cache",
            event_type = "cache.remote_degraded",
            failures = $failures,
            "remote cache disabled for the rest of this run after repeated failures"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(f: impl FnOnce()) -> Vec<CacheEventKind> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(CacheEventLayer::new(tx));
        ::tracing::subscriber::with_default(subscriber, f);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.kind);
        }
        events
    }

    #[test]
    fn test_macros_round_trip_through_layer() {
        let events = capture(|| {
            emit_cache_miss!("web#build", "aa");
            emit_cache_hit!("web#build", "aa", HitSource::Local);
            emit_cache_bypass!("api#test", "bb");
            emit_cache_saved!("web#build", "aa", 3_u64);
            emit_remote_degraded!(3_u64);
        });

        assert_eq!(
            events,
            vec![
                CacheEventKind::Miss {
                    task: "web#build".into(),
                    hash: "aa".into()
                },
                CacheEventKind::Hit {
                    task: "web#build".into(),
                    hash: "aa".into(),
                    source: HitSource::Local
                },
                CacheEventKind::Bypass {
                    task: "api#test".into(),
                    hash: "bb".into()
                },
                CacheEventKind::Saved {
                    task: "web#build".into(),
                    hash: "aa".into(),
                    file_count: 3
                },
                CacheEventKind::RemoteDegraded { failures: 3 },
            ]
        );
    }
}
