//! Custom tracing Layer for capturing cache events.
//!
//! This layer intercepts tracing events whose target starts with
//! `cachet::cache`, converts them to [`CacheEvent`] instances, and sends them
//! to a channel.

use crate::event::{CacheEvent, CacheEventKind, HitSource};
use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

/// Target prefix shared by every cache event macro.
pub const CACHE_EVENT_TARGET: &str = "cachet::cache";

/// A tracing Layer that captures cache events.
///
/// Events are identified by their `target` and an `event_type` field.
pub struct CacheEventLayer {
    sender: mpsc::UnboundedSender<CacheEvent>,
}

impl CacheEventLayer {
    /// Create a new layer that sends events to the given channel.
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<CacheEvent>) -> Self {
        Self { sender }
    }
}

impl<S> Layer<S> for CacheEventLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if !target.starts_with(CACHE_EVENT_TARGET) {
            return;
        }

        let mut visitor = CacheEventVisitor::default();
        event.record(&mut visitor);

        if let Some(kind) = visitor.build() {
            let _ = self.sender.send(CacheEvent::new(target, kind));
        }
    }
}

#[derive(Default)]
struct CacheEventVisitor {
    event_type: Option<String>,
    task: Option<String>,
    hash: Option<String>,
    source: Option<String>,
    file_count: Option<u64>,
    failures: Option<u64>,
}

impl CacheEventVisitor {
    fn build(self) -> Option<CacheEventKind> {
        let kind = match self.event_type.as_deref()? {
            "cache.hit" => CacheEventKind::Hit {
                task: self.task?,
                hash: self.hash?,
                source: self.source?.parse::<HitSource>().ok()?,
            },
            "cache.miss" => CacheEventKind::Miss {
                task: self.task?,
                hash: self.hash?,
            },
            "cache.bypass" => CacheEventKind::Bypass {
                task: self.task?,
                hash: self.hash?,
            },
            "cache.saved" => CacheEventKind::Saved {
                task: self.task?,
                hash: self.hash?,
                file_count: self.file_count.unwrap_or(0),
            },
            "cache.remote_degraded" => CacheEventKind::RemoteDegraded {
                failures: self.failures?,
            },
            _ => return None,
        };
        Some(kind)
    }

    fn set_string(&mut self, name: &str, value: String) {
        match name {
            "event_type" => self.event_type = Some(value),
            "task" => self.task = Some(value),
            "hash" => self.hash = Some(value),
            "source" => self.source = Some(value),
            _ => {}
        }
    }
}

impl Visit for CacheEventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set_string(field.name(), value.to_string());
    }

    #[allow(clippy::cast_sign_loss)]
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_u64(field, value.max(0) as u64);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "file_count" => self.file_count = Some(value),
            "failures" => self.failures = Some(value),
            _ => {}
        }
    }

    // `%value` fields arrive here; their Debug output is the Display output.
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.set_string(field.name(), format!("{value:?}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn test_layer_captures_cache_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(CacheEventLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(
                target: "cachet::cache",
                event_type = "cache.hit",
                task = "web#build",
                hash = "0011aabb",
                source = "remote",
            );
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            CacheEventKind::Hit {
                task: "web#build".to_string(),
                hash: "0011aabb".to_string(),
                source: HitSource::Remote,
            }
        );
    }

    #[tokio::test]
    async fn test_layer_ignores_other_targets() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(CacheEventLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(
                target: "other::target",
                event_type = "cache.miss",
                task = "web#build",
                hash = "0011aabb",
            );
        });

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_layer_drops_incomplete_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(CacheEventLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            // no hash field
            tracing::info!(target: "cachet::cache", event_type = "cache.miss", task = "web#build");
        });

        assert!(rx.try_recv().is_err());
    }
}
