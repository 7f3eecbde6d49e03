//! Tracing subscriber setup for processes embedding the cache engine.
//!
//! Library code only emits through `tracing`; the embedding binary decides
//! where that output goes by calling [`init_tracing`] once at startup.

use std::io;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Tracing output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Multi-line human-readable format
    Pretty,
    /// Single-line format
    Compact,
    /// Structured JSON, one object per line
    Json,
}

impl std::str::FromStr for TracingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown tracing format: {s}")),
        }
    }
}

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Output format
    pub format: TracingFormat,
    /// Level applied to the `cachet*` crates when no filter is given
    pub level: Level,
    /// Explicit `EnvFilter` directive, overrides `level`
    pub filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: TracingFormat::Compact,
            level: Level::WARN,
            filter: None,
        }
    }
}

impl TracingConfig {
    /// Filter directive derived from this configuration.
    ///
    /// `RUST_LOG` is consulted by [`init_tracing`] before this is used.
    #[must_use]
    pub fn directive(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let level = self.level.as_str().to_lowercase();
        format!(
            "cachet_events={level},cachet_hash={level},cachet_cache={level},cachet_run_cache={level},cachet={level}"
        )
    }
}

/// Initialize the global tracing subscriber.
///
/// Output goes to stderr so task output written to stdout stays clean.
pub fn init_tracing(config: &TracingConfig) -> miette::Result<()> {
    let env_filter = if config.filter.is_some() {
        EnvFilter::try_new(config.directive())
    } else {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(config.directive()))
    }
    .map_err(|e| miette::miette!("Failed to create tracing filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        TracingFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_target(true),
            )
            .try_init(),
        TracingFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_target(false),
            )
            .try_init(),
        TracingFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true),
            )
            .try_init(),
    };
    result.map_err(|e| miette::miette!("Failed to install tracing subscriber: {e}"))?;

    tracing::debug!(format = ?config.format, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<TracingFormat>().unwrap(), TracingFormat::Json);
        assert_eq!(
            "compact".parse::<TracingFormat>().unwrap(),
            TracingFormat::Compact
        );
        assert!("dev".parse::<TracingFormat>().is_err());
    }

    #[test]
    fn test_directive_uses_level_for_every_crate() {
        let config = TracingConfig {
            level: Level::DEBUG,
            ..TracingConfig::default()
        };
        let directive = config.directive();
        assert!(directive.contains("cachet_cache=debug"));
        assert!(directive.contains("cachet_run_cache=debug"));
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = TracingConfig {
            filter: Some("cachet_cache=trace".to_string()),
            ..TracingConfig::default()
        };
        assert_eq!(config.directive(), "cachet_cache=trace");
    }
}
