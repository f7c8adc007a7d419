//! Observability infrastructure: tracing and metrics.
//!
//! The binary calls [`init`] once at startup. Library code only emits
//! `tracing` events and `metrics` counters; with no recorder installed the
//! counters are no-ops.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Default log level for a `-v` count.
pub fn level_for(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` directives take precedence over the level implied by
/// `verbosity`. Logs go to stderr so `status --json` output stays clean.
pub fn init(verbosity: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::builder()
        .with_default_directive(level_for(verbosity).into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 2)
                .with_level(true),
        )
        .try_init()?;

    metrics::register_core_metrics();

    tracing::debug!("Observability initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_verbosity() {
        assert_eq!(level_for(0), tracing::Level::WARN);
        assert_eq!(level_for(1), tracing::Level::INFO);
        assert_eq!(level_for(2), tracing::Level::DEBUG);
        assert_eq!(level_for(9), tracing::Level::TRACE);
    }
}
