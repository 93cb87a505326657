//! Logging setup.
//!
//! Logs always go to stderr: inside the worker, stdout carries the message
//! channel back to the launcher and must stay free of log lines.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: tracing filter (default: `pinflow=info`)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "pinflow=info";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, in `RUST_LOG` syntax.
    pub filter: String,
    /// Include the event target in each line.
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
            with_target: true,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_logging(config: &LogConfig) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(config.with_target)
                .with_filter(tracing_subscriber::EnvFilter::new(&config.filter)),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_does_not_panic() {
        let config = LogConfig {
            filter: "pinflow=debug".to_string(),
            with_target: false,
        };
        init_logging(&config);
        init_logging(&config);
    }
}
