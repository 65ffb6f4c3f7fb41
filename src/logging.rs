//! Process-wide tracing setup

use crate::config::LoggingConfig;
use std::sync::Once;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Target used for log lines forwarded from the native engine
pub const NATIVE_TARGET: &str = "mullama_bridge::native";

static INIT_TRACING: Once = Once::new();

/// Install the global subscriber; later calls are no-ops
///
/// `RUST_LOG` takes precedence over `config.level`.
pub fn init_logging(config: &LoggingConfig) {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

        let installed = if config.structured {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_names(true)
                .try_init()
        };

        if installed.is_ok() {
            info!(level = %config.level, structured = config.structured, "tracing initialized");
        }
    });
}

/// Level for this crate, with the chatty native target kept one notch down
fn default_directives(level: &str) -> String {
    let native = match level {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "warn",
        other => other,
    };
    format!("{level},{NATIVE_TARGET}={native}")
}
