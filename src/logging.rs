//! Tracing subscriber setup.
//!
//! The filter comes from `CONDUCTOR_LOG` (e.g. `CONDUCTOR_LOG=debug` or
//! `CONDUCTOR_LOG=info,client_output=debug`), falling back to the level passed
//! in. Client stdout/stderr is logged under the `client_output` target.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const ENV_LOG: &str = "CONDUCTOR_LOG";

/// Builds the filter from `CONDUCTOR_LOG`, or `default_level` when unset or invalid.
pub fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs the global subscriber, writing to `log_file` (appending) or stderr.
pub fn init(default_level: &str, log_file: Option<&Path>) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(default_level));
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
        }
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_filter_falls_back_to_default_level() {
        std::env::remove_var(ENV_LOG);
        assert_eq!(filter("warn").to_string(), "warn");
    }

    #[test]
    #[serial]
    fn test_filter_reads_env() {
        std::env::set_var(ENV_LOG, "debug");
        let rendered = filter("warn").to_string();
        std::env::remove_var(ENV_LOG);
        assert_eq!(rendered, "debug");
    }
}
