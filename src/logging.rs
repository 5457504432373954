//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from the `TASKFORCE_LOG` environment variable, in
//! `EnvFilter` syntax (e.g. "debug" or "taskforce::eval=trace"), defaulting
//! to warnings only.  Logs go to stderr so that stdout carries only build
//! progress and task output.

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

pub const ENV_VAR: &str = "TASKFORCE_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Installs the global subscriber.  Fails if one is already installed.
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("initializing logging: {}", err))
}
