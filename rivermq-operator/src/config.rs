//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The Kubernetes namespace of this operator instance.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The period in seconds between full reconciliation resyncs.
    ///
    /// Failed or timed-out passes are retried on this cadence rather than immediately.
    #[serde(default = "Config::default_resync_seconds")]
    pub reconcile_resync_seconds: u64,
    /// The period in seconds between drain coordinator observation ticks.
    #[serde(default = "Config::default_drain_check_seconds")]
    pub drain_check_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_resync_seconds() -> u64 {
        30
    }

    fn default_drain_check_seconds() -> u64 {
        10
    }
}
