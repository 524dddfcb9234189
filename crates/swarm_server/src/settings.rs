//! Configuration loading for the daemon.

use anyhow::{Context, Result};
use std::path::Path;
use swarm_cluster::SwarmConfig;

/// Load a JSON config file, or the defaults when no path is given
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid JSON, or
/// holds out-of-range values
pub fn load(path: Option<&Path>) -> Result<SwarmConfig> {
    let Some(path) = path else {
        return Ok(SwarmConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    SwarmConfig::from_json(&text).with_context(|| format!("loading config file {}", path.display()))
}
