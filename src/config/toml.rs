//! TOML configuration file parsing
//!
//! ```toml
//! [workload]
//! workload_type = "verify"
//! io_size = 4096
//! queue_depth = 32
//! time_in_sec = 10
//!
//! [runtime]
//! show_period_sec = 1
//! cores = "0-1"
//!
//! [[devices]]
//! name = "Malloc0"
//! size = 67108864
//! block_size = 512
//! ```

use super::Config;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    cli.apply(&mut config)?;
    Ok(config)
}

/// Load the configuration named on the command line, or build one from the
/// command line alone
pub fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => merge_cli_with_config(cli, parse_toml_file(path)?),
        None => cli.to_config(),
    }
}
