//! Configuration loading and schema definitions for cloudtest.
//!
//! This module provides types and functions for loading cloudtest
//! configuration from TOML files or strings. The schema defines providers,
//! executions, scheduling policy and reporting.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads cloudtest configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use cloudtest::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("cloudtest.toml"))?;
/// println!("Providers: {}", config.providers.len());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<CloudTestConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: CloudTestConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads cloudtest configuration from a TOML string.
///
/// # Example
///
/// ```
/// use cloudtest::config::load_config_str;
///
/// let config = load_config_str(r#"
///     timeout = 300
///
///     [[providers]]
///     name = "a_provider"
///     instances = 2
///     scripts = { start = "echo started" }
/// "#)?;
///
/// assert_eq!(config.timeout, 300);
/// assert_eq!(config.providers[0].instances, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<CloudTestConfig> {
    let config: CloudTestConfig = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
