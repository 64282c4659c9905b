//! Configuration loading for testjail.
//!
//! Configuration is optional. Command-line flags override whatever the file
//! sets, and a missing default file means built-in defaults.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "testjail.toml";

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not match the schema.
///
/// # Example
///
/// ```no_run
/// use testjail::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testjail.toml"))?;
/// println!("Image: {}", config.runner.image);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use testjail::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [pipeline]
///     chunk_size = 8
/// "#)?;
///
/// assert_eq!(config.pipeline.chunk_size, 8);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads `path`, falling back to defaults when it is the default file name
/// and does not exist. An explicitly named file must exist.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_FILE) {
        return Ok(Config::default());
    }
    load_config(path)
}
