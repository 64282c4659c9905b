//! Configuration schema for testjail.
//!
//! Every section and field is optional; an empty file is a valid
//! configuration.
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig     - Runner image, daemon address, time limit
//! ├── PipelineConfig   - Batch size for input uploads
//! └── CompareConfig    - Diff strategy and result table options
//! ```

use serde::{Deserialize, Serialize};

use crate::diff::Strategy;
use crate::pipeline::{DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT_SECS};
use crate::session::DEFAULT_IMAGE;

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [runner]
/// image = "dominikkorsa/runner:2.1.1"
/// time_limit_secs = 10
///
/// [pipeline]
/// chunk_size = 50
///
/// [compare]
/// strategy = "line-by-line"
/// hide_success = true
/// ```
///
/// # Example
///
/// ```
/// use testjail::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [runner]
///     time_limit_secs = 2.5
/// "#).unwrap();
/// assert_eq!(config.runner.time_limit_secs, 2.5);
/// assert_eq!(config.pipeline.chunk_size, 50);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub compare: CompareConfig,
}

/// Settings for the container that runs the code.
///
/// | Field | Default |
/// |-------|---------|
/// | `image` | `dominikkorsa/runner:2.1.1` |
/// | `docker_host` | None (local socket) |
/// | `time_limit_secs` | 30 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Runner image with the supervisor as its default command.
    #[serde(default = "default_image")]
    pub image: String,

    /// Docker daemon address, e.g. `unix:///var/run/docker.sock` or
    /// `tcp://127.0.0.1:2375`.
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Per-run wall-clock limit in seconds.
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            docker_host: None,
            time_limit_secs: default_time_limit(),
        }
    }
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_time_limit() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Inputs uploaded per archive.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CompareConfig {
    /// How wrong answers are aligned for display.
    #[serde(default)]
    pub strategy: Strategy,

    /// Leave passing cases out of the result table.
    #[serde(default)]
    pub hide_success: bool,
}
