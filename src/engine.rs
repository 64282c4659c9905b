//! Container engine abstraction.
//!
//! The session never talks to a daemon directly. Everything it needs from the
//! container runtime is expressed by the [`ContainerEngine`] trait:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ContainerEngine                       │
//! │                                                          │
//! │  ping()            image_exists() / pull() / remove()    │
//! │  create_container() ──► id ──► start_container(id)       │
//! │  attach(id) ─────────────────► AttachedIo (stdin/stdout) │
//! │  exec(id, argv)    upload(id, dir, tar)   download(id)   │
//! │  kill(id)                                                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! [`docker::DockerEngine`] implements it with `bollard`. Unit tests use an
//! in-memory engine that runs a scripted supervisor over duplex pipes.

pub mod docker;

#[cfg(test)]
pub(crate) mod fake;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by a container engine.
///
/// Exec of a command that runs and exits non-zero is NOT an error; the exit
/// code is reported in [`ExecOutput`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to connect to container engine: {0}")]
    Connection(String),

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to attach to container: {0}")]
    AttachFailed(String),

    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    #[error("Failed to upload archive: {0}")]
    UploadFailed(String),

    #[error("Failed to download archive: {0}")]
    DownloadFailed(String),

    #[error("Image operation failed: {0}")]
    Image(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Other(#[from] anyhow::Error),
}

/// What to create: one long-lived supervisor container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, unique per session.
    pub name: String,
    /// Image reference, e.g. `dominikkorsa/runner:2.1.1`.
    pub image: String,
}

/// Readable half of an attached container (its stdout).
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Writable half of an attached container (its stdin).
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// The duplex byte stream connected to a container's standard streams.
pub struct AttachedIo {
    pub output: BoxedReader,
    pub input: BoxedWriter,
}

/// Outcome of a one-shot command executed inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Daemon operations consumed by the session.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Checks that the daemon answers.
    async fn ping(&self) -> EngineResult<()>;

    /// Returns whether the image is present locally.
    async fn image_exists(&self, image: &str) -> EngineResult<bool>;

    /// Pulls the image and waits for the pull to finish.
    async fn pull_image(&self, image: &str) -> EngineResult<()>;

    /// Removes the image from the daemon.
    async fn remove_image(&self, image: &str) -> EngineResult<()>;

    /// Creates a container and returns its id. The container is configured
    /// to remove itself when its main process exits.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    /// Attaches to stdin/stdout of a running container.
    async fn attach(&self, id: &str) -> EngineResult<AttachedIo>;

    /// Runs `argv` inside the container and waits for it to exit.
    async fn exec(&self, id: &str, argv: &[String]) -> EngineResult<ExecOutput>;

    /// Extracts a tar archive into directory `dir` of the container.
    async fn upload(&self, id: &str, dir: &str, archive: Vec<u8>) -> EngineResult<()>;

    /// Returns a tar archive holding the file or directory at `path`.
    async fn download(&self, id: &str, path: &str) -> EngineResult<Vec<u8>>;

    async fn kill(&self, id: &str) -> EngineResult<()>;

    /// Engine name, for logging.
    fn name(&self) -> &'static str;
}
