//! Container session: one long-lived supervisor container, many runs.
//!
//! The session creates a container from the runner image, attaches to its
//! standard streams and keeps them open. Requests are written to stdin as
//! protocol lines; results arrive on stdout in the same order.
//!
//! ```text
//!                 ┌────────── Session ──────────┐
//!  submit() ──►   │ writer lock                 │
//!                 │   push slot ─► FIFO ◄─ pop  │ ◄── read loop (task)
//!                 │   write line ─► stdin       │        ▲
//!                 └─────────────────────────────┘        │ stdout lines
//!                                   │                    │
//!                                   ▼                    │
//!                          ┌──────── container ────────────┐
//!                          │  supervisor: read, run, reply │
//!                          └───────────────────────────────┘
//! ```
//!
//! Because the supervisor answers strictly in order, the N-th response line
//! resolves the N-th queued slot. A slot is queued while the writer lock is
//! held, so queue order always equals the order of lines on the wire.
//!
//! ## Lifecycle
//!
//! `NotStarted ─start─► Running ─stop─► Stopping ─EOF─► Stopped ─start─► Running`
//!
//! A container that exits on its own (EOF on stdout) moves the session to
//! `Stopped` and fails every pending run with [`SessionError::ContainerExited`].

pub mod language;
pub mod protocol;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{BoxedReader, BoxedWriter, ContainerEngine, ContainerSpec, EngineError};
use crate::transfer::{self, Entry, Packer, TransferError};

pub use language::{ExecCommand, Language};
pub use protocol::{ProtocolError, Request, RunResult};

/// Runner image used when none is configured.
pub const DEFAULT_IMAGE: &str = "dominikkorsa/runner:2.1.1";

/// Container directory receiving code and the inputs directory.
pub const WORK_DIR: &str = "/tmp";

/// Name of the inputs directory inside [`WORK_DIR`].
pub const INPUTS_DIR_NAME: &str = "inputs";

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while driving a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Container is not started")]
    ContainerNotStarted,

    #[error("No code has been sent to the container")]
    CodeNotSent,

    #[error("Unsupported code extension: {0}")]
    UnknownExtension(String),

    #[error("Compilation failed with exit code {exit_code}")]
    CompileFailure { exit_code: i64, stderr: String },

    #[error("Received a response with no pending request")]
    ProtocolDesync,

    #[error("Container exited before responding")]
    ContainerExited,

    #[error("Malformed response from container: {0}")]
    MalformedResponse(String),

    #[error("Failed to encode request: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Container stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

type Slot = oneshot::Sender<SessionResult<RunResult>>;

/// Why the read loop stopped accepting slots.
#[derive(Debug, Clone, Copy)]
enum Closed {
    Exited,
    Desync,
}

impl Closed {
    fn error(self) -> SessionError {
        match self {
            Closed::Exited => SessionError::ContainerExited,
            Closed::Desync => SessionError::ProtocolDesync,
        }
    }
}

/// FIFO of response slots, shared by writers and the read loop.
#[derive(Default)]
struct SlotQueue {
    slots: VecDeque<Slot>,
    closed: Option<Closed>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One attached container.
struct Instance {
    generation: u64,
    container_id: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    queue: Arc<Mutex<SlotQueue>>,
    exited: watch::Receiver<bool>,
}

impl Instance {
    fn push_slot(&self, slot: Slot) -> SessionResult<()> {
        let mut queue = lock(&self.queue);
        match queue.closed {
            Some(closed) => Err(closed.error()),
            None => {
                queue.slots.push_back(slot);
                Ok(())
            }
        }
    }

    fn pop_last_slot(&self) {
        lock(&self.queue).slots.pop_back();
    }
}

struct Inner {
    state: SessionState,
    language: Option<Language>,
    instance: Option<Arc<Instance>>,
    generation: u64,
}

/// A run that has been written to the container and awaits its response.
#[derive(Debug)]
pub struct PendingRun {
    rx: oneshot::Receiver<SessionResult<RunResult>>,
}

impl PendingRun {
    /// Waits for the supervisor's response to this request.
    pub async fn wait(self) -> SessionResult<RunResult> {
        self.rx.await.unwrap_or(Err(SessionError::ContainerExited))
    }
}

/// A reusable sandbox container running the supervisor.
pub struct Session<E: ContainerEngine> {
    engine: Arc<E>,
    image: String,
    inner: Arc<Mutex<Inner>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<E: ContainerEngine + 'static> Session<E> {
    pub fn new(engine: E, image: impl Into<String>) -> Self {
        Self::with_engine(Arc::new(engine), image)
    }

    pub fn with_engine(engine: Arc<E>, image: impl Into<String>) -> Self {
        Self {
            engine,
            image: image.into(),
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::NotStarted,
                language: None,
                instance: None,
                generation: 0,
            })),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub fn is_started(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Language of the code currently loaded, if any.
    pub fn language(&self) -> Option<Language> {
        lock(&self.inner).language
    }

    /// Returns whether the container daemon answers.
    pub async fn ping(&self) -> bool {
        match self.engine.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("{} ping failed: {}", self.engine.name(), e);
                false
            }
        }
    }

    pub async fn is_image_pulled(&self) -> SessionResult<bool> {
        Ok(self.engine.image_exists(&self.image).await?)
    }

    /// Pulls the runner image unless it is already present.
    pub async fn pull_image(&self) -> SessionResult<()> {
        if self.is_image_pulled().await? {
            debug!("Image {} already present", self.image);
            return Ok(());
        }
        info!("Pulling image {}", self.image);
        self.engine.pull_image(&self.image).await?;
        Ok(())
    }

    /// Removes the runner image if it is present.
    pub async fn remove_image(&self) -> SessionResult<()> {
        if !self.is_image_pulled().await? {
            debug!("Image {} not present", self.image);
            return Ok(());
        }
        info!("Removing image {}", self.image);
        self.engine.remove_image(&self.image).await?;
        Ok(())
    }

    /// Creates, starts and attaches to a fresh container.
    ///
    /// Does nothing if the session is already running. A stopped session can
    /// be started again; the new container starts without any code loaded.
    pub async fn start(&self) -> SessionResult<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }

        let spec = ContainerSpec {
            name: format!("testjail-{}", Uuid::new_v4()),
            image: self.image.clone(),
        };
        let container_id = self.engine.create_container(&spec).await?;
        self.engine.start_container(&container_id).await?;

        let io = match self.engine.attach(&container_id).await {
            Ok(io) => io,
            Err(e) => {
                // Without stdin attached the supervisor would never exit on its own.
                if let Err(kill_err) = self.engine.kill(&container_id).await {
                    warn!("Failed to kill container {}: {}", container_id, kill_err);
                }
                return Err(e.into());
            }
        };

        let (exited_tx, exited_rx) = watch::channel(false);
        let queue = Arc::new(Mutex::new(SlotQueue::default()));
        let generation = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            let instance = Instance {
                generation: inner.generation,
                container_id: container_id.clone(),
                writer: tokio::sync::Mutex::new(io.input),
                queue: Arc::clone(&queue),
                exited: exited_rx,
            };
            inner.instance = Some(Arc::new(instance));
            inner.language = None;
            inner.state = SessionState::Running;
            inner.generation
        };

        tokio::spawn(read_loop(
            io.output,
            queue,
            exited_tx,
            Arc::downgrade(&self.inner),
            generation,
        ));

        info!("Started container {} from {}", spec.name, self.image);
        Ok(())
    }

    /// Moves a running session to `Stopping` and hands out its instance.
    fn begin_stopping(&self) -> Option<Arc<Instance>> {
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Running {
            return None;
        }
        inner.state = SessionState::Stopping;
        inner.instance.clone()
    }

    /// Closes the container's stdin and waits until its stdout ends.
    ///
    /// The supervisor finishes every request already written before it
    /// exits. Does nothing if the session is not running.
    pub async fn stop(&self) -> SessionResult<()> {
        let _guard = self.lifecycle.lock().await;
        let Some(instance) = self.begin_stopping() else {
            return Ok(());
        };

        let mut exited = instance.exited.clone();
        {
            let mut writer = instance.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                warn!("Failed to close container stdin: {}", e);
            }
        }
        drop(instance);

        // An error means the read loop is gone, which is as good as exited.
        let _ = exited.wait_for(|done| *done).await;
        debug!("Session stopped");
        Ok(())
    }

    /// Kills the container without serving queued requests and waits until
    /// its stdout ends. Pending runs fail with [`SessionError::ContainerExited`].
    ///
    /// Does nothing if the session is not running.
    pub async fn kill(&self) -> SessionResult<()> {
        let _guard = self.lifecycle.lock().await;
        let Some(instance) = self.begin_stopping() else {
            return Ok(());
        };

        let mut exited = instance.exited.clone();
        let container_id = instance.container_id.clone();
        drop(instance);

        self.engine.kill(&container_id).await?;
        let _ = exited.wait_for(|done| *done).await;
        info!("Killed container {}", container_id);
        Ok(())
    }

    fn running_instance(&self) -> SessionResult<(Arc<Instance>, Option<Language>)> {
        let inner = lock(&self.inner);
        match (&inner.state, &inner.instance) {
            (SessionState::Running, Some(instance)) => Ok((Arc::clone(instance), inner.language)),
            _ => Err(SessionError::ContainerNotStarted),
        }
    }

    fn set_language(&self, generation: u64, language: Option<Language>) {
        let mut inner = lock(&self.inner);
        if inner.generation == generation {
            inner.language = language;
        }
    }

    /// Uploads a program and compiles it when the language requires it.
    ///
    /// `extension` selects the language (`.cpp` or `.py`, dot optional). On
    /// an unknown extension nothing is uploaded and the current code stays
    /// loaded. Once the upload has begun, any failure leaves the session
    /// with no code loaded.
    pub async fn send_code(&self, code: &[u8], extension: &str) -> SessionResult<()> {
        let (instance, _) = self.running_instance()?;
        let language = Language::from_extension(extension)
            .ok_or_else(|| SessionError::UnknownExtension(extension.to_string()))?;

        self.set_language(instance.generation, None);

        let archive = transfer::pack([Entry::new(language.source_file_name(), code)])?;
        self.engine
            .upload(&instance.container_id, WORK_DIR, archive)
            .await?;

        if let Some(argv) = language.compile_command() {
            debug!("Compiling: {}", argv.join(" "));
            let output = self.engine.exec(&instance.container_id, &argv).await?;
            if !output.success() {
                return Err(SessionError::CompileFailure {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                });
            }
            debug!("Compiled in {:?}", output.duration);
        }

        self.set_language(instance.generation, Some(language));
        info!("Loaded {} code", language);
        Ok(())
    }

    /// Uploads a batch of inputs in one archive.
    ///
    /// Returns the container path of each input, in the order given.
    pub async fn send_inputs<I>(&self, inputs: &[I]) -> SessionResult<Vec<String>>
    where
        I: AsRef<[u8]>,
    {
        let (instance, _) = self.running_instance()?;
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let names = input_file_names(inputs.len());
        let mut packer = Packer::new();
        for (name, data) in names.iter().zip(inputs) {
            packer.append(&format!("{}/{}", INPUTS_DIR_NAME, name), data.as_ref())?;
        }
        let archive = packer.finish()?;

        self.engine
            .upload(&instance.container_id, WORK_DIR, archive)
            .await?;
        debug!("Uploaded {} inputs", names.len());

        Ok(names
            .into_iter()
            .map(|name| format!("{}/{}/{}", WORK_DIR, INPUTS_DIR_NAME, name))
            .collect())
    }

    pub async fn send_input(&self, input: &[u8]) -> SessionResult<String> {
        let mut paths = self.send_inputs(&[input]).await?;
        paths.pop().ok_or(SessionError::ContainerExited)
    }

    /// Writes a run request and returns a handle to its response.
    ///
    /// The request is on the wire when this returns, so calling `submit`
    /// repeatedly pipelines runs in call order.
    pub async fn submit(&self, input_path: &str, timeout_secs: f64) -> SessionResult<PendingRun> {
        let (instance, language) = self.running_instance()?;
        let language = language.ok_or(SessionError::CodeNotSent)?;

        let request = Request {
            input: input_path.to_string(),
            command: language.exec_command().to_command_line(),
            timeout: timeout_secs,
        };
        let mut line = protocol::encode_line(&request)?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        let mut writer = instance.writer.lock().await;
        instance.push_slot(tx)?;

        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            instance.pop_last_slot();
            return Err(e.into());
        }

        Ok(PendingRun { rx })
    }

    /// Runs the loaded program on an uploaded input and waits for the result.
    pub async fn run(&self, input_path: &str, timeout_secs: f64) -> SessionResult<RunResult> {
        self.submit(input_path, timeout_secs).await?.wait().await
    }

    /// Downloads the contents of a file from the container.
    pub async fn get_output(&self, path: &str) -> SessionResult<Vec<u8>> {
        let (instance, _) = self.running_instance()?;
        let archive = self.engine.download(&instance.container_id, path).await?;
        let name = path.rsplit('/').next().unwrap_or(path);
        Ok(transfer::extract(archive.as_slice(), name)?)
    }
}

/// Generates unique `<unix-seconds>-<random>.in` names for one batch.
fn input_file_names(count: usize) -> Vec<String> {
    let timestamp = chrono::Utc::now().timestamp();
    let mut rng = rand::thread_rng();
    let mut seen = HashSet::with_capacity(count);
    let mut names = Vec::with_capacity(count);

    while names.len() < count {
        let name = format!(
            "{}-{}.in",
            timestamp,
            rng.gen_range(10_000_000u64..100_000_000)
        );
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}

/// Resolves queued slots from the container's stdout until it ends.
async fn read_loop(
    output: BoxedReader,
    queue: Arc<Mutex<SlotQueue>>,
    exited: watch::Sender<bool>,
    inner: Weak<Mutex<Inner>>,
    generation: u64,
) {
    let mut lines = BufReader::new(output).lines();
    let mut closed = Closed::Exited;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read from container: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let slot = lock(&queue).slots.pop_front();
        let Some(slot) = slot else {
            error!("Container sent a response with no pending request");
            closed = Closed::Desync;
            break;
        };

        let result = protocol::decode_line::<RunResult>(line)
            .map_err(|e| SessionError::MalformedResponse(e.to_string()));
        if let Err(e) = &result {
            warn!("{}", e);
        }
        // The receiver may have been dropped; the response is simply discarded.
        let _ = slot.send(result);
    }

    if let Some(inner) = inner.upgrade() {
        let mut inner = lock(&inner);
        if inner.generation == generation {
            inner.state = SessionState::Stopped;
            inner.language = None;
            inner.instance = None;
        }
    }

    let pending: Vec<Slot> = {
        let mut queue = lock(&queue);
        queue.closed = Some(closed);
        queue.slots.drain(..).collect()
    };
    if !pending.is_empty() {
        warn!("Failing {} pending runs: {}", pending.len(), closed.error());
    }
    for slot in pending {
        let _ = slot.send(Err(closed.error()));
    }

    let _ = exited.send(true);
    debug!("Container read loop finished");
}
