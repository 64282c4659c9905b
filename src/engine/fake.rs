//! In-memory engine for unit tests.
//!
//! Containers share one fake filesystem keyed by absolute path. `attach`
//! spawns a scripted supervisor on a pair of duplex pipes: it reads request
//! lines, looks up the input file, asks the script for a [`Reply`] and writes
//! the encoded result, strictly one request at a time. `kill` ends the
//! supervisor at once, closing its stdout mid-backlog.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::Notify;

use super::{AttachedIo, ContainerEngine, ContainerSpec, EngineError, EngineResult, ExecOutput};
use crate::session::protocol::{self, Request, RunResult};
use crate::transfer::{self, Entry};

/// What the scripted supervisor answers to one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Success with the input copied to the output file.
    Echo,
    /// Success with the given output.
    Output(Vec<u8>),
    RuntimeError(String),
    Timeout,
    /// A line that is not valid base64 JSON.
    Garbage,
    /// Exit without answering.
    Exit,
    Delayed(Duration, Box<Reply>),
    /// Send the response line twice.
    Twice(Box<Reply>),
}

impl Reply {
    pub(crate) fn after(self, delay: Duration) -> Self {
        Reply::Delayed(delay, Box::new(self))
    }

    pub(crate) fn twice(self) -> Self {
        Reply::Twice(Box::new(self))
    }
}

/// Container filesystem and supervisor activity, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FakeEvent {
    /// An input file landed at this path.
    Uploaded(String),
    /// The supervisor read a request for this input path.
    Requested(String),
}

type Script = Arc<dyn Fn(&Request, &[u8]) -> Reply + Send + Sync>;

fn echo(_: &Request, _: &[u8]) -> Reply {
    Reply::Echo
}

#[derive(Default)]
struct Recorded {
    files: HashMap<String, Vec<u8>>,
    images: HashSet<String>,
    containers_created: usize,
    code_uploads: usize,
    input_batches: Vec<usize>,
    exec_calls: Vec<Vec<String>>,
    requests: Vec<Request>,
    kills: usize,
    pulls: usize,
    events: Vec<FakeEvent>,
    killers: HashMap<String, Arc<Notify>>,
    compile_failure: Option<String>,
    failing_input_batch: Option<usize>,
    fail_attach: bool,
}

struct FakeState {
    recorded: Mutex<Recorded>,
    script: Script,
}

impl FakeState {
    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }
}

/// Engine double backed by memory and a scripted supervisor.
#[derive(Clone)]
pub(crate) struct FakeEngine {
    state: Arc<FakeState>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::with_script_fn(Arc::new(echo))
    }

    fn with_script_fn(script: Script) -> Self {
        Self {
            state: Arc::new(FakeState {
                recorded: Mutex::new(Recorded::default()),
                script,
            }),
        }
    }

    pub(crate) fn with_script<F>(self, script: F) -> Self
    where
        F: Fn(&Request, &[u8]) -> Reply + Send + Sync + 'static,
    {
        let recorded = std::mem::take(&mut *self.state.recorded());
        let engine = Self::with_script_fn(Arc::new(script));
        *engine.state.recorded() = recorded;
        engine
    }

    /// Makes the next compilations exit with status 1 and this stderr.
    pub(crate) fn fail_compilation(&self, stderr: &str) {
        self.state.recorded().compile_failure = Some(stderr.to_string());
    }

    /// Makes the input upload with this zero-based index fail.
    pub(crate) fn fail_input_batch(&self, index: usize) {
        self.state.recorded().failing_input_batch = Some(index);
    }

    pub(crate) fn fail_attach(&self) {
        self.state.recorded().fail_attach = true;
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.recorded().files.get(path).cloned()
    }

    pub(crate) fn containers_created(&self) -> usize {
        self.state.recorded().containers_created
    }

    pub(crate) fn code_uploads(&self) -> usize {
        self.state.recorded().code_uploads
    }

    /// Entry count of every input archive uploaded, in order.
    pub(crate) fn input_batches(&self) -> Vec<usize> {
        self.state.recorded().input_batches.clone()
    }

    pub(crate) fn exec_calls(&self) -> Vec<Vec<String>> {
        self.state.recorded().exec_calls.clone()
    }

    /// Requests seen by the supervisor, in arrival order.
    pub(crate) fn requests(&self) -> Vec<Request> {
        self.state.recorded().requests.clone()
    }

    pub(crate) fn kills(&self) -> usize {
        self.state.recorded().kills
    }

    pub(crate) fn events(&self) -> Vec<FakeEvent> {
        self.state.recorded().events.clone()
    }

    pub(crate) fn pulls(&self) -> usize {
        self.state.recorded().pulls
    }
}

fn unpack(archive: &[u8]) -> std::io::Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push((name, data));
    }
    Ok(entries)
}

/// Flattens wrappers into (delay, copies, reply).
fn unwrap_reply(mut reply: Reply) -> (Duration, usize, Reply) {
    let mut delay = Duration::ZERO;
    let mut copies = 1;
    loop {
        match reply {
            Reply::Delayed(d, inner) => {
                delay += d;
                reply = *inner;
            }
            Reply::Twice(inner) => {
                copies = 2;
                reply = *inner;
            }
            other => return (delay, copies, other),
        }
    }
}

async fn supervise(
    stdin: DuplexStream,
    stdout: DuplexStream,
    state: Arc<FakeState>,
    killed: Arc<Notify>,
) {
    tokio::select! {
        _ = killed.notified() => {}
        _ = serve(stdin, stdout, state) => {}
    }
}

async fn serve(stdin: DuplexStream, mut stdout: DuplexStream, state: Arc<FakeState>) {
    let mut lines = BufReader::new(stdin).lines();
    let mut served = 0usize;

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = protocol::decode_line::<Request>(&line) else {
            continue;
        };

        let input = {
            let mut recorded = state.recorded();
            recorded.requests.push(request.clone());
            recorded
                .events
                .push(FakeEvent::Requested(request.input.clone()));
            recorded.files.get(&request.input).cloned()
        };
        let reply = match input {
            Some(input) => (state.script)(&request, &input),
            None => Reply::RuntimeError(format!("{}: No such file or directory", request.input)),
        };

        let (delay, copies, reply) = unwrap_reply(reply);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let output = match &reply {
            Reply::Echo => state.recorded().files.get(&request.input).cloned(),
            Reply::Output(output) => Some(output.clone()),
            _ => None,
        };

        let line = match reply {
            Reply::Exit => return,
            Reply::Garbage => "%%% not a response %%%".to_string(),
            Reply::RuntimeError(message) => protocol::encode_line(&RunResult::RuntimeError {
                message,
                stderr: None,
            })
            .unwrap(),
            Reply::Timeout => protocol::encode_line(&RunResult::Timeout).unwrap(),
            _ => {
                served += 1;
                let path = format!("/tmp/outputs/{}.out", served);
                state
                    .recorded()
                    .files
                    .insert(path.clone(), output.unwrap_or_default());
                protocol::encode_line(&RunResult::Success {
                    output_container_path: path,
                    time: delay.as_secs_f64(),
                })
                .unwrap()
            }
        };

        for _ in 0..copies {
            if stdout.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        Ok(self.state.recorded().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let mut recorded = self.state.recorded();
        recorded.pulls += 1;
        recorded.images.insert(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        if self.state.recorded().images.remove(image) {
            Ok(())
        } else {
            Err(EngineError::Image(format!("No such image: {}", image)))
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mut recorded = self.state.recorded();
        recorded.containers_created += 1;
        Ok(format!("{}-{}", spec.name, recorded.containers_created))
    }

    async fn start_container(&self, _id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn attach(&self, id: &str) -> EngineResult<AttachedIo> {
        let killed = Arc::new(Notify::new());
        {
            let mut recorded = self.state.recorded();
            if recorded.fail_attach {
                return Err(EngineError::AttachFailed("connection refused".to_string()));
            }
            recorded.killers.insert(id.to_string(), Arc::clone(&killed));
        }

        let (host_stdin, container_stdin) = tokio::io::duplex(64 * 1024);
        let (container_stdout, host_stdout) = tokio::io::duplex(64 * 1024);
        tokio::spawn(supervise(
            container_stdin,
            container_stdout,
            Arc::clone(&self.state),
            killed,
        ));

        Ok(AttachedIo {
            output: Box::pin(host_stdout),
            input: Box::pin(host_stdin),
        })
    }

    async fn exec(&self, _id: &str, argv: &[String]) -> EngineResult<ExecOutput> {
        let mut recorded = self.state.recorded();
        recorded.exec_calls.push(argv.to_vec());

        if let Some(stderr) = recorded.compile_failure.clone() {
            return Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr,
                duration: Duration::from_millis(1),
            });
        }

        if let [compiler, source, flag, binary] = argv {
            if compiler == "g++" && flag == "-o" {
                let code = recorded.files.get(source).cloned().unwrap_or_default();
                recorded.files.insert(binary.clone(), code);
            }
        }

        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        })
    }

    async fn upload(&self, _id: &str, dir: &str, archive: Vec<u8>) -> EngineResult<()> {
        let entries =
            unpack(&archive).map_err(|e| EngineError::UploadFailed(e.to_string()))?;
        let mut recorded = self.state.recorded();

        let is_inputs = entries.iter().any(|(name, _)| name.starts_with("inputs/"));
        if is_inputs {
            let index = recorded.input_batches.len();
            if recorded.failing_input_batch == Some(index) {
                recorded.input_batches.push(0);
                return Err(EngineError::UploadFailed("disk quota exceeded".to_string()));
            }
            recorded.input_batches.push(entries.len());
        } else {
            recorded.code_uploads += 1;
        }

        for (name, data) in entries {
            let path = format!("{}/{}", dir, name);
            if is_inputs {
                recorded.events.push(FakeEvent::Uploaded(path.clone()));
            }
            recorded.files.insert(path, data);
        }
        Ok(())
    }

    async fn download(&self, _id: &str, path: &str) -> EngineResult<Vec<u8>> {
        let data = self.state.recorded().files.get(path).cloned().ok_or_else(|| {
            EngineError::DownloadFailed(format!("Could not find the file {} in container", path))
        })?;
        let name = path.rsplit('/').next().unwrap_or(path);
        transfer::pack([Entry::new(name, data)])
            .map_err(|e| EngineError::DownloadFailed(e.to_string()))
    }

    async fn kill(&self, id: &str) -> EngineResult<()> {
        let mut recorded = self.state.recorded();
        recorded.kills += 1;
        if let Some(killed) = recorded.killers.remove(id) {
            killed.notify_one();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
