//! Batched, pipelined execution of many test cases in one session.
//!
//! Three stages run as joined futures on the caller's task:
//!
//! ```text
//!   transfer (per batch)        dispatch (per case)         completion (all cases)
//!  ┌─────────────────────┐     ┌─────────────────────┐     ┌──────────────────────┐
//!  │ read batch inputs   │     │ await "transferred" │     │ await run result     │
//!  │ send_inputs(batch)  │──►  │ submit(path)        │──►  │ save output  or      │
//!  │ resolve transferred │     │ (does not wait)     │     │ download + diff      │
//!  └─────────────────────┘     └─────────────────────┘     └──────────────────────┘
//!        batch i+1 starts            case j+1 submitted           all concurrent
//!        after batch i               right after case j
//! ```
//!
//! While batch `i + 1` is uploading, the container is already executing the
//! runs of batch `i`. Every case ends with exactly one [`CaseReport`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::diff::{self, Judgement};
use crate::engine::ContainerEngine;
use crate::report::Reporter;
use crate::session::{PendingRun, RunResult, Session, SessionError};

/// Default number of inputs uploaded per archive.
pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// Default per-run time limit in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// What to do with the program's output once a run succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Write the output to this file.
    Save(PathBuf),
    /// Compare the output with the contents of this file.
    Compare(PathBuf),
    /// Only record that the run succeeded.
    Discard,
}

/// One input to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// Display identifier, usually the input path relative to its root.
    pub id: String,
    pub input: PathBuf,
    pub destination: Destination,
}

impl TestCase {
    pub fn new(id: impl Into<String>, input: impl Into<PathBuf>, destination: Destination) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            destination,
        }
    }
}

/// Final classification of a case that ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Output matched the expected output.
    Success { time: f64 },
    WrongAnswer {
        time: f64,
        expected: Vec<String>,
        actual: Vec<String>,
    },
    RuntimeError {
        message: String,
        stderr: Option<String>,
    },
    Timeout,
    /// Ran to completion with nothing to compare against.
    Completed { time: f64 },
}

impl Verdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Verdict::Success { .. } => VerdictKind::Success,
            Verdict::WrongAnswer { .. } => VerdictKind::WrongAnswer,
            Verdict::RuntimeError { .. } => VerdictKind::RuntimeError,
            Verdict::Timeout => VerdictKind::Timeout,
            Verdict::Completed { .. } => VerdictKind::Completed,
        }
    }

    /// Execution time in seconds, when the program finished.
    pub fn time(&self) -> Option<f64> {
        match self {
            Verdict::Success { time }
            | Verdict::WrongAnswer { time, .. }
            | Verdict::Completed { time } => Some(*time),
            Verdict::RuntimeError { .. } | Verdict::Timeout => None,
        }
    }
}

/// Verdict categories, plus `Error` for cases that never got one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VerdictKind {
    Success,
    Completed,
    WrongAnswer,
    RuntimeError,
    Timeout,
    Error,
}

impl VerdictKind {
    pub fn is_pass(self) -> bool {
        matches!(self, VerdictKind::Success | VerdictKind::Completed)
    }
}

/// Why a case has no verdict.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaseError {
    #[error("Failed to read input {}: {message}", .path.display())]
    ReadInput { path: PathBuf, message: String },

    #[error("Failed to transfer input: {0}")]
    Transfer(Arc<SessionError>),

    #[error("Failed to run: {0}")]
    Run(Arc<SessionError>),

    #[error("Failed to fetch output: {0}")]
    FetchOutput(Arc<SessionError>),

    #[error("Failed to read expected output {}: {message}", .path.display())]
    ReadExpected { path: PathBuf, message: String },

    #[error("Failed to save output to {}: {message}", .path.display())]
    SaveOutput { path: PathBuf, message: String },

    #[error("Pipeline stopped before the case was run")]
    Aborted,
}

/// Outcome of a single case.
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub case: TestCase,
    pub outcome: Result<Verdict, CaseError>,
}

impl CaseReport {
    pub fn kind(&self) -> VerdictKind {
        match &self.outcome {
            Ok(verdict) => verdict.kind(),
            Err(_) => VerdictKind::Error,
        }
    }

    pub fn passed(&self) -> bool {
        self.kind().is_pass()
    }
}

/// Aggregated result of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: usize,
    /// Cases with `Success` or `Completed`.
    pub passed: usize,
    pub wrong_answer: usize,
    pub runtime_error: usize,
    pub timeout: usize,
    /// Cases that failed before getting a verdict.
    pub errors: usize,
    pub duration: Duration,
    /// Per-case reports, in case order.
    pub reports: Vec<CaseReport>,
}

impl RunSummary {
    fn from_reports(reports: Vec<CaseReport>, duration: Duration) -> Self {
        let mut summary = RunSummary {
            total: reports.len(),
            duration,
            ..Default::default()
        };
        for report in &reports {
            match report.kind() {
                VerdictKind::Success | VerdictKind::Completed => summary.passed += 1,
                VerdictKind::WrongAnswer => summary.wrong_answer += 1,
                VerdictKind::RuntimeError => summary.runtime_error += 1,
                VerdictKind::Timeout => summary.timeout += 1,
                VerdictKind::Error => summary.errors += 1,
            }
        }
        summary.reports = reports;
        summary
    }

    /// Every case passed.
    pub fn success(&self) -> bool {
        self.passed == self.total
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Tunables for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Inputs per upload; values below 1 are treated as 1.
    pub chunk_size: usize,
    pub timeout_secs: f64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

type Transferred = Result<String, CaseError>;
type Submitted = Result<PendingRun, CaseError>;

/// Runs test cases through a started session with loaded code.
pub struct Pipeline<'a, E: ContainerEngine, R: Reporter + ?Sized> {
    session: &'a Session<E>,
    reporter: &'a R,
    options: PipelineOptions,
}

impl<'a, E, R> Pipeline<'a, E, R>
where
    E: ContainerEngine + 'static,
    R: Reporter + ?Sized,
{
    pub fn new(session: &'a Session<E>, reporter: &'a R, options: PipelineOptions) -> Self {
        Self {
            session,
            reporter,
            options,
        }
    }

    /// Runs every case and returns their reports in case order.
    pub async fn run(&self, cases: &[TestCase]) -> RunSummary {
        let start = Instant::now();
        self.reporter.on_cases_discovered(cases).await;

        let rejected = if !self.session.is_started() {
            Some(SessionError::ContainerNotStarted)
        } else if self.session.language().is_none() {
            Some(SessionError::CodeNotSent)
        } else {
            None
        };
        if let Some(error) = rejected {
            warn!("{}, failing {} cases", error, cases.len());
            return self.reject_all(cases, error, start).await;
        }

        let (transferred_tx, transferred_rx): (Vec<_>, Vec<_>) =
            cases.iter().map(|_| oneshot::channel::<Transferred>()).unzip();
        let (submitted_tx, submitted_rx): (Vec<_>, Vec<_>) =
            cases.iter().map(|_| oneshot::channel::<Submitted>()).unzip();

        let completion = join_all(
            cases
                .iter()
                .zip(submitted_rx)
                .map(|(case, rx)| self.complete(case, rx)),
        );

        let ((), (), reports) = tokio::join!(
            self.transfer_stage(cases, transferred_tx),
            self.dispatch_stage(transferred_rx, submitted_tx),
            completion,
        );

        let summary = RunSummary::from_reports(reports, start.elapsed());
        self.reporter.on_pipeline_complete(&summary).await;
        summary
    }

    /// Fails every case with the same error without transferring anything.
    async fn reject_all(&self, cases: &[TestCase], error: SessionError, start: Instant) -> RunSummary {
        let error = Arc::new(error);
        let mut reports = Vec::with_capacity(cases.len());
        for case in cases {
            let report = CaseReport {
                case: case.clone(),
                outcome: Err(CaseError::Run(Arc::clone(&error))),
            };
            self.reporter.on_case_done(&report).await;
            reports.push(report);
        }

        let summary = RunSummary::from_reports(reports, start.elapsed());
        self.reporter.on_pipeline_complete(&summary).await;
        summary
    }

    async fn transfer_stage(&self, cases: &[TestCase], senders: Vec<oneshot::Sender<Transferred>>) {
        let chunk_size = self.options.chunk_size.max(1);
        let mut senders = senders.into_iter();

        for (index, batch) in cases.chunks(chunk_size).enumerate() {
            let batch_senders: Vec<_> = senders.by_ref().take(batch.len()).collect();
            let results = self.transfer_batch(batch).await;

            let sent = results.iter().filter(|r| r.is_ok()).count();
            debug!("Batch {}: {}/{} inputs transferred", index, sent, batch.len());
            if sent > 0 {
                self.reporter.on_inputs_sent(sent).await;
            }

            for (tx, result) in batch_senders.into_iter().zip(results) {
                let _ = tx.send(result);
            }
        }
    }

    /// Reads and uploads one batch. Unreadable inputs fail alone; an upload
    /// failure fails every readable input of the batch.
    async fn transfer_batch(&self, batch: &[TestCase]) -> Vec<Transferred> {
        let reads = join_all(batch.iter().map(|case| read_input(&case.input))).await;

        let readable: Vec<&Vec<u8>> = reads.iter().filter_map(|r| r.as_ref().ok()).collect();
        let uploaded = if readable.is_empty() {
            Ok(Vec::new())
        } else {
            self.session.send_inputs(&readable).await
        };

        let mut paths = match uploaded {
            Ok(paths) => Ok(paths.into_iter()),
            Err(e) => {
                warn!("Failed to transfer batch of {} inputs: {}", readable.len(), e);
                Err(Arc::new(e))
            }
        };

        reads
            .into_iter()
            .map(|read| -> Transferred {
                read?;
                match &mut paths {
                    Ok(paths) => paths.next().ok_or(CaseError::Aborted),
                    Err(e) => Err(CaseError::Transfer(Arc::clone(e))),
                }
            })
            .collect()
    }

    async fn dispatch_stage(
        &self,
        transferred: Vec<oneshot::Receiver<Transferred>>,
        submitted: Vec<oneshot::Sender<Submitted>>,
    ) {
        for (rx, tx) in transferred.into_iter().zip(submitted) {
            let result = match rx.await {
                Ok(Ok(path)) => self
                    .session
                    .submit(&path, self.options.timeout_secs)
                    .await
                    .map_err(|e| CaseError::Run(Arc::new(e))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(CaseError::Aborted),
            };
            let _ = tx.send(result);
        }
    }

    async fn complete(&self, case: &TestCase, submitted: oneshot::Receiver<Submitted>) -> CaseReport {
        let outcome = self.complete_case(case, submitted).await;
        if let Err(e) = &outcome {
            debug!("{}: {}", case.id, e);
        }

        let report = CaseReport {
            case: case.clone(),
            outcome,
        };
        self.reporter.on_case_done(&report).await;
        report
    }

    async fn complete_case(
        &self,
        case: &TestCase,
        submitted: oneshot::Receiver<Submitted>,
    ) -> Result<Verdict, CaseError> {
        let pending = submitted.await.map_err(|_| CaseError::Aborted)??;
        let result = pending
            .wait()
            .await
            .map_err(|e| CaseError::Run(Arc::new(e)))?;
        self.reporter.on_run_complete(case).await;

        match result {
            RunResult::Success {
                output_container_path,
                time,
            } => self.finish(case, &output_container_path, time).await,
            RunResult::RuntimeError { message, stderr } => {
                Ok(Verdict::RuntimeError { message, stderr })
            }
            RunResult::Timeout => Ok(Verdict::Timeout),
        }
    }

    async fn finish(&self, case: &TestCase, output_path: &str, time: f64) -> Result<Verdict, CaseError> {
        match &case.destination {
            Destination::Discard => Ok(Verdict::Completed { time }),
            Destination::Save(path) => {
                let output = self.fetch_output(output_path).await?;
                save_output(path, &output).await?;
                Ok(Verdict::Completed { time })
            }
            Destination::Compare(expected_path) => {
                let expected = tokio::fs::read(expected_path).await.map_err(|e| {
                    CaseError::ReadExpected {
                        path: expected_path.clone(),
                        message: e.to_string(),
                    }
                })?;
                let actual = self.fetch_output(output_path).await?;

                let verdict = match diff::judge(
                    &String::from_utf8_lossy(&expected),
                    &String::from_utf8_lossy(&actual),
                ) {
                    Judgement::Accepted => Verdict::Success { time },
                    Judgement::WrongAnswer { expected, actual } => Verdict::WrongAnswer {
                        time,
                        expected,
                        actual,
                    },
                };
                Ok(verdict)
            }
        }
    }

    async fn fetch_output(&self, path: &str) -> Result<Vec<u8>, CaseError> {
        self.session
            .get_output(path)
            .await
            .map_err(|e| CaseError::FetchOutput(Arc::new(e)))
    }
}

async fn read_input(path: &Path) -> Result<Vec<u8>, CaseError> {
    tokio::fs::read(path).await.map_err(|e| CaseError::ReadInput {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

async fn save_output(path: &Path, output: &[u8]) -> Result<(), CaseError> {
    let save_err = |e: std::io::Error| CaseError::SaveOutput {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(save_err)?;
    }
    tokio::fs::write(path, output).await.map_err(save_err)
}
