//! testjail: run untrusted C++ and Python programs against many inputs in one
//! reusable container.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Transfer**: tar packing for crossing the container boundary
//! - **Engine**: the container daemon operations, implemented with Docker
//! - **Session**: one long-lived supervisor container and its line protocol
//! - **Pipeline**: batched input upload overlapped with pipelined runs
//! - **Diff**: output normalization, chunking and display rows
//! - **Report**: progress events and the console result table
//!
//! # Example
//!
//! ```no_run
//! use testjail::engine::docker::DockerEngine;
//! use testjail::pipeline::{Destination, Pipeline, PipelineOptions, TestCase};
//! use testjail::report::NullReporter;
//! use testjail::session::{DEFAULT_IMAGE, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Session::new(DockerEngine::local()?, DEFAULT_IMAGE);
//!     session.start().await?;
//!     session.send_code(b"print(input())", ".py").await?;
//!
//!     let cases = vec![TestCase::new(
//!         "1.in",
//!         "tests/1.in",
//!         Destination::Compare("tests/1.out".into()),
//!     )];
//!     let summary = Pipeline::new(&session, &NullReporter, PipelineOptions::default())
//!         .run(&cases)
//!         .await;
//!
//!     session.stop().await?;
//!     println!("{} of {} passed", summary.passed, summary.total);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diff;
pub mod discovery;
pub mod engine;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod transfer;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use engine::ContainerEngine;
pub use pipeline::{CaseReport, Pipeline, RunSummary, TestCase, Verdict};
pub use report::Reporter;
pub use session::{RunResult, Session, SessionError};
