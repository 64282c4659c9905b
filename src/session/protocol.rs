//! Wire format spoken with the in-container supervisor.
//!
//! Every message is one line: the base64 (standard alphabet, padded) encoding
//! of a JSON document, followed by `\n`.
//!
//! ```text
//! host ──► base64({"input":"/tmp/inputs/1700000000-12345678.in","command":"/tmp/code","timeout":30.0})
//! host ◄── base64({"type":"success","outputContainerPath":"/tmp/outputs/1.out","time":0.012})
//! ```
//!
//! Responses come back in request order; there is no request id on the wire.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors produced while encoding or decoding a protocol line.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A run request for the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Container path of the input file fed to stdin.
    pub input: String,
    /// Command line to execute, split by the supervisor with shell rules.
    pub command: String,
    /// Wall-clock limit in seconds, enforced by the supervisor.
    pub timeout: f64,
}

/// Outcome of one run request, exactly as reported by the supervisor.
///
/// A runtime error or a timeout is a property of the tested program, not a
/// failure of the session, so both are ordinary values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunResult {
    Success {
        #[serde(rename = "outputContainerPath")]
        output_container_path: String,
        /// Elapsed seconds.
        time: f64,
    },
    RuntimeError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
    Timeout,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success { .. })
    }
}

/// Encodes a message as a protocol line, without the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let json = serde_json::to_vec(message)?;
    Ok(STANDARD.encode(json))
}

/// Decodes one protocol line. Surrounding whitespace is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let json = STANDARD.decode(line.trim())?;
    Ok(serde_json::from_slice(&json)?)
}
