//! Error types of the control crate.
//!
//! - [`TransportError`]: a failed driver call, as reported by the card (or the simulator).
//! - [`DaqError`]: task lifecycle errors. Driver failures are wrapped with the id and name of
//!   the task and a short description of what was being done, so a log line is enough to find
//!   the offending port.
//! - [`ConfigError`]: loading and validating an acquisition file.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use spimcompiler_backend::{CompileError, PhysicalLine};

use crate::manager::TaskId;

pub type DaqResult<T> = std::result::Result<T, DaqError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Error reported by the hardware transport. `code` follows the NI-DAQmx convention: negative
/// values are errors.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("driver error {code}: {message}")]
pub struct TransportError {
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        TransportError {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("line {line} is held by task '{owner}', requested by '{requester}'")]
    LineConflict {
        line: PhysicalLine,
        owner: String,
        requester: String,
    },

    #[error("task '{task}' is running; stop it before re-arming")]
    AlreadyRunning { task: String },

    #[error("task '{task}' is not armed")]
    NotArmed { task: String },

    /// No buffer cycle completed in time. Recoverable: the caller may wait again.
    #[error("task '{task}': no output cycle completed within {timeout:?}")]
    TriggerTimeout { task: String, timeout: Duration },

    #[error("task '{task}': cannot {op} while {state}")]
    InvalidState {
        task: String,
        op: &'static str,
        state: String,
    },

    #[error("task {id} is not known to the task manager")]
    UnknownTask { id: TaskId },

    #[error("task '{task}' ({id}): {context}: {source}")]
    Transport {
        id: TaskId,
        task: String,
        context: String,
        #[source]
        source: TransportError,
    },

    #[error("task '{task}': wrote {written} samples per line, expected {expected}")]
    ShortWrite {
        task: String,
        written: usize,
        expected: usize,
    },

    #[error("teardown finished with {} error(s): {}", .0.len(), summarize(.0))]
    Teardown(Vec<DaqError>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// Folds the errors of a multi-step teardown into one result
pub(crate) fn collapse(mut errors: Vec<DaqError>) -> DaqResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(DaqError::Teardown(errors)),
    }
}

fn summarize(errors: &[DaqError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("port '{port}', channel '{channel}': missing parameter '{field}'")]
    MissingParameter {
        port: String,
        channel: String,
        field: &'static str,
    },

    #[error("port '{port}', channel '{channel}': parameter '{field}' does not apply to a {kind} port")]
    UnknownParameter {
        port: String,
        channel: String,
        field: &'static str,
        kind: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] CompileError),
}
