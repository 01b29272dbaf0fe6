//! Configuration errors raised while building the port model and compiling waveforms.
//!
//! Every variant points at the offending port (and channel, where one is involved) so that a
//! rejected configuration can be fixed without guessing. None of these errors is ever retried:
//! they are detected before any hardware is touched.

use thiserror::Error;

use crate::line::{LineKind, PhysicalLine};
use crate::waveform::WaveformKind;

/// Convenience alias for results of the compiler crate.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// Two ports reference the same physical line (aliases such as `PFI0`/`port1/line0` included).
    #[error("ports '{first}' and '{second}' both claim physical line {line}")]
    DuplicateLine {
        line: PhysicalLine,
        first: String,
        second: String,
    },

    #[error("port name '{port}' is registered twice")]
    DuplicatePort { port: String },

    /// A port lacks parameters for a globally declared channel, or a channel is requested
    /// that the port does not know.
    #[error("port '{port}' has no parameters for channel '{channel}'")]
    ChannelMismatch { port: String, channel: String },

    #[error(
        "port '{port}', channel '{channel}': window [{start_ms}, {end_ms}) ms does not fit a {cycle_ms} ms cycle"
    )]
    InvalidWindow {
        port: String,
        channel: String,
        start_ms: f64,
        end_ms: f64,
        cycle_ms: f64,
    },

    #[error("port '{port}', channel '{channel}': {value} V is outside the device range [{min}, {max}] V")]
    OutOfRange {
        port: String,
        channel: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Channel parameters carry a payload for a different waveform than the port declares.
    #[error("port '{port}', channel '{channel}': expected {expected} parameters, found {found}")]
    WaveformMismatch {
        port: String,
        channel: String,
        expected: WaveformKind,
        found: WaveformKind,
    },

    #[error("port '{port}' on {line}: {kind} is not supported on {line_kind} lines")]
    UnsupportedWaveform {
        port: String,
        line: PhysicalLine,
        kind: WaveformKind,
        line_kind: LineKind,
    },

    #[error("line {line} ({kind}) cannot be used as {usage}")]
    InvalidLineKind {
        line: PhysicalLine,
        kind: LineKind,
        usage: &'static str,
    },

    #[error("'{name}' is not a valid physical line name")]
    InvalidLine { name: String },

    #[error("port '{port}': invalid parameter {field} = {value}: {reason}")]
    InvalidParameter {
        port: String,
        field: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("voltage range [{min}, {max}] V is empty or not finite")]
    InvalidVoltageRange { min: f64, max: f64 },

    #[error("invalid timing: {0}")]
    InvalidTiming(String),

    /// Port buffers of one task disagree in length; all ports must share one sample clock.
    #[error("port '{port}' produced {found} samples while the task expects {expected}")]
    LengthMismatch {
        port: String,
        expected: usize,
        found: usize,
    },

    #[error("registry contains no ports")]
    EmptyRegistry,
}
