//! # spimctrl_backend
//!
//! Hardware-side companion of [`spimcompiler_backend`]: it takes compiled port buffers to an
//! output card and keeps the card's tasks consistent across channel switches and aborts.
//!
//! - [`manager`]: the [`TaskManager`], sole authority over physical line ownership.
//! - [`output_task`]: the retriggerable waveform task.
//! - [`clock_task`]: the counter pulse train that paces frames.
//! - [`pulse`]: one-shot pulses on a single AO pin.
//! - [`acquisition`]: start / switch / wait / stop / close of an output and its clock.
//! - [`transport`]: the driver contract; [`simulated`] and (feature `nidaqmx`) [`nidaqmx`]
//!   implement it.
//! - [`config`]: TOML acquisition files.

pub mod acquisition;
pub mod clock_task;
pub mod config;
pub mod error;
pub mod manager;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod output_task;
pub mod pulse;
pub mod simulated;
pub mod transport;

pub use acquisition::Acquisition;
pub use clock_task::{ClockState, ClockTask};
pub use config::{AcquisitionConfig, AcquisitionPlan};
pub use error::{ConfigError, DaqError, DaqResult, TransportError, TransportResult};
pub use manager::{TaskId, TaskManager, TaskRole, TeardownReport};
#[cfg(feature = "nidaqmx")]
pub use nidaqmx::NiDaq;
pub use output_task::{OutputState, OutputTask};
pub use pulse::PulseSpec;
pub use simulated::SimulatedDaq;
pub use transport::{DaqBackend, OutputTransport, PulseTransport};
