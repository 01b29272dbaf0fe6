//! # spimcompiler_backend
//!
//! Waveform compiler for the analog and digital outputs of a light-sheet microscope.
//!
//! Each imaging channel (excitation wavelength) selects its own timing and amplitude profile
//! on every output port: laser modulation, tunable-lens sweep, stage step pulses, piezo drive,
//! camera trigger. This crate turns that declarative description into the exact sample
//! buffers played during one camera frame. It never talks to hardware; the companion control
//! crate hands the compiled buffers to a DAQ task.
//!
//! ## Modules
//! - [`line`]: physical line names (`ao3`, `ctr0`, `port1/line0`, `PFI0`) and their aliases.
//! - [`channel`]: channel identifiers and per-channel waveform parameters.
//! - [`port`]: validated port declarations and voltage ranges.
//! - [`timing`]: sample clock, trigger, frame clock and card limits.
//! - [`waveform`]: the pure synthesizer.
//! - [`registry`]: the port table of one task and multi-port buffer assembly.
//! - [`utils`]: min/max downsampling for previews.
//!
//! ## Example
//! ```
//! use indexmap::IndexMap;
//! use spimcompiler_backend::*;
//!
//! let mut laser = IndexMap::new();
//! laser.insert(Channel::new("488"), ChannelParams::square_wave(15., 549., 5., 0.));
//! let mut etl = IndexMap::new();
//! etl.insert(Channel::new("488"), ChannelParams::sawtooth(15., 549., 1.5, 2.5, 200.));
//!
//! let registry = PortRegistry::build(
//!     vec![
//!         PortSpec::new("488_laser", "ao4".parse().unwrap(), VoltageRange::new(0., 5.).unwrap(),
//!                       WaveformKind::SquareWave, laser).unwrap(),
//!         PortSpec::new("etl", "ao0".parse().unwrap(), VoltageRange::new(0., 5.).unwrap(),
//!                       WaveformKind::Sawtooth, etl).unwrap(),
//!     ],
//!     vec![Channel::new("488")],
//! )
//! .unwrap();
//!
//! let timing = TimingConfig {
//!     sampling_frequency_hz: 10000.,
//!     period_time_ms: 544.,
//!     rest_time_ms: 150.,
//!     sample_mode: SampleMode::Finite,
//!     retriggerable: true,
//!     trigger_port: "PFI0".parse().unwrap(),
//!     trigger_polarity: TriggerPolarity::Rising,
//! };
//! registry.validate_timing(&timing, &DeviceLimits::pcie_6738()).unwrap();
//! let matrix = registry.compile("488", &timing).unwrap();
//! assert_eq!(matrix.shape(), &[2, 6940]);
//! ```

pub mod channel;
pub mod error;
pub mod line;
pub mod port;
pub mod registry;
pub mod timing;
pub mod utils;
pub mod waveform;

pub use channel::*;
pub use error::*;
pub use line::*;
pub use port::*;
pub use registry::*;
pub use timing::*;
pub use utils::*;
pub use waveform::*;
