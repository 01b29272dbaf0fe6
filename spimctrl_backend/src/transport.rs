//! Hardware transport contract.
//!
//! Tasks never talk to a driver directly: a [`DaqBackend`] opens one [`OutputTransport`] per
//! waveform task and one [`PulseTransport`] per counter task, and the task state machines in
//! [`crate::output_task`] and [`crate::clock_task`] drive them. Two backends ship with the crate:
//! [`crate::simulated::SimulatedDaq`] and, behind the `nidaqmx` feature, the NI-DAQmx driver.
//!
//! Buffers are `(lines x samples)` matrices, rows in the order the lines were passed to
//! [`DaqBackend::open_output`].

use ndarray::Array2;

use spimcompiler_backend::{DeviceLimits, LineKind, PhysicalLine, TriggerPolarity, VoltageRange};

use crate::error::TransportResult;

/// A finite, externally triggered waveform generation task on the card.
pub trait OutputTransport: Send {
    /// Sample clock of the task: `samples_per_cycle` samples at `sampling_frequency_hz`, finite.
    fn configure_clock(&mut self, sampling_frequency_hz: f64, samples_per_cycle: usize) -> TransportResult<()>;

    /// Loads one cycle into the output buffer. Returns the samples written per line.
    fn write(&mut self, buffer: &Array2<f64>) -> TransportResult<usize>;

    /// Starts each cycle on an edge of `source`. A retriggerable task replays the buffer on
    /// every later edge; edges arriving mid-cycle are ignored.
    fn arm_trigger(
        &mut self,
        source: &PhysicalLine,
        polarity: TriggerPolarity,
        retriggerable: bool,
    ) -> TransportResult<()>;

    fn start(&mut self) -> TransportResult<()>;
    fn stop(&mut self) -> TransportResult<()>;

    /// True once a non-retriggerable task has played its cycle, or when the task is not running.
    fn is_done(&mut self) -> TransportResult<bool>;

    /// Samples per line generated since the last `start`.
    fn samples_generated(&mut self) -> TransportResult<u64>;

    /// Releases the driver task. Further calls fail.
    fn close(&mut self) -> TransportResult<()>;
}

/// A continuous counter pulse train routed to an output terminal.
pub trait PulseTransport: Send {
    fn configure_pulse(
        &mut self,
        frequency_hz: f64,
        duty_cycle: f64,
        terminal: &PhysicalLine,
    ) -> TransportResult<()>;
    fn start(&mut self) -> TransportResult<()>;
    fn stop(&mut self) -> TransportResult<()>;
    fn close(&mut self) -> TransportResult<()>;
}

/// One output card.
pub trait DaqBackend: Send + Sync {
    fn device_name(&self) -> &str;

    fn limits(&self) -> DeviceLimits;

    fn open_output(
        &self,
        task_name: &str,
        lines: &[(PhysicalLine, VoltageRange)],
        kind: LineKind,
    ) -> TransportResult<Box<dyn OutputTransport>>;

    fn open_pulse(&self, task_name: &str, counter: PhysicalLine) -> TransportResult<Box<dyn PulseTransport>>;
}
