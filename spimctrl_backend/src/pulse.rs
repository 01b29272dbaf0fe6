//! One-shot pulse on a single analog output pin.
//!
//! A temporary finite task holds the pin at `voltage_v` for `duration_s`, then plays the same
//! number of samples at 0 V so the pin is left at rest. The pin is claimed through the
//! [`TaskManager`] for the duration of the call and released on every exit path.

use ndarray::Array2;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use spimcompiler_backend::{CompileError, CompileResult, DeviceLimits, LineKind, PhysicalLine};

use crate::error::{collapse, DaqError, DaqResult, TransportError};
use crate::manager::{TaskId, TaskManager, TaskRole};
use crate::output_task::POLL_INTERVAL;
use crate::transport::{DaqBackend, OutputTransport};

pub const DEFAULT_PULSE_RATE_HZ: f64 = 10000.;
// Largest pulse buffer accepted, per level
pub const MAX_PULSE_SAMPLES: usize = 1 << 24;

const REST_VOLTS: f64 = 0.;
// Slack on top of the pulse duration before a level counts as stuck
const COMPLETION_MARGIN: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq)]
pub struct PulseSpec {
    pub pin: PhysicalLine,
    pub duration_s: f64,
    pub voltage_v: f64,
    pub sample_rate_hz: f64,
}

impl PulseSpec {
    pub fn new(pin: PhysicalLine, duration_s: f64, voltage_v: f64) -> Self {
        PulseSpec {
            pin,
            duration_s,
            voltage_v,
            sample_rate_hz: DEFAULT_PULSE_RATE_HZ,
        }
    }

    pub fn with_sample_rate(mut self, sample_rate_hz: f64) -> Self {
        self.sample_rate_hz = sample_rate_hz;
        self
    }

    /// Samples per level, truncated: `floor(duration_s * sample_rate_hz)`.
    pub fn num_samples(&self) -> usize {
        (self.duration_s * self.sample_rate_hz).floor() as usize
    }

    pub fn validate(&self, limits: &DeviceLimits) -> CompileResult<()> {
        if self.pin.kind() != LineKind::Analog {
            return Err(CompileError::InvalidLineKind {
                line: self.pin,
                kind: self.pin.kind(),
                usage: "a pulse output (needs an ao line)",
            });
        }
        if !limits.has_line(&self.pin) {
            return Err(CompileError::InvalidLineKind {
                line: self.pin,
                kind: self.pin.kind(),
                usage: "a pulse output on this card (no such line)",
            });
        }
        let (min_rate, max_rate) = limits.rate_range(LineKind::Analog)?;
        let fs = self.sample_rate_hz;
        if !(fs.is_finite() && fs >= min_rate && fs <= max_rate) {
            return Err(CompileError::InvalidTiming(format!(
                "pulse sample rate {fs} Hz outside [{min_rate}, {max_rate}] Hz"
            )));
        }
        let invalid_duration = |reason: &'static str| CompileError::InvalidParameter {
            port: self.pin.to_string(),
            field: "duration_s",
            value: self.duration_s,
            reason,
        };
        if !(self.duration_s.is_finite() && self.num_samples() > 0) {
            return Err(invalid_duration("must span at least one sample"));
        }
        if self.num_samples() > MAX_PULSE_SAMPLES {
            return Err(invalid_duration("pulse buffer too long"));
        }
        if !limits.ao_range.contains(self.voltage_v) {
            return Err(CompileError::OutOfRange {
                port: self.pin.to_string(),
                channel: "pulse".to_string(),
                value: self.voltage_v,
                min: limits.ao_range.min_volts,
                max: limits.ao_range.max_volts,
            });
        }
        Ok(())
    }
}

pub(crate) fn run(manager: &TaskManager, spec: &PulseSpec) -> DaqResult<()> {
    let backend = manager.backend().clone();
    let limits = backend.limits();
    spec.validate(&limits)?;

    let name = format!("pulse_{}", spec.pin);
    let id = manager.claim(&name, TaskRole::Pulse, &[spec.pin])?;
    let result = PulseRun {
        id,
        name: &name,
        spec,
    }
    .execute(backend.as_ref(), &limits);
    manager.release(id);
    if result.is_ok() {
        info!(
            "Pulsed {} at {} V for {} s on {}",
            spec.pin,
            spec.voltage_v,
            spec.duration_s,
            backend.device_name()
        );
    }
    result
}

struct PulseRun<'a> {
    id: TaskId,
    name: &'a str,
    spec: &'a PulseSpec,
}

impl PulseRun<'_> {
    fn driver_error(&self, context: String, source: TransportError) -> DaqError {
        DaqError::Transport {
            id: self.id,
            task: self.name.to_string(),
            context,
            source,
        }
    }

    fn execute(&self, backend: &dyn DaqBackend, limits: &DeviceLimits) -> DaqResult<()> {
        let mut transport = backend
            .open_output(self.name, &[(self.spec.pin, limits.ao_range)], LineKind::Analog)
            .map_err(|e| self.driver_error(format!("opening a pulse task on {}", backend.device_name()), e))?;

        let mut errors = Vec::new();
        for level in [self.spec.voltage_v, REST_VOLTS] {
            if let Err(e) = self.play(transport.as_mut(), level) {
                errors.push(e);
                break;
            }
        }
        if let Err(e) = transport.close() {
            errors.push(self.driver_error("closing".to_string(), e));
        }
        collapse(errors)
    }

    // Plays one finite buffer at `level` and waits for it to finish
    fn play(&self, transport: &mut dyn OutputTransport, level: f64) -> DaqResult<()> {
        let samples = self.spec.num_samples();
        let fs = self.spec.sample_rate_hz;
        transport
            .configure_clock(fs, samples)
            .map_err(|e| self.driver_error(format!("configuring a {fs} Hz sample clock"), e))?;
        let written = transport
            .write(&Array2::from_elem((1, samples), level))
            .map_err(|e| self.driver_error(format!("writing {level} V to {}", self.spec.pin), e))?;
        if written != samples {
            return Err(DaqError::ShortWrite {
                task: self.name.to_string(),
                written,
                expected: samples,
            });
        }
        transport
            .start()
            .map_err(|e| self.driver_error("starting".to_string(), e))?;

        let timeout = Duration::try_from_secs_f64(self.spec.duration_s)
            .unwrap_or(Duration::MAX)
            .saturating_add(COMPLETION_MARGIN);
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let done = transport
                .is_done()
                .map_err(|e| self.driver_error("polling completion".to_string(), e))?;
            if done {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(DaqError::TriggerTimeout {
                    task: self.name.to_string(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
        transport
            .stop()
            .map_err(|e| self.driver_error("stopping".to_string(), e))?;
        debug!("Task '{}' played {} samples at {} V", self.name, samples, level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_validation() {
        let limits = DeviceLimits::pcie_6738();
        let ao5 = PhysicalLine::AnalogOut(5);
        assert!(PulseSpec::new(ao5, 0.1, 5.).validate(&limits).is_ok());
        assert_eq!(PulseSpec::new(ao5, 0.1, 5.).num_samples(), 1000);

        assert!(matches!(
            PulseSpec::new(ao5, 0.1, 12.).validate(&limits),
            Err(CompileError::OutOfRange { .. })
        ));
        assert!(matches!(
            PulseSpec::new(ao5, 1e-5, 5.).validate(&limits),
            Err(CompileError::InvalidParameter { field: "duration_s", .. })
        ));
        assert!(matches!(
            PulseSpec::new(ao5, 1e9, 5.).validate(&limits),
            Err(CompileError::InvalidParameter { field: "duration_s", .. })
        ));
        assert!(matches!(
            PulseSpec::new(PhysicalLine::Counter(0), 0.1, 5.).validate(&limits),
            Err(CompileError::InvalidLineKind { .. })
        ));
        assert!(matches!(
            PulseSpec::new(PhysicalLine::AnalogOut(40), 0.1, 5.).validate(&limits),
            Err(CompileError::InvalidLineKind { .. })
        ));
        assert!(matches!(
            PulseSpec::new(ao5, 0.1, 5.).with_sample_rate(100.).validate(&limits),
            Err(CompileError::InvalidTiming(_))
        ));
    }
}
