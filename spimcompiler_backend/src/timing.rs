//! Sample clock, trigger and frame clock configuration, plus the card limits they are checked
//! against.
//!
//! One output cycle lasts `period_time_ms + rest_time_ms` and is played once per trigger edge.
//! Its sample count is `round(cycle_length_ms / 1000 * fs)`, shared by every port of a task.

use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::error::{CompileError, CompileResult};
use crate::line::{LineKind, PhysicalLine};
use crate::port::VoltageRange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleMode {
    Finite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerPolarity {
    Rising,
    Falling,
}
impl fmt::Display for TriggerPolarity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TriggerPolarity::Rising => "rising",
                TriggerPolarity::Falling => "falling",
            }
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimingConfig {
    pub sampling_frequency_hz: f64,
    pub period_time_ms: f64,
    pub rest_time_ms: f64,
    pub sample_mode: SampleMode,
    pub retriggerable: bool,
    pub trigger_port: PhysicalLine,
    pub trigger_polarity: TriggerPolarity,
}

impl TimingConfig {
    pub fn cycle_length_ms(&self) -> f64 {
        self.period_time_ms + self.rest_time_ms
    }

    /// Samples per output cycle.
    ///
    /// ```
    /// use spimcompiler_backend::*;
    ///
    /// let timing = TimingConfig {
    ///     sampling_frequency_hz: 10000.,
    ///     period_time_ms: 544.,
    ///     rest_time_ms: 150.,
    ///     sample_mode: SampleMode::Finite,
    ///     retriggerable: true,
    ///     trigger_port: "PFI0".parse().unwrap(),
    ///     trigger_polarity: TriggerPolarity::Rising,
    /// };
    /// assert_eq!(timing.num_samples(), 6940);
    /// ```
    pub fn num_samples(&self) -> usize {
        (self.cycle_length_ms() / 1000. * self.sampling_frequency_hz).round() as usize
    }

    // Time of sample i in ms, computed as i * 1000 / fs to keep window edges exact
    pub fn sample_time_ms(&self, i: usize) -> f64 {
        i as f64 * 1000. / self.sampling_frequency_hz
    }

    /// Checks the timing on its own and against the card limits for a task of `kind` lines.
    pub fn validate(&self, limits: &DeviceLimits, kind: LineKind) -> CompileResult<()> {
        if !(self.period_time_ms.is_finite() && self.period_time_ms >= 0.) {
            return Err(CompileError::InvalidTiming(format!(
                "period_time_ms must be >= 0, got {}",
                self.period_time_ms
            )));
        }
        if !(self.rest_time_ms.is_finite() && self.rest_time_ms >= 0.) {
            return Err(CompileError::InvalidTiming(format!(
                "rest_time_ms must be >= 0, got {}",
                self.rest_time_ms
            )));
        }
        if self.cycle_length_ms() <= 0. {
            return Err(CompileError::InvalidTiming(
                "cycle length (period + rest) must be positive".to_string(),
            ));
        }
        let (min_rate, max_rate) = limits.rate_range(kind)?;
        let fs = self.sampling_frequency_hz;
        if !(fs.is_finite() && fs >= min_rate && fs <= max_rate) {
            return Err(CompileError::InvalidTiming(format!(
                "sampling frequency {fs} Hz outside [{min_rate}, {max_rate}] Hz for {kind} output"
            )));
        }
        if self.num_samples() == 0 {
            return Err(CompileError::InvalidTiming(
                "cycle is shorter than one sample".to_string(),
            ));
        }
        if self.trigger_port.pfi().is_none() {
            return Err(CompileError::InvalidLineKind {
                line: self.trigger_port,
                kind: self.trigger_port.kind(),
                usage: "a trigger input (needs a PFI terminal)",
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    // Free-running once started
    Continuous,
}

/// Frame clock: a counter emitting a pulse train whose edges retrigger the output task.
#[derive(Clone, Debug, PartialEq)]
pub struct ClockSpec {
    pub counter: PhysicalLine,
    pub frequency_hz: f64,
    pub duty_cycle: f64,
    pub output_port: PhysicalLine,
    pub trigger_mode: TriggerMode,
}

impl ClockSpec {
    pub const DEFAULT_DUTY_CYCLE: f64 = 0.5;

    pub fn new(counter: PhysicalLine, frequency_hz: f64, output_port: PhysicalLine) -> Self {
        ClockSpec {
            counter,
            frequency_hz,
            duty_cycle: Self::DEFAULT_DUTY_CYCLE,
            output_port,
            trigger_mode: TriggerMode::Continuous,
        }
    }

    pub fn with_duty_cycle(mut self, duty_cycle: f64) -> Self {
        self.duty_cycle = duty_cycle;
        self
    }

    pub fn period_ms(&self) -> f64 {
        1000. / self.frequency_hz
    }

    /// Validates the clock and its pairing with the output timing.
    ///
    /// The pulse has to come out on the very terminal the output task listens to. A frame
    /// period shorter than the output cycle is legal but edges arriving mid-cycle are ignored
    /// by the card, so it is only reported.
    pub fn validate(&self, timing: &TimingConfig) -> CompileResult<()> {
        if self.counter.kind() != LineKind::Counter {
            return Err(CompileError::InvalidLineKind {
                line: self.counter,
                kind: self.counter.kind(),
                usage: "a frame clock counter",
            });
        }
        if self.output_port.pfi().is_none() {
            return Err(CompileError::InvalidLineKind {
                line: self.output_port,
                kind: self.output_port.kind(),
                usage: "a clock output terminal (needs a PFI terminal)",
            });
        }
        if !(self.frequency_hz.is_finite() && self.frequency_hz > 0.) {
            return Err(CompileError::InvalidParameter {
                port: "clock".to_string(),
                field: "frequency_hz",
                value: self.frequency_hz,
                reason: "must be positive and finite",
            });
        }
        if Duration::try_from_secs_f64(1. / self.frequency_hz).is_err() {
            return Err(CompileError::InvalidParameter {
                port: "clock".to_string(),
                field: "frequency_hz",
                value: self.frequency_hz,
                reason: "pulse period is too long to represent",
            });
        }
        if !(self.duty_cycle > 0. && self.duty_cycle < 1.) {
            return Err(CompileError::InvalidParameter {
                port: "clock".to_string(),
                field: "duty_cycle",
                value: self.duty_cycle,
                reason: "must lie strictly between 0 and 1",
            });
        }
        if self.output_port != timing.trigger_port {
            return Err(CompileError::InvalidTiming(format!(
                "clock drives {} but the output task is triggered from {}",
                self.output_port, timing.trigger_port
            )));
        }
        if self.period_ms() < timing.cycle_length_ms() {
            warn!(
                "Frame clock period {:.3} ms is shorter than the {:.3} ms output cycle; edges during playback will be ignored",
                self.period_ms(),
                timing.cycle_length_ms()
            );
        }
        Ok(())
    }
}

/// Electrical and timing limits of the output card.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceLimits {
    pub ao_range: VoltageRange,
    pub ao_min_rate_hz: f64,
    pub ao_max_rate_hz: f64,
    pub do_max_rate_hz: f64,
    pub num_ao: u32,
    pub num_counters: u32,
}

impl DeviceLimits {
    // NI PCIe-6738: 32 AO channels at +/-10 V, 4 counters
    pub fn pcie_6738() -> Self {
        DeviceLimits {
            ao_range: VoltageRange {
                min_volts: -10.,
                max_volts: 10.,
            },
            ao_min_rate_hz: 1e3,
            ao_max_rate_hz: 350e3,
            do_max_rate_hz: 350e3,
            num_ao: 32,
            num_counters: 4,
        }
    }

    pub fn rate_range(&self, kind: LineKind) -> CompileResult<(f64, f64)> {
        match kind {
            LineKind::Analog => Ok((self.ao_min_rate_hz, self.ao_max_rate_hz)),
            LineKind::Digital => Ok((f64::MIN_POSITIVE, self.do_max_rate_hz)),
            LineKind::Counter => Err(CompileError::InvalidTiming(
                "counters are not sample-clocked".to_string(),
            )),
        }
    }

    // Whether the card physically has the line
    pub fn has_line(&self, line: &PhysicalLine) -> bool {
        match *line {
            PhysicalLine::AnalogOut(n) => n < self.num_ao,
            PhysicalLine::Counter(n) => n < self.num_counters,
            PhysicalLine::Digital { .. } => true,
        }
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        DeviceLimits::pcie_6738()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(fs: f64) -> TimingConfig {
        TimingConfig {
            sampling_frequency_hz: fs,
            period_time_ms: 544.,
            rest_time_ms: 150.,
            sample_mode: SampleMode::Finite,
            retriggerable: true,
            trigger_port: "PFI0".parse().unwrap(),
            trigger_polarity: TriggerPolarity::Rising,
        }
    }

    #[test]
    fn analog_rate_limits() {
        let limits = DeviceLimits::default();
        assert!(timing(10000.).validate(&limits, LineKind::Analog).is_ok());
        assert!(timing(500.).validate(&limits, LineKind::Analog).is_err());
        assert!(timing(400e3).validate(&limits, LineKind::Analog).is_err());
        // Digital tasks have no lower bound
        assert!(timing(500.).validate(&limits, LineKind::Digital).is_ok());
    }

    #[test]
    fn trigger_needs_pfi() {
        let mut t = timing(10000.);
        t.trigger_port = "port0/line1".parse().unwrap();
        assert!(matches!(
            t.validate(&DeviceLimits::default(), LineKind::Analog),
            Err(CompileError::InvalidLineKind { .. })
        ));
    }

    #[test]
    fn negative_rest_rejected() {
        let mut t = timing(10000.);
        t.rest_time_ms = -1.;
        assert!(matches!(
            t.validate(&DeviceLimits::default(), LineKind::Analog),
            Err(CompileError::InvalidTiming(_))
        ));
    }

    #[test]
    fn clock_must_drive_trigger_port() {
        let t = timing(10000.);
        let clock = ClockSpec::new(PhysicalLine::Counter(0), 1.0, "PFI0".parse().unwrap());
        assert!(clock.validate(&t).is_ok());

        let elsewhere = ClockSpec::new(PhysicalLine::Counter(0), 1.0, "PFI1".parse().unwrap());
        assert!(matches!(elsewhere.validate(&t), Err(CompileError::InvalidTiming(_))));

        let not_counter = ClockSpec::new(PhysicalLine::AnalogOut(0), 1.0, "PFI0".parse().unwrap());
        assert!(matches!(
            not_counter.validate(&t),
            Err(CompileError::InvalidLineKind { .. })
        ));
    }

    #[test]
    fn clock_period_must_be_representable() {
        let t = timing(10000.);
        let glacial = ClockSpec::new(PhysicalLine::Counter(0), 1e-30, "PFI0".parse().unwrap());
        assert!(matches!(
            glacial.validate(&t),
            Err(CompileError::InvalidParameter {
                field: "frequency_hz",
                ..
            })
        ));
        let slow = ClockSpec::new(PhysicalLine::Counter(0), 1e-3, "PFI0".parse().unwrap());
        assert!(slow.validate(&t).is_ok());
    }

    #[test]
    fn clock_duty_cycle_bounds() {
        let t = timing(10000.);
        for duty in [0., 1., -0.2, f64::NAN] {
            let clock = ClockSpec::new(PhysicalLine::Counter(1), 1.0, "PFI0".parse().unwrap())
                .with_duty_cycle(duty);
            assert!(clock.validate(&t).is_err(), "duty {duty} accepted");
        }
    }

    #[test]
    fn card_lines() {
        let limits = DeviceLimits::pcie_6738();
        assert!(limits.has_line(&PhysicalLine::AnalogOut(31)));
        assert!(!limits.has_line(&PhysicalLine::AnalogOut(32)));
        assert!(!limits.has_line(&PhysicalLine::Counter(4)));
    }
}
