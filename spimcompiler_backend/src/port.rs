//! Output port declarations.
//!
//! A [`PortSpec`] binds a logical port name ("etl", "camera", "488_laser") to one physical
//! output line, the hardware voltage range of whatever hangs off that line, the waveform
//! family it plays, and one parameter set per imaging channel. Construction validates every
//! channel against the port, so a `PortSpec` that exists is internally consistent; checks
//! that need the sample clock (window vs cycle length) live in
//! [`crate::registry::PortRegistry::validate_timing`] and the synthesizer.

use indexmap::IndexMap;
use std::fmt;

use crate::channel::{Channel, ChannelParams, WaveformParams};
use crate::error::{CompileError, CompileResult};
use crate::line::{LineKind, PhysicalLine};
use crate::waveform::WaveformKind;

/// Closed voltage interval `[min_volts, max_volts]` enforced as the final clamp on every sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoltageRange {
    pub min_volts: f64,
    pub max_volts: f64,
}

impl VoltageRange {
    pub fn new(min_volts: f64, max_volts: f64) -> CompileResult<Self> {
        if !(min_volts.is_finite() && max_volts.is_finite()) || min_volts >= max_volts {
            return Err(CompileError::InvalidVoltageRange {
                min: min_volts,
                max: max_volts,
            });
        }
        Ok(VoltageRange {
            min_volts,
            max_volts,
        })
    }

    pub fn span(&self) -> f64 {
        self.max_volts - self.min_volts
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.min_volts + self.max_volts)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min_volts && value <= self.max_volts
    }

    pub fn contains_range(&self, other: &VoltageRange) -> bool {
        self.contains(other.min_volts) && self.contains(other.max_volts)
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_volts, self.max_volts)
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}] V", self.min_volts, self.max_volts)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PortSpec {
    name: String,
    line: PhysicalLine,
    device_range: VoltageRange,
    kind: WaveformKind,
    channels: IndexMap<Channel, ChannelParams>,
}

impl PortSpec {
    /// Validates and builds a port.
    ///
    /// Fails with
    /// - `InvalidLineKind` if `line` is a counter,
    /// - `UnsupportedWaveform` for a sawtooth on a digital line,
    /// - `WaveformMismatch` if a channel's payload is of another kind than `kind`,
    /// - `OutOfRange` if a channel's levels leave `device_range`,
    /// - `InvalidParameter` for a non-positive or non-finite sawtooth cutoff.
    ///
    /// ```
    /// use indexmap::IndexMap;
    /// use spimcompiler_backend::*;
    ///
    /// let mut channels = IndexMap::new();
    /// channels.insert(Channel::new("488"), ChannelParams::square_wave(15., 549., 5., 0.));
    /// let port = PortSpec::new(
    ///     "488_laser",
    ///     "ao4".parse().unwrap(),
    ///     VoltageRange::new(0., 5.).unwrap(),
    ///     WaveformKind::SquareWave,
    ///     channels,
    /// );
    /// assert!(port.is_ok());
    /// ```
    pub fn new(
        name: &str,
        line: PhysicalLine,
        device_range: VoltageRange,
        kind: WaveformKind,
        channels: IndexMap<Channel, ChannelParams>,
    ) -> CompileResult<Self> {
        match (line.kind(), kind) {
            (LineKind::Counter, _) => {
                return Err(CompileError::InvalidLineKind {
                    line,
                    kind: LineKind::Counter,
                    usage: "a waveform output port",
                })
            }
            (LineKind::Digital, WaveformKind::Sawtooth) => {
                return Err(CompileError::UnsupportedWaveform {
                    port: name.to_string(),
                    line,
                    kind,
                    line_kind: LineKind::Digital,
                })
            }
            _ => {}
        }

        for (channel, params) in channels.iter() {
            if params.kind() != kind {
                return Err(CompileError::WaveformMismatch {
                    port: name.to_string(),
                    channel: channel.to_string(),
                    expected: kind,
                    found: params.kind(),
                });
            }
            if let WaveformParams::Sawtooth {
                cutoff_frequency_hz,
                ..
            } = params.waveform
            {
                if !(cutoff_frequency_hz.is_finite() && cutoff_frequency_hz > 0.) {
                    return Err(CompileError::InvalidParameter {
                        port: name.to_string(),
                        field: "cutoff_frequency_hz",
                        value: cutoff_frequency_hz,
                        reason: "must be positive and finite",
                    });
                }
            }
            let (lo, hi) = params.waveform.extent();
            for value in [lo, hi] {
                if !device_range.contains(value) {
                    return Err(CompileError::OutOfRange {
                        port: name.to_string(),
                        channel: channel.to_string(),
                        value,
                        min: device_range.min_volts,
                        max: device_range.max_volts,
                    });
                }
            }
        }

        Ok(PortSpec {
            name: name.to_string(),
            line,
            device_range,
            kind,
            channels,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn line(&self) -> PhysicalLine {
        self.line
    }
    pub fn device_range(&self) -> VoltageRange {
        self.device_range
    }
    pub fn kind(&self) -> WaveformKind {
        self.kind
    }
    pub fn channels(&self) -> &IndexMap<Channel, ChannelParams> {
        &self.channels
    }

    pub fn params(&self, channel: &str) -> CompileResult<&ChannelParams> {
        self.channels
            .get(channel)
            .ok_or_else(|| CompileError::ChannelMismatch {
                port: self.name.clone(),
                channel: channel.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> VoltageRange {
        VoltageRange::new(0., 5.).unwrap()
    }

    fn one_channel(params: ChannelParams) -> IndexMap<Channel, ChannelParams> {
        let mut channels = IndexMap::new();
        channels.insert(Channel::new("488"), params);
        channels
    }

    #[test]
    fn empty_voltage_range_rejected() {
        assert!(VoltageRange::new(1., 1.).is_err());
        assert!(VoltageRange::new(2., -2.).is_err());
        assert!(VoltageRange::new(f64::NAN, 1.).is_err());
    }

    #[test]
    fn counter_line_is_not_a_port() {
        let res = PortSpec::new(
            "clock",
            PhysicalLine::Counter(0),
            range(),
            WaveformKind::SquareWave,
            one_channel(ChannelParams::square_wave(0., 1., 5., 0.)),
        );
        assert!(matches!(res, Err(CompileError::InvalidLineKind { .. })));
    }

    #[test]
    fn sawtooth_on_digital_line() {
        let res = PortSpec::new(
            "stage",
            "P1.3".parse().unwrap(),
            range(),
            WaveformKind::Sawtooth,
            one_channel(ChannelParams::sawtooth(0., 1., 1., 2., 100.)),
        );
        assert!(matches!(res, Err(CompileError::UnsupportedWaveform { .. })));
    }

    #[test]
    fn payload_must_match_port_kind() {
        let res = PortSpec::new(
            "etl",
            PhysicalLine::AnalogOut(0),
            range(),
            WaveformKind::Sawtooth,
            one_channel(ChannelParams::square_wave(0., 1., 5., 0.)),
        );
        assert!(matches!(
            res,
            Err(CompileError::WaveformMismatch {
                expected: WaveformKind::Sawtooth,
                found: WaveformKind::SquareWave,
                ..
            })
        ));
    }

    #[test]
    fn levels_checked_against_device_range() {
        let res = PortSpec::new(
            "etl",
            PhysicalLine::AnalogOut(0),
            range(),
            WaveformKind::Sawtooth,
            one_channel(ChannelParams::sawtooth(0., 1., 3., 2.5, 100.)),
        );
        match res {
            Err(CompileError::OutOfRange { value, .. }) => assert_eq!(value, -0.5),
            other => panic!("expected OutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn cutoff_must_be_positive() {
        let res = PortSpec::new(
            "etl",
            PhysicalLine::AnalogOut(0),
            range(),
            WaveformKind::Sawtooth,
            one_channel(ChannelParams::sawtooth(0., 1., 1., 2., 0.)),
        );
        assert!(matches!(
            res,
            Err(CompileError::InvalidParameter {
                field: "cutoff_frequency_hz",
                ..
            })
        ));
    }
}
