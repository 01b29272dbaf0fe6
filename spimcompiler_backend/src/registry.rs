//! The port registry: every output port of one task, keyed by name, in declaration order.
//!
//! The registry is built once from validated [`PortSpec`]s and is read-only afterwards. It
//! guarantees that
//! - port names are unique,
//! - no two ports drive the same physical line, whatever alias each was declared with,
//! - every port carries parameters for every declared channel.
//!
//! [`PortRegistry::compile`] synthesizes all ports for one channel and stacks them into the
//! `(ports x samples)` matrix an output task writes to the card, rows in registry order.

use indexmap::IndexMap;
use ndarray::{Array2, Axis};
use tracing::debug;

use crate::channel::Channel;
use crate::error::{CompileError, CompileResult};
use crate::line::{LineKind, PhysicalLine};
use crate::port::PortSpec;
use crate::timing::{DeviceLimits, TimingConfig};
use crate::waveform::{synthesize, WaveformKind};

#[derive(Clone, Debug)]
pub struct PortRegistry {
    ports: IndexMap<String, PortSpec>,
    channels: Vec<Channel>,
}

impl PortRegistry {
    pub fn build(
        ports: impl IntoIterator<Item = PortSpec>,
        channels: impl IntoIterator<Item = Channel>,
    ) -> CompileResult<Self> {
        let channels: Vec<Channel> = channels.into_iter().collect();
        let mut table: IndexMap<String, PortSpec> = IndexMap::new();
        let mut owners: IndexMap<PhysicalLine, String> = IndexMap::new();

        for port in ports {
            if table.contains_key(port.name()) {
                return Err(CompileError::DuplicatePort {
                    port: port.name().to_string(),
                });
            }
            if let Some(first) = owners.get(&port.line()) {
                return Err(CompileError::DuplicateLine {
                    line: port.line(),
                    first: first.clone(),
                    second: port.name().to_string(),
                });
            }
            if let Some(missing) = channels.iter().find(|c| !port.channels().contains_key(*c)) {
                return Err(CompileError::ChannelMismatch {
                    port: port.name().to_string(),
                    channel: missing.to_string(),
                });
            }
            for extra in port.channels().keys().filter(|c| !channels.contains(c)) {
                debug!("Port {} defines undeclared channel {}", port.name(), extra);
            }
            owners.insert(port.line(), port.name().to_string());
            table.insert(port.name().to_string(), port);
        }

        if table.is_empty() {
            return Err(CompileError::EmptyRegistry);
        }
        Ok(PortRegistry {
            ports: table,
            channels,
        })
    }

    pub fn get(&self, name: &str) -> Option<&PortSpec> {
        self.ports.get(name)
    }
    pub fn iter(&self) -> impl Iterator<Item = &PortSpec> {
        self.ports.values()
    }
    pub fn len(&self) -> usize {
        self.ports.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c.as_str() == channel)
    }
    pub fn lines(&self) -> Vec<PhysicalLine> {
        self.ports.values().map(|p| p.line()).collect()
    }

    // A task drives either analog or digital lines, never both
    pub fn line_kind(&self) -> CompileResult<LineKind> {
        let mut ports = self.ports.values();
        let first = ports.next().ok_or(CompileError::EmptyRegistry)?;
        let kind = first.line().kind();
        for port in ports {
            if port.line().kind() != kind {
                return Err(CompileError::InvalidLineKind {
                    line: port.line(),
                    kind: port.line().kind(),
                    usage: "a port of a task that already drives other line kinds",
                });
            }
        }
        if kind == LineKind::Digital {
            if let Some(port) = self.ports.values().find(|p| p.kind() != WaveformKind::SquareWave) {
                return Err(CompileError::UnsupportedWaveform {
                    port: port.name().to_string(),
                    line: port.line(),
                    kind: port.kind(),
                    line_kind: kind,
                });
            }
        }
        Ok(kind)
    }

    /// Checks the timing against the card and every (port, channel) window against the cycle.
    pub fn validate_timing(&self, timing: &TimingConfig, limits: &DeviceLimits) -> CompileResult<()> {
        let kind = self.line_kind()?;
        timing.validate(limits, kind)?;
        let cycle_ms = timing.cycle_length_ms();
        for port in self.ports.values() {
            if !limits.has_line(&port.line()) {
                return Err(CompileError::InvalidLineKind {
                    line: port.line(),
                    kind: port.line().kind(),
                    usage: "an output on this card (no such line)",
                });
            }
            if kind == LineKind::Analog && !limits.ao_range.contains_range(&port.device_range()) {
                let range = port.device_range();
                return Err(CompileError::OutOfRange {
                    port: port.name().to_string(),
                    channel: "*".to_string(),
                    value: if range.min_volts < limits.ao_range.min_volts {
                        range.min_volts
                    } else {
                        range.max_volts
                    },
                    min: limits.ao_range.min_volts,
                    max: limits.ao_range.max_volts,
                });
            }
            for (channel, params) in port.channels() {
                if !params.window_fits(cycle_ms) {
                    return Err(CompileError::InvalidWindow {
                        port: port.name().to_string(),
                        channel: channel.to_string(),
                        start_ms: params.start_time_ms,
                        end_ms: params.end_time_ms,
                        cycle_ms,
                    });
                }
            }
        }
        Ok(())
    }

    /// Synthesizes every port for `channel` into a `(ports x samples)` matrix.
    pub fn compile(&self, channel: &str, timing: &TimingConfig) -> CompileResult<Array2<f64>> {
        let expected = timing.num_samples();
        let mut matrix = Array2::zeros((self.ports.len(), expected));
        for (mut row, port) in matrix.axis_iter_mut(Axis(0)).zip(self.ports.values()) {
            let buffer = synthesize(port, channel, timing)?;
            if buffer.len() != expected {
                return Err(CompileError::LengthMismatch {
                    port: port.name().to_string(),
                    expected,
                    found: buffer.len(),
                });
            }
            row.assign(&buffer);
        }
        debug!(
            "Compiled channel {} into {} ports x {} samples",
            channel,
            self.ports.len(),
            expected
        );
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelParams;
    use crate::port::VoltageRange;

    fn square(name: &str, line: &str) -> PortSpec {
        let mut channels = IndexMap::new();
        channels.insert(Channel::new("488"), ChannelParams::square_wave(0., 1., 5., 0.));
        PortSpec::new(
            name,
            line.parse().unwrap(),
            VoltageRange::new(0., 5.).unwrap(),
            WaveformKind::SquareWave,
            channels,
        )
        .unwrap()
    }

    #[test]
    fn keeps_declaration_order() {
        let reg = PortRegistry::build(
            vec![square("b", "ao3"), square("a", "ao1"), square("c", "ao2")],
            vec![Channel::new("488")],
        )
        .unwrap();
        let names: Vec<&str> = reg.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(reg.get("a").unwrap().line(), PhysicalLine::AnalogOut(1));
    }

    #[test]
    fn mixed_line_kinds() {
        let reg = PortRegistry::build(
            vec![square("a", "ao0"), square("b", "P1.0")],
            vec![Channel::new("488")],
        )
        .unwrap();
        assert!(matches!(reg.line_kind(), Err(CompileError::InvalidLineKind { .. })));
    }

    #[test]
    fn digital_registry() {
        let reg = PortRegistry::build(
            vec![square("a", "port0/line0"), square("b", "P1.0")],
            vec![Channel::new("488")],
        )
        .unwrap();
        assert_eq!(reg.line_kind().unwrap(), LineKind::Digital);
    }

    #[test]
    fn empty() {
        assert!(matches!(
            PortRegistry::build(vec![], vec![Channel::new("488")]),
            Err(CompileError::EmptyRegistry)
        ));
    }
}
