//! TOML acquisition files.
//!
//! An acquisition file describes one output card, the imaging channels, the sample clock and
//! trigger, the frame clock, and every port with one parameter table per channel:
//!
//! ```toml
//! channels = ["488", "561"]
//!
//! [device]
//! name = "Dev1"
//! simulated = true
//!
//! [timing]
//! sampling_frequency_hz = 10000.0
//! period_time_ms = 544.0
//! rest_time_ms = 150.0
//! trigger_port = "PFI0"
//!
//! [clock]
//! counter = "ctr0"
//! frequency_hz = 1.4
//! output_port = "PFI0"
//!
//! [ports.etl]
//! line = "ao0"
//! waveform = "sawtooth"
//! device_min_volts = 0.0
//! device_max_volts = 5.0
//!
//! [ports.etl.channels.488]
//! start_time_ms = 15.0
//! end_time_ms = 549.0
//! amplitude_volts = 1.5
//! offset_volts = 2.5
//! cutoff_frequency_hz = 200.0
//! ```
//!
//! Parameter tables are parsed loosely and then converted into the closed typed model, so a
//! missing amplitude or a `max_volts` on a sawtooth port is reported against the exact port,
//! channel and field. Ports keep their file order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use spimcompiler_backend::{
    Channel, ChannelParams, ClockSpec, PhysicalLine, PortRegistry, PortSpec, SampleMode, TimingConfig,
    TriggerMode, TriggerPolarity, VoltageRange, WaveformKind,
};

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionConfig {
    pub channels: Vec<String>,
    pub device: DeviceConfig,
    pub timing: RawTiming,
    pub clock: RawClock,
    pub ports: IndexMap<String, RawPort>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_output_task")]
    pub output_task: String,
    #[serde(default = "default_clock_task")]
    pub clock_task: String,
    #[serde(default = "default_simulated")]
    pub simulated: bool,
}

fn default_output_task() -> String {
    "ao_task".to_string()
}
fn default_clock_task() -> String {
    "co_task".to_string()
}
fn default_simulated() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawSampleMode {
    Finite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawPolarity {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawWaveform {
    Sawtooth,
    SquareWave,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawTiming {
    pub sampling_frequency_hz: f64,
    pub period_time_ms: f64,
    pub rest_time_ms: f64,
    #[serde(default = "default_sample_mode")]
    pub sample_mode: RawSampleMode,
    #[serde(default = "default_retriggerable")]
    pub retriggerable: bool,
    pub trigger_port: String,
    #[serde(default = "default_polarity")]
    pub trigger_polarity: RawPolarity,
}

fn default_sample_mode() -> RawSampleMode {
    RawSampleMode::Finite
}
fn default_retriggerable() -> bool {
    true
}
fn default_polarity() -> RawPolarity {
    RawPolarity::Rising
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawClock {
    pub counter: String,
    pub frequency_hz: f64,
    #[serde(default = "default_duty_cycle")]
    pub duty_cycle: f64,
    pub output_port: String,
}

fn default_duty_cycle() -> f64 {
    ClockSpec::DEFAULT_DUTY_CYCLE
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawPort {
    pub line: String,
    pub waveform: RawWaveform,
    pub device_min_volts: f64,
    pub device_max_volts: f64,
    pub channels: IndexMap<String, RawChannelParams>,
}

/// Union of every waveform's fields; only those of the port's waveform may be present.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawChannelParams {
    pub start_time_ms: Option<f64>,
    pub end_time_ms: Option<f64>,
    pub amplitude_volts: Option<f64>,
    pub offset_volts: Option<f64>,
    pub cutoff_frequency_hz: Option<f64>,
    pub max_volts: Option<f64>,
    pub min_volts: Option<f64>,
}

/// Typed result of a validated acquisition file.
#[derive(Debug, Clone)]
pub struct AcquisitionPlan {
    pub device: DeviceConfig,
    pub registry: PortRegistry,
    pub timing: TimingConfig,
    pub clock: ClockSpec,
}

impl AcquisitionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn channel_ids(&self) -> Vec<Channel> {
        self.channels.iter().map(|c| Channel::new(c.as_str())).collect()
    }

    /// Converts the file into the typed model and validates it.
    ///
    /// Timing is checked against the card when the output task is created, since the limits
    /// belong to the backend.
    pub fn build(&self) -> Result<AcquisitionPlan, ConfigError> {
        let timing = self.timing.to_timing()?;
        let clock = self.clock.to_clock()?;
        let ports = self
            .ports
            .iter()
            .map(|(name, raw)| raw.to_port(name))
            .collect::<Result<Vec<_>, _>>()?;
        let registry = PortRegistry::build(ports, self.channel_ids())?;
        clock.validate(&timing)?;
        Ok(AcquisitionPlan {
            device: self.device.clone(),
            registry,
            timing,
            clock,
        })
    }
}

impl RawTiming {
    pub fn to_timing(&self) -> Result<TimingConfig, ConfigError> {
        Ok(TimingConfig {
            sampling_frequency_hz: self.sampling_frequency_hz,
            period_time_ms: self.period_time_ms,
            rest_time_ms: self.rest_time_ms,
            sample_mode: match self.sample_mode {
                RawSampleMode::Finite => SampleMode::Finite,
            },
            retriggerable: self.retriggerable,
            trigger_port: self.trigger_port.parse::<PhysicalLine>()?,
            trigger_polarity: match self.trigger_polarity {
                RawPolarity::Rising => TriggerPolarity::Rising,
                RawPolarity::Falling => TriggerPolarity::Falling,
            },
        })
    }
}

impl RawClock {
    pub fn to_clock(&self) -> Result<ClockSpec, ConfigError> {
        Ok(ClockSpec {
            counter: self.counter.parse()?,
            frequency_hz: self.frequency_hz,
            duty_cycle: self.duty_cycle,
            output_port: self.output_port.parse()?,
            trigger_mode: TriggerMode::Continuous,
        })
    }
}

impl RawPort {
    pub fn to_port(&self, name: &str) -> Result<PortSpec, ConfigError> {
        let kind = match self.waveform {
            RawWaveform::Sawtooth => WaveformKind::Sawtooth,
            RawWaveform::SquareWave => WaveformKind::SquareWave,
        };
        let channels = self
            .channels
            .iter()
            .map(|(channel, raw)| -> Result<(Channel, ChannelParams), ConfigError> {
                Ok((Channel::new(channel.as_str()), raw.to_params(name, channel, kind)?))
            })
            .collect::<Result<IndexMap<_, _>, _>>()?;
        Ok(PortSpec::new(
            name,
            self.line.parse()?,
            VoltageRange::new(self.device_min_volts, self.device_max_volts)?,
            kind,
            channels,
        )?)
    }
}

impl RawChannelParams {
    pub fn to_params(&self, port: &str, channel: &str, kind: WaveformKind) -> Result<ChannelParams, ConfigError> {
        let require = |value: Option<f64>, field: &'static str| {
            value.ok_or_else(|| ConfigError::MissingParameter {
                port: port.to_string(),
                channel: channel.to_string(),
                field,
            })
        };
        let forbid = |value: Option<f64>, field: &'static str, kind: &'static str| match value {
            Some(_) => Err(ConfigError::UnknownParameter {
                port: port.to_string(),
                channel: channel.to_string(),
                field,
                kind,
            }),
            None => Ok(()),
        };

        let start = require(self.start_time_ms, "start_time_ms")?;
        let end = require(self.end_time_ms, "end_time_ms")?;
        match kind {
            WaveformKind::Sawtooth => {
                forbid(self.max_volts, "max_volts", "sawtooth")?;
                forbid(self.min_volts, "min_volts", "sawtooth")?;
                Ok(ChannelParams::sawtooth(
                    start,
                    end,
                    require(self.amplitude_volts, "amplitude_volts")?,
                    require(self.offset_volts, "offset_volts")?,
                    require(self.cutoff_frequency_hz, "cutoff_frequency_hz")?,
                ))
            }
            WaveformKind::SquareWave => {
                forbid(self.amplitude_volts, "amplitude_volts", "square wave")?;
                forbid(self.offset_volts, "offset_volts", "square wave")?;
                forbid(self.cutoff_frequency_hz, "cutoff_frequency_hz", "square wave")?;
                Ok(ChannelParams::square_wave(
                    start,
                    end,
                    require(self.max_volts, "max_volts")?,
                    require(self.min_volts, "min_volts")?,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_is_pinpointed() {
        let raw = RawChannelParams {
            start_time_ms: Some(0.),
            end_time_ms: Some(10.),
            amplitude_volts: Some(1.),
            offset_volts: Some(2.),
            ..Default::default()
        };
        match raw.to_params("etl", "488", WaveformKind::Sawtooth) {
            Err(ConfigError::MissingParameter { port, channel, field }) => {
                assert_eq!((port.as_str(), channel.as_str(), field), ("etl", "488", "cutoff_frequency_hz"));
            }
            other => panic!("expected MissingParameter, got {:?}", other),
        }
    }

    #[test]
    fn foreign_field_rejected() {
        let raw = RawChannelParams {
            start_time_ms: Some(0.),
            end_time_ms: Some(10.),
            max_volts: Some(5.),
            min_volts: Some(0.),
            offset_volts: Some(1.),
            ..Default::default()
        };
        assert!(matches!(
            raw.to_params("laser", "488", WaveformKind::SquareWave),
            Err(ConfigError::UnknownParameter { field: "offset_volts", .. })
        ));
    }
}
