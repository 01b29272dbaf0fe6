use std::borrow::Borrow;
use std::fmt;

use crate::waveform::WaveformKind;

// Imaging channel identifier, typically the excitation wavelength ("488", "561", "639")
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    pub fn new(id: impl Into<String>) -> Self {
        Channel(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl From<&str> for Channel {
    fn from(id: &str) -> Self {
        Channel::new(id)
    }
}
impl From<String> for Channel {
    fn from(id: String) -> Self {
        Channel(id)
    }
}
// Lets port tables be queried with a plain &str
impl Borrow<str> for Channel {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Waveform payload of one (port, channel) pair. The variant must agree with the port's kind.
#[derive(Clone, Debug, PartialEq)]
pub enum WaveformParams {
    Sawtooth {
        amplitude_volts: f64,
        offset_volts: f64,
        cutoff_frequency_hz: f64,
    },
    SquareWave {
        max_volts: f64,
        min_volts: f64,
    },
}

impl WaveformParams {
    pub fn kind(&self) -> WaveformKind {
        match self {
            WaveformParams::Sawtooth { .. } => WaveformKind::Sawtooth,
            WaveformParams::SquareWave { .. } => WaveformKind::SquareWave,
        }
    }

    // Lowest and highest voltage the unfiltered waveform can reach
    pub fn extent(&self) -> (f64, f64) {
        match *self {
            WaveformParams::Sawtooth {
                amplitude_volts,
                offset_volts,
                ..
            } => {
                let a = amplitude_volts.abs();
                (offset_volts - a, offset_volts + a)
            }
            WaveformParams::SquareWave {
                max_volts,
                min_volts,
            } => (min_volts.min(max_volts), min_volts.max(max_volts)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelParams {
    pub start_time_ms: f64,
    pub end_time_ms: f64,
    pub waveform: WaveformParams,
}

impl ChannelParams {
    pub fn sawtooth(
        start_time_ms: f64,
        end_time_ms: f64,
        amplitude_volts: f64,
        offset_volts: f64,
        cutoff_frequency_hz: f64,
    ) -> Self {
        ChannelParams {
            start_time_ms,
            end_time_ms,
            waveform: WaveformParams::Sawtooth {
                amplitude_volts,
                offset_volts,
                cutoff_frequency_hz,
            },
        }
    }

    pub fn square_wave(start_time_ms: f64, end_time_ms: f64, max_volts: f64, min_volts: f64) -> Self {
        ChannelParams {
            start_time_ms,
            end_time_ms,
            waveform: WaveformParams::SquareWave {
                max_volts,
                min_volts,
            },
        }
    }

    pub fn kind(&self) -> WaveformKind {
        self.waveform.kind()
    }

    // Window must satisfy 0 <= start <= end <= cycle
    pub fn window_fits(&self, cycle_length_ms: f64) -> bool {
        self.start_time_ms.is_finite()
            && self.end_time_ms.is_finite()
            && self.start_time_ms >= 0.
            && self.start_time_ms <= self.end_time_ms
            && self.end_time_ms <= cycle_length_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn channel_lookup_by_str() {
        let mut table = IndexMap::new();
        table.insert(Channel::new("488"), 1);
        assert_eq!(table.get("488"), Some(&1));
        assert_eq!(table.get("561"), None);
    }

    #[test]
    fn sawtooth_extent_ignores_amplitude_sign() {
        let params = ChannelParams::sawtooth(0., 10., -2., 1., 100.);
        assert_eq!(params.waveform.extent(), (-1., 3.));
    }

    #[test]
    fn window_bounds() {
        let params = ChannelParams::square_wave(15., 549., 5., 0.);
        assert!(params.window_fits(694.));
        assert!(!params.window_fits(500.));
        assert!(!ChannelParams::square_wave(-1., 5., 5., 0.).window_fits(694.));
        assert!(!ChannelParams::square_wave(6., 5., 5., 0.).window_fits(694.));
        assert!(ChannelParams::square_wave(5., 5., 5., 0.).window_fits(694.));
    }
}
