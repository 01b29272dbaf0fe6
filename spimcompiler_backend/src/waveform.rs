//! Sample-exact waveform synthesis.
//!
//! [`synthesize`] turns one port's parameters for one channel into the buffer that port plays
//! during a single output cycle. It is a pure function: the same inputs always yield the same
//! samples, and nothing outside the returned array is touched.
//!
//! Sample `i` sits at `t_i = i * 1000 / fs` ms. The active window is the half-open interval
//! `[start_time_ms, end_time_ms)`, so a window edge lands on the first sample at or after the
//! boundary.
//!
//! - **SquareWave**: `max_volts` inside the window, `min_volts` outside.
//! - **Sawtooth**: the ramp `r(t) = amplitude * (2 (t - start) / (end - start) - 1) + offset`
//!   inside the window and `offset` outside, passed through a single-pole low-pass filter with
//!   time constant `tau = 1 / (2 pi fc)`:
//!   `f(i) = f(i-1) + dt / (tau + dt) * (r(t_i) - f(i-1))`, seeded with `f(0) = r(t_0)`.
//!
//! Every sample is checked against the port's device range with a tolerance of 0.1 % of the
//! range span, then clamped into the range. A sample further out than the tolerance is a
//! configuration error, not something to silently clip.

use ndarray::Array1;
use std::f64::consts::PI;
use std::fmt;

use crate::channel::WaveformParams;
use crate::error::{CompileError, CompileResult};
use crate::port::PortSpec;
use crate::timing::TimingConfig;

/// Relative tolerance (fraction of the device range span) before an excursion is an error.
pub const RANGE_TOLERANCE: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaveformKind {
    Sawtooth,
    SquareWave,
}
impl fmt::Display for WaveformKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                WaveformKind::Sawtooth => "sawtooth",
                WaveformKind::SquareWave => "square wave",
            }
        )
    }
}

/// Synthesizes one cycle of `port` for `channel`.
///
/// ```
/// use indexmap::IndexMap;
/// use spimcompiler_backend::*;
///
/// let mut channels = IndexMap::new();
/// channels.insert(Channel::new("488"), ChannelParams::square_wave(1., 2., 5., 0.));
/// let port = PortSpec::new(
///     "laser",
///     "ao0".parse().unwrap(),
///     VoltageRange::new(0., 5.).unwrap(),
///     WaveformKind::SquareWave,
///     channels,
/// )
/// .unwrap();
/// let timing = TimingConfig {
///     sampling_frequency_hz: 1000.,
///     period_time_ms: 3.,
///     rest_time_ms: 1.,
///     sample_mode: SampleMode::Finite,
///     retriggerable: true,
///     trigger_port: "PFI0".parse().unwrap(),
///     trigger_polarity: TriggerPolarity::Rising,
/// };
/// let buf = synthesize(&port, "488", &timing).unwrap();
/// assert_eq!(buf.to_vec(), vec![0., 5., 0., 0.]);
/// ```
pub fn synthesize(port: &PortSpec, channel: &str, timing: &TimingConfig) -> CompileResult<Array1<f64>> {
    let params = port.params(channel)?;
    let cycle_ms = timing.cycle_length_ms();
    if !params.window_fits(cycle_ms) {
        return Err(CompileError::InvalidWindow {
            port: port.name().to_string(),
            channel: channel.to_string(),
            start_ms: params.start_time_ms,
            end_ms: params.end_time_ms,
            cycle_ms,
        });
    }

    let (start, end) = (params.start_time_ms, params.end_time_ms);
    let in_window = |t: f64| t >= start && t < end;
    let n = timing.num_samples();

    let mut buffer = match params.waveform {
        WaveformParams::SquareWave {
            max_volts,
            min_volts,
        } => Array1::from_shape_fn(n, |i| {
            if in_window(timing.sample_time_ms(i)) {
                max_volts
            } else {
                min_volts
            }
        }),
        WaveformParams::Sawtooth {
            amplitude_volts,
            offset_volts,
            cutoff_frequency_hz,
        } => {
            let ramp = |t: f64| {
                if in_window(t) {
                    amplitude_volts * (2. * (t - start) / (end - start) - 1.) + offset_volts
                } else {
                    offset_volts
                }
            };
            let tau = 1. / (2. * PI * cutoff_frequency_hz);
            let dt = 1. / timing.sampling_frequency_hz;
            let alpha = dt / (tau + dt);

            let mut buffer = Array1::zeros(n);
            let mut last = ramp(timing.sample_time_ms(0));
            for (i, sample) in buffer.iter_mut().enumerate() {
                if i > 0 {
                    last += alpha * (ramp(timing.sample_time_ms(i)) - last);
                }
                *sample = last;
            }
            buffer
        }
    };

    let range = port.device_range();
    let tolerance = RANGE_TOLERANCE * range.span();
    for sample in buffer.iter_mut() {
        if *sample < range.min_volts - tolerance || *sample > range.max_volts + tolerance {
            return Err(CompileError::OutOfRange {
                port: port.name().to_string(),
                channel: channel.to_string(),
                value: *sample,
                min: range.min_volts,
                max: range.max_volts,
            });
        }
        *sample = range.clamp(*sample);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelParams};
    use crate::port::VoltageRange;
    use crate::timing::{SampleMode, TriggerPolarity};
    use indexmap::IndexMap;

    fn timing(fs: f64, period: f64, rest: f64) -> TimingConfig {
        TimingConfig {
            sampling_frequency_hz: fs,
            period_time_ms: period,
            rest_time_ms: rest,
            sample_mode: SampleMode::Finite,
            retriggerable: true,
            trigger_port: "PFI0".parse().unwrap(),
            trigger_polarity: TriggerPolarity::Rising,
        }
    }

    fn port(kind: WaveformKind, params: ChannelParams) -> PortSpec {
        let mut channels = IndexMap::new();
        channels.insert(Channel::new("488"), params);
        PortSpec::new(
            "p",
            "ao0".parse().unwrap(),
            VoltageRange::new(-5., 5.).unwrap(),
            kind,
            channels,
        )
        .unwrap()
    }

    #[test]
    fn square_edges_on_first_sample_at_boundary() {
        // fs = 3 kHz: samples at 0, 0.333.., 0.666.., 1.0, ...
        let p = port(WaveformKind::SquareWave, ChannelParams::square_wave(1., 2., 3., -1.));
        let buf = synthesize(&p, "488", &timing(3000., 3., 0.)).unwrap();
        assert_eq!(buf.len(), 9);
        assert_eq!(buf.to_vec(), vec![-1., -1., -1., 3., 3., 3., -1., -1., -1.]);
    }

    #[test]
    fn empty_window_stays_at_rest_level() {
        let p = port(WaveformKind::SquareWave, ChannelParams::square_wave(2., 2., 3., -1.));
        let buf = synthesize(&p, "488", &timing(1000., 4., 0.)).unwrap();
        assert!(buf.iter().all(|&v| v == -1.));

        let saw = port(WaveformKind::Sawtooth, ChannelParams::sawtooth(2., 2., 1., 0.5, 10.));
        let buf = synthesize(&saw, "488", &timing(1000., 4., 0.)).unwrap();
        assert!(buf.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn sawtooth_seeded_with_first_ramp_value() {
        // Window starts at t = 0, so r(t_0) = offset - amplitude
        let p = port(WaveformKind::Sawtooth, ChannelParams::sawtooth(0., 10., 2., 1., 5.));
        let buf = synthesize(&p, "488", &timing(1000., 10., 5.)).unwrap();
        assert_eq!(buf[0], -1.);
    }

    #[test]
    fn window_past_cycle_end() {
        let p = port(WaveformKind::SquareWave, ChannelParams::square_wave(1., 20., 3., -1.));
        match synthesize(&p, "488", &timing(1000., 10., 5.)) {
            Err(CompileError::InvalidWindow { cycle_ms, .. }) => assert_eq!(cycle_ms, 15.),
            other => panic!("expected InvalidWindow, got {:?}", other),
        }
    }

    #[test]
    fn unknown_channel() {
        let p = port(WaveformKind::SquareWave, ChannelParams::square_wave(1., 2., 3., -1.));
        assert!(matches!(
            synthesize(&p, "561", &timing(1000., 10., 5.)),
            Err(CompileError::ChannelMismatch { .. })
        ));
    }
}
