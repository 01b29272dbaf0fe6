//! Acquisition control: one waveform output task paced by one frame clock.
//!
//! The order of operations matters on the card:
//! - start: arm and start the output (it then waits for edges), then start the clock;
//! - switch: stop the clock, stop/re-arm/restart the output, restart the clock;
//! - stop and close: clock first, so no edge reaches a half-stopped output task.

use indexmap::IndexMap;
use ndarray::Array1;
use std::time::Duration;
use tracing::{info, warn};

use spimcompiler_backend::{preview, Channel};

use crate::clock_task::ClockTask;
use crate::config::AcquisitionPlan;
use crate::error::{DaqError, DaqResult};
use crate::manager::{TaskManager, TeardownReport};
use crate::output_task::OutputTask;

pub struct Acquisition {
    output: OutputTask,
    clock: ClockTask,
    frames: u64,
}

impl Acquisition {
    /// Creates the output task and its frame clock, claiming every line they need.
    pub fn setup(manager: &TaskManager, plan: &AcquisitionPlan) -> DaqResult<Self> {
        let output = manager.create_output(&plan.device.output_task, plan.registry.clone(), plan.timing.clone())?;
        let clock = manager.create_clock(&plan.device.clock_task, plan.clock.clone(), &output)?;
        Ok(Acquisition {
            output,
            clock,
            frames: 0,
        })
    }

    pub fn output(&self) -> &OutputTask {
        &self.output
    }
    pub fn clock(&self) -> &ClockTask {
        &self.clock
    }
    pub fn current_channel(&self) -> Option<Channel> {
        self.output.current_channel()
    }
    pub fn frames_acquired(&self) -> u64 {
        self.frames
    }

    pub fn start(&mut self, channel: &str) -> DaqResult<()> {
        self.output.arm(channel)?;
        self.output.start()?;
        self.clock.start()?;
        info!("Acquisition started on channel {}", channel);
        Ok(())
    }

    pub fn switch_channel(&mut self, channel: &str) -> DaqResult<()> {
        self.clock.stop()?;
        self.output.switch_channel(channel)?;
        self.clock.start()?;
        info!("Acquisition switched to channel {}", channel);
        Ok(())
    }

    /// Waits for the next frame's output cycle, retrying up to `attempts` timeouts in total.
    pub fn wait_frame(&mut self, timeout: Duration, attempts: usize) -> DaqResult<()> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.output.wait_until_done(timeout) {
                Ok(()) => {
                    self.frames += 1;
                    return Ok(());
                }
                Err(DaqError::TriggerTimeout { task, timeout }) if attempt < attempts => {
                    warn!(
                        "No cycle from '{}' within {:?} (attempt {}/{}), waiting again",
                        task, timeout, attempt, attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(DaqError::TriggerTimeout {
            task: self.output.name().to_string(),
            timeout,
        })
    }

    /// Stops the clock, then the output. Both are attempted even if the first fails.
    pub fn stop(&mut self) -> DaqResult<()> {
        let clock = self.clock.stop();
        let output = self.output.stop();
        clock.and(output)
    }

    /// Closes the clock, then the output, releasing all their lines.
    pub fn close(self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (name, res) in [
            (self.clock.name().to_string(), self.clock.close()),
            (self.output.name().to_string(), self.output.close()),
        ] {
            if let Err(e) = res {
                warn!("Closing '{}': {}", name, e);
                report.errors.push(e);
            }
            report.closed.push(name);
        }
        report.released = self.clock.lines().len() + self.output.lines().len();
        info!(
            "Acquisition closed after {} frame(s), {} error(s)",
            self.frames,
            report.errors.len()
        );
        report
    }

    /// Per-port display buffers for `channel`, one full cycle reduced to `target_points`.
    pub fn preview(&self, channel: &str, target_points: usize) -> DaqResult<IndexMap<String, Array1<f64>>> {
        Ok(preview(
            &self.output.registry(),
            channel,
            &self.output.timing(),
            target_points,
        )?)
    }
}
