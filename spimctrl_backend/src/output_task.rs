//! Retriggerable waveform output task.
//!
//! An [`OutputTask`] owns every port of one [`PortRegistry`] and plays one compiled cycle per
//! trigger edge. Its lifecycle:
//!
//! ```text
//!   Unarmed --arm--> Armed --start--> Running --stop--> Stopped --arm--> Armed ...
//!      \________________\_________________\________________\--close--> Closed
//! ```
//!
//! - `arm` compiles the buffer before touching the card, so a configuration error leaves the
//!   task exactly as it was. Arming a running task is refused with `AlreadyRunning`.
//! - `start` requires `Armed`.
//! - `stop` is a no-op unless the task runs.
//! - `close` (also run on drop) stops the transport, closes it and releases the task's lines.

use ndarray::Array2;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use spimcompiler_backend::{Channel, PhysicalLine, PortRegistry, TimingConfig, VoltageRange};

use crate::error::{collapse, DaqError, DaqResult, TransportError};
use crate::manager::{ManagedTask, TaskId, TaskManager, TaskRole};
use crate::transport::OutputTransport;

/// Interval between two progress polls in [`OutputTask::wait_until_done`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputState {
    Unarmed,
    Armed,
    Running,
    Stopped,
    Closed,
}
impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                OutputState::Unarmed => "unarmed",
                OutputState::Armed => "armed",
                OutputState::Running => "running",
                OutputState::Stopped => "stopped",
                OutputState::Closed => "closed",
            }
        )
    }
}

pub(crate) struct OutputCore {
    id: TaskId,
    name: String,
    registry: PortRegistry,
    timing: TimingConfig,
    transport: Box<dyn OutputTransport>,
    state: OutputState,
    channel: Option<Channel>,
    buffer: Option<Array2<f64>>,
    // Cycles already reported by `poll_cycle` since the last start
    cycles_seen: u64,
}

impl OutputCore {
    fn driver_error(&self, context: String, source: TransportError) -> DaqError {
        DaqError::Transport {
            id: self.id,
            task: self.name.clone(),
            context,
            source,
        }
    }

    fn line_list(&self) -> String {
        self.registry
            .iter()
            .map(|p| format!("{}:{}", p.name(), p.line()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn state(&self) -> OutputState {
        self.state
    }

    fn arm(&mut self, channel: &str) -> DaqResult<()> {
        match self.state {
            OutputState::Running => {
                return Err(DaqError::AlreadyRunning {
                    task: self.name.clone(),
                })
            }
            OutputState::Closed => {
                return Err(DaqError::InvalidState {
                    task: self.name.clone(),
                    op: "arm",
                    state: self.state.to_string(),
                })
            }
            _ => {}
        }

        // Nothing reaches the card unless every port compiles
        let buffer = self.registry.compile(channel, &self.timing)?;
        let samples = self.timing.num_samples();

        if let Err(e) = self.load(&buffer, samples) {
            self.state = OutputState::Unarmed;
            self.channel = None;
            self.buffer = None;
            return Err(e);
        }
        info!(
            "Task {} '{}' armed for channel {} ({} ports x {} samples)",
            self.id,
            self.name,
            channel,
            buffer.nrows(),
            samples
        );
        self.buffer = Some(buffer);
        self.channel = Some(Channel::new(channel));
        self.state = OutputState::Armed;
        Ok(())
    }

    fn load(&mut self, buffer: &Array2<f64>, samples: usize) -> DaqResult<()> {
        let timing = &self.timing;
        self.transport
            .configure_clock(timing.sampling_frequency_hz, samples)
            .map_err(|e| {
                self.driver_error(
                    format!("configuring a {} Hz sample clock", timing.sampling_frequency_hz),
                    e,
                )
            })?;
        self.transport
            .arm_trigger(&timing.trigger_port, timing.trigger_polarity, timing.retriggerable)
            .map_err(|e| {
                self.driver_error(
                    format!("arming a {} edge trigger on {}", timing.trigger_polarity, timing.trigger_port.terminal()),
                    e,
                )
            })?;
        let written = self
            .transport
            .write(buffer)
            .map_err(|e| self.driver_error(format!("writing to [{}]", self.line_list()), e))?;
        if written != samples {
            return Err(DaqError::ShortWrite {
                task: self.name.clone(),
                written,
                expected: samples,
            });
        }
        debug!("Task {} '{}' wrote {} samples per line", self.id, self.name, written);
        Ok(())
    }

    fn start(&mut self) -> DaqResult<()> {
        match self.state {
            OutputState::Armed => {}
            OutputState::Running => {
                return Err(DaqError::AlreadyRunning {
                    task: self.name.clone(),
                })
            }
            OutputState::Unarmed | OutputState::Stopped => {
                return Err(DaqError::NotArmed {
                    task: self.name.clone(),
                })
            }
            OutputState::Closed => {
                return Err(DaqError::InvalidState {
                    task: self.name.clone(),
                    op: "start",
                    state: self.state.to_string(),
                })
            }
        }
        self.transport
            .start()
            .map_err(|e| self.driver_error("starting".to_string(), e))?;
        self.cycles_seen = 0;
        self.state = OutputState::Running;
        info!(
            "Task {} '{}' running, waiting for {} edges on {}",
            self.id,
            self.name,
            self.timing.trigger_polarity,
            self.timing.trigger_port.terminal()
        );
        Ok(())
    }

    fn stop(&mut self) -> DaqResult<()> {
        if self.state != OutputState::Running {
            return Ok(());
        }
        self.transport
            .stop()
            .map_err(|e| self.driver_error("stopping".to_string(), e))?;
        self.state = OutputState::Stopped;
        info!("Task {} '{}' stopped", self.id, self.name);
        Ok(())
    }

    // True once one more cycle than previously reported has been generated
    fn poll_cycle(&mut self) -> DaqResult<bool> {
        if self.state != OutputState::Running {
            return Err(DaqError::InvalidState {
                task: self.name.clone(),
                op: "wait for a cycle",
                state: self.state.to_string(),
            });
        }
        if self.timing.retriggerable {
            let generated = self
                .transport
                .samples_generated()
                .map_err(|e| self.driver_error("reading generation progress".to_string(), e))?;
            let target = (self.cycles_seen + 1) * self.timing.num_samples() as u64;
            if generated >= target {
                self.cycles_seen += 1;
                return Ok(true);
            }
            Ok(false)
        } else {
            if self.cycles_seen >= 1 {
                return Ok(false);
            }
            let done = self
                .transport
                .is_done()
                .map_err(|e| self.driver_error("polling completion".to_string(), e))?;
            if done {
                self.cycles_seen = 1;
            }
            Ok(done)
        }
    }

    fn close(&mut self) -> Vec<DaqError> {
        let mut errors = Vec::new();
        if self.state == OutputState::Closed {
            return errors;
        }
        if self.state == OutputState::Running {
            if let Err(e) = self.transport.stop() {
                errors.push(self.driver_error("stopping before close".to_string(), e));
            }
        }
        if let Err(e) = self.transport.close() {
            errors.push(self.driver_error("closing".to_string(), e));
        }
        self.state = OutputState::Closed;
        self.buffer = None;
        info!("Task {} '{}' closed", self.id, self.name);
        errors
    }
}

impl ManagedTask for OutputCore {
    fn teardown(&mut self) -> Vec<DaqError> {
        self.close()
    }
}

/// Handle to a waveform output task. Closing or dropping it releases its lines.
pub struct OutputTask {
    id: TaskId,
    name: String,
    lines: Vec<PhysicalLine>,
    manager: TaskManager,
    core: Arc<Mutex<OutputCore>>,
}

impl OutputTask {
    pub(crate) fn create(
        manager: &TaskManager,
        name: &str,
        registry: PortRegistry,
        timing: TimingConfig,
    ) -> DaqResult<Self> {
        let backend = manager.backend().clone();
        registry.validate_timing(&timing, &backend.limits())?;
        let kind = registry.line_kind()?;
        let ports: Vec<(PhysicalLine, VoltageRange)> = registry
            .iter()
            .map(|p| (p.line(), p.device_range()))
            .collect();
        let lines: Vec<PhysicalLine> = ports.iter().map(|(line, _)| *line).collect();

        let id = manager.claim(name, TaskRole::Output, &lines)?;
        let transport = match backend.open_output(name, &ports, kind) {
            Ok(transport) => transport,
            Err(source) => {
                manager.release(id);
                return Err(DaqError::Transport {
                    id,
                    task: name.to_string(),
                    context: format!("opening {kind} output on {}", backend.device_name()),
                    source,
                });
            }
        };

        let core = Arc::new(Mutex::new(OutputCore {
            id,
            name: name.to_string(),
            registry,
            timing,
            transport,
            state: OutputState::Unarmed,
            channel: None,
            buffer: None,
            cycles_seen: 0,
        }));
        manager.attach(id, core.clone())?;
        info!(
            "Created {} output task {} '{}' on {} with lines {:?}",
            kind,
            id,
            name,
            backend.device_name(),
            lines
        );
        Ok(OutputTask {
            id,
            name: name.to_string(),
            lines,
            manager: manager.clone(),
            core,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn lines(&self) -> &[PhysicalLine] {
        &self.lines
    }
    pub fn state(&self) -> OutputState {
        self.core.lock().state
    }
    pub fn timing(&self) -> TimingConfig {
        self.core.lock().timing.clone()
    }
    pub fn current_channel(&self) -> Option<Channel> {
        self.core.lock().channel.clone()
    }
    /// The matrix last written to the card, rows in port order.
    pub fn buffer(&self) -> Option<Array2<f64>> {
        self.core.lock().buffer.clone()
    }
    pub fn registry(&self) -> PortRegistry {
        self.core.lock().registry.clone()
    }

    pub(crate) fn core(&self) -> &Arc<Mutex<OutputCore>> {
        &self.core
    }

    pub fn arm(&self, channel: &str) -> DaqResult<()> {
        self.core.lock().arm(channel)
    }

    pub fn start(&self) -> DaqResult<()> {
        self.core.lock().start()
    }

    pub fn stop(&self) -> DaqResult<()> {
        self.core.lock().stop()
    }

    /// Stops, re-arms for `channel` and restarts, keeping every line claimed.
    pub fn switch_channel(&self, channel: &str) -> DaqResult<()> {
        let mut core = self.core.lock();
        core.stop()?;
        core.arm(channel)?;
        core.start()
    }

    /// Blocks until one further buffer cycle has been generated.
    ///
    /// Returns `TriggerTimeout` if no cycle completes within `timeout`; the task keeps running
    /// and the call may be repeated.
    pub fn wait_until_done(&self, timeout: Duration) -> DaqResult<()> {
        // No deadline when `timeout` reaches past the end of the clock
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.core.lock().poll_cycle()? {
                return Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(DaqError::TriggerTimeout {
                    task: self.name.clone(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stops and closes the transport, then releases every line. Idempotent.
    pub fn close(&self) -> DaqResult<()> {
        let errors = self.core.lock().close();
        self.manager.release(self.id);
        collapse(errors)
    }
}

impl Drop for OutputTask {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing task {} '{}' on drop: {}", self.id, self.name, e);
        }
    }
}

impl fmt::Debug for OutputTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OutputTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lines", &self.lines)
            .field("state", &self.state())
            .finish()
    }
}
