//! Frame clock: a counter pulse train that retriggers the paired output task once per frame.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use spimcompiler_backend::{ClockSpec, CompileError, PhysicalLine};

use crate::error::{collapse, DaqError, DaqResult, TransportError};
use crate::manager::{ManagedTask, TaskId, TaskManager, TaskRole};
use crate::output_task::{OutputCore, OutputState, OutputTask};
use crate::transport::PulseTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Running,
    Stopped,
    Closed,
}
impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ClockState::Idle => "idle",
                ClockState::Running => "running",
                ClockState::Stopped => "stopped",
                ClockState::Closed => "closed",
            }
        )
    }
}

pub(crate) struct ClockCore {
    id: TaskId,
    name: String,
    spec: ClockSpec,
    transport: Box<dyn PulseTransport>,
    state: ClockState,
}

impl ClockCore {
    fn driver_error(&self, context: String, source: TransportError) -> DaqError {
        DaqError::Transport {
            id: self.id,
            task: self.name.clone(),
            context,
            source,
        }
    }

    fn stop(&mut self) -> DaqResult<()> {
        if self.state != ClockState::Running {
            return Ok(());
        }
        self.transport.stop().map_err(|e| {
            self.driver_error(format!("stopping pulses on {}", self.spec.counter), e)
        })?;
        self.state = ClockState::Stopped;
        info!("Clock {} '{}' stopped", self.id, self.name);
        Ok(())
    }

    fn close(&mut self) -> Vec<DaqError> {
        let mut errors = Vec::new();
        if self.state == ClockState::Closed {
            return errors;
        }
        if self.state == ClockState::Running {
            if let Err(e) = self.transport.stop() {
                errors.push(self.driver_error("stopping before close".to_string(), e));
            }
        }
        if let Err(e) = self.transport.close() {
            errors.push(self.driver_error("closing".to_string(), e));
        }
        self.state = ClockState::Closed;
        info!("Clock {} '{}' closed", self.id, self.name);
        errors
    }
}

impl ManagedTask for ClockCore {
    fn teardown(&mut self) -> Vec<DaqError> {
        self.close()
    }
}

/// Handle to the frame clock. Closing or dropping it releases the counter and its terminal.
pub struct ClockTask {
    id: TaskId,
    name: String,
    spec: ClockSpec,
    paired_name: String,
    paired: Arc<Mutex<OutputCore>>,
    manager: TaskManager,
    core: Arc<Mutex<ClockCore>>,
}

impl ClockTask {
    pub(crate) fn create(
        manager: &TaskManager,
        name: &str,
        spec: ClockSpec,
        output: &OutputTask,
    ) -> DaqResult<Self> {
        let backend = manager.backend().clone();
        spec.validate(&output.timing())?;
        if !backend.limits().has_line(&spec.counter) {
            return Err(CompileError::InvalidLineKind {
                line: spec.counter,
                kind: spec.counter.kind(),
                usage: "a counter on this card (no such counter)",
            }
            .into());
        }

        let lines = [spec.counter, spec.output_port];
        let id = manager.claim(name, TaskRole::Clock, &lines)?;
        let opened = backend.open_pulse(name, spec.counter).and_then(|mut transport| {
            transport.configure_pulse(spec.frequency_hz, spec.duty_cycle, &spec.output_port)?;
            Ok(transport)
        });
        let transport = match opened {
            Ok(transport) => transport,
            Err(source) => {
                manager.release(id);
                return Err(DaqError::Transport {
                    id,
                    task: name.to_string(),
                    context: format!(
                        "configuring {} Hz pulses on {} -> {}",
                        spec.frequency_hz,
                        spec.counter,
                        spec.output_port.terminal()
                    ),
                    source,
                });
            }
        };

        let core = Arc::new(Mutex::new(ClockCore {
            id,
            name: name.to_string(),
            spec: spec.clone(),
            transport,
            state: ClockState::Idle,
        }));
        manager.attach(id, core.clone())?;
        info!(
            "Created clock {} '{}': {} Hz, duty {} on {} -> {}",
            id,
            name,
            spec.frequency_hz,
            spec.duty_cycle,
            spec.counter,
            spec.output_port.terminal()
        );
        Ok(ClockTask {
            id,
            name: name.to_string(),
            spec,
            paired_name: output.name().to_string(),
            paired: output.core().clone(),
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
    pub fn spec(&self) -> &ClockSpec {
        &self.spec
    }
    pub fn lines(&self) -> [PhysicalLine; 2] {
        [self.spec.counter, self.spec.output_port]
    }
    pub fn state(&self) -> ClockState {
        self.core.lock().state
    }

    /// Starts (or restarts) the pulse train. The paired output task must be armed or running.
    pub fn start(&self) -> DaqResult<()> {
        // Output core is read and released before the clock core is locked
        let output_state = self.paired.lock().state();
        if !matches!(output_state, OutputState::Armed | OutputState::Running) {
            return Err(DaqError::NotArmed {
                task: self.paired_name.clone(),
            });
        }

        let mut core = self.core.lock();
        match core.state {
            ClockState::Idle | ClockState::Stopped => {}
            ClockState::Running => {
                return Err(DaqError::AlreadyRunning {
                    task: self.name.clone(),
                })
            }
            ClockState::Closed => {
                return Err(DaqError::InvalidState {
                    task: self.name.clone(),
                    op: "start",
                    state: core.state.to_string(),
                })
            }
        }
        core.transport
            .start()
            .map_err(|e| core.driver_error(format!("starting pulses on {}", self.spec.counter), e))?;
        core.state = ClockState::Running;
        info!(
            "Clock {} '{}' running at {} Hz",
            self.id, self.name, self.spec.frequency_hz
        );
        Ok(())
    }

    pub fn stop(&self) -> DaqResult<()> {
        self.core.lock().stop()
    }

    /// Stops the pulse train, closes the counter task and releases its lines. Idempotent.
    pub fn close(&self) -> DaqResult<()> {
        let errors = self.core.lock().close();
        self.manager.release(self.id);
        collapse(errors)
    }
}

impl Drop for ClockTask {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing clock {} '{}' on drop: {}", self.id, self.name, e);
        }
    }
}

impl fmt::Debug for ClockTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClockTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("state", &self.state())
            .finish()
    }
}
