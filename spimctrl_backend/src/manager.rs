//! Task manager: the single owner of physical line claims.
//!
//! Every task is created through a [`TaskManager`], which records which task holds which
//! physical line. A claim covers all lines of a task or none of them. Lines go back to the
//! pool when the task is closed, dropped, or swept up by [`TaskManager::shutdown`].
//!
//! Locking: the claim table is one `parking_lot::Mutex`. Task cores have their own locks and
//! are never locked while the table lock is held; teardown first snapshots the live tasks, then
//! drops the table lock, then stops and closes each task.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use spimcompiler_backend::{ClockSpec, PhysicalLine, PortRegistry, TimingConfig};

use crate::clock_task::ClockTask;
use crate::error::{DaqError, DaqResult};
use crate::output_task::OutputTask;
use crate::pulse::{self, PulseSpec};
use crate::transport::DaqBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);
impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskRole {
    Output,
    Clock,
    // Temporary one-shot pulse task, held only during `TaskManager::pulse`
    Pulse,
}

// Teardown view of a task core: stop if running, close the transport, report every failure
pub(crate) trait ManagedTask: Send {
    fn teardown(&mut self) -> Vec<DaqError>;
}

struct LiveTask {
    name: String,
    role: TaskRole,
    lines: Vec<PhysicalLine>,
    control: Option<Arc<Mutex<dyn ManagedTask>>>,
}

#[derive(Default)]
struct ClaimTable {
    next_id: u64,
    claims: IndexMap<PhysicalLine, TaskId>,
    live: IndexMap<TaskId, LiveTask>,
}

/// Outcome of [`TaskManager::shutdown`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub closed: Vec<String>,
    pub released: usize,
    pub errors: Vec<DaqError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> DaqResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::Teardown(self.errors))
        }
    }
}

#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    backend: Arc<dyn DaqBackend>,
    table: Mutex<ClaimTable>,
}

impl TaskManager {
    pub fn new(backend: Arc<dyn DaqBackend>) -> Self {
        TaskManager {
            inner: Arc::new(ManagerInner {
                backend,
                table: Mutex::new(ClaimTable::default()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DaqBackend> {
        &self.inner.backend
    }

    /// Creates a waveform output task over every port of `registry`, claiming all port lines.
    pub fn create_output(
        &self,
        name: &str,
        registry: PortRegistry,
        timing: TimingConfig,
    ) -> DaqResult<OutputTask> {
        OutputTask::create(self, name, registry, timing)
    }

    /// Creates the frame clock paired with `output`, claiming the counter and its output terminal.
    pub fn create_clock(&self, name: &str, spec: ClockSpec, output: &OutputTask) -> DaqResult<ClockTask> {
        ClockTask::create(self, name, spec, output)
    }

    /// Plays one finite pulse on an AO pin, then returns the pin to 0 V.
    ///
    /// The pin is claimed for the duration of the call; `LineConflict` if a task holds it.
    pub fn pulse(&self, spec: &PulseSpec) -> DaqResult<()> {
        pulse::run(self, spec)
    }

    /// Atomically claims `lines` for a new task. Either every line is claimed or none is.
    pub fn claim(&self, name: &str, role: TaskRole, lines: &[PhysicalLine]) -> DaqResult<TaskId> {
        let mut table = self.inner.table.lock();
        for line in lines {
            if let Some(owner) = table.claims.get(line) {
                let owner = table
                    .live
                    .get(owner)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| owner.to_string());
                return Err(DaqError::LineConflict {
                    line: *line,
                    owner,
                    requester: name.to_string(),
                });
            }
        }
        let id = TaskId(table.next_id);
        table.next_id += 1;
        for line in lines {
            table.claims.insert(*line, id);
        }
        table.live.insert(
            id,
            LiveTask {
                name: name.to_string(),
                role,
                lines: lines.to_vec(),
                control: None,
            },
        );
        debug!("Task {} '{}' claimed {:?}", id, name, lines);
        Ok(id)
    }

    // Registers the core used by `shutdown`; done once the transport is open
    pub(crate) fn attach(&self, id: TaskId, control: Arc<Mutex<dyn ManagedTask>>) -> DaqResult<()> {
        let mut table = self.inner.table.lock();
        let task = table.live.get_mut(&id).ok_or(DaqError::UnknownTask { id })?;
        task.control = Some(control);
        Ok(())
    }

    /// Releases every line held by `id`. Releasing an unknown or already released task is a no-op.
    pub fn release(&self, id: TaskId) -> usize {
        let mut table = self.inner.table.lock();
        let before = table.claims.len();
        table.claims.retain(|_, owner| *owner != id);
        let released = before - table.claims.len();
        if let Some(task) = table.live.shift_remove(&id) {
            debug!("Task {} '{}' released {:?}", id, task.name, task.lines);
        }
        released
    }

    pub fn owner(&self, line: &PhysicalLine) -> Option<TaskId> {
        self.inner.table.lock().claims.get(line).copied()
    }

    pub fn claimed_lines(&self) -> Vec<PhysicalLine> {
        self.inner.table.lock().claims.keys().copied().collect()
    }

    pub fn live_tasks(&self) -> Vec<(TaskId, String, TaskRole)> {
        self.inner
            .table
            .lock()
            .live
            .iter()
            .map(|(id, t)| (*id, t.name.clone(), t.role))
            .collect()
    }

    /// Stops and closes every live task, clock tasks first, then releases every line.
    ///
    /// Never stops early: each failure is recorded in the report and the sweep continues, so
    /// all lines are free afterwards whatever state the tasks were in.
    pub fn shutdown(&self) -> TeardownReport {
        let mut live: Vec<(TaskId, String, TaskRole, Option<Arc<Mutex<dyn ManagedTask>>>)> = {
            let table = self.inner.table.lock();
            table
                .live
                .iter()
                .map(|(id, t)| (*id, t.name.clone(), t.role, t.control.clone()))
                .collect()
        };
        live.sort_by_key(|(id, _, role, _)| (*role != TaskRole::Clock, *id));

        let mut report = TeardownReport::default();
        for (id, name, _role, control) in live {
            if let Some(control) = control {
                let errors = control.lock().teardown();
                for e in errors {
                    warn!("Teardown of task {} '{}': {}", id, name, e);
                    report.errors.push(e);
                }
            }
            report.released += self.release(id);
            report.closed.push(name);
        }

        // Lines claimed by a task whose creation never finished
        let mut table = self.inner.table.lock();
        report.released += table.claims.len();
        table.claims.clear();
        table.live.clear();
        drop(table);

        info!(
            "Shutdown closed {} task(s), released {} line(s), {} error(s)",
            report.closed.len(),
            report.released,
            report.errors.len()
        );
        report
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("device", &self.inner.backend.device_name())
            .field("claimed_lines", &self.claimed_lines())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedDaq;

    fn manager() -> TaskManager {
        TaskManager::new(Arc::new(SimulatedDaq::new("Dev1")))
    }

    #[test]
    fn claim_is_all_or_nothing() {
        let m = manager();
        let a = m.claim("a", TaskRole::Output, &[PhysicalLine::AnalogOut(0)]).unwrap();
        let res = m.claim(
            "b",
            TaskRole::Output,
            &[PhysicalLine::AnalogOut(1), PhysicalLine::AnalogOut(0)],
        );
        match res {
            Err(DaqError::LineConflict { owner, requester, .. }) => {
                assert_eq!(owner, "a");
                assert_eq!(requester, "b");
            }
            other => panic!("expected LineConflict, got {:?}", other),
        }
        // ao1 was not left behind by the failed claim
        assert_eq!(m.owner(&PhysicalLine::AnalogOut(1)), None);
        assert_eq!(m.owner(&PhysicalLine::AnalogOut(0)), Some(a));
    }

    #[test]
    fn release_is_idempotent() {
        let m = manager();
        let id = m
            .claim("a", TaskRole::Output, &[PhysicalLine::AnalogOut(0), PhysicalLine::AnalogOut(1)])
            .unwrap();
        assert_eq!(m.release(id), 2);
        assert_eq!(m.release(id), 0);
        assert!(m.claimed_lines().is_empty());
        assert!(m.live_tasks().is_empty());
    }

    #[test]
    fn shutdown_sweeps_half_created_tasks() {
        let m = manager();
        m.claim("orphan", TaskRole::Clock, &[PhysicalLine::Counter(0)]).unwrap();
        let report = m.shutdown();
        assert!(report.is_clean());
        assert_eq!(report.released, 1);
        assert!(m.claimed_lines().is_empty());
    }
}
