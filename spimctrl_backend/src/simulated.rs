//! Simulated output card.
//!
//! [`SimulatedDaq`] stands in for the NI driver when no hardware is present and in tests. It
//! keeps a shared board model behind one `parking_lot::Mutex`:
//!
//! - Output tasks store the buffers written to them and play one cycle per matching trigger
//!   edge. Playback takes `samples / fs` of wall-clock time; edges arriving mid-cycle are
//!   ignored, and a non-retriggerable task plays at most once per start.
//! - Pulse tasks run a background thread driven by a `crossbeam` ticker that raises the output
//!   terminal once per period and lowers it after `duty * period`. Each edge is delivered to
//!   every output task listening on that terminal.
//! - [`SimulatedDaq::fire_edge`] injects a trigger edge by hand, and
//!   [`SimulatedDaq::disconnect_line`] makes every task touching a line fail from then on.

use crossbeam::channel::{bounded, select, tick, RecvTimeoutError, Sender};
use indexmap::{IndexMap, IndexSet};
use ndarray::Array2;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use spimcompiler_backend::{DeviceLimits, LineKind, PhysicalLine, TriggerPolarity, VoltageRange};

use crate::error::{TransportError, TransportResult};
use crate::transport::{DaqBackend, OutputTransport, PulseTransport};

// Error codes borrowed from the NI-DAQmx numbering
pub const SIM_ERR_INVALID_TASK: i32 = -200088;
pub const SIM_ERR_NO_SUCH_LINE: i32 = -200170;
pub const SIM_ERR_DISCONNECTED: i32 = -201003;
pub const SIM_ERR_BAD_BUFFER: i32 = -200524;
pub const SIM_ERR_NOT_CONFIGURED: i32 = -200077;

struct SimOutput {
    name: String,
    lines: Vec<PhysicalLine>,
    sampling_frequency_hz: f64,
    samples_per_cycle: usize,
    trigger: Option<(PhysicalLine, TriggerPolarity, bool)>,
    buffer: Option<Array2<f64>>,
    running: bool,
    completed: u64,
    playing_since: Option<Instant>,
}

impl SimOutput {
    fn cycle_duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_cycle as f64 / self.sampling_frequency_hz)
    }

    fn retriggerable(&self) -> bool {
        self.trigger.map(|(_, _, retrig)| retrig).unwrap_or(false)
    }

    // Books a finished cycle
    fn settle(&mut self, now: Instant) {
        if let Some(since) = self.playing_since {
            if now.duration_since(since) >= self.cycle_duration() {
                self.completed += 1;
                self.playing_since = None;
            }
        }
    }

    fn generated(&mut self, now: Instant) -> u64 {
        self.settle(now);
        let partial = match self.playing_since {
            Some(since) => {
                let elapsed = now.duration_since(since).as_secs_f64();
                ((elapsed * self.sampling_frequency_hz) as u64).min(self.samples_per_cycle as u64)
            }
            None => 0,
        };
        self.completed * self.samples_per_cycle as u64 + partial
    }

    fn on_edge(&mut self, now: Instant) {
        if !self.running || self.buffer.is_none() {
            return;
        }
        self.settle(now);
        if self.playing_since.is_some() {
            trace!("{}: edge ignored during playback", self.name);
            return;
        }
        if !self.retriggerable() && self.completed >= 1 {
            return;
        }
        self.playing_since = Some(now);
    }
}

#[derive(Default)]
struct Board {
    next_key: u64,
    outputs: IndexMap<u64, SimOutput>,
    disconnected: IndexSet<PhysicalLine>,
    rising_edges: IndexMap<PhysicalLine, u64>,
    // Last buffer written per task name, with the number of writes so far
    written: IndexMap<String, (Array2<f64>, usize)>,
}

impl Board {
    fn edge(&mut self, terminal: PhysicalLine, polarity: TriggerPolarity) {
        if self.disconnected.contains(&terminal) {
            return;
        }
        if polarity == TriggerPolarity::Rising {
            *self.rising_edges.entry(terminal).or_insert(0) += 1;
        }
        let now = Instant::now();
        for output in self.outputs.values_mut() {
            if let Some((source, edge, _)) = output.trigger {
                if source == terminal && edge == polarity {
                    output.on_edge(now);
                }
            }
        }
    }

    fn check_lines(&self, lines: &[PhysicalLine]) -> TransportResult<()> {
        match lines.iter().find(|l| self.disconnected.contains(*l)) {
            Some(line) => Err(TransportError::new(
                SIM_ERR_DISCONNECTED,
                format!("device not responding on {line}"),
            )),
            None => Ok(()),
        }
    }
}

/// In-memory output card with the limits of a PCIe-6738.
#[derive(Clone)]
pub struct SimulatedDaq {
    device: String,
    limits: DeviceLimits,
    board: Arc<Mutex<Board>>,
}

impl SimulatedDaq {
    pub fn new(device: &str) -> Self {
        Self::with_limits(device, DeviceLimits::pcie_6738())
    }

    pub fn with_limits(device: &str, limits: DeviceLimits) -> Self {
        SimulatedDaq {
            device: device.to_string(),
            limits,
            board: Arc::new(Mutex::new(Board::default())),
        }
    }

    /// Delivers a trigger edge on `terminal` to every listening output task.
    pub fn fire_edge(&self, terminal: &PhysicalLine, polarity: TriggerPolarity) {
        self.board.lock().edge(*terminal, polarity);
    }

    /// Every later driver call of a task touching `line` fails.
    pub fn disconnect_line(&self, line: &PhysicalLine) {
        self.board.lock().disconnected.insert(*line);
    }

    pub fn reconnect_line(&self, line: &PhysicalLine) {
        self.board.lock().disconnected.shift_remove(line);
    }

    /// Last buffer written by task `task_name`.
    pub fn written(&self, task_name: &str) -> Option<Array2<f64>> {
        self.board
            .lock()
            .written
            .get(task_name)
            .map(|(buffer, _)| buffer.clone())
    }

    pub fn write_count(&self, task_name: &str) -> usize {
        self.board.lock().written.get(task_name).map_or(0, |(_, count)| *count)
    }

    /// Rising edges emitted on `terminal` by pulse tasks or [`SimulatedDaq::fire_edge`].
    pub fn pulses_emitted(&self, terminal: &PhysicalLine) -> u64 {
        self.board.lock().rising_edges.get(terminal).copied().unwrap_or(0)
    }

    /// Cycles completed by an open output task since its last start.
    pub fn cycles_completed(&self, task_name: &str) -> Option<u64> {
        let now = Instant::now();
        let mut board = self.board.lock();
        board
            .outputs
            .values_mut()
            .find(|o| o.name == task_name)
            .map(|o| {
                o.settle(now);
                o.completed
            })
    }

    /// Names of output tasks not yet closed.
    pub fn open_outputs(&self) -> Vec<String> {
        self.board.lock().outputs.values().map(|o| o.name.clone()).collect()
    }
}

impl DaqBackend for SimulatedDaq {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn open_output(
        &self,
        task_name: &str,
        lines: &[(PhysicalLine, VoltageRange)],
        kind: LineKind,
    ) -> TransportResult<Box<dyn OutputTransport>> {
        let physical: Vec<PhysicalLine> = lines.iter().map(|(line, _)| *line).collect();
        if let Some(line) = physical
            .iter()
            .find(|l| l.kind() != kind || kind == LineKind::Counter || !self.limits.has_line(l))
        {
            return Err(TransportError::new(
                SIM_ERR_NO_SUCH_LINE,
                format!("{}/{} cannot be used for {} output", self.device, line, kind),
            ));
        }
        let mut board = self.board.lock();
        board.check_lines(&physical)?;
        let key = board.next_key;
        board.next_key += 1;
        board.outputs.insert(
            key,
            SimOutput {
                name: task_name.to_string(),
                lines: physical,
                sampling_frequency_hz: 0.,
                samples_per_cycle: 0,
                trigger: None,
                buffer: None,
                running: false,
                completed: 0,
                playing_since: None,
            },
        );
        debug!("Simulated {} opened output task '{}'", self.device, task_name);
        Ok(Box::new(SimOutputHandle {
            board: self.board.clone(),
            key,
        }))
    }

    fn open_pulse(&self, task_name: &str, counter: PhysicalLine) -> TransportResult<Box<dyn PulseTransport>> {
        if counter.kind() != LineKind::Counter || !self.limits.has_line(&counter) {
            return Err(TransportError::new(
                SIM_ERR_NO_SUCH_LINE,
                format!("{}/{} is not a counter", self.device, counter),
            ));
        }
        self.board.lock().check_lines(&[counter])?;
        debug!("Simulated {} opened pulse task '{}'", self.device, task_name);
        Ok(Box::new(SimPulseHandle {
            board: self.board.clone(),
            counter,
            terminal: None,
            period: Duration::ZERO,
            duty_cycle: 0.5,
            worker: None,
            closed: false,
        }))
    }
}

struct SimOutputHandle {
    board: Arc<Mutex<Board>>,
    key: u64,
}

impl SimOutputHandle {
    fn with<T>(
        &self,
        f: impl FnOnce(&mut SimOutput, &mut IndexMap<String, (Array2<f64>, usize)>) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut guard = self.board.lock();
        let board = &mut *guard;
        let output = board
            .outputs
            .get_mut(&self.key)
            .ok_or_else(|| TransportError::new(SIM_ERR_INVALID_TASK, "task has been closed"))?;
        if let Some(line) = output.lines.iter().find(|l| board.disconnected.contains(*l)) {
            return Err(TransportError::new(
                SIM_ERR_DISCONNECTED,
                format!("device not responding on {line}"),
            ));
        }
        f(output, &mut board.written)
    }
}

impl OutputTransport for SimOutputHandle {
    fn configure_clock(&mut self, sampling_frequency_hz: f64, samples_per_cycle: usize) -> TransportResult<()> {
        self.with(|o, _| {
            if !(sampling_frequency_hz > 0.) || samples_per_cycle == 0 {
                return Err(TransportError::new(
                    SIM_ERR_NOT_CONFIGURED,
                    format!("invalid sample clock: {samples_per_cycle} samples at {sampling_frequency_hz} Hz"),
                ));
            }
            o.sampling_frequency_hz = sampling_frequency_hz;
            o.samples_per_cycle = samples_per_cycle;
            Ok(())
        })
    }

    fn write(&mut self, buffer: &Array2<f64>) -> TransportResult<usize> {
        self.with(|o, written| {
            if o.samples_per_cycle == 0 {
                return Err(TransportError::new(SIM_ERR_NOT_CONFIGURED, "sample clock not configured"));
            }
            if buffer.nrows() != o.lines.len() || buffer.ncols() != o.samples_per_cycle {
                return Err(TransportError::new(
                    SIM_ERR_BAD_BUFFER,
                    format!(
                        "buffer is {}x{}, task expects {}x{}",
                        buffer.nrows(),
                        buffer.ncols(),
                        o.lines.len(),
                        o.samples_per_cycle
                    ),
                ));
            }
            o.buffer = Some(buffer.clone());
            let count = written.get(&o.name).map_or(0, |(_, count)| *count);
            written.insert(o.name.clone(), (buffer.clone(), count + 1));
            Ok(buffer.ncols())
        })
    }

    fn arm_trigger(
        &mut self,
        source: &PhysicalLine,
        polarity: TriggerPolarity,
        retriggerable: bool,
    ) -> TransportResult<()> {
        self.with(|o, _| {
            o.trigger = Some((*source, polarity, retriggerable));
            Ok(())
        })
    }

    fn start(&mut self) -> TransportResult<()> {
        self.with(|o, _| {
            if o.buffer.is_none() {
                return Err(TransportError::new(SIM_ERR_NOT_CONFIGURED, "no data written"));
            }
            o.running = true;
            o.completed = 0;
            // Without a trigger the cycle starts right away
            o.playing_since = if o.trigger.is_none() {
                Some(Instant::now())
            } else {
                None
            };
            Ok(())
        })
    }

    fn stop(&mut self) -> TransportResult<()> {
        self.with(|o, _| {
            o.running = false;
            o.playing_since = None;
            Ok(())
        })
    }

    fn is_done(&mut self) -> TransportResult<bool> {
        self.with(|o, _| {
            o.settle(Instant::now());
            Ok(!o.running || (!o.retriggerable() && o.completed >= 1))
        })
    }

    fn samples_generated(&mut self) -> TransportResult<u64> {
        self.with(|o, _| Ok(o.generated(Instant::now())))
    }

    fn close(&mut self) -> TransportResult<()> {
        let res = self.with(|_, _| Ok(()));
        // Removed even when the line is gone, so the board forgets the task
        self.board.lock().outputs.shift_remove(&self.key);
        res
    }
}

impl Drop for SimOutputHandle {
    fn drop(&mut self) {
        self.board.lock().outputs.shift_remove(&self.key);
    }
}

struct PulseWorker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct SimPulseHandle {
    board: Arc<Mutex<Board>>,
    counter: PhysicalLine,
    terminal: Option<PhysicalLine>,
    period: Duration,
    duty_cycle: f64,
    worker: Option<PulseWorker>,
    closed: bool,
}

impl SimPulseHandle {
    fn check(&self) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::new(SIM_ERR_INVALID_TASK, "task has been closed"));
        }
        let mut lines = vec![self.counter];
        lines.extend(self.terminal);
        self.board.lock().check_lines(&lines)
    }

    fn halt(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
        }
    }
}

impl PulseTransport for SimPulseHandle {
    fn configure_pulse(&mut self, frequency_hz: f64, duty_cycle: f64, terminal: &PhysicalLine) -> TransportResult<()> {
        self.check()?;
        let invalid = || {
            TransportError::new(
                SIM_ERR_NOT_CONFIGURED,
                format!("invalid pulse: {frequency_hz} Hz, duty {duty_cycle}"),
            )
        };
        if !(frequency_hz > 0.) || !(duty_cycle > 0. && duty_cycle < 1.) {
            return Err(invalid());
        }
        let period = Duration::try_from_secs_f64(1. / frequency_hz).map_err(|_| invalid())?;
        if period.is_zero() {
            return Err(invalid());
        }
        self.period = period;
        self.duty_cycle = duty_cycle;
        self.terminal = Some(*terminal);
        self.check()
    }

    fn start(&mut self) -> TransportResult<()> {
        self.check()?;
        let terminal = self
            .terminal
            .ok_or_else(|| TransportError::new(SIM_ERR_NOT_CONFIGURED, "pulse not configured"))?;
        self.halt();

        let period = self.period;
        let high = period.mul_f64(self.duty_cycle);
        let board = self.board.clone();
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            let ticker = tick(period);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        board.lock().edge(terminal, TriggerPolarity::Rising);
                        let stopped = !matches!(stop_rx.recv_timeout(high), Err(RecvTimeoutError::Timeout));
                        board.lock().edge(terminal, TriggerPolarity::Falling);
                        if stopped {
                            break;
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        });
        self.worker = Some(PulseWorker { stop, handle });
        Ok(())
    }

    fn stop(&mut self) -> TransportResult<()> {
        let res = self.check();
        self.halt();
        res
    }

    fn close(&mut self) -> TransportResult<()> {
        let res = self.check();
        self.halt();
        self.closed = true;
        res
    }
}

impl Drop for SimPulseHandle {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn open(daq: &SimulatedDaq, retriggerable: bool) -> Box<dyn OutputTransport> {
        let range = VoltageRange::new(0., 5.).unwrap();
        let mut out = daq
            .open_output("ao_task", &[(PhysicalLine::AnalogOut(0), range)], LineKind::Analog)
            .unwrap();
        out.configure_clock(10000., 20).unwrap();
        out.arm_trigger(&"PFI0".parse().unwrap(), TriggerPolarity::Rising, retriggerable)
            .unwrap();
        out.write(&Array2::zeros((1, 20))).unwrap();
        out
    }

    #[test]
    fn cycle_per_edge() {
        let daq = SimulatedDaq::new("Dev1");
        let mut out = open(&daq, true);
        let pfi0: PhysicalLine = "PFI0".parse().unwrap();
        out.start().unwrap();
        assert_eq!(out.samples_generated().unwrap(), 0);

        daq.fire_edge(&pfi0, TriggerPolarity::Falling);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(out.samples_generated().unwrap(), 0);

        daq.fire_edge(&pfi0, TriggerPolarity::Rising);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(out.samples_generated().unwrap(), 20);
        daq.fire_edge(&pfi0, TriggerPolarity::Rising);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(daq.cycles_completed("ao_task"), Some(2));
    }

    #[test]
    fn single_shot_without_retrigger() {
        let daq = SimulatedDaq::new("Dev1");
        let mut out = open(&daq, false);
        let pfi0: PhysicalLine = "PFI0".parse().unwrap();
        out.start().unwrap();
        assert!(!out.is_done().unwrap());
        daq.fire_edge(&pfi0, TriggerPolarity::Rising);
        thread::sleep(Duration::from_millis(5));
        assert!(out.is_done().unwrap());
        daq.fire_edge(&pfi0, TriggerPolarity::Rising);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(out.samples_generated().unwrap(), 20);
    }

    #[test]
    fn wrong_shape_rejected() {
        let daq = SimulatedDaq::new("Dev1");
        let mut out = open(&daq, true);
        let err = out.write(&Array2::zeros((2, 20))).unwrap_err();
        assert_eq!(err.code, SIM_ERR_BAD_BUFFER);
    }

    #[test]
    fn disconnected_line_fails_every_call() {
        let daq = SimulatedDaq::new("Dev1");
        let mut out = open(&daq, true);
        daq.disconnect_line(&PhysicalLine::AnalogOut(0));
        assert_eq!(out.start().unwrap_err().code, SIM_ERR_DISCONNECTED);
        assert!(out.close().is_err());
        assert!(daq.open_outputs().is_empty());
    }

    #[test]
    fn keeps_only_the_last_buffer() {
        let daq = SimulatedDaq::new("Dev1");
        let mut out = open(&daq, true);
        out.write(&Array2::from_elem((1, 20), 1.)).unwrap();
        out.write(&Array2::from_elem((1, 20), 2.)).unwrap();
        assert_eq!(daq.write_count("ao_task"), 3);
        assert_eq!(daq.written("ao_task").unwrap(), Array2::from_elem((1, 20), 2.));
        assert_eq!(daq.board.lock().written.len(), 1);
    }

    #[test]
    fn unrepresentable_pulse_period_rejected() {
        let daq = SimulatedDaq::new("Dev1");
        let pfi0: PhysicalLine = "PFI0".parse().unwrap();
        let mut pulse = daq.open_pulse("co_task", PhysicalLine::Counter(0)).unwrap();
        let err = pulse.configure_pulse(1e-30, 0.5, &pfi0).unwrap_err();
        assert_eq!(err.code, SIM_ERR_NOT_CONFIGURED);
        assert_eq!(pulse.start().unwrap_err().code, SIM_ERR_NOT_CONFIGURED);
        assert_eq!(daq.pulses_emitted(&pfi0), 0);
    }

    #[test]
    fn pulse_train_emits_edges() {
        let daq = SimulatedDaq::new("Dev1");
        let pfi0: PhysicalLine = "PFI0".parse().unwrap();
        let mut pulse = daq.open_pulse("co_task", PhysicalLine::Counter(0)).unwrap();
        pulse.configure_pulse(200., 0.5, &pfi0).unwrap();
        pulse.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        pulse.stop().unwrap();
        let emitted = daq.pulses_emitted(&pfi0);
        assert!(emitted >= 3, "only {emitted} pulses");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(daq.pulses_emitted(&pfi0), emitted);
        pulse.close().unwrap();
        assert!(pulse.start().is_err());
    }
}
