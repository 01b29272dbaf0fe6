//! Minimal Rust wrapper around the parts of the NI-DAQmx C library this crate drives, plus the
//! [`NiDaq`] backend built on it. Compiled only with the `nidaqmx` feature.
//!
//! ## Overview
//!
//! [`NiTask`] owns one DAQmx task handle and maps its methods onto DAQmx C functions. Every call
//! goes through [`daqmx_call`], which turns a negative status code into a [`TransportError`]
//! carrying the code and the driver's extended error text, and logs it.
//!
//! [`NiDaq`] implements [`DaqBackend`]:
//! - waveform tasks are AO voltage channels (one per port, each with the port's device range)
//!   or DO lines, finite sample clock, retriggerable digital edge start trigger on a PFI terminal;
//! - frame clock tasks are counter pulse channels (frequency, duty cycle, idle low) routed to
//!   the clock's PFI terminal with continuous implicit timing.
//!
//! Physical names are built as `/{device}/{line}` and terminals as `/{device}/PFIn`.
//!
//! ## Safety
//!
//! All driver calls are `unsafe` FFI. `NiTask` clears its handle on drop. DAQmx task handles may
//! be used from any thread, so `NiTask` is `Send`.
//!
//! ## Further Reading
//!
//! [NI-DAQmx C Reference](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html).

use libc;
use ndarray::Array2;
use std::ffi::CString;
use tracing::{debug, error, warn};

use spimcompiler_backend::{DeviceLimits, LineKind, PhysicalLine, TriggerPolarity, VoltageRange};

use crate::error::{TransportError, TransportResult};
use crate::transport::{DaqBackend, OutputTransport, PulseTransport};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_FALLING: CInt32 = 10171;
pub const DAQMX_VAL_VOLTS: CInt32 = 10348;
pub const DAQMX_VAL_HZ: CInt32 = 10373;
pub const DAQMX_VAL_LOW: CInt32 = 10214;
pub const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
pub const DAQMX_VAL_CONTSAMPS: CInt32 = 10123;
pub const DAQMX_VAL_GROUPBYCHANNEL: CBool32 = 0;
pub const DAQMX_VAL_CHANPERLINE: CInt32 = 0;

// Write timeout in seconds; the whole cycle fits in the buffer
const WRITE_TIMEOUT_S: CFloat64 = 10.0;
// Status reported for names that cannot be passed to C
const INVALID_NAME_CODE: i32 = -200552;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(name: CConstStr) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;
    fn DAQmxIsTaskDone(handle: TaskHandle, isTaskDone: *mut CBool32) -> CInt32;

    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;
    fn DAQmxCfgImplicitTiming(handle: TaskHandle, sampleMode: CInt32, sampsPerChan: CUint64) -> CInt32;

    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateDOChan(
        handle: TaskHandle,
        lines: CConstStr,
        name: CConstStr,
        lineGrouping: CInt32,
    ) -> CInt32;
    fn DAQmxCreateCOPulseChanFreq(
        handle: TaskHandle,
        counter: CConstStr,
        nameToAssignToChannel: CConstStr,
        units: CInt32,
        idleState: CInt32,
        initialDelay: CFloat64,
        freq: CFloat64,
        dutyCycle: CFloat64,
    ) -> CInt32;
    fn DAQmxSetCOPulseTerm(handle: TaskHandle, channel: CConstStr, data: CConstStr) -> CInt32;

    fn DAQmxWriteDigitalLines(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const u8,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;

    fn DAQmxCfgDigEdgeStartTrig(
        handle: TaskHandle,
        triggerSource: CConstStr,
        triggerEdge: CInt32,
    ) -> CInt32;
    fn DAQmxSetStartTrigRetriggerable(handle: TaskHandle, data: CBool32) -> CInt32;
    fn DAQmxGetWriteTotalSampPerChanGenerated(handle: TaskHandle, data: *mut CUint64) -> CInt32;
}

/// Calls a DAQmx C-function and converts a negative status into a [`TransportError`].
///
/// The extended error text is fetched with `DAQmxGetExtendedErrorInfo` and logged. Positive
/// status codes are driver warnings and are logged without failing.
pub fn daqmx_call<F: FnOnce() -> CInt32>(func: F) -> TransportResult<()> {
    let code = func();
    if code == 0 {
        return Ok(());
    }
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    let message = unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    if code < 0 {
        error!("DAQmx error {}: {}", code, message);
        Err(TransportError::new(code, message))
    } else {
        warn!("DAQmx warning {}: {}", code, message);
        Ok(())
    }
}

fn cstring(s: &str) -> TransportResult<CString> {
    CString::new(s).map_err(|_| TransportError::new(INVALID_NAME_CODE, format!("'{s}' contains a NUL byte")))
}

/// Resets a device to its power-up state, aborting every task on it.
pub fn reset_ni_device(name: &str) -> TransportResult<()> {
    let name_cstr = cstring(name)?;
    daqmx_call(|| unsafe { DAQmxResetDevice(name_cstr.as_ptr()) })
}

/// One NI-DAQmx task handle.
pub struct NiTask {
    handle: TaskHandle,
    name: String,
}

// DAQmx handles are thread-safe
unsafe impl Send for NiTask {}

impl NiTask {
    pub fn new(name: &str) -> TransportResult<Self> {
        let mut handle: TaskHandle = std::ptr::null_mut();
        let name_cstr = cstring(name)?;
        daqmx_call(|| unsafe { DAQmxCreateTask(name_cstr.as_ptr(), &mut handle) })?;
        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    pub fn clear(&self) -> TransportResult<()> {
        daqmx_call(|| unsafe { DAQmxClearTask(self.handle) })
    }
    // Clears now and reports the status instead of leaving it to drop
    pub fn close(mut self) -> TransportResult<()> {
        let res = self.clear();
        self.handle = std::ptr::null_mut();
        res
    }
    pub fn start(&self) -> TransportResult<()> {
        daqmx_call(|| unsafe { DAQmxStartTask(self.handle) })
    }
    pub fn stop(&self) -> TransportResult<()> {
        daqmx_call(|| unsafe { DAQmxStopTask(self.handle) })
    }
    pub fn is_done(&self) -> TransportResult<bool> {
        let mut done: CBool32 = 0;
        daqmx_call(|| unsafe { DAQmxIsTaskDone(self.handle, &mut done as *mut CBool32) })?;
        Ok(done != 0)
    }

    pub fn cfg_sample_clk(&self, clk_src: &str, samp_rate: f64, seq_len: u64) -> TransportResult<()> {
        let src_cstring = cstring(clk_src)?;
        daqmx_call(|| unsafe {
            DAQmxCfgSampClkTiming(
                self.handle,
                src_cstring.as_ptr(),
                samp_rate as CFloat64,
                DAQMX_VAL_RISING,
                DAQMX_VAL_FINITESAMPS,
                seq_len as CUint64,
            )
        })
    }

    pub fn cfg_implicit_timing_continuous(&self, buf_len: u64) -> TransportResult<()> {
        daqmx_call(|| unsafe {
            DAQmxCfgImplicitTiming(self.handle, DAQMX_VAL_CONTSAMPS, buf_len as CUint64)
        })
    }

    pub fn create_ao_chan(&self, name: &str, range: &VoltageRange) -> TransportResult<()> {
        let name_cstr = cstring(name)?;
        let assigned_name_cstr = cstring("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateAOVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                range.min_volts,
                range.max_volts,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })
    }

    pub fn create_do_chan(&self, name: &str) -> TransportResult<()> {
        let name_cstr = cstring(name)?;
        let assigned_name_cstr = cstring("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateDOChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_CHANPERLINE,
            )
        })
    }

    pub fn create_co_pulse_chan_freq(&self, counter: &str, freq: f64, duty_cycle: f64) -> TransportResult<()> {
        let counter_cstr = cstring(counter)?;
        let assigned_name_cstr = cstring("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateCOPulseChanFreq(
                self.handle,
                counter_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_HZ,
                DAQMX_VAL_LOW,
                0.,
                freq as CFloat64,
                duty_cycle as CFloat64,
            )
        })
    }

    pub fn set_co_pulse_term(&self, counter: &str, terminal: &str) -> TransportResult<()> {
        let counter_cstr = cstring(counter)?;
        let terminal_cstr = cstring(terminal)?;
        daqmx_call(|| unsafe {
            DAQmxSetCOPulseTerm(self.handle, counter_cstr.as_ptr(), terminal_cstr.as_ptr())
        })
    }

    pub fn write_digital_lines(&self, signal_arr: &Array2<u8>) -> TransportResult<usize> {
        let signal_arr = signal_arr.as_standard_layout();
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteDigitalLines(
                self.handle,
                signal_arr.shape()[1] as CInt32,
                false as CBool32,
                WRITE_TIMEOUT_S,
                DAQMX_VAL_GROUPBYCHANNEL,
                signal_arr.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }

    pub fn write_analog(&self, signal_arr: &Array2<f64>) -> TransportResult<usize> {
        let signal_arr = signal_arr.as_standard_layout();
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                signal_arr.shape()[1] as CInt32,
                false as CBool32,
                WRITE_TIMEOUT_S,
                DAQMX_VAL_GROUPBYCHANNEL,
                signal_arr.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }

    pub fn cfg_dig_edge_start_trigger(&self, trigger_source: &str, polarity: TriggerPolarity) -> TransportResult<()> {
        let trigger_source_cstr = cstring(trigger_source)?;
        let edge = match polarity {
            TriggerPolarity::Rising => DAQMX_VAL_RISING,
            TriggerPolarity::Falling => DAQMX_VAL_FALLING,
        };
        daqmx_call(|| unsafe {
            DAQmxCfgDigEdgeStartTrig(self.handle, trigger_source_cstr.as_ptr(), edge)
        })
    }

    pub fn set_start_trig_retriggerable(&self, retriggerable: bool) -> TransportResult<()> {
        daqmx_call(|| unsafe { DAQmxSetStartTrigRetriggerable(self.handle, retriggerable as CBool32) })
    }

    pub fn get_write_total_samp_per_chan_generated(&self) -> TransportResult<u64> {
        let mut data: CUint64 = 0;
        daqmx_call(|| unsafe {
            DAQmxGetWriteTotalSampPerChanGenerated(self.handle, &mut data as *mut CUint64)
        })?;
        Ok(data as u64)
    }
}

impl Drop for NiTask {
    fn drop(&mut self) {
        if self.handle.is_null() {
            return;
        }
        if let Err(e) = self.clear() {
            warn!("Clearing DAQmx task '{}' on drop: {}", self.name, e);
        }
    }
}

fn closed_task() -> TransportError {
    TransportError::new(-200088, "task has been cleared")
}

/// An NI output card driven through NI-DAQmx.
pub struct NiDaq {
    device: String,
    limits: DeviceLimits,
}

impl NiDaq {
    pub fn new(device: &str, limits: DeviceLimits) -> Self {
        NiDaq {
            device: device.to_string(),
            limits,
        }
    }

    pub fn reset(&self) -> TransportResult<()> {
        reset_ni_device(&self.device)
    }

    fn physical(&self, line: &PhysicalLine) -> String {
        format!("/{}/{}", self.device, line)
    }
}

impl DaqBackend for NiDaq {
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
        let task = NiTask::new(task_name)?;
        for (line, range) in lines {
            match kind {
                LineKind::Analog => task.create_ao_chan(&self.physical(line), range)?,
                LineKind::Digital => task.create_do_chan(&self.physical(line))?,
                LineKind::Counter => {
                    return Err(TransportError::new(
                        -200170,
                        format!("{} is not a waveform output", self.physical(line)),
                    ))
                }
            }
        }
        debug!("DAQmx task '{}' created with {} {} lines", task_name, lines.len(), kind);
        Ok(Box::new(NiOutput {
            task: Some(task),
            device: self.device.clone(),
            kind,
            ranges: lines.iter().map(|(_, range)| *range).collect(),
        }))
    }

    fn open_pulse(&self, task_name: &str, counter: PhysicalLine) -> TransportResult<Box<dyn PulseTransport>> {
        let task = NiTask::new(task_name)?;
        Ok(Box::new(NiPulse {
            task: Some(task),
            counter: self.physical(&counter),
            device: self.device.clone(),
            configured: false,
        }))
    }
}

struct NiOutput {
    task: Option<NiTask>,
    device: String,
    kind: LineKind,
    ranges: Vec<VoltageRange>,
}

impl NiOutput {
    fn task(&self) -> TransportResult<&NiTask> {
        self.task.as_ref().ok_or_else(closed_task)
    }
}

impl OutputTransport for NiOutput {
    fn configure_clock(&mut self, sampling_frequency_hz: f64, samples_per_cycle: usize) -> TransportResult<()> {
        self.task()?
            .cfg_sample_clk("", sampling_frequency_hz, samples_per_cycle as u64)
    }

    fn write(&mut self, buffer: &Array2<f64>) -> TransportResult<usize> {
        match self.kind {
            LineKind::Digital => {
                // Logic high above the midpoint of each port's range
                let mut levels = Array2::<u8>::zeros(buffer.raw_dim());
                for ((mut row, src), range) in levels.rows_mut().into_iter().zip(buffer.rows()).zip(&self.ranges) {
                    let threshold = range.midpoint();
                    row.zip_mut_with(&src, |level, &v| *level = (v > threshold) as u8);
                }
                self.task()?.write_digital_lines(&levels)
            }
            _ => self.task()?.write_analog(buffer),
        }
    }

    fn arm_trigger(
        &mut self,
        source: &PhysicalLine,
        polarity: TriggerPolarity,
        retriggerable: bool,
    ) -> TransportResult<()> {
        let terminal = format!("/{}/{}", self.device, source.terminal());
        let task = self.task()?;
        task.cfg_dig_edge_start_trigger(&terminal, polarity)?;
        task.set_start_trig_retriggerable(retriggerable)
    }

    fn start(&mut self) -> TransportResult<()> {
        self.task()?.start()
    }

    fn stop(&mut self) -> TransportResult<()> {
        self.task()?.stop()
    }

    fn is_done(&mut self) -> TransportResult<bool> {
        self.task()?.is_done()
    }

    fn samples_generated(&mut self) -> TransportResult<u64> {
        self.task()?.get_write_total_samp_per_chan_generated()
    }

    fn close(&mut self) -> TransportResult<()> {
        self.task.take().ok_or_else(closed_task)?.close()
    }
}

struct NiPulse {
    task: Option<NiTask>,
    counter: String,
    device: String,
    configured: bool,
}

impl NiPulse {
    fn task(&self) -> TransportResult<&NiTask> {
        self.task.as_ref().ok_or_else(closed_task)
    }
}

impl PulseTransport for NiPulse {
    fn configure_pulse(&mut self, frequency_hz: f64, duty_cycle: f64, terminal: &PhysicalLine) -> TransportResult<()> {
        let task = self.task()?;
        if !self.configured {
            task.create_co_pulse_chan_freq(&self.counter, frequency_hz, duty_cycle)?;
            task.cfg_implicit_timing_continuous(1000)?;
        }
        task.set_co_pulse_term(&self.counter, &format!("/{}/{}", self.device, terminal.terminal()))?;
        self.configured = true;
        Ok(())
    }

    fn start(&mut self) -> TransportResult<()> {
        self.task()?.start()
    }

    fn stop(&mut self) -> TransportResult<()> {
        self.task()?.stop()
    }

    fn close(&mut self) -> TransportResult<()> {
        self.task.take().ok_or_else(closed_task)?.close()
    }
}
