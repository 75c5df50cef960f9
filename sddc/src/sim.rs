//! An in-process stand-in for SDDC hardware.
//!
//! [`SimulatedDevice`] answers every [`Transport`] call without touching USB.
//! It streams a clean real-valued test tone, records the control traffic it
//! receives, and can be told to fail reads or drop off the bus. Tests, the
//! example programs, and `sddc --simulate` all run on top of it.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::Error;
use crate::consts::{self, ArgId, Fx3Command, gpio};
use crate::radio::RadioModel;
use crate::transport::{HardwareInfo, Transport};

/// One control operation seen by a [`SimulatedDevice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRecord {
    /// A vendor command and its payload.
    Command(Fx3Command, Vec<u8>),
    /// An argument write.
    Argument(ArgId, u16),
}

struct SimState {
    adc_freq: u32,
    gpios: u32,
    phase: f64,
    streaming: bool,
    transfer_samples: usize,
    stream_start: Instant,
    delivered_bytes: u64,
    log: Vec<ControlRecord>,
    debug_trace: Vec<u8>,
}

/// A simulated SDDC receiver.
pub struct SimulatedDevice {
    info: HardwareInfo,
    tone_hz: f64,
    amplitude: f64,
    pacing: Option<u64>,
    fail_reads: AtomicU32,
    disconnected: AtomicBool,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    /// Create a simulated radio of the given model with current firmware,
    /// producing a 10 MHz tone at half scale from a 64 MHz ADC clock.
    pub fn new(model: RadioModel) -> Self {
        Self {
            info: HardwareInfo {
                model: model as u8,
                fw_major: consts::FIRMWARE_VER_MAJOR,
                fw_minor: consts::FIRMWARE_VER_MINOR,
                reserved: 0,
            },
            tone_hz: 10_000_000.0,
            amplitude: 16384.0,
            pacing: None,
            fail_reads: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
            state: Mutex::new(SimState {
                adc_freq: consts::DEFAULT_ADC_FREQ,
                gpios: 0,
                phase: 0.0,
                streaming: false,
                transfer_samples: 0,
                stream_start: Instant::now(),
                delivered_bytes: 0,
                log: Vec::new(),
                debug_trace: Vec::new(),
            }),
        }
    }

    /// Report a different firmware version.
    pub fn with_firmware(mut self, major: u8, minor: u8) -> Self {
        self.info.fw_major = major;
        self.info.fw_minor = minor;
        self
    }

    /// Generate a tone at `freq_hz` with peak `amplitude` in ADC counts.
    pub fn with_tone(mut self, freq_hz: f64, amplitude: f64) -> Self {
        self.tone_hz = freq_hz;
        self.amplitude = amplitude.clamp(0.0, i16::MAX as f64);
        self
    }

    /// Deliver samples no faster than `bytes_per_sec`. Unpaced devices return
    /// data as fast as they are asked for it.
    pub fn with_pacing(mut self, bytes_per_sec: u64) -> Self {
        self.pacing = Some(bytes_per_sec.max(1));
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` reads fail with a timeout.
    pub fn fail_next_reads(&self, count: u32) {
        self.fail_reads.store(count, Ordering::Release);
    }

    /// Pretend the device was unplugged. Every later call fails.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    /// Everything sent to the device so far, oldest first.
    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.lock().log.clone()
    }

    /// Forget the recorded control traffic.
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// The GPIO word most recently written.
    pub fn gpios(&self) -> u32 {
        self.lock().gpios
    }

    /// The ADC clock most recently programmed.
    pub fn adc_freq(&self) -> u32 {
        self.lock().adc_freq
    }

    /// Whether streaming was started and not yet stopped.
    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    /// Queue text for [`Transport::read_debug_trace`] to return.
    pub fn push_debug_trace(&self, text: &str) {
        self.lock().debug_trace.extend_from_slice(text.as_bytes());
    }

    fn check_connected(&self) -> Result<(), Error> {
        if self.disconnected.load(Ordering::Acquire) {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }
}

fn le_u32(data: &[u8]) -> Option<u32> {
    data.get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

impl Transport for SimulatedDevice {
    fn control(&self, cmd: Fx3Command, data: &[u8]) -> Result<(), Error> {
        self.check_connected()?;
        let mut state = self.lock();
        match cmd {
            Fx3Command::GpioFx3 => {
                state.gpios = le_u32(data).ok_or(Error::InvalidParameter("GPIO word"))?;
            }
            Fx3Command::StartAdc => {
                state.adc_freq = le_u32(data).ok_or(Error::InvalidParameter("ADC clock"))?;
            }
            Fx3Command::StartFx3 => {
                state.stream_start = Instant::now();
                state.delivered_bytes = 0;
            }
            _ => (),
        }
        debug!("sim control {:?} {:02x?}", cmd, data);
        state.log.push(ControlRecord::Command(cmd, data.to_vec()));
        Ok(())
    }

    fn set_argument(&self, arg: ArgId, value: u16) -> Result<(), Error> {
        self.check_connected()?;
        self.lock().log.push(ControlRecord::Argument(arg, value));
        Ok(())
    }

    fn hardware_info(&self) -> Result<HardwareInfo, Error> {
        self.check_connected()?;
        Ok(self.info)
    }

    fn start_stream(&self, transfer_samples: usize, depth: usize) -> Result<(), Error> {
        self.check_connected()?;
        if transfer_samples == 0 || depth == 0 {
            return Err(Error::InvalidParameter("stream geometry"));
        }
        let mut state = self.lock();
        state.streaming = true;
        state.transfer_samples = transfer_samples;
        state.stream_start = Instant::now();
        state.delivered_bytes = 0;
        Ok(())
    }

    fn read_block(&self, out: &mut [i16]) -> Result<(), Error> {
        self.check_connected()?;
        if self
            .fail_reads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Timeout);
        }

        let mut state = self.lock();
        if !state.streaming {
            return Err(Error::InvalidParameter("stream not started"));
        }
        if out.len() != state.transfer_samples {
            return Err(Error::InvalidParameter("read length"));
        }
        let step = self.tone_hz / state.adc_freq as f64;
        let scramble = state.gpios & gpio::RANDO != 0;
        let mut phase = state.phase;
        for s in out.iter_mut() {
            let mut v = (self.amplitude * (TAU * phase).cos()).round() as i16;
            if scramble && (v & 1) != 0 {
                v ^= !1;
            }
            *s = v;
            phase += step;
            if phase >= 1.0 {
                phase -= phase.floor();
            }
        }
        state.phase = phase;
        state.delivered_bytes += (out.len() * 2) as u64;

        if let Some(rate) = self.pacing {
            let due = state.stream_start
                + Duration::from_secs_f64(state.delivered_bytes as f64 / rate as f64);
            drop(state);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        Ok(())
    }

    fn stop_stream(&self) -> Result<(), Error> {
        self.check_connected()?;
        self.lock().streaming = false;
        Ok(())
    }

    fn read_debug_trace(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_connected()?;
        let mut state = self.lock();
        let n = buf.len().min(state.debug_trace.len());
        buf[..n].copy_from_slice(&state.debug_trace[..n]);
        state.debug_trace.drain(..n);
        Ok(n)
    }
}
