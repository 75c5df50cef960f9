//! Real-to-complex downconversion of the raw ADC stream.
//!
//! The ADC delivers real samples at the full clock rate. The [`DdcEngine`]
//! turns them into complex baseband at `adc / 2^(idx+1)`:
//!
//! 1. Frames of [`FFT_LEN`] samples, overlapping by [`OVERLAP`], are
//!    transformed to the frequency domain.
//! 2. The bins around the wanted frequency are picked out, weighted by a
//!    lowpass response, and moved to DC. Keeping fewer bins than the frame
//!    has decimates the signal at the same time.
//! 3. A short inverse FFT brings the band back to the time domain, and the
//!    wrapped-around head of every frame is thrown away (overlap-save).
//! 4. A [`FineTuner`] removes what's left of the offset after the coarse bin
//!    shift.
//!
//! [`Downconverter`] runs an engine on its own thread between two
//! [`RingBuffer`]s.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use tracing::{debug, warn};

use crate::Error;
use crate::consts;
use crate::ring::RingBuffer;

mod decimate;
mod filter;
mod nco;

pub use decimate::SoftDecimator;
pub use nco::FineTuner;

/// Forward transform size, in ADC samples.
pub const FFT_LEN: usize = 8192;
/// Samples shared between consecutive frames.
pub const OVERLAP: usize = 2048;
/// New ADC samples consumed per frame.
pub const HOP: usize = FFT_LEN - OVERLAP;
/// Largest decimation index. Index `i` decimates by `2^(i+1)`.
pub const MAX_DECIMATION_IDX: u8 = 4;

/// Fraction of the output rate kept by the band filter.
const PASSBAND_FRACTION: f64 = 0.8;
const STOPBAND_DB: f64 = 80.0;

/// Which side of the selected frequency is kept upright.
///
/// The HF path samples the antenna directly and keeps the upper sideband. The
/// tuner path hands over a mirrored spectrum, which the lower sideband
/// undoes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sideband {
    #[default]
    #[allow(missing_docs)]
    Upper,
    #[allow(missing_docs)]
    Lower,
}

/// Downconverter settings that can only change while it is off.
#[derive(Clone, Debug, PartialEq)]
pub struct DdcConfig {
    /// Decimation index, 0 to [`MAX_DECIMATION_IDX`].
    pub decimation_idx: u8,
    /// Sideband to keep.
    pub sideband: Sideband,
    /// Output scale. A full-scale tone comes out with magnitude
    /// `32767 * gain`.
    pub gain: f32,
    /// ADC sampling clock.
    pub adc_freq: u32,
}

impl Default for DdcConfig {
    fn default() -> Self {
        Self {
            decimation_idx: 0,
            sideband: Sideband::Upper,
            gain: 1.0,
            adc_freq: consts::DEFAULT_ADC_FREQ,
        }
    }
}

impl DdcConfig {
    /// Total decimation factor.
    pub fn decimation(&self) -> usize {
        2 << self.decimation_idx
    }

    /// Output sample rate, in Hz.
    pub fn output_rate(&self) -> f64 {
        self.adc_freq as f64 / self.decimation() as f64
    }

    /// Check the settings.
    pub fn validate(&self) -> Result<(), Error> {
        if self.decimation_idx > MAX_DECIMATION_IDX {
            return Err(Error::ValueRange {
                range: 0..MAX_DECIMATION_IDX as u32 + 1,
                val: self.decimation_idx as u32,
            });
        }
        if self.adc_freq == 0 {
            return Err(Error::InvalidParameter("ADC clock must be non-zero"));
        }
        if !self.gain.is_finite() || self.gain <= 0.0 {
            return Err(Error::InvalidParameter("gain must be positive"));
        }
        Ok(())
    }
}

struct TuneShared {
    offset_hz: Mutex<f64>,
    derandomize: AtomicBool,
}

/// Live tuning controls of a downconverter, usable from any thread while it
/// runs.
///
/// The engine reads these once per block.
#[derive(Clone)]
pub struct TuningHandle {
    shared: Arc<TuneShared>,
}

impl Default for TuningHandle {
    fn default() -> Self {
        Self {
            shared: Arc::new(TuneShared {
                offset_hz: Mutex::new(0.0),
                derandomize: AtomicBool::new(false),
            }),
        }
    }
}

impl TuningHandle {
    /// Set the frequency, relative to the ADC's 0 Hz, that ends up at DC.
    pub fn set_offset(&self, hz: f64) {
        *self
            .shared
            .offset_hz
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = hz;
    }

    /// Current tuning offset.
    pub fn offset(&self) -> f64 {
        *self
            .shared
            .offset_hz
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Undo the ADC output randomizer on incoming samples.
    pub fn set_derandomize(&self, on: bool) {
        self.shared.derandomize.store(on, Ordering::Relaxed);
    }

    /// Whether incoming samples are de-randomized.
    pub fn derandomize(&self) -> bool {
        self.shared.derandomize.load(Ordering::Relaxed)
    }
}

/// Undo the ADC randomizer: odd samples had every bit above the LSB flipped.
fn derandomize(s: i16) -> i16 {
    if s & 1 != 0 { s ^ !1 } else { s }
}

/// The signal processing half of a [`Downconverter`], usable on its own.
pub struct DdcEngine {
    config: DdcConfig,
    tuning: TuningHandle,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    /// Filter response over the full frame.
    response: Vec<Complex32>,
    frame: Vec<Complex32>,
    band: Vec<Complex32>,
    scratch: Vec<Complex32>,
    pending: Vec<f32>,
    history: Vec<f32>,
    frame_start: usize,
    center_bin: usize,
    applied_offset: Option<f64>,
    nco: FineTuner,
}

impl DdcEngine {
    /// Plan the transforms and filter for `config`.
    pub fn new(config: DdcConfig, tuning: TuningHandle) -> Result<Self, Error> {
        config.validate()?;
        let decim = config.decimation();
        let bins = FFT_LEN / decim;

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(FFT_LEN);
        let inverse = planner.plan_fft_inverse(bins);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        let cutoff = PASSBAND_FRACTION / 2.0 / decim as f64;
        let mut response: Vec<Complex32> = filter::lowpass(OVERLAP + 1, cutoff, STOPBAND_DB)
            .into_iter()
            .map(|h| Complex32::new(h, 0.0))
            .collect();
        response.resize(FFT_LEN, Complex32::default());
        let mut fft_scratch = vec![Complex32::default(); forward.get_inplace_scratch_len()];
        forward.process_with_scratch(&mut response, &mut fft_scratch);

        let nco = FineTuner::new(config.output_rate());
        let mut engine = Self {
            config,
            tuning,
            forward,
            inverse,
            response,
            frame: vec![Complex32::default(); FFT_LEN],
            band: vec![Complex32::default(); bins],
            scratch: vec![Complex32::default(); scratch_len],
            pending: Vec::with_capacity(FFT_LEN * 2),
            history: vec![0.0; OVERLAP],
            frame_start: 0,
            center_bin: 0,
            applied_offset: None,
            nco,
        };
        engine.reset();
        Ok(engine)
    }

    /// The settings this engine was built for.
    pub fn config(&self) -> &DdcConfig {
        &self.config
    }

    /// Output sample rate, in Hz.
    pub fn output_rate(&self) -> f64 {
        self.config.output_rate()
    }

    /// The live tuning handle.
    pub fn tuning(&self) -> &TuningHandle {
        &self.tuning
    }

    /// Forget all stream state, as if no samples had been seen.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.history.fill(0.0);
        // The first frame starts OVERLAP samples before the stream does.
        self.frame_start = FFT_LEN - OVERLAP;
        self.applied_offset = None;
        self.nco.reset();
    }

    /// Bin picked for the current offset, and the mixer frequency handling
    /// the rest.
    pub fn coarse_and_fine(&self) -> (usize, f64) {
        (self.center_bin, self.nco.freq())
    }

    fn retune(&mut self, offset: f64) {
        let fs = self.config.adc_freq as f64;
        let target = match self.config.sideband {
            Sideband::Upper => offset,
            Sideband::Lower => -offset,
        };
        let bin_hz = fs / FFT_LEN as f64;
        let bin = (target / bin_hz).round() as i64;
        let residual = target - bin as f64 * bin_hz;
        self.center_bin = bin.rem_euclid(FFT_LEN as i64) as usize;
        self.nco.set_freq(-residual);
        self.applied_offset = Some(offset);
        debug!(
            "DDC offset {offset} Hz: bin {}, fine {} Hz",
            self.center_bin,
            self.nco.freq()
        );
    }

    /// Downconvert a block of raw ADC samples, appending whatever complete
    /// output is available to `out`. Samples not yet filling a frame are kept
    /// for the next call.
    pub fn process(&mut self, input: &[i16], out: &mut Vec<Complex32>) {
        let offset = self.tuning.offset();
        if self.applied_offset != Some(offset) {
            self.retune(offset);
        }
        if self.tuning.derandomize() {
            self.pending
                .extend(input.iter().map(|&s| derandomize(s) as f32));
        } else {
            self.pending.extend(input.iter().map(|&s| s as f32));
        }

        let mut used = 0;
        while self.pending.len() - used >= HOP {
            let new = used..used + HOP;
            self.run_frame(new.clone(), out);
            used = new.end;
        }
        self.pending.drain(..used);
    }

    fn run_frame(&mut self, new: std::ops::Range<usize>, out: &mut Vec<Complex32>) {
        let bins = self.band.len();
        let decim = self.config.decimation();

        for (dst, &x) in self
            .frame
            .iter_mut()
            .zip(self.history.iter().chain(self.pending[new.clone()].iter()))
        {
            *dst = Complex32::new(x, 0.0);
        }
        self.history
            .copy_from_slice(&self.pending[new.end - OVERLAP..new.end]);
        self.forward
            .process_with_scratch(&mut self.frame, &mut self.scratch);

        let c = self.center_bin as i64;
        let n = FFT_LEN as i64;
        for (j, dst) in self.band.iter_mut().enumerate() {
            let k = if j < bins / 2 {
                j as i64
            } else {
                j as i64 - bins as i64
            };
            let src = (c + k).rem_euclid(n) as usize;
            let h = k.rem_euclid(n) as usize;
            *dst = self.frame[src] * self.response[h];
        }
        self.inverse
            .process_with_scratch(&mut self.band, &mut self.scratch);

        // Undo the frame-relative bin shift so the mix is continuous across
        // frames, and fold in the output scaling.
        let turns = (self.center_bin * self.frame_start) % FFT_LEN;
        let rotation = Complex32::from_polar(
            2.0 * self.config.gain / FFT_LEN as f32,
            -(TAU * turns as f64 / FFT_LEN as f64) as f32,
        );
        self.frame_start = (self.frame_start + HOP) % FFT_LEN;

        let start = out.len();
        out.extend(self.band[OVERLAP / decim..].iter().map(|&s| s * rotation));
        self.nco.mix(&mut out[start..]);
    }
}

/// Output samples a [`DdcEngine`] produces for `input_len` ADC samples, once
/// running.
pub fn output_len(input_len: usize, decimation_idx: u8) -> usize {
    input_len / (2usize << decimation_idx)
}

fn run_engine(
    mut engine: DdcEngine,
    input: Arc<RingBuffer<i16>>,
    output: Arc<RingBuffer<Complex32>>,
) -> DdcEngine {
    let block = output.block_size();
    let mut staged = Vec::with_capacity(block * 2);
    while let Some(blk) = input.get_read_block() {
        engine.process(&blk, &mut staged);
        blk.release();
        let mut sent = 0;
        while staged.len() - sent >= block {
            let Some(mut out) = output.get_write_block() else {
                return engine;
            };
            out.copy_from_slice(&staged[sent..sent + block]);
            out.commit();
            sent += block;
        }
        staged.drain(..sent);
    }
    engine
}

enum State {
    Off(Box<DdcEngine>),
    On {
        worker: JoinHandle<DdcEngine>,
        input: Arc<RingBuffer<i16>>,
        output: Arc<RingBuffer<Complex32>>,
    },
    Broken,
}

/// Threaded downconverter sitting between the raw and baseband rings.
///
/// Settings in [`DdcConfig`] change only while off. The tuning offset and the
/// de-randomizer switch go through a [`TuningHandle`] and change at any time.
pub struct Downconverter {
    config: DdcConfig,
    tuning: TuningHandle,
    state: State,
}

impl Downconverter {
    /// Build a downconverter, initially off.
    pub fn new(config: DdcConfig) -> Result<Self, Error> {
        let tuning = TuningHandle::default();
        let engine = DdcEngine::new(config.clone(), tuning.clone())?;
        Ok(Self {
            config,
            tuning,
            state: State::Off(Box::new(engine)),
        })
    }

    /// Current settings.
    pub fn config(&self) -> &DdcConfig {
        &self.config
    }

    /// Change settings. Only allowed while off.
    pub fn configure(&mut self, config: DdcConfig) -> Result<(), Error> {
        if self.is_on() {
            return Err(Error::Busy);
        }
        if config == self.config && matches!(self.state, State::Off(_)) {
            return Ok(());
        }
        let engine = DdcEngine::new(config.clone(), self.tuning.clone())?;
        self.config = config;
        self.state = State::Off(Box::new(engine));
        Ok(())
    }

    /// Handle for live tuning.
    pub fn tuning(&self) -> TuningHandle {
        self.tuning.clone()
    }

    /// Output sample rate, in Hz.
    pub fn output_rate(&self) -> f64 {
        self.config.output_rate()
    }

    /// Whether the processing thread is running.
    pub fn is_on(&self) -> bool {
        matches!(self.state, State::On { .. })
    }

    /// Start processing from `input` into `output`, from a clean stream
    /// state.
    pub fn turn_on(
        &mut self,
        input: Arc<RingBuffer<i16>>,
        output: Arc<RingBuffer<Complex32>>,
    ) -> Result<(), Error> {
        let mut engine = match std::mem::replace(&mut self.state, State::Broken) {
            State::Off(engine) => engine,
            on @ State::On { .. } => {
                self.state = on;
                return Err(Error::Busy);
            }
            State::Broken => Box::new(DdcEngine::new(self.config.clone(), self.tuning.clone())?),
        };
        engine.reset();
        let (inp, outp) = (input.clone(), output.clone());
        let spawned = std::thread::Builder::new()
            .name("sddc-ddc".into())
            .spawn(move || run_engine(*engine, inp, outp));
        match spawned {
            Ok(worker) => {
                self.state = State::On {
                    worker,
                    input,
                    output,
                };
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop both rings and wait for the processing thread to exit.
    pub fn turn_off(&mut self) {
        match std::mem::replace(&mut self.state, State::Broken) {
            State::On {
                worker,
                input,
                output,
            } => {
                input.stop();
                output.stop();
                match worker.join() {
                    Ok(engine) => self.state = State::Off(Box::new(engine)),
                    Err(_) => warn!("Downconverter thread panicked"),
                }
            }
            other => self.state = other,
        }
    }
}

impl Drop for Downconverter {
    fn drop(&mut self) {
        self.turn_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const FS: f64 = 64_000_000.0;

    fn tone(freq: f64, amp: f64, start: usize, len: usize) -> Vec<i16> {
        (start..start + len)
            .map(|n| (amp * (2.0 * PI * freq * n as f64 / FS).cos()).round() as i16)
            .collect()
    }

    fn engine(idx: u8, sideband: Sideband, offset: f64) -> DdcEngine {
        let tuning = TuningHandle::default();
        tuning.set_offset(offset);
        let config = DdcConfig {
            decimation_idx: idx,
            sideband,
            gain: 1.0,
            adc_freq: FS as u32,
        };
        DdcEngine::new(config, tuning).unwrap()
    }

    fn run(engine: &mut DdcEngine, freq: f64, blocks: usize) -> Vec<Complex32> {
        let mut out = Vec::new();
        for b in 0..blocks {
            let input = tone(freq, 1000.0, b * 16384, 16384);
            engine.process(&input, &mut out);
        }
        out
    }

    /// Mean frequency of a complex signal from its phase steps.
    fn measured_freq(samples: &[Complex32], rate: f64) -> f64 {
        let sum: Complex32 = samples
            .windows(2)
            .map(|w| w[1] * w[0].conj())
            .sum();
        sum.arg() as f64 * rate / (2.0 * PI)
    }

    #[test]
    fn rates_and_lengths() {
        for idx in 0..=MAX_DECIMATION_IDX {
            let mut e = engine(idx, Sideband::Upper, 1_000_000.0);
            let decim = 2usize << idx;
            assert_eq!(e.output_rate(), FS / decim as f64);
            let mut out = Vec::new();
            e.process(&vec![0; HOP * 4], &mut out);
            assert_eq!(out.len(), HOP * 4 / decim);
            assert_eq!(output_len(HOP * 4, idx), out.len());
        }
        assert!(engine_err(5));
    }

    fn engine_err(idx: u8) -> bool {
        let config = DdcConfig {
            decimation_idx: idx,
            ..Default::default()
        };
        DdcEngine::new(config, TuningHandle::default()).is_err()
    }

    #[test]
    fn partial_blocks_are_carried_over() {
        let mut e = engine(2, Sideband::Upper, 0.0);
        let mut out = Vec::new();
        e.process(&vec![0; HOP - 1], &mut out);
        assert!(out.is_empty());
        e.process(&[0], &mut out);
        assert_eq!(out.len(), HOP / 8);
    }

    #[test]
    fn tone_on_bin_comes_out_at_dc_with_amplitude() {
        let mut e = engine(2, Sideband::Upper, 10_000_000.0);
        let out = run(&mut e, 10_000_000.0, 8);
        let settled = &out[HOP / 8..];
        for s in settled {
            assert!((s.norm() - 1000.0).abs() < 5.0, "{}", s.norm());
        }
        assert!(measured_freq(settled, e.output_rate()).abs() < 1.0);
    }

    #[test]
    fn residual_is_removed_by_fine_tuner() {
        let f = 10_000_123.0;
        let mut e = engine(3, Sideband::Upper, f);
        let (bin, fine) = e.coarse_and_fine();
        assert_eq!(bin, 1280);
        assert!((fine + 123.0).abs() <= FineTuner::new(e.output_rate()).resolution());
        let out = run(&mut e, f, 8);
        let settled = &out[HOP / 16..];
        assert!(measured_freq(settled, e.output_rate()).abs() < 0.5);
    }

    #[test]
    fn offset_tone_keeps_sign_per_sideband() {
        let mut upper = engine(2, Sideband::Upper, 5_000_000.0);
        let out = run(&mut upper, 5_000_000.0 - 50_000.0, 6);
        let f = measured_freq(&out[HOP / 8..], upper.output_rate());
        assert!((f + 50_000.0).abs() < 10.0, "{f}");

        // The tuner path mirrors the spectrum, so a tone below the IF is
        // above the tuned frequency.
        let mut lower = engine(2, Sideband::Lower, 5_000_000.0);
        let out = run(&mut lower, 5_000_000.0 - 50_000.0, 6);
        let f = measured_freq(&out[HOP / 8..], lower.output_rate());
        assert!((f - 50_000.0).abs() < 10.0, "{f}");
    }

    #[test]
    fn out_of_band_tone_is_rejected_without_dc() {
        let mut e = engine(4, Sideband::Upper, 10_000_000.0);
        let out = run(&mut e, 12_000_000.0, 8);
        let settled = &out[HOP / 32..];
        let mean: Complex32 = settled.iter().sum::<Complex32>() / settled.len() as f32;
        assert!(mean.norm() < 0.5);
        assert!(settled.iter().all(|s| s.norm() < 1.0));
    }

    #[test]
    fn derandomizes_input() {
        let clean = tone(2_000_000.0, 3000.0, 0, HOP * 3);
        let scrambled: Vec<i16> = clean.iter().map(|&s| derandomize(s)).collect();
        assert_ne!(clean, scrambled);

        let mut a = engine(1, Sideband::Upper, 2_000_000.0);
        let mut b = engine(1, Sideband::Upper, 2_000_000.0);
        b.tuning().set_derandomize(true);
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        a.process(&clean, &mut out_a);
        b.process(&scrambled, &mut out_b);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn threaded_turn_on_and_off() {
        let mut ddc = Downconverter::new(DdcConfig {
            decimation_idx: 2,
            ..Default::default()
        })
        .unwrap();
        let input = Arc::new(RingBuffer::with_capacity(4, 16384));
        let output = Arc::new(RingBuffer::with_capacity(4, 2048));
        ddc.turn_on(input.clone(), output.clone()).unwrap();
        assert!(ddc.is_on());
        assert!(matches!(
            ddc.configure(DdcConfig::default()),
            Err(Error::Busy)
        ));

        for _ in 0..3 {
            let mut blk = input.get_write_block().unwrap();
            blk.copy_from_slice(&tone(10_000_000.0, 1000.0, 0, 16384));
            blk.commit();
        }
        let blk = output.get_read_block().unwrap();
        assert_eq!(blk.len(), 2048);
        drop(blk);

        ddc.turn_off();
        assert!(!ddc.is_on());
        assert!(input.is_stopped());
        ddc.configure(DdcConfig::default()).unwrap();
    }
}
