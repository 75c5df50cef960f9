//! Streaming session lifecycle.
//!
//! An [`Acquisition`] owns a radio and a [`Downconverter`] and, while
//! running, four threads:
//!
//! - the producer, reading raw transfers from the transport into the input
//!   ring,
//! - the downconverter thread, turning input blocks into baseband blocks,
//! - the delivery thread, handing each baseband block to the user callback,
//! - a stats ticker recomputing throughput from the counters.
//!
//! Tuning calls may come from any thread at any time. They hold the radio
//! lock only while registers are written.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Sender, select};
use num_complex::Complex32;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::consts::Fx3Command;
use crate::ddc::{DdcConfig, Downconverter, MAX_DECIMATION_IDX, Sideband, TuningHandle};
use crate::radio::{MAX_TUNER_FREQ_HZ, MIN_FREQ_HZ, Radio, RfMode};
use crate::ring::{RingBuffer, TryWriteError};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::transport::Transport;

/// Scale applied by the downconverter: a full-scale ADC tone comes out with
/// magnitude 1.
pub const OUTPUT_GAIN: f32 = 1.0 / 32768.0;

/// Where a streaming session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Not streaming. Settings may change.
    Idle,
    /// Streaming.
    Running,
    /// Stop requested, threads winding down.
    Canceling,
    /// Streaming ended on an unrecoverable transport error. Call
    /// [`Acquisition::stop`] before starting again.
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Canceling => "canceling",
            Self::Error => "in error",
        })
    }
}

/// Buffering and supervision settings for a session.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    /// ADC samples per USB transfer, and so per input ring block. Must be a
    /// multiple of 512.
    pub transfer_samples: usize,
    /// USB transfers kept in flight.
    pub transfers_in_flight: usize,
    /// Blocks in the raw input ring.
    pub input_depth: usize,
    /// Blocks in the baseband output ring.
    pub output_depth: usize,
    /// How often throughput is recomputed.
    pub stats_period: Duration,
    /// Span of the rolling throughput average.
    pub stats_window: Duration,
    /// Back-to-back failed reads that end the session.
    pub failure_threshold: u32,
    /// Drop raw blocks when the input ring is full instead of waiting for
    /// the downconverter. Dropped blocks are counted as overruns.
    pub drop_on_overrun: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            transfer_samples: 65536,
            transfers_in_flight: 16,
            input_depth: 16,
            output_depth: 8,
            stats_period: Duration::from_millis(250),
            stats_window: Duration::from_secs(2),
            failure_threshold: 16,
            drop_on_overrun: false,
        }
    }
}

impl StreamConfig {
    /// Check the settings.
    pub fn validate(&self) -> Result<(), Error> {
        if self.transfer_samples == 0 || self.transfer_samples % 512 != 0 {
            return Err(Error::InvalidParameter(
                "transfer size must be a non-zero multiple of 512 samples",
            ));
        }
        if self.transfers_in_flight == 0 {
            return Err(Error::InvalidParameter("at least one transfer must be in flight"));
        }
        if self.input_depth < 2 || self.output_depth < 2 {
            return Err(Error::InvalidParameter("rings need at least two blocks"));
        }
        if self.stats_period.is_zero() || self.stats_window < self.stats_period {
            return Err(Error::InvalidParameter(
                "stats window must be at least one non-zero period",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(Error::InvalidParameter("failure threshold must be non-zero"));
        }
        Ok(())
    }

    /// Baseband samples per output block at decimation index `idx`.
    pub fn output_block(&self, idx: u8) -> usize {
        self.transfer_samples / (2usize << idx)
    }
}

/// How a requested center frequency was split between the hardware and the
/// downconverter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrequencyPlan {
    /// What was asked for.
    pub requested: u64,
    /// RF path in use.
    pub mode: RfMode,
    /// Frequency the tuner landed on. 0 in the HF path.
    pub lo: u64,
    /// Offset handed to the downconverter.
    pub offset_hz: f64,
    /// Sideband the downconverter must keep.
    pub sideband: Sideband,
}

impl FrequencyPlan {
    /// Split `requested` given the tuner result `lo` and the tuner IF.
    ///
    /// In the HF path the whole frequency is handled by the downconverter. In
    /// the tuner path the tuner puts `lo` on its IF with the spectrum
    /// mirrored, so the downconverter picks the IF minus the tuner's error.
    pub fn new(requested: u64, mode: RfMode, lo: u64, tuner_if_hz: u64) -> Self {
        match mode {
            RfMode::Vhf => {
                let residual = requested as f64 - lo as f64;
                Self {
                    requested,
                    mode,
                    lo,
                    offset_hz: tuner_if_hz as f64 - residual,
                    sideband: Sideband::Lower,
                }
            }
            _ => Self {
                requested,
                mode,
                lo: 0,
                offset_hz: requested as f64,
                sideband: Sideband::Upper,
            },
        }
    }

    /// Tuner error the downconverter corrects for.
    pub fn residual(&self) -> f64 {
        match self.mode {
            RfMode::Vhf => self.requested as f64 - self.lo as f64,
            _ => 0.0,
        }
    }
}

fn sideband_for(mode: RfMode) -> Sideband {
    if mode == RfMode::Vhf {
        Sideband::Lower
    } else {
        Sideband::Upper
    }
}

#[derive(Clone)]
struct Rings {
    input: Arc<RingBuffer<i16>>,
    output: Option<Arc<RingBuffer<Complex32>>>,
}

impl Rings {
    fn stop(&self) {
        self.input.stop();
        if let Some(output) = &self.output {
            output.stop();
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    stats: SessionStats,
    rings: Mutex<Option<Rings>>,
    sideband: Mutex<Option<Sideband>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move a running session to `next` and unblock every thread.
    fn halt(&self, next: SessionState) -> bool {
        let mut state = lock(&self.state);
        if *state != SessionState::Running {
            return false;
        }
        *state = next;
        drop(state);
        if let Some(rings) = lock(&self.rings).as_ref() {
            rings.stop();
        }
        true
    }
}

/// Stops a running session from another thread, or from inside the
/// callback, without waiting for it.
///
/// The owner still has to call [`Acquisition::stop`] to join the threads and
/// return to idle.
#[derive(Clone)]
pub struct Canceler {
    shared: Arc<Shared>,
}

impl Canceler {
    /// Ask the session to wind down. Returns false if it wasn't running.
    pub fn cancel(&self) -> bool {
        self.shared.halt(SessionState::Canceling)
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }
}

#[derive(Default)]
struct Workers {
    producer: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    ticker: Option<(Sender<()>, JoinHandle<()>)>,
}

impl Workers {
    fn join(&mut self) {
        for (name, handle) in [
            ("producer", self.producer.take()),
            ("delivery", self.delivery.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("Acquisition {name} thread panicked");
                }
            }
        }
        if let Some((stop, handle)) = self.ticker.take() {
            drop(stop);
            if handle.join().is_err() {
                warn!("Stats thread panicked");
            }
        }
    }
}

struct Session {
    ddc: Downconverter,
    workers: Workers,
    rate_idx: u8,
}

/// A radio streaming session.
///
/// All methods take `&self`, so an `Acquisition` can be shared between the
/// thread driving the stream and the threads tuning it.
pub struct Acquisition {
    radio: Mutex<Option<Box<dyn Radio>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    tuning: TuningHandle,
    config: StreamConfig,
    shared: Arc<Shared>,
    session: Mutex<Session>,
    plan: Mutex<Option<FrequencyPlan>>,
}

impl Acquisition {
    /// Bind a radio and a downconverter. Nothing is sent to the device.
    pub fn new(
        radio: Box<dyn Radio>,
        ddc: Downconverter,
        config: StreamConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let transport = radio.core().transport().clone();
        Ok(Self {
            radio: Mutex::new(Some(radio)),
            transport: Mutex::new(Some(transport)),
            tuning: ddc.tuning(),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Idle),
                stats: SessionStats::new(config.stats_window),
                rings: Mutex::new(None),
                sideband: Mutex::new(None),
            }),
            config,
            session: Mutex::new(Session {
                ddc,
                workers: Workers::default(),
                rate_idx: 0,
            }),
            plan: Mutex::new(None),
        })
    }

    /// Buffering settings.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Latest statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// A handle that can cancel the session from any thread.
    pub fn canceler(&self) -> Canceler {
        Canceler {
            shared: self.shared.clone(),
        }
    }

    /// The downconverter's live tuning controls.
    pub fn tuning(&self) -> &TuningHandle {
        &self.tuning
    }

    /// Whether [`close`][Self::close] was called.
    pub fn is_closed(&self) -> bool {
        lock(&self.radio).is_none()
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, Error> {
        lock(&self.transport).clone().ok_or(Error::Closed)
    }

    /// Run `f` on the radio while holding the radio lock.
    pub fn with_radio<R>(&self, f: impl FnOnce(&mut dyn Radio) -> Result<R, Error>) -> Result<R, Error> {
        let mut radio = lock(&self.radio);
        match radio.as_mut() {
            Some(radio) => f(radio.as_mut()),
            None => Err(Error::Closed),
        }
    }

    /// The frequency plan from the last successful tune.
    pub fn frequency_plan(&self) -> Option<FrequencyPlan> {
        *lock(&self.plan)
    }

    /// Tune to `freq`, picking the RF path the radio wants for it.
    pub fn tune(&self, freq: u64) -> Result<FrequencyPlan, Error> {
        let mode = self.with_radio(|r| Ok(r.prepare_lo(freq)))?;
        if mode == RfMode::NoMode {
            return Err(Error::TuningRange {
                range: MIN_FREQ_HZ..MAX_TUNER_FREQ_HZ + 1,
                val: freq,
            });
        }
        self.tune_in_mode(freq, mode)
    }

    /// Tune to `freq` in a given RF path.
    ///
    /// While streaming, the path can only change if it keeps the same
    /// sideband; anything else needs a stopped session.
    pub fn tune_in_mode(&self, freq: u64, mode: RfMode) -> Result<FrequencyPlan, Error> {
        if mode == RfMode::NoMode {
            return Err(Error::InvalidParameter("cannot tune without an RF mode"));
        }
        if let Some(active) = *lock(&self.shared.sideband) {
            if active != sideband_for(mode) {
                return Err(Error::State(self.state()));
            }
        }
        let plan = self.with_radio(|r| {
            r.update_mode(mode)?;
            let lo = r.tune_lo(freq)?;
            Ok(FrequencyPlan::new(freq, mode, lo, r.tuner_if_hz()))
        })?;
        self.tuning.set_offset(plan.offset_hz);
        debug!(
            "Tuned {} Hz: {} path, LO {} Hz, DDC offset {} Hz",
            plan.requested, plan.mode, plan.lo, plan.offset_hz
        );
        *lock(&self.plan) = Some(plan);
        Ok(plan)
    }

    /// Output sample rate at decimation index `idx`, in Hz.
    pub fn output_rate(&self, idx: u8) -> Result<f64, Error> {
        let adc = self.with_radio(|r| Ok(r.adc_freq()))?;
        Ok(adc as f64 / (2u64 << idx) as f64)
    }

    /// Start streaming baseband at decimation index `rate_idx`, calling
    /// `callback` once per block of [`StreamConfig::output_block`] samples.
    ///
    /// The callback runs on its own thread. It must not call
    /// [`stop`][Self::stop]; use a [`Canceler`] instead.
    pub fn start<F>(&self, rate_idx: u8, callback: F) -> Result<(), Error>
    where
        F: FnMut(&[Complex32]) + Send + 'static,
    {
        if rate_idx > MAX_DECIMATION_IDX {
            return Err(Error::ValueRange {
                range: 0..MAX_DECIMATION_IDX as u32 + 1,
                val: rate_idx as u32,
            });
        }
        self.start_inner(Some(rate_idx), Delivery::Baseband(Box::new(callback)))
    }

    /// Start streaming raw ADC samples, bypassing the downconverter.
    pub fn start_raw<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnMut(&[i16]) + Send + 'static,
    {
        self.start_inner(None, Delivery::Raw(Box::new(callback)))
    }

    fn start_inner(&self, rate_idx: Option<u8>, delivery: Delivery) -> Result<(), Error> {
        let mut session = lock(&self.session);
        match self.state() {
            SessionState::Idle => (),
            SessionState::Running | SessionState::Canceling => return Err(Error::Busy),
            state => return Err(Error::State(state)),
        }

        let (mode, adc_freq) = self.with_radio(|r| {
            let adc = r.adc_freq();
            r.update_adc_freq(adc)?;
            Ok((r.mode(), adc))
        })?;

        let cfg = &self.config;
        let input = Arc::new(RingBuffer::with_capacity(cfg.input_depth, cfg.transfer_samples));
        let output = match rate_idx {
            Some(idx) => {
                let sideband = sideband_for(mode);
                session.ddc.configure(DdcConfig {
                    decimation_idx: idx,
                    sideband,
                    gain: OUTPUT_GAIN,
                    adc_freq,
                })?;
                session.rate_idx = idx;
                *lock(&self.shared.sideband) = Some(sideband);
                Some(Arc::new(RingBuffer::with_capacity(
                    cfg.output_depth,
                    cfg.output_block(idx),
                )))
            }
            None => None,
        };
        let rings = Rings {
            input: input.clone(),
            output: output.clone(),
        };
        *lock(&self.shared.rings) = Some(rings);
        self.shared.stats.reset();
        *lock(&self.shared.state) = SessionState::Running;

        if let Err(e) = self.spawn(&mut session, input, output, delivery) {
            error!("Couldn't start streaming: {e}");
            self.shared.halt(SessionState::Canceling);
            self.teardown(&mut session);
            self.shared.stats.reset();
            *lock(&self.shared.state) = SessionState::Idle;
            return Err(e);
        }
        info!(
            "Streaming started: ADC {} Hz, {}",
            adc_freq,
            match rate_idx {
                Some(idx) => format!("decimation {}", 2u32 << idx),
                None => "raw".into(),
            }
        );
        Ok(())
    }

    fn spawn(
        &self,
        session: &mut Session,
        input: Arc<RingBuffer<i16>>,
        output: Option<Arc<RingBuffer<Complex32>>>,
        delivery: Delivery,
    ) -> Result<(), Error> {
        let cfg = &self.config;
        let transport = self.transport()?;
        transport.start_stream(cfg.transfer_samples, cfg.transfers_in_flight)?;
        transport.control(Fx3Command::StartFx3, &[])?;

        let (tick_tx, tick_rx) = crossbeam_channel::bounded::<()>(0);
        let shared = self.shared.clone();
        let period = cfg.stats_period;
        let ticker = std::thread::Builder::new()
            .name("sddc-stats".into())
            .spawn(move || {
                let ticks = crossbeam_channel::tick(period);
                loop {
                    select! {
                        recv(ticks) -> now => match now {
                            Ok(now) => shared.stats.tick(now),
                            Err(_) => break,
                        },
                        recv(tick_rx) -> _ => break,
                    }
                }
            })?;
        session.workers.ticker = Some((tick_tx, ticker));

        let producer = Producer {
            transport,
            input: input.clone(),
            shared: self.shared.clone(),
            failure_threshold: cfg.failure_threshold,
            drop_on_overrun: cfg.drop_on_overrun,
        };
        session.workers.producer = Some(
            std::thread::Builder::new()
                .name("sddc-producer".into())
                .spawn(move || producer.run())?,
        );

        let shared = self.shared.clone();
        session.workers.delivery = Some(match (delivery, output) {
            (Delivery::Baseband(callback), Some(output)) => {
                session.ddc.turn_on(input, output.clone())?;
                std::thread::Builder::new()
                    .name("sddc-delivery".into())
                    .spawn(move || deliver(&output, &shared, callback))?
            }
            (Delivery::Raw(callback), None) => std::thread::Builder::new()
                .name("sddc-delivery".into())
                .spawn(move || deliver(&input, &shared, callback))?,
            _ => return Err(Error::InvalidParameter("delivery does not match stream")),
        });
        Ok(())
    }

    fn teardown(&self, session: &mut Session) {
        // Cancel the transfers first so a producer waiting on one returns.
        let transport = lock(&self.transport).clone();
        if let Some(transport) = transport {
            if let Err(e) = transport.stop_stream() {
                debug!("Stopping the transfer queue failed: {e}");
            }
            if let Err(e) = transport.control(Fx3Command::StopFx3, &[]) {
                debug!("StopFx3 failed: {e}");
            }
        }
        session.ddc.turn_off();
        session.workers.join();
        *lock(&self.shared.rings) = None;
        *lock(&self.shared.sideband) = None;
    }

    /// Stop streaming, join every thread, and return the final statistics.
    ///
    /// Works from [`SessionState::Error`] as well. Once this returns, no more
    /// callbacks run and the device isn't touched by the session threads.
    pub fn stop(&self) -> Result<StatsSnapshot, Error> {
        let mut session = lock(&self.session);
        let state = self.state();
        if state == SessionState::Idle {
            return Err(Error::State(state));
        }
        self.shared.halt(SessionState::Canceling);
        self.teardown(&mut session);
        self.shared.stats.tick(std::time::Instant::now());
        let stats = self.shared.stats.snapshot();
        self.shared.stats.reset();
        *lock(&self.shared.state) = SessionState::Idle;
        info!(
            "Streaming stopped after {} bytes, {} samples, {} failed reads",
            stats.bytes, stats.samples, stats.read_failures
        );
        Ok(stats)
    }

    /// Decimation index of the current or last session.
    pub fn rate_idx(&self) -> u8 {
        lock(&self.session).rate_idx
    }

    /// Release the radio and the transport. Only allowed while idle; the
    /// radio is put into shutdown and every later call fails with
    /// [`Error::Closed`].
    pub fn close(&self) -> Result<(), Error> {
        let _session = lock(&self.session);
        let state = self.state();
        if state != SessionState::Idle {
            return Err(Error::State(state));
        }
        let radio = lock(&self.radio).take().ok_or(Error::Closed)?;
        info!("Closing {}", radio.name());
        drop(radio);
        lock(&self.transport).take();
        Ok(())
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if self.state() != SessionState::Idle {
            let _ = self.stop();
        }
    }
}

enum Delivery {
    Baseband(Box<dyn FnMut(&[Complex32]) + Send>),
    Raw(Box<dyn FnMut(&[i16]) + Send>),
}

fn deliver<T: Clone + Default>(
    ring: &RingBuffer<T>,
    shared: &Shared,
    mut callback: Box<dyn FnMut(&[T]) + Send>,
) {
    while let Some(blk) = ring.get_read_block() {
        callback(&blk);
        shared.stats.add_samples(blk.len() as u64);
    }
}

struct Producer {
    transport: Arc<dyn Transport>,
    input: Arc<RingBuffer<i16>>,
    shared: Arc<Shared>,
    failure_threshold: u32,
    drop_on_overrun: bool,
}

impl Producer {
    /// Take the device out of streaming after a session-ending failure. The
    /// threads stay up until the owner calls [`Acquisition::stop`].
    fn disarm(&self) {
        if let Err(e) = self.transport.stop_stream() {
            warn!("Stopping the transfer queue failed: {e}");
        }
        if let Err(e) = self.transport.control(Fx3Command::StopFx3, &[]) {
            warn!("StopFx3 failed: {e}");
        }
    }

    fn run(self) {
        let mut spill = Vec::new();
        let mut consecutive = 0;
        loop {
            let block = if self.drop_on_overrun {
                self.input.try_get_write_block()
            } else {
                self.input.get_write_block().ok_or(TryWriteError::Stopped)
            };
            let result = match block {
                Ok(mut blk) => {
                    let res = self.transport.read_block(&mut blk);
                    if res.is_ok() {
                        blk.commit();
                    }
                    res
                }
                Err(TryWriteError::Full) => {
                    // Keep the transfers moving, but the data has nowhere to go.
                    spill.resize(self.input.block_size(), 0);
                    let res = self.transport.read_block(&mut spill);
                    if res.is_ok() {
                        let n = self.shared.stats.add_overrun();
                        if n.is_power_of_two() {
                            warn!("Input ring full, {n} blocks dropped so far");
                        }
                    }
                    res
                }
                Err(TryWriteError::Stopped) => break,
            };

            match result {
                Ok(()) => {
                    consecutive = 0;
                    self.shared
                        .stats
                        .add_bytes((self.input.block_size() * 2) as u64);
                }
                Err(_) if self.shared.state() != SessionState::Running => break,
                Err(e) if e.is_fatal() => {
                    error!("Transport failed, ending session: {e}");
                    self.disarm();
                    self.shared.halt(SessionState::Error);
                    break;
                }
                Err(e) => {
                    consecutive += 1;
                    let total = self.shared.stats.add_read_failure();
                    warn!("Transfer failed ({total} so far): {e}");
                    if consecutive >= self.failure_threshold {
                        error!("{consecutive} transfers failed in a row, ending session");
                        self.disarm();
                        self.shared.halt(SessionState::Error);
                        break;
                    }
                }
            }
        }
        debug!("Producer exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RadioModel;
    use crate::consts::ArgId;
    use crate::radio::create_radio;
    use crate::sim::{ControlRecord, SimulatedDevice};
    use crate::transport::HardwareInfo;
    use crossbeam_channel::RecvTimeoutError;

    fn session(sim: &Arc<SimulatedDevice>, config: StreamConfig) -> Acquisition {
        let radio = create_radio(sim.clone()).unwrap();
        let ddc = Downconverter::new(DdcConfig::default()).unwrap();
        Acquisition::new(radio, ddc, config).unwrap()
    }

    fn small_config() -> StreamConfig {
        StreamConfig {
            transfer_samples: 16384,
            input_depth: 4,
            output_depth: 4,
            stats_period: Duration::from_millis(20),
            stats_window: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn config_validation() {
        assert!(StreamConfig::default().validate().is_ok());
        let bad = [
            StreamConfig {
                transfer_samples: 1000,
                ..Default::default()
            },
            StreamConfig {
                input_depth: 1,
                ..Default::default()
            },
            StreamConfig {
                stats_window: Duration::from_millis(10),
                ..Default::default()
            },
            StreamConfig {
                failure_threshold: 0,
                ..Default::default()
            },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(Error::InvalidParameter(_))));
        }
        assert_eq!(StreamConfig::default().output_block(2), 8192);
    }

    #[test]
    fn frequency_plan_per_path() {
        let hf = FrequencyPlan::new(7_100_000, RfMode::Hf, 0, 4_570_000);
        assert_eq!(hf.offset_hz, 7_100_000.0);
        assert_eq!(hf.sideband, Sideband::Upper);
        assert_eq!(hf.residual(), 0.0);

        let vhf = FrequencyPlan::new(100_000_100, RfMode::Vhf, 100_000_000, 4_570_000);
        assert_eq!(vhf.residual(), 100.0);
        assert_eq!(vhf.offset_hz, 4_569_900.0);
        assert_eq!(vhf.sideband, Sideband::Lower);
    }

    #[test]
    fn streams_blocks_of_configured_size() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let acq = session(&sim, small_config());
        acq.tune(10_000_000).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        acq.start(2, move |blk: &[Complex32]| {
            let _ = tx.send(blk.to_vec());
        })
        .unwrap();
        assert_eq!(acq.state(), SessionState::Running);
        assert!(sim.is_streaming());

        let blk = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(blk.len(), 2048);
        // Skip the filter warm-up, then the 10 MHz tone sits at DC at half
        // scale.
        let settled = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .last()
            .unwrap();
        for s in &settled {
            assert!((s.norm() - 0.5).abs() < 0.01, "{}", s.norm());
        }

        let stats = acq.stop().unwrap();
        assert!(stats.bytes > 0);
        assert!(stats.samples >= 5 * 2048);
        assert_eq!(acq.state(), SessionState::Idle);
        assert!(!sim.is_streaming());
        assert_eq!(acq.stats(), StatsSnapshot::default());
    }

    #[test]
    fn lifecycle_errors() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Hf103));
        let acq = session(&sim, small_config());
        assert!(matches!(acq.stop(), Err(Error::State(SessionState::Idle))));
        assert!(matches!(acq.start(7, |_: &[Complex32]| ()), Err(Error::ValueRange { .. })));

        acq.start(3, |_: &[Complex32]| ()).unwrap();
        assert!(matches!(acq.start(3, |_: &[Complex32]| ()), Err(Error::Busy)));
        assert!(matches!(acq.close(), Err(Error::State(SessionState::Running))));
        acq.stop().unwrap();

        acq.start(3, |_: &[Complex32]| ()).unwrap();
        acq.stop().unwrap();

        acq.close().unwrap();
        assert!(acq.is_closed());
        assert!(matches!(acq.tune(1_000_000), Err(Error::Closed)));
        assert!(matches!(acq.start(3, |_: &[Complex32]| ()), Err(Error::Closed)));
        assert!(matches!(acq.close(), Err(Error::Closed)));
    }

    #[test]
    fn transient_failures_are_counted() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let acq = session(&sim, small_config());
        sim.fail_next_reads(3);
        let (tx, rx) = crossbeam_channel::unbounded();
        acq.start(2, move |_: &[Complex32]| {
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(acq.state(), SessionState::Running);
        let stats = acq.stop().unwrap();
        assert_eq!(stats.read_failures, 3);
    }

    #[test]
    fn failure_threshold_ends_session() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let acq = session(
            &sim,
            StreamConfig {
                failure_threshold: 4,
                ..small_config()
            },
        );
        sim.fail_next_reads(100);
        sim.clear_log();
        acq.start(2, |_: &[Complex32]| ()).unwrap();
        let canceler = acq.canceler();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while canceler.state() != SessionState::Error {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        // The device is disarmed without waiting for the owner.
        assert!(!sim.is_streaming());
        assert!(
            sim.control_log()
                .contains(&ControlRecord::Command(Fx3Command::StopFx3, Vec::new()))
        );
        assert!(matches!(acq.start(2, |_: &[Complex32]| ()), Err(Error::State(SessionState::Error))));
        let stats = acq.stop().unwrap();
        assert_eq!(stats.read_failures, 4);
        assert_eq!(acq.state(), SessionState::Idle);
    }

    /// Refuses to stream, otherwise behaves like the simulator.
    struct StreamRefused(Arc<SimulatedDevice>);

    impl Transport for StreamRefused {
        fn control(&self, cmd: Fx3Command, data: &[u8]) -> Result<(), Error> {
            self.0.control(cmd, data)
        }
        fn set_argument(&self, arg: ArgId, value: u16) -> Result<(), Error> {
            self.0.set_argument(arg, value)
        }
        fn hardware_info(&self) -> Result<HardwareInfo, Error> {
            self.0.hardware_info()
        }
        fn start_stream(&self, _: usize, _: usize) -> Result<(), Error> {
            Err(Error::Timeout)
        }
        fn read_block(&self, out: &mut [i16]) -> Result<(), Error> {
            self.0.read_block(out)
        }
        fn stop_stream(&self) -> Result<(), Error> {
            self.0.stop_stream()
        }
        fn read_debug_trace(&self, buf: &mut [u8]) -> Result<usize, Error> {
            self.0.read_debug_trace(buf)
        }
    }

    #[test]
    fn failed_start_returns_to_idle() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let radio = create_radio(Arc::new(StreamRefused(sim.clone()))).unwrap();
        let ddc = Downconverter::new(DdcConfig::default()).unwrap();
        let acq = Acquisition::new(radio, ddc, small_config()).unwrap();

        assert!(matches!(acq.start(2, |_: &[Complex32]| ()), Err(Error::Timeout)));
        assert_eq!(acq.state(), SessionState::Idle);
        assert_eq!(acq.stats().bytes, 0);
        assert!(matches!(acq.stop(), Err(Error::State(SessionState::Idle))));
        // Trying again fails the same way rather than reporting busy.
        assert!(matches!(acq.start(2, |_: &[Complex32]| ()), Err(Error::Timeout)));
        assert_eq!(acq.state(), SessionState::Idle);
        assert!(!sim.is_streaming());
    }

    #[test]
    fn disconnect_is_fatal() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let acq = session(&sim, small_config());
        let (tx, rx) = crossbeam_channel::unbounded();
        acq.start(2, move |_: &[Complex32]| {
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        sim.disconnect();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while acq.state() != SessionState::Error {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        acq.stop().unwrap();
        assert_eq!(acq.state(), SessionState::Idle);
    }

    #[test]
    fn no_callbacks_after_stop() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let acq = session(&sim, small_config());
        let (tx, rx) = crossbeam_channel::unbounded();
        acq.start(4, move |_: &[Complex32]| {
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        acq.stop().unwrap();
        while rx.try_recv().is_ok() {}
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn canceler_from_callback() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let acq = session(&sim, small_config());
        let canceler = acq.canceler();
        let mut seen = 0;
        acq.start(2, move |_: &[Complex32]| {
            seen += 1;
            if seen == 2 {
                canceler.cancel();
            }
        })
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while acq.state() != SessionState::Canceling {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        let stats = acq.stop().unwrap();
        assert_eq!(stats.samples, 2 * 2048);
    }

    #[test]
    fn raw_stream_skips_downconverter() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let acq = session(&sim, small_config());
        let (tx, rx) = crossbeam_channel::unbounded();
        acq.start_raw(move |blk: &[i16]| {
            let _ = tx.send(blk.len());
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 16384);
        acq.stop().unwrap();
    }

    #[test]
    fn path_change_while_streaming_needs_stop() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2));
        let acq = session(&sim, small_config());
        acq.tune(10_000_000).unwrap();
        acq.start(2, |_: &[Complex32]| ()).unwrap();
        acq.tune(12_000_000).unwrap();
        assert_eq!(acq.tuning().offset(), 12_000_000.0);
        assert!(matches!(acq.tune(145_000_000), Err(Error::State(SessionState::Running))));
        acq.stop().unwrap();
        let plan = acq.tune(145_000_000).unwrap();
        assert_eq!(plan.mode, RfMode::Vhf);
        assert!(plan.residual().abs() < acq.with_radio(|r| Ok(r.lo_grid_hz())).unwrap());
    }
}
