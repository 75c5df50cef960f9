/*!

A host driver and signal processing pipeline for the SDDC family of direct
sampling receivers: the [RX888][rx888] (all revisions), HF103, BBRF103, RX999
and RX-Lucy. USB access goes through the pure-rust [`nusb`] crate.

[rx888]: https://github.com/ik1xpv/ExtIO_sddc

These boards are little more than a fast ADC behind a Cypress FX3 USB
controller, with an optional tuner chip for frequencies above HF. The host gets
a stream of real 16-bit samples at up to ~130 MSPS, and everything a receiver
needs after that happens here: picking the band of interest, decimating it to
a usable rate, and fine-tuning it to the exact frequency asked for.

The standard entry point for this library is [`Sddc::open`], which opens an
attached device by index. [`Sddc::from_transport`] runs the same code over any
[`Transport`], including the in-process [`SimulatedDevice`].

The pieces underneath can be used on their own:

- [`ring::RingBuffer`] - the bounded block queue between threads.
- [`radio`] - per-board front-end control behind the [`Radio`] trait.
- [`ddc`] - the FFT downconverter and fine tuner.
- [`acquisition::Acquisition`] - the streaming session tying them together.

Here's an example program that tunes to a shortwave broadcast band, streams
for a while, and measures the average received power relative to full scale:

```no_run
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
fn main() -> Result<()> {
    let sddc = sddc::Sddc::open(0)?;

    // Configure: 2 MHz output, 10 dB of RF attenuation, tune to 9.6 MHz.
    sddc.set_sample_rate(2_000_000)?;
    sddc.set_rf_attenuation(-10.0)?;
    sddc.set_center_freq(9_600_000)?;

    // Sum up the power of every block handed to us.
    let power = Arc::new(Mutex::new((0.0f64, 0usize)));
    let sink = power.clone();
    sddc.read_async(move |block| {
        let mut acc = sink.lock().unwrap();
        acc.0 += block.iter().map(|x| x.norm_sqr() as f64).sum::<f64>();
        acc.1 += block.len();
    })?;
    std::thread::sleep(Duration::from_secs(2));
    sddc.cancel_async()?;

    let (sum, count) = *power.lock().unwrap();
    println!("Average Power = {} dBFS", (sum / count as f64).log10() * 10.0);
    Ok(())
}
```

*/

#![warn(missing_docs)]

pub mod acquisition;
pub mod consts;
pub mod ddc;
pub mod debug;
mod error;
pub mod info;
pub mod radio;
pub mod ring;
pub mod sim;
pub mod stats;
pub mod transport;
pub mod usb;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use num_complex::Complex32;
use tracing::{debug, info};

use crate::acquisition::{Acquisition, Canceler, FrequencyPlan, SessionState, StreamConfig};
use crate::ddc::{DdcConfig, Downconverter, MAX_DECIMATION_IDX, SoftDecimator};

pub use crate::debug::Debug;
pub use crate::error::Error;
pub use crate::info::Info;
pub use crate::radio::{Led, Radio, RadioModel, RfMode};
pub use crate::sim::SimulatedDevice;
pub use crate::stats::StatsSnapshot;
pub use crate::transport::Transport;
pub use crate::usb::{
    SddcDescriptor, UsbTransport, device_count, index_by_serial, list_sddc_devices, open_sddc,
};

/// Output sample rates the downconverter produces directly, by decimation
/// index, for the default 64 MHz ADC clock.
pub const SAMPLE_RATES: [u32; 5] = [32_000_000, 16_000_000, 8_000_000, 4_000_000, 2_000_000];

/// Bias tee bit for the HF input in [`Sddc::set_bias_tee`].
pub const BIAS_TEE_HF: u8 = 0x01;
/// Bias tee bit for the VHF input in [`Sddc::set_bias_tee`].
pub const BIAS_TEE_VHF: u8 = 0x02;

#[derive(Clone, Debug)]
struct Settings {
    rate_idx: u8,
    /// Extra software decimation after the downconverter, 1 for none.
    soft_factor: usize,
    direct_sampling: bool,
    rf_att: Option<f32>,
    if_gain: Option<f32>,
}

/// An SDDC receiver. This is the main struct for talking to the device.
///
/// All settings can be changed from any thread. Those that change how samples
/// are produced (sample rate, direct sampling, ADC clock) are only accepted
/// while idle; tuning and gain changes work while streaming too.
pub struct Sddc {
    acq: Acquisition,
    raw: bool,
    settings: Mutex<Settings>,
}

impl Sddc {
    /// Open the `index`-th attached device.
    pub fn open(index: usize) -> Result<Self, Error> {
        let transport = usb::open_sddc_by_index(index)?;
        Self::from_transport(Arc::new(transport))
    }

    /// Open the `index`-th attached device for raw ADC streaming.
    ///
    /// On a raw handle the sample rate sets the ADC clock to twice the rate
    /// and samples are delivered with [`read_async_raw`][Self::read_async_raw].
    pub fn open_raw(index: usize) -> Result<Self, Error> {
        let transport = usb::open_sddc_by_index(index)?;
        Self::with_config(Arc::new(transport), StreamConfig::default(), true)
    }

    /// Drive a device through any transport with the default stream settings.
    pub fn from_transport(transport: Arc<dyn Transport>) -> Result<Self, Error> {
        Self::with_config(transport, StreamConfig::default(), false)
    }

    /// Drive a device through any transport.
    ///
    /// Fails if the firmware isn't compatible or the settings are invalid.
    pub fn with_config(
        transport: Arc<dyn Transport>,
        config: StreamConfig,
        raw: bool,
    ) -> Result<Self, Error> {
        let radio = radio::create_radio(transport)?;
        let ddc = Downconverter::new(DdcConfig {
            adc_freq: radio.adc_freq(),
            ..Default::default()
        })?;
        let acq = Acquisition::new(radio, ddc, config)?;
        Ok(Self {
            acq,
            raw,
            settings: Mutex::new(Settings {
                rate_idx: 0,
                soft_factor: 1,
                direct_sampling: false,
                rf_att: None,
                if_gain: None,
            }),
        })
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_idle(&self) -> Result<(), Error> {
        match self.acq.state() {
            SessionState::Idle => Ok(()),
            state => Err(Error::State(state)),
        }
    }

    /// Release the device. Only allowed while not streaming.
    pub fn close(&self) -> Result<(), Error> {
        self.acq.close()
    }

    /// Access the identification and capability info.
    pub fn info(&self) -> Info<'_> {
        Info::new(self)
    }

    /// Access the debug commands.
    pub fn debug(&self) -> Debug<'_> {
        Debug::new(self)
    }

    /// The streaming session underneath.
    pub fn acquisition(&self) -> &Acquisition {
        &self.acq
    }

    /// Whether this handle streams raw ADC samples.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Board name.
    pub fn name(&self) -> Result<&'static str, Error> {
        self.acq.with_radio(|r| Ok(r.name()))
    }

    /// Board model.
    pub fn model(&self) -> Result<RadioModel, Error> {
        self.acq.with_radio(|r| Ok(r.model()))
    }

    /// Firmware version, packed as `major << 8 | minor`.
    pub fn firmware(&self) -> Result<u16, Error> {
        self.acq.with_radio(|r| Ok(r.firmware()))
    }

    /// Set the output sample rate.
    ///
    /// Rates the downconverter produces directly at the current ADC clock
    /// (the [`SAMPLE_RATES`] for the default clock) are used as is. Lower
    /// rates add an integer software decimation after the slowest stage,
    /// picking the nearest factor; rates that would need a factor below 2
    /// are rejected. [`sample_rate`][Self::sample_rate] reports what is
    /// actually produced. On a raw handle this sets the ADC clock to twice
    /// `rate` instead.
    pub fn set_sample_rate(&self, rate: u32) -> Result<(), Error> {
        self.require_idle()?;
        if self.raw {
            let adc = rate
                .checked_mul(2)
                .ok_or(Error::InvalidParameter("sample rate"))?;
            return self.acq.with_radio(|r| r.update_adc_freq(adc));
        }
        if rate == 0 {
            return Err(Error::InvalidParameter("unsupported sample rate"));
        }
        let rates = (0..=MAX_DECIMATION_IDX)
            .map(|idx| self.acq.output_rate(idx))
            .collect::<Result<Vec<_>, _>>()?;
        let (rate_idx, soft_factor) = match rates.iter().position(|&r| r == rate as f64) {
            Some(idx) => (idx as u8, 1),
            None => {
                let slowest = rates[MAX_DECIMATION_IDX as usize];
                let factor = (slowest / rate as f64).round() as usize;
                if factor < 2 {
                    return Err(Error::InvalidParameter("unsupported sample rate"));
                }
                (MAX_DECIMATION_IDX, factor)
            }
        };
        let mut settings = self.settings();
        settings.rate_idx = rate_idx;
        settings.soft_factor = soft_factor;
        debug!("Sample rate {rate} Hz: decimation index {rate_idx}, extra decimation {soft_factor}");
        Ok(())
    }

    /// The output sample rate actually produced, in Hz, at the current ADC
    /// clock. May differ from what was requested when extra software
    /// decimation is in use.
    pub fn sample_rate(&self) -> f64 {
        if self.raw {
            return self
                .acq
                .with_radio(|r| Ok(r.adc_freq() as f64 / 2.0))
                .unwrap_or_default();
        }
        let (idx, factor) = {
            let settings = self.settings();
            (settings.rate_idx, settings.soft_factor)
        };
        self.acq
            .output_rate(idx)
            .map(|rate| rate / factor as f64)
            .unwrap_or_default()
    }

    /// The extra software decimation applied after the downconverter.
    pub fn soft_decimation(&self) -> usize {
        self.settings().soft_factor
    }

    /// Tune to `freq`.
    ///
    /// In the HF path the downconverter does all the tuning. In the tuner
    /// path the tuner gets close and the downconverter corrects the rest.
    pub fn set_center_freq(&self, freq: u64) -> Result<FrequencyPlan, Error> {
        let direct = self.settings().direct_sampling;
        if direct && self.raw {
            return Err(Error::Mode("raw direct sampling"));
        }
        let plan = if direct {
            self.acq.tune_in_mode(freq, RfMode::Hf)?
        } else {
            self.acq.tune(freq)?
        };
        // The step tables follow the RF path, so re-apply the gains.
        let (rf, gain) = {
            let s = self.settings();
            (s.rf_att, s.if_gain)
        };
        if let Some(db) = rf {
            self.apply_rf_attenuation(db)?;
        }
        if let Some(db) = gain {
            self.apply_if_gain(db)?;
        }
        Ok(plan)
    }

    /// The last frequency tuned to, or 0 if never tuned.
    pub fn center_freq(&self) -> u64 {
        self.acq
            .frequency_plan()
            .map(|p| p.requested)
            .unwrap_or_default()
    }

    /// How the current frequency is split between tuner and downconverter.
    pub fn frequency_plan(&self) -> Option<FrequencyPlan> {
        self.acq.frequency_plan()
    }

    fn apply_rf_attenuation(&self, db: f32) -> Result<f32, Error> {
        self.acq.with_radio(|r| {
            let idx = r.rf_steps().select(db)?;
            r.update_att_rf(idx)?;
            Ok(r.rf_steps().get(idx).unwrap_or(db))
        })
    }

    fn apply_if_gain(&self, db: f32) -> Result<f32, Error> {
        self.acq.with_radio(|r| {
            let idx = r.if_steps().select(db)?;
            r.update_gain_if(idx)?;
            Ok(r.if_steps().get(idx).unwrap_or(db))
        })
    }

    /// Set the RF attenuation in dB, picking the first available step at or
    /// above `db`. Returns the step actually applied.
    pub fn set_rf_attenuation(&self, db: f32) -> Result<f32, Error> {
        let applied = self.apply_rf_attenuation(db)?;
        self.settings().rf_att = Some(applied);
        Ok(applied)
    }

    /// The RF attenuation last applied.
    pub fn rf_attenuation(&self) -> Option<f32> {
        self.settings().rf_att
    }

    /// Lowest and highest RF attenuation in the current RF path.
    pub fn rf_attenuation_range(&self) -> Result<Option<(f32, f32)>, Error> {
        self.acq.with_radio(|r| Ok(r.rf_steps().range()))
    }

    /// Set the IF gain in dB, picking the first available step at or above
    /// `db`. Returns the step actually applied.
    pub fn set_if_gain(&self, db: f32) -> Result<f32, Error> {
        let applied = self.apply_if_gain(db)?;
        self.settings().if_gain = Some(applied);
        Ok(applied)
    }

    /// The IF gain last applied.
    pub fn if_gain(&self) -> Option<f32> {
        self.settings().if_gain
    }

    /// Lowest and highest IF gain in the current RF path.
    pub fn if_gain_range(&self) -> Result<Option<(f32, f32)>, Error> {
        self.acq.with_radio(|r| Ok(r.if_steps().range()))
    }

    /// Force the HF path regardless of frequency. Only allowed while idle.
    pub fn set_direct_sampling(&self, on: bool) -> Result<(), Error> {
        self.require_idle()?;
        if on {
            self.acq.with_radio(|r| r.update_mode(RfMode::Hf))?;
        }
        self.settings().direct_sampling = on;
        Ok(())
    }

    /// Whether direct sampling is forced.
    pub fn direct_sampling(&self) -> bool {
        self.settings().direct_sampling
    }

    /// Set both bias tees from a mask of [`BIAS_TEE_HF`] and
    /// [`BIAS_TEE_VHF`].
    pub fn set_bias_tee(&self, mask: u8) -> Result<(), Error> {
        self.acq.with_radio(|r| {
            r.set_bias_hf(mask & BIAS_TEE_HF != 0)?;
            r.set_bias_vhf(mask & BIAS_TEE_VHF != 0)
        })
    }

    /// The bias tee mask.
    pub fn bias_tee(&self) -> Result<u8, Error> {
        self.acq.with_radio(|r| {
            let mut mask = 0;
            if r.gpio_enabled(consts::gpio::BIAS_HF) {
                mask |= BIAS_TEE_HF;
            }
            if r.gpio_enabled(consts::gpio::BIAS_VHF) {
                mask |= BIAS_TEE_VHF;
            }
            Ok(mask)
        })
    }

    /// Enable or disable ADC dither.
    pub fn set_dither(&self, on: bool) -> Result<(), Error> {
        self.acq.with_radio(|r| r.set_dither(on))
    }

    /// Whether ADC dither is on.
    pub fn dither(&self) -> Result<bool, Error> {
        self.acq
            .with_radio(|r| Ok(r.gpio_enabled(consts::gpio::DITH)))
    }

    /// Enable or disable the ADC programmable gain stage.
    pub fn set_pga(&self, on: bool) -> Result<(), Error> {
        self.acq.with_radio(|r| r.set_pga(on))
    }

    /// Whether the ADC programmable gain stage is on.
    pub fn pga(&self) -> Result<bool, Error> {
        self.acq
            .with_radio(|r| Ok(r.gpio_enabled(consts::gpio::PGA_EN)))
    }

    /// Enable or disable the ADC output randomizer. The downconverter undoes
    /// it, so output samples don't change.
    pub fn set_randomizer(&self, on: bool) -> Result<(), Error> {
        self.acq.with_radio(|r| r.set_randomizer(on))?;
        self.acq.tuning().set_derandomize(on);
        Ok(())
    }

    /// Whether the ADC output randomizer is on.
    pub fn randomizer(&self) -> Result<bool, Error> {
        self.acq
            .with_radio(|r| Ok(r.gpio_enabled(consts::gpio::RANDO)))
    }

    /// Turn a status LED on or off.
    pub fn set_led(&self, led: Led, on: bool) -> Result<(), Error> {
        self.acq.with_radio(|r| r.set_led(led, on))
    }

    /// Set the ADC sampling clock. Only allowed while idle.
    pub fn set_adc_freq(&self, freq: u32) -> Result<(), Error> {
        self.require_idle()?;
        self.acq.with_radio(|r| r.update_adc_freq(freq))
    }

    /// The ADC sampling clock.
    pub fn adc_freq(&self) -> Result<u32, Error> {
        self.acq.with_radio(|r| Ok(r.adc_freq()))
    }

    /// Baseband samples per callback block at the current settings.
    pub fn block_len(&self) -> usize {
        let idx = self.settings().rate_idx;
        (self.acq.config().output_block(idx) / self.soft_decimation()).max(1)
    }

    /// Start streaming baseband samples, calling `callback` with every block
    /// of [`block_len`][Self::block_len] samples on a streaming thread.
    pub fn read_async<F>(&self, mut callback: F) -> Result<(), Error>
    where
        F: FnMut(&[Complex32]) + Send + 'static,
    {
        if self.raw {
            return Err(Error::Unsupported("raw handles"));
        }
        if self.acq.state() != SessionState::Idle {
            return Err(Error::Busy);
        }
        let idx = self.settings().rate_idx;
        let factor = self.soft_decimation();
        if factor == 1 {
            return self.acq.start(idx, callback);
        }

        let block = self.block_len();
        let mut decimator = SoftDecimator::new(factor)?;
        let mut staged = Vec::with_capacity(block * 2);
        info!("Extra decimation by {factor} after the downconverter");
        self.acq.start(idx, move |input: &[Complex32]| {
            decimator.process(input, &mut staged);
            let mut sent = 0;
            while staged.len() - sent >= block {
                callback(&staged[sent..sent + block]);
                sent += block;
            }
            staged.drain(..sent);
        })
    }

    /// Start streaming raw ADC samples, bypassing the downconverter.
    pub fn read_async_raw<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnMut(&[i16]) + Send + 'static,
    {
        if self.acq.state() != SessionState::Idle {
            return Err(Error::Busy);
        }
        self.acq.start_raw(callback)
    }

    /// Stop a running stream. Fails with [`Error::Busy`] if nothing is
    /// running.
    pub fn cancel_async(&self) -> Result<StatsSnapshot, Error> {
        if self.acq.state() != SessionState::Running {
            return Err(Error::Busy);
        }
        self.acq.stop()
    }

    /// Stop streaming from any non-idle state, including after a transport
    /// failure.
    pub fn stop_async(&self) -> Result<StatsSnapshot, Error> {
        self.acq.stop()
    }

    /// Current streaming state.
    pub fn state(&self) -> SessionState {
        self.acq.state()
    }

    /// A handle for stopping the stream from the callback or another thread.
    pub fn canceler(&self) -> Canceler {
        self.acq.canceler()
    }

    /// Latest streaming statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.acq.stats()
    }
}
