//! Front-end control for each SDDC board family.
//!
//! Every board implements [`Radio`]. The concrete type is picked at open time
//! by [`create_radio`] from the model number the firmware reports, so callers
//! only ever hold a `Box<dyn Radio>`.
//!
//! A radio works in one of two RF paths: HF, where the ADC samples the antenna
//! directly, and VHF, where a tuner chip mixes the signal down to a fixed IF
//! first. [`Radio::prepare_lo`] tells which path a frequency needs, and
//! [`Radio::tune_lo`] programs the tuner and reports where it actually landed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::Error;
use crate::consts::{self, Fx3Command, gpio};
use crate::transport::Transport;

mod bbrf103;
mod dummy;
mod hf103;
mod lucy;
mod rx888r2;
mod rx999;
mod steps;

pub use bbrf103::Bbrf103;
pub use dummy::Dummy;
pub use hf103::Hf103;
pub use lucy::Lucy;
pub use rx888r2::Rx888r2;
pub use rx999::Rx999;
pub use steps::StepTable;

/// Lowest frequency any board can receive.
pub const MIN_FREQ_HZ: u64 = 10_000;
/// Highest frequency the R8xx tuner path can receive.
pub const MAX_TUNER_FREQ_HZ: u64 = 1_750_000_000;

/// Board model, as reported by the firmware.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RadioModel {
    NoRadio = 0,
    Bbrf103 = 1,
    Hf103 = 2,
    Rx888 = 3,
    Rx888r2 = 4,
    Rx999 = 5,
    RxLucy = 6,
    Rx888r3 = 7,
}

impl RadioModel {
    /// Decode a raw model number. Unknown numbers give `None`.
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::NoRadio,
            1 => Self::Bbrf103,
            2 => Self::Hf103,
            3 => Self::Rx888,
            4 => Self::Rx888r2,
            5 => Self::Rx999,
            6 => Self::RxLucy,
            7 => Self::Rx888r3,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RadioModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoRadio => "no radio",
            Self::Bbrf103 => "BBRF103",
            Self::Hf103 => "HF103",
            Self::Rx888 => "RX888",
            Self::Rx888r2 => "RX888 mkII",
            Self::Rx999 => "RX999",
            Self::RxLucy => "RX-Lucy",
            Self::Rx888r3 => "RX888 mkIII",
        })
    }
}

/// Which RF path the radio is using.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RfMode {
    /// Not configured, or the frequency can't be received.
    #[default]
    NoMode,
    /// Direct sampling of the HF antenna input.
    Hf,
    /// Tuner path.
    Vhf,
}

impl std::fmt::Display for RfMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMode => f.write_str("no mode"),
            Self::Hf => f.write_str("HF"),
            Self::Vhf => f.write_str("VHF"),
        }
    }
}

/// One of the status LEDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Led {
    Yellow,
    Red,
    Blue,
}

impl Led {
    fn mask(self) -> u32 {
        match self {
            Self::Yellow => gpio::LED_YELLOW,
            Self::Red => gpio::LED_RED,
            Self::Blue => gpio::LED_BLUE,
        }
    }
}

/// State shared by every radio implementation: the transport handle and the
/// GPIO word the firmware was last sent.
///
/// Dropping the core puts the board into shutdown.
pub struct RadioCore {
    transport: Arc<dyn Transport>,
    model: RadioModel,
    firmware: u16,
    gpios: u32,
    mode: RfMode,
    adc_freq: u32,
}

impl RadioCore {
    /// Wrap a transport for a board of the given model and firmware.
    pub fn new(transport: Arc<dyn Transport>, model: RadioModel, firmware: u16) -> Self {
        Self {
            transport,
            model,
            firmware,
            gpios: 0,
            mode: RfMode::NoMode,
            adc_freq: consts::DEFAULT_ADC_FREQ,
        }
    }

    /// The transport this radio talks through.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Current GPIO word.
    pub fn gpios(&self) -> u32 {
        self.gpios
    }

    /// Raise the bits in `mask` and send the GPIO word.
    pub fn set_gpio(&mut self, mask: u32) -> Result<(), Error> {
        self.gpios |= mask;
        self.write_gpios()
    }

    /// Clear the bits in `mask` and send the GPIO word.
    pub fn unset_gpio(&mut self, mask: u32) -> Result<(), Error> {
        self.gpios &= !mask;
        self.write_gpios()
    }

    /// Replace the bits in `mask` with `bits` and send the GPIO word.
    pub fn replace_gpio(&mut self, mask: u32, bits: u32) -> Result<(), Error> {
        self.gpios = (self.gpios & !mask) | (bits & mask);
        self.write_gpios()
    }

    fn write_gpios(&self) -> Result<(), Error> {
        debug!("GPIO <- 0x{:05x}", self.gpios);
        self.transport.control_u32(Fx3Command::GpioFx3, self.gpios)
    }

    fn mode_is_vhf(&self) -> bool {
        self.mode == RfMode::Vhf
    }
}

impl Drop for RadioCore {
    fn drop(&mut self) {
        if let Err(e) = self.set_gpio(gpio::SHDWN) {
            debug!("Couldn't put radio into shutdown: {e}");
        }
    }
}

/// Control interface for one SDDC board.
///
/// The required methods hold the board-specific register sequences. The
/// provided ones cover the GPIO-driven features every board shares.
pub trait Radio: Send {
    /// Human readable board name.
    fn name(&self) -> &'static str;

    /// Fixed analog gain factor used to normalize output samples.
    fn gain_factor(&self) -> f32 {
        consts::BBRF103_GAINFACTOR
    }

    /// Pick the RF path needed to receive `freq`. Frequencies the board
    /// can't receive give [`RfMode::NoMode`].
    fn prepare_lo(&self, freq: u64) -> RfMode;

    /// Program the board-specific register sequence for a path change.
    /// Callers use [`update_mode`][Self::update_mode] instead.
    fn program_mode(&mut self, mode: RfMode) -> Result<(), Error>;

    /// Tune to `freq`, returning the frequency the hardware actually centered
    /// on. In the HF path there is no LO and this returns 0.
    fn tune_lo(&mut self, freq: u64) -> Result<u64, Error>;

    /// Spacing of the frequencies [`tune_lo`][Self::tune_lo] can land on in
    /// the tuner path.
    fn lo_grid_hz(&self) -> f64 {
        consts::R82XX_REF_FREQ as f64 / 65536.0
    }

    /// IF the tuner path places the tuned frequency on.
    fn tuner_if_hz(&self) -> u64 {
        consts::R82XX_IF_CARRIER as u64
    }

    /// RF attenuation settings for the current path.
    fn rf_steps(&self) -> &StepTable {
        StepTable::empty()
    }

    /// IF gain settings for the current path.
    fn if_steps(&self) -> &StepTable {
        StepTable::empty()
    }

    /// Apply the RF attenuation setting at `idx` of [`rf_steps`][Self::rf_steps].
    fn update_att_rf(&mut self, idx: usize) -> Result<(), Error> {
        let _ = idx;
        Err(Error::Unsupported(self.name()))
    }

    /// Apply the IF gain setting at `idx` of [`if_steps`][Self::if_steps].
    fn update_gain_if(&mut self, idx: usize) -> Result<(), Error> {
        let _ = idx;
        Err(Error::Unsupported(self.name()))
    }

    /// Shared state.
    fn core(&self) -> &RadioCore;

    /// Shared state, mutably.
    fn core_mut(&mut self) -> &mut RadioCore;

    /// Board model.
    fn model(&self) -> RadioModel {
        self.core().model
    }

    /// Firmware version, packed as `major << 8 | minor`.
    fn firmware(&self) -> u16 {
        self.core().firmware
    }

    /// Current RF path.
    fn mode(&self) -> RfMode {
        self.core().mode
    }

    /// Current ADC sampling clock.
    fn adc_freq(&self) -> u32 {
        self.core().adc_freq
    }

    /// Switch RF path. Nothing is sent if the path doesn't change.
    fn update_mode(&mut self, mode: RfMode) -> Result<(), Error> {
        if mode == RfMode::NoMode {
            return Err(Error::InvalidParameter("cannot switch to no RF mode"));
        }
        if self.mode() == mode {
            return Ok(());
        }
        debug!("{}: switching to {} mode", self.name(), mode);
        self.program_mode(mode)?;
        self.core_mut().mode = mode;
        Ok(())
    }

    /// Program the ADC sampling clock.
    fn update_adc_freq(&mut self, freq: u32) -> Result<(), Error> {
        if !(consts::MIN_ADC_FREQ..=consts::MAX_ADC_FREQ).contains(&freq) {
            return Err(Error::ValueRange {
                range: consts::MIN_ADC_FREQ..consts::MAX_ADC_FREQ + 1,
                val: freq,
            });
        }
        self.core()
            .transport
            .control_u32(Fx3Command::StartAdc, freq)?;
        self.core_mut().adc_freq = freq;
        Ok(())
    }

    /// Enable or disable the HF antenna bias tee.
    fn set_bias_hf(&mut self, on: bool) -> Result<(), Error> {
        self.set_flag(gpio::BIAS_HF, on)
    }

    /// Enable or disable the VHF antenna bias tee.
    fn set_bias_vhf(&mut self, on: bool) -> Result<(), Error> {
        self.set_flag(gpio::BIAS_VHF, on)
    }

    /// Turn a status LED on or off.
    fn set_led(&mut self, led: Led, on: bool) -> Result<(), Error> {
        self.set_flag(led.mask(), on)
    }

    /// Enable or disable ADC dither.
    fn set_dither(&mut self, on: bool) -> Result<(), Error> {
        self.set_flag(gpio::DITH, on)
    }

    /// Enable or disable the ADC programmable gain stage.
    fn set_pga(&mut self, on: bool) -> Result<(), Error> {
        self.set_flag(gpio::PGA_EN, on)
    }

    /// Enable or disable the ADC output randomizer. The downconverter has to
    /// be told to undo it.
    fn set_randomizer(&mut self, on: bool) -> Result<(), Error> {
        self.set_flag(gpio::RANDO, on)
    }

    /// Whether all bits of `mask` are raised in the GPIO word.
    fn gpio_enabled(&self, mask: u32) -> bool {
        self.core().gpios & mask == mask
    }

    /// Raise or clear GPIO bits.
    fn set_flag(&mut self, mask: u32, on: bool) -> Result<(), Error> {
        if on {
            self.core_mut().set_gpio(mask)
        } else {
            self.core_mut().unset_gpio(mask)
        }
    }
}

/// Pick between HF and the tuner path the way most boards do: HF below the
/// ADC Nyquist frequency, tuner above it up to `max`.
fn split_at_nyquist(freq: u64, adc_freq: u32, max: u64) -> RfMode {
    if freq < MIN_FREQ_HZ || freq > max {
        RfMode::NoMode
    } else if freq >= adc_freq as u64 / 2 {
        RfMode::Vhf
    } else {
        RfMode::Hf
    }
}

/// Round `freq` to the nearest multiple of `grid`.
fn quantize(freq: u64, grid: f64) -> u64 {
    ((freq as f64 / grid).round() * grid).round() as u64
}

/// Check the firmware version reported by the device.
pub fn check_firmware(firmware: u16) -> Result<(), Error> {
    let needed = ((consts::FIRMWARE_VER_MAJOR as u16) << 8) | consts::FIRMWARE_VER_MINOR as u16;
    let major = (firmware >> 8) as u8;
    let minor = (firmware & 0xff) as u8;
    if major != consts::FIRMWARE_VER_MAJOR || minor < consts::FIRMWARE_VER_MINOR {
        Err(Error::Firmware {
            needed,
            actual: firmware,
        })
    } else {
        Ok(())
    }
}

/// Read the model and firmware back from the device and build the matching
/// radio.
///
/// Fails if the firmware isn't compatible. Unknown model numbers get a
/// [`Dummy`] radio that can stream but not tune.
pub fn create_radio(transport: Arc<dyn Transport>) -> Result<Box<dyn Radio>, Error> {
    let hw = transport.hardware_info()?;
    let firmware = hw.firmware();
    check_firmware(firmware)?;
    let model = RadioModel::from_raw(hw.model);
    let core = |model| RadioCore::new(transport.clone(), model, firmware);
    let radio: Box<dyn Radio> = match model {
        Some(RadioModel::Bbrf103) => Box::new(Bbrf103::new(core(RadioModel::Bbrf103))),
        Some(RadioModel::Rx888) => Box::new(Bbrf103::new(core(RadioModel::Rx888))),
        Some(RadioModel::Rx888r2) => Box::new(Rx888r2::new(core(RadioModel::Rx888r2))),
        Some(RadioModel::Rx888r3) => Box::new(Rx888r2::new(core(RadioModel::Rx888r3))),
        Some(RadioModel::Rx999) => Box::new(Rx999::new(core(RadioModel::Rx999))),
        Some(RadioModel::Hf103) => Box::new(Hf103::new(core(RadioModel::Hf103))),
        Some(RadioModel::RxLucy) => Box::new(Lucy::new(core(RadioModel::RxLucy))),
        Some(RadioModel::NoRadio) | None => {
            warn!("No SDR front end detected (model {})", hw.model);
            Box::new(Dummy::new(core(RadioModel::NoRadio)))
        }
    };
    info!("{} | firmware {:x}", radio.name(), firmware);
    Ok(radio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ControlRecord, SimulatedDevice};

    fn open(model: RadioModel) -> (Arc<SimulatedDevice>, Box<dyn Radio>) {
        let sim = Arc::new(SimulatedDevice::new(model));
        let radio = create_radio(sim.clone()).unwrap();
        (sim, radio)
    }

    #[test]
    fn factory_picks_variant() {
        for (model, name) in [
            (RadioModel::Bbrf103, "BBRF103"),
            (RadioModel::Rx888, "RX888"),
            (RadioModel::Rx888r2, "RX888 mkII"),
            (RadioModel::Rx888r3, "RX888 mkIII"),
            (RadioModel::Rx999, "RX999"),
            (RadioModel::Hf103, "HF103"),
            (RadioModel::RxLucy, "Lucy"),
            (RadioModel::NoRadio, "Dummy"),
        ] {
            let (_sim, radio) = open(model);
            assert_eq!(radio.name(), name);
            assert_eq!(radio.model(), model);
            assert_eq!(radio.firmware(), 0x0201);
        }
    }

    #[test]
    fn firmware_mismatch_is_fatal() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r2).with_firmware(1, 9));
        match create_radio(sim.clone()) {
            Err(Error::Firmware { needed, actual }) => {
                assert_eq!(needed, 0x0201);
                assert_eq!(actual, 0x0109);
            }
            _ => panic!("expected firmware error"),
        }
        // No radio was built, so nothing was sent.
        assert!(sim.control_log().is_empty());
        assert!(check_firmware(0x0205).is_ok());
        assert!(check_firmware(0x0200).is_err());
        assert!(check_firmware(0x0301).is_err());
    }

    #[test]
    fn drop_sends_shutdown() {
        let (sim, radio) = open(RadioModel::Rx888r2);
        drop(radio);
        assert_eq!(sim.gpios() & gpio::SHDWN, gpio::SHDWN);
    }

    #[test]
    fn gpio_flags_are_independent() {
        let (sim, mut radio) = open(RadioModel::Rx888r2);
        radio.set_bias_hf(true).unwrap();
        radio.set_bias_vhf(true).unwrap();
        radio.set_led(Led::Blue, true).unwrap();
        radio.set_bias_hf(false).unwrap();
        assert_eq!(sim.gpios(), gpio::BIAS_VHF | gpio::LED_BLUE);
        assert!(radio.gpio_enabled(gpio::BIAS_VHF));
        assert!(!radio.gpio_enabled(gpio::BIAS_HF));
        radio.set_dither(true).unwrap();
        radio.set_pga(true).unwrap();
        radio.set_randomizer(true).unwrap();
        assert_eq!(
            sim.gpios(),
            gpio::BIAS_VHF | gpio::LED_BLUE | gpio::DITH | gpio::PGA_EN | gpio::RANDO
        );
    }

    #[test]
    fn failed_write_is_an_error() {
        let (sim, mut radio) = open(RadioModel::Rx888r2);
        sim.disconnect();
        assert!(matches!(radio.set_bias_hf(true), Err(Error::Disconnected)));
        assert!(radio.update_mode(RfMode::Vhf).is_err());
        assert_eq!(radio.mode(), RfMode::NoMode);
    }

    #[test]
    fn adc_clock() {
        let (sim, mut radio) = open(RadioModel::Rx888r2);
        radio.update_adc_freq(128_000_000).unwrap();
        assert_eq!(sim.adc_freq(), 128_000_000);
        assert_eq!(radio.adc_freq(), 128_000_000);
        assert!(radio.update_adc_freq(1_000).is_err());
        assert_eq!(radio.prepare_lo(50_000_000), RfMode::Hf);
    }

    #[test]
    fn tuner_path_lands_within_grid() {
        for model in [
            RadioModel::Bbrf103,
            RadioModel::Rx888r2,
            RadioModel::Rx888r3,
            RadioModel::Rx999,
            RadioModel::RxLucy,
        ] {
            let (_sim, mut radio) = open(model);
            for f in [100_000_123u64, 145_678_901, 433_920_000, 1_000_000_007] {
                assert_eq!(radio.prepare_lo(f), RfMode::Vhf, "{model}");
                radio.update_mode(RfMode::Vhf).unwrap();
                let lo = radio.tune_lo(f).unwrap();
                let grid = radio.lo_grid_hz();
                assert!((f as f64 - lo as f64).abs() < grid, "{model} {f} {lo}");
            }
        }
    }

    #[test]
    fn mode_change_is_sent_once() {
        let (sim, mut radio) = open(RadioModel::Bbrf103);
        radio.update_mode(RfMode::Vhf).unwrap();
        let n = sim.control_log().len();
        radio.update_mode(RfMode::Vhf).unwrap();
        assert_eq!(sim.control_log().len(), n);
        assert!(
            sim.control_log()
                .iter()
                .any(|r| matches!(r, ControlRecord::Command(Fx3Command::TunerInit, _)))
        );
    }
}
