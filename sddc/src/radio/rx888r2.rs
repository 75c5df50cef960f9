use tracing::debug;

use super::{MAX_TUNER_FREQ_HZ, Radio, RadioCore, RadioModel, RfMode, StepTable, steps};
use crate::Error;
use crate::consts::{self, ArgId, Fx3Command, gpio};

/// AD8370 code used on the HF amplifier while the tuner path is active.
const VHF_PASSTHROUGH_GAIN: u16 = 0x80 | 3;

/// Upper edges of the mkIII VHF preselector bands.
const PRESELECTOR_BANDS: [u64; 3] = [64_000_000, 128_000_000, 256_000_000];

/// RX888 mkII and mkIII.
///
/// HF goes through a 0.5 dB step attenuator and an AD8370 amplifier. VHF goes
/// through an R828D tuner, and the mkIII adds a switched preselector in front
/// of it.
pub struct Rx888r2 {
    core: RadioCore,
    hf_rf: StepTable,
    hf_if: StepTable,
    vhf_rf: StepTable,
    vhf_if: StepTable,
}

impl Rx888r2 {
    pub(crate) fn new(core: RadioCore) -> Self {
        Self {
            core,
            hf_rf: steps::dat31(64),
            hf_if: steps::ad8370(),
            vhf_rf: steps::r82xx_rf(),
            vhf_if: steps::r82xx_if(),
        }
    }

    fn has_preselector(&self) -> bool {
        self.core.model == RadioModel::Rx888r3
    }

    fn preselector_band(freq: u64) -> u16 {
        PRESELECTOR_BANDS
            .iter()
            .position(|&edge| freq < edge)
            .unwrap_or(PRESELECTOR_BANDS.len()) as u16
    }
}

impl Radio for Rx888r2 {
    fn name(&self) -> &'static str {
        if self.has_preselector() {
            "RX888 mkIII"
        } else {
            "RX888 mkII"
        }
    }

    fn gain_factor(&self) -> f32 {
        consts::RX888MK2_GAINFACTOR
    }

    fn prepare_lo(&self, freq: u64) -> RfMode {
        super::split_at_nyquist(freq, self.core.adc_freq, MAX_TUNER_FREQ_HZ)
    }

    fn program_mode(&mut self, mode: RfMode) -> Result<(), Error> {
        let transport = self.core.transport.clone();
        match mode {
            RfMode::Vhf => {
                // Park the HF input at full attenuation before switching over.
                self.update_att_rf(0)?;
                self.core.set_gpio(gpio::VHF_EN)?;
                transport.set_argument(ArgId::Ad8370Vga, VHF_PASSTHROUGH_GAIN)?;
                transport.control_u32(Fx3Command::TunerInit, consts::R82XX_REF_FREQ)
            }
            RfMode::Hf => {
                transport.control(Fx3Command::TunerStandby, &[])?;
                self.core.unset_gpio(gpio::VHF_EN)
            }
            RfMode::NoMode => Err(Error::InvalidParameter("cannot switch to no RF mode")),
        }
    }

    fn tune_lo(&mut self, freq: u64) -> Result<u64, Error> {
        if !self.core.mode_is_vhf() {
            return Ok(0);
        }
        if self.has_preselector() {
            let band = Self::preselector_band(freq);
            debug!("Preselector band {band} for {freq} Hz");
            self.core
                .transport
                .set_argument(ArgId::Preselector, band)?;
        }
        self.core.transport.control_u64(Fx3Command::TunerTune, freq)?;
        Ok(super::quantize(freq, self.lo_grid_hz()))
    }

    fn rf_steps(&self) -> &StepTable {
        if self.core.mode_is_vhf() {
            &self.vhf_rf
        } else {
            &self.hf_rf
        }
    }

    fn if_steps(&self) -> &StepTable {
        if self.core.mode_is_vhf() {
            &self.vhf_if
        } else {
            &self.hf_if
        }
    }

    fn update_att_rf(&mut self, idx: usize) -> Result<(), Error> {
        if self.core.mode_is_vhf() {
            let idx = idx.min(self.vhf_rf.len() - 1);
            self.core
                .transport
                .set_argument(ArgId::R82xxAttenuator, idx as u16)
        } else {
            let idx = idx.min(self.hf_rf.len() - 1);
            // The attenuator counts attenuation, the table counts gain.
            let code = (self.hf_rf.len() - 1 - idx) as u16;
            self.core.transport.set_argument(ArgId::Dat31Att, code)
        }
    }

    fn update_gain_if(&mut self, idx: usize) -> Result<(), Error> {
        if self.core.mode_is_vhf() {
            let idx = idx.min(self.vhf_if.len() - 1);
            self.core.transport.set_argument(ArgId::R82xxVga, idx as u16)
        } else {
            self.core
                .transport
                .set_argument(ArgId::Ad8370Vga, steps::ad8370_code(idx))
        }
    }

    fn core(&self) -> &RadioCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RadioCore {
        &mut self.core
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sim::{ControlRecord, SimulatedDevice};

    fn radio(model: RadioModel) -> (Arc<SimulatedDevice>, Rx888r2) {
        let sim = Arc::new(SimulatedDevice::new(model));
        let core = RadioCore::new(sim.clone(), model, 0x0201);
        (sim, Rx888r2::new(core))
    }

    #[test]
    fn hf_controls() {
        let (sim, mut r) = radio(RadioModel::Rx888r2);
        r.update_mode(RfMode::Hf).unwrap();
        assert_eq!(r.rf_steps().len(), 64);
        assert_eq!(r.if_steps().len(), 127);
        sim.clear_log();
        r.update_att_rf(63).unwrap();
        r.update_att_rf(0).unwrap();
        r.update_gain_if(20).unwrap();
        assert_eq!(
            sim.control_log(),
            vec![
                ControlRecord::Argument(ArgId::Dat31Att, 0),
                ControlRecord::Argument(ArgId::Dat31Att, 63),
                ControlRecord::Argument(ArgId::Ad8370Vga, 0x80 | 5),
            ]
        );
    }

    #[test]
    fn switching_to_vhf() {
        let (sim, mut r) = radio(RadioModel::Rx888r2);
        r.update_mode(RfMode::Vhf).unwrap();
        let log = sim.control_log();
        assert_eq!(log[0], ControlRecord::Argument(ArgId::Dat31Att, 63));
        assert_eq!(
            log[2],
            ControlRecord::Argument(ArgId::Ad8370Vga, VHF_PASSTHROUGH_GAIN)
        );
        assert_eq!(
            log[3],
            ControlRecord::Command(
                Fx3Command::TunerInit,
                consts::R82XX_REF_FREQ.to_le_bytes().to_vec()
            )
        );
        assert_eq!(sim.gpios() & gpio::VHF_EN, gpio::VHF_EN);
        assert_eq!(r.rf_steps().len(), 29);
        assert_eq!(r.if_steps().len(), 16);

        r.update_mode(RfMode::Hf).unwrap();
        assert_eq!(sim.gpios() & gpio::VHF_EN, 0);
    }

    #[test]
    fn mk3_sets_preselector() {
        let (sim, mut r) = radio(RadioModel::Rx888r3);
        assert_eq!(r.name(), "RX888 mkIII");
        r.update_mode(RfMode::Vhf).unwrap();
        sim.clear_log();
        r.tune_lo(100_000_000).unwrap();
        assert_eq!(
            sim.control_log()[0],
            ControlRecord::Argument(ArgId::Preselector, 1)
        );
        assert_eq!(Rx888r2::preselector_band(40_000_000), 0);
        assert_eq!(Rx888r2::preselector_band(900_000_000), 3);
    }

    #[test]
    fn mk2_has_no_preselector() {
        let (sim, mut r) = radio(RadioModel::Rx888r2);
        r.update_mode(RfMode::Vhf).unwrap();
        sim.clear_log();
        r.tune_lo(100_000_000).unwrap();
        assert!(matches!(
            sim.control_log()[0],
            ControlRecord::Command(Fx3Command::TunerTune, _)
        ));
    }
}
