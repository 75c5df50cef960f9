use tracing::debug;

use super::{MAX_TUNER_FREQ_HZ, Radio, RadioCore, RadioModel, RfMode, StepTable, steps};
use crate::Error;
use crate::consts::{self, ArgId, Fx3Command, gpio};

/// BBRF103 and the original RX888.
///
/// HF goes through a three-position attenuator switched by GPIO. VHF goes
/// through an R820T2 tuner.
pub struct Bbrf103 {
    core: RadioCore,
    hf_rf: StepTable,
    vhf_rf: StepTable,
    vhf_if: StepTable,
}

impl Bbrf103 {
    pub(crate) fn new(core: RadioCore) -> Self {
        Self {
            core,
            hf_rf: steps::switched_attenuator(),
            vhf_rf: steps::r82xx_rf(),
            vhf_if: steps::r82xx_if(),
        }
    }

    fn hf_attenuator_bits(idx: usize) -> u32 {
        match idx {
            0 => gpio::ATT_SEL0,
            1 => gpio::ATT_SEL1,
            _ => gpio::ATT_SEL0 | gpio::ATT_SEL1,
        }
    }
}

impl Radio for Bbrf103 {
    fn name(&self) -> &'static str {
        match self.core.model {
            RadioModel::Rx888 => "RX888",
            _ => "BBRF103",
        }
    }

    fn gain_factor(&self) -> f32 {
        match self.core.model {
            RadioModel::Rx888 => consts::RX888_GAINFACTOR,
            _ => consts::BBRF103_GAINFACTOR,
        }
    }

    fn prepare_lo(&self, freq: u64) -> RfMode {
        super::split_at_nyquist(freq, self.core.adc_freq, MAX_TUNER_FREQ_HZ)
    }

    fn program_mode(&mut self, mode: RfMode) -> Result<(), Error> {
        match mode {
            RfMode::Vhf => {
                self.core.set_gpio(gpio::VHF_EN)?;
                self.core
                    .transport
                    .control_u32(Fx3Command::TunerInit, consts::R82XX_REF_FREQ)
            }
            RfMode::Hf => {
                self.core.transport.control(Fx3Command::TunerStandby, &[])?;
                self.core.unset_gpio(gpio::VHF_EN)
            }
            RfMode::NoMode => Err(Error::InvalidParameter("cannot switch to no RF mode")),
        }
    }

    fn tune_lo(&mut self, freq: u64) -> Result<u64, Error> {
        if !self.core.mode_is_vhf() {
            return Ok(0);
        }
        self.core.transport.control_u64(Fx3Command::TunerTune, freq)?;
        let lo = super::quantize(freq, self.lo_grid_hz());
        debug!("R820T2 tuned to {lo} Hz for {freq} Hz");
        Ok(lo)
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
            StepTable::empty()
        }
    }

    fn update_att_rf(&mut self, idx: usize) -> Result<(), Error> {
        if self.core.mode_is_vhf() {
            let idx = idx.min(self.vhf_rf.len() - 1);
            self.core
                .transport
                .set_argument(ArgId::R82xxAttenuator, idx as u16)
        } else {
            let bits = Self::hf_attenuator_bits(idx);
            self.core
                .replace_gpio(gpio::ATT_SEL0 | gpio::ATT_SEL1, bits)
        }
    }

    fn update_gain_if(&mut self, idx: usize) -> Result<(), Error> {
        if !self.core.mode_is_vhf() {
            return Err(Error::Unsupported("IF gain in HF mode"));
        }
        let idx = idx.min(self.vhf_if.len() - 1);
        self.core.transport.set_argument(ArgId::R82xxVga, idx as u16)
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

    fn radio(model: RadioModel) -> (Arc<SimulatedDevice>, Bbrf103) {
        let sim = Arc::new(SimulatedDevice::new(model));
        let core = RadioCore::new(sim.clone(), model, 0x0201);
        (sim, Bbrf103::new(core))
    }

    #[test]
    fn hf_attenuator_uses_gpio() {
        let (sim, mut r) = radio(RadioModel::Bbrf103);
        r.update_mode(RfMode::Hf).unwrap();
        assert_eq!(r.rf_steps().as_slice(), &[-20.0, -10.0, 0.0]);
        assert!(r.if_steps().is_empty());
        r.update_att_rf(2).unwrap();
        let sel = gpio::ATT_SEL0 | gpio::ATT_SEL1;
        assert_eq!(sim.gpios() & sel, sel);
        r.update_att_rf(1).unwrap();
        assert_eq!(sim.gpios() & sel, gpio::ATT_SEL1);
        assert!(r.update_gain_if(3).is_err());
        assert_eq!(r.tune_lo(10_000_000).unwrap(), 0);
    }

    #[test]
    fn vhf_uses_tuner_arguments() {
        let (sim, mut r) = radio(RadioModel::Rx888);
        assert_eq!(r.name(), "RX888");
        r.update_mode(RfMode::Vhf).unwrap();
        assert_eq!(sim.gpios() & gpio::VHF_EN, gpio::VHF_EN);
        assert_eq!(r.rf_steps().len(), 29);
        assert_eq!(r.if_steps().len(), 16);
        sim.clear_log();
        r.update_att_rf(40).unwrap();
        r.update_gain_if(5).unwrap();
        assert_eq!(
            sim.control_log(),
            vec![
                ControlRecord::Argument(ArgId::R82xxAttenuator, 28),
                ControlRecord::Argument(ArgId::R82xxVga, 5),
            ]
        );
    }
}
