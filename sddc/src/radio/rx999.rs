use super::{MAX_TUNER_FREQ_HZ, Radio, RadioCore, RfMode, StepTable, steps};
use crate::Error;
use crate::consts::{self, ArgId, Fx3Command, gpio};

/// LO step of the RX999 synthesizer.
const RX999_LO_GRID_HZ: f64 = 1_000.0;

/// RX999. Both paths share one AD8370 IF amplifier and there is no RF
/// attenuator.
pub struct Rx999 {
    core: RadioCore,
    if_steps: StepTable,
}

impl Rx999 {
    pub(crate) fn new(core: RadioCore) -> Self {
        Self {
            core,
            if_steps: steps::ad8370(),
        }
    }
}

impl Radio for Rx999 {
    fn name(&self) -> &'static str {
        "RX999"
    }

    fn gain_factor(&self) -> f32 {
        consts::RX888_GAINFACTOR
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
        let lo = super::quantize(freq, RX999_LO_GRID_HZ);
        self.core.transport.control_u64(Fx3Command::TunerTune, lo)?;
        Ok(lo)
    }

    fn lo_grid_hz(&self) -> f64 {
        RX999_LO_GRID_HZ
    }

    fn if_steps(&self) -> &StepTable {
        &self.if_steps
    }

    fn update_gain_if(&mut self, idx: usize) -> Result<(), Error> {
        self.core
            .transport
            .set_argument(ArgId::Ad8370Vga, steps::ad8370_code(idx))
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
    use crate::radio::RadioModel;
    use crate::sim::{ControlRecord, SimulatedDevice};

    #[test]
    fn if_gain_in_both_paths() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx999));
        let mut r = Rx999::new(RadioCore::new(sim.clone(), RadioModel::Rx999, 0x0201));
        assert!(r.rf_steps().is_empty());
        assert!(matches!(r.update_att_rf(0), Err(Error::Unsupported(_))));
        for mode in [RfMode::Hf, RfMode::Vhf] {
            r.update_mode(mode).unwrap();
            assert_eq!(r.if_steps().len(), 127);
            sim.clear_log();
            r.update_gain_if(0).unwrap();
            assert_eq!(
                sim.control_log(),
                vec![ControlRecord::Argument(ArgId::Ad8370Vga, 1)]
            );
        }
        sim.clear_log();
        assert_eq!(r.tune_lo(145_000_499).unwrap(), 145_000_000);
        assert_eq!(
            sim.control_log(),
            vec![ControlRecord::Command(
                Fx3Command::TunerTune,
                145_000_000u64.to_le_bytes().to_vec()
            )]
        );
    }
}
