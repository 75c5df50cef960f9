use super::{MIN_FREQ_HZ, Radio, RadioCore, RfMode, StepTable, steps};
use crate::Error;
use crate::consts::{self, ArgId};

/// HF103: direct sampling only, with a 0.5 dB step attenuator.
pub struct Hf103 {
    core: RadioCore,
    rf_steps: StepTable,
}

impl Hf103 {
    pub(crate) fn new(core: RadioCore) -> Self {
        Self {
            core,
            rf_steps: steps::dat31(64),
        }
    }
}

impl Radio for Hf103 {
    fn name(&self) -> &'static str {
        "HF103"
    }

    fn gain_factor(&self) -> f32 {
        consts::HF103_GAINFACTOR
    }

    fn prepare_lo(&self, freq: u64) -> RfMode {
        if freq < MIN_FREQ_HZ || freq >= self.core.adc_freq as u64 / 2 {
            RfMode::NoMode
        } else {
            RfMode::Hf
        }
    }

    fn program_mode(&mut self, mode: RfMode) -> Result<(), Error> {
        match mode {
            RfMode::Hf => Ok(()),
            _ => Err(Error::Unsupported("HF103 tuner path")),
        }
    }

    fn tune_lo(&mut self, _freq: u64) -> Result<u64, Error> {
        Ok(0)
    }

    fn rf_steps(&self) -> &StepTable {
        &self.rf_steps
    }

    fn update_att_rf(&mut self, idx: usize) -> Result<(), Error> {
        let idx = idx.min(self.rf_steps.len() - 1);
        let code = (self.rf_steps.len() - 1 - idx) as u16;
        self.core.transport.set_argument(ArgId::Dat31Att, code)
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
    fn hf_only() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Hf103));
        let mut r = Hf103::new(RadioCore::new(sim.clone(), RadioModel::Hf103, 0x0201));
        assert_eq!(r.prepare_lo(7_100_000), RfMode::Hf);
        assert_eq!(r.prepare_lo(145_000_000), RfMode::NoMode);
        assert_eq!(r.prepare_lo(5_000), RfMode::NoMode);
        assert!(r.update_mode(RfMode::Vhf).is_err());
        r.update_mode(RfMode::Hf).unwrap();
        assert_eq!(r.tune_lo(7_100_000).unwrap(), 0);
        r.update_att_rf(60).unwrap();
        assert_eq!(
            sim.control_log(),
            vec![ControlRecord::Argument(ArgId::Dat31Att, 3)]
        );
        assert!(r.update_gain_if(1).is_err());
    }
}
