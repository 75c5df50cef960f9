use super::{MAX_TUNER_FREQ_HZ, Radio, RadioCore, RfMode, StepTable, steps};
use crate::Error;
use crate::consts::{self, ArgId, Fx3Command, gpio};

/// LO step of the Lucy synthesizer.
const LUCY_LO_GRID_HZ: f64 = 100_000.0;

/// RX-Lucy. A 1 dB step RF attenuator in front of both paths and a 0.5 dB
/// step IF gain stage after the mixer.
pub struct Lucy {
    core: RadioCore,
    rf_steps: StepTable,
    if_steps: StepTable,
}

impl Lucy {
    pub(crate) fn new(core: RadioCore) -> Self {
        Self {
            core,
            rf_steps: steps::whole_db_attenuator(16),
            if_steps: steps::half_db_gain(64),
        }
    }
}

impl Radio for Lucy {
    fn name(&self) -> &'static str {
        "Lucy"
    }

    fn gain_factor(&self) -> f32 {
        consts::HF103_GAINFACTOR
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
        let lo = super::quantize(freq, LUCY_LO_GRID_HZ);
        self.core.transport.control_u64(Fx3Command::TunerTune, lo)?;
        Ok(lo)
    }

    fn lo_grid_hz(&self) -> f64 {
        LUCY_LO_GRID_HZ
    }

    fn rf_steps(&self) -> &StepTable {
        &self.rf_steps
    }

    fn if_steps(&self) -> &StepTable {
        &self.if_steps
    }

    fn update_att_rf(&mut self, idx: usize) -> Result<(), Error> {
        let idx = idx.min(self.rf_steps.len() - 1);
        // Same DAT-31 part as the HF103, driven in whole dB steps.
        let code = ((self.rf_steps.len() - 1 - idx) * 2) as u16;
        self.core.transport.set_argument(ArgId::Dat31Att, code)
    }

    fn update_gain_if(&mut self, idx: usize) -> Result<(), Error> {
        let idx = idx.min(self.if_steps.len() - 1);
        let code = (self.if_steps.len() - 1 - idx) as u16;
        self.core.transport.set_argument(ArgId::VhfAttenuator, code)
    }

    fn core(&self) -> &RadioCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RadioCore {
        &mut self.core
    }
}
