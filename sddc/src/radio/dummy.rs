use super::{Radio, RadioCore, RfMode};
use crate::Error;

/// Stand-in for boards with no recognized front end. Streams the raw ADC but
/// has no gain controls.
pub struct Dummy {
    core: RadioCore,
}

impl Dummy {
    pub(crate) fn new(core: RadioCore) -> Self {
        Self { core }
    }
}

impl Radio for Dummy {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn prepare_lo(&self, _freq: u64) -> RfMode {
        RfMode::Hf
    }

    fn program_mode(&mut self, _mode: RfMode) -> Result<(), Error> {
        Ok(())
    }

    fn tune_lo(&mut self, freq: u64) -> Result<u64, Error> {
        if freq < self.core.adc_freq as u64 / 2 {
            Ok(0)
        } else {
            Ok(freq)
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
    use crate::radio::RadioModel;
    use crate::sim::SimulatedDevice;

    #[test]
    fn accepts_everything() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::NoRadio));
        let mut r = Dummy::new(RadioCore::new(sim.clone(), RadioModel::NoRadio, 0x0201));
        assert_eq!(r.prepare_lo(500_000_000), RfMode::Hf);
        r.update_mode(RfMode::Vhf).unwrap();
        assert_eq!(r.tune_lo(10_000_000).unwrap(), 0);
        assert_eq!(r.tune_lo(50_000_000).unwrap(), 50_000_000);
        assert!(r.rf_steps().is_empty());
        assert!(sim.control_log().is_empty());
    }
}
