//! Get information about an SDDC board.
//!
//! This module contains the [`Info`] struct for reading what a receiver is
//! and what it can do:
//!
//! - The board [name][Info::name] and [model][Info::model].
//! - The [firmware version][Info::firmware_version].
//! - The gain and attenuation [step tables][Info::rf_steps] for the current
//!   RF path.
//!
//! The general way to do this is:
//!
//! ```no_run
//!
//! # use anyhow::Result;
//! # fn main() -> Result<()> {
//!
//! let sddc = sddc::Sddc::open(0)?;
//! let info = sddc.info();
//!
//! println!("{} running firmware {}", info.model()?, info.firmware_version()?);
//! println!("RF attenuation steps: {:?}", info.rf_steps()?);
//!
//! # Ok(())
//! # }
//! ```
use crate::{Error, RadioModel, RfMode, Sddc};

/// A firmware version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    /// Major version. Only one major version is supported.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl From<u16> for FirmwareVersion {
    fn from(v: u16) -> Self {
        Self {
            major: (v >> 8) as u8,
            minor: (v & 0xff) as u8,
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// Identification and capability info for an SDDC receiver.
///
/// Borrows the receiver. Every call takes the radio lock briefly, so this can
/// be used while streaming.
pub struct Info<'a> {
    inner: &'a Sddc,
}

impl<'a> Info<'a> {
    pub(crate) fn new(inner: &'a Sddc) -> Info<'a> {
        Self { inner }
    }

    /// Human readable board name.
    pub fn name(&self) -> Result<&'static str, Error> {
        self.inner.name()
    }

    /// Board model as reported by the firmware.
    pub fn model(&self) -> Result<RadioModel, Error> {
        self.inner.model()
    }

    /// Firmware version.
    pub fn firmware_version(&self) -> Result<FirmwareVersion, Error> {
        Ok(self.inner.firmware()?.into())
    }

    /// Fixed analog gain factor of the board.
    pub fn gain_factor(&self) -> Result<f32, Error> {
        self.inner.acquisition().with_radio(|r| Ok(r.gain_factor()))
    }

    /// RF path currently selected.
    pub fn mode(&self) -> Result<RfMode, Error> {
        self.inner.acquisition().with_radio(|r| Ok(r.mode()))
    }

    /// Available RF attenuation settings in dB, lowest first.
    pub fn rf_steps(&self) -> Result<Vec<f32>, Error> {
        self.inner
            .acquisition()
            .with_radio(|r| Ok(r.rf_steps().as_slice().to_vec()))
    }

    /// Available IF gain settings in dB, lowest first.
    pub fn if_steps(&self) -> Result<Vec<f32>, Error> {
        self.inner
            .acquisition()
            .with_radio(|r| Ok(r.if_steps().as_slice().to_vec()))
    }

    /// Output sample rates available at the current ADC clock, by decimation
    /// index.
    pub fn sample_rates(&self) -> Result<Vec<f64>, Error> {
        (0..=crate::ddc::MAX_DECIMATION_IDX)
            .map(|idx| self.inner.acquisition().output_rate(idx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedDevice;
    use std::sync::Arc;

    #[test]
    fn version_format() {
        let v = FirmwareVersion::from(0x0201);
        assert_eq!(v.major, 2);
        assert_eq!(v.minor, 1);
        assert_eq!(v.to_string(), "2.01");
        assert!(FirmwareVersion::from(0x0203) > v);
    }

    #[test]
    fn reports_board() {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Hf103));
        let sddc = Sddc::from_transport(sim).unwrap();
        let info = sddc.info();
        assert_eq!(info.model().unwrap(), RadioModel::Hf103);
        assert_eq!(info.firmware_version().unwrap().to_string(), "2.01");
        assert_eq!(info.rf_steps().unwrap().len(), 64);
        assert!(info.if_steps().unwrap().is_empty());
        let rates = info.sample_rates().unwrap();
        assert_eq!(rates.first().copied(), Some(32e6));
        assert_eq!(rates.last().copied(), Some(2e6));
    }
}
