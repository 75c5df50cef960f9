//! The seam between the radio logic and whatever moves bytes to the FX3.
//!
//! [`UsbTransport`][crate::usb::UsbTransport] talks to real hardware and
//! [`SimulatedDevice`][crate::sim::SimulatedDevice] stands in for it in tests.

use crate::Error;
use crate::consts::{ArgId, Fx3Command};

/// Hardware identification returned by [`Fx3Command::TestFx3`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct HardwareInfo {
    /// Raw model number, see [`RadioModel`][crate::RadioModel].
    pub model: u8,
    /// Firmware major version.
    pub fw_major: u8,
    /// Firmware minor version.
    pub fw_minor: u8,
    /// Unused.
    pub reserved: u8,
}

impl HardwareInfo {
    /// Firmware version packed as `major << 8 | minor`.
    pub fn firmware(&self) -> u16 {
        ((self.fw_major as u16) << 8) | self.fw_minor as u16
    }
}

/// Access to the FX3 controller.
///
/// Every method blocks until the device answers. Implementations are shared
/// between the tuning caller and the streaming producer, so they handle their
/// own synchronization.
pub trait Transport: Send + Sync {
    /// Send a vendor command with an optional payload.
    fn control(&self, cmd: Fx3Command, data: &[u8]) -> Result<(), Error>;

    /// Set a tuner or front-end argument.
    fn set_argument(&self, arg: ArgId, value: u16) -> Result<(), Error>;

    /// Read back the model and firmware version.
    fn hardware_info(&self) -> Result<HardwareInfo, Error>;

    /// Prepare for streaming with `depth` in-flight transfers of
    /// `transfer_samples` ADC samples each.
    fn start_stream(&self, transfer_samples: usize, depth: usize) -> Result<(), Error>;

    /// Fill `out` with the next transfer of raw ADC samples.
    fn read_block(&self, out: &mut [i16]) -> Result<(), Error>;

    /// Cancel outstanding transfers.
    fn stop_stream(&self) -> Result<(), Error>;

    /// Read the firmware debug console into `buf`, returning the byte count.
    fn read_debug_trace(&self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Send a vendor command carrying a little-endian `u32`.
    fn control_u32(&self, cmd: Fx3Command, val: u32) -> Result<(), Error> {
        self.control(cmd, &val.to_le_bytes())
    }

    /// Send a vendor command carrying a little-endian `u64`.
    fn control_u64(&self, cmd: Fx3Command, val: u64) -> Result<(), Error> {
        self.control(cmd, &val.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_wire_format() {
        let info: HardwareInfo = bytemuck::pod_read_unaligned(&[4u8, 2, 3, 0]);
        assert_eq!(info.model, 4);
        assert_eq!(info.firmware(), 0x0203);
    }
}
