/*!
Debug operations for an SDDC receiver.

The FX3 firmware keeps a small text console of its own, and accepts raw
front-end arguments and commands that the normal controls wrap up. These are
reached through the [`Debug`][struct@Debug] struct, which borrows the receiver
with [`Sddc::debug`]:

```no_run

# use anyhow::Result;
# fn main() -> Result<()> {

let sddc = sddc::Sddc::open(0)?;
let debug = sddc.debug();

// Dump whatever the firmware has logged since power-up.
print!("{}", debug.trace()?);
println!("GPIO word: 0x{:05x}", debug.gpios()?);

# Ok(())
# }
```

 */

use tracing::warn;

use crate::acquisition::SessionState;
use crate::consts::{ArgId, Fx3Command};
use crate::transport::HardwareInfo;
use crate::{Error, Sddc};

/// Bytes requested per debug console read.
const TRACE_CHUNK: usize = 64;
/// Upper bound on console reads in one [`Debug::trace`] call.
const TRACE_MAX_READS: usize = 256;

/// Debug operations for an SDDC receiver.
///
/// Register-level writes go through the same lock as tuning, so they can't
/// interleave with a frequency or gain change half way through.
pub struct Debug<'a> {
    inner: &'a Sddc,
}

impl<'a> Debug<'a> {
    pub(crate) fn new(inner: &'a Sddc) -> Debug<'a> {
        Self { inner }
    }

    /// Read one chunk of the firmware debug console into `buf`, returning how
    /// many bytes were filled. 0 means the console is empty.
    pub fn read_trace(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.inner
            .acquisition()
            .with_radio(|r| r.core().transport().read_debug_trace(buf))
    }

    /// Drain the firmware debug console.
    pub fn trace(&self) -> Result<String, Error> {
        let mut out = Vec::new();
        let mut buf = [0u8; TRACE_CHUNK];
        for _ in 0..TRACE_MAX_READS {
            let n = self.read_trace(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// The GPIO word last sent to the firmware.
    pub fn gpios(&self) -> Result<u32, Error> {
        self.inner
            .acquisition()
            .with_radio(|r| Ok(r.core().gpios()))
    }

    /// Replace the GPIO bits in `mask` with `bits`.
    pub fn write_gpios(&self, mask: u32, bits: u32) -> Result<(), Error> {
        self.inner
            .acquisition()
            .with_radio(|r| r.core_mut().replace_gpio(mask, bits))
    }

    /// Send a raw front-end argument.
    pub fn set_argument(&self, arg: ArgId, value: u16) -> Result<(), Error> {
        self.inner
            .acquisition()
            .with_radio(|r| r.core().transport().set_argument(arg, value))
    }

    /// Read the model and firmware identification straight from the device.
    pub fn hardware_info(&self) -> Result<HardwareInfo, Error> {
        self.inner
            .acquisition()
            .with_radio(|r| r.core().transport().hardware_info())
    }

    /// Reset the FX3. The device drops off the bus and the handle is useless
    /// afterwards. Only allowed while idle.
    pub fn reset_fx3(&self) -> Result<(), Error> {
        let state = self.inner.state();
        if state != SessionState::Idle {
            return Err(Error::State(state));
        }
        warn!("Resetting the FX3 controller");
        self.inner
            .acquisition()
            .with_radio(|r| r.core().transport().control(Fx3Command::ResetFx3, &[]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ControlRecord;
    use crate::{RadioModel, SimulatedDevice};
    use std::sync::Arc;

    fn open() -> (Arc<SimulatedDevice>, Sddc) {
        let sim = Arc::new(SimulatedDevice::new(RadioModel::Rx888r3));
        let sddc = Sddc::from_transport(sim.clone()).unwrap();
        (sim, sddc)
    }

    #[test]
    fn trace_drains_console() {
        let (sim, sddc) = open();
        let text = "x".repeat(150) + "\nready\n";
        sim.push_debug_trace(&text);
        assert_eq!(sddc.debug().trace().unwrap(), text);
        assert_eq!(sddc.debug().trace().unwrap(), "");
    }

    #[test]
    fn raw_writes_reach_the_device() {
        let (sim, sddc) = open();
        let debug = sddc.debug();
        debug.write_gpios(0xff, 0x41).unwrap();
        assert_eq!(debug.gpios().unwrap() & 0xff, 0x41);
        assert_eq!(sim.gpios() & 0xff, 0x41);

        sim.clear_log();
        debug.set_argument(ArgId::Preselector, 2).unwrap();
        debug.reset_fx3().unwrap();
        assert_eq!(
            sim.control_log(),
            vec![
                ControlRecord::Argument(ArgId::Preselector, 2),
                ControlRecord::Command(Fx3Command::ResetFx3, vec![]),
            ]
        );
        assert_eq!(debug.hardware_info().unwrap().model, RadioModel::Rx888r3 as u8);
    }
}
