//! FX3 access over USB with `nusb`.
//!
//! `nusb` transfers are futures. [`UsbTransport`] owns a single-threaded
//! tokio runtime and blocks on them, so the rest of the crate can stay
//! synchronous and read timeouts come from `tokio::time`.

use std::mem::size_of;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytemuck::Pod;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Queue, Recipient, RequestBuffer};
use tokio::runtime::Runtime;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::Error;
use crate::consts::{ArgId, FX3_STREAMER_PID, FX3_USB_VID, Fx3Command, RX_ENDPOINT_ADDRESS};
use crate::transport::{HardwareInfo, Transport};

/// How long a bulk read may take before it counts as failed.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// An SDDC device descriptor, which can be opened.
///
/// These are mostly returned from calling [`list_sddc_devices`], but can also
/// be formed by trying to convert a [`nusb::DeviceInfo`] into one.
pub struct SddcDescriptor {
    info: nusb::DeviceInfo,
}

impl SddcDescriptor {
    /// Get the serial number of this device, as a string.
    pub fn serial(&self) -> Option<&str> {
        self.info.serial_number()
    }

    /// Product string reported over USB.
    pub fn product(&self) -> Option<&str> {
        self.info.product_string()
    }

    /// Manufacturer string. The FX3 streamer firmware doesn't set a useful
    /// one, so every SDDC reports the family name.
    pub fn manufacturer(&self) -> &'static str {
        "SDDC"
    }

    /// Try and open this device.
    pub fn open(self) -> Result<UsbTransport, Error> {
        let serial = self.serial().map(str::to_owned);
        let product = self.product().map(str::to_owned);
        let device = self.info.open()?;
        #[cfg(not(target_os = "windows"))]
        {
            if device
                .active_configuration()
                .map_err(std::io::Error::from)?.configuration_value() != 1 {
                device.detach_kernel_driver(0)?;
                device.set_configuration(1)?;
            }
        }
        let interface = device.detach_and_claim_interface(0)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        info!(
            "Opened {} ({})",
            product.as_deref().unwrap_or("SDDC"),
            serial.as_deref().unwrap_or("no serial")
        );
        Ok(UsbTransport {
            interface,
            runtime,
            rx: Mutex::new(None),
            read_timeout: DEFAULT_READ_TIMEOUT,
            serial,
            product,
        })
    }
}

/// Try and turn any [`nusb::DeviceInfo`] descriptor into an SDDC, failing if
/// the VID and PID don't match the FX3 streamer.
impl TryFrom<nusb::DeviceInfo> for SddcDescriptor {
    type Error = &'static str;
    fn try_from(value: nusb::DeviceInfo) -> Result<Self, Self::Error> {
        if value.vendor_id() != FX3_USB_VID {
            Err("VID doesn't match for SDDC")
        } else if value.product_id() != FX3_STREAMER_PID {
            Err("VID recognized, PID not recognized")
        } else {
            Ok(SddcDescriptor { info: value })
        }
    }
}

/// List all available SDDC devices.
pub fn list_sddc_devices() -> Result<Vec<SddcDescriptor>, std::io::Error> {
    Ok(nusb::list_devices()?
        .filter_map(|d| SddcDescriptor::try_from(d).ok())
        .collect())
}

/// Number of SDDC devices attached. Enumeration errors count as none.
pub fn device_count() -> usize {
    list_sddc_devices().map(|l| l.len()).unwrap_or(0)
}

/// Position of the device with serial number `serial` in
/// [`list_sddc_devices`].
pub fn index_by_serial(serial: &str) -> Result<usize, Error> {
    if serial.is_empty() {
        return Err(Error::InvalidParameter("empty serial number"));
    }
    list_sddc_devices()?
        .iter()
        .position(|d| d.serial() == Some(serial))
        .ok_or(Error::NoDevice)
}

/// Open the `index`-th detected SDDC device.
pub fn open_sddc_by_index(index: usize) -> Result<UsbTransport, Error> {
    list_sddc_devices()?
        .into_iter()
        .nth(index)
        .ok_or(Error::NoDevice)?
        .open()
}

/// Open the first detected SDDC device in the system.
///
/// This is a shortcut for calling [`list_sddc_devices`] and opening the first
/// one.
pub fn open_sddc() -> Result<UsbTransport, Error> {
    open_sddc_by_index(0)
}

struct RxQueue {
    queue: Queue<RequestBuffer>,
    transfer_bytes: usize,
}

/// [`Transport`] over a claimed FX3 interface.
pub struct UsbTransport {
    interface: nusb::Interface,
    runtime: Runtime,
    rx: Mutex<Option<RxQueue>>,
    read_timeout: Duration,
    serial: Option<String>,
    product: Option<String>,
}

impl UsbTransport {
    /// Change how long a bulk read may take.
    pub fn set_read_timeout(&mut self, read_timeout: Duration) {
        self.read_timeout = read_timeout;
    }

    /// Serial number of the opened device.
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Product string of the opened device.
    pub fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }

    fn rx(&self) -> MutexGuard<'_, Option<RxQueue>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, req: u8, value: u16, index: u16, data: &[u8]) -> Result<(), Error> {
        let completion = self.runtime.block_on(async {
            timeout(
                CONTROL_TIMEOUT,
                self.interface.control_out(ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: req,
                    value,
                    index,
                    data,
                }),
            )
            .await
        });
        completion.map_err(|_| Error::Timeout)?.into_result()?;
        Ok(())
    }

    fn read_bytes(&self, req: u8, value: u16, len: usize) -> Result<Vec<u8>, Error> {
        let length = u16::try_from(len).map_err(|_| Error::InvalidParameter("control read length"))?;
        let completion = self.runtime.block_on(async {
            timeout(
                CONTROL_TIMEOUT,
                self.interface.control_in(ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: req,
                    value,
                    index: 0,
                    length,
                }),
            )
            .await
        });
        Ok(completion.map_err(|_| Error::Timeout)?.into_result()?)
    }

    fn read_struct<T>(&self, req: Fx3Command) -> Result<T, Error>
    where
        T: Pod,
    {
        let size = size_of::<T>();
        let mut resp = self.read_bytes(req as u8, 0, size)?;
        if resp.len() < size {
            return Err(Error::ReturnData);
        }
        resp.truncate(size);
        Ok(bytemuck::pod_read_unaligned(&resp))
    }
}

impl Transport for UsbTransport {
    fn control(&self, cmd: Fx3Command, data: &[u8]) -> Result<(), Error> {
        debug!("FX3 {:?} {:02x?}", cmd, data);
        self.write(cmd as u8, 0, 0, data)
    }

    fn set_argument(&self, arg: ArgId, value: u16) -> Result<(), Error> {
        debug!("FX3 argument {:?} = {}", arg, value);
        self.write(Fx3Command::SetArgFx3 as u8, value, arg as u16, &[])
    }

    fn hardware_info(&self) -> Result<HardwareInfo, Error> {
        self.read_struct(Fx3Command::TestFx3)
    }

    fn start_stream(&self, transfer_samples: usize, depth: usize) -> Result<(), Error> {
        if transfer_samples == 0 || depth == 0 {
            return Err(Error::InvalidParameter("stream geometry"));
        }
        let transfer_bytes = transfer_samples * size_of::<i16>();
        let mut queue = self.interface.bulk_in_queue(RX_ENDPOINT_ADDRESS);
        for _ in 0..depth {
            queue.submit(RequestBuffer::new(transfer_bytes));
        }
        *self.rx() = Some(RxQueue {
            queue,
            transfer_bytes,
        });
        Ok(())
    }

    fn read_block(&self, out: &mut [i16]) -> Result<(), Error> {
        let mut rx = self.rx();
        let rx = rx
            .as_mut()
            .ok_or(Error::InvalidParameter("stream not started"))?;
        if out.len() * size_of::<i16>() != rx.transfer_bytes {
            return Err(Error::InvalidParameter("read length"));
        }
        let completion = self
            .runtime
            .block_on(async { timeout(self.read_timeout, rx.queue.next_complete()).await })
            .map_err(|_| Error::Timeout)?;
        let result = match completion.status {
            Ok(()) if completion.data.len() == rx.transfer_bytes => {
                for (dst, src) in out.iter_mut().zip(completion.data.chunks_exact(2)) {
                    *dst = i16::from_le_bytes([src[0], src[1]]);
                }
                Ok(())
            }
            Ok(()) => Err(Error::ReturnData),
            Err(e) => Err(e.into()),
        };
        // Reuse the buffer even in the event of an error.
        if !matches!(result, Err(Error::Transfer(nusb::transfer::TransferError::Disconnected))) {
            rx.queue
                .submit(RequestBuffer::reuse(completion.data, rx.transfer_bytes));
        }
        result
    }

    fn stop_stream(&self) -> Result<(), Error> {
        let Some(mut rx) = self.rx().take() else {
            return Ok(());
        };
        rx.queue.cancel_all();
        while rx.queue.pending() > 0 {
            let done = self
                .runtime
                .block_on(async { timeout(self.read_timeout, rx.queue.next_complete()).await });
            if done.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn read_debug_trace(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let data = self.read_bytes(Fx3Command::ReadInfoDebug as u8, 0, buf.len())?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}
