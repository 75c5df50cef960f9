use std::ops::Range;

use crate::acquisition::SessionState;

/// An error from operating an SDDC receiver.
///
/// Some errors are recoverable:
///
/// - `Io`, `Transfer` & `Timeout` may just be a failed packet operation on the
///   USB cable. During streaming these are counted and the session carries on.
/// - `ValueRange`, `TuningRange`, and `InvalidParameter` all mean the
///   arguments to a function were out of range; nothing was changed.
/// - `Busy`, `State` and `Closed` mean the call doesn't fit the current
///   session state. Stop (or reopen) and try again. `Mode` means it doesn't
///   fit how the handle was opened or configured.
/// - `Disconnected` ends any running session. Reopen the device.
/// - `Firmware` indicates the FX3 runs firmware this crate doesn't speak to.
///   The handle is torn down at open time.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying OS I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Transfer error from `nusb`.
    #[error("USB transfer error")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// The device went away mid-operation.
    #[error("Device disconnected")]
    Disconnected,

    /// A bulk read didn't complete in time.
    #[error("Transfer timed out")]
    Timeout,

    /// The provided argument value is out of range.
    #[error("Value ({val}) out of range ({}..{})", .range.start, .range.end)]
    #[allow(missing_docs)]
    ValueRange { range: Range<u32>, val: u32 },

    /// The provided tuning frequency is out of range.
    #[error("Tuning value ({val} Hz) out of range ({}..{} Hz)", .range.start, .range.end)]
    #[allow(missing_docs)]
    TuningRange { range: Range<u64>, val: u64 },

    /// Some argument to a function is invalid in a way not easily expressed as
    /// a range.
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(&'static str),

    /// The firmware on the FX3 doesn't match what this crate expects.
    #[error(
        "Requires firmware 0x{:04x}, but device has 0x{:04x}. Consider reflashing the firmware",
        needed,
        actual
    )]
    #[allow(missing_docs)]
    Firmware { needed: u16, actual: u16 },

    /// A streaming session is already active.
    #[error("Session busy")]
    Busy,

    /// The operation isn't allowed in the current session state.
    #[error("Operation not permitted while {0}")]
    State(SessionState),

    /// The operation doesn't fit the handle's mode, such as tuning a raw
    /// handle in direct sampling.
    #[error("Operation not permitted in {0}")]
    Mode(&'static str),

    /// The hardware handle was already released.
    #[error("Device handle is closed")]
    Closed,

    /// The radio doesn't have the requested capability.
    #[error("Not supported by {0}")]
    Unsupported(&'static str),

    /// Returned data from the device didn't make any sense.
    #[error("Invalid return data")]
    ReturnData,

    /// No matching device was found.
    #[error("No SDDC devices")]
    NoDevice,
}

const EPERM: i32 = 1;
const EIO: i32 = 5;
const EBADF: i32 = 9;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ENOSYS: i32 = 38;
const ETIMEDOUT: i32 = 110;

impl Error {
    /// Negative POSIX-style status code for this error, as reported by the
    /// C-style device API. Success is 0 and never produced here.
    pub fn errno(&self) -> i32 {
        -match self {
            Self::ValueRange { .. } | Self::TuningRange { .. } | Self::InvalidParameter(_) => {
                EINVAL
            }
            Self::Busy => EBUSY,
            Self::State(_) | Self::Mode(_) => EPERM,
            Self::Closed | Self::Firmware { .. } => EBADF,
            Self::NoDevice | Self::Disconnected => ENODEV,
            Self::Unsupported(_) => ENOSYS,
            Self::Timeout => ETIMEDOUT,
            Self::Io(_) | Self::Transfer(_) | Self::ReturnData => EIO,
        }
    }

    /// Whether this error ends a running session instead of being counted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Disconnected
                | Self::Closed
                | Self::Transfer(nusb::transfer::TransferError::Disconnected)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::InvalidParameter("x").errno(), -22);
        assert_eq!(Error::Busy.errno(), -16);
        assert_eq!(Error::State(SessionState::Idle).errno(), -1);
        assert_eq!(Error::Mode("raw direct sampling").errno(), -1);
        assert_eq!(
            Error::Firmware {
                needed: 0x0201,
                actual: 0x0100
            }
            .errno(),
            -9
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Disconnected.is_fatal());
        assert!(Error::Transfer(nusb::transfer::TransferError::Disconnected).is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::Transfer(nusb::transfer::TransferError::Stall).is_fatal());
    }
}
