use firmware::FirmwareError;

use crate::state::{DfuState, DfuStatus};

/// Broad classification of a [DfuError].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    InvalidFile,
    DeviceIo,
    Protocol,
    Timeout,
    Cancelled,
}

#[derive(Debug)]
pub enum DfuError {
    Usb(nusb::Error),
    Transfer(nusb::transfer::TransferError),
    /// Backend failure described by a message only.
    Device(String),
    Open {
        platform_id: String,
        source: Box<DfuError>,
    },
    Reset(Box<DfuError>),
    Firmware(FirmwareError),
    InvalidArgument(String),
    NotDfuCapable,
    TargetNotFound(String),
    NotOpen,
    NotSupported(&'static str),
    Status {
        status: DfuStatus,
        state: DfuState,
    },
    UnexpectedState {
        state: DfuState,
        during: &'static str,
    },
    UnknownState(u8),
    UnknownStatus(u8),
    ResponseTooShort {
        got: usize,
        expected: usize,
    },
    VerifyFailed {
        offset: usize,
    },
    RuntimeMode,
    DeviceGoneAway,
    SameVidPid,
    Timeout,
    Cancelled,
}

impl DfuError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfuError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DfuError::Firmware(err) if err.is_invalid_argument() => ErrorKind::InvalidArgument,
            DfuError::NotDfuCapable
            | DfuError::TargetNotFound(_)
            | DfuError::NotSupported(_) => ErrorKind::NotFound,
            DfuError::Firmware(err) if err.is_not_found() => ErrorKind::NotFound,
            DfuError::Firmware(err) if err.is_invalid_file() => ErrorKind::InvalidFile,
            DfuError::Firmware(_)
            | DfuError::Usb(_)
            | DfuError::Transfer(_)
            | DfuError::Device(_)
            | DfuError::Open { .. }
            | DfuError::Reset(_) => ErrorKind::DeviceIo,
            DfuError::NotOpen
            | DfuError::Status { .. }
            | DfuError::UnexpectedState { .. }
            | DfuError::UnknownState(_)
            | DfuError::UnknownStatus(_)
            | DfuError::ResponseTooShort { .. }
            | DfuError::VerifyFailed { .. }
            | DfuError::RuntimeMode
            | DfuError::SameVidPid => ErrorKind::Protocol,
            DfuError::DeviceGoneAway | DfuError::Timeout => ErrorKind::Timeout,
            DfuError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl std::error::Error for DfuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DfuError::Usb(err) => Some(err),
            DfuError::Transfer(err) => Some(err),
            DfuError::Open { source, .. } => Some(source.as_ref()),
            DfuError::Reset(err) => Some(err.as_ref()),
            DfuError::Firmware(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for DfuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DfuError::Usb(err) => write!(f, "USB error: {}", err),
            DfuError::Transfer(err) => write!(f, "Transfer error: {}", err),
            DfuError::Device(msg) => write!(f, "Device error: {}", msg),
            DfuError::Open {
                platform_id,
                source,
            } => write!(f, "cannot open device {}: {}", platform_id, source),
            DfuError::Reset(err) => {
                write!(f, "cannot reset USB device: {}", err)
            }
            DfuError::Firmware(err) => write!(f, "Firmware error: {}", err),
            DfuError::InvalidArgument(msg) => {
                write!(f, "Invalid argument: {}", msg)
            }
            DfuError::NotDfuCapable => write!(f, "Not a DFU device"),
            DfuError::TargetNotFound(what) => write!(f, "No target with {}", what),
            DfuError::NotOpen => write!(f, "Target is not open"),
            DfuError::NotSupported(what) => write!(f, "Not supported: {}", what),
            DfuError::Status { status, state } => {
                write!(f, "DFU status error: {} (state {})", status, state)
            }
            DfuError::UnexpectedState { state, during } => {
                write!(f, "Unexpected state {} during {}", state, during)
            }
            DfuError::UnknownState(code) => {
                write!(f, "Unknown DFU state code {}", code)
            }
            DfuError::UnknownStatus(code) => {
                write!(f, "Unknown DFU status code {}", code)
            }
            DfuError::ResponseTooShort { got, expected } => write!(
                f,
                "Device response too short (got {}, expected {})",
                got, expected
            ),
            DfuError::VerifyFailed { offset } => {
                write!(f, "Verify failed at offset {:#x}", offset)
            }
            DfuError::RuntimeMode => {
                write!(f, "Target is in runtime mode, detach first")
            }
            DfuError::DeviceGoneAway => {
                write!(f, "target went away but did not come back")
            }
            DfuError::SameVidPid => {
                write!(f, "target came back with same VID:PID values")
            }
            DfuError::Timeout => write!(f, "Timeout"),
            DfuError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for DfuError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        DfuError::Transfer(err)
    }
}

impl From<FirmwareError> for DfuError {
    fn from(err: FirmwareError) -> Self {
        DfuError::Firmware(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            DfuError::InvalidArgument("VID:PID".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(DfuError::NotDfuCapable.kind(), ErrorKind::NotFound);
        assert_eq!(
            DfuError::Firmware(FirmwareError::InvalidSignature("DfuSe")).kind(),
            ErrorKind::InvalidFile
        );
        assert_eq!(
            DfuError::Firmware(FirmwareError::NoFirmware).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            DfuError::Device("pipe".into()).kind(),
            ErrorKind::DeviceIo
        );
        assert_eq!(
            DfuError::VerifyFailed { offset: 4 }.kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            DfuError::Firmware(FirmwareError::TooLarge {
                what: "DfuSe target count",
                size: 256,
            })
            .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(DfuError::DeviceGoneAway.kind(), ErrorKind::Timeout);
        assert_eq!(DfuError::SameVidPid.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_open_message() {
        let err = DfuError::Open {
            platform_id: "1-2.3".into(),
            source: Box::new(DfuError::Device("access denied".into())),
        };
        assert_eq!(
            err.to_string(),
            "cannot open device 1-2.3: Device error: access denied"
        );
    }
}
