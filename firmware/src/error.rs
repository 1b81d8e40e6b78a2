use std::io;

use crate::DfuFirmwareFormat;

#[derive(Debug)]
pub enum FirmwareError {
    Io(io::Error),
    /// A fixed-size structure did not fit in the remaining bytes.
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    InvalidSignature(&'static str),
    CrcMismatch {
        expected: u32,
        actual: u32,
    },
    UnsupportedVersion(u16),
    InvalidElf(String),
    NoFirmware,
    NoImages,
    WriteNotSupported(DfuFirmwareFormat),
    /// A count or size does not fit its field in the file format.
    TooLarge {
        what: &'static str,
        size: usize,
    },
    /// The file was built for another device.
    WrongDevice {
        what: &'static str,
        file: u16,
        device: u16,
    },
}

impl FirmwareError {
    /// True for errors describing a malformed or corrupt file.
    pub fn is_invalid_file(&self) -> bool {
        matches!(
            self,
            FirmwareError::Truncated { .. }
                | FirmwareError::InvalidSignature(_)
                | FirmwareError::CrcMismatch { .. }
                | FirmwareError::UnsupportedVersion(_)
                | FirmwareError::InvalidElf(_)
        )
    }

    /// True for errors caused by the values handed in by the caller.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            FirmwareError::TooLarge { .. } | FirmwareError::WrongDevice { .. }
        )
    }

    /// True for errors where the requested data or format does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FirmwareError::NoFirmware
                | FirmwareError::NoImages
                | FirmwareError::WriteNotSupported(_)
        )
    }
}

impl std::error::Error for FirmwareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FirmwareError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for FirmwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirmwareError::Io(err) => write!(f, "IO error: {err}"),
            FirmwareError::Truncated {
                what,
                needed,
                available,
            } => write!(
                f,
                "truncated {what}: need {needed} bytes, have {available}"
            ),
            FirmwareError::InvalidSignature(what) => {
                write!(f, "invalid {what} signature")
            }
            FirmwareError::CrcMismatch { expected, actual } => write!(
                f,
                "CRC failed, expected {expected:#010x}, got {actual:#010x}"
            ),
            FirmwareError::UnsupportedVersion(version) => {
                write!(f, "version check failed, got {version:#06x}")
            }
            FirmwareError::InvalidElf(msg) => {
                write!(f, "failed to load data as ELF: {msg}")
            }
            FirmwareError::NoFirmware => {
                write!(f, "no firmware found in ELF file")
            }
            FirmwareError::NoImages => write!(f, "no image data to write"),
            FirmwareError::WriteNotSupported(format) => {
                write!(f, "no {format} write support")
            }
            FirmwareError::TooLarge { what, size } => {
                write!(f, "{what} {size} does not fit in the file format")
            }
            FirmwareError::WrongDevice { what, file, device } => write!(
                f,
                "{what} was wrong, got {file:04x} but device has {device:04x}"
            ),
        }
    }
}

impl From<io::Error> for FirmwareError {
    fn from(err: io::Error) -> Self {
        FirmwareError::Io(err)
    }
}
