use std::fmt;
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::DfuError;

pub(crate) const DFU_STATUS_LEN: u16 = 6;

/// DFU device state (`bState`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0x00,
    AppDetach = 0x01,
    DfuIdle = 0x02,
    DfuDnloadSync = 0x03,
    DfuDnbusy = 0x04,
    DfuDnloadIdle = 0x05,
    DfuManifestSync = 0x06,
    DfuManifest = 0x07,
    DfuManifestWaitReset = 0x08,
    DfuUploadIdle = 0x09,
    DfuError = 0x0a,
}

impl DfuState {
    pub const ALL: [DfuState; 11] = [
        DfuState::AppIdle,
        DfuState::AppDetach,
        DfuState::DfuIdle,
        DfuState::DfuDnloadSync,
        DfuState::DfuDnbusy,
        DfuState::DfuDnloadIdle,
        DfuState::DfuManifestSync,
        DfuState::DfuManifest,
        DfuState::DfuManifestWaitReset,
        DfuState::DfuUploadIdle,
        DfuState::DfuError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DfuDnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DfuDnbusy => "dfuDNBUSY",
            DfuState::DfuDnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::DfuManifestSync => "dfuMANIFEST-SYNC",
            DfuState::DfuManifest => "dfuMANIFEST",
            DfuState::DfuManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::DfuUploadIdle => "dfuUPLOAD-IDLE",
            DfuState::DfuError => "dfuERROR",
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DFU status code (`bStatus`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DfuStatus {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotdone = 0x09,
    ErrFirmware = 0x0a,
    ErrVendor = 0x0b,
    ErrUsbr = 0x0c,
    ErrPor = 0x0d,
    ErrUnknown = 0x0e,
    ErrStalledpkt = 0x0f,
}

impl DfuStatus {
    pub const ALL: [DfuStatus; 16] = [
        DfuStatus::Ok,
        DfuStatus::ErrTarget,
        DfuStatus::ErrFile,
        DfuStatus::ErrWrite,
        DfuStatus::ErrErase,
        DfuStatus::ErrCheckErased,
        DfuStatus::ErrProg,
        DfuStatus::ErrVerify,
        DfuStatus::ErrAddress,
        DfuStatus::ErrNotdone,
        DfuStatus::ErrFirmware,
        DfuStatus::ErrVendor,
        DfuStatus::ErrUsbr,
        DfuStatus::ErrPor,
        DfuStatus::ErrUnknown,
        DfuStatus::ErrStalledpkt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DfuStatus::Ok => "OK",
            DfuStatus::ErrTarget => "errTARGET",
            DfuStatus::ErrFile => "errFILE",
            DfuStatus::ErrWrite => "errWRITE",
            DfuStatus::ErrErase => "errERASE",
            DfuStatus::ErrCheckErased => "errCHECK_ERASED",
            DfuStatus::ErrProg => "errPROG",
            DfuStatus::ErrVerify => "errVERIFY",
            DfuStatus::ErrAddress => "errADDRESS",
            DfuStatus::ErrNotdone => "errNOTDONE",
            DfuStatus::ErrFirmware => "errFIRMWARE",
            DfuStatus::ErrVendor => "errVENDOR",
            DfuStatus::ErrUsbr => "errUSBR",
            DfuStatus::ErrPor => "errPOR",
            DfuStatus::ErrUnknown => "errUNKNOWN",
            DfuStatus::ErrStalledpkt => "errSTALLEDPKT",
        }
    }
}

impl fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a target runs its application or the DFU bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuMode {
    Unknown,
    Runtime,
    Dfu,
}

impl DfuMode {
    pub(crate) fn from_protocol(protocol: u8) -> Self {
        match protocol {
            0x01 => DfuMode::Runtime,
            0x02 => DfuMode::Dfu,
            _ => DfuMode::Unknown,
        }
    }
}

impl fmt::Display for DfuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DfuMode::Unknown => "unknown",
            DfuMode::Runtime => "runtime",
            DfuMode::Dfu => "DFU",
        })
    }
}

/// Decoded `DFU_GETSTATUS` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub status: DfuStatus,
    pub poll_timeout: Duration,
    pub state: DfuState,
}

impl StatusReport {
    pub(crate) fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::ResponseTooShort {
                got: data.len(),
                expected: DFU_STATUS_LEN as usize,
            });
        }
        let poll_timeout = (data[3] as u32) << 16 | (data[2] as u32) << 8 | (data[1] as u32);
        Ok(StatusReport {
            status: DfuStatus::try_from(data[0])
                .map_err(|_| DfuError::UnknownStatus(data[0]))?,
            poll_timeout: Duration::from_millis(poll_timeout as u64),
            state: DfuState::try_from(data[4]).map_err(|_| DfuError::UnknownState(data[4]))?,
        })
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        self.ret(())
    }

    pub fn ret<T>(&self, t: T) -> Result<T, DfuError> {
        if self.status != DfuStatus::Ok {
            Err(DfuError::from(self))
        } else {
            Ok(t)
        }
    }
}

impl From<&StatusReport> for DfuError {
    fn from(st: &StatusReport) -> Self {
        DfuError::Status {
            status: st.status,
            state: st.state,
        }
    }
}
