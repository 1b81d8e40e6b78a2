pub(crate) const DFU_DESC_TYPE: u8 = 0x21;
pub(crate) const DFU_DESC_LEN: usize = 9;

pub const DFUSE_VERSION_NUMBER: u16 = 0x11A;

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DfuDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl DfuDescriptor {
    pub const BIT_CAN_DNLOAD: u8 = 1 << 0;
    pub const BIT_CAN_UPLOAD: u8 = 1 << 1;
    pub const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    pub const BIT_WILL_DETACH: u8 = 1 << 3;

    pub fn new(
        attributes: u8,
        detach_timeout: u16,
        transfer_size: u16,
        dfu_version: u16,
    ) -> Self {
        Self {
            attributes,
            detach_timeout,
            transfer_size,
            dfu_version,
        }
    }

    /// Decode a raw functional descriptor, header bytes included.
    pub fn parse(raw_desc: &[u8]) -> Option<Self> {
        if raw_desc.len() < DFU_DESC_LEN || raw_desc[1] != DFU_DESC_TYPE {
            return None;
        }
        Some(Self {
            attributes: raw_desc[2],
            detach_timeout: u16::from_le_bytes([raw_desc[3], raw_desc[4]]),
            transfer_size: u16::from_le_bytes([raw_desc[5], raw_desc[6]]),
            dfu_version: u16::from_le_bytes([raw_desc[7], raw_desc[8]]),
        })
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue a USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Time, in milliseconds, that the device will wait after receipt of the `DFU_DETACH`
    /// request (`wDetachTimeOut`).
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per control-write transaction
    /// (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU Specification release
    /// (`bcdDFUVersion`).
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }

    /// The device speaks the STM32 DfuSe extensions.
    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let desc =
            DfuDescriptor::parse(&[0x09, 0x21, 0x0b, 0xff, 0x00, 0x00, 0x08, 0x1a, 0x01])
                .unwrap();
        assert!(desc.can_download());
        assert!(desc.can_upload());
        assert!(!desc.manifestation_tolerant());
        assert!(desc.will_detach());
        assert_eq!(desc.detach_timeout(), 255);
        assert_eq!(desc.transfer_size(), 2048);
        assert!(desc.is_dfuse());
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(DfuDescriptor::parse(&[0x09, 0x21, 0x0b]), None);
        assert_eq!(
            DfuDescriptor::parse(&[0x09, 0x24, 0, 0, 0, 0, 0, 0, 0]),
            None
        );
    }
}
