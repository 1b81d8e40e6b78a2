//! Byte layouts of the DFU suffix and the DfuSe prefixes.
//!
//! All multi-byte fields are little-endian.

use crate::FirmwareError;

pub const DFU_SUFFIX_SIZE: usize = 16;
pub const DFU_SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";

pub const DFU_VERSION_DFU_1_0: u16 = 0x0100;
pub const DFU_VERSION_DFUSE: u16 = 0x011a;

pub const DFUSE_SIGNATURE: &[u8; 5] = b"DfuSe";
pub const DFUSE_VERSION: u8 = 0x01;
pub const DFUSE_TARGET_SIGNATURE: &[u8; 6] = b"Target";

/// Capacity of the DfuSe target name buffer, terminator included.
pub const DFUSE_NAME_SIZE: usize = 255;
/// Longest name that still leaves room for the terminator.
pub const DFUSE_NAME_MAX: usize = DFUSE_NAME_SIZE - 1;

/// DFU file suffix, stored as the last 16 bytes of a file.
///
/// On disk the fields are laid out as `bcdDevice`, `idProduct`, `idVendor`,
/// `bcdDFU`, `"UFD"`, `bLength` and `dwCRC`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DfuSuffix {
    pub release: u16,
    pub pid: u16,
    pub vid: u16,
    pub dfu_version: u16,
    /// Length of the suffix as recorded in `bLength`.
    pub length: u8,
    pub crc: u32,
}

impl DfuSuffix {
    pub fn new(vid: u16, pid: u16, release: u16, dfu_version: u16) -> Self {
        DfuSuffix {
            release,
            pid,
            vid,
            dfu_version,
            length: DFU_SUFFIX_SIZE as u8,
            crc: 0,
        }
    }

    /// True if the trailing bytes carry the `"UFD"` signature.
    pub fn is_present(data: &[u8]) -> bool {
        data.len() >= DFU_SUFFIX_SIZE
            && &data[data.len() - 8..data.len() - 5] == DFU_SUFFIX_SIGNATURE
    }

    /// Decode the suffix at the end of `data`.
    ///
    /// Returns `None` if no suffix signature is present.
    pub fn read(data: &[u8]) -> Result<Option<Self>, FirmwareError> {
        if !Self::is_present(data) {
            return Ok(None);
        }
        let raw = &data[data.len() - DFU_SUFFIX_SIZE..];
        let suffix = DfuSuffix {
            release: read_u16(raw, 0)?,
            pid: read_u16(raw, 2)?,
            vid: read_u16(raw, 4)?,
            dfu_version: read_u16(raw, 6)?,
            length: raw[11],
            crc: read_u32(raw, 12)?,
        };
        let length = suffix.length as usize;
        if length < DFU_SUFFIX_SIZE || length > data.len() {
            return Err(FirmwareError::Truncated {
                what: "DFU suffix",
                needed: length,
                available: data.len(),
            });
        }
        Ok(Some(suffix))
    }

    /// CRC over everything but the stored checksum itself.
    pub fn compute_crc(data: &[u8]) -> u32 {
        !crc32fast::hash(&data[..data.len().saturating_sub(4)])
    }

    /// Append the encoded suffix to `data`, checksum included.
    pub fn write_to(&self, data: &mut Vec<u8>) {
        data.extend_from_slice(&self.release.to_le_bytes());
        data.extend_from_slice(&self.pid.to_le_bytes());
        data.extend_from_slice(&self.vid.to_le_bytes());
        data.extend_from_slice(&self.dfu_version.to_le_bytes());
        data.extend_from_slice(DFU_SUFFIX_SIGNATURE);
        data.push(DFU_SUFFIX_SIZE as u8);
        let crc = !crc32fast::hash(data);
        data.extend_from_slice(&crc.to_le_bytes());
    }
}

/// DfuSe file header preceding the target blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DfuSePrefix {
    pub version: u8,
    /// Size of the file without the DFU suffix.
    pub image_size: u32,
    pub targets: u8,
}

impl DfuSePrefix {
    pub const SIZE: usize = 11;

    pub fn is_present(data: &[u8]) -> bool {
        data.starts_with(DFUSE_SIGNATURE)
    }

    pub fn read(data: &[u8]) -> Result<Self, FirmwareError> {
        check_len("DfuSe prefix", data, Self::SIZE)?;
        if !Self::is_present(data) {
            return Err(FirmwareError::InvalidSignature("DfuSe"));
        }
        Ok(DfuSePrefix {
            version: data[5],
            image_size: read_u32(data, 6)?,
            targets: data[10],
        })
    }

    pub fn write_to(&self, data: &mut Vec<u8>) {
        data.extend_from_slice(DFUSE_SIGNATURE);
        data.push(self.version);
        data.extend_from_slice(&self.image_size.to_le_bytes());
        data.push(self.targets);
    }
}

/// DfuSe target ("image") prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePrefix {
    pub alt_setting: u8,
    pub named: u32,
    pub name: [u8; DFUSE_NAME_SIZE],
    /// Total size of the elements following the prefix, headers included.
    pub target_size: u32,
    pub elements: u32,
}

const _: () = assert!(ImagePrefix::SIZE == 274);

impl ImagePrefix {
    pub const SIZE: usize = DFUSE_TARGET_SIGNATURE.len() + 1 + 4 + DFUSE_NAME_SIZE + 4 + 4;

    pub fn read(data: &[u8]) -> Result<Self, FirmwareError> {
        check_len("DfuSe image prefix", data, Self::SIZE)?;
        if !data.starts_with(DFUSE_TARGET_SIGNATURE) {
            return Err(FirmwareError::InvalidSignature("DfuSe target"));
        }
        let mut name = [0u8; DFUSE_NAME_SIZE];
        name.copy_from_slice(&data[11..11 + DFUSE_NAME_SIZE]);
        Ok(ImagePrefix {
            alt_setting: data[6],
            named: read_u32(data, 7)?,
            name,
            target_size: read_u32(data, 266)?,
            elements: read_u32(data, 270)?,
        })
    }

    pub fn write_to(&self, data: &mut Vec<u8>) {
        data.extend_from_slice(DFUSE_TARGET_SIGNATURE);
        data.push(self.alt_setting);
        data.extend_from_slice(&self.named.to_le_bytes());
        data.extend_from_slice(&self.name);
        data.extend_from_slice(&self.target_size.to_le_bytes());
        data.extend_from_slice(&self.elements.to_le_bytes());
    }

    /// Name up to the first NUL, if the target is flagged as named.
    pub fn name(&self) -> Option<String> {
        if self.named == 0 {
            return None;
        }
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DFUSE_NAME_SIZE);
        Some(String::from_utf8_lossy(&self.name[..end]).into_owned())
    }
}

/// DfuSe element header, followed by `size` bytes of content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementPrefix {
    pub address: u32,
    pub size: u32,
}

const _: () = assert!(ElementPrefix::SIZE == 8);

impl ElementPrefix {
    pub const SIZE: usize = 8;

    pub fn read(data: &[u8]) -> Result<Self, FirmwareError> {
        check_len("DfuSe element prefix", data, Self::SIZE)?;
        Ok(ElementPrefix {
            address: read_u32(data, 0)?,
            size: read_u32(data, 4)?,
        })
    }

    pub fn write_to(&self, data: &mut Vec<u8>) {
        data.extend_from_slice(&self.address.to_le_bytes());
        data.extend_from_slice(&self.size.to_le_bytes());
    }
}

pub(crate) fn check_len(
    what: &'static str,
    data: &[u8],
    needed: usize,
) -> Result<(), FirmwareError> {
    if data.len() < needed {
        Err(FirmwareError::Truncated {
            what,
            needed,
            available: data.len(),
        })
    } else {
        Ok(())
    }
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16, FirmwareError> {
    data.get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or(FirmwareError::Truncated {
            what: "u16 field",
            needed: offset + 2,
            available: data.len(),
        })
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32, FirmwareError> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(FirmwareError::Truncated {
            what: "u32 field",
            needed: offset + 4,
            available: data.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_layout() {
        let mut data = vec![0xaa; 4];
        DfuSuffix::new(0x1234, 0x5678, 0xfedc, DFU_VERSION_DFU_1_0)
            .write_to(&mut data);
        assert_eq!(data.len(), 4 + DFU_SUFFIX_SIZE);
        assert_eq!(&data[4..10], &[0xdc, 0xfe, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&data[10..12], &[0x00, 0x01]);
        assert_eq!(&data[12..15], b"UFD");
        assert_eq!(data[15], 16);

        let suffix = DfuSuffix::read(&data).unwrap().unwrap();
        assert_eq!(suffix.vid, 0x1234);
        assert_eq!(suffix.pid, 0x5678);
        assert_eq!(suffix.release, 0xfedc);
        assert_eq!(suffix.crc, DfuSuffix::compute_crc(&data));
    }

    #[test]
    fn test_suffix_absent() {
        assert_eq!(DfuSuffix::read(&[0u8; 32]).unwrap(), None);
        assert_eq!(DfuSuffix::read(b"UFD").unwrap(), None);
    }

    #[test]
    fn test_suffix_bad_length() {
        let mut data = vec![];
        DfuSuffix::new(1, 2, 3, DFU_VERSION_DFU_1_0).write_to(&mut data);
        data[11] = 200;
        assert!(matches!(
            DfuSuffix::read(&data),
            Err(FirmwareError::Truncated { .. })
        ));
    }

    #[test]
    fn test_image_prefix() {
        let mut name = [0u8; DFUSE_NAME_SIZE];
        name[..5].copy_from_slice(b"Flash");
        let prefix = ImagePrefix {
            alt_setting: 3,
            named: 1,
            name,
            target_size: 0x100,
            elements: 2,
        };
        let mut data = Vec::new();
        prefix.write_to(&mut data);
        assert_eq!(data.len(), ImagePrefix::SIZE);
        assert_eq!(&data[..6], b"Target");
        assert_eq!(data[6], 3);

        let decoded = ImagePrefix::read(&data).unwrap();
        assert_eq!(decoded, prefix);
        assert_eq!(decoded.name().as_deref(), Some("Flash"));
    }

    #[test]
    fn test_image_prefix_bad_signature() {
        let mut data = vec![0u8; ImagePrefix::SIZE];
        data[..6].copy_from_slice(b"Tarqet");
        assert!(matches!(
            ImagePrefix::read(&data),
            Err(FirmwareError::InvalidSignature(_))
        ));
        assert!(matches!(
            ImagePrefix::read(b"Target"),
            Err(FirmwareError::Truncated { .. })
        ));
    }

    #[test]
    fn test_dfuse_prefix() {
        let mut data = Vec::new();
        DfuSePrefix {
            version: DFUSE_VERSION,
            image_size: 0x1234,
            targets: 2,
        }
        .write_to(&mut data);
        assert_eq!(data, b"DfuSe\x01\x34\x12\x00\x00\x02");
        let prefix = DfuSePrefix::read(&data).unwrap();
        assert_eq!(prefix.image_size, 0x1234);
        assert_eq!(prefix.targets, 2);
    }
}
