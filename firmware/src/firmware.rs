use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::ops::BitOr;
use std::path::Path;

use crate::codec::*;
use crate::elf::{is_elf, parse_elf};
use crate::image::field;
use crate::{DfuImage, FirmwareError};

/// Vendor, product and release value meaning "unspecified".
pub const ID_UNSET: u16 = 0xffff;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DfuFirmwareFormat {
    #[default]
    Unknown,
    /// Raw image, optionally followed by a DFU 1.0 suffix
    Dfu1_0,
    /// ST Microelectronics multi-target container
    DfuSe,
    /// ELF object, read only
    Elf,
}

impl fmt::Display for DfuFirmwareFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DfuFirmwareFormat::Unknown => "unknown",
            DfuFirmwareFormat::Dfu1_0 => "DFU",
            DfuFirmwareFormat::DfuSe => "DfuSe",
            DfuFirmwareFormat::Elf => "ELF",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParseFlags(u32);

impl ParseFlags {
    pub const NONE: ParseFlags = ParseFlags(0);
    /// Do not verify the DFU suffix CRC.
    pub const NO_CRC_TEST: ParseFlags = ParseFlags(1 << 0);
    /// Do not verify the bcdDFU and DfuSe version fields.
    pub const NO_VERSION_TEST: ParseFlags = ParseFlags(1 << 1);

    pub fn contains(&self, other: ParseFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ParseFlags {
    type Output = ParseFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ParseFlags(self.0 | rhs.0)
    }
}

/// Sniff the container format of `data`.
///
/// A trailing DFU suffix is ignored; DfuSe signatures win over the ELF
/// magic, and anything else is taken as a plain DFU image.
pub fn detect_format(data: &[u8]) -> DfuFirmwareFormat {
    let payload = match DfuSuffix::read(data) {
        Ok(Some(suffix)) => &data[..data.len() - suffix.length as usize],
        _ => data,
    };
    if DfuSePrefix::is_present(payload) || payload.starts_with(DFUSE_TARGET_SIGNATURE) {
        DfuFirmwareFormat::DfuSe
    } else if is_elf(payload) {
        DfuFirmwareFormat::Elf
    } else {
        DfuFirmwareFormat::Dfu1_0
    }
}

/// Firmware container: images plus the USB identity they are meant for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuFirmware {
    images: Vec<DfuImage>,
    vid: u16,
    pid: u16,
    release: u16,
    target_size: u32,
    format: DfuFirmwareFormat,
}

impl Default for DfuFirmware {
    fn default() -> Self {
        DfuFirmware {
            images: Vec::new(),
            vid: ID_UNSET,
            pid: ID_UNSET,
            release: ID_UNSET,
            target_size: 0,
            format: DfuFirmwareFormat::Unknown,
        }
    }
}

impl DfuFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a new container from `data`.
    pub fn parse(data: &[u8], flags: ParseFlags) -> Result<Self, FirmwareError> {
        let mut firmware = Self::new();
        firmware.parse_data(data, flags)?;
        Ok(firmware)
    }

    pub fn parse_file<P: AsRef<Path>>(
        path: P,
        flags: ParseFlags,
    ) -> Result<Self, FirmwareError> {
        Self::parse(&fs::read(path)?, flags)
    }

    /// Replace images and identity with the ones decoded from `data`.
    ///
    /// The configured target size is kept and applied to plain images. On
    /// error `self` is left untouched.
    pub fn parse_data(
        &mut self,
        data: &[u8],
        flags: ParseFlags,
    ) -> Result<(), FirmwareError> {
        let (suffix, payload) = match DfuSuffix::read(data)? {
            Some(suffix) => {
                if !flags.contains(ParseFlags::NO_CRC_TEST) {
                    let actual = DfuSuffix::compute_crc(data);
                    if actual != suffix.crc {
                        return Err(FirmwareError::CrcMismatch {
                            expected: suffix.crc,
                            actual,
                        });
                    }
                }
                if !flags.contains(ParseFlags::NO_VERSION_TEST)
                    && suffix.dfu_version != DFU_VERSION_DFU_1_0
                    && suffix.dfu_version != DFU_VERSION_DFUSE
                {
                    return Err(FirmwareError::UnsupportedVersion(
                        suffix.dfu_version,
                    ));
                }
                (Some(suffix), &data[..data.len() - suffix.length as usize])
            }
            None => (None, data),
        };

        let format = detect_format(payload);
        let images = match format {
            DfuFirmwareFormat::DfuSe => parse_dfuse(payload, flags)?,
            DfuFirmwareFormat::Elf => parse_elf(payload)?,
            _ => {
                let mut image = DfuImage::new();
                image.set_target_size(self.target_size);
                image.set_contents(payload.to_vec());
                vec![image]
            }
        };
        log::debug!("parsed {} image(s) as {format}", images.len());

        self.images = images;
        self.format = format;
        self.vid = suffix.map_or(ID_UNSET, |s| s.vid);
        self.pid = suffix.map_or(ID_UNSET, |s| s.pid);
        self.release = suffix.map_or(ID_UNSET, |s| s.release);
        Ok(())
    }

    /// Format that [DfuFirmware::write_data] will produce.
    ///
    /// More than one image is always DfuSe. A single image read from a
    /// DfuSe file stays DfuSe so its element addresses survive; anything
    /// else with one image is written as plain DFU 1.0.
    pub fn write_format(&self) -> Result<DfuFirmwareFormat, FirmwareError> {
        match (self.images.len(), self.format) {
            (0, _) => Err(FirmwareError::NoImages),
            (n, _) if n > 1 => Ok(DfuFirmwareFormat::DfuSe),
            (_, DfuFirmwareFormat::Elf) => {
                Err(FirmwareError::WriteNotSupported(DfuFirmwareFormat::Elf))
            }
            (_, DfuFirmwareFormat::DfuSe) => Ok(DfuFirmwareFormat::DfuSe),
            _ => Ok(DfuFirmwareFormat::Dfu1_0),
        }
    }

    /// Serialize the container, suffix included.
    pub fn write_data(&self) -> Result<Vec<u8>, FirmwareError> {
        let format = self.write_format()?;
        if format != self.format {
            log::debug!("switching from {} to {format} for writing", self.format);
        }
        let (mut data, dfu_version) = match format {
            DfuFirmwareFormat::DfuSe => (self.to_dfuse()?, DFU_VERSION_DFUSE),
            _ => (self.images[0].contents().into_owned(), DFU_VERSION_DFU_1_0),
        };
        DfuSuffix::new(self.vid, self.pid, self.release, dfu_version)
            .write_to(&mut data);
        Ok(data)
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<(), FirmwareError> {
        Ok(fs::write(path, self.write_data()?)?)
    }

    fn to_dfuse(&self) -> Result<Vec<u8>, FirmwareError> {
        let targets = self
            .images
            .iter()
            .map(DfuImage::to_dfuse)
            .collect::<Result<Vec<_>, _>>()?;
        let image_size =
            DfuSePrefix::SIZE + targets.iter().map(Vec::len).sum::<usize>();
        let mut data = Vec::with_capacity(image_size + DFU_SUFFIX_SIZE);
        DfuSePrefix {
            version: DFUSE_VERSION,
            image_size: field("DfuSe image size", image_size)?,
            targets: field("DfuSe target count", self.images.len())?,
        }
        .write_to(&mut data);
        for target in targets {
            data.extend(target);
        }
        Ok(data)
    }

    pub fn images(&self) -> &[DfuImage] {
        &self.images
    }

    pub fn add_image(&mut self, image: DfuImage) {
        self.images.push(image);
    }

    pub fn image_by_alt_setting(&self, alt_setting: u8) -> Option<&DfuImage> {
        self.images.iter().find(|i| i.alt_setting() == alt_setting)
    }

    pub fn image_by_name(&self, name: &str) -> Option<&DfuImage> {
        self.images.iter().find(|i| i.name() == name)
    }

    /// Contents of the first image.
    pub fn contents(&self) -> Option<Cow<'_, [u8]>> {
        self.images.first().map(DfuImage::contents)
    }

    /// Replace all images with one image holding `contents`.
    pub fn set_contents(&mut self, contents: Vec<u8>) {
        let mut image = DfuImage::new();
        image.set_target_size(self.target_size);
        image.set_contents(contents);
        self.images = vec![image];
    }

    pub fn vid(&self) -> u16 {
        self.vid
    }

    pub fn set_vid(&mut self, vid: u16) {
        self.vid = vid;
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn set_pid(&mut self, pid: u16) {
        self.pid = pid;
    }

    pub fn release(&self) -> u16 {
        self.release
    }

    pub fn set_release(&mut self, release: u16) {
        self.release = release;
    }

    /// Check the file IDs against the runtime IDs of a device.
    ///
    /// [ID_UNSET] on either side matches anything.
    pub fn check_device_ids(&self, vid: u16, pid: u16) -> Result<(), FirmwareError> {
        check_id("vendor ID", self.vid, vid)?;
        check_id("product ID", self.pid, pid)
    }

    pub fn format(&self) -> DfuFirmwareFormat {
        self.format
    }

    pub fn set_format(&mut self, format: DfuFirmwareFormat) {
        self.format = format;
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    /// Pad plain images parsed or set afterwards to `target_size` bytes.
    pub fn set_target_size(&mut self, target_size: u32) {
        self.target_size = target_size;
    }
}

fn parse_dfuse(data: &[u8], flags: ParseFlags) -> Result<Vec<DfuImage>, FirmwareError> {
    let (mut offset, targets) = if DfuSePrefix::is_present(data) {
        let prefix = DfuSePrefix::read(data)?;
        if !flags.contains(ParseFlags::NO_VERSION_TEST) && prefix.version != DFUSE_VERSION {
            return Err(FirmwareError::UnsupportedVersion(prefix.version as u16));
        }
        if prefix.image_size as usize != data.len() {
            log::warn!(
                "DfuSe image size {:#x} does not match payload {:#x}",
                prefix.image_size,
                data.len()
            );
        }
        (DfuSePrefix::SIZE, Some(prefix.targets as usize))
    } else {
        (0, None)
    };

    let mut images = Vec::new();
    while targets.map_or(offset < data.len(), |n| images.len() < n) {
        let (image, consumed) = DfuImage::from_dfuse(&data[offset..])?;
        images.push(image);
        offset += consumed;
    }
    Ok(images)
}

impl fmt::Display for DfuFirmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "vid:         {:#06x}", self.vid)?;
        writeln!(f, "pid:         {:#06x}", self.pid)?;
        writeln!(f, "release:     {:#06x}", self.release)?;
        write!(f, "format:      {}", self.format)?;
        if self.target_size > 0 {
            write!(f, "\ntarget size: {:#06x}", self.target_size)?;
        }
        for image in &self.images {
            for line in image.to_string().lines() {
                write!(f, "\n  {line}")?;
            }
        }
        Ok(())
    }
}

fn check_id(what: &'static str, file: u16, device: u16) -> Result<(), FirmwareError> {
    if file == ID_UNSET || device == ID_UNSET || file == device {
        Ok(())
    } else {
        Err(FirmwareError::WrongDevice { what, file, device })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DfuElement;
    use crate::elf::tests::elf32_with_text;

    fn counting(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_parse_without_suffix() {
        let data = counting(256);
        let firmware = DfuFirmware::parse(&data, ParseFlags::NONE).unwrap();
        assert_eq!(firmware.vid(), 0xffff);
        assert_eq!(firmware.pid(), 0xffff);
        assert_eq!(firmware.release(), 0xffff);
        assert_eq!(firmware.format(), DfuFirmwareFormat::Dfu1_0);
        assert_eq!(firmware.contents().unwrap(), &data[..]);
    }

    #[test]
    fn test_write_then_parse() {
        let mut firmware = DfuFirmware::new();
        firmware.set_vid(0x1234);
        firmware.set_pid(0x5678);
        firmware.set_release(0xfedc);
        firmware.set_contents(counting(256));
        let data = firmware.write_data().unwrap();
        assert_eq!(data.len(), 256 + DFU_SUFFIX_SIZE);

        let parsed = DfuFirmware::parse(&data, ParseFlags::NONE).unwrap();
        assert_eq!(parsed.vid(), 0x1234);
        assert_eq!(parsed.pid(), 0x5678);
        assert_eq!(parsed.release(), 0xfedc);
        assert_eq!(parsed.format(), DfuFirmwareFormat::Dfu1_0);
        assert_eq!(parsed.contents().unwrap(), &counting(256)[..]);
    }

    #[test]
    fn test_crc_mismatch() {
        let mut firmware = DfuFirmware::new();
        firmware.set_contents(vec![1, 2, 3, 4]);
        let mut data = firmware.write_data().unwrap();
        data[0] ^= 0xff;
        assert!(matches!(
            DfuFirmware::parse(&data, ParseFlags::NONE),
            Err(FirmwareError::CrcMismatch { .. })
        ));
        let parsed = DfuFirmware::parse(&data, ParseFlags::NO_CRC_TEST).unwrap();
        assert_eq!(parsed.contents().unwrap(), &[0xfe, 2, 3, 4][..]);
    }

    #[test]
    fn test_version_check() {
        let mut data = vec![0u8; 8];
        DfuSuffix::new(1, 2, 3, 0x0200).write_to(&mut data);
        assert!(matches!(
            DfuFirmware::parse(&data, ParseFlags::NONE),
            Err(FirmwareError::UnsupportedVersion(0x0200))
        ));
        assert!(DfuFirmware::parse(&data, ParseFlags::NO_VERSION_TEST).is_ok());
    }

    #[test]
    fn test_failed_parse_keeps_state() {
        let mut firmware = DfuFirmware::new();
        firmware.set_vid(0x0483);
        firmware.set_contents(vec![1, 2, 3]);
        let before = firmware.clone();

        let mut data = b"DfuSe\x01\x00\x00\x00\x00\x01".to_vec();
        data.extend_from_slice(b"Tarqet");
        data.resize(400, 0);
        assert!(firmware.parse_data(&data, ParseFlags::NONE).is_err());
        assert_eq!(firmware, before);
    }

    #[test]
    fn test_dfuse_round_trip() {
        let mut firmware = DfuFirmware::new();
        firmware.set_vid(0x0483);
        firmware.set_pid(0xdf11);
        firmware.set_release(0x0000);
        for (alt, name) in [(0u8, "Internal Flash"), (1, "Option Bytes")] {
            let mut image = DfuImage::new();
            image.set_alt_setting(alt);
            image.set_name(name);
            image.set_contents(vec![alt + 1; 64]);
            firmware.add_image(image);
        }
        let data = firmware.write_data().unwrap();
        assert!(data.starts_with(b"DfuSe"));

        let parsed = DfuFirmware::parse(&data, ParseFlags::NONE).unwrap();
        assert_eq!(parsed.format(), DfuFirmwareFormat::DfuSe);
        assert_eq!(parsed.vid(), 0x0483);
        assert_eq!(parsed.pid(), 0xdf11);
        assert_eq!(parsed.release(), 0x0000);
        assert_eq!(parsed.images(), firmware.images());
        assert_eq!(
            parsed.image_by_name("Option Bytes").unwrap().alt_setting(),
            1
        );
        assert_eq!(&*parsed.image_by_alt_setting(0).unwrap().contents(), &[1; 64]);
    }

    #[test]
    fn test_single_dfuse_image_stays_dfuse() {
        let mut image = DfuImage::new();
        image.set_alt_setting(0);
        image.add_element(DfuElement::new(0x0800_0000, vec![0xaa; 32]));
        image.add_element(DfuElement::new(0x0801_0000, vec![0xbb; 32]));
        let mut firmware = DfuFirmware::new();
        firmware.set_format(DfuFirmwareFormat::DfuSe);
        firmware.add_image(image);

        let parsed =
            DfuFirmware::parse(&firmware.write_data().unwrap(), ParseFlags::NONE).unwrap();
        assert_eq!(parsed.format(), DfuFirmwareFormat::DfuSe);
        assert_eq!(parsed.images()[0].elements(), firmware.images()[0].elements());
    }

    #[test]
    fn test_detect_format() {
        let mut elf = vec![0u8; 16];
        elf[1..4].copy_from_slice(b"ELF");
        assert_eq!(detect_format(&elf), DfuFirmwareFormat::Elf);
        assert_eq!(detect_format(&elf[..15]), DfuFirmwareFormat::Dfu1_0);

        let mut plain = vec![0u8; 32];
        DfuSuffix::new(1, 2, 3, DFU_VERSION_DFU_1_0).write_to(&mut plain);
        assert_eq!(detect_format(&plain), DfuFirmwareFormat::Dfu1_0);

        assert_eq!(detect_format(b"DfuSe\x01"), DfuFirmwareFormat::DfuSe);
        assert_eq!(detect_format(&[]), DfuFirmwareFormat::Dfu1_0);
    }

    #[test]
    fn test_elf() {
        let data = elf32_with_text(&[1, 2, 3, 4, 5, 6, 7, 8], 0x2000);
        let firmware = DfuFirmware::parse(&data, ParseFlags::NONE).unwrap();
        assert_eq!(firmware.format(), DfuFirmwareFormat::Elf);
        assert_eq!(firmware.images()[0].name(), ".text");
        assert_eq!(firmware.images()[0].elements()[0].address(), 0x2000);
        assert!(matches!(
            firmware.write_data(),
            Err(FirmwareError::WriteNotSupported(DfuFirmwareFormat::Elf))
        ));
    }

    #[test]
    fn test_elf_normalized_when_split() {
        let data = elf32_with_text(&[1, 2, 3, 4], 0x2000);
        let mut firmware = DfuFirmware::parse(&data, ParseFlags::NONE).unwrap();
        firmware.add_image(DfuImage::new());
        assert_eq!(firmware.write_format().unwrap(), DfuFirmwareFormat::DfuSe);
    }

    #[test]
    fn test_device_ids() {
        let mut firmware = DfuFirmware::new();
        assert!(firmware.check_device_ids(0x0483, 0xdf11).is_ok());

        firmware.set_vid(0x0483);
        firmware.set_pid(0x1234);
        assert!(firmware.check_device_ids(0x0483, ID_UNSET).is_ok());
        assert!(firmware.check_device_ids(ID_UNSET, ID_UNSET).is_ok());
        let err = firmware.check_device_ids(0x0483, 0xdf11).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(matches!(
            err,
            FirmwareError::WrongDevice {
                what: "product ID",
                file: 0x1234,
                device: 0xdf11,
            }
        ));
        assert!(matches!(
            firmware.check_device_ids(0x1209, 0x1234),
            Err(FirmwareError::WrongDevice {
                what: "vendor ID",
                ..
            })
        ));
    }

    #[test]
    fn test_dfuse_target_count_limit() {
        let mut firmware = DfuFirmware::new();
        for alt in 0..255u8 {
            let mut image = DfuImage::new();
            image.set_alt_setting(alt);
            image.add_element(DfuElement::new(0, vec![alt]));
            firmware.add_image(image);
        }
        let data = firmware.write_data().unwrap();
        let parsed = DfuFirmware::parse(&data, ParseFlags::NONE).unwrap();
        assert_eq!(parsed.images().len(), 255);
        assert_eq!(parsed.images()[254].contents().as_ref(), &[254]);

        let mut image = DfuImage::new();
        image.add_element(DfuElement::new(0, vec![0]));
        firmware.add_image(image);
        let err = firmware.write_data().unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(matches!(
            err,
            FirmwareError::TooLarge {
                what: "DfuSe target count",
                size: 256,
            }
        ));
    }

    #[test]
    fn test_no_images() {
        assert!(matches!(
            DfuFirmware::new().write_data(),
            Err(FirmwareError::NoImages)
        ));
    }

    #[test]
    fn test_target_size() {
        let mut firmware = DfuFirmware::new();
        firmware.set_target_size(0x100);
        firmware.parse_data(&[1, 2, 3], ParseFlags::NONE).unwrap();
        let contents = firmware.contents().unwrap();
        assert_eq!(contents.len(), 0x100);
        assert_eq!(&contents[..4], &[1, 2, 3, 0]);
    }
}
