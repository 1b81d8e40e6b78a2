use std::borrow::Cow;
use std::fmt;

use crate::FirmwareError;
use crate::codec::*;

/// Alt-setting value of an image that is not bound to a target.
pub const ALT_SETTING_UNSET: u8 = 0xff;

/// One contiguous blob at a device address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DfuElement {
    address: u32,
    contents: Vec<u8>,
}

impl DfuElement {
    pub fn new(address: u32, contents: Vec<u8>) -> Self {
        DfuElement { address, contents }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

/// A named binary image for one alternate setting.
///
/// The image is made of one or more [DfuElement]s. Plain DFU files and
/// uploads always produce a single element; DfuSe files keep the elements
/// as they were stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuImage {
    alt_setting: u8,
    name: String,
    target_size: u32,
    elements: Vec<DfuElement>,
}

impl Default for DfuImage {
    fn default() -> Self {
        DfuImage {
            alt_setting: ALT_SETTING_UNSET,
            name: String::new(),
            target_size: 0,
            elements: Vec::new(),
        }
    }
}

impl DfuImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }

    pub fn set_alt_setting(&mut self, alt_setting: u8) {
        self.alt_setting = alt_setting;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the target name, keeping at most 254 bytes as DfuSe requires.
    pub fn set_name(&mut self, name: &str) {
        let mut end = name.len().min(DFUSE_NAME_MAX);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name = name[..end].to_owned();
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    /// Size that contents set afterwards get padded up to with NUL bytes.
    pub fn set_target_size(&mut self, target_size: u32) {
        self.target_size = target_size;
    }

    pub fn elements(&self) -> &[DfuElement] {
        &self.elements
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn add_element(&mut self, element: DfuElement) {
        self.elements.push(element);
    }

    /// Image data, all elements concatenated.
    pub fn contents(&self) -> Cow<'_, [u8]> {
        match self.elements.as_slice() {
            [] => Cow::Borrowed(&[]),
            [element] => Cow::Borrowed(element.contents()),
            elements => Cow::Owned(
                elements
                    .iter()
                    .flat_map(|e| e.contents.iter().copied())
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.iter().map(DfuElement::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the image data with a single element.
    ///
    /// Data shorter than the target size is zero-padded to exactly the
    /// target size; longer data is kept as is.
    pub fn set_contents(&mut self, mut contents: Vec<u8>) {
        let target_size = self.target_size as usize;
        if contents.len() < target_size {
            contents.resize(target_size, 0);
        }
        let address = self.elements.first().map_or(0, DfuElement::address);
        self.elements = vec![DfuElement::new(address, contents)];
    }

    /// Decode one DfuSe target block from the start of `data`.
    ///
    /// Returns the image and the number of bytes consumed.
    pub fn from_dfuse(data: &[u8]) -> Result<(Self, usize), FirmwareError> {
        let prefix = ImagePrefix::read(data)?;
        let end = ImagePrefix::SIZE + prefix.target_size as usize;
        check_len("DfuSe target", data, end)?;
        let body = &data[ImagePrefix::SIZE..end];

        let mut image = DfuImage {
            alt_setting: prefix.alt_setting,
            ..Default::default()
        };
        if let Some(name) = prefix.name() {
            image.set_name(&name);
        }

        let mut offset = 0;
        for _ in 0..prefix.elements {
            let element = ElementPrefix::read(&body[offset..])?;
            log::debug!(
                "element address {:#010x}, size {:#x}",
                element.address,
                element.size
            );
            let start = offset + ElementPrefix::SIZE;
            let stop = start + element.size as usize;
            check_len("DfuSe element", body, stop)?;
            image.add_element(DfuElement::new(
                element.address,
                body[start..stop].to_vec(),
            ));
            offset = stop;
        }
        if offset != body.len() {
            log::warn!(
                "{} trailing bytes in DfuSe target {}",
                body.len() - offset,
                prefix.alt_setting
            );
        }
        Ok((image, end))
    }

    /// Encode as a DfuSe target block.
    pub fn to_dfuse(&self) -> Result<Vec<u8>, FirmwareError> {
        let target_size: usize = self
            .elements
            .iter()
            .map(|e| ElementPrefix::SIZE + e.len())
            .sum();
        let mut name = [0u8; DFUSE_NAME_SIZE];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());

        let mut data = Vec::with_capacity(ImagePrefix::SIZE + target_size);
        ImagePrefix {
            alt_setting: self.alt_setting,
            named: if self.name.is_empty() { 0 } else { 1 },
            name,
            target_size: field("DfuSe target size", target_size)?,
            elements: field("DfuSe element count", self.elements.len())?,
        }
        .write_to(&mut data);
        for element in &self.elements {
            ElementPrefix {
                address: element.address,
                size: field("DfuSe element size", element.len())?,
            }
            .write_to(&mut data);
            data.extend_from_slice(&element.contents);
        }
        Ok(data)
    }
}

/// Narrow `size` to the width of a header field.
pub(crate) fn field<T: TryFrom<usize>>(
    what: &'static str,
    size: usize,
) -> Result<T, FirmwareError> {
    T::try_from(size).map_err(|_| FirmwareError::TooLarge { what, size })
}

impl fmt::Display for DfuImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alt_setting: {:#04x}", self.alt_setting)?;
        if !self.name.is_empty() {
            write!(f, "\nname:        {}", self.name)?;
        }
        if self.target_size > 0 {
            write!(f, "\ntarget:      {:#06x}", self.target_size)?;
        }
        write!(f, "\ncontents:    {:#06x}", self.len())?;
        for element in &self.elements {
            write!(
                f,
                "\n  element @ {:#010x}: {:#06x}",
                element.address,
                element.len()
            )?;
        }
        Ok(())
    }
}
