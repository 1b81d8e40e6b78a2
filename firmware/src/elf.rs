//! Read-only extraction of firmware sections from ELF objects.

use object::{Object, ObjectSection, SectionKind};

use crate::{DfuElement, DfuImage, FirmwareError};

/// Sections copied into images, in order.
const SECTION_NAMES: &[&str] = &[".text"];

const ELF_MIN_SIZE: usize = 16;

/// True if `data` carries the ELF magic (the leading 0x7f is not checked).
pub fn is_elf(data: &[u8]) -> bool {
    data.len() >= ELF_MIN_SIZE && &data[1..4] == b"ELF"
}

fn invalid(err: object::Error) -> FirmwareError {
    FirmwareError::InvalidElf(err.to_string())
}

/// Build one image per interesting section found in the ELF object.
pub(crate) fn parse_elf(data: &[u8]) -> Result<Vec<DfuImage>, FirmwareError> {
    let file = object::File::parse(data).map_err(invalid)?;
    log::debug!(
        "loading {}b ELF object",
        if file.is_64() { 64 } else { 32 }
    );

    let mut images = Vec::new();
    for wanted in SECTION_NAMES {
        let Some(section) = file.section_by_name(wanted) else {
            continue;
        };
        if section.kind() == SectionKind::UninitializedData || section.size() == 0 {
            log::warn!("section {wanted} has no data");
            continue;
        }
        let address = u32::try_from(section.address()).map_err(|_| {
            FirmwareError::InvalidElf(format!(
                "section {wanted} address {:#x} beyond 32 bits",
                section.address()
            ))
        })?;
        let contents = section.data().map_err(invalid)?;

        let mut image = DfuImage::new();
        image.set_name(wanted);
        image.add_element(DfuElement::new(address, contents.to_vec()));
        images.push(image);
    }

    if images.is_empty() {
        return Err(FirmwareError::NoFirmware);
    }
    Ok(images)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal little-endian ELF32 object with `.text` and `.shstrtab`.
    pub(crate) fn elf32_with_text(text: &[u8], addr: u32) -> Vec<u8> {
        let shstrtab = b"\0.text\0.shstrtab\0";
        let text_off = 52;
        let strtab_off = text_off + text.len();
        let shoff = (strtab_off + shstrtab.len()).div_ceil(4) * 4;

        let mut data = vec![0u8; shoff];
        data[..4].copy_from_slice(b"\x7fELF");
        // ELFCLASS32, little endian
        data[4] = 1;
        data[5] = 1;
        data[6] = 1;
        data[16..18].copy_from_slice(&2u16.to_le_bytes());
        data[18..20].copy_from_slice(&0x28u16.to_le_bytes());
        data[20..24].copy_from_slice(&1u32.to_le_bytes());
        data[32..36].copy_from_slice(&(shoff as u32).to_le_bytes());
        data[40..42].copy_from_slice(&52u16.to_le_bytes());
        data[46..48].copy_from_slice(&40u16.to_le_bytes());
        data[48..50].copy_from_slice(&3u16.to_le_bytes());
        data[50..52].copy_from_slice(&2u16.to_le_bytes());
        data[text_off..strtab_off].copy_from_slice(text);
        data[strtab_off..strtab_off + shstrtab.len()].copy_from_slice(shstrtab);

        let mut section = |name: u32, kind: u32, addr: u32, off: usize, size: usize| {
            let mut sh = [0u8; 40];
            sh[0..4].copy_from_slice(&name.to_le_bytes());
            sh[4..8].copy_from_slice(&kind.to_le_bytes());
            sh[12..16].copy_from_slice(&addr.to_le_bytes());
            sh[16..20].copy_from_slice(&(off as u32).to_le_bytes());
            sh[20..24].copy_from_slice(&(size as u32).to_le_bytes());
            data.extend_from_slice(&sh);
        };
        section(0, 0, 0, 0, 0);
        section(1, 1, addr, text_off, text.len());
        section(7, 3, 0, strtab_off, shstrtab.len());
        data
    }

    #[test]
    fn test_sniff() {
        assert!(is_elf(&elf32_with_text(&[0; 4], 0)));
        // first byte is not checked
        let mut data = vec![0u8; 16];
        data[1..4].copy_from_slice(b"ELF");
        assert!(is_elf(&data));
        assert!(!is_elf(b"\x7fELF"));
        assert!(!is_elf(&[0u8; 64]));
    }

    #[test]
    fn test_text_section() {
        let data = elf32_with_text(&[0xde, 0xad, 0xbe, 0xef], 0x0800_0000);
        let images = parse_elf(&data).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].name(), ".text");
        assert_eq!(images[0].elements()[0].address(), 0x0800_0000);
        assert_eq!(&*images[0].contents(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_no_text_section() {
        let mut data = elf32_with_text(&[1, 2, 3, 4], 0);
        // rename ".text" to ".data"
        data[57..62].copy_from_slice(b".data");
        assert!(matches!(parse_elf(&data), Err(FirmwareError::NoFirmware)));
    }

    #[test]
    fn test_bad_section_header_size() {
        let mut data = elf32_with_text(&[1, 2, 3, 4], 0);
        // e_shentsize
        data[46..48].copy_from_slice(&32u16.to_le_bytes());
        assert!(matches!(parse_elf(&data), Err(FirmwareError::InvalidElf(_))));
    }

    #[test]
    fn test_section_data_out_of_range() {
        let mut data = elf32_with_text(&[1, 2, 3, 4], 0);
        // sh_size of .text, the second section header
        let size_at = data.len() - 2 * 40 + 20;
        data[size_at..size_at + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(matches!(parse_elf(&data), Err(FirmwareError::InvalidElf(_))));
    }

    #[test]
    fn test_truncated() {
        let data = elf32_with_text(&[1, 2, 3, 4], 0);
        assert!(matches!(
            parse_elf(&data[..data.len() - 10]),
            Err(FirmwareError::InvalidElf(_))
        ));
    }
}
