//! DFU firmware file formats
//!
//! Reads and writes firmware containers used for USB Device Firmware Upgrade:
//! - plain DFU 1.0 images with the trailing DFU suffix
//! - ST Microelectronics DfuSe multi-target files
//! - ELF objects (read only, the `.text` section is extracted)
//!
//! # Example
//!
//! ```
//! use firmware::{DfuFirmware, DfuFirmwareFormat, ParseFlags};
//!
//! let mut firmware = DfuFirmware::new();
//! firmware.set_vid(0x273f);
//! firmware.set_pid(0x1004);
//! firmware.set_contents(vec![0u8; 64]);
//!
//! let data = firmware.write_data().unwrap();
//! let parsed = DfuFirmware::parse(&data, ParseFlags::NONE).unwrap();
//! assert_eq!(parsed.format(), DfuFirmwareFormat::Dfu1_0);
//! assert_eq!(parsed.vid(), 0x273f);
//! ```

pub mod codec;
mod elf;
mod error;
mod firmware;
mod image;

// Re-exports
pub use elf::is_elf;
pub use error::FirmwareError;
pub use firmware::{DfuFirmware, DfuFirmwareFormat, ID_UNSET, ParseFlags, detect_format};
pub use image::{ALT_SETTING_UNSET, DfuElement, DfuImage};
