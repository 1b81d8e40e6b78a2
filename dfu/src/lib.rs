//! USB Device Firmware Upgrade (DFU) implementation based on [`nusb`]
//!
//! Provides a portable implementation of the DFU 1.1 protocol with STM32
//! extensions (aka "DfuSe"): device discovery, the target state machine,
//! detach and replug handling, chunked upload and download with optional
//! verification. Firmware files are handled by the [`firmware`] crate.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! The following example shows how to obtain a `Vec` of [DfuDevice]:
//! ```
//! use dfu::find_dfu_devices;
//!
//! match find_dfu_devices(None, None) {
//!     Ok(devices) => {
//!         if devices.is_empty() {
//!             println!("No DFU devices found");
//!         } else {
//!             println!("Found {} DFU devices", devices.len());
//!         }
//!     }
//!     Err(e) => println!("Error: {e}"),
//! }
//! ```
//!
//! All operations block the calling thread. Polling loops sleep through a
//! [Clock] and stop early when their [Cancellable] is cancelled.
//!
//! [`nusb`]: https://docs.rs/nusb

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub const DEFAULT_TRANSFER_SIZE: u16 = 1024 * 2;

mod backend;
mod descriptor;
mod device;
mod error;
mod interface;
mod memory;
mod poll;
mod state;
mod target;
mod usb;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::time::Duration;

// Re-exports
pub use backend::{NusbContext, NusbDevice, find_dfu_devices};
pub use descriptor::{DFUSE_VERSION_NUMBER, DfuDescriptor};
pub use device::{DfuDevice, REPLUG_POLL_INTERVAL};
pub use error::{DfuError, ErrorKind};
pub use interface::DfuInterface;
pub use memory::{DfuMemSegment, DfuMemory};
pub use poll::{Cancellable, Clock, SystemClock};
pub use state::{DfuMode, DfuState, DfuStatus, StatusReport};
pub use target::{DfuTarget, OpenFlags, TransferFlags};
pub use usb::{UsbContext, UsbDevice, UsbInterfaceInfo};
