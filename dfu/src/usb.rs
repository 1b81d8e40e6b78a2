//! USB access used by the DFU layer.
//!
//! [`crate::NusbContext`] implements these traits on top of `nusb`; tests
//! use the scripted backend in `mock`.

use std::time::Duration;

use crate::{DfuDescriptor, DfuError};

pub(crate) const DFU_CLASS: u8 = 0xFE;
pub(crate) const DFU_SUBCLASS: u8 = 0x1;

/// One interface alternate setting as reported by the device descriptors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsbInterfaceInfo {
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Interface string descriptor, if any
    pub name: Option<String>,
    /// DFU functional descriptor attached to the interface, if any
    pub functional: Option<DfuDescriptor>,
}

impl UsbInterfaceInfo {
    pub fn is_dfu(&self) -> bool {
        self.class == DFU_CLASS && self.subclass == DFU_SUBCLASS
    }
}

/// A physical USB device.
///
/// Control requests are class requests addressed to an interface.
pub trait UsbDevice {
    /// Bus location, stable across re-enumeration.
    fn platform_id(&self) -> String;
    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;
    fn release(&self) -> u16;
    /// Max packet size of the default control endpoint.
    fn max_packet_size(&self) -> u16;

    fn open(&mut self) -> Result<(), DfuError>;
    fn close(&mut self) -> Result<(), DfuError>;
    fn interfaces(&mut self) -> Result<Vec<UsbInterfaceInfo>, DfuError>;
    fn claim_interface(&mut self, interface: u8) -> Result<(), DfuError>;
    fn release_interface(&mut self, interface: u8) -> Result<(), DfuError>;
    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), DfuError>;

    fn control_in(
        &self,
        interface: u8,
        request: u8,
        value: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, DfuError>;

    fn control_out(
        &self,
        interface: u8,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), DfuError>;

    fn reset(&mut self) -> Result<(), DfuError>;
}

/// Enumerates devices on the bus.
pub trait UsbContext {
    type Device: UsbDevice;

    fn devices(&self) -> Result<Vec<Self::Device>, DfuError>;

    fn find_by_platform_id(&self, platform_id: &str) -> Result<Option<Self::Device>, DfuError> {
        Ok(self
            .devices()?
            .into_iter()
            .find(|dev| dev.platform_id() == platform_id))
    }
}
