use std::collections::HashMap;
use std::num::NonZeroU8;
use std::time::Duration;

use nusb::{
    self, MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::descriptor::{DFU_DESC_LEN, DFU_DESC_TYPE};
use crate::usb::{DFU_CLASS, DFU_SUBCLASS, UsbContext, UsbDevice, UsbInterfaceInfo};
use crate::{DEFAULT_TIMEOUT, DfuDescriptor, DfuDevice, DfuError};

/// Devices on the host bus, as seen by `nusb`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NusbContext;

impl UsbContext for NusbContext {
    type Device = NusbDevice;

    fn devices(&self) -> Result<Vec<NusbDevice>, DfuError> {
        Ok(nusb::list_devices().wait()?.map(NusbDevice::new).collect())
    }
}

pub struct NusbDevice {
    info: nusb::DeviceInfo,
    handle: Option<nusb::Device>,
    claimed: HashMap<u8, nusb::Interface>,
    max_packet_size: u16,
}

impl NusbDevice {
    pub fn new(info: nusb::DeviceInfo) -> Self {
        Self {
            info,
            handle: None,
            claimed: HashMap::new(),
            max_packet_size: 0,
        }
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.info
    }

    fn handle(&self) -> Result<&nusb::Device, DfuError> {
        self.handle.as_ref().ok_or(DfuError::NotOpen)
    }

    fn claimed(&self, interface: u8) -> Result<&nusb::Interface, DfuError> {
        self.claimed.get(&interface).ok_or(DfuError::NotOpen)
    }
}

impl UsbDevice for NusbDevice {
    fn platform_id(&self) -> String {
        let ports: Vec<String> = self
            .info
            .port_chain()
            .iter()
            .map(u8::to_string)
            .collect();
        format!("{}-{}", self.info.bus_id(), ports.join("."))
    }

    fn vendor_id(&self) -> u16 {
        self.info.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.info.product_id()
    }

    fn release(&self) -> u16 {
        self.info.device_version()
    }

    fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    fn open(&mut self) -> Result<(), DfuError> {
        if self.handle.is_none() {
            let dev = self.info.open().wait()?;
            self.max_packet_size = dev.device_descriptor().max_packet_size_0() as u16;
            self.handle = Some(dev);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DfuError> {
        self.claimed.clear();
        self.handle = None;
        Ok(())
    }

    fn interfaces(&mut self) -> Result<Vec<UsbInterfaceInfo>, DfuError> {
        let dev = match &self.handle {
            Some(dev) => dev.clone(),
            None => self.info.open().wait()?,
        };
        let mut interfaces = Vec::new();
        for config in dev.configurations() {
            for alt in config.interface_alt_settings() {
                let is_dfu = alt.class() == DFU_CLASS && alt.subclass() == DFU_SUBCLASS;
                let (name, functional) = if is_dfu {
                    (
                        alt.string_index()
                            .and_then(|idx| get_string_descriptor(&dev, idx, DEFAULT_TIMEOUT)),
                        alt.descriptors()
                            .find(is_dfu_descriptor)
                            .and_then(|desc| DfuDescriptor::parse(&desc)),
                    )
                } else {
                    (None, None)
                };
                interfaces.push(UsbInterfaceInfo {
                    number: alt.interface_number(),
                    alt_setting: alt.alternate_setting(),
                    class: alt.class(),
                    subclass: alt.subclass(),
                    protocol: alt.protocol(),
                    name,
                    functional,
                });
            }
        }
        Ok(interfaces)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), DfuError> {
        if !self.claimed.contains_key(&interface) {
            let intf = self.handle()?.claim_interface(interface).wait()?;
            self.claimed.insert(interface, intf);
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), DfuError> {
        self.claimed.remove(&interface);
        Ok(())
    }

    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), DfuError> {
        Ok(self.claimed(interface)?.set_alt_setting(alt_setting).wait()?)
    }

    fn control_in(
        &self,
        interface: u8,
        request: u8,
        value: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, DfuError> {
        Ok(self
            .claimed(interface)?
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: interface as u16,
                    length,
                },
                timeout,
            )
            .wait()?)
    }

    fn control_out(
        &self,
        interface: u8,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), DfuError> {
        Ok(self
            .claimed(interface)?
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: interface as u16,
                    data,
                },
                timeout,
            )
            .wait()?)
    }

    fn reset(&mut self) -> Result<(), DfuError> {
        self.claimed.clear();
        match self.handle.take() {
            Some(dev) => Ok(dev.reset().wait()?),
            None => {
                let dev = self.info.open().wait()?;
                Ok(dev.reset().wait()?)
            }
        }
    }
}

fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}

fn is_dfu_descriptor(desc: &nusb::descriptors::Descriptor) -> bool {
    desc.descriptor_len() == DFU_DESC_LEN && desc.descriptor_type() == DFU_DESC_TYPE
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// Enumerate DFU-capable devices, optionally filtered by VID and PID.
pub fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuDevice<NusbContext>>, DfuError> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect();
    let mut dfu_devices = Vec::with_capacity(devices.len());
    for info in devices {
        match DfuDevice::new(NusbContext, NusbDevice::new(info)) {
            Ok(device) => dfu_devices.push(device),
            Err(DfuError::NotDfuCapable) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(dfu_devices)
}
