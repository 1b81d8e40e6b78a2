use std::time::Duration;

use firmware::{ALT_SETTING_UNSET, DfuFirmware, DfuFirmwareFormat, ID_UNSET};
use log::{debug, info};

use crate::usb::{UsbContext, UsbDevice};
use crate::{
    Cancellable, Clock, DfuError, DfuInterface, DfuMode, DfuTarget, OpenFlags, SystemClock,
    TransferFlags,
};

/// Interval between two bus scans while waiting for a replug
pub const REPLUG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// DFU device representation
///
/// Owns the USB device handle and one [DfuInterface] per DFU alternate
/// setting. Protocol operations go through a [DfuTarget] borrowed from the
/// device, so only one target can be driven at a time.
pub struct DfuDevice<C: UsbContext> {
    ctx: C,
    dev: C::Device,
    interfaces: Vec<DfuInterface>,
    device_open: bool,
    runtime_vid: u16,
    runtime_pid: u16,
    pub(crate) clock: Box<dyn Clock>,
}

impl<C: UsbContext> DfuDevice<C> {
    /// Wrap `dev`, failing with [DfuError::NotDfuCapable] when it exposes
    /// no DFU interface.
    pub fn new(ctx: C, mut dev: C::Device) -> Result<Self, DfuError> {
        let interfaces = dfu_interfaces(&mut dev)?;
        let (runtime_vid, runtime_pid) = if interfaces.iter().any(|i| i.mode() == DfuMode::Runtime)
        {
            (dev.vendor_id(), dev.product_id())
        } else {
            (ID_UNSET, ID_UNSET)
        };
        Ok(Self {
            ctx,
            dev,
            interfaces,
            device_open: false,
            runtime_vid,
            runtime_pid,
            clock: Box::new(SystemClock),
        })
    }

    pub fn usb_device(&self) -> &C::Device {
        &self.dev
    }

    pub fn platform_id(&self) -> String {
        self.dev.platform_id()
    }

    pub fn vendor_id(&self) -> u16 {
        self.dev.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.dev.product_id()
    }

    pub fn runtime_vid(&self) -> u16 {
        self.runtime_vid
    }

    pub fn set_runtime_vid(&mut self, vid: u16) {
        self.runtime_vid = vid;
    }

    pub fn runtime_pid(&self) -> u16 {
        self.runtime_pid
    }

    pub fn set_runtime_pid(&mut self, pid: u16) {
        self.runtime_pid = pid;
    }

    /// Replace the clock driving the polling loops.
    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    /// DFU interfaces and alternate settings combined
    pub fn interfaces(&self) -> &[DfuInterface] {
        &self.interfaces
    }

    pub fn mode(&self) -> DfuMode {
        self.interfaces
            .first()
            .map_or(DfuMode::Unknown, DfuInterface::mode)
    }

    pub fn is_open(&self) -> bool {
        self.device_open
    }

    pub fn open(&mut self) -> Result<(), DfuError> {
        if self.device_open {
            return Ok(());
        }
        self.dev.open().map_err(|err| DfuError::Open {
            platform_id: self.dev.platform_id(),
            source: Box::new(err),
        })?;
        self.device_open = true;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), DfuError> {
        if self.device_open {
            self.dev.close()?;
            self.device_open = false;
            for intf in &mut self.interfaces {
                intf.claimed = false;
            }
        }
        Ok(())
    }

    pub fn target_at(&mut self, index: usize) -> Option<DfuTarget<'_, C>> {
        if index < self.interfaces.len() {
            Some(DfuTarget::new(self, index))
        } else {
            None
        }
    }

    pub fn target(&mut self, alt_setting: u8) -> Result<DfuTarget<'_, C>, DfuError> {
        let index = self
            .index_of(alt_setting)
            .ok_or_else(|| DfuError::TargetNotFound(format!("alt-setting {alt_setting}")))?;
        Ok(DfuTarget::new(self, index))
    }

    pub fn target_by_name(&mut self, alt_name: &str) -> Result<DfuTarget<'_, C>, DfuError> {
        let index = self
            .interfaces
            .iter()
            .position(|i| i.alt_name() == Some(alt_name))
            .ok_or_else(|| DfuError::TargetNotFound(format!("alt-name {alt_name}")))?;
        Ok(DfuTarget::new(self, index))
    }

    pub(crate) fn index_of(&self, alt_setting: u8) -> Option<usize> {
        self.interfaces
            .iter()
            .position(|i| i.alt_setting() == alt_setting)
    }

    pub(crate) fn interface(&self, index: usize) -> &DfuInterface {
        &self.interfaces[index]
    }

    pub(crate) fn interface_mut(&mut self, index: usize) -> &mut DfuInterface {
        &mut self.interfaces[index]
    }

    pub(crate) fn dev(&self) -> &C::Device {
        &self.dev
    }

    pub(crate) fn dev_mut(&mut self) -> &mut C::Device {
        &mut self.dev
    }

    /// Wait for the device to leave the bus and come back with a new VID:PID.
    ///
    /// The bus is sampled every [REPLUG_POLL_INTERVAL]. On success the
    /// device handle and every interface are rebound to the new device,
    /// which is then reopened. Running out of time while the device is
    /// missing gives [DfuError::DeviceGoneAway]; any other timeout gives
    /// [DfuError::SameVidPid].
    pub fn wait_for_replug(
        &mut self,
        timeout: Duration,
        cancellable: Option<&Cancellable>,
    ) -> Result<(), DfuError> {
        let platform_id = self.dev.platform_id();
        let vid = self.dev.vendor_id();
        let pid = self.dev.product_id();
        let mut gone = false;

        let polls = timeout.as_millis() / REPLUG_POLL_INTERVAL.as_millis();
        for _ in 0..polls {
            Cancellable::check(cancellable)?;
            self.clock.sleep(REPLUG_POLL_INTERVAL);
            match self.ctx.find_by_platform_id(&platform_id)? {
                None => {
                    debug!("{platform_id} not on the bus");
                    gone = true;
                }
                Some(dev) if dev.vendor_id() != vid || dev.product_id() != pid => {
                    info!(
                        "{platform_id} came back as {:04x}:{:04x}",
                        dev.vendor_id(),
                        dev.product_id()
                    );
                    return self.set_new_usb_dev(dev);
                }
                Some(_) => gone = false,
            }
        }

        if gone {
            Err(DfuError::DeviceGoneAway)
        } else {
            Err(DfuError::SameVidPid)
        }
    }

    fn set_new_usb_dev(&mut self, mut dev: C::Device) -> Result<(), DfuError> {
        for intf in &mut self.interfaces {
            if intf.claimed {
                let _ = self.dev.release_interface(intf.interface());
                intf.claimed = false;
            }
        }
        self.close()?;

        let mut interfaces = dfu_interfaces(&mut dev)?;
        for intf in &mut interfaces {
            intf.transfer_size = self
                .interfaces
                .iter()
                .find(|old| old.alt_setting() == intf.alt_setting())
                .and_then(|old| old.transfer_size);
        }
        self.dev = dev;
        self.interfaces = interfaces;
        self.open()
    }

    /// Issue a USB bus reset. The device handle is closed afterwards.
    pub fn reset_bus(&mut self) -> Result<(), DfuError> {
        debug!("resetting {}", self.dev.platform_id());
        self.dev
            .reset()
            .map_err(|err| DfuError::Reset(Box::new(err)))?;
        self.device_open = false;
        for intf in &mut self.interfaces {
            intf.claimed = false;
        }
        Ok(())
    }

    /// Read back every target into one firmware container.
    pub fn upload(&mut self, cancellable: Option<&Cancellable>) -> Result<DfuFirmware, DfuError> {
        let mut firmware = DfuFirmware::new();
        firmware.set_vid(self.runtime_vid);
        firmware.set_pid(self.runtime_pid);

        for index in 0..self.interfaces.len() {
            let mut target = DfuTarget::new(self, index);
            let was_open = target.is_open();
            target.open(OpenFlags::NONE)?;
            let image = target.upload(0, TransferFlags::NONE, cancellable)?;
            if !was_open {
                target.close()?;
            }
            firmware.add_image(image);
        }

        if self.interfaces.len() > 1 {
            debug!("switching to DfuSe automatically");
            firmware.set_format(DfuFirmwareFormat::DfuSe);
        } else {
            firmware.set_format(DfuFirmwareFormat::Dfu1_0);
        }
        Ok(firmware)
    }

    /// Write every image of `firmware` to the target with the same alt-setting.
    ///
    /// Images without an alt-setting go to the first target. A host reset,
    /// if requested, is issued once after the last image.
    pub fn download(
        &mut self,
        firmware: &DfuFirmware,
        flags: TransferFlags,
        cancellable: Option<&Cancellable>,
    ) -> Result<(), DfuError> {
        if firmware.images().is_empty() {
            return Err(DfuError::Firmware(firmware::FirmwareError::NoImages));
        }
        let image_flags = if flags.contains(TransferFlags::VERIFY) {
            TransferFlags::VERIFY
        } else {
            TransferFlags::NONE
        };

        for image in firmware.images() {
            let mut target = if image.alt_setting() == ALT_SETTING_UNSET {
                DfuTarget::new(self, 0)
            } else {
                self.target(image.alt_setting())?
            };
            let was_open = target.is_open();
            target.open(OpenFlags::NONE)?;
            target.download(image, image_flags, cancellable)?;
            if !was_open {
                target.close()?;
            }
        }

        if flags.contains(TransferFlags::HOST_RESET) {
            self.reset_bus()?;
        }
        Ok(())
    }
}

impl<C: UsbContext> Drop for DfuDevice<C> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn dfu_interfaces<D: UsbDevice>(dev: &mut D) -> Result<Vec<DfuInterface>, DfuError> {
    let interfaces: Vec<DfuInterface> = dev
        .interfaces()?
        .iter()
        .filter(|info| info.is_dfu())
        .map(DfuInterface::new)
        .collect();
    if interfaces.is_empty() {
        Err(DfuError::NotDfuCapable)
    } else {
        Ok(interfaces)
    }
}
