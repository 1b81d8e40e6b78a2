use std::io::Read;
use std::time::Duration;

use dfu::{
    DfuDevice, DfuError, DfuMode, NusbContext, OpenFlags, TransferFlags, UsbContext, UsbDevice,
};
use firmware::{DfuFirmware, FirmwareError, ParseFlags};
use log::{debug, info, warn};

/// How long a detached device gets to re-enumerate in DFU mode
const REPLUG_TIMEOUT: Duration = Duration::from_millis(5000);

/// A family of updatable devices.
pub trait Provider {
    fn name(&self) -> &str;

    /// Discover the devices already plugged in.
    fn coldplug(&mut self) -> Result<(), DfuError>;

    /// Flash `firmware` to the device at `platform_id` while it is running.
    fn update_online(
        &mut self,
        platform_id: &str,
        firmware: &mut dyn Read,
        flags: TransferFlags,
    ) -> Result<(), DfuError>;
}

/// Updates any DFU or DfuSe capable device.
pub struct DfuProvider<C: UsbContext + Clone> {
    ctx: C,
    vid: Option<u16>,
    pid: Option<u16>,
    devices: Vec<DfuDevice<C>>,
}

impl Default for DfuProvider<NusbContext> {
    fn default() -> Self {
        Self::new(NusbContext)
    }
}

impl<C: UsbContext + Clone> DfuProvider<C> {
    pub fn new(ctx: C) -> Self {
        Self {
            ctx,
            vid: None,
            pid: None,
            devices: Vec::new(),
        }
    }

    pub fn with_vendor_id(mut self, vid: u16) -> Self {
        self.vid.replace(vid);
        self
    }

    pub fn with_product_id(mut self, pid: u16) -> Self {
        self.pid.replace(pid);
        self
    }

    pub fn devices(&self) -> &[DfuDevice<C>] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [DfuDevice<C>] {
        &mut self.devices
    }

    fn device_mut(&mut self, platform_id: &str) -> Result<&mut DfuDevice<C>, DfuError> {
        self.devices
            .iter_mut()
            .find(|dev| dev.platform_id() == platform_id)
            .ok_or_else(|| DfuError::InvalidArgument(format!("no device at {platform_id}")))
    }
}

impl<C: UsbContext + Clone> Provider for DfuProvider<C> {
    fn name(&self) -> &str {
        "dfu"
    }

    fn coldplug(&mut self) -> Result<(), DfuError> {
        self.devices.clear();
        for dev in self.ctx.devices()? {
            if self.vid.is_some_and(|vid| vid != dev.vendor_id())
                || self.pid.is_some_and(|pid| pid != dev.product_id())
            {
                continue;
            }
            let platform_id = dev.platform_id();
            match DfuDevice::new(self.ctx.clone(), dev) {
                Ok(device) => {
                    debug!(
                        "{platform_id}: {:04x}:{:04x} in {} mode",
                        device.vendor_id(),
                        device.product_id(),
                        device.mode()
                    );
                    self.devices.push(device);
                }
                Err(DfuError::NotDfuCapable) => continue,
                Err(err) => warn!("{platform_id}: ignored, {err}"),
            }
        }
        info!("{}: {} device(s) found", self.name(), self.devices.len());
        Ok(())
    }

    fn update_online(
        &mut self,
        platform_id: &str,
        firmware: &mut dyn Read,
        flags: TransferFlags,
    ) -> Result<(), DfuError> {
        let mut data = Vec::new();
        firmware
            .read_to_end(&mut data)
            .map_err(FirmwareError::from)?;
        let firmware = DfuFirmware::parse(&data, ParseFlags::NONE)?;

        let device = self.device_mut(platform_id)?;
        firmware.check_device_ids(device.runtime_vid(), device.runtime_pid())?;

        if device.mode() == DfuMode::Runtime {
            let mut target = device
                .target_at(0)
                .ok_or_else(|| DfuError::TargetNotFound("index 0".into()))?;
            target.open(OpenFlags::NONE)?;
            let timeout = target
                .descriptor()
                .map(|desc| Duration::from_millis(desc.detach_timeout().into()))
                .unwrap_or(REPLUG_TIMEOUT);
            target.detach(timeout)?;
            target.wait_for_reset(REPLUG_TIMEOUT, None)?;
        }

        device.download(&firmware, flags, None)?;
        info!("{platform_id}: {} byte(s) written", data.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dfu::ErrorKind;
    use firmware::ID_UNSET;
    use dfu::mock::{FakeClock, MockContext, MockDevice};

    fn firmware_file(vid: u16, pid: u16, contents: Vec<u8>) -> Vec<u8> {
        let mut fw = DfuFirmware::new();
        fw.set_vid(vid);
        fw.set_pid(pid);
        fw.set_contents(contents);
        fw.write_data().unwrap()
    }

    #[test]
    fn test_coldplug() {
        let dfu = MockDevice::dfu(0x0483, 0xdf11);
        let other = MockDevice::new(0x046d, 0xc077, Vec::new());
        other.state_mut().platform_id = "mock-2".into();
        let mut provider = DfuProvider::new(MockContext::new(vec![dfu, other]));

        provider.coldplug().unwrap();
        assert_eq!(provider.name(), "dfu");
        assert_eq!(provider.devices().len(), 1);
        assert_eq!(provider.devices()[0].vendor_id(), 0x0483);
    }

    #[test]
    fn test_coldplug_filter() {
        let dfu = MockDevice::dfu(0x0483, 0xdf11);
        let ctx = MockContext::new(vec![dfu]);

        let mut provider = DfuProvider::new(ctx.clone()).with_vendor_id(0x1209);
        provider.coldplug().unwrap();
        assert!(provider.devices().is_empty());

        let mut provider = DfuProvider::new(ctx)
            .with_vendor_id(0x0483)
            .with_product_id(0xdf11);
        provider.coldplug().unwrap();
        assert_eq!(provider.devices().len(), 1);
    }

    #[test]
    fn test_update_online() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        let mut provider = DfuProvider::new(MockContext::new(vec![dev.clone()]));
        provider.coldplug().unwrap();
        provider.devices_mut()[0].set_clock(Box::new(FakeClock::new()));

        let data = firmware_file(ID_UNSET, ID_UNSET, vec![0xa5; 100]);
        provider
            .update_online("mock-1", &mut data.as_slice(), TransferFlags::VERIFY)
            .unwrap();
        assert_eq!(dev.state().memory, vec![0xa5; 100]);
    }

    #[test]
    fn test_update_online_from_runtime() {
        let app = MockDevice::runtime(0x1234, 0x0001);
        let bootloader = MockDevice::dfu(0x1234, 0x0002);
        let ctx = MockContext::new(vec![app.clone()]);
        let mut provider = DfuProvider::new(ctx.clone());
        provider.coldplug().unwrap();
        provider.devices_mut()[0].set_clock(Box::new(FakeClock::new()));
        ctx.script_replug([None, Some(bootloader.clone())]);

        let data = firmware_file(0x1234, 0x0001, vec![0x3c; 64]);
        provider
            .update_online("mock-1", &mut data.as_slice(), TransferFlags::NONE)
            .unwrap();
        assert_eq!(app.state().detaches, vec![1000]);
        assert_eq!(bootloader.state().memory, vec![0x3c; 64]);
    }

    #[test]
    fn test_update_online_wrong_device() {
        let app = MockDevice::runtime(0x1234, 0x0001);
        let mut provider = DfuProvider::new(MockContext::new(vec![app.clone()]));
        provider.coldplug().unwrap();

        let data = firmware_file(0x1234, 0x0002, vec![0; 16]);
        let err = provider
            .update_online("mock-1", &mut data.as_slice(), TransferFlags::NONE)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(app.state().detaches.is_empty());

        let err = provider
            .update_online("mock-9", &mut data.as_slice(), TransferFlags::NONE)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
