use std::ops::BitOr;
use std::time::Duration;

use firmware::{DfuElement, DfuImage};
use log::{debug, warn};

use crate::memory::DfuMemory;
use crate::state::DFU_STATUS_LEN;
use crate::usb::{UsbContext, UsbDevice};
use crate::{
    Cancellable, DEFAULT_TIMEOUT, DEFAULT_TRANSFER_SIZE, DfuDescriptor, DfuDevice, DfuError,
    DfuInterface, DfuMode, DfuState, DfuStatus, StatusReport,
};

const DFU_CMD_DETACH: u8 = 0;
const DFU_CMD_DOWNLOAD: u8 = 1;
const DFU_CMD_UPLOAD: u8 = 2;
const DFU_CMD_GETSTATUS: u8 = 3;
const DFU_CMD_CLRSTATUS: u8 = 4;
const DFU_CMD_GETSTATE: u8 = 5;
const DFU_CMD_ABORT: u8 = 6;

const DFUSE_CMD_ADDR: u8 = 0x21;
const DFUSE_CMD_ERASE: u8 = 0x41;
/// First data block number; lower numbers carry DfuSe commands.
const DFUSE_DATA_BLOCK: u16 = 2;

/// Options for [DfuTarget::open]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags(0);
    /// Do not read the device status after claiming the interface
    pub const NO_AUTO_REFRESH: OpenFlags = OpenFlags(1 << 0);

    pub fn contains(&self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Options for upload and download
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferFlags(u32);

impl TransferFlags {
    pub const NONE: TransferFlags = TransferFlags(0);
    /// Read the data back after a download and compare it
    ///
    /// Plain DFU devices that are not manifestation tolerant leave DFU mode
    /// after manifesting, so the read back is skipped for them and the
    /// download still succeeds. Check
    /// [DfuDescriptor::manifestation_tolerant] to tell the cases apart.
    pub const VERIFY: TransferFlags = TransferFlags(1 << 0);
    /// Reset the bus once the download has been manifested
    pub const HOST_RESET: TransferFlags = TransferFlags(1 << 1);

    pub fn contains(&self, other: TransferFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TransferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        TransferFlags(self.0 | rhs.0)
    }
}

/// One DFU alternate setting of a [DfuDevice], ready for protocol operations.
///
/// A target borrows its device mutably, which serializes every operation on
/// the shared USB handle.
pub struct DfuTarget<'a, C: UsbContext> {
    device: &'a mut DfuDevice<C>,
    index: usize,
}

impl<'a, C: UsbContext> DfuTarget<'a, C> {
    pub(crate) fn new(device: &'a mut DfuDevice<C>, index: usize) -> Self {
        Self { device, index }
    }

    fn intf(&self) -> &DfuInterface {
        self.device.interface(self.index)
    }

    fn intf_mut(&mut self) -> &mut DfuInterface {
        self.device.interface_mut(self.index)
    }

    pub fn interface(&self) -> &DfuInterface {
        self.intf()
    }
    pub fn interface_number(&self) -> u8 {
        self.intf().interface()
    }
    pub fn alt_setting(&self) -> u8 {
        self.intf().alt_setting()
    }
    pub fn alt_name(&self) -> Option<&str> {
        self.intf().alt_name()
    }
    pub fn mode(&self) -> DfuMode {
        self.intf().mode()
    }
    pub fn descriptor(&self) -> Option<&DfuDescriptor> {
        self.intf().descriptor()
    }
    pub fn layout(&self) -> Option<&DfuMemory> {
        self.intf().layout()
    }
    pub fn is_open(&self) -> bool {
        self.intf().is_open()
    }
    pub fn state(&self) -> Option<DfuState> {
        self.intf().state()
    }
    pub fn status(&self) -> Option<DfuStatus> {
        self.intf().status()
    }

    /// Chunk size used for upload and download.
    ///
    /// Unless set explicitly this is `wTransferSize` from the functional
    /// descriptor, else the control endpoint packet size, else 2048 bytes.
    pub fn transfer_size(&self) -> u16 {
        let intf = self.intf();
        intf.transfer_size
            .or_else(|| intf.descriptor().map(|d| d.transfer_size()))
            .filter(|&size| size > 0)
            .or_else(|| Some(self.device.dev().max_packet_size()).filter(|&size| size > 0))
            .unwrap_or(DEFAULT_TRANSFER_SIZE)
    }

    /// Override the chunk size; 0 restores the default.
    pub fn set_transfer_size(&mut self, transfer_size: u16) {
        self.intf_mut().transfer_size = (transfer_size > 0).then_some(transfer_size);
    }

    /// Claim the interface and select the alternate setting.
    pub fn open(&mut self, flags: OpenFlags) -> Result<(), DfuError> {
        if self.is_open() {
            return Ok(());
        }
        self.device.open()?;
        let (number, alt) = (self.interface_number(), self.alt_setting());
        let dev = self.device.dev_mut();
        dev.claim_interface(number)?;
        dev.set_alt_setting(number, alt)?;
        self.intf_mut().claimed = true;
        debug!("claimed interface {number} alt {alt}");

        if !flags.contains(OpenFlags::NO_AUTO_REFRESH) && self.mode() == DfuMode::Dfu {
            self.refresh()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), DfuError> {
        if !self.is_open() {
            return Ok(());
        }
        let number = self.interface_number();
        self.device.dev_mut().release_interface(number)?;
        self.intf_mut().claimed = false;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DfuError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DfuError::NotOpen)
        }
    }

    fn ensure_dfu_mode(&self) -> Result<(), DfuError> {
        self.ensure_open()?;
        if self.mode() == DfuMode::Runtime {
            return Err(DfuError::RuntimeMode);
        }
        Ok(())
    }

    /// Send `DFU_GETSTATUS` and cache the reported state and status.
    pub fn get_status(&mut self) -> Result<StatusReport, DfuError> {
        self.ensure_open()?;
        let data = self.dfu_cmd_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN)?;
        let st = StatusReport::from_raw(&data)?;
        let intf = self.intf_mut();
        if intf.state != Some(st.state) {
            debug!("state {} -> {}", intf.state.map_or("?", |s| s.as_str()), st.state);
        }
        intf.state = Some(st.state);
        intf.status = Some(st.status);
        Ok(st)
    }

    pub fn refresh(&mut self) -> Result<(), DfuError> {
        self.get_status().map(|_| ())
    }

    /// Send `DFU_GETSTATE`, which does not change the device state.
    pub fn get_state(&mut self) -> Result<DfuState, DfuError> {
        self.ensure_open()?;
        let data = self.dfu_cmd_in(DFU_CMD_GETSTATE, 0, 1)?;
        let raw = *data.first().ok_or(DfuError::ResponseTooShort {
            got: 0,
            expected: 1,
        })?;
        let state = DfuState::try_from(raw).map_err(|_| DfuError::UnknownState(raw))?;
        self.intf_mut().state = Some(state);
        Ok(state)
    }

    pub fn clear_status(&mut self) -> Result<(), DfuError> {
        self.ensure_open()?;
        self.dfu_cmd_out(DFU_CMD_CLRSTATUS, 0, &[])
    }

    pub fn abort(&mut self) -> Result<(), DfuError> {
        self.ensure_open()?;
        self.dfu_cmd_out(DFU_CMD_ABORT, 0, &[])
    }

    /// Bring the target back to `dfuIDLE` with an OK status.
    pub fn reset_state(&mut self) -> Result<(), DfuError> {
        let mut st = self.get_status()?;
        if st.status != DfuStatus::Ok {
            self.clear_status()?;
            st = self.get_status()?;
        }
        if st.state != DfuState::DfuIdle {
            self.abort()?;
            st = self.get_status()?;
        }
        st.ok()
    }

    /// Ask a runtime-mode target to switch to DFU mode.
    ///
    /// Devices that do not detach on their own get a bus reset. The caller
    /// then waits for the replug with [DfuTarget::wait_for_reset].
    pub fn detach(&mut self, timeout: Duration) -> Result<(), DfuError> {
        self.ensure_open()?;
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        debug!("detaching with a {timeout_ms} ms timeout");
        self.dfu_cmd_out(DFU_CMD_DETACH, timeout_ms, &[])?;
        if !self.descriptor().is_some_and(|d| d.will_detach()) {
            self.device.reset_bus()?;
        }
        Ok(())
    }

    /// Wait for the device to re-enumerate, then look this alt-setting up again.
    ///
    /// Fails with [DfuError::TargetNotFound] when the new device does not
    /// expose the alt-setting; the target then points at the first one.
    pub fn wait_for_reset(
        &mut self,
        timeout: Duration,
        cancellable: Option<&Cancellable>,
    ) -> Result<(), DfuError> {
        let alt = self.alt_setting();
        self.device.wait_for_replug(timeout, cancellable)?;
        match self.device.index_of(alt) {
            Some(index) => {
                self.index = index;
                Ok(())
            }
            None => {
                debug!("alt-setting {alt} is gone after replug");
                self.index = 0;
                Err(DfuError::TargetNotFound(format!("alt-setting {alt}")))
            }
        }
    }

    pub fn reset(&mut self) -> Result<(), DfuError> {
        self.device.reset_bus()
    }

    /// Read the target memory back.
    ///
    /// `offset` is the first block requested. The transfer ends on the first
    /// chunk shorter than the transfer size; DfuSe targets also stop at the
    /// end of their memory layout.
    pub fn upload(
        &mut self,
        offset: u16,
        flags: TransferFlags,
        cancellable: Option<&Cancellable>,
    ) -> Result<DfuImage, DfuError> {
        self.ensure_dfu_mode()?;
        if self.descriptor().is_some_and(|d| !d.can_upload()) {
            return Err(DfuError::NotSupported("upload"));
        }
        if flags.contains(TransferFlags::VERIFY) {
            debug!("verify has no meaning for an upload");
        }

        let (address, data) = match self.dfuse_layout() {
            Some(layout) => {
                let start = layout.start_addr();
                let data = self.dfuse_upload(start, offset, layout.size() as usize, cancellable)?;
                (start, data)
            }
            None => (0, self.upload_blocks(offset, usize::MAX, cancellable)?),
        };
        debug!("uploaded {} bytes", data.len());

        let mut image = DfuImage::new();
        image.set_alt_setting(self.alt_setting());
        if let Some(name) = self.alt_name() {
            image.set_name(name);
        }
        image.add_element(DfuElement::new(address, data));
        Ok(image)
    }

    /// Write `image` to the target.
    ///
    /// Plain DFU targets receive the concatenated contents; DfuSe targets
    /// are erased and written element by element at the element addresses.
    pub fn download(
        &mut self,
        image: &DfuImage,
        flags: TransferFlags,
        cancellable: Option<&Cancellable>,
    ) -> Result<(), DfuError> {
        self.ensure_dfu_mode()?;
        if self.descriptor().is_some_and(|d| !d.can_download()) {
            return Err(DfuError::NotSupported("download"));
        }

        match self.dfuse_layout() {
            Some(layout) => self.dfuse_download(&layout, image, flags, cancellable)?,
            None => self.dfu_download(&image.contents(), flags, cancellable)?,
        }

        if flags.contains(TransferFlags::HOST_RESET) {
            self.device.reset_bus()?;
        }
        Ok(())
    }

    fn dfuse_layout(&self) -> Option<DfuMemory> {
        if self.intf().is_dfuse() {
            self.layout().cloned()
        } else {
            None
        }
    }

    fn dfu_download(
        &mut self,
        data: &[u8],
        flags: TransferFlags,
        cancellable: Option<&Cancellable>,
    ) -> Result<(), DfuError> {
        let xfer_size = self.transfer_size() as usize;
        let mut block: u16 = 0;
        for chunk in data.chunks(xfer_size) {
            Cancellable::check(cancellable)?;
            self.dfu_dnload(block, chunk, cancellable)?;
            block = block.wrapping_add(1);
        }
        debug!("sent {} bytes in {block} blocks", data.len());

        Cancellable::check(cancellable)?;
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, block, &[])?;
        let tolerant = self.wait_manifest(cancellable)?;

        if flags.contains(TransferFlags::VERIFY) {
            if tolerant {
                let uploaded = self.upload_blocks(0, data.len(), cancellable)?;
                verify(data, &uploaded)?;
            } else {
                warn!("device is not manifestation tolerant, skipping verify");
            }
        }
        Ok(())
    }

    fn dfuse_download(
        &mut self,
        layout: &DfuMemory,
        image: &DfuImage,
        flags: TransferFlags,
        cancellable: Option<&Cancellable>,
    ) -> Result<(), DfuError> {
        let xfer_size = self.transfer_size() as usize;

        for element in image.elements() {
            let start = element.address();
            let end = u32::try_from(element.len())
                .ok()
                .and_then(|len| start.checked_add(len))
                .filter(|&end| start >= layout.start_addr() && end <= layout.end_addr())
                .ok_or_else(|| {
                    DfuError::InvalidArgument(format!(
                        "{} bytes at {start:#010x} do not fit in {}",
                        element.len(),
                        layout.name
                    ))
                })?;

            for page in layout.erase_pages(start, end) {
                Cancellable::check(cancellable)?;
                debug!("erasing page {page:#010x}");
                self.dfuse_command(DFUSE_CMD_ERASE, page, cancellable)?;
            }

            let mut addr = start;
            for chunk in element.contents().chunks(xfer_size) {
                Cancellable::check(cancellable)?;
                self.dfuse_command(DFUSE_CMD_ADDR, addr, cancellable)?;
                self.dfu_dnload(DFUSE_DATA_BLOCK, chunk, cancellable)?;
                addr += chunk.len() as u32;
            }
            debug!("wrote {} bytes at {start:#010x}", element.len());

            if flags.contains(TransferFlags::VERIFY) {
                let uploaded = self.dfuse_upload(start, 0, element.len(), cancellable)?;
                verify(element.contents(), &uploaded)?;
            }
        }

        // leave DFU mode, jumping to the start of the first element
        let entry = image
            .elements()
            .first()
            .map_or(layout.start_addr(), DfuElement::address);
        self.dfuse_command(DFUSE_CMD_ADDR, entry, cancellable)?;
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, 0, &[])?;
        self.wait_manifest(cancellable)?;
        Ok(())
    }

    /// Upload `max_len` bytes at most, starting at block `first_block`.
    fn upload_blocks(
        &mut self,
        first_block: u16,
        max_len: usize,
        cancellable: Option<&Cancellable>,
    ) -> Result<Vec<u8>, DfuError> {
        let xfer_size = self.transfer_size();
        let mut data = Vec::new();
        let mut block = first_block;
        while data.len() < max_len {
            Cancellable::check(cancellable)?;
            let chunk = self.dfu_cmd_in(DFU_CMD_UPLOAD, block, xfer_size)?;
            let last = chunk.len() < xfer_size as usize;
            data.extend_from_slice(&chunk);
            if last {
                break;
            }
            block = block.wrapping_add(1);
        }
        data.truncate(max_len);
        Ok(data)
    }

    fn dfuse_upload(
        &mut self,
        address: u32,
        offset: u16,
        length: usize,
        cancellable: Option<&Cancellable>,
    ) -> Result<Vec<u8>, DfuError> {
        self.dfuse_command(DFUSE_CMD_ADDR, address, cancellable)?;
        self.abort()?;
        let data =
            self.upload_blocks(DFUSE_DATA_BLOCK.saturating_add(offset), length, cancellable)?;
        self.abort()?;
        Ok(data)
    }

    fn dfuse_command(
        &mut self,
        cmd: u8,
        addr: u32,
        cancellable: Option<&Cancellable>,
    ) -> Result<(), DfuError> {
        let mut payload = vec![cmd];
        payload.extend_from_slice(&addr.to_le_bytes());
        self.dfu_dnload(0, &payload, cancellable)
    }

    fn dfu_dnload(
        &mut self,
        block: u16,
        data: &[u8],
        cancellable: Option<&Cancellable>,
    ) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, block, data)?;
        self.poll_until_idle(cancellable)
    }

    /// Poll until `dfuDNLOAD-IDLE`, sleeping the advertised poll timeout
    /// while the device is busy.
    fn poll_until_idle(&mut self, cancellable: Option<&Cancellable>) -> Result<(), DfuError> {
        loop {
            Cancellable::check(cancellable)?;
            let st = self.get_status()?;
            st.ok()?;
            match st.state {
                DfuState::DfuDnloadIdle => return Ok(()),
                DfuState::DfuDnbusy | DfuState::DfuDnloadSync => {
                    self.device.clock.sleep(st.poll_timeout)
                }
                state => {
                    return Err(DfuError::UnexpectedState {
                        state,
                        during: "download",
                    });
                }
            }
        }
    }

    /// Poll through manifestation after the final zero-length download.
    ///
    /// Returns whether the device is still usable, i.e. back in `dfuIDLE`.
    fn wait_manifest(&mut self, cancellable: Option<&Cancellable>) -> Result<bool, DfuError> {
        let tolerant = self.descriptor().is_none_or(|d| d.manifestation_tolerant());
        loop {
            Cancellable::check(cancellable)?;
            let st = self.get_status()?;
            st.ok()?;
            match st.state {
                DfuState::DfuIdle => return Ok(true),
                DfuState::DfuManifestWaitReset => return Ok(false),
                DfuState::DfuManifest if !tolerant => {
                    // no further requests are answered until the reset
                    self.device.clock.sleep(st.poll_timeout);
                    return Ok(false);
                }
                DfuState::DfuManifestSync | DfuState::DfuManifest => {
                    self.device.clock.sleep(st.poll_timeout)
                }
                state => {
                    return Err(DfuError::UnexpectedState {
                        state,
                        during: "manifestation",
                    });
                }
            }
        }
    }

    fn dfu_cmd_out(&mut self, req: u8, value: u16, data: &[u8]) -> Result<(), DfuError> {
        let number = self.interface_number();
        self.device
            .dev()
            .control_out(number, req, value, data, DEFAULT_TIMEOUT)
    }

    fn dfu_cmd_in(&mut self, req: u8, value: u16, length: u16) -> Result<Vec<u8>, DfuError> {
        let number = self.interface_number();
        self.device
            .dev()
            .control_in(number, req, value, length, DEFAULT_TIMEOUT)
    }
}

fn verify(sent: &[u8], uploaded: &[u8]) -> Result<(), DfuError> {
    match sent.iter().zip(uploaded).position(|(a, b)| a != b) {
        Some(offset) => Err(DfuError::VerifyFailed { offset }),
        None if uploaded.len() < sent.len() => Err(DfuError::VerifyFailed {
            offset: uploaded.len(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeClock, MockContext, MockDevice};
    use crate::{ErrorKind, device::REPLUG_POLL_INTERVAL};

    fn device(dev: &MockDevice, clock: &FakeClock) -> DfuDevice<MockContext> {
        let ctx = MockContext::new(vec![dev.clone()]);
        let mut device = DfuDevice::new(ctx, dev.clone()).unwrap();
        device.set_clock(Box::new(clock.clone()));
        device
    }

    fn image(contents: Vec<u8>) -> DfuImage {
        let mut image = DfuImage::new();
        image.set_contents(contents);
        image
    }

    #[test]
    fn test_flags() {
        let flags = TransferFlags::VERIFY | TransferFlags::HOST_RESET;
        assert!(flags.contains(TransferFlags::VERIFY));
        assert!(!TransferFlags::NONE.contains(TransferFlags::HOST_RESET));
        assert!(OpenFlags::NO_AUTO_REFRESH.contains(OpenFlags::NONE));
    }

    #[test]
    fn test_not_open() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();

        assert!(matches!(target.get_status(), Err(DfuError::NotOpen)));
        assert!(matches!(
            target.upload(0, TransferFlags::NONE, None),
            Err(DfuError::NotOpen)
        ));
        assert!(dev.state().requests.is_empty());
    }

    #[test]
    fn test_open_refreshes() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();

        target.open(OpenFlags::NONE).unwrap();
        assert_eq!(target.state(), Some(DfuState::DfuIdle));
        assert_eq!(target.status(), Some(DfuStatus::Ok));
        target.close().unwrap();
        target.close().unwrap();

        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NO_AUTO_REFRESH).unwrap();
        assert_eq!(dev.state().requests.len(), 1);
    }

    #[test]
    fn test_transfer_size() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        assert_eq!(target.transfer_size(), 64);
        target.set_transfer_size(16);
        assert_eq!(target.transfer_size(), 16);
        target.set_transfer_size(0);
        assert_eq!(target.transfer_size(), 64);

        let dev = MockDevice::runtime(0x1234, 0x0001);
        let mut device = super::tests::device(&dev, &FakeClock::new());
        let target = device.target(0).unwrap();
        assert_eq!(target.transfer_size(), 32);
    }

    #[test]
    fn test_upload() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        dev.state_mut().memory = (0..200u8).collect();
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        let image = target.upload(0, TransferFlags::NONE, None).unwrap();
        assert_eq!(image.contents().as_ref(), dev.state().memory.as_slice());
        assert_eq!(image.alt_setting(), 0);
        assert_eq!(image.name(), "Flash");

        // starting at the second block
        let image = target.upload(1, TransferFlags::NONE, None).unwrap();
        assert_eq!(image.len(), 200 - 64);
    }

    #[test]
    fn test_upload_exact_multiple() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        dev.state_mut().memory = vec![0xa5; 128];
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        let image = target.upload(0, TransferFlags::NONE, None).unwrap();
        assert_eq!(image.len(), 128);
        // two full blocks and an empty one
        let uploads = dev
            .state()
            .requests
            .iter()
            .filter(|r| r.request == DFU_CMD_UPLOAD)
            .count();
        assert_eq!(uploads, 3);
    }

    #[test]
    fn test_runtime_mode_rejected() {
        let dev = MockDevice::runtime(0x1234, 0x0001);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();
        assert!(matches!(
            target.download(&image(vec![1, 2, 3]), TransferFlags::NONE, None),
            Err(DfuError::RuntimeMode)
        ));
    }

    #[test]
    fn test_download_busy_polling() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        {
            let mut st = dev.state_mut();
            st.busy_polls = 2;
            st.manifest_polls = 1;
            st.poll_timeout_ms = 15;
        }
        let clock = FakeClock::new();
        let mut device = device(&dev, &clock);
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        let data: Vec<u8> = (0..150u8).collect();
        target
            .download(&image(data.clone()), TransferFlags::VERIFY, None)
            .unwrap();

        let st = dev.state();
        assert_eq!(st.memory, data);
        assert_eq!(st.state, DfuState::DfuIdle);
        let blocks: Vec<(u16, usize)> = st
            .requests
            .iter()
            .filter(|r| r.request == DFU_CMD_DOWNLOAD)
            .map(|r| (r.value, r.length))
            .collect();
        assert_eq!(blocks, vec![(0, 64), (1, 64), (2, 22), (3, 0)]);
        // two busy polls per block, one manifest poll
        assert_eq!(clock.sleeps().len(), 3 * 2 + 1);
        assert!(clock.sleeps().iter().all(|d| *d == Duration::from_millis(15)));
    }

    #[test]
    fn test_download_device_error() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        dev.state_mut().fail_block = Some(1);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        let err = target
            .download(&image(vec![0; 200]), TransferFlags::NONE, None)
            .unwrap_err();
        assert!(matches!(
            err,
            DfuError::Status {
                status: DfuStatus::ErrWrite,
                state: DfuState::DfuError
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Protocol);

        target.reset_state().unwrap();
        assert_eq!(target.state(), Some(DfuState::DfuIdle));
        assert_eq!(target.status(), Some(DfuStatus::Ok));
    }

    #[test]
    fn test_download_verify_mismatch() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        dev.state_mut().corrupt_upload = Some(70);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        let err = target
            .download(&image(vec![0x11; 100]), TransferFlags::VERIFY, None)
            .unwrap_err();
        assert!(matches!(err, DfuError::VerifyFailed { offset: 70 }));

        // without verify the corruption goes unnoticed
        target
            .download(&image(vec![0x11; 100]), TransferFlags::NONE, None)
            .unwrap();
    }

    #[test]
    fn test_verify_short_upload() {
        assert!(verify(&[1, 2, 3], &[1, 2, 3, 0]).is_ok());
        assert!(matches!(
            verify(&[1, 2, 3], &[1, 2]),
            Err(DfuError::VerifyFailed { offset: 2 })
        ));
    }

    #[test]
    fn test_download_cancelled() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        dev.state_mut().busy_polls = 10;
        let token = Cancellable::new();
        let clock = FakeClock::new().cancel_after(token.clone(), 3);
        let mut device = device(&dev, &clock);
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        let err = target
            .download(&image(vec![0; 10]), TransferFlags::NONE, Some(&token))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(clock.sleeps().len(), 3);
        let downloads = dev
            .state()
            .requests
            .iter()
            .filter(|r| r.request == DFU_CMD_DOWNLOAD)
            .count();
        assert_eq!(downloads, 1);
    }

    #[test]
    fn test_download_host_reset() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();
        target
            .download(&image(vec![7; 8]), TransferFlags::HOST_RESET, None)
            .unwrap();
        assert_eq!(dev.state().resets, 1);
        assert!(!target.is_open());
    }

    #[test]
    fn test_manifest_not_tolerant() {
        let dev = MockDevice::dfu(0x0483, 0xdf11);
        dev.set_attributes(DfuDescriptor::BIT_CAN_DNLOAD | DfuDescriptor::BIT_CAN_UPLOAD);
        dev.state_mut().manifest_polls = 1;
        let clock = FakeClock::new();
        let mut device = device(&dev, &clock);
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        target
            .download(&image(vec![1; 4]), TransferFlags::VERIFY, None)
            .unwrap();
        assert_eq!(target.state(), Some(DfuState::DfuManifest));
        assert!(
            !dev.state()
                .requests
                .iter()
                .any(|r| r.request == DFU_CMD_UPLOAD)
        );
    }

    #[test]
    fn test_dfuse_download() {
        let dev = MockDevice::dfuse(0x0483, 0xdf11);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        assert!(target.interface().is_dfuse());
        target.open(OpenFlags::NONE).unwrap();

        let mut image = DfuImage::new();
        image.add_element(DfuElement::new(0x0800_3ff0, vec![0xab; 0x20]));
        image.add_element(DfuElement::new(0x0801_0000, vec![0xcd; 0x10]));
        target.download(&image, TransferFlags::VERIFY, None).unwrap();

        let st = dev.state();
        assert_eq!(st.erased, vec![0x0800_0000, 0x0800_4000, 0x0801_0000]);
        assert_eq!(&st.memory[0x3ff0..0x4010], &[0xab; 0x20]);
        assert_eq!(&st.memory[0x1_0000..0x1_0010], &[0xcd; 0x10]);
        // the final SET_ADDRESS points at the first element
        assert_eq!(st.address, 0x0800_3ff0);
    }

    #[test]
    fn test_dfuse_download_outside_layout() {
        let dev = MockDevice::dfuse(0x0483, 0xdf11);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        let mut image = DfuImage::new();
        image.add_element(DfuElement::new(0x2000_0000, vec![0; 4]));
        let err = target
            .download(&image, TransferFlags::NONE, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(dev.state().erased.is_empty());
    }

    #[test]
    fn test_dfuse_upload() {
        let dev = MockDevice::dfuse(0x0483, 0xdf11);
        dev.state_mut().memory = (0..100u8).collect();
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();

        let image = target.upload(0, TransferFlags::NONE, None).unwrap();
        assert_eq!(image.elements()[0].address(), 0x0800_0000);
        assert_eq!(image.contents().as_ref(), dev.state().memory.as_slice());
        assert_eq!(dev.state().state, DfuState::DfuIdle);
    }

    #[test]
    fn test_detach_and_wait() {
        let dev = MockDevice::runtime(0x1234, 0x0001);
        let bootloader = MockDevice::dfu(0x1234, 0x0002);
        let ctx = MockContext::new(vec![dev.clone()]);
        ctx.script_replug([None, Some(bootloader.clone())]);
        let clock = FakeClock::new();
        let mut device = DfuDevice::new(ctx, dev.clone()).unwrap();
        device.set_clock(Box::new(clock.clone()));

        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();
        target.detach(Duration::from_millis(1000)).unwrap();
        assert_eq!(dev.state().detaches, vec![1000]);
        // the runtime device detaches on its own
        assert_eq!(dev.state().resets, 0);

        target
            .wait_for_reset(Duration::from_millis(5000), None)
            .unwrap();
        assert_eq!(target.mode(), DfuMode::Dfu);
        assert_eq!(clock.sleeps(), vec![REPLUG_POLL_INTERVAL; 2]);
    }

    #[test]
    fn test_alt_setting_gone_after_reset() {
        let dev = MockDevice::dfuse(0x0483, 0xdf11);
        let bootloader = MockDevice::dfu(0x0483, 0x0001);
        let ctx = MockContext::new(vec![dev.clone()]);
        ctx.script_replug([Some(bootloader.clone())]);
        let mut device = DfuDevice::new(ctx, dev.clone()).unwrap();
        device.set_clock(Box::new(FakeClock::new()));

        let mut target = device.target(1).unwrap();
        let err = target
            .wait_for_reset(Duration::from_millis(1000), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(target.alt_setting(), 0);
        assert_eq!(target.alt_name(), Some("Flash"));
    }

    #[test]
    fn test_detach_without_will_detach_resets() {
        let dev = MockDevice::runtime(0x1234, 0x0001);
        dev.set_attributes(DfuDescriptor::BIT_CAN_DNLOAD);
        let mut device = device(&dev, &FakeClock::new());
        let mut target = device.target(0).unwrap();
        target.open(OpenFlags::NONE).unwrap();
        target.detach(Duration::from_millis(500)).unwrap();
        assert_eq!(dev.state().resets, 1);
    }
}
