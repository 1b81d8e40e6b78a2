//! Scripted in-memory USB backend.
//!
//! [MockDevice] simulates the DFU state machine of a device, with plain DFU
//! or DfuSe addressing, configurable busy and manifestation phases and
//! injectable failures. [MockContext] plays the bus and can follow a replug
//! script. [FakeClock] records the sleeps of the polling loops instead of
//! sleeping.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::usb::{UsbContext, UsbDevice, UsbInterfaceInfo};
use crate::{Cancellable, Clock, DfuDescriptor, DfuError, DfuState, DfuStatus};

const MOCK_PLATFORM_ID: &str = "mock-1";
const MOCK_FLASH_BASE: u32 = 0x0800_0000;

/// One control transfer seen by a [MockDevice]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockRequest {
    pub request: u8,
    pub value: u16,
    pub length: usize,
}

/// Device side of the simulation, shared by every clone of a [MockDevice].
#[derive(Debug)]
pub struct MockState {
    pub platform_id: String,
    pub vid: u16,
    pub pid: u16,
    pub max_packet_size: u16,
    pub interfaces: Vec<UsbInterfaceInfo>,

    pub state: DfuState,
    pub status: DfuStatus,
    pub poll_timeout_ms: u32,
    /// `dfuDNBUSY` answers after each download request
    pub busy_polls: usize,
    /// `dfuMANIFEST` answers after the zero-length download
    pub manifest_polls: usize,
    pub manifestation_tolerant: bool,
    /// Use DfuSe addressing based at 0x08000000
    pub dfuse: bool,
    /// Readable and writable memory
    pub memory: Vec<u8>,
    pub address: u32,
    pub erased: Vec<u32>,

    pub fail_open: Option<String>,
    pub fail_reset: bool,
    /// Download block number answered with `errWRITE`
    pub fail_block: Option<u16>,
    /// Memory offset flipped in every upload
    pub corrupt_upload: Option<usize>,

    pub open: bool,
    pub opens: usize,
    pub claimed: Vec<u8>,
    pub resets: usize,
    pub detaches: Vec<u16>,
    pub requests: Vec<MockRequest>,

    busy_left: usize,
    manifest_left: usize,
}

impl MockState {
    fn new(vid: u16, pid: u16, interfaces: Vec<UsbInterfaceInfo>) -> Self {
        Self {
            platform_id: MOCK_PLATFORM_ID.into(),
            vid,
            pid,
            max_packet_size: 64,
            interfaces,
            state: DfuState::DfuIdle,
            status: DfuStatus::Ok,
            poll_timeout_ms: 0,
            busy_polls: 0,
            manifest_polls: 0,
            manifestation_tolerant: true,
            dfuse: false,
            memory: Vec::new(),
            address: MOCK_FLASH_BASE,
            erased: Vec::new(),
            fail_open: None,
            fail_reset: false,
            fail_block: None,
            corrupt_upload: None,
            open: false,
            opens: 0,
            claimed: Vec::new(),
            resets: 0,
            detaches: Vec::new(),
            requests: Vec::new(),
            busy_left: 0,
            manifest_left: 0,
        }
    }

    fn stall(&mut self, what: &str) -> DfuError {
        self.state = DfuState::DfuError;
        self.status = DfuStatus::ErrStalledpkt;
        DfuError::Device(format!("mock: stall on {what}"))
    }

    fn get_status(&mut self) -> Vec<u8> {
        match self.state {
            DfuState::DfuDnloadSync | DfuState::DfuDnbusy => {
                if self.busy_left > 0 {
                    self.busy_left -= 1;
                    self.state = DfuState::DfuDnbusy;
                } else {
                    self.state = DfuState::DfuDnloadIdle;
                }
            }
            DfuState::DfuManifestSync | DfuState::DfuManifest => {
                if self.manifest_left > 0 {
                    self.manifest_left -= 1;
                    self.state = DfuState::DfuManifest;
                } else if self.manifestation_tolerant {
                    self.state = DfuState::DfuIdle;
                } else {
                    self.state = DfuState::DfuManifestWaitReset;
                }
            }
            _ => {}
        }
        let timeout = self.poll_timeout_ms.to_le_bytes();
        vec![
            self.status.into(),
            timeout[0],
            timeout[1],
            timeout[2],
            self.state.into(),
            0,
        ]
    }

    fn download(&mut self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuDnloadIdle) {
            return Err(self.stall("download"));
        }
        if data.is_empty() {
            if self.state != DfuState::DfuDnloadIdle {
                return Err(self.stall("zero-length download"));
            }
            self.state = DfuState::DfuManifestSync;
            self.manifest_left = self.manifest_polls;
            return Ok(());
        }
        if self.fail_block == Some(block) {
            self.state = DfuState::DfuError;
            self.status = DfuStatus::ErrWrite;
            return Ok(());
        }

        if self.dfuse && block == 0 {
            let addr = match data {
                [_, a, b, c, d] => u32::from_le_bytes([*a, *b, *c, *d]),
                _ => return Err(self.stall("DfuSe command")),
            };
            match data[0] {
                0x21 => self.address = addr,
                0x41 => self.erased.push(addr),
                _ => return Err(self.stall("DfuSe command")),
            }
        } else if self.dfuse {
            let block = block.saturating_sub(2) as usize;
            let offset = self.address.wrapping_sub(MOCK_FLASH_BASE) as usize + block * data.len();
            if self.memory.len() < offset + data.len() {
                self.memory.resize(offset + data.len(), 0);
            }
            self.memory[offset..offset + data.len()].copy_from_slice(data);
        } else {
            if block == 0 {
                self.memory.clear();
            }
            self.memory.extend_from_slice(data);
        }
        self.state = DfuState::DfuDnloadSync;
        self.busy_left = self.busy_polls;
        Ok(())
    }

    fn upload(&mut self, block: u16, length: u16) -> Result<Vec<u8>, DfuError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuUploadIdle) {
            return Err(self.stall("upload"));
        }
        let length = length as usize;
        let start = if self.dfuse {
            match (
                self.address.checked_sub(MOCK_FLASH_BASE),
                block.checked_sub(2),
            ) {
                (Some(base), Some(n)) => Some(base as usize + n as usize * length),
                _ => None,
            }
        } else {
            Some(block as usize * length)
        };
        let mut chunk = match start {
            Some(start) if start < self.memory.len() => {
                self.memory[start..(start + length).min(self.memory.len())].to_vec()
            }
            _ => Vec::new(),
        };
        if let (Some(bad), Some(start)) = (self.corrupt_upload, start)
            && bad >= start
            && bad < start + chunk.len()
        {
            chunk[bad - start] ^= 0xff;
        }
        self.state = if chunk.len() < length {
            DfuState::DfuIdle
        } else {
            DfuState::DfuUploadIdle
        };
        Ok(chunk)
    }
}

/// Simulated USB device; clones share the same [MockState].
#[derive(Clone, Debug)]
pub struct MockDevice(Rc<RefCell<MockState>>);

impl MockDevice {
    pub fn new(vid: u16, pid: u16, interfaces: Vec<UsbInterfaceInfo>) -> Self {
        Self(Rc::new(RefCell::new(MockState::new(vid, pid, interfaces))))
    }

    /// Application exposing a runtime DFU interface that detaches by itself.
    pub fn runtime(vid: u16, pid: u16) -> Self {
        let dev = Self::new(
            vid,
            pid,
            vec![dfu_interface(
                0,
                1,
                "Application",
                DfuDescriptor::new(
                    DfuDescriptor::BIT_CAN_DNLOAD
                        | DfuDescriptor::BIT_CAN_UPLOAD
                        | DfuDescriptor::BIT_WILL_DETACH,
                    1000,
                    0,
                    0x0110,
                ),
            )],
        );
        {
            let mut st = dev.state_mut();
            st.state = DfuState::AppIdle;
            st.max_packet_size = 32;
        }
        dev
    }

    /// Plain DFU bootloader with a 64 byte transfer size.
    pub fn dfu(vid: u16, pid: u16) -> Self {
        Self::new(
            vid,
            pid,
            vec![dfu_interface(
                0,
                2,
                "Flash",
                DfuDescriptor::new(
                    DfuDescriptor::BIT_CAN_DNLOAD
                        | DfuDescriptor::BIT_CAN_UPLOAD
                        | DfuDescriptor::BIT_MANIFESTATION_TOLERANT,
                    255,
                    64,
                    0x0110,
                ),
            )],
        )
    }

    /// STM32 style DfuSe bootloader with flash and option bytes targets.
    pub fn dfuse(vid: u16, pid: u16) -> Self {
        let functional = DfuDescriptor::new(
            DfuDescriptor::BIT_CAN_DNLOAD
                | DfuDescriptor::BIT_CAN_UPLOAD
                | DfuDescriptor::BIT_WILL_DETACH,
            255,
            1024,
            0x011a,
        );
        let mut option_bytes = dfu_interface(
            0,
            2,
            "@Option Bytes  /0x1FFFC000/01*016 e",
            functional,
        );
        option_bytes.alt_setting = 1;
        let dev = Self::new(
            vid,
            pid,
            vec![
                dfu_interface(
                    0,
                    2,
                    "@Internal Flash  /0x08000000/04*016Kg,01*064Kg",
                    functional,
                ),
                option_bytes,
            ],
        );
        {
            let mut st = dev.state_mut();
            st.dfuse = true;
            st.manifestation_tolerant = false;
        }
        dev
    }

    pub fn state(&self) -> Ref<'_, MockState> {
        self.0.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, MockState> {
        self.0.borrow_mut()
    }

    /// Replace `bmAttributes` of every functional descriptor.
    pub fn set_attributes(&self, attributes: u8) {
        let mut st = self.state_mut();
        st.manifestation_tolerant = attributes & DfuDescriptor::BIT_MANIFESTATION_TOLERANT != 0;
        for intf in &mut st.interfaces {
            if let Some(desc) = intf.functional {
                intf.functional = Some(DfuDescriptor::new(
                    attributes,
                    desc.detach_timeout(),
                    desc.transfer_size(),
                    desc.dfu_version(),
                ));
            }
        }
    }

    fn claimed(&self, interface: u8) -> Result<(), DfuError> {
        if self.state().claimed.contains(&interface) {
            Ok(())
        } else {
            Err(DfuError::Device(format!(
                "mock: interface {interface} not claimed"
            )))
        }
    }
}

fn dfu_interface(
    number: u8,
    protocol: u8,
    name: &str,
    functional: DfuDescriptor,
) -> UsbInterfaceInfo {
    UsbInterfaceInfo {
        number,
        alt_setting: 0,
        class: 0xfe,
        subclass: 0x01,
        protocol,
        name: Some(name.into()),
        functional: Some(functional),
    }
}

impl UsbDevice for MockDevice {
    fn platform_id(&self) -> String {
        self.state().platform_id.clone()
    }

    fn vendor_id(&self) -> u16 {
        self.state().vid
    }

    fn product_id(&self) -> u16 {
        self.state().pid
    }

    fn release(&self) -> u16 {
        0x0100
    }

    fn max_packet_size(&self) -> u16 {
        self.state().max_packet_size
    }

    fn open(&mut self) -> Result<(), DfuError> {
        let mut st = self.state_mut();
        if let Some(msg) = &st.fail_open {
            return Err(DfuError::Device(msg.clone()));
        }
        st.open = true;
        st.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DfuError> {
        let mut st = self.state_mut();
        st.open = false;
        st.claimed.clear();
        Ok(())
    }

    fn interfaces(&mut self) -> Result<Vec<UsbInterfaceInfo>, DfuError> {
        Ok(self.state().interfaces.clone())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), DfuError> {
        let mut st = self.state_mut();
        if !st.open {
            return Err(DfuError::NotOpen);
        }
        if !st.claimed.contains(&interface) {
            st.claimed.push(interface);
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), DfuError> {
        self.state_mut().claimed.retain(|&i| i != interface);
        Ok(())
    }

    fn set_alt_setting(&mut self, interface: u8, _alt_setting: u8) -> Result<(), DfuError> {
        self.claimed(interface)
    }

    fn control_in(
        &self,
        interface: u8,
        request: u8,
        value: u16,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, DfuError> {
        self.claimed(interface)?;
        let mut st = self.state_mut();
        st.requests.push(MockRequest {
            request,
            value,
            length: length as usize,
        });
        match request {
            2 => st.upload(value, length),
            3 => Ok(st.get_status()),
            5 => Ok(vec![st.state.into()]),
            _ => Err(st.stall("IN request")),
        }
    }

    fn control_out(
        &self,
        interface: u8,
        request: u8,
        value: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), DfuError> {
        self.claimed(interface)?;
        let mut st = self.state_mut();
        st.requests.push(MockRequest {
            request,
            value,
            length: data.len(),
        });
        match request {
            0 => {
                st.detaches.push(value);
                st.state = DfuState::AppDetach;
                Ok(())
            }
            1 => st.download(value, data),
            4 => {
                st.state = DfuState::DfuIdle;
                st.status = DfuStatus::Ok;
                Ok(())
            }
            6 => {
                st.state = DfuState::DfuIdle;
                Ok(())
            }
            _ => Err(st.stall("OUT request")),
        }
    }

    fn reset(&mut self) -> Result<(), DfuError> {
        let mut st = self.state_mut();
        if st.fail_reset {
            return Err(DfuError::Device("mock: reset failed".into()));
        }
        st.resets += 1;
        st.open = false;
        st.claimed.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockBus {
    devices: Vec<MockDevice>,
    script: VecDeque<Option<MockDevice>>,
}

/// Simulated bus; clones share the same device list.
#[derive(Clone, Debug, Default)]
pub struct MockContext(Rc<RefCell<MockBus>>);

impl MockContext {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self(Rc::new(RefCell::new(MockBus {
            devices,
            script: VecDeque::new(),
        })))
    }

    /// Queue what successive bus scans see: `None` for an empty bus, or the
    /// device present at that time. The last step stays in effect.
    pub fn script_replug<I: IntoIterator<Item = Option<MockDevice>>>(&self, steps: I) {
        self.0.borrow_mut().script.extend(steps);
    }
}

impl UsbContext for MockContext {
    type Device = MockDevice;

    fn devices(&self) -> Result<Vec<MockDevice>, DfuError> {
        let mut bus = self.0.borrow_mut();
        if let Some(step) = bus.script.pop_front() {
            bus.devices = step.into_iter().collect();
        }
        Ok(bus.devices.clone())
    }
}

#[derive(Debug, Default)]
struct FakeClockInner {
    sleeps: Vec<Duration>,
    cancel_after: Option<(Cancellable, usize)>,
}

/// Records requested sleeps and returns immediately.
#[derive(Clone, Debug, Default)]
pub struct FakeClock(Arc<Mutex<FakeClockInner>>);

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` once `sleeps` sleeps have been requested.
    pub fn cancel_after(self, token: Cancellable, sleeps: usize) -> Self {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_after = Some((token, sleeps));
        self
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleeps
            .clone()
    }
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration) {
        let mut inner = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        inner.sleeps.push(duration);
        if let Some((token, after)) = &inner.cancel_after
            && inner.sleeps.len() >= *after
        {
            token.cancel();
        }
    }
}
