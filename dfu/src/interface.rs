use crate::memory::{DfuMemory, parse_memory_layout};
use crate::usb::UsbInterfaceInfo;
use crate::{DfuDescriptor, DfuMode, DfuState, DfuStatus};

/// One DFU interface alternate setting and the bookkeeping its target keeps.
#[derive(Clone, Debug)]
pub struct DfuInterface {
    interface: u8,
    alt_setting: u8,
    alt_name: Option<String>,
    mode: DfuMode,
    descriptor: Option<DfuDescriptor>,
    layout: Option<DfuMemory>,
    pub(crate) transfer_size: Option<u16>,
    pub(crate) state: Option<DfuState>,
    pub(crate) status: Option<DfuStatus>,
    pub(crate) claimed: bool,
}

impl DfuInterface {
    pub(crate) fn new(info: &UsbInterfaceInfo) -> Self {
        let layout = info.name.as_deref().and_then(parse_memory_layout);
        Self {
            interface: info.number,
            alt_setting: info.alt_setting,
            alt_name: info.name.clone(),
            mode: DfuMode::from_protocol(info.protocol),
            descriptor: info.functional,
            layout,
            transfer_size: None,
            state: None,
            status: None,
            claimed: false,
        }
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    pub fn alt_name(&self) -> Option<&str> {
        self.alt_name.as_deref()
    }
    pub fn mode(&self) -> DfuMode {
        self.mode
    }
    pub fn descriptor(&self) -> Option<&DfuDescriptor> {
        self.descriptor.as_ref()
    }

    /// Memory layout, only present when the alt name is a DfuSe layout string.
    pub fn layout(&self) -> Option<&DfuMemory> {
        self.layout.as_ref()
    }

    pub fn is_dfuse(&self) -> bool {
        self.descriptor.is_some_and(|d| d.is_dfuse())
    }

    /// Last state seen in a `DFU_GETSTATUS` response
    pub fn state(&self) -> Option<DfuState> {
        self.state
    }

    /// Last status seen in a `DFU_GETSTATUS` response
    pub fn status(&self) -> Option<DfuStatus> {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.claimed
    }
}
