use std::{path::Path, time::Duration};

use dfu::{DfuMode, DfuTarget, NusbContext, OpenFlags, TransferFlags};
use firmware::{DfuFirmware, DfuFirmwareFormat, ParseFlags};
use log::debug;

use crate::{CliError, DeviceArgs, REPLUG_TIMEOUT, get_dfu_device, open_target};

/// Detach a runtime target and reopen it once it is back in DFU mode.
pub(crate) fn enter_dfu_mode(target: &mut DfuTarget<'_, NusbContext>) -> Result<(), CliError> {
    if target.mode() != DfuMode::Runtime {
        return Ok(());
    }
    let timeout = target
        .descriptor()
        .map(|desc| Duration::from_millis(desc.detach_timeout().into()))
        .unwrap_or(REPLUG_TIMEOUT);
    println!("Detaching device...");
    target.detach(timeout)?;
    target.wait_for_reset(REPLUG_TIMEOUT, None)?;
    target.open(OpenFlags::NONE)?;
    debug!("target is now {}", target.mode());
    Ok(())
}

pub(crate) fn upload_file(path: &Path, args: &DeviceArgs, offset: u16) -> Result<(), CliError> {
    let mut device = get_dfu_device(args)?;

    let mut target = open_target(&mut device, args, OpenFlags::NONE)?;
    enter_dfu_mode(&mut target)?;
    let dfuse = target.interface().is_dfuse() && target.layout().is_some();
    let image = target.upload(offset, TransferFlags::NONE, None)?;
    target.close()?;

    let mut firmware = DfuFirmware::new();
    firmware.set_vid(device.runtime_vid());
    firmware.set_pid(device.runtime_pid());
    firmware.set_format(if dfuse {
        DfuFirmwareFormat::DfuSe
    } else {
        DfuFirmwareFormat::Dfu1_0
    });
    let len = image.len();
    firmware.add_image(image);
    firmware.write_file(path)?;

    println!("{len} bytes successfully uploaded from device");
    Ok(())
}

pub(crate) fn download_file(path: &Path, args: &DeviceArgs, reset: bool) -> Result<(), CliError> {
    let firmware = DfuFirmware::parse_file(path, ParseFlags::NONE)?;
    debug!("{firmware}");

    let mut device = get_dfu_device(args)?;
    firmware.check_device_ids(device.runtime_vid(), device.runtime_pid())?;

    let mut flags = TransferFlags::VERIFY;
    if reset {
        flags = flags | TransferFlags::HOST_RESET;
    }

    let done = {
        let mut target = open_target(&mut device, args, OpenFlags::NONE)?;
        enter_dfu_mode(&mut target)?;
        match firmware.images() {
            [image] => {
                target.download(image, flags, None)?;
                true
            }
            _ => false,
        }
    };
    // several images go to the targets matching their alt settings
    if !done {
        device.download(&firmware, flags, None)?;
    }

    let len: usize = firmware.images().iter().map(|image| image.len()).sum();
    println!("{len} bytes successfully downloaded to device");
    Ok(())
}
