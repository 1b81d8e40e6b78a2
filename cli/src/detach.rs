use dfu::{DfuMode, OpenFlags};

use crate::{CliError, DeviceArgs, REPLUG_TIMEOUT, get_dfu_device, open_target};

pub(crate) fn detach(args: &DeviceArgs) -> Result<(), CliError> {
    let mut device = get_dfu_device(args)?;
    let mut target = open_target(&mut device, args, OpenFlags::NONE)?;
    if target.mode() == DfuMode::Dfu {
        println!("Device is already in DFU mode");
        return Ok(());
    }

    target.detach(REPLUG_TIMEOUT)?;
    println!("Device detached");
    Ok(())
}

pub(crate) fn reset(args: &DeviceArgs) -> Result<(), CliError> {
    let mut device = get_dfu_device(args)?;
    let mut target = open_target(&mut device, args, OpenFlags::NO_AUTO_REFRESH)?;
    target.reset()?;
    println!("Device reset");
    Ok(())
}
