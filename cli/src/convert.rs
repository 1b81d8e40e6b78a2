use std::path::Path;

use firmware::{DfuFirmware, ParseFlags};
use log::debug;

use crate::CliError;

/// Re-encode `input` into `output`, optionally overriding the suffix IDs.
///
/// The target size has to be known before parsing since it pads plain images.
pub(crate) fn convert(
    input: &Path,
    output: &Path,
    vid: Option<u16>,
    pid: Option<u16>,
    release: Option<u16>,
    size: Option<u32>,
) -> Result<(), CliError> {
    let data = std::fs::read(input)?;
    let mut firmware = DfuFirmware::new();
    if let Some(size) = size {
        firmware.set_target_size(size);
    }
    firmware.parse_data(&data, ParseFlags::NONE)?;

    if let Some(vid) = vid {
        firmware.set_vid(vid);
    }
    if let Some(pid) = pid {
        firmware.set_pid(pid);
    }
    if let Some(release) = release {
        firmware.set_release(release);
    }

    debug!("{firmware}");
    firmware.write_file(output)?;
    println!("Wrote {}", output.display());
    Ok(())
}

pub(crate) fn dump(path: &Path) -> Result<(), CliError> {
    let firmware = DfuFirmware::parse_file(path, ParseFlags::NONE)?;
    println!("{firmware}");
    Ok(())
}
