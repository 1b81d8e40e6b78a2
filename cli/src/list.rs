use dfu::{DfuDevice, DfuMemSegment, NusbContext, OpenFlags, UsbDevice, find_dfu_devices};

use crate::{CliError, DeviceArgs};

pub(crate) fn list_dfu_devices(args: &DeviceArgs) -> Result<(), CliError> {
    let (vid, pid) = args.device.unzip();
    let mut devices = find_dfu_devices(vid, pid)?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        for device in devices.iter_mut() {
            print_device(device, args.transfer_size);
        }
    }
    Ok(())
}

fn print_segment(prefix: &str, segment: &DfuMemSegment) {
    let mut page_size = segment.page_size();
    let page_char = if page_size >= 1024 {
        page_size /= 1024;
        "K"
    } else {
        " "
    };
    println!(
        "{}0x{:08X} {:2} pages of {:4}{} bytes ({}{}{})",
        prefix,
        segment.start_addr(),
        segment.pages(),
        page_size,
        page_char,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    );
}

fn print_device(device: &mut DfuDevice<NusbContext>, transfer_size: Option<u16>) {
    let vid = device.vendor_id();
    let pid = device.product_id();
    let release = device.usb_device().release();
    let platform_id = device.platform_id();

    for index in 0..device.interfaces().len() {
        let Some(mut target) = device.target_at(index) else {
            break;
        };
        if let Some(transfer_size) = transfer_size {
            target.set_transfer_size(transfer_size);
        }
        let opened = target.open(OpenFlags::NONE);

        print!(
            "Found {}: [{:04x}:{:04x}] ver={:04x}, path={}, intf={}, ts={}, alt={}, name=\"{}\"",
            target.mode(),
            vid,
            pid,
            release,
            platform_id,
            target.interface_number(),
            target.transfer_size(),
            target.alt_setting(),
            target.alt_name().unwrap_or("UNKNOWN"),
        );
        match opened {
            Ok(()) => {
                match (target.status(), target.state()) {
                    (Some(status), Some(state)) => {
                        println!(", status={status}, state={state}")
                    }
                    _ => println!(),
                }
                if let Err(err) = target.close() {
                    log::debug!("failed to close: {err}");
                }
            }
            Err(err) => println!(": {err}"),
        }

        if let Some(layout) = target.layout() {
            println!("  {}:", layout.name);
            for segment in &layout.segments {
                print_segment("    ", segment);
            }
        }
    }
}
