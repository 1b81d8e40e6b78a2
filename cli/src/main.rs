use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use log::LevelFilter;
use parse_size::parse_size;

use dfu::{DfuDevice, DfuTarget, NusbContext, OpenFlags, find_dfu_devices};
use error::CliError;

use convert::*;
use detach::*;
use list::*;
use transfer::*;

mod convert;
mod detach;
mod error;
mod list;
mod transfer;

/// How long a detached device gets to come back in DFU mode
pub(crate) const REPLUG_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Parser)]
#[command(version, about = "DFU Utility", long_about = None)]
struct Cli {
    /// print debug messages (same as RUST_LOG=debug)
    #[clap(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Debug, Default)]
pub(crate) struct DeviceArgs {
    /// vendor and product ID of the device (ex: "0483:df11")
    #[clap(short, long, value_parser=parse_vid_pid)]
    device: Option<(u16, u16)>,
    /// alternate setting of the DFU interface
    #[clap(short, long, default_value_t = 0)]
    alt: u8,
    /// bytes per USB transfer (ex: 1024, 2KiB)
    #[clap(short, long, value_parser=parse_transfer_size)]
    transfer_size: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// switch a runtime device into DFU mode
    Detach {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// read firmware from the device into a file
    Upload {
        /// file to write
        file: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        /// first block to read (ex: 0x10)
        #[clap(short, long, default_value_t = 0, value_parser=maybe_hex::<u16>)]
        offset: u16,
    },
    /// write firmware from a file into the device
    Download {
        /// file to read (DFU, DfuSe or ELF)
        file: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        /// issue a USB host reset once finished
        #[clap(short, long)]
        reset: bool,
    },
    /// issue a USB host reset
    Reset {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// convert a firmware file to DFU or DfuSe
    Convert {
        /// file to read
        input: PathBuf,
        /// file to write
        output: PathBuf,
        /// vendor ID (ex: "273f")
        #[clap(value_parser=hex_nonzero_u16)]
        vid: Option<u16>,
        /// product ID (ex: "1004")
        #[clap(value_parser=hex_nonzero_u16)]
        pid: Option<u16>,
        /// release (ex: "ffff")
        #[clap(value_parser=hex_nonzero_u16)]
        release: Option<u16>,
        /// pad images up to this size (ex: "8000")
        #[clap(value_parser=hex_nonzero_u32)]
        size: Option<u32>,
    },
    /// inspect a firmware file
    Dump {
        /// firmware file
        file: PathBuf,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            device: DeviceArgs::default(),
        }
    }
}

fn parse_vid_pid(s: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| "invalid format of VID:PID".to_string())?;
    Ok((hex_u16(vid)?, hex_u16(pid)?))
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn hex_nonzero_u16(s: &str) -> Result<u16, String> {
    match hex_u16(s)? {
        0 => Err(format!("'{s}' must not be zero")),
        v => Ok(v),
    }
}

fn hex_nonzero_u32(s: &str) -> Result<u32, String> {
    match <u32>::from_str_radix(s, 16).map_err(|e| format!("{e}"))? {
        0 => Err(format!("'{s}' must not be zero")),
        v => Ok(v),
    }
}

fn parse_transfer_size(s: &str) -> Result<u16, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    match u16::try_from(len).map_err(|e| format!("{e}"))? {
        0 => Err("transfer size must not be zero".to_string()),
        size => Ok(size),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    if let Err(err) = match &cli.command.unwrap_or_default() {
        Commands::List { device } => list_dfu_devices(device),
        Commands::Detach { device } => detach(device),
        Commands::Upload {
            file,
            device,
            offset,
        } => upload_file(file, device, *offset),
        Commands::Download {
            file,
            device,
            reset,
        } => download_file(file, device, *reset),
        Commands::Reset { device } => reset(device),
        Commands::Convert {
            input,
            output,
            vid,
            pid,
            release,
            size,
        } => convert(input, output, *vid, *pid, *release, *size),
        Commands::Dump { file } => dump(file),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

pub(crate) fn get_dfu_device(args: &DeviceArgs) -> Result<DfuDevice<NusbContext>, CliError> {
    let (vid, pid) = args.device.unzip();
    let mut devices = find_dfu_devices(vid, pid)?;
    if devices.is_empty() {
        return Err(CliError::NoDFUDevice);
    }

    if devices.len() > 1 {
        return Err(CliError::ManyDFUDevices);
    }

    Ok(devices.remove(0))
}

/// Select and open the target named by `args`.
pub(crate) fn open_target<'a>(
    device: &'a mut DfuDevice<NusbContext>,
    args: &DeviceArgs,
    flags: OpenFlags,
) -> Result<DfuTarget<'a, NusbContext>, CliError> {
    let mut target = device.target(args.alt)?;
    if let Some(transfer_size) = args.transfer_size {
        target.set_transfer_size(transfer_size);
    }
    target.open(flags)?;
    Ok(target)
}
