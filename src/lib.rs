//! Device Firmware Upgrade over USB
//!
//! Umbrella crate over [dfu] (the protocol side) and [firmware] (the file
//! formats), plus the [Provider] interface update front-ends drive.

pub use dfu;
pub use firmware;

mod provider;

pub use provider::{DfuProvider, Provider};
