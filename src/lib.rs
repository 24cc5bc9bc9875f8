#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod _macros;

pub mod class;
pub mod descriptor;
pub mod driver;
pub mod err;
pub mod host;
pub mod transfer;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use class::{ClassDrivers, MouseObserver};
pub use driver::UsbDriver;
pub use err::{Error, ErrorKind, Result};
pub use host::{Event, HostOp, PortOp, ScanReport, USBHost, Xhci};

define_int_type!(BusAddr, u64);
define_int_type!(SlotId, u8);
