//! C linkage for kernels that drive the controller from non-Rust code.
//!
//! There is one controller per process. Every handle is `0`.

use alloc::sync::Arc;

use log::{error, trace, warn};
use spin::{Mutex, Once};

use crate::{driver::UsbDriver, host::Xhci};

pub type XhcHandle = i32;

/// Motion callback taking `(dx, dy)`.
pub type MouseCallback = extern "C" fn(i8, i8);

const HANDLE: XhcHandle = 0;

static DRIVER: Once<Mutex<UsbDriver<Xhci>>> = Once::new();

fn driver(handle: XhcHandle) -> Option<&'static Mutex<UsbDriver<Xhci>>> {
    if handle != HANDLE {
        warn!("unknown xHC handle {handle}");
        return None;
    }
    let driver = DRIVER.get();
    if driver.is_none() {
        warn!("xHC used before usb_init_xhc");
    }
    driver
}

/// Starts the controller at `mmio_base`. Later calls keep the first
/// controller.
#[unsafe(no_mangle)]
pub extern "C" fn usb_init_xhc(mmio_base: u64) -> XhcHandle {
    if DRIVER.is_completed() {
        warn!("usb_init_xhc called again, ignoring {mmio_base:#x}");
        return HANDLE;
    }
    match UsbDriver::start_xhci(mmio_base) {
        Ok(driver) => {
            DRIVER.call_once(|| Mutex::new(driver));
        }
        Err(e) => error!("usb_init_xhc: {e}"),
    }
    HANDLE
}

#[unsafe(no_mangle)]
pub extern "C" fn usb_configure_port(handle: XhcHandle, observer: MouseCallback) {
    let Some(driver) = driver(handle) else {
        return;
    };
    let observer = Arc::new(move |dx: i8, dy: i8| observer(dx, dy));
    driver.lock().configure_all_ports(observer);
}

/// Called from the controller's interrupt handler.
#[unsafe(no_mangle)]
pub extern "C" fn usb_receive_event(handle: XhcHandle) {
    let Some(driver) = driver(handle) else {
        return;
    };
    // The scan holds the lock with the interrupter masked; whatever it
    // queued is picked up by the next signal.
    match driver.try_lock() {
        Some(mut driver) => {
            driver.deliver_event();
        }
        None => trace!("xHC busy, event left queued"),
    }
}
