//! The surface the kernel talks to: start once, scan once, then pump one
//! event per interrupt.

use core::ptr::NonNull;

use log::{debug, error, info, warn};

use crate::{
    class::MouseObserver,
    err::*,
    host::{Event, HostOp, ScanReport, USBHost, Xhci},
};

pub struct UsbDriver<C: HostOp> {
    host: USBHost<C>,
}

impl<C: HostOp> UsbDriver<C> {
    /// Initializes and runs `ctrl`.
    ///
    /// An initialization failure is logged and the controller is started
    /// anyway; later operations report what is missing.
    pub fn start(ctrl: C) -> Self {
        let mut host = USBHost::from(ctrl);
        match host.init() {
            Ok(()) => debug!("xhc.Initialize: Success"),
            Err(e) => warn!("xhc.Initialize: {} at {}:{}", e.name(), e.file(), e.line()),
        }
        info!("xHC starting");
        host.run();
        Self { host }
    }

    /// Registers `observer` for mouse motion and tries every connected root
    /// port once.
    pub fn configure_all_ports(&mut self, observer: MouseObserver) -> ScanReport {
        self.host.set_mouse_observer(observer);
        let report = self.host.configure_ports();
        debug!(
            "port scan: {} visited, {} connected, {} started, {} failed",
            report.visited.len(),
            report.connected.len(),
            report.configured.len(),
            report.failed.len()
        );
        report
    }

    /// Consumes at most one pending controller event. Failures are logged,
    /// never returned.
    pub fn deliver_event(&mut self) -> Event {
        match self.host.process_event() {
            Ok(ev) => ev,
            Err(e) => {
                error!(
                    "Error while ProcessEvent: {} at {}:{}",
                    e.name(),
                    e.file(),
                    e.line()
                );
                Event::Other
            }
        }
    }

    pub fn host(&self) -> &USBHost<C> {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut USBHost<C> {
        &mut self.host
    }
}

impl UsbDriver<Xhci> {
    /// Starts the xHC whose register window is identity mapped at
    /// `mmio_base`.
    pub fn start_xhci(mmio_base: u64) -> Result<Self> {
        let base = NonNull::new(mmio_base as usize as *mut u8).ok_or(err!(NotInitialized))?;
        Ok(Self::start(Xhci::new(base)))
    }
}
