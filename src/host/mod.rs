use core::ops::{Deref, DerefMut};

use alloc::vec::Vec;

use log::{debug, error};

use crate::{
    class::{ClassDrivers, MouseObserver},
    err::*,
};

pub mod xhci;

pub use self::xhci::Xhci;

/// One physical root port, queried on demand.
pub trait PortOp {
    /// 1-based port number.
    fn number(&self) -> u8;

    fn is_connected(&self) -> bool;
}

/// What a single `process_event` call consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The event ring held no record.
    Nothing,
    PortStatusChange { port: u8 },
    CommandCompletion { slot: u8 },
    Transfer { slot: u8 },
    Other,
}

pub trait HostOp: Send + 'static {
    type Port: PortOp + Clone;

    fn init(&mut self) -> Result;

    fn run(&mut self);

    fn max_ports(&self) -> u8;

    /// `index` is 1-based and must be within `1..=max_ports()`.
    fn port_at(&self, index: u8) -> Self::Port;

    /// Starts negotiation of a connected port.
    ///
    /// Must return `Ok` without side effects for a port whose negotiation has
    /// already started or completed.
    fn configure_port(&mut self, port: &Self::Port, drivers: &ClassDrivers) -> Result;

    /// Consumes at most one event record.
    fn process_event(&mut self, drivers: &ClassDrivers) -> Result<Event>;

    /// Masks the controller interrupt, returning whether it was enabled.
    fn disable_irq(&mut self) -> bool;

    fn enable_irq(&mut self);
}

/// Outcome of one pass over the root ports.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub visited: Vec<u8>,
    pub connected: Vec<u8>,
    pub configured: Vec<u8>,
    pub failed: Vec<(u8, Error)>,
}

pub struct USBHost<C>
where
    C: HostOp,
{
    ctrl: C,
    drivers: ClassDrivers,
}

impl<C> From<C> for USBHost<C>
where
    C: HostOp,
{
    fn from(value: C) -> Self {
        Self {
            ctrl: value,
            drivers: ClassDrivers::new(),
        }
    }
}

impl<C: HostOp> USBHost<C> {
    pub fn init(&mut self) -> Result {
        self.ctrl.init()
    }

    pub fn run(&mut self) {
        self.ctrl.run();
    }

    pub fn max_ports(&self) -> u8 {
        self.ctrl.max_ports()
    }

    pub fn port_at(&self, index: u8) -> C::Port {
        self.ctrl.port_at(index)
    }

    pub fn class_drivers(&self) -> &ClassDrivers {
        &self.drivers
    }

    pub fn set_mouse_observer(&self, observer: MouseObserver) -> bool {
        self.drivers.set_mouse_observer(observer)
    }

    pub fn controller(&self) -> &C {
        &self.ctrl
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    /// Tries every connected root port once, in port order.
    ///
    /// The controller interrupt stays masked for the whole pass so an event
    /// signal cannot re-enter the controller mid-negotiation. A failing port
    /// is recorded and the pass moves on.
    pub fn configure_ports(&mut self) -> ScanReport {
        let mut ctrl = IrqMasked::new(&mut self.ctrl);
        let mut report = ScanReport::default();

        for index in 1..=ctrl.max_ports() {
            let port = ctrl.port_at(index);
            let connected = port.is_connected();
            report.visited.push(index);
            debug!("Port {index}: IsConnected={connected}");
            if !connected {
                continue;
            }
            report.connected.push(index);

            match ctrl.configure_port(&port, &self.drivers) {
                Ok(()) => report.configured.push(index),
                Err(e) => {
                    error!("failed to configure port {index}: {e}");
                    report.failed.push((index, e));
                }
            }
        }

        report
    }

    pub fn process_event(&mut self) -> Result<Event> {
        self.ctrl.process_event(&self.drivers)
    }
}

/// Keeps the controller interrupt masked while borrowed, restoring the
/// previous state on drop.
struct IrqMasked<'a, C: HostOp> {
    ctrl: &'a mut C,
    restore: bool,
}

impl<'a, C: HostOp> IrqMasked<'a, C> {
    fn new(ctrl: &'a mut C) -> Self {
        let restore = ctrl.disable_irq();
        Self { ctrl, restore }
    }
}

impl<C: HostOp> Deref for IrqMasked<'_, C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.ctrl
    }
}

impl<C: HostOp> DerefMut for IrqMasked<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctrl
    }
}

impl<C: HostOp> Drop for IrqMasked<'_, C> {
    fn drop(&mut self) {
        if self.restore {
            self.ctrl.enable_irq();
        }
    }
}
