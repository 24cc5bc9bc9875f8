//! Class drivers bound to device interfaces during enumeration.

use alloc::{boxed::Box, sync::Arc};

use log::{debug, info, warn};

use crate::{
    descriptor::InterfaceDescriptor,
    err::*,
    transfer::{EndpointConfig, EndpointId, SetupData},
};

pub mod mouse;

pub use mouse::{BootMouseReport, HidMouseDriver, MouseButtons};

/// Receives relative pointer motion `(dx, dy)`.
pub type MouseObserver = Arc<dyn Fn(i8, i8) + Send + Sync>;

/// The next transfer a class driver wants scheduled on its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRequest {
    NoOp,
    ControlOut(SetupData),
    InterruptIn { ep_id: EndpointId, len: usize },
}

pub trait ClassDriver: Send {
    fn set_endpoint(&mut self, config: &EndpointConfig) -> Result;

    fn on_endpoints_configured(&mut self) -> Result<TransferRequest>;

    fn on_control_completed(
        &mut self,
        ep_id: EndpointId,
        setup: SetupData,
        data: &[u8],
    ) -> Result<TransferRequest>;

    fn on_interrupt_completed(&mut self, ep_id: EndpointId, data: &[u8])
    -> Result<TransferRequest>;
}

/// Set-once, read-many holder of the mouse observer.
///
/// Every mouse driver created from the same registry shares one slot, so an
/// observer registered after binding still reaches already bound devices.
#[derive(Clone, Default)]
pub struct ObserverSlot(Arc<spin::Once<MouseObserver>>);

impl ObserverSlot {
    /// Returns `false` when a different observer already occupies the slot.
    pub fn set(&self, observer: MouseObserver) -> bool {
        let mut fresh = false;
        let current = self.0.call_once(|| {
            fresh = true;
            observer.clone()
        });
        if fresh || Arc::ptr_eq(current, &observer) {
            return true;
        }
        warn!("mouse observer already registered, keeping the first one");
        false
    }

    pub fn is_set(&self) -> bool {
        self.0.is_completed()
    }

    /// Drops the event when no observer is registered.
    pub fn notify(&self, dx: i8, dy: i8) {
        if let Some(observer) = self.0.get() {
            observer(dx, dy);
        }
    }
}

/// Interface-to-driver binding table plus the state shared by the drivers it
/// creates.
#[derive(Clone, Default)]
pub struct ClassDrivers {
    mouse_observer: ObserverSlot,
}

impl ClassDrivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mouse_observer(&self, observer: MouseObserver) -> bool {
        self.mouse_observer.set(observer)
    }

    pub fn mouse_observer(&self) -> &ObserverSlot {
        &self.mouse_observer
    }

    pub fn new_class_driver(&self, intf: &InterfaceDescriptor) -> Result<Box<dyn ClassDriver>> {
        if intf.is_boot_mouse() {
            info!("mouse found on interface {}", intf.interface_number);
            return Ok(Box::new(HidMouseDriver::new(
                intf.interface_number,
                self.mouse_observer.clone(),
            )));
        }
        debug!(
            "no driver for interface {} class {:?} ({}, {})",
            intf.interface_number,
            intf.class(),
            intf.interface_sub_class,
            intf.interface_protocol
        );
        Err(err!(UnsupportedInterface))
    }
}
