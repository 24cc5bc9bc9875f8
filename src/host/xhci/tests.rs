//! The xHCI backend against a register window in ordinary memory.
//!
//! Events are written into the event ring the way the controller would, and
//! DMA addresses are plain pointers, so every command, doorbell and data
//! buffer the driver produces can be inspected directly.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::ptr::NonNull;
use std::sync::Mutex;

use super::{
    Xhci,
    dispatch::Data,
    port::{PortConfigPhase, XhciPort},
    reg::XhciRegisters,
};
use crate::{
    BusAddr, SlotId,
    class::ClassDrivers,
    err::ErrorKind,
    host::{Event, HostOp, PortOp},
};

struct IdentityDma;

impl dma_api::Impl for IdentityDma {
    fn map(addr: NonNull<u8>, _size: usize, _direction: dma_api::Direction) -> u64 {
        addr.as_ptr() as usize as _
    }

    fn unmap(_addr: NonNull<u8>, _size: usize) {}

    fn flush(_addr: NonNull<u8>, _size: usize) {}

    fn invalidate(_addr: NonNull<u8>, _size: usize) {}
}

dma_api::set_impl!(IdentityDma);

const CAPLENGTH: usize = 0x20;
const HCSPARAMS1: usize = 0x04;
const DBOFF: usize = 0x2000;
const RTSOFF: usize = 0x3000;
const PORTSC: usize = CAPLENGTH + 0x400;
const MAX_PORTS: u8 = 4;
const MAX_SLOTS: u8 = 16;

const CCS: u32 = 1 << 0;
const PED: u32 = 1 << 1;
const PR: u32 = 1 << 4;
const CSC: u32 = 1 << 17;
const PRC: u32 = 1 << 21;

const LOW_SPEED: u32 = 2;

const TRB_ENABLE_SLOT: u32 = 9;
const TRB_DISABLE_SLOT: u32 = 10;
const TRB_ADDRESS_DEVICE: u32 = 11;
const TRB_CONFIGURE_ENDPOINT: u32 = 12;
const TRB_EVALUATE_CONTEXT: u32 = 13;
const TRB_RESET_ENDPOINT: u32 = 14;
const TRB_TRANSFER_EVENT: u32 = 32;
const TRB_COMMAND_COMPLETION: u32 = 33;
const TRB_PORT_STATUS_CHANGE: u32 = 34;

const CC_SUCCESS: u32 = 1;
const CC_TRANSACTION_ERROR: u32 = 4;
const CC_NO_SLOTS: u32 = 9;
const CC_SHORT_PACKET: u32 = 13;

const MOUSE_DEVICE: [u8; 18] = [
    18, 1, 0x10, 0x01, 0, 0, 0, 8, 0x6d, 0x04, 0x34, 0x12, 0x00, 0x01, 0, 0, 0, 1,
];

const BOOT_MOUSE_CONFIG: [u8; 34] = [
    9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
    9, 4, 0, 0, 1, 3, 1, 2, 0, // interface: HID boot mouse
    9, 0x21, 0x11, 0x01, 0, 1, 0x22, 52, 0, // HID
    7, 5, 0x81, 3, 8, 0, 10, // endpoint 1 IN, interrupt
];

/// Interrupt IN endpoint 1.
const MOUSE_DCI: u8 = 3;

#[repr(C, align(4096))]
struct Window([u32; 0x1000]);

/// A zeroed register window laid out like a 4 port, 16 slot controller.
fn register_window() -> NonNull<u8> {
    let window: &'static mut Window = Box::leak(Box::new(Window([0; 0x1000])));
    let words = &mut window.0;
    words[0] = CAPLENGTH as u32 | (0x0110 << 16);
    words[HCSPARAMS1 / 4] = MAX_SLOTS as u32 | (1 << 8) | ((MAX_PORTS as u32) << 24);
    words[0x14 / 4] = DBOFF as u32;
    words[0x18 / 4] = RTSOFF as u32;
    NonNull::from(words).cast()
}

fn trb_type(raw: &[u32; 4]) -> u32 {
    (raw[3] >> 10) & 0x3f
}

struct Host {
    base: NonNull<u8>,
    reg: XhciRegisters,
    data: Data,
    drivers: ClassDrivers,
    seen: Arc<Mutex<Vec<(i8, i8)>>>,
}

impl Host {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let base = register_window();
        let reg = XhciRegisters::new(base);
        let data = Data::new(reg.clone(), MAX_SLOTS as _, MAX_PORTS, false).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let drivers = ClassDrivers::new();
        drivers.set_mouse_observer(Arc::new(move |dx: i8, dy: i8| {
            sink.lock().unwrap().push((dx, dy))
        }));

        Self {
            base,
            reg,
            data,
            drivers,
            seen,
        }
    }

    fn read32(&self, offset: usize) -> u32 {
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().read_volatile() }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<u32>()
                .write_volatile(value)
        }
    }

    fn portsc(&self, port: u8) -> u32 {
        self.read32(PORTSC + 0x10 * (port as usize - 1))
    }

    fn set_portsc(&mut self, port: u8, value: u32) {
        self.write32(PORTSC + 0x10 * (port as usize - 1), value);
    }

    fn doorbell(&self, slot: u8) -> u32 {
        self.read32(DBOFF + 4 * slot as usize)
    }

    fn clear_doorbell(&mut self, slot: u8) {
        self.write32(DBOFF + 4 * slot as usize, 0);
    }

    fn port(&self, index: u8) -> XhciPort {
        XhciPort::new(index, self.reg.clone())
    }

    fn attach(&mut self, port: u8, speed: u32) {
        self.set_portsc(port, CCS | CSC | (speed << 10));
    }

    fn configure(&mut self, index: u8) -> crate::err::Result {
        let port = self.port(index);
        self.data.configure_port(&port)
    }

    fn phase(&self, port: u8) -> PortConfigPhase {
        self.data.phase(port).unwrap()
    }

    fn process(&mut self, raw: [u32; 4]) -> crate::err::Result<Event> {
        self.data.event.inject(raw);
        self.data.process_event(&self.drivers)
    }

    /// Ends the reset of `port`; `enabled` is what the port reports after it.
    fn finish_reset(&mut self, port: u8, enabled: bool) -> crate::err::Result<Event> {
        let mut portsc = (self.portsc(port) & !PR) | PRC;
        if enabled {
            portsc |= PED;
        }
        self.set_portsc(port, portsc);
        self.process([
            (port as u32) << 24,
            0,
            CC_SUCCESS << 24,
            TRB_PORT_STATUS_CHANGE << 10,
        ])
    }

    fn last_command(&self) -> (BusAddr, [u32; 4]) {
        let i = self.data.cmd.i - 1;
        let raw = self.data.cmd.trbs.get(i).unwrap().to_raw();
        (self.data.cmd.trb_bus_addr(i), raw)
    }

    fn last_command_type(&self) -> u32 {
        trb_type(&self.last_command().1)
    }

    fn complete_command(&mut self, cc: u32, slot: u8) -> crate::err::Result<Event> {
        let (addr, _) = self.last_command();
        let addr = addr.raw();
        self.process([
            addr as u32,
            (addr >> 32) as u32,
            cc << 24,
            (TRB_COMMAND_COMPLETION << 10) | ((slot as u32) << 24),
        ])
    }

    fn transfer(
        &mut self,
        slot: u8,
        dci: u8,
        trb: BusAddr,
        cc: u32,
        residual: u32,
    ) -> crate::err::Result<Event> {
        let addr = trb.raw();
        self.process([
            addr as u32,
            (addr >> 32) as u32,
            (cc << 24) | residual,
            (TRB_TRANSFER_EVENT << 10) | ((dci as u32) << 16) | ((slot as u32) << 24),
        ])
    }

    fn pending(&self, slot: u8) -> Vec<BusAddr> {
        self.data
            .device_ref(SlotId::new(slot))
            .map(|dev| dev.pending_trbs())
            .unwrap_or_default()
    }

    /// The only outstanding transfer of `slot`.
    fn pending_one(&self, slot: u8) -> BusAddr {
        let pending = self.pending(slot);
        assert_eq!(pending.len(), 1, "pending: {pending:X?}");
        pending[0]
    }

    /// Plays the device: copies `bytes` into the buffer the TRB at `trb`
    /// points to.
    fn device_writes(&mut self, trb: BusAddr, bytes: &[u8]) {
        let raw = unsafe { (trb.raw() as usize as *const [u32; 4]).read_volatile() };
        let buf = raw[0] as u64 | ((raw[1] as u64) << 32);
        assert!(bytes.len() <= raw[2] as usize & 0x1ffff);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as usize as *mut u8, bytes.len());
        }
    }

    /// Answers the outstanding control IN transfer of `slot` with `bytes`.
    fn control_in(
        &mut self,
        slot: u8,
        bytes: &[u8],
        requested: usize,
    ) -> crate::err::Result<Event> {
        let trb = self.pending_one(slot);
        self.device_writes(trb, bytes);
        let residual = (requested - bytes.len()) as u32;
        let cc = if residual == 0 {
            CC_SUCCESS
        } else {
            CC_SHORT_PACKET
        };
        self.transfer(slot, 1, trb, cc, residual)
    }

    /// Completes the status stage of the outstanding no-data request.
    fn control_status(&mut self, slot: u8) -> crate::err::Result<Event> {
        let trb = self.pending_one(slot);
        self.transfer(slot, 1, trb, CC_SUCCESS, 0)
    }

    /// Takes `port` from attach to Address Device completion as `slot`.
    fn address(&mut self, port: u8, slot: u8) {
        self.attach(port, LOW_SPEED);
        self.configure(port).unwrap();
        assert_eq!(self.phase(port), PortConfigPhase::ResettingPort);

        assert_eq!(
            self.finish_reset(port, true).unwrap(),
            Event::PortStatusChange { port }
        );
        assert_eq!(self.phase(port), PortConfigPhase::EnablingSlot);
        assert_eq!(self.last_command_type(), TRB_ENABLE_SLOT);

        assert_eq!(
            self.complete_command(CC_SUCCESS, slot).unwrap(),
            Event::CommandCompletion { slot }
        );
        assert_eq!(self.phase(port), PortConfigPhase::AddressingDevice);
        assert_eq!(self.last_command_type(), TRB_ADDRESS_DEVICE);

        self.complete_command(CC_SUCCESS, slot).unwrap();
        assert_eq!(self.phase(port), PortConfigPhase::InitializingDevice);
    }

    /// Runs a boot mouse on `port` through enumeration and returns the
    /// interrupt IN TRB it is polling with.
    fn enumerate_mouse(&mut self, port: u8, slot: u8) -> BusAddr {
        self.address(port, slot);

        // Phase 0: the first 8 bytes give the EP0 packet size.
        assert_eq!(
            self.control_in(slot, &MOUSE_DEVICE[..8], 8).unwrap(),
            Event::Transfer { slot }
        );
        assert_eq!(self.last_command_type(), TRB_EVALUATE_CONTEXT);
        self.complete_command(CC_SUCCESS, slot).unwrap();

        // Phase 1: full device descriptor, then the configuration.
        self.control_in(slot, &MOUSE_DEVICE, 18).unwrap();
        // Phase 2: bind the interface, SET_CONFIGURATION.
        self.control_in(slot, &BOOT_MOUSE_CONFIG, 1024).unwrap();
        assert_eq!(self.phase(port), PortConfigPhase::InitializingDevice);
        // Phase 3: configured, endpoints go to the controller.
        self.control_status(slot).unwrap();
        assert_eq!(self.phase(port), PortConfigPhase::ConfiguringEndpoints);
        assert_eq!(self.last_command_type(), TRB_CONFIGURE_ENDPOINT);

        self.complete_command(CC_SUCCESS, slot).unwrap();
        assert_eq!(self.phase(port), PortConfigPhase::Configured);

        // SET_PROTOCOL from the mouse driver, then polling starts.
        self.control_status(slot).unwrap();
        assert_eq!(self.doorbell(slot), MOUSE_DCI as u32);
        self.pending_one(slot)
    }

    fn report(&mut self, slot: u8, trb: BusAddr, bytes: &[u8]) -> crate::err::Result<Event> {
        self.device_writes(trb, bytes);
        let residual = (8 - bytes.len()) as u32;
        self.transfer(slot, MOUSE_DCI, trb, CC_SHORT_PACKET, residual)
    }

    fn seen(&self) -> Vec<(i8, i8)> {
        self.seen.lock().unwrap().clone()
    }
}

#[test]
fn configure_port_resets_once() {
    let mut host = Host::new();
    host.attach(1, LOW_SPEED);

    host.configure(1).unwrap();
    assert_eq!(host.phase(1), PortConfigPhase::ResettingPort);
    assert_ne!(host.portsc(1) & PR, 0);
    assert_eq!(host.data.addressing_port(), Some(1));

    host.set_portsc(1, host.portsc(1) & !PR);
    host.configure(1).unwrap();
    assert_eq!(host.phase(1), PortConfigPhase::ResettingPort);
    assert_eq!(host.portsc(1) & PR, 0);
}

#[test]
fn configure_port_rejects_empty_and_unknown_ports() {
    let mut host = Host::new();
    let e = host.configure(2).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::PortNotConnected);
    assert_eq!(host.phase(2), PortConfigPhase::NotConnected);
    assert!(host.data.phase(0).is_none());
    assert!(host.data.phase(MAX_PORTS + 1).is_none());
}

#[test]
fn second_port_waits_for_the_addressing_turn() {
    let mut host = Host::new();
    host.attach(3, LOW_SPEED);
    host.address(1, 1);
    assert_eq!(host.data.addressing_port(), None);

    host.attach(2, LOW_SPEED);
    host.attach(4, LOW_SPEED);
    host.configure(2).unwrap();
    host.configure(3).unwrap();
    host.configure(4).unwrap();
    assert_eq!(host.phase(2), PortConfigPhase::ResettingPort);
    assert_eq!(host.phase(3), PortConfigPhase::WaitingAddressed);
    assert_eq!(host.phase(4), PortConfigPhase::WaitingAddressed);
    assert_eq!(host.portsc(3) & PR, 0);

    host.finish_reset(2, true).unwrap();
    host.complete_command(CC_SUCCESS, 2).unwrap();
    assert_eq!(host.phase(3), PortConfigPhase::WaitingAddressed);

    // Address Device on port 2 completes: the lowest waiting port goes next.
    host.complete_command(CC_SUCCESS, 2).unwrap();
    assert_eq!(host.phase(2), PortConfigPhase::InitializingDevice);
    assert_eq!(host.phase(3), PortConfigPhase::ResettingPort);
    assert_eq!(host.phase(4), PortConfigPhase::WaitingAddressed);
    assert_eq!(host.data.addressing_port(), Some(3));
    assert_ne!(host.portsc(3) & PR, 0);
}

#[test]
fn failed_enable_slot_hands_the_turn_on() {
    let mut host = Host::new();
    host.attach(1, LOW_SPEED);
    host.attach(2, LOW_SPEED);
    host.configure(1).unwrap();
    host.configure(2).unwrap();
    host.finish_reset(1, true).unwrap();
    assert_eq!(host.last_command_type(), TRB_ENABLE_SLOT);

    let e = host.complete_command(CC_NO_SLOTS, 0).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::TransferFailed);
    assert_eq!(host.phase(1), PortConfigPhase::NotConnected);
    assert_eq!(host.phase(2), PortConfigPhase::ResettingPort);
    assert_eq!(host.data.addressing_port(), Some(2));
}

#[test]
fn reset_without_enable_releases_the_turn() {
    let mut host = Host::new();
    host.attach(1, LOW_SPEED);
    host.attach(2, LOW_SPEED);
    host.configure(1).unwrap();
    host.configure(2).unwrap();
    let before = host.data.cmd.i;

    let e = host.finish_reset(1, false).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::PortResetFailed);
    assert_eq!(host.phase(1), PortConfigPhase::NotConnected);
    assert_eq!(host.phase(2), PortConfigPhase::ResettingPort);
    assert_eq!(host.data.addressing_port(), Some(2));
    // No Enable Slot went out for port 1.
    assert_eq!(host.data.cmd.i, before);
}

#[test]
fn unplug_during_reset_releases_the_turn() {
    let mut host = Host::new();
    host.attach(1, LOW_SPEED);
    host.attach(2, LOW_SPEED);
    host.configure(1).unwrap();
    host.configure(2).unwrap();

    host.set_portsc(1, CSC);
    let e = host
        .process([1 << 24, 0, CC_SUCCESS << 24, TRB_PORT_STATUS_CHANGE << 10])
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::PortResetFailed);
    assert_eq!(host.phase(1), PortConfigPhase::NotConnected);
    assert_eq!(host.phase(2), PortConfigPhase::ResettingPort);
}

#[test]
fn unknown_speed_disables_the_slot() {
    let mut host = Host::new();
    host.attach(1, 0);
    host.attach(2, LOW_SPEED);
    host.configure(1).unwrap();
    host.configure(2).unwrap();
    host.finish_reset(1, true).unwrap();

    let e = host.complete_command(CC_SUCCESS, 5).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::UnknownXhciSpeedId);

    assert_eq!(host.data.dev_list.entry(SlotId::new(5)), Some(0));
    assert!(host.data.device_ref(SlotId::new(5)).is_none());
    let (_, raw) = host.last_command();
    assert_eq!(trb_type(&raw), TRB_DISABLE_SLOT);
    assert_eq!(raw[3] >> 24, 5);

    assert_eq!(host.phase(1), PortConfigPhase::NotConnected);
    assert_eq!(host.phase(2), PortConfigPhase::ResettingPort);
    assert_eq!(host.data.addressing_port(), Some(2));
}

#[test]
fn failed_address_device_clears_the_context_entry() {
    let mut host = Host::new();
    host.attach(1, LOW_SPEED);
    host.configure(1).unwrap();
    host.finish_reset(1, true).unwrap();
    host.complete_command(CC_SUCCESS, 1).unwrap();
    assert_eq!(host.last_command_type(), TRB_ADDRESS_DEVICE);
    assert_ne!(host.data.dev_list.entry(SlotId::new(1)), Some(0));

    let e = host.complete_command(CC_TRANSACTION_ERROR, 1).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::TransferFailed);
    assert_eq!(host.data.dev_list.entry(SlotId::new(1)), Some(0));
    assert!(host.data.device_ref(SlotId::new(1)).is_none());
    assert_eq!(host.last_command_type(), TRB_DISABLE_SLOT);
    assert_eq!(host.phase(1), PortConfigPhase::NotConnected);
    assert_eq!(host.data.addressing_port(), None);

    // The slot's Disable Slot completion is only logged.
    assert_eq!(
        host.complete_command(CC_SUCCESS, 1).unwrap(),
        Event::CommandCompletion { slot: 1 }
    );
}

#[test]
fn mouse_enumeration_reaches_the_observer() {
    let mut host = Host::new();
    assert_eq!(host.data.process_event(&host.drivers).unwrap(), Event::Nothing);

    let trb = host.enumerate_mouse(2, 1);
    assert!(host.seen().is_empty());

    assert_eq!(
        host.report(1, trb, &[0x01, 5, (-5i8) as u8, 0]).unwrap(),
        Event::Transfer { slot: 1 }
    );
    assert_eq!(host.seen(), [(5, -5)]);

    // The driver re-armed its endpoint with a fresh TRB.
    let next = host.pending_one(1);
    assert_ne!(next, trb);
    host.report(1, next, &[0, 127, (-128i8) as u8]).unwrap();
    assert_eq!(host.seen(), [(5, -5), (127, -128)]);
}

#[test]
fn halted_interrupt_endpoint_is_reset_and_rearmed() {
    let mut host = Host::new();
    let trb = host.enumerate_mouse(1, 2);

    assert_eq!(
        host.transfer(2, MOUSE_DCI, trb, CC_TRANSACTION_ERROR, 8).unwrap(),
        Event::Transfer { slot: 2 }
    );
    let (_, raw) = host.last_command();
    assert_eq!(trb_type(&raw), TRB_RESET_ENDPOINT);
    assert_eq!((raw[3] >> 16) & 0x1f, MOUSE_DCI as u32);
    assert_eq!(raw[3] >> 24, 2);
    assert_eq!(host.pending(2), [trb]);

    host.clear_doorbell(2);
    host.complete_command(CC_SUCCESS, 2).unwrap();
    assert_eq!(host.doorbell(2), MOUSE_DCI as u32);

    host.report(2, trb, &[0, 1, 2, 0]).unwrap();
    assert_eq!(host.seen(), [(1, 2)]);
}

#[test]
fn failed_control_transfer_is_reported() {
    let mut host = Host::new();
    host.address(1, 1);
    let trb = host.pending_one(1);

    let e = host.transfer(1, 1, trb, CC_TRANSACTION_ERROR, 8).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::TransferFailed);
    assert!(host.pending(1).is_empty());
}

#[test]
fn xhci_reports_its_ports_and_phases() {
    let _ = env_logger::builder().is_test(true).try_init();
    let base = register_window();
    let mut xhci = Xhci::new(base);
    let drivers = ClassDrivers::new();

    assert!(!xhci.is_initialized());
    assert_eq!(xhci.max_ports(), MAX_PORTS);
    assert_eq!(xhci.port_phase(1), None);
    let port = xhci.port_at(1);
    assert_eq!(port.number(), 1);
    let e = xhci.configure_port(&port, &drivers).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::NotInitialized);
    assert_eq!(
        xhci.process_event(&drivers).unwrap_err().kind(),
        ErrorKind::NotInitialized
    );

    xhci.data = Some(Data::new(xhci.reg.clone(), MAX_SLOTS as _, MAX_PORTS, false).unwrap());
    assert!(xhci.is_initialized());
    assert_eq!(xhci.port_phase(1), Some(PortConfigPhase::NotConnected));
    assert_eq!(xhci.port_phase(0), None);
    assert_eq!(xhci.port_phase(MAX_PORTS + 1), None);

    unsafe { base.as_ptr().add(PORTSC).cast::<u32>().write_volatile(CCS | CSC) };
    assert!(port.is_connected());
    xhci.configure_port(&port, &drivers).unwrap();
    assert_eq!(xhci.port_phase(1), Some(PortConfigPhase::ResettingPort));

    xhci.enable_irq();
    assert!(xhci.disable_irq());
    assert!(!xhci.disable_irq());
}
