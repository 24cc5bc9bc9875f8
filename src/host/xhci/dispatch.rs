//! Event ring dispatch and the per-port negotiation state machine.

use alloc::{collections::btree_map::BTreeMap, vec, vec::Vec};

use log::{debug, info, trace, warn};
use mbarrier::mb;
use xhci::{
    registers::doorbell,
    ring::trb::{
        command,
        event::{Allowed, CommandCompletion, TransferEvent},
    },
};

use super::{
    context::{DeviceContextList, ScratchpadBufferArray},
    device::{Device, DeviceCommand},
    event::EventRing,
    port::{PortConfigPhase, XhciPort},
    reg::XhciRegisters,
    ring::{Direction, Ring},
};
use crate::{BusAddr, SlotId, class::ClassDrivers, err::*, host::Event, host::PortOp};

/// A command waiting for its completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    EnableSlot { port: u8 },
    AddressDevice { slot: SlotId },
    EvaluateContext { slot: SlotId },
    ConfigureEndpoint { slot: SlotId },
    DisableSlot { slot: SlotId },
    ResetEndpoint { slot: SlotId, dci: u8 },
}

/// Controller state that exists only after a successful `init`.
pub(crate) struct Data {
    reg: XhciRegisters,
    pub dev_list: DeviceContextList,
    pub cmd: Ring,
    pub event: EventRing,
    pub scratchpad: Option<ScratchpadBufferArray>,
    is_64: bool,
    /// Indexed by 1-based port number; entry 0 is unused.
    phases: Vec<PortConfigPhase>,
    /// The one port allowed between reset and Address Device completion.
    addressing_port: Option<u8>,
    pending_cmds: BTreeMap<BusAddr, Command>,
    devices: BTreeMap<SlotId, Device>,
}

impl Data {
    pub fn new(reg: XhciRegisters, max_slots: usize, max_ports: u8, is_64: bool) -> Result<Self> {
        Ok(Self {
            reg,
            dev_list: DeviceContextList::new(max_slots)?,
            cmd: Ring::new(true, Direction::Bidirectional)?,
            event: EventRing::new()?,
            scratchpad: None,
            is_64,
            phases: vec![PortConfigPhase::NotConnected; max_ports as usize + 1],
            addressing_port: None,
            pending_cmds: BTreeMap::new(),
            devices: BTreeMap::new(),
        })
    }

    pub fn phase(&self, port: u8) -> Option<PortConfigPhase> {
        if port == 0 {
            return None;
        }
        self.phases.get(port as usize).copied()
    }

    fn phase_mut(&mut self, port: u8) -> Result<&mut PortConfigPhase> {
        if port == 0 {
            return Err(err!(IndexOutOfRange));
        }
        self.phases
            .get_mut(port as usize)
            .ok_or(err!(IndexOutOfRange))
    }

    fn set_phase(&mut self, port: u8, phase: PortConfigPhase) -> Result {
        let p = self.phase_mut(port)?;
        trace!("port {port}: {p:?} -> {phase:?}");
        *p = phase;
        Ok(())
    }

    pub fn configure_port(&mut self, port: &XhciPort) -> Result {
        let index = port.number();
        let phase = self.phase(index).ok_or(err!(IndexOutOfRange))?;
        if !port.is_connected() {
            return Err(err!(PortNotConnected));
        }
        match phase {
            PortConfigPhase::NotConnected => self.reset_port(index),
            phase => {
                debug!("port {index}: already {phase:?}, skipped");
                Ok(())
            }
        }
    }

    /// Resets `index` now, or queues it when another port is addressing.
    fn reset_port(&mut self, index: u8) -> Result {
        let mut port = XhciPort::new(index, self.reg.clone());
        if !port.is_connected() {
            return Ok(());
        }

        if self.addressing_port.is_some() {
            return self.set_phase(index, PortConfigPhase::WaitingAddressed);
        }

        match self.phase(index).ok_or(err!(IndexOutOfRange))? {
            PortConfigPhase::NotConnected | PortConfigPhase::WaitingAddressed => {
                self.addressing_port = Some(index);
                self.set_phase(index, PortConfigPhase::ResettingPort)?;
                port.reset();
                Ok(())
            }
            _ => Err(err!(InvalidPhase)),
        }
    }

    /// Hands the addressing turn to the lowest numbered waiting port.
    fn reset_next_waiting(&mut self) -> Result {
        let next = self
            .phases
            .iter()
            .position(|p| *p == PortConfigPhase::WaitingAddressed);
        match next {
            Some(index) => self.reset_port(index as u8),
            None => Ok(()),
        }
    }

    /// Consumes one event record, if any.
    pub fn process_event(&mut self, drivers: &ClassDrivers) -> Result<Event> {
        let Some(trb) = self.event.next() else {
            return Ok(Event::Nothing);
        };

        let res = match trb {
            Allowed::PortStatusChange(ev) => {
                let port = ev.port_id();
                self.on_port_status_change(port)
                    .map(|_| Event::PortStatusChange { port })
            }
            Allowed::CommandCompletion(ev) => {
                let slot = ev.slot_id();
                self.on_command_completion(&ev)
                    .map(|_| Event::CommandCompletion { slot })
            }
            Allowed::TransferEvent(ev) => {
                let slot = ev.slot_id();
                self.on_transfer_event(&ev, drivers)
                    .map(|_| Event::Transfer { slot })
            }
            other => {
                debug!("ignored event {other:?}");
                Ok(Event::Other)
            }
        };

        self.ack_event();
        res
    }

    fn ack_event(&mut self) {
        let erdp = self.event.erdp();
        {
            let mut ir0 = self.reg.interrupter_register_set.interrupter_mut(0);
            ir0.erdp.update_volatile(|r| {
                r.set_event_ring_dequeue_pointer(erdp);
                r.clear_event_handler_busy();
            });
            ir0.iman.update_volatile(|r| {
                r.clear_interrupt_pending();
            });
        }
        self.reg.operational.usbsts.update_volatile(|r| {
            r.clear_event_interrupt();
        });
    }

    fn on_port_status_change(&mut self, index: u8) -> Result {
        let phase = self.phase(index).ok_or(err!(IndexOutOfRange))?;
        debug!("port {index}: status changed in {phase:?}");
        match phase {
            PortConfigPhase::NotConnected => self.reset_port(index),
            PortConfigPhase::ResettingPort => self.enable_slot(index),
            _ => Err(err!(InvalidPhase)),
        }
    }

    fn enable_slot(&mut self, index: u8) -> Result {
        let mut port = XhciPort::new(index, self.reg.clone());
        let connected = port.is_connected();
        let enabled = port.is_enabled();
        let reset_done = port.is_port_reset_changed();
        if connected && !reset_done {
            return Ok(());
        }
        if reset_done {
            port.clear_port_reset_change();
        }
        if !connected || !enabled {
            warn!("port {index}: reset ended with connected={connected} enabled={enabled}");
            self.release_addressing(index, None)?;
            return Err(err!(PortResetFailed));
        }

        self.set_phase(index, PortConfigPhase::EnablingSlot)?;
        self.post_command(
            Command::EnableSlot { port: index },
            command::Allowed::EnableSlot(command::EnableSlot::new()),
        );
        Ok(())
    }

    fn post_command(&mut self, kind: Command, trb: command::Allowed) {
        let addr = self.cmd.enque_command(trb);
        self.pending_cmds.insert(addr, kind);
        mb();
        self.reg
            .doorbell
            .write_volatile_at(0, doorbell::Register::default());
    }

    fn on_command_completion(&mut self, ev: &CommandCompletion) -> Result {
        let addr = BusAddr::from(ev.command_trb_pointer());
        let Some(cmd) = self.pending_cmds.remove(&addr) else {
            warn!("completion for unknown command @{addr:X}");
            return Err(err!(NoWaiter));
        };
        debug!("{cmd:?} completed: {:?}", ev.completion_code());

        if let Err(e) = ev.completion_code().to_result() {
            self.abort_command(cmd)?;
            return Err(e);
        }

        let slot = SlotId::from(ev.slot_id());
        match cmd {
            Command::EnableSlot { port } => self.address_device(port, slot),
            Command::AddressDevice { slot } => self.on_device_addressed(slot),
            Command::EvaluateContext { slot } => self.device(slot)?.on_context_evaluated(),
            Command::ConfigureEndpoint { slot } => {
                let dev = self.device(slot)?;
                dev.on_endpoints_configured()?;
                let port = dev.port();
                self.set_phase(port, PortConfigPhase::Configured)?;
                info!("port {port}: configured as slot {slot}");
                Ok(())
            }
            Command::DisableSlot { slot } => {
                debug!("slot {slot}: disabled");
                Ok(())
            }
            Command::ResetEndpoint { slot, dci } => self.device(slot)?.on_endpoint_reset(dci),
        }
    }

    /// A failed Enable Slot or Address Device gives up the addressing turn
    /// so waiting ports are not stuck behind it.
    fn abort_command(&mut self, cmd: Command) -> Result {
        match cmd {
            Command::EnableSlot { port } => self.release_addressing(port, None),
            Command::AddressDevice { slot } => match self.devices.get(&slot).map(Device::port) {
                Some(port) => self.release_addressing(port, Some(slot)),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Puts `port` back to `NotConnected`, disables `slot` if one was
    /// enabled for it, and hands the addressing turn on.
    fn release_addressing(&mut self, port: u8, slot: Option<SlotId>) -> Result {
        if let Some(slot) = slot {
            self.disable_slot(slot);
        }
        if self.addressing_port == Some(port) {
            self.addressing_port = None;
        }
        self.set_phase(port, PortConfigPhase::NotConnected)?;
        self.reset_next_waiting()
    }

    fn disable_slot(&mut self, slot: SlotId) {
        self.devices.remove(&slot);
        self.dev_list.release(slot);
        let mut trb = command::DisableSlot::new();
        trb.set_slot_id(slot.raw());
        self.post_command(
            Command::DisableSlot { slot },
            command::Allowed::DisableSlot(trb),
        );
    }

    fn address_device(&mut self, port: u8, slot: SlotId) -> Result {
        if self.addressing_port != Some(port)
            || self.phase(port) != Some(PortConfigPhase::EnablingSlot)
        {
            return Err(err!(InvalidPhase));
        }

        self.post_address_device(port, slot).or_else(|e| {
            warn!("port {port}: cannot address slot {slot}: {e}");
            self.release_addressing(port, Some(slot))?;
            Err(e)
        })
    }

    fn post_address_device(&mut self, port: u8, slot: SlotId) -> Result {
        let speed = XhciPort::new(port, self.reg.clone()).speed();
        let ctx = self.dev_list.new_ctx(slot, self.is_64)?;
        let dev = Device::new(slot, port, speed, ctx, self.reg.clone())?;
        let input = dev.input_bus_addr();
        if self.devices.insert(slot, dev).is_some() {
            warn!("slot {slot} reused while still tracked");
        }

        self.set_phase(port, PortConfigPhase::AddressingDevice)?;
        let mut trb = command::AddressDevice::new();
        trb.set_input_context_pointer(input).set_slot_id(slot.raw());
        self.post_command(
            Command::AddressDevice { slot },
            command::Allowed::AddressDevice(trb),
        );
        Ok(())
    }

    fn on_device_addressed(&mut self, slot: SlotId) -> Result {
        let port = self.device(slot)?.port();
        if self.addressing_port != Some(port)
            || self.phase(port) != Some(PortConfigPhase::AddressingDevice)
        {
            return Err(err!(InvalidPhase));
        }

        self.addressing_port = None;
        self.set_phase(port, PortConfigPhase::InitializingDevice)?;
        self.device(slot)?.start_initialize()?;
        self.reset_next_waiting()
    }

    fn on_transfer_event(&mut self, ev: &TransferEvent, drivers: &ClassDrivers) -> Result {
        let slot = SlotId::from(ev.slot_id());
        let dev = self.device(slot)?;
        let port = dev.port();

        match dev.on_transfer_event(ev, drivers)? {
            None => Ok(()),
            Some(DeviceCommand::EvaluateContext { input }) => {
                let mut trb = command::EvaluateContext::new();
                trb.set_input_context_pointer(input).set_slot_id(slot.raw());
                self.post_command(
                    Command::EvaluateContext { slot },
                    command::Allowed::EvaluateContext(trb),
                );
                Ok(())
            }
            Some(DeviceCommand::ConfigureEndpoint { input }) => {
                self.set_phase(port, PortConfigPhase::ConfiguringEndpoints)?;
                let mut trb = command::ConfigureEndpoint::new();
                trb.set_input_context_pointer(input).set_slot_id(slot.raw());
                self.post_command(
                    Command::ConfigureEndpoint { slot },
                    command::Allowed::ConfigureEndpoint(trb),
                );
                Ok(())
            }
            Some(DeviceCommand::ResetEndpoint { dci }) => {
                let mut trb = command::ResetEndpoint::new();
                trb.set_endpoint_id(dci).set_slot_id(slot.raw());
                self.post_command(
                    Command::ResetEndpoint { slot, dci },
                    command::Allowed::ResetEndpoint(trb),
                );
                Ok(())
            }
        }
    }

    fn device(&mut self, slot: SlotId) -> Result<&mut Device> {
        self.devices.get_mut(&slot).ok_or(err!(InvalidSlotId))
    }

    #[cfg(test)]
    pub fn device_ref(&self, slot: SlotId) -> Option<&Device> {
        self.devices.get(&slot)
    }

    #[cfg(test)]
    pub fn addressing_port(&self) -> Option<u8> {
        self.addressing_port
    }
}
