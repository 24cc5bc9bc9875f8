//! One addressed device: its slot contexts, transfer rings, and the control
//! sequence that takes it from Address Device to bound class drivers.

use alloc::{boxed::Box, collections::btree_map::BTreeMap, vec::Vec};

use dma_api::DVec;
use log::{debug, trace, warn};
use mbarrier::mb;
use xhci::{
    context::EndpointType,
    registers::doorbell,
    ring::trb::{
        event::TransferEvent,
        transfer::{self, TransferType},
    },
};

use super::{
    context::ContextData,
    port::{default_max_packet_size, is_full_or_low_speed},
    reg::XhciRegisters,
    ring::{Direction, Ring},
};
use crate::{
    BusAddr, SlotId,
    class::{ClassDriver, ClassDrivers, TransferRequest},
    descriptor::{
        ConfigurationDescriptor, Descriptor, DescriptorIter, DescriptorType, DeviceDescriptor,
    },
    err::*,
    transfer::{self as usb, EndpointConfig, EndpointId, Request, SetupData},
};

/// Control transfer buffer; configuration blobs larger than this are
/// rejected.
const BUF_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitPhase {
    /// Reading the first 8 bytes of the device descriptor.
    Probing,
    /// Waiting for Evaluate Context with the real EP0 packet size.
    EvaluatingContext,
    ReadingDevice,
    ReadingConfig,
    SettingConfig,
    /// Endpoints handed to class drivers; control completions now belong
    /// to them.
    Ready,
}

/// A command the device needs posted on the command ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceCommand {
    EvaluateContext { input: u64 },
    ConfigureEndpoint { input: u64 },
    /// Clears a halted endpoint so its ring can run again.
    ResetEndpoint { dci: u8 },
}

enum Pending {
    Control {
        setup: SetupData,
        issuer: Option<usize>,
    },
    Interrupt {
        ep_id: EndpointId,
        len: usize,
    },
}

pub(crate) struct Device {
    slot_id: SlotId,
    port: u8,
    speed: u8,
    ctx: ContextData,
    reg: XhciRegisters,
    /// Transfer rings keyed by DCI.
    rings: BTreeMap<u8, Ring>,
    ctrl_buf: DVec<u8>,
    /// Interrupt IN buffers keyed by DCI.
    int_bufs: BTreeMap<u8, DVec<u8>>,
    /// In-flight transfers keyed by the TRB that raises the completion.
    pending: BTreeMap<BusAddr, Pending>,
    phase: InitPhase,
    config_value: u8,
    ep_configs: Vec<EndpointConfig>,
    drivers: Vec<Box<dyn ClassDriver>>,
    /// Owning driver index keyed by endpoint number.
    driver_of_ep: BTreeMap<u8, usize>,
}

unsafe impl Send for Device {}

impl Device {
    /// Fills the input context for Address Device: slot plus EP0.
    pub fn new(
        slot_id: SlotId,
        port: u8,
        speed: u8,
        mut ctx: ContextData,
        reg: XhciRegisters,
    ) -> Result<Self> {
        let max_packet_size = default_max_packet_size(speed)?;
        let ep0 = Ring::new(true, Direction::Bidirectional)?;
        let ring_addr = ep0.bus_addr().raw();
        let cycle = ep0.cycle;

        ctx.with_empty_input(|input| {
            let control = input.control_mut();
            control.set_add_context_flag(0);
            control.set_add_context_flag(1);

            let slot = input.device_mut().slot_mut();
            slot.set_root_hub_port_number(port);
            slot.set_route_string(0);
            slot.set_context_entries(1);
            slot.set_speed(speed);

            let ep = input.device_mut().endpoint_mut(1);
            ep.set_endpoint_type(EndpointType::Control);
            ep.set_max_packet_size(max_packet_size);
            ep.set_max_burst_size(0);
            ep.set_tr_dequeue_pointer(ring_addr);
            if cycle {
                ep.set_dequeue_cycle_state();
            } else {
                ep.clear_dequeue_cycle_state();
            }
            ep.set_interval(0);
            ep.set_max_primary_streams(0);
            ep.set_mult(0);
            ep.set_error_count(3);
            ep.set_average_trb_length(8);
        });

        let ctrl_buf =
            DVec::zeros(BUF_SIZE, 64, Direction::Bidirectional).ok_or(err!(NoEnoughMemory))?;

        let mut rings = BTreeMap::new();
        rings.insert(EndpointId::DEFAULT_CONTROL_PIPE.dci(), ep0);

        Ok(Self {
            slot_id,
            port,
            speed,
            ctx,
            reg,
            rings,
            ctrl_buf,
            int_bufs: BTreeMap::new(),
            pending: BTreeMap::new(),
            phase: InitPhase::Probing,
            config_value: 0,
            ep_configs: Vec::new(),
            drivers: Vec::new(),
            driver_of_ep: BTreeMap::new(),
        })
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn input_bus_addr(&self) -> u64 {
        self.ctx.input_bus_addr()
    }

    /// Addressed: learn the default pipe's real packet size.
    pub fn start_initialize(&mut self) -> Result {
        self.phase = InitPhase::Probing;
        self.control_transfer(
            SetupData::get_descriptor(DescriptorType::Device, 0, DeviceDescriptor::PROBE_LEN as _),
            None,
        )
    }

    /// Evaluate Context finished: read the whole device descriptor.
    pub fn on_context_evaluated(&mut self) -> Result {
        if self.phase != InitPhase::EvaluatingContext {
            return Err(err!(InvalidPhase));
        }
        self.phase = InitPhase::ReadingDevice;
        self.control_transfer(
            SetupData::get_descriptor(DescriptorType::Device, 0, DeviceDescriptor::LEN as _),
            None,
        )
    }

    /// Configure Endpoint finished: let every driver start its traffic.
    pub fn on_endpoints_configured(&mut self) -> Result {
        for idx in 0..self.drivers.len() {
            let req = self.drivers[idx].on_endpoints_configured()?;
            self.schedule(idx, req)?;
        }
        Ok(())
    }

    pub fn on_transfer_event(
        &mut self,
        ev: &TransferEvent,
        drivers: &ClassDrivers,
    ) -> Result<Option<DeviceCommand>> {
        let addr = BusAddr::from(ev.trb_pointer());
        let Some(pending) = self.pending.remove(&addr) else {
            warn!("slot {}: no transfer recorded for TRB @{addr:X}", self.slot_id);
            return Err(err!(NoCorrespondingSetupStage));
        };

        if let Err(e) = ev.completion_code().to_result() {
            warn!(
                "slot {}: transfer @{addr:X} failed: {:?}",
                self.slot_id,
                ev.completion_code()
            );
            return match pending {
                Pending::Interrupt { ep_id, len } => {
                    warn!(
                        "slot {}: endpoint {} halted, resetting",
                        self.slot_id,
                        ep_id.dci()
                    );
                    // The ring restarts at this TRB once the reset completes.
                    self.pending.insert(addr, Pending::Interrupt { ep_id, len });
                    Ok(Some(DeviceCommand::ResetEndpoint { dci: ep_id.dci() }))
                }
                Pending::Control { .. } => Err(e),
            };
        }
        let residual = ev.trb_transfer_length() as usize;

        match pending {
            Pending::Control { setup, issuer } => {
                let len = (setup.length as usize).saturating_sub(residual);
                let data = read_buf(&self.ctrl_buf, len);
                self.on_control_completed(setup, issuer, &data, drivers)
            }
            Pending::Interrupt { ep_id, len } => {
                let len = len.saturating_sub(residual);
                let data = match self.int_bufs.get(&ep_id.dci()) {
                    Some(buf) => read_buf(buf, len),
                    None => Vec::new(),
                };
                self.on_interrupt_completed(ep_id, &data)?;
                Ok(None)
            }
        }
    }

    /// Reset Endpoint finished: ring the doorbell so the transfer that
    /// halted the endpoint runs again.
    pub fn on_endpoint_reset(&mut self, dci: u8) -> Result {
        let ep_id = EndpointId::from_dci(dci);
        let armed = self
            .pending
            .values()
            .any(|p| matches!(p, Pending::Interrupt { ep_id: id, .. } if *id == ep_id));
        if !armed {
            warn!("slot {}: endpoint {dci} reset with nothing queued", self.slot_id);
            return Err(err!(NoWaiter));
        }
        debug!("slot {}: endpoint {dci} reset, restarting", self.slot_id);
        self.ring_doorbell(dci);
        Ok(())
    }

    fn on_control_completed(
        &mut self,
        setup: SetupData,
        issuer: Option<usize>,
        data: &[u8],
        drivers: &ClassDrivers,
    ) -> Result<Option<DeviceCommand>> {
        debug!(
            "slot {}: control completed in {:?}, {} bytes",
            self.slot_id,
            self.phase,
            data.len()
        );
        match self.phase {
            InitPhase::Probing => {
                expect_request(&setup, Request::GetDescriptor)?;
                let desc = DeviceDescriptor::parse(data).ok_or(err!(InvalidDescriptor))?;
                self.initialize_phase0(&desc).map(Some)
            }
            InitPhase::ReadingDevice => {
                expect_request(&setup, Request::GetDescriptor)?;
                let desc = DeviceDescriptor::parse(data)
                    .filter(|_| data.len() >= DeviceDescriptor::LEN)
                    .ok_or(err!(InvalidDescriptor))?;
                self.initialize_phase1(&desc)?;
                Ok(None)
            }
            InitPhase::ReadingConfig => {
                expect_request(&setup, Request::GetDescriptor)?;
                self.initialize_phase2(data, drivers)?;
                Ok(None)
            }
            InitPhase::SettingConfig => {
                expect_request(&setup, Request::SetConfiguration)?;
                self.initialize_phase3().map(Some)
            }
            InitPhase::Ready => {
                let idx = issuer.ok_or(err!(NoWaiter))?;
                let driver = self.drivers.get_mut(idx).ok_or(err!(NoWaiter))?;
                let req = driver.on_control_completed(EndpointId::DEFAULT_CONTROL_PIPE, setup, data)?;
                self.schedule(idx, req)?;
                Ok(None)
            }
            InitPhase::EvaluatingContext => Err(err!(InvalidPhase)),
        }
    }

    fn on_interrupt_completed(&mut self, ep_id: EndpointId, data: &[u8]) -> Result {
        trace!("slot {}: interrupt completed on DCI {}", self.slot_id, ep_id.dci());
        let idx = *self
            .driver_of_ep
            .get(&ep_id.number())
            .ok_or(err!(NoWaiter))?;
        let req = self.drivers[idx].on_interrupt_completed(ep_id, data)?;
        self.schedule(idx, req)
    }

    fn initialize_phase0(&mut self, desc: &DeviceDescriptor) -> Result<DeviceCommand> {
        let max_packet_size = desc.ep0_max_packet_size();
        debug!(
            "slot {}: USB {:04x}, EP0 max packet size {}",
            self.slot_id, desc.usb_release, max_packet_size
        );
        self.ctx.with_changed_input(|input| {
            input.control_mut().set_add_context_flag(1);
            input
                .device_mut()
                .endpoint_mut(1)
                .set_max_packet_size(max_packet_size);
        });
        self.phase = InitPhase::EvaluatingContext;
        Ok(DeviceCommand::EvaluateContext {
            input: self.ctx.input_bus_addr(),
        })
    }

    fn initialize_phase1(&mut self, desc: &DeviceDescriptor) -> Result {
        debug!(
            "slot {}: device {:04x}:{:04x}, {} configuration(s)",
            self.slot_id, desc.vendor_id, desc.product_id, desc.num_configurations
        );
        if desc.num_configurations == 0 {
            return Err(err!(InvalidDescriptor));
        }
        self.phase = InitPhase::ReadingConfig;
        self.control_transfer(
            SetupData::get_descriptor(DescriptorType::Configuration, 0, BUF_SIZE as _),
            None,
        )
    }

    fn initialize_phase2(&mut self, data: &[u8], drivers: &ClassDrivers) -> Result {
        let conf = ConfigurationDescriptor::parse(data).ok_or(err!(InvalidDescriptor))?;
        if conf.total_length as usize > data.len() {
            warn!(
                "slot {}: configuration is {} bytes, got {}",
                self.slot_id,
                conf.total_length,
                data.len()
            );
            return Err(err!(BufferTooSmall));
        }

        // Endpoints that follow an interface belong to that interface's
        // driver; endpoints of unsupported interfaces are skipped.
        let mut current: Option<usize> = None;
        for desc in DescriptorIter::new(&data[..conf.total_length as usize]) {
            match desc {
                Descriptor::Interface(intf) => {
                    current = match drivers.new_class_driver(&intf) {
                        Ok(driver) => {
                            self.drivers.push(driver);
                            Some(self.drivers.len() - 1)
                        }
                        Err(e) if e.kind() == ErrorKind::UnsupportedInterface => None,
                        Err(e) => return Err(e),
                    };
                }
                Descriptor::Endpoint(ep) => {
                    if let Some(idx) = current {
                        let conf = EndpointConfig::from(&ep);
                        debug!("slot {}: {:?}", self.slot_id, conf);
                        self.driver_of_ep.insert(conf.ep_id.number(), idx);
                        self.ep_configs.push(conf);
                    }
                }
                Descriptor::Hid(hid) => trace!("slot {}: {:?}", self.slot_id, hid),
                _ => {}
            }
        }

        if self.drivers.is_empty() {
            warn!("slot {}: no available class drivers found", self.slot_id);
            return Err(err!(UnknownDevice));
        }

        self.config_value = conf.configuration_value;
        self.phase = InitPhase::SettingConfig;
        debug!(
            "slot {}: set configuration {}",
            self.slot_id, self.config_value
        );
        self.control_transfer(SetupData::set_configuration(self.config_value), None)
    }

    fn initialize_phase3(&mut self) -> Result<DeviceCommand> {
        for conf in &self.ep_configs {
            if let Some(&idx) = self.driver_of_ep.get(&conf.ep_id.number()) {
                self.drivers[idx].set_endpoint(conf)?;
            }
        }
        let input = self.configure_endpoints()?;
        self.phase = InitPhase::Ready;
        debug!("slot {}: initialized", self.slot_id);
        Ok(DeviceCommand::ConfigureEndpoint { input })
    }

    /// Allocates a ring for every endpoint and fills the input context for
    /// Configure Endpoint.
    fn configure_endpoints(&mut self) -> Result<u64> {
        let mut eps = Vec::with_capacity(self.ep_configs.len());
        for conf in &self.ep_configs {
            if conf.ep_id.number() > 15 {
                return Err(err!(InvalidEndpointNumber));
            }
            let ring = Ring::new(true, Direction::Bidirectional)?;
            eps.push((*conf, ring.bus_addr().raw(), ring.cycle));
            self.rings.insert(conf.ep_id.dci(), ring);
        }

        let max_dci = eps.iter().map(|(c, _, _)| c.ep_id.dci()).max().unwrap_or(1);
        let full_or_low = is_full_or_low_speed(self.speed);

        self.ctx.with_changed_input(|input| {
            let control = input.control_mut();
            control.set_add_context_flag(0);
            for (conf, _, _) in &eps {
                control.set_add_context_flag(conf.ep_id.dci() as usize);
            }
            input.device_mut().slot_mut().set_context_entries(max_dci);

            for (conf, ring_addr, cycle) in &eps {
                let ep = input.device_mut().endpoint_mut(conf.ep_id.dci() as usize);
                ep.set_endpoint_type(conf.ep_type.to_xhci(conf.ep_id.is_in()));
                ep.set_max_packet_size(conf.max_packet_size);
                ep.set_interval(xhci_interval(conf, full_or_low));
                ep.set_average_trb_length(1);
                ep.set_tr_dequeue_pointer(*ring_addr);
                if *cycle {
                    ep.set_dequeue_cycle_state();
                } else {
                    ep.clear_dequeue_cycle_state();
                }
                ep.set_max_primary_streams(0);
                ep.set_mult(0);
                ep.set_error_count(3);
            }
        });

        Ok(self.ctx.input_bus_addr())
    }

    fn schedule(&mut self, issuer: usize, req: TransferRequest) -> Result {
        match req {
            TransferRequest::NoOp => Ok(()),
            TransferRequest::ControlOut(setup) => self.control_transfer(setup, Some(issuer)),
            TransferRequest::InterruptIn { ep_id, len } => self.interrupt_in(ep_id, len),
        }
    }

    /// Queues Setup, optional IN Data, and Status on the default pipe.
    fn control_transfer(&mut self, setup: SetupData, issuer: Option<usize>) -> Result {
        let len = setup.length as usize;
        let dir_in = setup.direction() == usb::Direction::In;
        if len > self.ctrl_buf.len() {
            return Err(err!(BufferTooSmall));
        }
        if len > 0 && !dir_in {
            return Err(err!(NotImplemented));
        }
        let buf_addr = self.ctrl_buf.bus_addr();
        let dci = EndpointId::DEFAULT_CONTROL_PIPE.dci();
        let ring = self.rings.get_mut(&dci).ok_or(err!(TransferRingNotSet))?;

        let mut setup_trb = transfer::SetupStage::new();
        setup_trb
            .set_request_type(setup.request_type)
            .set_request(setup.request)
            .set_value(setup.value)
            .set_index(setup.index)
            .set_length(setup.length)
            .set_transfer_type(if len == 0 {
                TransferType::No
            } else {
                TransferType::In
            });
        ring.enque_transfer(setup_trb.into());

        let mut status = transfer::StatusStage::new();
        let completion = if len > 0 {
            let mut data = transfer::DataStage::new();
            data.set_data_buffer_pointer(buf_addr)
                .set_trb_transfer_length(len as _)
                .set_direction(transfer::Direction::In)
                .set_interrupt_on_completion();
            let addr = ring.enque_transfer(data.into());
            ring.enque_transfer(status.into());
            addr
        } else {
            status.set_direction().set_interrupt_on_completion();
            ring.enque_transfer(status.into())
        };

        self.pending
            .insert(completion, Pending::Control { setup, issuer });
        self.ring_doorbell(dci);
        Ok(())
    }

    fn interrupt_in(&mut self, ep_id: EndpointId, len: usize) -> Result {
        if ep_id.number() > 15 || !ep_id.is_in() {
            return Err(err!(InvalidEndpointNumber));
        }
        let dci = ep_id.dci();
        let fits = self.int_bufs.get(&dci).is_some_and(|b| b.len() >= len);
        if !fits {
            let buf =
                DVec::zeros(len.max(8), 64, Direction::FromDevice).ok_or(err!(NoEnoughMemory))?;
            self.int_bufs.insert(dci, buf);
        }
        let buf_addr = self
            .int_bufs
            .get(&dci)
            .map(|b| b.bus_addr())
            .ok_or(err!(NoEnoughMemory))?;

        let ring = self.rings.get_mut(&dci).ok_or(err!(TransferRingNotSet))?;
        let mut normal = transfer::Normal::new();
        normal
            .set_data_buffer_pointer(buf_addr)
            .set_trb_transfer_length(len as _)
            .set_interrupt_on_short_packet()
            .set_interrupt_on_completion();
        let addr = ring.enque_transfer(normal.into());

        self.pending.insert(addr, Pending::Interrupt { ep_id, len });
        self.ring_doorbell(dci);
        Ok(())
    }

    /// TRBs whose completion events are still outstanding.
    #[cfg(test)]
    pub fn pending_trbs(&self) -> Vec<BusAddr> {
        self.pending.keys().copied().collect()
    }

    fn ring_doorbell(&mut self, dci: u8) {
        mb();
        trace!("slot {}: ring doorbell, target {dci}", self.slot_id);
        let mut bell = doorbell::Register::default();
        bell.set_doorbell_target(dci);
        self.reg
            .doorbell
            .write_volatile_at(self.slot_id.as_usize(), bell);
    }
}

fn expect_request(setup: &SetupData, req: Request) -> Result {
    if setup.request() == req {
        Ok(())
    } else {
        warn!("unexpected {:?} completion, waiting for {:?}", setup.request(), req);
        Err(err!(InvalidPhase))
    }
}

fn read_buf(buf: &DVec<u8>, len: usize) -> Vec<u8> {
    (0..len.min(buf.len())).filter_map(|i| buf.get(i)).collect()
}

/// Endpoint Context interval: frames for full/low speed interrupt
/// endpoints, exponent minus one otherwise.
fn xhci_interval(conf: &EndpointConfig, full_or_low: bool) -> u8 {
    fn frames_to_exponent(v: u8) -> u8 {
        if v == 0 { 0 } else { 7 - v.leading_zeros() as u8 }
    }
    if full_or_low {
        if conf.ep_type == usb::EndpointType::Isochronous {
            conf.interval.saturating_add(2)
        } else {
            frames_to_exponent(conf.interval) + 3
        }
    } else {
        conf.interval.saturating_sub(1)
    }
}
