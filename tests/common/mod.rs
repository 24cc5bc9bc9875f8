//! A host controller that lives entirely in memory.
//!
//! Ports, negotiation failures and pending events are scripted by the test.
//! Mouse ports are bound through the real class driver registry so reports
//! travel the same path as on hardware.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex},
};

use crab_xhc::{
    ClassDrivers, Error, ErrorKind, Event, HostOp, MouseObserver, PortOp, Result,
    class::{ClassDriver, TransferRequest},
    descriptor::{EndpointDescriptor, InterfaceDescriptor},
    transfer::{EndpointConfig, EndpointId},
};

pub const BOOT_MOUSE_INTERFACE: [u8; 9] = [9, 4, 0, 0, 1, 3, 1, 2, 0];
pub const BOOT_MOUSE_ENDPOINT: [u8; 7] = [7, 5, 0x81, 3, 8, 0, 10];

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub struct SimPort {
    number: u8,
    connected: bool,
}

impl PortOp for SimPort {
    fn number(&self) -> u8 {
        self.number
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// An interrupt IN completion carrying a boot report.
    Report { port: u8, bytes: Vec<u8> },
    PortStatusChange { port: u8 },
}

struct Binding {
    driver: Box<dyn ClassDriver>,
    ep_id: EndpointId,
}

#[derive(Default)]
pub struct SimXhc {
    pub max_ports: u8,
    pub connected: BTreeSet<u8>,
    pub mouse_ports: BTreeSet<u8>,
    pub failing_ports: BTreeSet<u8>,
    pub fail_init: bool,

    pub initialized: bool,
    pub running: bool,
    pub irq_enabled: bool,
    /// Ports handed to `configure_port`, in call order.
    pub attempts: Vec<u8>,
    /// Interrupter state seen by each `configure_port` call.
    pub irq_during_configure: Vec<bool>,
    pub events: VecDeque<SimEvent>,
    started: BTreeSet<u8>,
    bound: BTreeMap<u8, Binding>,
}

impl SimXhc {
    pub fn new(max_ports: u8) -> Self {
        Self {
            max_ports,
            ..Default::default()
        }
    }

    pub fn connect(mut self, port: u8) -> Self {
        self.connected.insert(port);
        self
    }

    pub fn mouse(mut self, port: u8) -> Self {
        self.connected.insert(port);
        self.mouse_ports.insert(port);
        self
    }

    pub fn failing(mut self, port: u8) -> Self {
        self.connected.insert(port);
        self.failing_ports.insert(port);
        self
    }

    pub fn with_init_failure(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn push_report(&mut self, port: u8, bytes: &[u8]) {
        self.events.push_back(SimEvent::Report {
            port,
            bytes: bytes.to_vec(),
        });
    }

    pub fn is_bound(&self, port: u8) -> bool {
        self.bound.contains_key(&port)
    }

    fn bind_mouse(&mut self, port: u8, drivers: &ClassDrivers) -> Result {
        let intf = InterfaceDescriptor::parse(&BOOT_MOUSE_INTERFACE)
            .ok_or(Error::new(ErrorKind::InvalidDescriptor))?;
        let ep = EndpointDescriptor::parse(&BOOT_MOUSE_ENDPOINT)
            .ok_or(Error::new(ErrorKind::InvalidDescriptor))?;

        let mut driver = drivers.new_class_driver(&intf)?;
        driver.set_endpoint(&EndpointConfig::from(&ep))?;

        let mut req = driver.on_endpoints_configured()?;
        if let TransferRequest::ControlOut(setup) = req {
            req = driver.on_control_completed(EndpointId::DEFAULT_CONTROL_PIPE, setup, &[])?;
        }
        let TransferRequest::InterruptIn { ep_id, .. } = req else {
            return Err(Error::new(ErrorKind::InvalidPhase));
        };

        self.bound.insert(port, Binding { driver, ep_id });
        Ok(())
    }
}

impl HostOp for SimXhc {
    type Port = SimPort;

    fn init(&mut self) -> Result {
        if self.fail_init {
            return Err(Error::new(ErrorKind::HostControllerNotHalted));
        }
        self.initialized = true;
        self.irq_enabled = true;
        Ok(())
    }

    fn run(&mut self) {
        self.running = true;
    }

    fn max_ports(&self) -> u8 {
        self.max_ports
    }

    fn port_at(&self, index: u8) -> SimPort {
        SimPort {
            number: index,
            connected: self.connected.contains(&index),
        }
    }

    fn configure_port(&mut self, port: &SimPort, drivers: &ClassDrivers) -> Result {
        let index = port.number();
        self.attempts.push(index);
        self.irq_during_configure.push(self.irq_enabled);

        if !port.is_connected() {
            return Err(Error::new(ErrorKind::PortNotConnected));
        }
        if self.failing_ports.contains(&index) {
            return Err(Error::new(ErrorKind::TransferFailed));
        }
        if !self.started.insert(index) {
            return Ok(());
        }
        if self.mouse_ports.contains(&index) {
            self.bind_mouse(index, drivers)?;
        }
        Ok(())
    }

    fn process_event(&mut self, _drivers: &ClassDrivers) -> Result<Event> {
        match self.events.pop_front() {
            None => Ok(Event::Nothing),
            Some(SimEvent::PortStatusChange { port }) => Ok(Event::PortStatusChange { port }),
            Some(SimEvent::Report { port, bytes }) => {
                let binding = self
                    .bound
                    .get_mut(&port)
                    .ok_or(Error::new(ErrorKind::InvalidSlotId))?;
                match binding.driver.on_interrupt_completed(binding.ep_id, &bytes)? {
                    TransferRequest::InterruptIn { .. } => Ok(Event::Transfer { slot: port }),
                    _ => Err(Error::new(ErrorKind::InvalidPhase)),
                }
            }
        }
    }

    fn disable_irq(&mut self) -> bool {
        let enabled = self.irq_enabled;
        self.irq_enabled = false;
        enabled
    }

    fn enable_irq(&mut self) {
        self.irq_enabled = true;
    }
}

/// An observer that records every motion it receives.
pub fn recording_observer() -> (MouseObserver, Arc<Mutex<Vec<(i8, i8)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer: MouseObserver = Arc::new(move |dx, dy| {
        sink.lock().unwrap().push((dx, dy));
    });
    (observer, seen)
}
