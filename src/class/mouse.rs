//! HID boot protocol mouse.

use bitflags::bitflags;
use log::{debug, trace};

use super::{ClassDriver, ObserverSlot, TransferRequest};
use crate::{
    err::*,
    transfer::{EndpointConfig, EndpointId, EndpointType, Request, SetupData},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MouseButtons: u8 {
        const LEFT = 0x01;
        const RIGHT = 0x02;
        const MIDDLE = 0x04;
    }
}

/// Boot protocol mouse report.
///
/// Byte 0 is the button bitmap, bytes 1 and 2 the signed X/Y displacement,
/// byte 3 an optional wheel displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootMouseReport {
    pub buttons: MouseButtons,
    pub x: i8,
    pub y: i8,
    pub wheel: Option<i8>,
}

impl BootMouseReport {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            return None;
        }
        Some(Self {
            buttons: MouseButtons::from_bits_truncate(bytes[0]),
            x: bytes[1] as i8,
            y: bytes[2] as i8,
            wheel: bytes.get(3).map(|&w| w as i8),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HidPhase {
    Idle,
    SettingProtocol,
    Polling,
}

/// Endpoint bookkeeping shared by HID boot devices.
pub struct HidDriver {
    interface_index: u8,
    in_packet_size: usize,
    ep_interrupt_in: Option<EndpointId>,
    phase: HidPhase,
}

impl HidDriver {
    pub fn new(interface_index: u8, in_packet_size: usize) -> Self {
        Self {
            interface_index,
            in_packet_size,
            ep_interrupt_in: None,
            phase: HidPhase::Idle,
        }
    }

    fn interrupt_in(&self) -> Result<TransferRequest> {
        let ep_id = self.ep_interrupt_in.ok_or(err!(InvalidEndpointNumber))?;
        Ok(TransferRequest::InterruptIn {
            ep_id,
            len: self.in_packet_size,
        })
    }
}

impl ClassDriver for HidDriver {
    fn set_endpoint(&mut self, config: &EndpointConfig) -> Result {
        // Boot devices only report through interrupt IN.
        if config.ep_type == EndpointType::Interrupt && config.ep_id.is_in() {
            self.ep_interrupt_in = Some(config.ep_id);
        }
        Ok(())
    }

    fn on_endpoints_configured(&mut self) -> Result<TransferRequest> {
        self.phase = HidPhase::SettingProtocol;
        Ok(TransferRequest::ControlOut(SetupData::set_boot_protocol(
            self.interface_index,
        )))
    }

    fn on_control_completed(
        &mut self,
        _ep_id: EndpointId,
        setup: SetupData,
        _data: &[u8],
    ) -> Result<TransferRequest> {
        trace!("HID control completed: phase {:?}, {:?}", self.phase, setup);
        match (self.phase, setup.request()) {
            (HidPhase::SettingProtocol, Request::SetProtocol) => {
                self.phase = HidPhase::Polling;
                self.interrupt_in()
            }
            _ => Err(err!(InvalidPhase)),
        }
    }

    fn on_interrupt_completed(
        &mut self,
        ep_id: EndpointId,
        _data: &[u8],
    ) -> Result<TransferRequest> {
        if self.phase != HidPhase::Polling || !ep_id.is_in() {
            return Err(err!(InvalidPhase));
        }
        self.interrupt_in()
    }
}

pub struct HidMouseDriver {
    hid: HidDriver,
    observer: ObserverSlot,
}

impl HidMouseDriver {
    pub const REPORT_LEN: usize = 8;

    pub fn new(interface_index: u8, observer: ObserverSlot) -> Self {
        Self {
            hid: HidDriver::new(interface_index, Self::REPORT_LEN),
            observer,
        }
    }
}

impl ClassDriver for HidMouseDriver {
    fn set_endpoint(&mut self, config: &EndpointConfig) -> Result {
        self.hid.set_endpoint(config)
    }

    fn on_endpoints_configured(&mut self) -> Result<TransferRequest> {
        self.hid.on_endpoints_configured()
    }

    fn on_control_completed(
        &mut self,
        ep_id: EndpointId,
        setup: SetupData,
        data: &[u8],
    ) -> Result<TransferRequest> {
        self.hid.on_control_completed(ep_id, setup, data)
    }

    fn on_interrupt_completed(
        &mut self,
        ep_id: EndpointId,
        data: &[u8],
    ) -> Result<TransferRequest> {
        let next = self.hid.on_interrupt_completed(ep_id, data)?;
        match BootMouseReport::from_bytes(data) {
            Some(report) => {
                trace!(
                    "mouse: buttons {:?}, dx {:3}, dy {:3}",
                    report.buttons, report.x, report.y
                );
                self.observer.notify(report.x, report.y);
            }
            None => debug!("short mouse report ({} bytes) ignored", data.len()),
        }
        Ok(next)
    }
}
