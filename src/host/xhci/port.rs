use log::trace;

use super::reg::XhciRegisters;
use crate::{err::*, host::PortOp};

/// Where a root port is in the negotiation that ends with its device bound
/// to class drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortConfigPhase {
    #[default]
    NotConnected,
    /// Connected, queued behind the port currently being addressed.
    WaitingAddressed,
    ResettingPort,
    EnablingSlot,
    AddressingDevice,
    InitializingDevice,
    ConfiguringEndpoints,
    Configured,
}

/// Writes 0 to every RW1C bit so a read-modify-write of PORTSC does not
/// acknowledge a change it was not meant to, nor disable the port.
macro_rules! keep_rw1c {
    ($portsc:expr) => {{
        $portsc.set_0_port_enabled_disabled();
        $portsc.set_0_connect_status_change();
        $portsc.set_0_port_enabled_disabled_change();
        $portsc.set_0_warm_port_reset_change();
        $portsc.set_0_over_current_change();
        $portsc.set_0_port_reset_change();
        $portsc.set_0_port_link_state_change();
        $portsc.set_0_port_config_error_change();
    }};
}

/// Handle to a root port; every query reads PORTSC afresh.
#[derive(Clone)]
pub struct XhciPort {
    index: u8,
    reg: XhciRegisters,
}

impl XhciPort {
    pub(crate) fn new(index: u8, reg: XhciRegisters) -> Self {
        Self { index, reg }
    }

    fn at(&self) -> usize {
        self.index as usize - 1
    }

    pub fn is_enabled(&self) -> bool {
        self.reg
            .port_register_set
            .read_volatile_at(self.at())
            .portsc
            .port_enabled_disabled()
    }

    pub fn is_port_reset_changed(&self) -> bool {
        self.reg
            .port_register_set
            .read_volatile_at(self.at())
            .portsc
            .port_reset_change()
    }

    /// Protocol speed ID of the attached device.
    pub fn speed(&self) -> u8 {
        self.reg
            .port_register_set
            .read_volatile_at(self.at())
            .portsc
            .port_speed()
    }

    /// Starts a port reset and acknowledges the pending connect change.
    /// Completion arrives as a Port Status Change event with PRC set.
    pub fn reset(&mut self) {
        let at = self.at();
        self.reg.port_register_set.update_volatile_at(at, |p| {
            keep_rw1c!(p.portsc);
            p.portsc.clear_connect_status_change();
            p.portsc.set_port_reset();
        });
        trace!("port reset on port {}", self.index);
    }

    pub fn clear_port_reset_change(&mut self) {
        let at = self.at();
        self.reg.port_register_set.update_volatile_at(at, |p| {
            keep_rw1c!(p.portsc);
            p.portsc.clear_port_reset_change();
        });
        trace!("clear PRC on port {}", self.index);
    }
}

impl PortOp for XhciPort {
    fn number(&self) -> u8 {
        self.index
    }

    fn is_connected(&self) -> bool {
        self.reg
            .port_register_set
            .read_volatile_at(self.at())
            .portsc
            .current_connect_status()
    }
}

/// Default control pipe packet size for a protocol speed ID.
pub fn default_max_packet_size(speed: u8) -> Result<u16> {
    match speed {
        1 | 2 => Ok(8),
        3 => Ok(64),
        4..=6 => Ok(512),
        _ => Err(err!(UnknownXhciSpeedId)),
    }
}

/// Full and low speed devices express interrupt intervals in frames, the
/// rest as an exponent.
pub fn is_full_or_low_speed(speed: u8) -> bool {
    matches!(speed, 1 | 2)
}
