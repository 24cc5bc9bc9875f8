use core::ptr::NonNull;

use log::{debug, info, warn};
use xhci::{
    ExtendedCapability, extended_capabilities,
    extended_capabilities::usb_legacy_support_capability::UsbLegacySupport,
    registers::doorbell,
};

mod context;
mod delay;
mod device;
mod dispatch;
mod event;
mod port;
mod reg;
mod ring;
#[cfg(test)]
mod tests;

use context::ScratchpadBufferArray;
use dispatch::Data;
pub use port::{PortConfigPhase, XhciPort};
use reg::{MemMapper, XhciRegisters};

use super::{Event, HostOp};
use crate::{class::ClassDrivers, err::*};

/// Polls of 10us each before a register handshake is considered lost.
const SPIN_LIMIT: usize = 100_000;

pub struct Xhci {
    reg: XhciRegisters,
    data: Option<Data>,
}

impl Xhci {
    /// Upper bound on device slots enabled, whatever the hardware offers.
    pub const MAX_SLOTS: u8 = 16;

    /// `mmio_base` is the identity mapped register window of an xHC that
    /// nothing else drives.
    pub fn new(mmio_base: NonNull<u8>) -> Self {
        Self {
            reg: XhciRegisters::new(mmio_base),
            data: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.data.is_some()
    }

    /// Negotiation phase of a root port, `None` before `init` or out of
    /// range.
    pub fn port_phase(&self, index: u8) -> Option<PortConfigPhase> {
        self.data.as_ref()?.phase(index)
    }

    fn data(&mut self) -> Result<&mut Data> {
        self.data.as_mut().ok_or(err!(NotInitialized))
    }

    fn chip_hardware_reset(&mut self) -> Result {
        debug!("Reset begin ...");
        self.reg.operational.usbcmd.update_volatile(|c| {
            c.clear_run_stop();
        });

        if !self
            .reg
            .spin_until(SPIN_LIMIT, |r| r.operational.usbsts.read_volatile().hc_halted())
        {
            return Err(err!(HostControllerNotHalted));
        }
        debug!("Halted");

        self.reg.operational.usbcmd.update_volatile(|f| {
            f.set_host_controller_reset();
        });

        let done = self.reg.spin_until(SPIN_LIMIT, |r| {
            !r.operational.usbcmd.read_volatile().host_controller_reset()
                && !r.operational.usbsts.read_volatile().controller_not_ready()
        });
        if !done {
            return Err(err!(Timeout));
        }
        debug!("Reset finish");

        Ok(())
    }

    fn setup_max_device_slots(&mut self) -> u8 {
        let hw = self
            .reg
            .capability
            .hcsparams1
            .read_volatile()
            .number_of_device_slots();
        let max_slots = hw.min(Self::MAX_SLOTS);

        self.reg.operational.config.update_volatile(|r| {
            r.set_max_device_slots_enabled(max_slots);
        });

        debug!("Max device slots: {max_slots} (hardware {hw})");
        max_slots
    }

    fn setup_dcbaap(&mut self) -> Result {
        let dcbaa_addr = self.data()?.dev_list.dcbaa.bus_addr();
        debug!("DCBAAP: {dcbaa_addr:X}");
        self.reg.operational.dcbaap.update_volatile(|r| {
            r.set(dcbaa_addr);
        });
        Ok(())
    }

    fn set_cmd_ring(&mut self) -> Result {
        let crcr = self.data()?.cmd.bus_addr().raw();
        let cycle = self.data()?.cmd.cycle;

        debug!("CRCR: {crcr:X}");
        self.reg.operational.crcr.update_volatile(|r| {
            r.set_command_ring_pointer(crcr);
            if cycle {
                r.set_ring_cycle_state();
            } else {
                r.clear_ring_cycle_state();
            }
        });
        Ok(())
    }

    fn init_irq(&mut self) -> Result {
        let erstz = self.data()?.event.len();
        let erdp = self.data()?.event.erdp();
        let erstba = self.data()?.event.erstba();

        {
            let mut ir0 = self.reg.interrupter_register_set.interrupter_mut(0);

            debug!("ERDP: {erdp:x}");
            ir0.erdp.update_volatile(|r| {
                r.set_event_ring_dequeue_pointer(erdp);
                r.set_dequeue_erst_segment_index(0);
                r.clear_event_handler_busy();
            });

            debug!("ERSTZ: {erstz:x}");
            ir0.erstsz.update_volatile(|r| r.set(erstz as _));
            debug!("ERSTBA: {erstba:X}");
            ir0.erstba.update_volatile(|r| {
                r.set(erstba);
            });

            ir0.imod.update_volatile(|im| {
                im.set_interrupt_moderation_interval(4000);
                im.set_interrupt_moderation_counter(0);
            });

            debug!("Enabling primary interrupter.");
            ir0.iman.update_volatile(|im| {
                im.set_interrupt_enable();
                im.clear_interrupt_pending();
            });
        }

        self.reg.operational.usbcmd.update_volatile(|r| {
            r.set_interrupter_enable();
            r.set_host_system_error_enable();
        });
        Ok(())
    }

    fn setup_scratchpads(&mut self) -> Result {
        let buf_count = self
            .reg
            .capability
            .hcsparams2
            .read_volatile()
            .max_scratchpad_buffers();
        debug!("Scratch buf count: {buf_count}");
        if buf_count == 0 {
            return Ok(());
        }

        let arr = ScratchpadBufferArray::new(buf_count as _)?;
        let bus_addr = arr.bus_addr();
        let data = self.data()?;
        data.dev_list.dcbaa.set(0, bus_addr);
        data.scratchpad = Some(arr);

        debug!("Setting up {buf_count} scratchpads, at {bus_addr:#0x}");
        Ok(())
    }

    fn init_ext_caps(&mut self) {
        let hccparams1 = self.reg.capability.hccparams1.read_volatile();
        let Some(mut list) = (unsafe {
            extended_capabilities::List::new(self.reg.mmio_base, hccparams1, MemMapper)
        }) else {
            return;
        };

        for cap in &mut list {
            match cap {
                Ok(ExtendedCapability::UsbLegacySupport(legacy)) => legacy_handoff(legacy),
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
}

/// Claims the controller from firmware and silences its SMIs. A firmware
/// that never lets go is logged and ignored.
fn legacy_handoff(mut legacy: UsbLegacySupport<MemMapper>) {
    debug!("legacy handoff");
    legacy.usblegsup.update_volatile(|r| {
        r.set_hc_os_owned_semaphore();
    });

    let mut owned = false;
    for _ in 0..100 {
        let sup = legacy.usblegsup.read_volatile();
        if sup.hc_os_owned_semaphore() && !sup.hc_bios_owned_semaphore() {
            owned = true;
            break;
        }
        delay::delay_ms(10);
    }
    if owned {
        debug!("claimed ownership from BIOS");
    } else {
        warn!("BIOS did not release the xHC, continuing");
    }

    legacy.usblegctlsts.update_volatile(|r| {
        r.clear_usb_smi_enable();
        r.clear_smi_on_host_system_error_enable();
        r.clear_smi_on_os_ownership_enable();
        r.clear_smi_on_pci_command_enable();
        r.clear_smi_on_bar_enable();

        r.clear_smi_on_bar();
        r.clear_smi_on_pci_command();
        r.clear_smi_on_os_ownership_change();
    });
}

impl HostOp for Xhci {
    type Port = XhciPort;

    fn init(&mut self) -> Result {
        self.reg.set_interrupter_enable(false);
        self.data = None;

        self.init_ext_caps();
        self.chip_hardware_reset()?;
        let max_slots = self.setup_max_device_slots();

        let cap = self.reg.capability.hccparams1.read_volatile();
        let is_64 = cap.context_size();
        debug!("Context size: {}", if is_64 { 64 } else { 32 });

        let max_ports = self.max_ports();
        self.data = Some(Data::new(
            self.reg.clone(),
            max_slots as _,
            max_ports,
            is_64,
        )?);
        self.setup_dcbaap()?;
        self.set_cmd_ring()?;
        self.init_irq()?;
        self.setup_scratchpads()?;
        Ok(())
    }

    fn run(&mut self) {
        debug!("Start run");
        self.reg.operational.usbcmd.update_volatile(|r| {
            r.set_run_stop();
        });

        if !self
            .reg
            .spin_until(SPIN_LIMIT, |r| !r.operational.usbsts.read_volatile().hc_halted())
        {
            warn!("xHC still halted after setting Run/Stop");
        }
        info!("Running");

        self.reg
            .doorbell
            .write_volatile_at(0, doorbell::Register::default());
    }

    fn max_ports(&self) -> u8 {
        self.reg
            .capability
            .hcsparams1
            .read_volatile()
            .number_of_ports()
    }

    fn port_at(&self, index: u8) -> XhciPort {
        XhciPort::new(index, self.reg.clone())
    }

    fn configure_port(&mut self, port: &XhciPort, _drivers: &ClassDrivers) -> Result {
        self.data()?.configure_port(port)
    }

    fn process_event(&mut self, drivers: &ClassDrivers) -> Result<Event> {
        self.data()?.process_event(drivers)
    }

    fn disable_irq(&mut self) -> bool {
        let enabled = self.reg.interrupter_enabled();
        self.reg.set_interrupter_enable(false);
        enabled
    }

    fn enable_irq(&mut self) {
        self.reg.set_interrupter_enable(true);
    }
}
