use core::{
    num::NonZeroUsize,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use xhci::accessor::Mapper;

#[derive(Debug, Clone, Copy)]
pub struct MemMapper;
impl Mapper for MemMapper {
    unsafe fn map(&mut self, phys_start: usize, _bytes: usize) -> NonZeroUsize {
        unsafe { NonZeroUsize::new_unchecked(phys_start) }
    }
    fn unmap(&mut self, _virt_start: usize, _bytes: usize) {}
}

pub(crate) type Registers = xhci::Registers<MemMapper>;

/// The controller's MMIO window, identity mapped.
pub(crate) struct XhciRegisters {
    pub mmio_base: usize,
    reg: Registers,
}

impl Clone for XhciRegisters {
    fn clone(&self) -> Self {
        Self {
            mmio_base: self.mmio_base,
            reg: self.new_reg(),
        }
    }
}

// The window is owned by the single controller instance for the process
// lifetime and only touched under `&mut Xhci`.
unsafe impl Send for XhciRegisters {}

impl XhciRegisters {
    pub fn new(mmio_base: NonNull<u8>) -> Self {
        let mmio_base = mmio_base.as_ptr() as usize;
        let reg = unsafe { Registers::new(mmio_base, MemMapper) };
        Self { mmio_base, reg }
    }

    fn new_reg(&self) -> Registers {
        unsafe { Registers::new(self.mmio_base, MemMapper) }
    }

    /// Spins until `condition` holds, giving up after `max_spins` polls.
    pub fn spin_until(&self, max_spins: usize, condition: impl Fn(&Registers) -> bool) -> bool {
        for _ in 0..max_spins {
            if condition(&self.reg) {
                return true;
            }
            super::delay::delay_us(10);
        }
        condition(&self.reg)
    }

    pub fn interrupter_enabled(&self) -> bool {
        self.operational.usbcmd.read_volatile().interrupter_enable()
    }

    pub fn set_interrupter_enable(&mut self, enable: bool) {
        self.operational.usbcmd.update_volatile(|r| {
            if enable {
                r.set_interrupter_enable();
            } else {
                r.clear_interrupter_enable();
            }
        });
    }
}

impl Deref for XhciRegisters {
    type Target = Registers;

    fn deref(&self) -> &Self::Target {
        &self.reg
    }
}

impl DerefMut for XhciRegisters {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reg
    }
}
