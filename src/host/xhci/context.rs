use alloc::vec::Vec;

use dma_api::{DBox, DVec};
use xhci::context::{Device32Byte, Device64Byte, Input32Byte, Input64Byte, InputHandler};

use super::ring::Direction;
use crate::{SlotId, err::*};

/// Device Context Base Address Array; entry 0 points at the scratchpad
/// array.
pub struct DeviceContextList {
    pub dcbaa: DVec<u64>,
    max_slots: usize,
}

unsafe impl Send for DeviceContextList {}

pub(crate) struct Context32 {
    out: DBox<Device32Byte>,
    input: DBox<Input32Byte>,
}

pub(crate) struct Context64 {
    out: DBox<Device64Byte>,
    input: DBox<Input64Byte>,
}

/// Output and input context of one slot, sized by HCCPARAMS1.CSZ.
pub(crate) enum ContextData {
    Context32(Context32),
    Context64(Context64),
}

unsafe impl Send for ContextData {}

impl ContextData {
    fn new(is_64: bool) -> Result<Self> {
        let no_mem = || err!(NoEnoughMemory);
        if is_64 {
            Ok(ContextData::Context64(Context64 {
                out: DBox::zero_with_align(Direction::FromDevice, 64).ok_or_else(no_mem)?,
                input: DBox::zero_with_align(Direction::ToDevice, 64).ok_or_else(no_mem)?,
            }))
        } else {
            Ok(ContextData::Context32(Context32 {
                out: DBox::zero_with_align(Direction::FromDevice, 64).ok_or_else(no_mem)?,
                input: DBox::zero_with_align(Direction::ToDevice, 64).ok_or_else(no_mem)?,
            }))
        }
    }

    /// Rebuilds the input context from zero.
    pub fn with_empty_input<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn InputHandler),
    {
        match self {
            ContextData::Context32(ctx) => {
                let mut input = Input32Byte::new_32byte();
                f(&mut input);
                ctx.input.write(input);
            }
            ContextData::Context64(ctx) => {
                let mut input = Input64Byte::new_64byte();
                f(&mut input);
                ctx.input.write(input);
            }
        }
    }

    /// Edits the current input context in place.
    pub fn with_input<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn InputHandler),
    {
        match self {
            ContextData::Context32(ctx) => {
                let mut input = ctx.input.read();
                f(&mut input);
                ctx.input.write(input);
            }
            ContextData::Context64(ctx) => {
                let mut input = ctx.input.read();
                f(&mut input);
                ctx.input.write(input);
            }
        }
    }

    /// Edits the input context with every add/drop flag cleared first, so
    /// only what `f` flags reaches the controller.
    pub fn with_changed_input<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn InputHandler),
    {
        self.with_input(|input| {
            let control = input.control_mut();
            for i in 0..32 {
                control.clear_add_context_flag(i);
                if i > 1 {
                    control.clear_drop_context_flag(i);
                }
            }
            f(input);
        });
    }

    pub fn out_bus_addr(&self) -> u64 {
        match self {
            ContextData::Context32(ctx) => ctx.out.bus_addr(),
            ContextData::Context64(ctx) => ctx.out.bus_addr(),
        }
    }

    pub fn input_bus_addr(&self) -> u64 {
        match self {
            ContextData::Context32(ctx) => ctx.input.bus_addr(),
            ContextData::Context64(ctx) => ctx.input.bus_addr(),
        }
    }
}

impl DeviceContextList {
    pub fn new(max_slots: usize) -> Result<Self> {
        let dcbaa = DVec::zeros(max_slots + 1, 64, Direction::ToDevice)
            .ok_or(err!(NoEnoughMemory))?;
        Ok(Self { dcbaa, max_slots })
    }

    /// Allocates the contexts of `slot_id` and publishes its output context
    /// in the DCBAA.
    pub fn new_ctx(&mut self, slot_id: SlotId, is_64: bool) -> Result<ContextData> {
        if slot_id.raw() == 0 || slot_id.as_usize() > self.max_slots {
            return Err(err!(InvalidSlotId));
        }
        let ctx = ContextData::new(is_64)?;
        self.dcbaa.set(slot_id.as_usize(), ctx.out_bus_addr());
        Ok(ctx)
    }

    /// Clears the DCBAA entry of `slot_id` before its contexts are freed.
    pub fn release(&mut self, slot_id: SlotId) {
        if slot_id.raw() == 0 || slot_id.as_usize() > self.max_slots {
            return;
        }
        self.dcbaa.set(slot_id.as_usize(), 0);
    }

    pub fn entry(&self, slot_id: SlotId) -> Option<u64> {
        self.dcbaa.get(slot_id.as_usize())
    }
}

pub struct ScratchpadBufferArray {
    pub entries: DVec<u64>,
    _pages: Vec<DVec<u8>>,
}

unsafe impl Send for ScratchpadBufferArray {}

impl ScratchpadBufferArray {
    pub fn new(entries: usize) -> Result<Self> {
        let mut entries_vec =
            DVec::zeros(entries, 64, Direction::Bidirectional).ok_or(err!(NoEnoughMemory))?;

        let mut pages = Vec::with_capacity(entries);
        for i in 0..entries {
            let page = DVec::<u8>::zeros(0x1000, 0x1000, Direction::Bidirectional)
                .ok_or(err!(NoEnoughMemory))?;
            entries_vec.set(i, page.bus_addr());
            pages.push(page);
        }

        Ok(Self {
            entries: entries_vec,
            _pages: pages,
        })
    }

    pub fn bus_addr(&self) -> u64 {
        self.entries.bus_addr()
    }
}
