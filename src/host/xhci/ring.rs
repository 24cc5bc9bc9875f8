pub use dma_api::Direction;
use dma_api::DVec;
use log::trace;
use xhci::ring::trb::{Link, command, transfer};

use crate::{BusAddr, err::*};

const TRB_LEN: usize = 4;
pub const TRB_SIZE: usize = size_of::<TrbData>();
const PAGE_SIZE: usize = 0x1000;

#[derive(Clone, Copy, Default)]
#[repr(transparent)]
pub struct TrbData([u32; TRB_LEN]);

impl TrbData {
    pub fn to_raw(&self) -> [u32; TRB_LEN] {
        self.0
    }
}

impl From<command::Allowed> for TrbData {
    fn from(value: command::Allowed) -> Self {
        Self(value.into_raw())
    }
}

impl From<transfer::Allowed> for TrbData {
    fn from(value: transfer::Allowed) -> Self {
        Self(value.into_raw())
    }
}

#[cfg(test)]
impl From<[u32; TRB_LEN]> for TrbData {
    fn from(raw: [u32; TRB_LEN]) -> Self {
        Self(raw)
    }
}

/// A single-segment TRB ring.
///
/// Producer rings reserve the last slot for a Link TRB with toggle cycle;
/// the event ring is consumed by comparing each TRB's cycle bit against
/// `cycle`.
pub struct Ring {
    link: bool,
    pub trbs: DVec<TrbData>,
    pub i: usize,
    pub cycle: bool,
}

unsafe impl Send for Ring {}

impl Ring {
    pub fn new_with_len(len: usize, link: bool, direction: Direction) -> Result<Self> {
        let trbs = DVec::zeros(len, PAGE_SIZE, direction).ok_or(err!(NoEnoughMemory))?;
        Ok(Self {
            link,
            trbs,
            i: 0,
            cycle: true,
        })
    }

    /// One page worth of TRBs.
    pub fn new(link: bool, direction: Direction) -> Result<Self> {
        Self::new_with_len(PAGE_SIZE / TRB_SIZE, link, direction)
    }

    pub fn len(&self) -> usize {
        self.trbs.len()
    }

    pub fn bus_addr(&self) -> BusAddr {
        self.trbs.bus_addr().into()
    }

    pub fn enque_command(&mut self, mut trb: command::Allowed) -> BusAddr {
        if self.cycle {
            trb.set_cycle_bit();
        } else {
            trb.clear_cycle_bit();
        }
        let addr = self.enque_trb(trb.into());
        trace!("[CMD] >> {trb:X?} @{addr:X}");
        addr
    }

    pub fn enque_transfer(&mut self, mut trb: transfer::Allowed) -> BusAddr {
        if self.cycle {
            trb.set_cycle_bit();
        } else {
            trb.clear_cycle_bit();
        }
        let addr = self.enque_trb(trb.into());
        trace!("[Transfer] >> {trb:X?} @{addr:X}");
        addr
    }

    fn enque_trb(&mut self, trb: TrbData) -> BusAddr {
        self.trbs.set(self.i, trb);
        let addr = self.trb_bus_addr(self.i);
        self.next_index();
        addr
    }

    /// The TRB at the dequeue position and the cycle state it must match.
    pub fn current_data(&self) -> Option<(TrbData, bool)> {
        self.trbs.get(self.i).map(|trb| (trb, self.cycle))
    }

    fn next_index(&mut self) {
        self.i += 1;
        let len = self.len();

        if self.link && self.i >= len - 1 {
            self.i = 0;
            let mut link = Link::new();
            link.set_ring_segment_pointer(self.trb_bus_addr(0).raw())
                .set_toggle_cycle();
            if self.cycle {
                link.set_cycle_bit();
            } else {
                link.clear_cycle_bit();
            }
            self.trbs.set(len - 1, command::Allowed::Link(link).into());
            trace!("ring wrapped @{:X}", self.bus_addr());
            self.cycle = !self.cycle;
        } else if self.i >= len {
            self.i = 0;
        }
    }

    /// Advances the dequeue position of a consumer ring.
    pub fn inc_deque(&mut self) {
        self.i += 1;
        if self.i >= self.len() {
            self.i = 0;
            self.cycle = !self.cycle;
        }
    }

    pub fn trb_bus_addr(&self, i: usize) -> BusAddr {
        (self.bus_addr().raw() + (i * TRB_SIZE) as u64).into()
    }

    pub fn current_trb_addr(&self) -> BusAddr {
        self.trb_bus_addr(self.i)
    }
}
