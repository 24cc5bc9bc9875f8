use dma_api::DVec;
use mbarrier::mb;
use xhci::ring::trb::event::Allowed;

use super::ring::{Direction, Ring};
use crate::err::*;

/// Event Ring Segment Table entry.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct EventRingSte {
    pub addr: u64,
    pub size: u16,
    _reserved: [u8; 6],
}

pub struct EventRing {
    ring: Ring,
    pub ste: DVec<EventRingSte>,
}

unsafe impl Send for EventRing {}

impl EventRing {
    pub fn new() -> Result<Self> {
        let ring = Ring::new(false, Direction::Bidirectional)?;

        let mut ste = DVec::zeros(1, 64, Direction::Bidirectional).ok_or(err!(NoEnoughMemory))?;
        ste.set(
            0,
            EventRingSte {
                addr: ring.bus_addr().raw(),
                size: ring.len() as _,
                _reserved: [0; 6],
            },
        );

        Ok(Self { ring, ste })
    }

    /// Pops the next event the controller has written, if any.
    pub fn next(&mut self) -> Option<Allowed> {
        let (data, cycle) = self.ring.current_data()?;
        let allowed = Allowed::try_from(data.to_raw()).ok()?;
        if cycle != allowed.cycle_bit() {
            return None;
        }
        mb();
        self.ring.inc_deque();
        Some(allowed)
    }

    pub fn erdp(&self) -> u64 {
        self.ring.current_trb_addr().raw() & 0xFFFF_FFFF_FFFF_FFF0
    }

    pub fn erstba(&self) -> u64 {
        self.ste.bus_addr()
    }

    /// Number of segment table entries.
    pub fn len(&self) -> usize {
        self.ste.len()
    }

    /// Writes `raw` where the controller puts its next event, with the
    /// cycle bit the consumer expects.
    #[cfg(test)]
    pub fn inject(&mut self, mut raw: [u32; 4]) {
        raw[3] = (raw[3] & !1) | self.ring.cycle as u32;
        let i = self.ring.i;
        self.ring.trbs.set(i, raw.into());
    }
}
