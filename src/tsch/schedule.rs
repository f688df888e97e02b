//! The slotframe/cell schedule: a fixed, pre-provisioned table mapping a slot position
//! to the radio activity expected there. Adapted from the const-generic slotframe/
//! schedule shape used elsewhere in the `dot15d4` ecosystem, simplified to the single
//! slotframe this core's data model calls for.

use bitflags::bitflags;
use heapless::Vec;
use ieee802154::mac::{Address, AddressMode};

bitflags! {
    /// Per-cell link options. A cell may combine `TX` and `RX` (a dedicated
    /// transmit-then-listen slot is not modelled; combining them reflects a cell that
    /// is a TX opportunity when a frame is queued and an RX opportunity otherwise, see
    /// [`TschCore::decide_cell`](super::engine::TschCore::decide_cell)).
    pub struct LinkOptions: u8 {
        const TX           = 0b0001;
        const RX           = 0b0010;
        const SHARED       = 0b0100;
        const TIME_KEEPING = 0b1000;
    }
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Normal,
    Advertising,
}

/// One scheduled position in the slotframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub slot_offset: u16,
    pub channel_offset: u16,
    pub link_options: LinkOptions,
    pub link_type: LinkType,
    /// Broadcast denotes a shared cell; any other address is a dedicated link.
    pub peer_address: Address,
}

impl Cell {
    pub fn is_shared(&self) -> bool {
        self.link_options.contains(LinkOptions::SHARED) || self.is_broadcast()
    }

    pub fn is_broadcast(&self) -> bool {
        is_broadcast_address(&self.peer_address)
    }
}

/// True for any of the broadcast address forms the `ieee802154` crate can produce.
pub fn is_broadcast_address(addr: &Address) -> bool {
    *addr == Address::broadcast(&AddressMode::Short) || *addr == Address::broadcast(&AddressMode::Extended)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// `slot_offset` is not within `[0, length)`.
    InvalidSlot,
    /// Another cell already occupies this `slot_offset`.
    SlotOccupied,
    /// The slotframe's cell storage is full.
    CapacityExceeded,
}

/// A fixed-length cyclic slotframe. `N` bounds the number of provisioned cells, which
/// may be fewer than `length` (unscheduled positions are implicitly off).
pub struct Slotframe<const N: usize> {
    length: u16,
    cells: Vec<Cell, N>,
}

impl<const N: usize> Slotframe<N> {
    pub fn new(length: u16) -> Self {
        Self {
            length,
            cells: Vec::new(),
        }
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn add_cell(&mut self, cell: Cell) -> Result<(), ScheduleError> {
        if cell.slot_offset >= self.length {
            return Err(ScheduleError::InvalidSlot);
        }
        if self.cells.iter().any(|c| c.slot_offset == cell.slot_offset) {
            return Err(ScheduleError::SlotOccupied);
        }
        self.cells.push(cell).map_err(|_| ScheduleError::CapacityExceeded)
    }

    pub fn cell_at(&self, slot_offset: u16) -> Option<&Cell> {
        self.cells.iter().find(|c| c.slot_offset == slot_offset)
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    /// Next slot position after `cur`, wrapping at `length`. The caller is
    /// responsible for folding the once-per-wrap drift correction when this wraps.
    pub fn next_slot(&self, cur: u16) -> u16 {
        if cur + 1 >= self.length {
            0
        } else {
            cur + 1
        }
    }

    /// Next slot position at or after `cur` (inclusive) that carries a cell, wrapping
    /// around at most once. Returns `None` if no cell is provisioned at all.
    pub fn next_active_slot(&self, cur: u16) -> Option<u16> {
        if self.cells.is_empty() {
            return None;
        }
        let mut pos = cur;
        for _ in 0..=self.length {
            if self.cell_at(pos).is_some() {
                return Some(pos);
            }
            pos = self.next_slot(pos);
        }
        None
    }
}

/// Channel-hopping formula shared by every cell: `11 + (channel_offset + asn) mod 16`,
/// the 2.4 GHz page-0 mapping used throughout 802.15.4e TSCH.
pub fn channel(cell: &Cell, asn: u64) -> u8 {
    11 + ((cell.channel_offset as u64 + asn) % 16) as u8
}
