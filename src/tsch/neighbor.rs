//! Per-neighbor packet queues: a bounded power-of-two ring buffer per neighbor plus
//! its backoff state, stored in a fixed-capacity table keyed by link-layer address.
//!
//! Grounded directly on the original `neighbor_queue`/`TSCH_packet`/`add_queue`/
//! `remove_queue`/`add_packet_to_queue`/`remove_packet_from_queue` ring-buffer
//! bookkeeping, re-expressed with explicit `head`/`tail` indices as the data model
//! calls for rather than reaching for `heapless::Deque`'s opaque implementation.

use heapless::Vec;
use ieee802154::mac::Address;
use log::{error, warn};

use super::config::BackoffConfig;
use super::error::TxStatus;
use super::packet::Packet;

/// A callback invoked once a frame's outcome is known. Plain function pointer plus a
/// `Copy` context token (no closures) so a queue slot stays a plain value with no
/// lifetime or heap allocation, matching the original's `mac_callback_t sent; void
/// *ptr;` pair without requiring an `unsafe` void pointer.
pub type SentCallback<Ctx> = fn(Ctx, TxStatus, u8);

/// One outstanding frame plus everything needed to report its outcome.
pub struct PacketSlot<Ctx> {
    pub frame: Packet,
    pub transmissions: u8,
    pub callback: SentCallback<Ctx>,
    pub ctx: Ctx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full,
    Empty,
}

/// A bounded ring buffer of packet slots. `N` must be a power of two; indices are
/// masked rather than bounds-checked, and one slot is always left empty so `head ==
/// tail` unambiguously means empty.
pub struct Ring<Ctx, const N: usize> {
    items: [Option<PacketSlot<Ctx>>; N],
    head: usize,
    tail: usize,
}

impl<Ctx, const N: usize> Ring<Ctx, N> {
    const MASK: usize = N - 1;

    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "ring capacity must be a power of two");
        Self {
            items: core::array::from_fn(|_| None),
            head: 0,
            tail: 0,
        }
    }

    pub fn len(&self) -> usize {
        (self.tail.wrapping_sub(self.head)) & Self::MASK
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn push(&mut self, slot: PacketSlot<Ctx>) -> Result<(), QueueError> {
        let next_tail = (self.tail + 1) & Self::MASK;
        if next_tail == self.head {
            return Err(QueueError::Full);
        }
        self.items[self.tail] = Some(slot);
        self.tail = next_tail;
        Ok(())
    }

    pub fn peek(&self) -> Option<&PacketSlot<Ctx>> {
        if self.is_empty() {
            None
        } else {
            self.items[self.head].as_ref()
        }
    }

    pub fn peek_mut(&mut self) -> Option<&mut PacketSlot<Ctx>> {
        if self.is_empty() {
            None
        } else {
            self.items[self.head].as_mut()
        }
    }

    pub fn pop(&mut self) -> Result<PacketSlot<Ctx>, QueueError> {
        if self.is_empty() {
            return Err(QueueError::Empty);
        }
        let slot = self.items[self.head].take().ok_or(QueueError::Empty)?;
        self.head = (self.head + 1) & Self::MASK;
        Ok(slot)
    }
}

/// Default ring size, matching the original's `TSCH_QUEUE_NUM_PER_NEIGHBOR`.
pub const DEFAULT_RING_SIZE: usize = 8;

pub struct NeighborEntry<Ctx, const N: usize> {
    pub address: Address,
    pub is_time_source: bool,
    pub be: u8,
    pub bw: u8,
    pub queue: Ring<Ctx, N>,
}

impl<Ctx, const N: usize> NeighborEntry<Ctx, N> {
    fn new(address: Address, backoff: &BackoffConfig) -> Self {
        Self {
            address,
            is_time_source: false,
            be: backoff.mac_min_be,
            bw: 0,
            queue: Ring::new(),
        }
    }

    /// Resets backoff state after either a success or exhausted retries.
    pub fn reset_backoff(&mut self, backoff: &BackoffConfig) {
        self.be = backoff.mac_min_be;
        self.bw = 0;
    }

    /// Applies a failed-attempt outcome: draw a new backoff window from the *old* `BE`
    /// and then widen `BE`, matching the order specified for shared-cell retries.
    pub fn apply_failure(&mut self, backoff: &BackoffConfig, high_rand_byte: u8) {
        let window = (1u16 << self.be) - 1;
        self.bw = (high_rand_byte as u16 & window) as u8;
        self.be = (self.be + 1).min(backoff.mac_max_be);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborError {
    TableFull,
    QueueFull,
    NotFound,
    AlreadyExists,
}

/// The neighbor table. `M` bounds the number of distinct neighbors; `N` is the ring
/// size shared by every neighbor's queue.
pub struct NeighborStore<Ctx, const M: usize, const N: usize> {
    entries: Vec<NeighborEntry<Ctx, N>, M>,
    /// Raised for the duration of any structural change (add/remove/enqueue/dequeue).
    /// The slot scheduler reads this at slot start and treats the slot as OFF if set,
    /// rather than traverse a half-updated table (see the data-model concurrency note).
    mutation_in_progress: bool,
    round_robin_cursor: usize,
}

impl<Ctx, const M: usize, const N: usize> NeighborStore<Ctx, M, N> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            mutation_in_progress: false,
            round_robin_cursor: 0,
        }
    }

    pub fn mutation_in_progress(&self) -> bool {
        self.mutation_in_progress
    }

    fn with_mutation<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.mutation_in_progress = true;
        let r = f(self);
        self.mutation_in_progress = false;
        r
    }

    pub fn lookup(&self, addr: &Address) -> Option<&NeighborEntry<Ctx, N>> {
        self.entries.iter().find(|e| &e.address == addr)
    }

    pub fn lookup_mut(&mut self, addr: &Address) -> Option<&mut NeighborEntry<Ctx, N>> {
        self.entries.iter_mut().find(|e| &e.address == addr)
    }

    pub fn add(&mut self, addr: Address, backoff: &BackoffConfig) -> Result<(), NeighborError> {
        if self.lookup(&addr).is_some() {
            return Err(NeighborError::AlreadyExists);
        }
        self.with_mutation(|this| {
            this.entries.push(NeighborEntry::new(addr, backoff)).map_err(|_| {
                error!("neighbor table full, cannot add {:?}", addr);
                NeighborError::TableFull
            })
        })
    }

    /// Returns the existing entry for `addr`, creating one if the table has room.
    pub fn ensure(&mut self, addr: Address, backoff: &BackoffConfig) -> Result<&mut NeighborEntry<Ctx, N>, NeighborError> {
        if self.lookup(&addr).is_none() {
            self.add(addr, backoff)?;
        }
        self.lookup_mut(&addr).ok_or(NeighborError::NotFound)
    }

    pub fn remove(&mut self, addr: &Address) -> Result<(), NeighborError> {
        self.with_mutation(|this| {
            let idx = this.entries.iter().position(|e| &e.address == addr).ok_or(NeighborError::NotFound)?;
            this.entries.swap_remove(idx);
            Ok(())
        })
    }

    pub fn enqueue(&mut self, addr: Address, backoff: &BackoffConfig, slot: PacketSlot<Ctx>) -> Result<(), NeighborError> {
        self.with_mutation(|this| {
            let entry = this.ensure(addr, backoff)?;
            entry.queue.push(slot).map_err(|_| {
                warn!("queue full for {:?}, dropping send", addr);
                NeighborError::QueueFull
            })
        })
    }

    pub fn dequeue(&mut self, addr: &Address) -> Option<PacketSlot<Ctx>> {
        self.with_mutation(|this| {
            let entry = this.lookup_mut(addr)?;
            entry.queue.pop().ok()
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry<Ctx, N>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NeighborEntry<Ctx, N>> {
        self.entries.iter_mut()
    }

    /// Round-robin scan for a shared-cell candidate: the next neighbor (after the
    /// remembered cursor) with a non-empty queue, *regardless of its `bw`* — the
    /// caller (the cell-decision step) is the one that checks `bw` and decides
    /// between `TX` and `TX_BACKOFF`. Filtering on `bw == 0` here would mean a
    /// backed-off neighbor's `BW` counter is never visited again once it is behind,
    /// since nothing else ever decrements it; selection must pick it anyway so its
    /// backoff window counts down like a dedicated shared cell's does. The cursor is
    /// a plain index into the table rather than a pointer, so it is automatically
    /// "revalidated" (clamped) against the table's current length on every use, per
    /// the design note on cyclic neighbor-table references.
    pub fn next_shared_candidate(&mut self) -> Option<Address> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }
        if self.round_robin_cursor >= len {
            self.round_robin_cursor = 0;
        }
        for i in 0..len {
            let idx = (self.round_robin_cursor + i) % len;
            let entry = &self.entries[idx];
            if !entry.queue.is_empty() {
                self.round_robin_cursor = (idx + 1) % len;
                return Some(entry.address);
            }
        }
        None
    }
}
