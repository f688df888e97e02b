//! Async Callback Dispatcher: carries TX outcomes computed inside the timer-driven
//! power-cycle coroutine out to a context where the upper-layer callback is safe to
//! invoke. Grounded on `tsch_tx_callback_process`, which drains a FIFO of completed
//! packets from a polled Contiki process rather than invoking `mac_callback_t`
//! directly from the radio ISR.

use heapless::Deque;

use super::error::TxStatus;
use super::neighbor::SentCallback;

pub struct TxEvent<Ctx> {
    pub callback: SentCallback<Ctx>,
    pub ctx: Ctx,
    pub status: TxStatus,
    pub transmissions: u8,
}

/// `C` bounds how many completed frames may be outstanding before the foreground
/// task drains them; a full dispatcher drops the oldest event rather than block the
/// timer context, since backpressure here would stall the slot scheduler.
pub struct Dispatcher<Ctx, const C: usize> {
    queue: Deque<TxEvent<Ctx>, C>,
}

impl<Ctx, const C: usize> Dispatcher<Ctx, C> {
    pub fn new() -> Self {
        Self { queue: Deque::new() }
    }

    /// Posts a completed frame's outcome. Never blocks; if full, the oldest pending
    /// event is dropped silently to keep the timer context moving.
    pub fn post(&mut self, event: TxEvent<Ctx>) {
        if self.queue.push_back(event).is_err() {
            let _ = self.queue.pop_front();
            let _ = self.queue.push_back(event);
        }
    }

    /// Drains every pending event in FIFO order, invoking each one's callback.
    /// Intended to be called from the foreground cooperative task, never from the
    /// timer context.
    pub fn drain(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            (event.callback)(event.ctx, event.status, event.transmissions);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
