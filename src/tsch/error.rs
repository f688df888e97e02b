//! Error and status types for the TSCH core.

use ieee802154::mac::DecodeError;

/// Errors returned synchronously by the send/receive façades.
///
/// Adds the queue/neighbor failures that are specific to a slotted, per-neighbor-queue
/// MAC on top of the usual radio/decode error wrapping.
#[derive(Clone, Debug, PartialEq)]
pub enum TschError<E> {
    /// The underlying radio driver returned an error.
    Radio(E),
    /// A received frame failed to decode.
    Decode(DecodeError),
    /// The destination neighbor's queue has no free slots.
    QueueFull,
    /// No neighbor queue exists for the destination and the table is full, so one
    /// could not be created.
    NoNeighbor,
    /// The neighbor table itself is full.
    TableFull,
    /// A payload did not fit the frame's fixed-size buffer.
    BufferFull,
}

impl<E> From<DecodeError> for TschError<E> {
    fn from(e: DecodeError) -> Self {
        TschError::Decode(e)
    }
}

/// Outcome of a single transmission attempt, as surfaced to the upper layer through the
/// async callback dispatcher. Distinct from [`TschError`] because these are posted
/// out-of-band rather than returned from a call (see `dispatch`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxStatus {
    /// Frame acknowledged (or, for broadcast, simply transmitted).
    Ok,
    /// No ACK was heard within the ACK window.
    NoAck,
    /// Clear-channel assessment found the channel busy.
    Collision,
    /// The radio driver reported a transmit failure.
    Err,
    /// Enqueued but not yet attempted (used only for synchronous bookkeeping, never
    /// posted through the dispatcher).
    Deferred,
}
