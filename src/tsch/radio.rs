//! The downward radio driver contract (§6). TSCH needs finer control than the
//! general-purpose [`crate::Radio`] trait offers (SFD timestamp capture, a
//! hardware ACK path) so it is expressed as its own trait rather than bolted onto
//! the `radio` crate's `Transmit`/`Receive`/`State` traits used elsewhere in this
//! crate.

use crate::Ts;

/// Outcome of a transmit attempt as reported by the radio driver itself, before the
/// power-cycle state machine has had a chance to wait for an ACK.
///
/// Deliberately has no `NoAck` variant: this layer's ACK handling is cooperative
/// (`AckWindowStart`/`AckDetect`/`AckRead` in [`super::engine`]) rather than a
/// hardware auto-ack, so "no ACK heard" is a verdict the engine reaches on its own
/// by polling the radio after `transmit` returns, never something the driver call
/// itself reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioTxOutcome {
    Ok,
    Collision,
    Err,
}

pub trait TschRadio {
    type Error;

    fn on(&mut self) -> Result<(), Self::Error>;
    fn off(&mut self) -> Result<(), Self::Error>;

    fn set_channel(&mut self, channel: u8) -> Result<(), Self::Error>;

    /// Loads `data` into the radio's TX buffer without transmitting yet.
    fn prepare(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Transmits the previously prepared payload.
    fn transmit(&mut self) -> Result<RadioTxOutcome, Self::Error>;

    /// Clear-channel assessment: `true` if the channel is clear to transmit on.
    fn channel_clear(&mut self) -> Result<bool, Self::Error>;

    /// `true` while a frame is actively being received over the air.
    fn receiving_packet(&mut self) -> Result<bool, Self::Error>;

    /// `true` if a fully received frame is waiting to be read out.
    fn pending_packet(&mut self) -> Result<bool, Self::Error>;

    /// Reads a received frame into `buf`, returning its length.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Arms SFD timestamp capture for the next TX and/or RX event.
    fn sfd_sync(&mut self, capture_tx: bool, capture_rx: bool) -> Result<(), Self::Error>;

    /// Reads back the tick at which the most recent SFD was captured.
    fn read_sfd_timer(&mut self) -> Result<Ts, Self::Error>;

    /// The tick at which the current/most recent inbound frame finished, if known.
    fn get_rx_end_time(&mut self) -> Result<Option<Ts>, Self::Error>;

    /// Whether the driver has an unserviced interrupt pending (used by the state
    /// machine to decide whether it is safe to sleep past the next nominal wakeup).
    fn pending_irq(&mut self) -> bool;

    /// Reads a received ACK frame into `buf`.
    fn read_ack(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Instructs the driver to transmit a previously-prepared hardware ACK
    /// (built via [`super::engine::TschCore::make_sync_ack`]).
    fn send_ack(&mut self) -> Result<(), Self::Error>;
}
