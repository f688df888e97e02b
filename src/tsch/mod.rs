//! TSCH (IEEE 802.15.4e Time-Slotted Channel Hopping) MAC core.
//!
//! [`engine::TschCore`] is the single entry point: it owns the schedule, the
//! neighbor table, the slot scheduler and the callback dispatcher, and exposes the
//! send/receive façades directly (there is no separate top-level MAC struct wrapping
//! it, the original split between the power-cycle coroutine and its façade methods
//! collapses naturally once both live behind one timer-driven `poll`).

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod neighbor;
pub mod packet;
pub mod radio;
pub mod schedule;
pub mod sync_ie;
pub mod timeslot;

pub use config::{AddressConfig, BackoffConfig, TimingTemplate, TschConfig};
pub use dispatch::{Dispatcher, TxEvent};
pub use engine::{CoreState, PollOutcome, TschCore};
pub use error::{TschError, TxStatus};
pub use neighbor::{NeighborEntry, NeighborError, NeighborStore, PacketSlot, SentCallback};
pub use packet::Packet;
pub use radio::{RadioTxOutcome, TschRadio};
pub use schedule::{channel, is_broadcast_address, Cell, LinkOptions, LinkType, ScheduleError, Slotframe};
pub use sync_ie::{SyncIe, SyncIeError};
pub use timeslot::{missed_deadline, DeadlineError, SlotScheduler};
