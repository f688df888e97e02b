
#![no_std]

#[cfg(feature = "std")]
extern crate std;

pub mod tsch;

/// A single tick of the high-resolution slot timer. The ratio between a tick and a
/// microsecond (3051/100, see [`tsch::sync_ie`]) is fixed network-wide; peers must agree on it.
pub type Ts = u32;

