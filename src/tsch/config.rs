//! Configuration structs for the TSCH core, split by concern the way the
//! pre-TSCH 802.15.4 MAC config once was: timing template, backoff policy, addressing.

use ieee802154::mac::{ExtendedAddress, PanId, ShortAddress};

use crate::Ts;

/// Rational conversion between radio ticks and microseconds: `us = ticks * 3051 / 100`.
/// Fixed network-wide; peers must share it (see [`super::sync_ie`]).
pub const TICKS_TO_US_NUM: u32 = 3051;
pub const TICKS_TO_US_DEN: u32 = 100;

/// Converts a tick duration to microseconds.
pub const fn ticks_to_us(ticks: i32) -> i32 {
    (ticks * TICKS_TO_US_NUM as i32) / TICKS_TO_US_DEN as i32
}

/// Converts a microsecond duration to ticks, rounding toward zero.
pub const fn us_to_ticks(us: i32) -> i32 {
    (us * TICKS_TO_US_DEN as i32) / TICKS_TO_US_NUM as i32
}

/// The IEEE 802.15.4e timeslot template. Every field is a duration in radio ticks,
/// measured from the start of the slot unless noted otherwise. Values default to the
/// commonly used 6TiSCH "minimal" timings, converted from their published microsecond
/// values; a deployment using a different radio should override these to match its peers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingTemplate {
    /// Total slot length.
    pub ts_slot_duration: Ts,
    /// Offset from slot start to CCA sampling point (TX side).
    pub ts_cca_offset: Ts,
    /// Duration of the CCA sample.
    pub ts_cca: Ts,
    /// Offset from slot start to the instant the frame's SFD should go over the air.
    pub ts_tx_offset: Ts,
    /// Offset from TX end to the start of the expected ACK, relative to `ts_tx_offset`.
    pub ts_tx_ack_delay: Ts,
    /// Guard time around an expected ACK arrival.
    pub ts_short_gt: Ts,
    /// Guard time around an expected data-frame arrival (RX slots).
    pub ts_long_gt: Ts,
    /// Fixed radio turnaround delay before transmitting.
    pub delay_tx: Ts,
    /// Fixed radio turnaround delay before receiving.
    pub delay_rx: Ts,
    /// Watchdog: maximum time a data frame reception may take before being abandoned.
    pub wd_data_duration: Ts,
    /// Watchdog: maximum time spent reading an ACK once detected.
    pub wd_ack_duration: Ts,
}

impl Default for TimingTemplate {
    fn default() -> Self {
        Self {
            ts_slot_duration: us_to_ticks(10_000) as Ts,
            ts_cca_offset: us_to_ticks(1_800) as Ts,
            ts_cca: us_to_ticks(128) as Ts,
            ts_tx_offset: us_to_ticks(2_120) as Ts,
            ts_tx_ack_delay: us_to_ticks(1_000) as Ts,
            ts_short_gt: us_to_ticks(400) as Ts,
            ts_long_gt: us_to_ticks(2_750) as Ts,
            delay_tx: us_to_ticks(150) as Ts,
            delay_rx: us_to_ticks(150) as Ts,
            wd_data_duration: us_to_ticks(5_000) as Ts,
            wd_ack_duration: us_to_ticks(2_000) as Ts,
        }
    }
}

/// Backoff and retry policy, mirroring `macMinBE`/`macMaxBE`/`macMaxFrameRetries`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub mac_min_be: u8,
    pub mac_max_be: u8,
    pub mac_max_frame_retries: u8,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            mac_min_be: 1,
            mac_max_be: 4,
            mac_max_frame_retries: 4,
        }
    }
}

/// Local addressing: PAN id plus an optional short and/or extended address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AddressConfig {
    pub pan_id: PanId,
    pub short_address: Option<ShortAddress>,
    pub extended_address: Option<ExtendedAddress>,
}

impl AddressConfig {
    pub fn new(pan_id: u16, extended_address: u64) -> Self {
        Self {
            pan_id: PanId(pan_id),
            short_address: None,
            extended_address: Some(ExtendedAddress(extended_address)),
        }
    }

    /// Our own address, preferring the short address when assigned.
    pub fn address(&self) -> ieee802154::mac::Address {
        use ieee802154::mac::Address;

        if let Some(s) = self.short_address {
            return Address::Short(self.pan_id, s);
        }
        if let Some(e) = self.extended_address {
            return Address::Extended(self.pan_id, e);
        }
        Address::None
    }

    /// `true` if an incoming frame's destination address matches ours or is
    /// broadcast, checking PAN id and whichever address form the frame uses.
    pub fn matches(&self, dest: &ieee802154::mac::Address) -> bool {
        use ieee802154::mac::{Address, ExtendedAddress, ShortAddress};

        if let Some(p) = dest.pan_id() {
            if p != PanId::broadcast() && p != self.pan_id {
                return false;
            }
        }

        match dest {
            Address::None => true,
            Address::Short(_, s) => match self.short_address {
                Some(short) => *s == short || *s == ShortAddress::broadcast(),
                None => *s == ShortAddress::broadcast(),
            },
            Address::Extended(_, e) => match self.extended_address {
                Some(ext) => *e == ext || *e == ExtendedAddress::broadcast(),
                None => *e == ExtendedAddress::broadcast(),
            },
        }
    }
}

/// Top-level configuration, bundling the above plus the RDC-level knobs that do not
/// belong to any single sub-component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TschConfig {
    pub address: AddressConfig,
    pub timing: TimingTemplate,
    pub backoff: BackoffConfig,
    /// Whether to perform CCA before a TX attempt.
    pub cca_enabled: bool,
    /// RSSI threshold (dBm) below which the channel is considered clear.
    pub channel_clear_threshold: i16,
    /// Duplicate-suppression window length (see [`super::engine::TschCore`]).
    pub dedup_window: usize,
    /// Whether the receive-path façade drops frames addressed to neither us nor
    /// broadcast before they reach duplicate suppression.
    pub address_filter_enabled: bool,
}

impl Default for TschConfig {
    fn default() -> Self {
        Self {
            address: AddressConfig::new(0x0001, 0),
            timing: TimingTemplate::default(),
            backoff: BackoffConfig::default(),
            cca_enabled: true,
            channel_clear_threshold: -90,
            dedup_window: 8,
            address_filter_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ieee802154::mac::{Address, AddressMode};

    #[test]
    fn matches_own_and_broadcast_short_address() {
        let addr = AddressConfig {
            pan_id: PanId(1),
            short_address: Some(ShortAddress(2)),
            extended_address: None,
        };
        assert!(addr.matches(&Address::Short(PanId(1), ShortAddress(2))));
        assert!(addr.matches(&Address::broadcast(&AddressMode::Short)));
        assert!(!addr.matches(&Address::Short(PanId(1), ShortAddress(3))));
        assert!(!addr.matches(&Address::Short(PanId(2), ShortAddress(2))));
    }
}
