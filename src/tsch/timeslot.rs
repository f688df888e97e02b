//! The slot scheduler: turns ASN/slot-index progression into absolute timer
//! deadlines, folds drift correction in once per slotframe wrap, and detects missed
//! deadlines via the unsigned-wraparound distance test used throughout the original
//! `schedule_fixed`/`powercycle` pair.

use crate::Ts;

use super::config::TimingTemplate;
use super::schedule::Slotframe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineError {
    /// The timer fired too late to honour the requested deadline.
    Missed,
    /// The underlying timer driver itself reported failure.
    DriverFailure,
}

/// `true` if `now` arrived so late that `reference + duration` can no longer be
/// trusted, using the same unsigned-distance trick as the original so it remains
/// correct across `Ts` wraparound.
pub fn missed_deadline(reference: Ts, duration: Ts, now: Ts) -> bool {
    let target = reference.wrapping_add(duration);
    let remaining = target.wrapping_sub(now);
    remaining > duration
}

pub struct SlotScheduler {
    pub asn: u64,
    pub start: Ts,
    pub current_slot: u16,
    drift_sum_us: i64,
    drift_count: u32,
}

impl SlotScheduler {
    pub fn new(start: Ts) -> Self {
        Self {
            asn: 0,
            start,
            current_slot: 0,
            drift_sum_us: 0,
            drift_count: 0,
        }
    }

    /// Accumulates one drift observation (in microseconds, positive means the peer
    /// runs ahead of us) for folding at the next slotframe wrap.
    pub fn record_drift_us(&mut self, us: i32) {
        self.drift_sum_us += us as i64;
        self.drift_count += 1;
    }

    /// Folds the accumulated drift into a tick correction and resets the
    /// accumulator. `(drift_sum_us * 100) / (3051 * drift_count)`, per §4.E.
    fn fold_drift(&mut self) -> i32 {
        if self.drift_count == 0 {
            return 0;
        }
        let correction = (self.drift_sum_us * 100) / (3051 * self.drift_count as i64);
        self.drift_sum_us = 0;
        self.drift_count = 0;
        correction as i32
    }

    /// Advances to the next provisioned slot, returning its absolute start tick, or
    /// `None` if the slotframe has no cells at all (nothing to ever wake for).
    pub fn advance<const N: usize>(&mut self, schedule: &Slotframe<N>, timing: &TimingTemplate) -> Option<Ts> {
        let length = schedule.length();
        // `next_active_slot` is inclusive of the slot passed in, so searching from
        // `current_slot` itself would immediately re-match the slot we just ran
        // (the normal case — it has a cell, that's why we were just in it) and
        // never advance. Search starting at the slot after it instead.
        let next = schedule.next_active_slot(schedule.next_slot(self.current_slot))?;

        let dt: u32 = if next > self.current_slot {
            (next - self.current_slot) as u32
        } else {
            // Wrapped at least once (including the single-active-slot case where
            // `next == current_slot`, which means a full revolution).
            (length as u32 - self.current_slot as u32) + next as u32
        };
        let wrapped = next <= self.current_slot;

        self.asn += dt as u64;
        self.current_slot = next;

        let mut sleep_ticks = dt.wrapping_mul(timing.ts_slot_duration);
        if wrapped {
            let correction = self.fold_drift();
            sleep_ticks = (sleep_ticks as i64 + correction as i64) as u32;
        }
        self.start = self.start.wrapping_add(sleep_ticks);

        Some(self.start)
    }

    /// Recovery from a missed deadline: skip exactly one slot duration, keeping ASN
    /// and `start` aligned to real time rather than silently falling behind.
    pub fn recover_missed_slot(&mut self, schedule_length: u16, timing: &TimingTemplate) {
        self.asn += 1;
        self.current_slot = if self.current_slot + 1 >= schedule_length {
            0
        } else {
            self.current_slot + 1
        };
        self.start = self.start.wrapping_add(timing.ts_slot_duration);
    }
}
