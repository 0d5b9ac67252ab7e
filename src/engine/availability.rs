//! Capacity arithmetic over a single bike type's state. Pure functions —
//! callers hold whatever lock is appropriate.
//!
//! Whole-day plans consume the stock ledger's `reserved` counter, so their
//! load is already inside `StockDay::available()`. Timed rentals are never
//! counted there; their load on a given date is recomputed from the active
//! slices by a weighted sweep over the candidate window.

use time::Date;

use crate::limits;
use crate::model::{DateRange, Min, Plan, TypeState, Window};

/// The whole business day as a probe window, used when a whole-day query
/// must account for timed rentals already on the date.
pub fn business_day() -> Window {
    Window::new(limits::OPEN_MIN, limits::CLOSE_MIN)
}

/// Peak simultaneous timed-rental load on `date` across the probe window.
///
/// Each timed slice occupies `[start, start + duration + buffer)`; slices
/// not overlapping the probe contribute nothing. Sweep events are sorted
/// with releases before claims at equal instants, matching the half-open
/// window rule: a rental may begin the minute another's buffer ends.
pub fn peak_timed_load(state: &TypeState, date: Date, probe: &Window, buffer: Min) -> i64 {
    let mut events: Vec<(Min, i64)> = Vec::new();
    for slice in state.overlapping(&DateRange::single(date)) {
        let Plan::SameDayTimed { duration_hours } = slice.plan else {
            continue;
        };
        let Some(start) = slice.start_time else {
            continue;
        };
        let Some(end) = crate::model::add_hours(start, duration_hours)
            .and_then(|t| crate::model::add_buffer(t, buffer))
        else {
            continue;
        };
        let occupied = Window::new(start, end);
        if !occupied.overlaps(probe) {
            continue;
        }
        let clamped_start = occupied.start.max(probe.start);
        let clamped_end = occupied.end.min(probe.end);
        events.push((clamped_start, slice.qty as i64));
        events.push((clamped_end, -(slice.qty as i64)));
    }

    // Sort by time, releases (-qty) ahead of claims (+qty) at the same minute
    events.sort_unstable_by_key(|&(t, delta)| (t, delta));

    let mut load = 0i64;
    let mut peak = 0i64;
    for (_, delta) in events {
        load += delta;
        peak = peak.max(load);
    }
    peak
}

/// Remaining units of this bike type on `date` for a rental occupying
/// `probe`. A date with no stock row has zero capacity.
pub fn remaining_for_date(state: &TypeState, date: Date, probe: &Window, buffer: Min) -> i64 {
    let Some(stock) = state.stock.get(&date) else {
        return 0;
    };
    stock.available() - peak_timed_load(state, date, probe, buffer)
}

/// Minimum remaining across a date range, with the date that set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRemaining {
    pub remaining: i64,
    pub constraining_date: Date,
}

/// A booking holds its bikes for every date it covers, so the range's
/// capacity is the minimum of its per-date figures.
pub fn remaining_for_range(
    state: &TypeState,
    dates: &DateRange,
    probe: &Window,
    buffer: Min,
) -> RangeRemaining {
    let mut min = RangeRemaining {
        remaining: i64::MAX,
        constraining_date: dates.start,
    };
    for date in dates.iter() {
        let remaining = remaining_for_date(state, date, probe, buffer);
        if remaining < min.remaining {
            min = RangeRemaining {
                remaining,
                constraining_date: date,
            };
        }
    }
    min
}
