use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Date, Time};
use ulid::Ulid;

/// Unix milliseconds — wall-clock timestamps (creation, cancel requests).
pub type Ms = i64;

/// Minutes since midnight — the only intra-day time unit.
pub type Min = u16;

pub const MINUTES_PER_DAY: Min = 24 * 60;

/// Half-open time-of-day interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Min,
    pub end: Min,
}

impl Window {
    pub fn new(start: Min, end: Min) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_min(&self) -> Min {
        self.end - self.start
    }
}

pub fn minute_of_day(t: Time) -> Min {
    t.hour() as Min * 60 + t.minute() as Min
}

/// Wall-clock addition with no day rollover: `None` if the result would
/// pass midnight. Plans that would cross midnight are rejected upstream.
pub fn add_hours(t: Min, hours: u8) -> Option<Min> {
    let end = t as u32 + hours as u32 * 60;
    (end <= MINUTES_PER_DAY as u32).then_some(end as Min)
}

/// Same contract as [`add_hours`], for the post-use buffer.
pub fn add_buffer(t: Min, minutes: Min) -> Option<Min> {
    let end = t as u32 + minutes as u32;
    (end <= MINUTES_PER_DAY as u32).then_some(end as Min)
}

/// Inclusive calendar-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Date,
    pub end: Date,
}

impl DateRange {
    /// `None` if `end < start`.
    pub fn new(start: Date, end: Date) -> Option<Self> {
        (end >= start).then_some(Self { start, end })
    }

    pub fn single(date: Date) -> Self {
        Self { start: date, end: date }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).whole_days() + 1
    }

    pub fn contains(&self, date: Date) -> bool {
        self.start <= date && date <= self.end
    }

    /// Overlap test. For inclusive ranges this is equivalent to the
    /// half-open rule applied to `end + 1 day`.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Inclusive enumeration of every date in the range.
    pub fn iter(&self) -> DateIter {
        DateIter {
            next: Some(self.start),
            end: self.end,
        }
    }
}

pub struct DateIter {
    next: Option<Date>,
    end: Date,
}

impl Iterator for DateIter {
    type Item = Date;

    fn next(&mut self) -> Option<Date> {
        let current = self.next?;
        if current > self.end {
            return None;
        }
        self.next = current.next_day();
        Some(current)
    }
}

/// Bike-type key, e.g. "cross-S" or "electric-A-M". No independent
/// lifecycle — purely a lookup key into stock and reservations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BikeType(pub String);

impl BikeType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for BikeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BikeType {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Rental plan. The temporal semantics differ: timed plans occupy a
/// sub-interval of one business day, the others block whole calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plan {
    /// Start time plus fixed duration within one business day (e.g. the
    /// 6-hour plan). A post-use buffer follows every timed rental.
    SameDayTimed { duration_hours: u8 },
    FullDay,
    MultiDay,
}

impl Plan {
    pub fn is_timed(&self) -> bool {
        matches!(self, Plan::SameDayTimed { .. })
    }

    /// Whether this plan consumes the stock ledger's `reserved` counter.
    /// Timed plans are reconciled by live reservation scans instead.
    pub fn uses_reserved_counter(&self) -> bool {
        !self.is_timed()
    }
}

/// Reservation workflow. `DropoffInProgress` only exists on the one-way
/// drop-off path; `Canceled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    InUse,
    DropoffInProgress,
    Completed,
    Canceled,
}

impl ReservationStatus {
    /// Whether `next` is a legal transition in the workflow applicable to a
    /// reservation with the given drop-off option.
    pub fn can_transition(self, next: Self, dropoff: bool) -> bool {
        use ReservationStatus::*;
        match (self, next) {
            (Reserved, InUse) => true,
            (InUse, DropoffInProgress) => dropoff,
            (InUse, Completed) => !dropoff,
            (DropoffInProgress, Completed) => dropoff,
            (from, Canceled) => from != Completed && from != Canceled,
            _ => false,
        }
    }

    /// Active reservations count toward capacity; only canceled ones don't.
    pub fn is_active(self) -> bool {
        !matches!(self, ReservationStatus::Canceled)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::InUse => "in_use",
            ReservationStatus::DropoffInProgress => "dropoff_in_progress",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: String,
}

/// Price breakdown in yen, carried through unchanged — pricing is computed
/// upstream and is not this engine's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: i64,
    pub addons_price: i64,
    pub discount: i64,
    pub total_price: i64,
}

/// One customer booking — the source of truth for what has been promised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub plan: Plan,
    pub dates: DateRange,
    /// Start of use, minutes since midnight. Present iff the plan is timed.
    pub start_time: Option<Min>,
    /// Requested quantity per bike type, every entry > 0.
    pub bikes: BTreeMap<BikeType, u32>,
    /// Requested add-ons (helmets, child seats, ...) keyed by add-on id.
    /// Carried through for fulfilment; never part of capacity math.
    pub addons: BTreeMap<String, u32>,
    pub status: ReservationStatus,
    /// One-way drop-off option; selects the workflow with `DropoffInProgress`.
    pub dropoff: bool,
    /// Physical unit numbers assigned at pickup.
    pub bike_numbers: Vec<String>,
    pub customer: Customer,
    pub price: PriceBreakdown,
    pub cancel_requested: bool,
    pub cancel_requested_at: Option<Ms>,
    pub cancel_reason: Option<String>,
    pub created_at: Ms,
}

impl Reservation {
    /// Occupied time-of-day window including the post-use buffer, for timed
    /// plans only.
    pub fn effective_window(&self, buffer: Min) -> Option<Window> {
        let Plan::SameDayTimed { duration_hours } = self.plan else {
            return None;
        };
        let start = self.start_time?;
        let end = add_buffer(add_hours(start, duration_hours)?, buffer)?;
        Some(Window::new(start, end))
    }
}

/// Capacity record for one stock-day (one calendar date × one bike type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDay {
    /// Fleet size for this date.
    pub base_quantity: u32,
    /// Signed admin adjustment for phone/walk-in bookings. May drive
    /// `available` negative; that is surfaced, never clamped.
    pub manual_adjustment: i32,
    /// Whole-day reservation consumption. Timed plans never touch this.
    pub reserved: u32,
}

impl StockDay {
    pub fn new(base_quantity: u32) -> Self {
        Self {
            base_quantity,
            manual_adjustment: 0,
            reserved: 0,
        }
    }

    /// Derived, never stored. Negative means oversell or operator error and
    /// needs attention — it is not silently clipped.
    pub fn available(&self) -> i64 {
        self.base_quantity as i64 + self.manual_adjustment as i64 - self.reserved as i64
    }
}

/// Per-type projection of a reservation — just enough for availability math.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSlice {
    pub reservation_id: Ulid,
    pub plan: Plan,
    pub dates: DateRange,
    pub start_time: Option<Min>,
    pub qty: u32,
}

/// All contended state for one bike type. Mutations happen under the write
/// side of the owning `RwLock` and bump `version`.
#[derive(Debug, Clone)]
pub struct TypeState {
    pub bike_type: BikeType,
    /// Stock-day rows keyed by date. A date with no row has zero capacity.
    pub stock: BTreeMap<Date, StockDay>,
    /// Active (non-canceled) reservation slices, sorted by range start.
    pub active: Vec<ActiveSlice>,
    /// Bumped on every capacity-relevant mutation — the optimistic token
    /// the booking transaction validates before committing.
    pub version: u64,
}

impl TypeState {
    pub fn new(bike_type: BikeType) -> Self {
        Self {
            bike_type,
            stock: BTreeMap::new(),
            active: Vec::new(),
            version: 0,
        }
    }

    /// Insert a slice maintaining sort order by `dates.start`.
    pub fn insert_slice(&mut self, slice: ActiveSlice) {
        let pos = self
            .active
            .binary_search_by_key(&slice.dates.start, |s| s.dates.start)
            .unwrap_or_else(|e| e);
        self.active.insert(pos, slice);
    }

    pub fn remove_slice(&mut self, reservation_id: Ulid) -> Option<ActiveSlice> {
        let pos = self
            .active
            .iter()
            .position(|s| s.reservation_id == reservation_id)?;
        Some(self.active.remove(pos))
    }

    /// Slices whose date range overlaps the query range. Binary search skips
    /// everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &ActiveSlice> {
        let right_bound = self
            .active
            .partition_point(|s| s.dates.start <= query.end);
        self.active[..right_bound]
            .iter()
            .filter(move |s| s.dates.end >= query.start)
    }
}

/// The WAL record format — flat, one entry per committed state change.
/// A whole booking is a single record, so replay is all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StockProvisioned {
        bike_type: BikeType,
        date: Date,
        base_quantity: u32,
    },
    StockAdjusted {
        bike_type: BikeType,
        date: Date,
        delta: i32,
    },
    ReservationCommitted {
        reservation: Reservation,
    },
    StatusChanged {
        id: Ulid,
        status: ReservationStatus,
    },
    BikeNumbersAssigned {
        id: Ulid,
        numbers: Vec<String>,
    },
    DropoffChanged {
        id: Ulid,
        dropoff: bool,
        total_price: i64,
    },
    CancelRequested {
        id: Ulid,
        at: Ms,
        reason: Option<String>,
    },
}

// ── Query request/result types ───────────────────────────────────

/// A transient availability request; never persisted.
#[derive(Debug, Clone)]
pub struct AvailabilityQuery {
    pub bike_type: BikeType,
    pub dates: DateRange,
    pub start_time: Option<Min>,
    pub qty: u32,
    pub plan: Plan,
}

/// What the storefront submits to book. Quantities are validated strictly;
/// a malformed payload is rejected, never defaulted.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub plan: Plan,
    pub dates: DateRange,
    pub start_time: Option<Min>,
    pub bikes: BTreeMap<BikeType, u32>,
    pub addons: BTreeMap<String, u32>,
    pub customer: Customer,
    pub price: PriceBreakdown,
    pub dropoff: bool,
}

/// Result of an availability check. `remaining` is the minimum per-date
/// figure across the queried range, not clipped to the requested quantity,
/// so callers can display "3 left" even when 5 were asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub available: bool,
    pub remaining: i64,
}

/// One row of the admin stock report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReportRow {
    pub date: Date,
    pub bike_type: BikeType,
    pub base_quantity: u32,
    pub manual_adjustment: i32,
    pub reserved: u32,
    pub available: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, time};

    #[test]
    fn window_half_open_overlap() {
        let a = Window::new(8 * 60, 12 * 60);
        let b = Window::new(12 * 60, 14 * 60);
        let c = Window::new(11 * 60 + 59, 13 * 60);
        assert!(!a.overlaps(&b)); // adjacent, not overlapping
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&a));
    }

    #[test]
    fn wall_clock_arithmetic_refuses_rollover() {
        assert_eq!(add_hours(8 * 60, 6), Some(14 * 60));
        assert_eq!(add_buffer(14 * 60, 60), Some(15 * 60));
        assert_eq!(add_hours(22 * 60, 3), None);
        assert_eq!(add_buffer(MINUTES_PER_DAY - 30, 60), None);
    }

    #[test]
    fn minute_of_day_conversion() {
        assert_eq!(minute_of_day(time!(08:00)), 480);
        assert_eq!(minute_of_day(time!(18:30)), 1110);
    }

    #[test]
    fn date_range_enumeration() {
        let r = DateRange::new(date!(2025 - 09 - 20), date!(2025 - 09 - 22)).unwrap();
        let days: Vec<Date> = r.iter().collect();
        assert_eq!(
            days,
            vec![date!(2025 - 09 - 20), date!(2025 - 09 - 21), date!(2025 - 09 - 22)]
        );
        assert_eq!(r.days(), 3);
    }

    #[test]
    fn date_range_rejects_inverted() {
        assert!(DateRange::new(date!(2025 - 09 - 22), date!(2025 - 09 - 20)).is_none());
    }

    #[test]
    fn date_range_overlap_inclusive_ends() {
        let a = DateRange::new(date!(2025 - 09 - 20), date!(2025 - 09 - 22)).unwrap();
        let b = DateRange::single(date!(2025 - 09 - 22));
        let c = DateRange::single(date!(2025 - 09 - 23));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn status_workflow_without_dropoff() {
        use ReservationStatus::*;
        assert!(Reserved.can_transition(InUse, false));
        assert!(InUse.can_transition(Completed, false));
        assert!(!InUse.can_transition(DropoffInProgress, false));
        assert!(!Reserved.can_transition(Completed, false));
    }

    #[test]
    fn status_workflow_with_dropoff() {
        use ReservationStatus::*;
        assert!(InUse.can_transition(DropoffInProgress, true));
        assert!(DropoffInProgress.can_transition(Completed, true));
        assert!(!InUse.can_transition(Completed, true));
    }

    #[test]
    fn canceled_reachable_pre_completion_only() {
        use ReservationStatus::*;
        assert!(Reserved.can_transition(Canceled, false));
        assert!(InUse.can_transition(Canceled, true));
        assert!(DropoffInProgress.can_transition(Canceled, true));
        assert!(!Completed.can_transition(Canceled, false));
        assert!(!Canceled.can_transition(Canceled, false));
        assert!(!Canceled.can_transition(Reserved, false));
    }

    #[test]
    fn stock_day_available_may_go_negative() {
        let mut s = StockDay::new(2);
        s.manual_adjustment = -5;
        assert_eq!(s.available(), -3);
        s.reserved = 1;
        assert_eq!(s.available(), -4);
    }

    #[test]
    fn slice_ordering_and_windowed_scan() {
        let mut ts = TypeState::new(BikeType::from("cross-S"));
        let mk = |start: Date, end: Date| ActiveSlice {
            reservation_id: Ulid::new(),
            plan: Plan::MultiDay,
            dates: DateRange::new(start, end).unwrap(),
            start_time: None,
            qty: 1,
        };
        ts.insert_slice(mk(date!(2025 - 09 - 25), date!(2025 - 09 - 26)));
        ts.insert_slice(mk(date!(2025 - 09 - 20), date!(2025 - 09 - 21)));
        ts.insert_slice(mk(date!(2025 - 09 - 22), date!(2025 - 09 - 23)));
        assert_eq!(ts.active[0].dates.start, date!(2025 - 09 - 20));
        assert_eq!(ts.active[2].dates.start, date!(2025 - 09 - 25));

        let hits: Vec<_> = ts
            .overlapping(&DateRange::new(date!(2025 - 09 - 21), date!(2025 - 09 - 22)).unwrap())
            .collect();
        assert_eq!(hits.len(), 2);

        // Range after everything
        assert_eq!(
            ts.overlapping(&DateRange::single(date!(2025 - 09 - 27))).count(),
            0
        );
    }

    #[test]
    fn slice_remove_by_reservation() {
        let mut ts = TypeState::new(BikeType::from("cross-S"));
        let id = Ulid::new();
        ts.insert_slice(ActiveSlice {
            reservation_id: id,
            plan: Plan::FullDay,
            dates: DateRange::single(date!(2025 - 09 - 20)),
            start_time: None,
            qty: 2,
        });
        assert!(ts.remove_slice(id).is_some());
        assert!(ts.remove_slice(id).is_none());
        assert!(ts.active.is_empty());
    }

    #[test]
    fn effective_window_includes_buffer() {
        let r = Reservation {
            id: Ulid::new(),
            plan: Plan::SameDayTimed { duration_hours: 3 },
            dates: DateRange::single(date!(2025 - 09 - 20)),
            start_time: Some(8 * 60),
            bikes: BTreeMap::from([(BikeType::from("cross-S"), 1)]),
            addons: BTreeMap::new(),
            status: ReservationStatus::Reserved,
            dropoff: false,
            bike_numbers: Vec::new(),
            customer: Customer {
                name: "t".into(),
                email: "t@example.com".into(),
            },
            price: PriceBreakdown::default(),
            cancel_requested: false,
            cancel_requested_at: None,
            cancel_reason: None,
            created_at: 0,
        };
        // 08:00 + 3h + 60min buffer blocks [08:00, 12:00)
        assert_eq!(r.effective_window(60), Some(Window::new(480, 720)));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::StockProvisioned {
            bike_type: BikeType::from("electric-A-M"),
            date: date!(2025 - 09 - 20),
            base_quantity: 5,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
