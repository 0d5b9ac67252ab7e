//! Availability and booking consistency engine for a bicycle-rental fleet.
//!
//! The engine answers one question — "is there capacity for this bike type
//! over this date/time range?" — and commits bookings against that answer
//! without ever overselling, even under concurrent submission. State lives
//! in memory (per-bike-type, behind `RwLock`s) and is made durable through
//! an append-only, group-committed WAL.

pub mod calendar;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod wal;

pub use engine::{Engine, EngineError};
pub use model::{
    AvailabilityQuery, BikeType, BookingRequest, DateRange, Plan, Quote, Reservation,
    ReservationStatus, StockDay, Window,
};
