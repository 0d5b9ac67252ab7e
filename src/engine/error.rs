use std::error::Error;
use std::fmt;

use time::Date;
use ulid::Ulid;

use crate::model::{BikeType, ReservationStatus};

/// Errors surfaced by engine operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The query or request is malformed and can never succeed as written.
    InvalidQuery(&'static str),
    /// Not enough remaining capacity on the constraining date.
    CapacityExceeded {
        bike_type: BikeType,
        date: Date,
        short_by: i64,
    },
    /// Another writer changed a bike type's state between check and commit.
    /// Internal to the commit loop; callers see `CapacityExceeded` once
    /// retries are exhausted.
    ConcurrencyConflict { bike_type: BikeType },
    ReservationNotFound(Ulid),
    AlreadyCanceled(Ulid),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// The shop cannot serve this plan on this date (closure day, busy
    /// season block). Capacity is not consulted.
    NotBookable { date: Date, reason: &'static str },
    AlreadyProvisioned { bike_type: BikeType, date: Date },
    NoStockRow { bike_type: BikeType, date: Date },
    HolidayService(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidQuery(msg) => write!(f, "invalid query: {msg}"),
            EngineError::CapacityExceeded {
                bike_type,
                date,
                short_by,
            } => write!(
                f,
                "capacity exceeded for {bike_type} on {date}: short by {short_by}"
            ),
            EngineError::ConcurrencyConflict { bike_type } => {
                write!(f, "concurrent modification of {bike_type}")
            }
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyCanceled(id) => write!(f, "reservation already canceled: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::NotBookable { date, reason } => {
                write!(f, "not bookable on {date}: {reason}")
            }
            EngineError::AlreadyProvisioned { bike_type, date } => {
                write!(f, "stock already provisioned for {bike_type} on {date}")
            }
            EngineError::NoStockRow { bike_type, date } => {
                write!(f, "no stock row for {bike_type} on {date}")
            }
            EngineError::HolidayService(msg) => write!(f, "holiday service: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(msg) => write!(f, "WAL error: {msg}"),
        }
    }
}

impl Error for EngineError {}
