//! Structural validation of queries and booking requests. Everything here
//! is capacity-blind; a request that passes can still fail on stock.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::error::EngineError;
use crate::limits;
use crate::model::{
    add_buffer, add_hours, AvailabilityQuery, BikeType, BookingRequest, DateRange, Min, Ms, Plan,
    Window,
};

pub fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub fn validate_dates(dates: &DateRange) -> Result<(), EngineError> {
    if dates.end < dates.start {
        return Err(EngineError::InvalidQuery("end date before start date"));
    }
    if dates.days() > limits::MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

/// Occupied window for a timed rental starting at `start`: duration plus the
/// post-use buffer, constrained to shop hours on a single day.
pub fn candidate_window(start: Min, duration_hours: u8) -> Result<Window, EngineError> {
    if start < limits::OPEN_MIN {
        return Err(EngineError::InvalidQuery("start before opening time"));
    }
    let end = add_hours(start, duration_hours)
        .and_then(|t| add_buffer(t, limits::DEFAULT_BUFFER_MIN))
        .ok_or(EngineError::InvalidQuery("rental would cross midnight"))?;
    if end > limits::CLOSE_MIN {
        return Err(EngineError::InvalidQuery("rental would run past closing"));
    }
    Ok(Window::new(start, end))
}

/// Check plan/dates/start-time coherence. Returns the occupied window for
/// timed plans, `None` for whole-day plans.
pub fn validate_plan(
    plan: &Plan,
    dates: &DateRange,
    start_time: Option<Min>,
) -> Result<Option<Window>, EngineError> {
    validate_dates(dates)?;
    match plan {
        Plan::SameDayTimed { duration_hours } => {
            if *duration_hours == 0 {
                return Err(EngineError::InvalidQuery("zero-duration timed plan"));
            }
            if dates.days() != 1 {
                return Err(EngineError::InvalidQuery("timed plan spans multiple dates"));
            }
            let start = start_time.ok_or(EngineError::InvalidQuery(
                "timed plan requires a start time",
            ))?;
            candidate_window(start, *duration_hours).map(Some)
        }
        Plan::FullDay => {
            if dates.days() != 1 {
                return Err(EngineError::InvalidQuery("full-day plan spans multiple dates"));
            }
            if start_time.is_some() {
                return Err(EngineError::InvalidQuery("full-day plan takes no start time"));
            }
            Ok(None)
        }
        Plan::MultiDay => {
            if dates.days() < 2 {
                return Err(EngineError::InvalidQuery("multi-day plan needs at least 2 days"));
            }
            if start_time.is_some() {
                return Err(EngineError::InvalidQuery("multi-day plan takes no start time"));
            }
            Ok(None)
        }
    }
}

pub fn validate_query(query: &AvailabilityQuery) -> Result<(), EngineError> {
    validate_plan(&query.plan, &query.dates, query.start_time)?;
    if query.qty > limits::MAX_QTY_PER_TYPE {
        return Err(EngineError::LimitExceeded("quantity per bike type"));
    }
    Ok(())
}

pub fn validate_request(req: &BookingRequest) -> Result<(), EngineError> {
    validate_plan(&req.plan, &req.dates, req.start_time)?;
    if req.bikes.is_empty() {
        return Err(EngineError::InvalidQuery("booking has no bikes"));
    }
    if req.bikes.len() > limits::MAX_BIKE_TYPES_PER_BOOKING {
        return Err(EngineError::LimitExceeded("bike types per booking"));
    }
    for (bike_type, &qty) in &req.bikes {
        if qty == 0 {
            return Err(EngineError::InvalidQuery("zero quantity for a bike type"));
        }
        if qty > limits::MAX_QTY_PER_TYPE {
            return Err(EngineError::LimitExceeded("quantity per bike type"));
        }
        if bike_type.0.is_empty() {
            return Err(EngineError::InvalidQuery("empty bike type"));
        }
    }
    if req.addons.len() > limits::MAX_ADDONS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("add-on kinds per booking"));
    }
    for (addon, &qty) in &req.addons {
        if addon.is_empty() || qty == 0 {
            return Err(EngineError::InvalidQuery("malformed add-on entry"));
        }
    }
    if req.customer.name.is_empty() || req.customer.name.len() > limits::MAX_NAME_LEN {
        return Err(EngineError::InvalidQuery("customer name length"));
    }
    if req.customer.email.is_empty() || req.customer.email.len() > limits::MAX_EMAIL_LEN {
        return Err(EngineError::InvalidQuery("customer email length"));
    }
    Ok(())
}

/// Parse a `{ "key": qty, ... }` JSON object strictly. Anything malformed
/// is an error; quantities are never defaulted to zero.
fn qty_map_from_json(value: &serde_json::Value) -> Result<BTreeMap<String, u32>, EngineError> {
    let obj = value
        .as_object()
        .ok_or(EngineError::InvalidQuery("quantity payload is not an object"))?;
    let mut map = BTreeMap::new();
    for (key, raw) in obj {
        let qty = raw
            .as_u64()
            .ok_or(EngineError::InvalidQuery("quantity is not a non-negative integer"))?;
        if qty == 0 {
            return Err(EngineError::InvalidQuery("zero quantity entry"));
        }
        let qty =
            u32::try_from(qty).map_err(|_| EngineError::LimitExceeded("quantity per entry"))?;
        map.insert(key.clone(), qty);
    }
    Ok(map)
}

/// Storefront `{ "bike_type": qty, ... }` payload.
pub fn bikes_from_json(value: &serde_json::Value) -> Result<BTreeMap<BikeType, u32>, EngineError> {
    Ok(qty_map_from_json(value)?
        .into_iter()
        .map(|(key, qty)| (BikeType(key), qty))
        .collect())
}

/// Storefront `{ "addon_id": qty, ... }` payload.
pub fn addons_from_json(value: &serde_json::Value) -> Result<BTreeMap<String, u32>, EngineError> {
    qty_map_from_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::date;

    #[test]
    fn candidate_window_within_hours() {
        // 08:00 + 6h + 60min buffer = [08:00, 15:00)
        let w = candidate_window(480, 6).unwrap();
        assert_eq!(w, Window::new(480, 900));
    }

    #[test]
    fn candidate_window_rejects_out_of_hours() {
        assert!(matches!(
            candidate_window(400, 6),
            Err(EngineError::InvalidQuery(_))
        ));
        // 13:00 + 6h + buffer ends 20:00, past 18:30 close
        assert!(matches!(
            candidate_window(13 * 60, 6),
            Err(EngineError::InvalidQuery(_))
        ));
        // 22:00 + 6h crosses midnight
        assert!(matches!(
            candidate_window(22 * 60, 6),
            Err(EngineError::InvalidQuery(_))
        ));
    }

    #[test]
    fn plan_date_shape_checks() {
        let single = DateRange::single(date!(2025 - 09 - 20));
        let multi = DateRange::new(date!(2025 - 09 - 20), date!(2025 - 09 - 21)).unwrap();

        assert!(validate_plan(&Plan::FullDay, &single, None).is_ok());
        assert!(validate_plan(&Plan::FullDay, &multi, None).is_err());
        assert!(validate_plan(&Plan::FullDay, &single, Some(480)).is_err());

        assert!(validate_plan(&Plan::MultiDay, &multi, None).is_ok());
        assert!(validate_plan(&Plan::MultiDay, &single, None).is_err());

        let timed = Plan::SameDayTimed { duration_hours: 6 };
        assert!(validate_plan(&timed, &single, Some(480)).is_ok());
        assert!(validate_plan(&timed, &single, None).is_err());
        assert!(validate_plan(&timed, &multi, Some(480)).is_err());
        assert!(validate_plan(&Plan::SameDayTimed { duration_hours: 0 }, &single, Some(480)).is_err());
    }

    #[test]
    fn range_width_limit() {
        let start = date!(2025 - 01 - 01);
        let wide = DateRange::new(start, date!(2025 - 04 - 01)).unwrap();
        assert!(matches!(
            validate_dates(&wide),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn bikes_json_strict_parsing() {
        let good = json!({"cross-S": 2, "electric-A-M": 1});
        let bikes = bikes_from_json(&good).unwrap();
        assert_eq!(bikes.get(&BikeType::from("cross-S")), Some(&2));
        assert_eq!(bikes.len(), 2);

        assert!(bikes_from_json(&json!([1, 2])).is_err());
        assert!(bikes_from_json(&json!({"cross-S": "two"})).is_err());
        assert!(bikes_from_json(&json!({"cross-S": 0})).is_err());
        assert!(bikes_from_json(&json!({"cross-S": -1})).is_err());
        assert!(bikes_from_json(&json!({"cross-S": 1.5})).is_err());
    }

    #[test]
    fn addons_json_strict_parsing() {
        let good = json!({"helmet": 2, "child-seat": 1});
        let addons = addons_from_json(&good).unwrap();
        assert_eq!(addons.get("helmet"), Some(&2));
        assert_eq!(addons.len(), 2);

        assert!(addons_from_json(&json!("helmet")).is_err());
        assert!(addons_from_json(&json!({"helmet": 0})).is_err());
        assert!(addons_from_json(&json!({"helmet": null})).is_err());
    }
}
