//! Shop calendar: fixed weekly closure, public holidays, and the
//! busy-season rule that keeps timed rentals off long holiday blocks.
//!
//! Eligibility is deliberately separate from capacity math — a date can
//! have plenty of stock and still not be bookable.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use time::{Date, Month, Weekday};

use crate::engine::EngineError;
use crate::limits;
use crate::model::{DateRange, Plan};

/// Source of public-holiday dates, injected so tests and offline
/// deployments don't need a live service.
#[async_trait]
pub trait HolidayProvider: Send + Sync {
    async fn holidays(&self, year: i32) -> Result<Vec<Date>, EngineError>;
}

/// Fixed holiday set, for tests and static configuration.
pub struct StaticHolidays(pub HashSet<Date>);

#[async_trait]
impl HolidayProvider for StaticHolidays {
    async fn holidays(&self, year: i32) -> Result<Vec<Date>, EngineError> {
        Ok(self.0.iter().copied().filter(|d| d.year() == year).collect())
    }
}

/// Per-year holiday cache over a [`HolidayProvider`]. A year is fetched at
/// most once; lookups after that are lock-free reads.
pub struct HolidayCalendar {
    provider: Arc<dyn HolidayProvider>,
    years: DashMap<i32, HashSet<Date>>,
}

impl HolidayCalendar {
    pub fn new(provider: Arc<dyn HolidayProvider>) -> Self {
        Self {
            provider,
            years: DashMap::new(),
        }
    }

    async fn ensure_year(&self, year: i32) -> Result<(), EngineError> {
        if self.years.contains_key(&year) {
            return Ok(());
        }
        let holidays = self.provider.holidays(year).await?;
        self.years.insert(year, holidays.into_iter().collect());
        Ok(())
    }

    /// Drop and refetch one cached year.
    pub async fn refresh_year(&self, year: i32) -> Result<(), EngineError> {
        self.years.remove(&year);
        self.ensure_year(year).await
    }

    pub async fn is_holiday(&self, date: Date) -> Result<bool, EngineError> {
        self.ensure_year(date.year()).await?;
        Ok(self
            .years
            .get(&date.year())
            .is_some_and(|set| set.contains(&date)))
    }

    /// Weekend or public holiday.
    pub async fn is_non_working(&self, date: Date) -> Result<bool, EngineError> {
        if matches!(date.weekday(), Weekday::Saturday | Weekday::Sunday) {
            return Ok(true);
        }
        self.is_holiday(date).await
    }

    /// Length of the maximal run of consecutive non-working days containing
    /// `date`, or 0 if `date` itself is a working day.
    pub async fn consecutive_block_len(&self, date: Date) -> Result<u32, EngineError> {
        if !self.is_non_working(date).await? {
            return Ok(0);
        }
        let mut len = 1u32;
        let mut cursor = date;
        while let Some(prev) = cursor.previous_day() {
            if !self.is_non_working(prev).await? {
                break;
            }
            len += 1;
            cursor = prev;
        }
        cursor = date;
        while let Some(next) = cursor.next_day() {
            if !self.is_non_working(next).await? {
                break;
            }
            len += 1;
            cursor = next;
        }
        Ok(len)
    }
}

/// Fixed weekly closure.
pub fn is_closed_day(date: Date) -> bool {
    date.weekday() == limits::CLOSED_WEEKDAY
}

/// Busy season: spring and autumn, when timed rentals are kept off long
/// holiday blocks to preserve whole-day capacity.
pub fn is_busy_season(date: Date) -> bool {
    matches!(
        date.month(),
        Month::March | Month::April | Month::May | Month::September | Month::October | Month::November
    )
}

/// Whether `plan` can be served on `dates` at all. Single-day plans are
/// refused on the closure day; multi-day rentals only need pickup and
/// return to fall on open days, the bikes stay out in between.
pub async fn check_eligibility(
    plan: &Plan,
    dates: &DateRange,
    calendar: Option<&HolidayCalendar>,
) -> Result<(), EngineError> {
    match plan {
        Plan::SameDayTimed { .. } | Plan::FullDay => {
            if is_closed_day(dates.start) {
                return Err(EngineError::NotBookable {
                    date: dates.start,
                    reason: "shop closed on this weekday",
                });
            }
        }
        Plan::MultiDay => {
            for endpoint in [dates.start, dates.end] {
                if is_closed_day(endpoint) {
                    return Err(EngineError::NotBookable {
                        date: endpoint,
                        reason: "pickup or return falls on the weekly closure day",
                    });
                }
            }
        }
    }

    if plan.is_timed()
        && is_busy_season(dates.start)
        && let Some(calendar) = calendar
    {
        let block = calendar.consecutive_block_len(dates.start).await?;
        if block >= limits::HOLIDAY_BLOCK_MIN_DAYS {
            return Err(EngineError::NotBookable {
                date: dates.start,
                reason: "timed plans unavailable on busy-season holiday blocks",
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn calendar_with(holidays: &[Date]) -> HolidayCalendar {
        HolidayCalendar::new(Arc::new(StaticHolidays(holidays.iter().copied().collect())))
    }

    #[test]
    fn wednesday_is_closed() {
        assert!(is_closed_day(date!(2025 - 09 - 24))); // Wednesday
        assert!(!is_closed_day(date!(2025 - 09 - 25)));
    }

    #[test]
    fn busy_season_months() {
        assert!(is_busy_season(date!(2025 - 04 - 10)));
        assert!(is_busy_season(date!(2025 - 10 - 10)));
        assert!(!is_busy_season(date!(2025 - 07 - 10)));
        assert!(!is_busy_season(date!(2025 - 01 - 10)));
    }

    #[tokio::test]
    async fn holiday_cache_fetches_year_once() {
        let cal = calendar_with(&[date!(2025 - 09 - 15)]);
        assert!(cal.is_holiday(date!(2025 - 09 - 15)).await.unwrap());
        assert!(!cal.is_holiday(date!(2025 - 09 - 16)).await.unwrap());
        assert_eq!(cal.years.len(), 1);
    }

    #[tokio::test]
    async fn block_length_spans_weekend_plus_holiday() {
        // 2025-09-13 Sat, 09-14 Sun, 09-15 Mon holiday: a 3-day block
        let cal = calendar_with(&[date!(2025 - 09 - 15)]);
        assert_eq!(cal.consecutive_block_len(date!(2025 - 09 - 14)).await.unwrap(), 3);
        assert_eq!(cal.consecutive_block_len(date!(2025 - 09 - 15)).await.unwrap(), 3);
        // Plain working Tuesday
        assert_eq!(cal.consecutive_block_len(date!(2025 - 09 - 16)).await.unwrap(), 0);
        // Ordinary weekend elsewhere is a 2-day block
        assert_eq!(cal.consecutive_block_len(date!(2025 - 09 - 20)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn timed_plan_blocked_on_busy_season_block() {
        let cal = calendar_with(&[date!(2025 - 09 - 15)]);
        let timed = Plan::SameDayTimed { duration_hours: 6 };

        let on_block = DateRange::single(date!(2025 - 09 - 14));
        assert!(matches!(
            check_eligibility(&timed, &on_block, Some(&cal)).await,
            Err(EngineError::NotBookable { .. })
        ));

        // Ordinary 2-day weekend stays bookable
        let weekend = DateRange::single(date!(2025 - 09 - 20));
        assert!(check_eligibility(&timed, &weekend, Some(&cal)).await.is_ok());

        // Full-day plans ignore the busy-season rule entirely
        assert!(check_eligibility(&Plan::FullDay, &on_block, Some(&cal)).await.is_ok());
    }

    #[tokio::test]
    async fn multi_day_endpoints_must_be_open() {
        let wednesday = date!(2025 - 09 - 24);

        // Spanning a Wednesday is fine
        let spanning = DateRange::new(date!(2025 - 09 - 23), date!(2025 - 09 - 25)).unwrap();
        assert!(check_eligibility(&Plan::MultiDay, &spanning, None).await.is_ok());

        // Picking up or returning on it is not
        let pickup = DateRange::new(wednesday, date!(2025 - 09 - 26)).unwrap();
        let ret = DateRange::new(date!(2025 - 09 - 22), wednesday).unwrap();
        for range in [pickup, ret] {
            assert!(matches!(
                check_eligibility(&Plan::MultiDay, &range, None).await,
                Err(EngineError::NotBookable { .. })
            ));
        }
    }
}
