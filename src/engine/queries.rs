//! Read-only operations. All answers come from read locks; none of these
//! reserve anything.

use ulid::Ulid;

use super::availability::{business_day, remaining_for_range};
use super::validate::validate_query;
use super::{Engine, EngineError};
use crate::model::*;
use crate::observability;

impl Engine {
    /// Answer "how many of this type remain over these dates?". The quote
    /// is advisory — only [`Engine::commit_booking`] reserves anything.
    ///
    /// A zero-quantity query is a pure remaining-stock probe and reports
    /// `available: true` even on a full date.
    pub async fn check_availability(&self, query: &AvailabilityQuery) -> Result<Quote, EngineError> {
        validate_query(query)?;
        let start = std::time::Instant::now();

        let probe = super::validate::validate_plan(&query.plan, &query.dates, query.start_time)?
            .unwrap_or_else(business_day);

        let quote = match self.get_type(&query.bike_type) {
            // Never provisioned: zero capacity, fail closed
            None => Quote {
                available: query.qty == 0,
                remaining: 0,
            },
            Some(ts_arc) => {
                let ts = ts_arc.read().await;
                let min = remaining_for_range(&ts, &query.dates, &probe, self.buffer_min);
                Quote {
                    available: query.qty == 0 || min.remaining >= query.qty as i64,
                    remaining: min.remaining,
                }
            }
        };

        metrics::counter!(observability::AVAILABILITY_QUERIES_TOTAL).increment(1);
        metrics::histogram!(observability::AVAILABILITY_QUERY_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        Ok(quote)
    }

    pub fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.reservations
            .get(&id)
            .map(|r| r.clone())
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// All reservations, newest first.
    pub fn list_reservations(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self.reservations.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Active reservations of one bike type whose date range touches the
    /// query range.
    pub async fn find_overlapping(
        &self,
        bike_type: &BikeType,
        dates: &DateRange,
    ) -> Vec<Reservation> {
        let Some(ts_arc) = self.get_type(bike_type) else {
            return Vec::new();
        };
        let ids: Vec<Ulid> = {
            let ts = ts_arc.read().await;
            ts.overlapping(dates).map(|s| s.reservation_id).collect()
        };
        ids.into_iter()
            .filter_map(|id| self.reservations.get(&id).map(|r| r.clone()))
            .collect()
    }

    /// Stock ledger rows for every bike type across a date range, sorted by
    /// date then type. Dates with no row are absent, not zero-filled.
    pub async fn stock_report(&self, dates: &DateRange) -> Vec<StockReportRow> {
        let types: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::new();
        for ts_arc in types {
            let ts = ts_arc.read().await;
            for (&date, stock) in ts.stock.range(dates.start..=dates.end) {
                rows.push(StockReportRow {
                    date,
                    bike_type: ts.bike_type.clone(),
                    base_quantity: stock.base_quantity,
                    manual_adjustment: stock.manual_adjustment,
                    reserved: stock.reserved,
                    available: stock.available(),
                });
            }
        }
        rows.sort_by(|a, b| (a.date, &a.bike_type).cmp(&(b.date, &b.bike_type)));
        rows
    }

    /// Stock ledger rows for one bike type.
    pub async fn stock_for_type(
        &self,
        bike_type: &BikeType,
        dates: &DateRange,
    ) -> Vec<StockReportRow> {
        let Some(ts_arc) = self.get_type(bike_type) else {
            return Vec::new();
        };
        let ts = ts_arc.read().await;
        ts.stock
            .range(dates.start..=dates.end)
            .map(|(&date, stock)| StockReportRow {
                date,
                bike_type: bike_type.clone(),
                base_quantity: stock.base_quantity,
                manual_adjustment: stock.manual_adjustment,
                reserved: stock.reserved,
                available: stock.available(),
            })
            .collect()
    }
}
