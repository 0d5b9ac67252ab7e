//! State-changing operations: booking commit, cancellation, workflow
//! transitions, stock provisioning and WAL compaction.

use tokio::sync::oneshot;
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use time::Date;

use super::availability::{business_day, remaining_for_range};
use super::validate::{now_ms, validate_dates, validate_plan, validate_request};
use super::{
    apply_reservation_to_type, release_reservation_from_type, Engine, EngineError, SharedTypeState,
    WalCommand,
};
use crate::calendar::check_eligibility;
use crate::limits;
use crate::model::*;
use crate::observability;

impl Engine {
    /// Commit a booking atomically across every requested bike type.
    ///
    /// Capacity is checked under read locks, then re-validated via version
    /// tokens under write locks. A version conflict means another commit
    /// landed in between; we retry from the check a bounded number of
    /// times before reporting the capacity failure.
    pub async fn commit_booking(&self, req: &BookingRequest) -> Result<Reservation, EngineError> {
        validate_request(req)?;
        let probe = validate_plan(&req.plan, &req.dates, req.start_time)?
            .unwrap_or_else(business_day);
        check_eligibility(&req.plan, &req.dates, self.calendar.as_deref()).await?;

        let mut attempts = 0u32;
        loop {
            match self.try_commit(req, &probe).await {
                Err(EngineError::ConcurrencyConflict { bike_type }) => {
                    attempts += 1;
                    metrics::counter!(observability::BOOKING_COMMIT_RETRIES_TOTAL).increment(1);
                    if attempts > limits::MAX_COMMIT_RETRIES {
                        let qty = req.bikes.get(&bike_type).copied().unwrap_or(0);
                        metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => "contention")
                            .increment(1);
                        return Err(EngineError::CapacityExceeded {
                            bike_type,
                            date: req.dates.start,
                            short_by: qty as i64,
                        });
                    }
                    tracing::debug!(%bike_type, attempts, "commit retry after version conflict");
                }
                Err(e) => {
                    if matches!(e, EngineError::CapacityExceeded { .. }) {
                        metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => "capacity")
                            .increment(1);
                    }
                    return Err(e);
                }
                Ok(reservation) => {
                    metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
                    tracing::info!(id = %reservation.id, types = reservation.bikes.len(), "booking committed");
                    return Ok(reservation);
                }
            }
        }
    }

    async fn try_commit(
        &self,
        req: &BookingRequest,
        probe: &Window,
    ) -> Result<Reservation, EngineError> {
        // Phase 1: check capacity per type under read locks, snapshot versions.
        // BTreeMap iteration gives a stable sorted type order.
        let mut checked: Vec<(BikeType, u32, u64, SharedTypeState)> =
            Vec::with_capacity(req.bikes.len());
        for (bike_type, &qty) in &req.bikes {
            // Unprovisioned type: zero capacity, fail closed
            let ts_arc = self.get_type(bike_type).ok_or(EngineError::CapacityExceeded {
                bike_type: bike_type.clone(),
                date: req.dates.start,
                short_by: qty as i64,
            })?;
            let version = {
                let ts = ts_arc.read().await;
                let min = remaining_for_range(&ts, &req.dates, probe, self.buffer_min);
                if min.remaining < qty as i64 {
                    return Err(EngineError::CapacityExceeded {
                        bike_type: bike_type.clone(),
                        date: min.constraining_date,
                        short_by: qty as i64 - min.remaining,
                    });
                }
                ts.version
            };
            checked.push((bike_type.clone(), qty, version, ts_arc));
        }

        // Phase 2: take write locks in the same sorted order and verify
        // nothing moved underneath us.
        let mut guards: Vec<(u32, OwnedRwLockWriteGuard<TypeState>)> =
            Vec::with_capacity(checked.len());
        for (bike_type, qty, version, ts_arc) in checked {
            let guard = ts_arc.write_owned().await;
            if guard.version != version {
                return Err(EngineError::ConcurrencyConflict { bike_type });
            }
            guards.push((qty, guard));
        }

        let reservation = Reservation {
            id: Ulid::new(),
            plan: req.plan,
            dates: req.dates,
            start_time: req.start_time,
            bikes: req.bikes.clone(),
            addons: req.addons.clone(),
            status: ReservationStatus::Reserved,
            dropoff: req.dropoff,
            bike_numbers: Vec::new(),
            customer: req.customer.clone(),
            price: req.price,
            cancel_requested: false,
            cancel_requested_at: None,
            cancel_reason: None,
            created_at: now_ms(),
        };

        // One WAL record for the whole booking, so replay is all-or-nothing
        self.wal_append(&Event::ReservationCommitted {
            reservation: reservation.clone(),
        })
        .await?;

        self.reservations.insert(reservation.id, reservation.clone());
        for (qty, guard) in guards.iter_mut() {
            apply_reservation_to_type(guard, &reservation, *qty);
        }

        Ok(reservation)
    }

    /// Cancel a reservation, returning its capacity. Idempotent: canceling
    /// an already-canceled reservation is a no-op, never a double release.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (mut guards, current) = self.locked_reservation(id).await?;
        if current.status == ReservationStatus::Canceled {
            return Ok(current);
        }
        if !current.status.can_transition(ReservationStatus::Canceled, current.dropoff) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: ReservationStatus::Canceled,
            });
        }

        self.wal_append(&Event::StatusChanged {
            id,
            status: ReservationStatus::Canceled,
        })
        .await?;

        for guard in guards.iter_mut() {
            if let Some(&qty) = current.bikes.get(&guard.bike_type) {
                release_reservation_from_type(guard, &current, qty);
            }
        }

        let updated = {
            let mut r = self
                .reservations
                .get_mut(&id)
                .ok_or(EngineError::ReservationNotFound(id))?;
            r.status = ReservationStatus::Canceled;
            r.clone()
        };

        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
        tracing::info!(%id, "booking canceled");
        Ok(updated)
    }

    /// Move a reservation through its workflow. Transitions to `Canceled`
    /// go through [`Engine::cancel_booking`] so capacity is released.
    pub async fn update_status(
        &self,
        id: Ulid,
        next: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        if next == ReservationStatus::Canceled {
            return self.cancel_booking(id).await;
        }

        let (_guards, current) = self.locked_reservation(id).await?;
        if current.status == next {
            return Ok(current);
        }
        if !current.status.can_transition(next, current.dropoff) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }

        self.wal_append(&Event::StatusChanged { id, status: next }).await?;

        let mut r = self
            .reservations
            .get_mut(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        r.status = next;
        Ok(r.clone())
    }

    /// Record the physical unit numbers handed out at pickup.
    pub async fn assign_bike_numbers(
        &self,
        id: Ulid,
        numbers: Vec<String>,
    ) -> Result<Reservation, EngineError> {
        if numbers.len() > limits::MAX_BIKE_NUMBERS {
            return Err(EngineError::LimitExceeded("bike numbers per reservation"));
        }
        let (_guards, current) = self.locked_reservation(id).await?;
        if current.status == ReservationStatus::Canceled {
            return Err(EngineError::AlreadyCanceled(id));
        }

        self.wal_append(&Event::BikeNumbersAssigned {
            id,
            numbers: numbers.clone(),
        })
        .await?;

        let mut r = self
            .reservations
            .get_mut(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        r.bike_numbers = numbers;
        Ok(r.clone())
    }

    /// Toggle the one-way drop-off option and carry the re-priced total.
    /// Capacity is unaffected; only the workflow shape changes.
    pub async fn set_dropoff(
        &self,
        id: Ulid,
        dropoff: bool,
        total_price: i64,
    ) -> Result<Reservation, EngineError> {
        let (_guards, current) = self.locked_reservation(id).await?;
        if current.status == ReservationStatus::Canceled {
            return Err(EngineError::AlreadyCanceled(id));
        }

        self.wal_append(&Event::DropoffChanged {
            id,
            dropoff,
            total_price,
        })
        .await?;

        let mut r = self
            .reservations
            .get_mut(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        r.dropoff = dropoff;
        r.price.total_price = total_price;
        Ok(r.clone())
    }

    /// Flag a customer-initiated cancellation request for staff review.
    /// Does not release capacity — that happens when staff cancel.
    pub async fn request_cancel(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if let Some(reason) = &reason
            && reason.len() > limits::MAX_CANCEL_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("cancel reason length"));
        }
        let (_guards, current) = self.locked_reservation(id).await?;
        if current.status == ReservationStatus::Canceled {
            return Err(EngineError::AlreadyCanceled(id));
        }
        if current.cancel_requested {
            return Ok(current);
        }

        let at = now_ms();
        self.wal_append(&Event::CancelRequested {
            id,
            at,
            reason: reason.clone(),
        })
        .await?;

        let mut r = self
            .reservations
            .get_mut(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        r.cancel_requested = true;
        r.cancel_requested_at = Some(at);
        r.cancel_reason = reason;
        Ok(r.clone())
    }

    /// Create the stock row for one bike type on one date.
    pub async fn provision_stock(
        &self,
        bike_type: &BikeType,
        date: Date,
        base_quantity: u32,
    ) -> Result<(), EngineError> {
        if base_quantity > limits::MAX_BASE_QUANTITY {
            return Err(EngineError::LimitExceeded("base quantity"));
        }
        let ts_arc = self.ensure_type(bike_type);
        let mut ts = ts_arc.write_owned().await;
        if ts.stock.contains_key(&date) {
            return Err(EngineError::AlreadyProvisioned {
                bike_type: bike_type.clone(),
                date,
            });
        }

        self.wal_append(&Event::StockProvisioned {
            bike_type: bike_type.clone(),
            date,
            base_quantity,
        })
        .await?;

        ts.stock.insert(date, StockDay::new(base_quantity));
        ts.version += 1;
        Ok(())
    }

    /// Provision every date in a range at the same fleet size. Checked up
    /// front: if any date already has a row, nothing is written.
    pub async fn provision_range(
        &self,
        bike_type: &BikeType,
        dates: &DateRange,
        base_quantity: u32,
    ) -> Result<(), EngineError> {
        validate_dates(dates)?;
        if base_quantity > limits::MAX_BASE_QUANTITY {
            return Err(EngineError::LimitExceeded("base quantity"));
        }
        let ts_arc = self.ensure_type(bike_type);
        let mut ts = ts_arc.write_owned().await;
        for date in dates.iter() {
            if ts.stock.contains_key(&date) {
                return Err(EngineError::AlreadyProvisioned {
                    bike_type: bike_type.clone(),
                    date,
                });
            }
        }
        for date in dates.iter() {
            self.wal_append(&Event::StockProvisioned {
                bike_type: bike_type.clone(),
                date,
                base_quantity,
            })
            .await?;
            ts.stock.insert(date, StockDay::new(base_quantity));
        }
        ts.version += 1;
        Ok(())
    }

    /// Apply a signed manual adjustment to an existing stock row, for
    /// phone and walk-in bookings that bypass the storefront. The result
    /// may push `available` negative; that is reported, not clamped.
    pub async fn adjust_stock(
        &self,
        bike_type: &BikeType,
        date: Date,
        delta: i32,
    ) -> Result<StockReportRow, EngineError> {
        if delta == 0 {
            return Err(EngineError::InvalidQuery("zero stock adjustment"));
        }
        let ts_arc = self.get_type(bike_type).ok_or(EngineError::NoStockRow {
            bike_type: bike_type.clone(),
            date,
        })?;
        let mut ts = ts_arc.write_owned().await;
        if !ts.stock.contains_key(&date) {
            return Err(EngineError::NoStockRow {
                bike_type: bike_type.clone(),
                date,
            });
        }

        self.wal_append(&Event::StockAdjusted {
            bike_type: bike_type.clone(),
            date,
            delta,
        })
        .await?;

        let stock = ts.stock.get_mut(&date).ok_or(EngineError::NoStockRow {
            bike_type: bike_type.clone(),
            date,
        })?;
        stock.manual_adjustment = stock.manual_adjustment.saturating_add(delta);
        let row = StockReportRow {
            date,
            bike_type: bike_type.clone(),
            base_quantity: stock.base_quantity,
            manual_adjustment: stock.manual_adjustment,
            reserved: stock.reserved,
            available: stock.available(),
        };
        ts.version += 1;

        metrics::counter!(observability::STOCK_ADJUSTMENTS_TOTAL).increment(1);
        tracing::info!(%bike_type, %date, delta, available = row.available, "stock adjusted");
        Ok(row)
    }

    /// Rewrite the WAL as a minimal snapshot of current state: stock rows
    /// first, then every reservation record. `reserved` counters are not
    /// written — replay reconstructs them from the reservation records.
    ///
    /// Every mutation appends its WAL record while holding a type write
    /// lock, so taking all of them here quiesces appends for the whole
    /// snapshot-and-swap. Without that, a record acknowledged after the
    /// snapshot read could land in the old file and vanish in the rename.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let guards = loop {
            let mut keys: Vec<BikeType> = self.state.iter().map(|e| e.key().clone()).collect();
            keys.sort();
            let mut guards = Vec::with_capacity(keys.len());
            for key in &keys {
                guards.push(self.ensure_type(key).write_owned().await);
            }
            // A type provisioned while the locks were being collected
            // would slip the net; start over if one appeared
            if guards.len() == self.state.len() {
                break guards;
            }
        };

        let mut events = Vec::new();
        for ts in &guards {
            for (&date, stock) in &ts.stock {
                events.push(Event::StockProvisioned {
                    bike_type: ts.bike_type.clone(),
                    date,
                    base_quantity: stock.base_quantity,
                });
                if stock.manual_adjustment != 0 {
                    events.push(Event::StockAdjusted {
                        bike_type: ts.bike_type.clone(),
                        date,
                        delta: stock.manual_adjustment,
                    });
                }
            }
        }
        // Canceled reservations are kept as records; the replay guard skips
        // their counters.
        for entry in self.reservations.iter() {
            events.push(Event::ReservationCommitted {
                reservation: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Appends since the last compaction, for compaction scheduling.
    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// Write locks for a set of bike types in sorted order, so concurrent
    /// multi-type operations can't deadlock.
    async fn lock_types<'a>(
        &self,
        bike_types: impl Iterator<Item = &'a BikeType>,
    ) -> Vec<OwnedRwLockWriteGuard<TypeState>> {
        let mut sorted: Vec<&BikeType> = bike_types.collect();
        sorted.sort();
        let mut guards = Vec::with_capacity(sorted.len());
        for bike_type in sorted {
            let ts_arc = self.ensure_type(bike_type);
            guards.push(ts_arc.write_owned().await);
        }
        guards
    }

    /// Take the write locks for a reservation's bike types, then re-read
    /// the record. Every reservation mutation goes through here so status
    /// checks and writes serialize with cancellation and commit on the
    /// same types. Checking first and locking later would let a
    /// concurrent cancel land in between.
    async fn locked_reservation(
        &self,
        id: Ulid,
    ) -> Result<(Vec<OwnedRwLockWriteGuard<TypeState>>, Reservation), EngineError> {
        let snapshot = self
            .reservations
            .get(&id)
            .map(|r| r.clone())
            .ok_or(EngineError::ReservationNotFound(id))?;
        // The bikes map is immutable after commit, so the lock set taken
        // from the snapshot is the right one for the current record too
        let guards = self.lock_types(snapshot.bikes.keys()).await;
        let current = self
            .reservations
            .get(&id)
            .map(|r| r.clone())
            .ok_or(EngineError::ReservationNotFound(id))?;
        Ok((guards, current))
    }
}
