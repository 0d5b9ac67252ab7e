mod availability;
mod error;
mod mutations;
mod queries;
mod validate;

pub use availability::{
    business_day, peak_timed_load, remaining_for_date, remaining_for_range, RangeRemaining,
};
pub use error::EngineError;
pub use validate::{addons_from_json, bikes_from_json};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::calendar::HolidayCalendar;
use crate::limits;
use crate::model::*;
use crate::wal::Wal;

pub type SharedTypeState = Arc<RwLock<TypeState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task owning the WAL. The first append opens a batch,
/// everything already queued behind it joins, and the whole batch gets
/// one fsync before anyone is answered. Under a burst of bookings that
/// amortizes the fsync across the burst; an idle engine still pays one
/// fsync per event. Control commands run between batches.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                control => {
                    // Settle the open batch before the control command so
                    // it sees every acknowledged record on disk
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

/// Buffer the whole batch, fsync once, answer every waiter with the
/// shared outcome.
fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut outcome = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            outcome = Err(e);
            break;
        }
    }
    // Flush even after a failed append, or bytes buffered for this batch
    // would ride along with the next one after its waiters were told it
    // failed
    let flushed = wal.flush_sync();
    let outcome = outcome.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, waiter) in batch {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = waiter.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched in the writer loop"),
    }
}

/// Consume a reservation's capacity in one bike type's state. Caller holds
/// the write lock; `qty` is the reservation's quantity of this type.
pub(super) fn apply_reservation_to_type(ts: &mut TypeState, r: &Reservation, qty: u32) {
    if r.plan.uses_reserved_counter() {
        for date in r.dates.iter() {
            if let Some(stock) = ts.stock.get_mut(&date) {
                stock.reserved += qty;
            }
        }
    }
    ts.insert_slice(ActiveSlice {
        reservation_id: r.id,
        plan: r.plan,
        dates: r.dates,
        start_time: r.start_time,
        qty,
    });
    ts.version += 1;
}

/// Undo [`apply_reservation_to_type`]. Saturating so a counter damaged by
/// operator intervention can't underflow on cancel.
pub(super) fn release_reservation_from_type(ts: &mut TypeState, r: &Reservation, qty: u32) {
    if r.plan.uses_reserved_counter() {
        for date in r.dates.iter() {
            if let Some(stock) = ts.stock.get_mut(&date) {
                stock.reserved = stock.reserved.saturating_sub(qty);
            }
        }
    }
    ts.remove_slice(r.id);
    ts.version += 1;
}

pub struct Engine {
    /// Contended availability state, one lock domain per bike type.
    pub(super) state: DashMap<BikeType, SharedTypeState>,
    /// Full reservation records by id. Terminal statuses stay here.
    pub(super) reservations: DashMap<Ulid, Reservation>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) calendar: Option<Arc<HolidayCalendar>>,
    pub(super) buffer_min: Min,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_options(wal_path, None, limits::DEFAULT_BUFFER_MIN)
    }

    pub fn with_options(
        wal_path: PathBuf,
        calendar: Option<Arc<HolidayCalendar>>,
        buffer_min: Min,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            reservations: DashMap::new(),
            wal_tx,
            calendar,
            buffer_min,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::StockProvisioned {
                bike_type,
                date,
                base_quantity,
            } => {
                let ts_arc = self.ensure_type(bike_type);
                let mut ts = ts_arc.try_write().expect("replay: uncontended write");
                ts.stock.insert(*date, StockDay::new(*base_quantity));
            }
            Event::StockAdjusted { bike_type, date, delta } => {
                let ts_arc = self.ensure_type(bike_type);
                let mut ts = ts_arc.try_write().expect("replay: uncontended write");
                if let Some(stock) = ts.stock.get_mut(date) {
                    stock.manual_adjustment = stock.manual_adjustment.saturating_add(*delta);
                }
            }
            Event::ReservationCommitted { reservation } => {
                if reservation.status.is_active() {
                    for (bike_type, &qty) in &reservation.bikes {
                        let ts_arc = self.ensure_type(bike_type);
                        let mut ts = ts_arc.try_write().expect("replay: uncontended write");
                        apply_reservation_to_type(&mut ts, reservation, qty);
                    }
                }
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::StatusChanged { id, status } => {
                let Some(mut r) = self.reservations.get_mut(id) else {
                    return;
                };
                let was_active = r.status.is_active();
                r.status = *status;
                if was_active && !status.is_active() {
                    let snapshot = r.clone();
                    drop(r);
                    for (bike_type, &qty) in &snapshot.bikes {
                        let ts_arc = self.ensure_type(bike_type);
                        let mut ts = ts_arc.try_write().expect("replay: uncontended write");
                        release_reservation_from_type(&mut ts, &snapshot, qty);
                    }
                }
            }
            Event::BikeNumbersAssigned { id, numbers } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.bike_numbers = numbers.clone();
                }
            }
            Event::DropoffChanged { id, dropoff, total_price } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.dropoff = *dropoff;
                    r.price.total_price = *total_price;
                }
            }
            Event::CancelRequested { id, at, reason } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.cancel_requested = true;
                    r.cancel_requested_at = Some(*at);
                    r.cancel_reason = reason.clone();
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_type(&self, bike_type: &BikeType) -> Option<SharedTypeState> {
        self.state.get(bike_type).map(|e| e.value().clone())
    }

    pub(super) fn ensure_type(&self, bike_type: &BikeType) -> SharedTypeState {
        self.state
            .entry(bike_type.clone())
            .or_insert_with(|| Arc::new(RwLock::new(TypeState::new(bike_type.clone()))))
            .value()
            .clone()
    }
}
