mod error;
mod mutations;
mod queries;

pub use error::EngineError;
pub use queries::StoreStatus;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::holds::HoldCache;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedShowtimeState = Arc<RwLock<ShowtimeState>>;

// ── group-commit WAL channel ────────────────────────────────────────────────

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

/// Background task owning the WAL, batching appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. One flush_sync for the whole batch.
/// 5. Answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch before the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── engine ──────────────────────────────────────────────────────────────────

/// One tenant's seat store plus its hold cache and broadcast hub. Seat
/// records and booking aggregates are durable through the WAL; the hold
/// cache is injected and purely in-memory.
pub struct Engine {
    pub state: DashMap<ShowtimeKey, SharedShowtimeState>,
    pub(super) bookings: DashMap<Ulid, BookingAggregate>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub holds: Arc<HoldCache>,
}

/// Add seat records to a showtime. Caller holds the lock.
fn apply_seats(state: &mut ShowtimeState, seats: &[SeatSpec]) {
    for spec in seats {
        state.seats.insert(
            spec.seat_id.clone(),
            SeatRecord {
                seat_id: spec.seat_id.clone(),
                price: spec.price,
                status: SeatStatus::Available,
                booking_id: None,
            },
        );
    }
}

/// Mark a booking's seats sold. Caller holds the lock.
fn apply_booking(state: &mut ShowtimeState, booking: &BookingAggregate) {
    for seat in &booking.seats {
        if let Some(record) = state.seats.get_mut(&seat.seat_id) {
            record.status = SeatStatus::Booked;
            record.booking_id = Some(booking.id);
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        holds: Arc<HoldCache>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            bookings: DashMap::new(),
            wal_tx,
            notify,
            holds,
        };

        // Replay. We are the sole owner of every Arc here, so try_write always
        // succeeds. Never blocking_write: this may run inside an async context
        // (lazy tenant creation).
        for event in &events {
            match event {
                Event::SeatsCreated { room_id, schedule_id, seats } => {
                    let key = ShowtimeKey { room_id: *room_id, schedule_id: *schedule_id };
                    let entry = engine
                        .state
                        .entry(key)
                        .or_insert_with(|| Arc::new(RwLock::new(ShowtimeState::new(key))))
                        .clone();
                    let mut guard = entry.try_write().expect("replay: uncontended write");
                    apply_seats(&mut guard, seats);
                }
                Event::BookingCommitted { booking } => {
                    if let Some(entry) = engine.state.get(&booking.showtime()) {
                        let st = entry.clone();
                        let mut guard = st.try_write().expect("replay: uncontended write");
                        apply_booking(&mut guard, booking);
                    }
                    engine.bookings.insert(booking.id, booking.clone());
                }
                Event::PaymentFinalized { booking_id, payment_id, status } => {
                    if let Some(mut booking) = engine.bookings.get_mut(booking_id) {
                        booking.payment.status = *status;
                        booking.payment.payment_id = Some(payment_id.clone());
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write an event through the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_showtime(&self, key: &ShowtimeKey) -> Option<SharedShowtimeState> {
        self.state.get(key).map(|e| e.value().clone())
    }

    /// Publish a seat update on its showtime topic.
    pub fn broadcast(&self, update: &SeatUpdate) {
        metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL).increment(1);
        self.notify.send(&update.topic(), update);
    }
}
