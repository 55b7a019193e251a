use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Persisted status as the non-blocking probes report it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreStatus {
    Available,
    Booked,
    /// No record for the seat (or its whole showtime).
    Missing,
    /// A commit holds the showtime lock right now.
    Locked,
}

fn record_status(guard: &ShowtimeState, seat_id: &str) -> StoreStatus {
    match guard.seat_status(seat_id) {
        Some(SeatStatus::Booked) => StoreStatus::Booked,
        Some(SeatStatus::Available) => StoreStatus::Available,
        None => StoreStatus::Missing,
    }
}

impl Engine {
    /// Current truth for one seat: a live hold wins, then the persisted
    /// record, then AVAILABLE for seats we know nothing about. Store access
    /// is try_read so the answer never waits on a commit; a locked showtime
    /// reads as AVAILABLE and the commit's own broadcast corrects it a
    /// moment later.
    pub fn resolve_seat(&self, key: &SeatKey) -> SeatUpdate {
        if let Some(hold) = self.holds.get(key) {
            return SeatUpdate::selected(key, &hold.holder_id, hold.created_at);
        }
        match self.store_status(key) {
            StoreStatus::Booked => SeatUpdate::booked(key, SYSTEM_HOLDER, now_ms()),
            StoreStatus::Available | StoreStatus::Missing | StoreStatus::Locked => {
                SeatUpdate::available(key, SYSTEM_HOLDER, now_ms())
            }
        }
    }

    /// Non-blocking persisted status for one seat.
    pub fn store_status(&self, key: &SeatKey) -> StoreStatus {
        let Some(st) = self.get_showtime(&key.showtime()) else {
            return StoreStatus::Missing;
        };
        match st.try_read() {
            Ok(guard) => record_status(&guard, &key.seat_id),
            Err(_) => StoreStatus::Locked,
        }
    }

    /// One try_read batch of persisted statuses for a whole showtime. None
    /// while a commit holds the lock (the reconciliation sweep retries next
    /// cycle); a missing showtime reports every seat Missing.
    pub fn try_showtime_statuses(
        &self,
        showtime: &ShowtimeKey,
        seat_ids: &[String],
    ) -> Option<Vec<(String, StoreStatus)>> {
        let Some(st) = self.get_showtime(showtime) else {
            return Some(
                seat_ids
                    .iter()
                    .map(|s| (s.clone(), StoreStatus::Missing))
                    .collect(),
            );
        };
        let guard = st.try_read().ok()?;
        Some(
            seat_ids
                .iter()
                .map(|s| (s.clone(), record_status(&guard, s)))
                .collect(),
        )
    }

    /// The seating chart: every record of the showtime overlaid with live
    /// holds, in seat order.
    pub async fn seat_map(
        &self,
        room_id: Ulid,
        schedule_id: Ulid,
    ) -> Result<Vec<SeatInfo>, EngineError> {
        let key = ShowtimeKey { room_id, schedule_id };
        let st = self
            .get_showtime(&key)
            .ok_or(EngineError::UnknownShowtime { room_id, schedule_id })?;
        let guard = st.read().await;

        let rows = guard
            .seats
            .values()
            .map(|record| {
                let seat_key = SeatKey::new(room_id, schedule_id, record.seat_id.clone());
                match self.holds.get(&seat_key) {
                    Some(hold) => SeatInfo {
                        seat_id: record.seat_id.clone(),
                        price: record.price,
                        status: BroadcastStatus::Selected,
                        holder_id: hold.holder_id,
                        booking_id: record.booking_id,
                    },
                    None => SeatInfo {
                        seat_id: record.seat_id.clone(),
                        price: record.price,
                        status: match record.status {
                            SeatStatus::Booked => BroadcastStatus::Booked,
                            SeatStatus::Available => BroadcastStatus::Available,
                        },
                        holder_id: SYSTEM_HOLDER.to_string(),
                        booking_id: record.booking_id,
                    },
                }
            })
            .collect();
        Ok(rows)
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<BookingAggregate> {
        self.bookings.get(id).map(|b| b.value().clone())
    }

    /// Active holds for one showtime, in seat order.
    pub fn list_holds(&self, showtime: &ShowtimeKey) -> Vec<HoldInfo> {
        let now = now_ms();
        let mut rows: Vec<HoldInfo> = self
            .holds
            .snapshot_keys()
            .into_iter()
            .filter(|key| key.showtime() == *showtime)
            .filter_map(|key| {
                self.holds.get(&key).map(|hold| HoldInfo {
                    seat_id: key.seat_id,
                    holder_id: hold.holder_id,
                    created_at: hold.created_at,
                    age_ms: now - hold.created_at,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.seat_id.cmp(&b.seat_id));
        rows
    }

    /// Occupancy summary per showtime. Held counts only seats whose record
    /// is still AVAILABLE, so the three buckets sum to the seat count.
    pub async fn list_showtimes(&self) -> Vec<ShowtimeInfo> {
        let mut held_by_showtime: HashMap<ShowtimeKey, Vec<String>> = HashMap::new();
        for key in self.holds.snapshot_keys() {
            held_by_showtime.entry(key.showtime()).or_default().push(key.seat_id);
        }

        let showtimes: Vec<super::SharedShowtimeState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::with_capacity(showtimes.len());
        for st in showtimes {
            let guard = st.read().await;
            let booked = guard
                .seats
                .values()
                .filter(|r| r.status == SeatStatus::Booked)
                .count();
            let held = held_by_showtime
                .get(&guard.key())
                .map(|seats| {
                    seats
                        .iter()
                        .filter(|s| guard.seat_status(s) == Some(SeatStatus::Available))
                        .count()
                })
                .unwrap_or(0);
            rows.push(ShowtimeInfo {
                room_id: guard.room_id,
                schedule_id: guard.schedule_id,
                seats: guard.seats.len(),
                available: guard.seats.len() - booked - held,
                held,
                booked,
            });
        }
        rows.sort_by(|a, b| (a.room_id, a.schedule_id).cmp(&(b.room_id, b.schedule_id)));
        rows
    }
}
