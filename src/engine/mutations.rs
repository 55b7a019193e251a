use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, WalCommand, apply_booking, apply_seats};

fn validate_holder(holder_id: &str) -> Result<(), EngineError> {
    if holder_id.is_empty() {
        return Err(EngineError::Invalid("holder id is empty"));
    }
    if holder_id.len() > MAX_HOLDER_ID_LEN {
        return Err(EngineError::LimitExceeded("holder id too long"));
    }
    if holder_id == SYSTEM_HOLDER || holder_id == TIMEOUT_HOLDER || holder_id == SYNC_HOLDER {
        return Err(EngineError::Invalid("holder id is reserved"));
    }
    Ok(())
}

impl Engine {
    /// Add seat records to a showtime, creating it on first use. Seat
    /// generation is a collaborator concern; this only stores the result.
    /// Initial AVAILABLE state is not broadcast.
    pub async fn create_seats(
        &self,
        room_id: Ulid,
        schedule_id: Ulid,
        seats: Vec<SeatSpec>,
    ) -> Result<usize, EngineError> {
        if seats.is_empty() {
            return Err(EngineError::Invalid("no seats in request"));
        }
        let mut fresh = HashSet::new();
        for spec in &seats {
            if spec.seat_id.is_empty() {
                return Err(EngineError::Invalid("seat id is empty"));
            }
            if spec.seat_id.len() > MAX_SEAT_ID_LEN {
                return Err(EngineError::LimitExceeded("seat id too long"));
            }
            if spec.price < 0 {
                return Err(EngineError::Invalid("negative seat price"));
            }
            if spec.price > MAX_UNIT_PRICE {
                return Err(EngineError::LimitExceeded("seat price too high"));
            }
            if !fresh.insert(spec.seat_id.as_str()) {
                return Err(EngineError::DuplicateSeat(spec.seat_id.clone()));
            }
        }

        let key = ShowtimeKey { room_id, schedule_id };
        if !self.state.contains_key(&key) && self.state.len() >= MAX_SHOWTIMES {
            return Err(EngineError::LimitExceeded("too many showtimes"));
        }
        let st = self
            .state
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(ShowtimeState::new(key))))
            .clone();

        let mut guard = st.write_owned().await;
        if guard.seats.len() + seats.len() > MAX_SEATS_PER_SHOWTIME {
            return Err(EngineError::LimitExceeded("too many seats in showtime"));
        }
        for spec in &seats {
            if guard.seats.contains_key(&spec.seat_id) {
                return Err(EngineError::DuplicateSeat(spec.seat_id.clone()));
            }
        }

        let event = Event::SeatsCreated { room_id, schedule_id, seats: seats.clone() };
        self.wal_append(&event).await?;
        apply_seats(&mut guard, &seats);
        Ok(seats.len())
    }

    /// SELECT intent. Touches only the hold cache: either the seat is
    /// unheld (or already ours, renewing the claim) and the new hold is
    /// broadcast, or the existing hold wins and *its* state is broadcast so
    /// every viewer converges on truth. Never consults the store.
    pub fn select_seat(&self, key: SeatKey, holder_id: &str) -> Result<SeatUpdate, EngineError> {
        validate_holder(holder_id)?;
        if key.seat_id.is_empty() || key.seat_id.len() > MAX_SEAT_ID_LEN {
            return Err(EngineError::Invalid("bad seat id"));
        }

        match self.holds.try_select(key.clone(), holder_id, now_ms()) {
            Ok(hold) => {
                let update = SeatUpdate::selected(&key, holder_id, hold.created_at);
                self.broadcast(&update);
                metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
                Ok(update)
            }
            Err(existing) => {
                let truth = SeatUpdate::selected(&key, &existing.holder_id, existing.created_at)
                    .with_error("seat already held");
                self.broadcast(&truth);
                metrics::counter!(observability::HOLDS_REJECTED_TOTAL).increment(1);
                Err(EngineError::SeatHeld {
                    seat_id: key.seat_id,
                    holder_id: existing.holder_id,
                })
            }
        }
    }

    /// RELEASE intent. Only the owner's release removes the hold. A foreign
    /// or absent hold mutates nothing; the resolved current truth is
    /// broadcast instead and the caller sees a zero-row delete.
    pub fn release_seat(&self, key: SeatKey, holder_id: &str) -> Result<bool, EngineError> {
        validate_holder(holder_id)?;

        if self.holds.remove_if_holder(&key, holder_id).is_some() {
            let update = SeatUpdate::available(&key, holder_id, now_ms());
            self.broadcast(&update);
            metrics::counter!(observability::HOLDS_RELEASED_TOTAL).increment(1);
            return Ok(true);
        }

        let reason = if self.holds.get(&key).is_some() {
            "hold owned by another session"
        } else {
            "no hold to release"
        };
        let truth = self.resolve_seat(&key).with_error(reason);
        self.broadcast(&truth);
        Ok(false)
    }

    /// Commit a booking: validate membership, lock the showtime, verify
    /// every seat still AVAILABLE, then durably write seats, aggregate, and
    /// food as one WAL record. Hold invalidation and BOOKED broadcasts
    /// happen after the lock drops. Any failure leaves everything untouched.
    ///
    /// Hold ownership is deliberately not checked; whoever pays for an
    /// AVAILABLE seat gets it, and the broadcasts correct stale views.
    pub async fn commit_booking(
        &self,
        req: BookingRequest,
    ) -> Result<BookingAggregate, EngineError> {
        if req.seat_ids.is_empty() {
            return Err(EngineError::Invalid("booking has no seats"));
        }
        if req.seat_ids.len() > MAX_SEATS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many seats in booking"));
        }
        if req.purchaser.is_empty() {
            return Err(EngineError::Invalid("purchaser is empty"));
        }
        if req.purchaser.len() > MAX_PURCHASER_LEN {
            return Err(EngineError::LimitExceeded("purchaser too long"));
        }
        if req.food.len() > MAX_FOOD_LINES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many food lines"));
        }
        for line in &req.food {
            if line.name.is_empty() || line.qty == 0 {
                return Err(EngineError::Invalid("bad food line"));
            }
            if line.name.len() > MAX_FOOD_NAME_LEN {
                return Err(EngineError::LimitExceeded("food name too long"));
            }
            if line.qty > MAX_FOOD_QTY {
                return Err(EngineError::LimitExceeded("food qty too large"));
            }
            if line.unit_price < 0 {
                return Err(EngineError::Invalid("negative food price"));
            }
            if line.unit_price > MAX_UNIT_PRICE {
                return Err(EngineError::LimitExceeded("food price too high"));
            }
        }
        let mut distinct: Vec<&str> = req.seat_ids.iter().map(String::as_str).collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != req.seat_ids.len() {
            return Err(EngineError::Invalid("duplicate seats in booking"));
        }
        if self.bookings.contains_key(&req.id) {
            return Err(EngineError::BookingExists(req.id));
        }

        let showtime = ShowtimeKey { room_id: req.room_id, schedule_id: req.schedule_id };
        let st = self.get_showtime(&showtime).ok_or(EngineError::UnknownShowtime {
            room_id: req.room_id,
            schedule_id: req.schedule_id,
        })?;
        let mut guard = st.write_owned().await;

        // Rechecked under the lock: a racing commit may have won meanwhile.
        if self.bookings.contains_key(&req.id) {
            return Err(EngineError::BookingExists(req.id));
        }

        let unknown: Vec<String> = req
            .seat_ids
            .iter()
            .filter(|id| !guard.seats.contains_key(*id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(EngineError::UnknownSeats(unknown));
        }

        let conflicted: Vec<String> = req
            .seat_ids
            .iter()
            .filter(|id| guard.seat_status(id) == Some(SeatStatus::Booked))
            .cloned()
            .collect();
        if !conflicted.is_empty() {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SeatsConflict(conflicted));
        }

        let seats: Vec<BookedSeat> = req
            .seat_ids
            .iter()
            .map(|id| BookedSeat {
                seat_id: id.clone(),
                price: guard.seats[id].price,
            })
            .collect();
        let total = seats.iter().map(|s| s.price).sum::<Cents>()
            + req.food.iter().map(FoodLine::subtotal).sum::<Cents>();
        let booking = BookingAggregate {
            id: req.id,
            code: booking_code(&req.id),
            purchaser: req.purchaser,
            room_id: req.room_id,
            schedule_id: req.schedule_id,
            seats,
            food: req.food,
            total,
            payment: PaymentState::default(),
            created_at: now_ms(),
        };

        let event = Event::BookingCommitted { booking: booking.clone() };
        self.wal_append(&event).await?;
        apply_booking(&mut guard, &booking);
        self.bookings.insert(booking.id, booking.clone());
        drop(guard);

        // Sold seats carry no holds, whoever placed them.
        for seat in &booking.seats {
            let key = SeatKey::new(booking.room_id, booking.schedule_id, seat.seat_id.clone());
            self.holds.remove(&key);
            self.broadcast(&SeatUpdate::booked(&key, &booking.purchaser, booking.created_at));
        }
        metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        metrics::counter!(observability::SEATS_SOLD_TOTAL).increment(booking.seats.len() as u64);

        Ok(booking)
    }

    /// Record the payment outcome reported by the payment collaborator.
    /// Accepts SUCCESS or FAILED; the pending state never arrives from
    /// outside.
    pub async fn finalize_payment(
        &self,
        booking_id: Ulid,
        payment_id: &str,
        status: PaymentStatus,
    ) -> Result<(), EngineError> {
        if payment_id.is_empty() {
            return Err(EngineError::Invalid("payment id is empty"));
        }
        if payment_id.len() > MAX_PAYMENT_ID_LEN {
            return Err(EngineError::LimitExceeded("payment id too long"));
        }
        if status == PaymentStatus::Pending {
            return Err(EngineError::Invalid("payment status must be SUCCESS or FAILED"));
        }
        if !self.bookings.contains_key(&booking_id) {
            return Err(EngineError::UnknownBooking(booking_id));
        }

        let event = Event::PaymentFinalized {
            booking_id,
            payment_id: payment_id.to_string(),
            status,
        };
        self.wal_append(&event).await?;
        if let Some(mut booking) = self.bookings.get_mut(&booking_id) {
            booking.payment.status = status;
            booking.payment.payment_id = Some(payment_id.to_string());
        }
        Ok(())
    }

    /// Rewrite the WAL as the minimal event set recreating current state:
    /// one SeatsCreated per showtime, then one BookingCommitted per
    /// aggregate (which re-marks its seats and carries final payment state).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let showtimes: Vec<super::SharedShowtimeState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        for st in showtimes {
            let guard = st.read().await;
            events.push(Event::SeatsCreated {
                room_id: guard.room_id,
                schedule_id: guard.schedule_id,
                seats: guard
                    .seats
                    .values()
                    .map(|r| SeatSpec { seat_id: r.seat_id.clone(), price: r.price })
                    .collect(),
            });
        }
        for entry in self.bookings.iter() {
            events.push(Event::BookingCommitted { booking: entry.value().clone() });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
