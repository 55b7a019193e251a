use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Money in integer cents.
pub type Cents = i64;

pub fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Holder recorded when a status is derived from the store rather than a
/// client action.
pub const SYSTEM_HOLDER: &str = "system";
/// Holder stamped on availability broadcasts produced by the expiry sweep.
pub const TIMEOUT_HOLDER: &str = "system-timeout";
/// Holder stamped on corrections produced by the reconciliation sweep.
pub const SYNC_HOLDER: &str = "system-sync";

// ── keys ────────────────────────────────────────────────────────────────────

/// One seat within one showtime. The hold cache is keyed by this.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SeatKey {
    pub room_id: Ulid,
    pub schedule_id: Ulid,
    pub seat_id: String,
}

impl SeatKey {
    pub fn new(room_id: Ulid, schedule_id: Ulid, seat_id: impl Into<String>) -> Self {
        Self { room_id, schedule_id, seat_id: seat_id.into() }
    }

    pub fn showtime(&self) -> ShowtimeKey {
        ShowtimeKey { room_id: self.room_id, schedule_id: self.schedule_id }
    }

    /// Broadcast channel for this seat's showtime.
    pub fn topic(&self) -> String {
        self.showtime().topic()
    }
}

/// A (room, schedule) pair. Seat records and commit locks are grouped by it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShowtimeKey {
    pub room_id: Ulid,
    pub schedule_id: Ulid,
}

impl ShowtimeKey {
    pub fn topic(&self) -> String {
        format!("seats/{}/{}", self.room_id, self.schedule_id)
    }
}

// ── persisted state ─────────────────────────────────────────────────────────

/// Durable status of a seat record. `Available -> Booked` is one-way; holds
/// never appear here.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Booked,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeatRecord {
    pub seat_id: String,
    pub price: Cents,
    pub status: SeatStatus,
    pub booking_id: Option<Ulid>,
}

/// Seat definition supplied at creation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeatSpec {
    pub seat_id: String,
    pub price: Cents,
}

/// Every seat record of one showtime, guarded by a single RwLock. Booking
/// commits take it exclusively; handler and sweep reads use try_read so
/// they never queue behind a commit.
#[derive(Clone, Debug)]
pub struct ShowtimeState {
    pub room_id: Ulid,
    pub schedule_id: Ulid,
    /// Keyed by seat label; BTreeMap keeps seat-map listings deterministic.
    pub seats: std::collections::BTreeMap<String, SeatRecord>,
}

impl ShowtimeState {
    pub fn new(key: ShowtimeKey) -> Self {
        Self {
            room_id: key.room_id,
            schedule_id: key.schedule_id,
            seats: std::collections::BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ShowtimeKey {
        ShowtimeKey { room_id: self.room_id, schedule_id: self.schedule_id }
    }

    pub fn seat_status(&self, seat_id: &str) -> Option<SeatStatus> {
        self.seats.get(seat_id).map(|r| r.status)
    }
}

// ── holds ───────────────────────────────────────────────────────────────────

/// An in-memory claim on a seat. Never persisted; a restart clears them all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hold {
    pub holder_id: String,
    pub created_at: Ms,
}

impl Hold {
    pub fn expired(&self, ttl_ms: Ms, now: Ms) -> bool {
        now - self.created_at >= ttl_ms
    }
}

// ── bookings ────────────────────────────────────────────────────────────────

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentState {
    pub status: PaymentStatus,
    pub payment_id: Option<String>,
}

impl Default for PaymentState {
    fn default() -> Self {
        Self { status: PaymentStatus::Pending, payment_id: None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookedSeat {
    pub seat_id: String,
    pub price: Cents,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FoodLine {
    pub name: String,
    pub qty: u32,
    pub unit_price: Cents,
}

impl FoodLine {
    pub fn subtotal(&self) -> Cents {
        self.unit_price * self.qty as Cents
    }
}

/// Everything a confirmed purchase carries. Immutable after commit except
/// the payment fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookingAggregate {
    pub id: Ulid,
    pub code: String,
    pub purchaser: String,
    pub room_id: Ulid,
    pub schedule_id: Ulid,
    pub seats: Vec<BookedSeat>,
    pub food: Vec<FoodLine>,
    pub total: Cents,
    pub payment: PaymentState,
    pub created_at: Ms,
}

impl BookingAggregate {
    pub fn showtime(&self) -> ShowtimeKey {
        ShowtimeKey { room_id: self.room_id, schedule_id: self.schedule_id }
    }
}

/// Human-facing confirmation code, the random tail of the booking ulid.
pub fn booking_code(id: &Ulid) -> String {
    let s = id.to_string();
    s[s.len() - 8..].to_string()
}

/// Commit input as parsed off the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub purchaser: String,
    pub room_id: Ulid,
    pub schedule_id: Ulid,
    pub seat_ids: Vec<String>,
    pub food: Vec<FoodLine>,
}

// ── write-ahead log records ─────────────────────────────────────────────────

/// Durable events. Holds are deliberately absent: the hold cache starts
/// empty on every boot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SeatsCreated {
        room_id: Ulid,
        schedule_id: Ulid,
        seats: Vec<SeatSpec>,
    },
    BookingCommitted {
        booking: BookingAggregate,
    },
    PaymentFinalized {
        booking_id: Ulid,
        payment_id: String,
        status: PaymentStatus,
    },
}

// ── query rows ──────────────────────────────────────────────────────────────

/// One row of the seating chart: persisted record overlaid with any hold.
#[derive(Clone, Debug, PartialEq)]
pub struct SeatInfo {
    pub seat_id: String,
    pub price: Cents,
    pub status: BroadcastStatus,
    pub holder_id: String,
    pub booking_id: Option<Ulid>,
}

/// One active hold as reported by the holds listing.
#[derive(Clone, Debug, PartialEq)]
pub struct HoldInfo {
    pub seat_id: String,
    pub holder_id: String,
    pub created_at: Ms,
    pub age_ms: Ms,
}

/// Per-showtime occupancy summary.
#[derive(Clone, Debug, PartialEq)]
pub struct ShowtimeInfo {
    pub room_id: Ulid,
    pub schedule_id: Ulid,
    pub seats: usize,
    pub available: usize,
    pub held: usize,
    pub booked: usize,
}

// ── broadcast payload ───────────────────────────────────────────────────────

/// Resolved seat view carried by broadcasts. `Selected` exists only here;
/// the store never records it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastStatus {
    Available,
    Selected,
    Booked,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Available => "AVAILABLE",
            BroadcastStatus::Selected => "SELECTED",
            BroadcastStatus::Booked => "BOOKED",
        }
    }
}

/// The NOTIFY payload, one per seat status change. Field names are part of
/// the wire contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatUpdate {
    pub seat_id: String,
    pub room_id: Ulid,
    pub schedule_id: Ulid,
    pub status: BroadcastStatus,
    pub holder_id: String,
    pub timestamp_millis: Ms,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl SeatUpdate {
    fn new(key: &SeatKey, status: BroadcastStatus, holder_id: &str, at: Ms) -> Self {
        Self {
            seat_id: key.seat_id.clone(),
            room_id: key.room_id,
            schedule_id: key.schedule_id,
            status,
            holder_id: holder_id.to_string(),
            timestamp_millis: at,
            error: None,
        }
    }

    pub fn selected(key: &SeatKey, holder_id: &str, at: Ms) -> Self {
        Self::new(key, BroadcastStatus::Selected, holder_id, at)
    }

    pub fn available(key: &SeatKey, holder_id: &str, at: Ms) -> Self {
        Self::new(key, BroadcastStatus::Available, holder_id, at)
    }

    pub fn booked(key: &SeatKey, holder_id: &str, at: Ms) -> Self {
        Self::new(key, BroadcastStatus::Booked, holder_id, at)
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    pub fn key(&self) -> SeatKey {
        SeatKey::new(self.room_id, self.schedule_id, self.seat_id.clone())
    }

    pub fn topic(&self) -> String {
        ShowtimeKey { room_id: self.room_id, schedule_id: self.schedule_id }.topic()
    }
}
