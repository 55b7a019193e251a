use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    UnknownShowtime {
        room_id: Ulid,
        schedule_id: Ulid,
    },
    /// Seats named in a request that are not part of the showtime.
    UnknownSeats(Vec<String>),
    DuplicateSeat(String),
    /// SELECT rejected: the seat is held by someone else.
    SeatHeld {
        seat_id: String,
        holder_id: String,
    },
    /// Commit rejected: these seats are already sold.
    SeatsConflict(Vec<String>),
    BookingExists(Ulid),
    UnknownBooking(Ulid),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnknownShowtime { room_id, schedule_id } => {
                write!(f, "unknown showtime: room {room_id} schedule {schedule_id}")
            }
            EngineError::UnknownSeats(seats) => {
                write!(f, "seats not in showtime: {}", seats.join(", "))
            }
            EngineError::DuplicateSeat(seat) => write!(f, "seat already exists: {seat}"),
            EngineError::SeatHeld { seat_id, holder_id } => {
                write!(f, "seat {seat_id} already held by {holder_id}")
            }
            EngineError::SeatsConflict(seats) => {
                write!(f, "seats already booked: {}", seats.join(", "))
            }
            EngineError::BookingExists(id) => write!(f, "booking already exists: {id}"),
            EngineError::UnknownBooking(id) => write!(f, "unknown booking: {id}"),
            EngineError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
