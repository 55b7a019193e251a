//! Hard caps validated at the edges. Exceeding any of these is a client
//! error, not a capacity planning knob.

/// Distinct databases (tenants) a single process will serve.
pub const MAX_TENANTS: usize = 64;

/// Tenant names become WAL file names; stay well under OS filename limits.
pub const MAX_TENANT_NAME_LEN: usize = 120;

/// Showtimes per tenant.
pub const MAX_SHOWTIMES: usize = 4_096;

/// Seats per showtime. The largest real auditoriums run a few hundred.
pub const MAX_SEATS_PER_SHOWTIME: usize = 1_024;

/// Seat labels like "A7" or "K14".
pub const MAX_SEAT_ID_LEN: usize = 16;

/// Unit price cap for seats and food, in cents. Keeps any booking total
/// well inside i64.
pub const MAX_UNIT_PRICE: i64 = 100_000_000;

/// Session-scoped holder identifiers.
pub const MAX_HOLDER_ID_LEN: usize = 128;

pub const MAX_PURCHASER_LEN: usize = 128;

/// Seats in a single booking.
pub const MAX_SEATS_PER_BOOKING: usize = 10;

pub const MAX_FOOD_LINES_PER_BOOKING: usize = 20;

pub const MAX_FOOD_NAME_LEN: usize = 64;

pub const MAX_FOOD_QTY: u32 = 99;

pub const MAX_PAYMENT_ID_LEN: usize = 128;
