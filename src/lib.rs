//! Seat-level booking engine behind a PostgreSQL wire facade.
//!
//! Clients speak regular SQL over pgwire: seat maps and bookings live in a
//! WAL-backed store, while seat holds stay in a per-tenant in-memory cache
//! that a restart wipes. Every state change fans out over LISTEN/NOTIFY
//! channels named `seats/{roomId}/{scheduleId}`.

pub mod auth;
pub mod engine;
pub mod holds;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod sweep;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
