use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, StoreStatus};
use crate::model::{Ms, SYNC_HOLDER, SeatKey, SeatUpdate, ShowtimeKey, TIMEOUT_HOLDER, now_ms};
use crate::observability;

/// Timing knobs for the per-tenant background tasks.
#[derive(Clone, Copy, Debug)]
pub struct SweepConfig {
    pub hold_ttl_ms: Ms,
    pub expiry_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 5 * 60 * 1_000,
            expiry_interval: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExpiryStats {
    /// Holds removed and announced AVAILABLE.
    pub expired: usize,
    /// Holds dropped without a broadcast because the seat had been sold.
    pub suppressed: usize,
    /// Holds left for the next cycle (lock contention or re-held).
    pub skipped: usize,
}

/// One expiry pass over the hold snapshot. Store reads never block; a
/// contended showtime defers its holds to the next tick.
pub fn expire_holds_once(engine: &Engine, ttl_ms: Ms, now: Ms) -> ExpiryStats {
    let mut stats = ExpiryStats::default();
    for key in engine.holds.snapshot_keys() {
        let Some(hold) = engine.holds.get(&key) else {
            continue;
        };
        if !hold.expired(ttl_ms, now) {
            continue;
        }
        match engine.store_status(&key) {
            StoreStatus::Booked => {
                // The sale outranks the timeout: no availability broadcast.
                if engine.holds.remove_if_stamped(&key, &hold) {
                    stats.suppressed += 1;
                    metrics::counter!(observability::EXPIRY_SUPPRESSED_TOTAL).increment(1);
                } else {
                    stats.skipped += 1;
                }
            }
            StoreStatus::Locked => {
                stats.skipped += 1;
            }
            StoreStatus::Available | StoreStatus::Missing => {
                // Stamped delete: a seat re-held since the snapshot stays.
                if engine.holds.remove_if_stamped(&key, &hold) {
                    engine.broadcast(&SeatUpdate::available(&key, TIMEOUT_HOLDER, now));
                    stats.expired += 1;
                    metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
                } else {
                    stats.skipped += 1;
                }
            }
        }
    }
    metrics::gauge!(observability::HOLDS_ACTIVE).set(engine.holds.len() as f64);
    stats
}

/// Background task releasing timed-out holds.
pub async fn run_expiry_sweep(engine: Arc<Engine>, cfg: SweepConfig) {
    let mut interval = tokio::time::interval(cfg.expiry_interval);
    loop {
        interval.tick().await;
        let stats = expire_holds_once(&engine, cfg.hold_ttl_ms, now_ms());
        if stats.expired > 0 || stats.suppressed > 0 {
            info!(
                "expiry sweep: {} expired, {} suppressed by sales",
                stats.expired, stats.suppressed
            );
        }
        if stats.skipped > 0 {
            debug!("expiry sweep deferred {} holds", stats.skipped);
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Holds evicted from sold seats, BOOKED re-broadcast.
    pub corrected: usize,
    /// Holds on seats the store does not know; evicted and logged.
    pub inconsistent: usize,
    /// Showtimes skipped because a commit held the lock.
    pub deferred: usize,
}

/// One reconciliation pass: group held seats by showtime, read each
/// showtime's persisted truth in one non-blocking batch, and line the cache
/// up with it. After an undeferred pass no hold remains on a sold seat.
pub fn reconcile_once(engine: &Engine) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    let mut by_showtime: HashMap<ShowtimeKey, Vec<String>> = HashMap::new();
    for key in engine.holds.snapshot_keys() {
        by_showtime.entry(key.showtime()).or_default().push(key.seat_id);
    }

    let now = now_ms();
    for (showtime, seat_ids) in by_showtime {
        let Some(statuses) = engine.try_showtime_statuses(&showtime, &seat_ids) else {
            stats.deferred += 1;
            debug!(
                "reconcile: showtime {}/{} busy, retrying next cycle",
                showtime.room_id, showtime.schedule_id
            );
            continue;
        };
        for (seat_id, status) in statuses {
            let key = SeatKey::new(showtime.room_id, showtime.schedule_id, seat_id);
            match status {
                StoreStatus::Booked => {
                    if engine.holds.remove(&key).is_some() {
                        engine.broadcast(&SeatUpdate::booked(&key, SYNC_HOLDER, now));
                        stats.corrected += 1;
                        metrics::counter!(observability::RECONCILE_CORRECTED_TOTAL).increment(1);
                    }
                }
                StoreStatus::Missing => {
                    if engine.holds.remove(&key).is_some() {
                        warn!(
                            "reconcile: hold on unknown seat {} in {}/{}, evicted",
                            key.seat_id, key.room_id, key.schedule_id
                        );
                        stats.inconsistent += 1;
                        metrics::counter!(observability::RECONCILE_INCONSISTENT_TOTAL).increment(1);
                    }
                }
                StoreStatus::Available | StoreStatus::Locked => {}
            }
        }
    }
    metrics::gauge!(observability::HOLDS_ACTIVE).set(engine.holds.len() as f64);
    stats
}

/// Background task realigning the hold cache with the seat store.
pub async fn run_reconciliation_sweep(engine: Arc<Engine>, cfg: SweepConfig) {
    let mut interval = tokio::time::interval(cfg.reconcile_interval);
    loop {
        interval.tick().await;
        let stats = reconcile_once(&engine);
        if stats.corrected > 0 || stats.inconsistent > 0 {
            info!(
                "reconcile sweep: {} corrected, {} inconsistent",
                stats.corrected, stats.inconsistent
            );
        }
        if stats.deferred > 0 {
            debug!("reconcile sweep deferred {} showtimes", stats.deferred);
        }
    }
}

/// Background task compacting the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holds::HoldCache;
    use crate::model::{BookingRequest, BroadcastStatus, Hold, SeatSpec};
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    const TTL: Ms = 300_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("usher_test_sweep");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn seeded_engine(name: &str, room: Ulid, schedule: Ulid) -> Arc<Engine> {
        let engine = Arc::new(
            Engine::new(
                test_wal_path(name),
                Arc::new(NotifyHub::new()),
                Arc::new(HoldCache::new()),
            )
            .unwrap(),
        );
        engine
            .create_seats(
                room,
                schedule,
                vec![
                    SeatSpec { seat_id: "A1".into(), price: 100 },
                    SeatSpec { seat_id: "A2".into(), price: 100 },
                ],
            )
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn expiry_releases_old_holds_and_broadcasts() {
        let room = Ulid::new();
        let schedule = Ulid::new();
        let engine = seeded_engine("expiry_basic.wal", room, schedule).await;
        let key = SeatKey::new(room, schedule, "A1");
        let fresh = SeatKey::new(room, schedule, "A2");

        let now = now_ms();
        engine.holds.put(key.clone(), Hold { holder_id: "s1".into(), created_at: now - TTL - 1 });
        engine.holds.put(fresh.clone(), Hold { holder_id: "s2".into(), created_at: now });

        let mut rx = engine.notify.subscribe(&key.topic());
        let stats = expire_holds_once(&engine, TTL, now);
        assert_eq!(stats, ExpiryStats { expired: 1, suppressed: 0, skipped: 0 });
        assert!(engine.holds.get(&key).is_none());
        assert!(engine.holds.get(&fresh).is_some());

        let update = rx.recv().await.unwrap();
        assert_eq!(update.status, BroadcastStatus::Available);
        assert_eq!(update.holder_id, TIMEOUT_HOLDER);
        assert_eq!(update.seat_id, "A1");
    }

    #[tokio::test]
    async fn expiry_on_sold_seat_is_silent() {
        let room = Ulid::new();
        let schedule = Ulid::new();
        let engine = seeded_engine("expiry_sold.wal", room, schedule).await;
        let key = SeatKey::new(room, schedule, "A1");

        engine
            .commit_booking(BookingRequest {
                id: Ulid::new(),
                purchaser: "alice".into(),
                room_id: room,
                schedule_id: schedule,
                seat_ids: vec!["A1".into()],
                food: Vec::new(),
            })
            .await
            .unwrap();

        // Stale hold left behind on the sold seat
        let now = now_ms();
        engine.holds.put(key.clone(), Hold { holder_id: "s1".into(), created_at: now - TTL - 1 });

        let mut rx = engine.notify.subscribe(&key.topic());
        let stats = expire_holds_once(&engine, TTL, now);
        assert_eq!(stats, ExpiryStats { expired: 0, suppressed: 1, skipped: 0 });
        assert!(engine.holds.get(&key).is_none());
        assert!(rx.try_recv().is_err(), "sold seat must not broadcast AVAILABLE");
    }

    #[tokio::test]
    async fn expiry_keeps_reheld_seat() {
        let room = Ulid::new();
        let schedule = Ulid::new();
        let engine = seeded_engine("expiry_reheld.wal", room, schedule).await;
        let key = SeatKey::new(room, schedule, "A1");

        let now = now_ms();
        let stale = Hold { holder_id: "s1".into(), created_at: now - TTL - 1 };
        engine.holds.put(key.clone(), stale.clone());

        // Another session grabs the seat between snapshot and delete
        engine.holds.remove(&key);
        engine.holds.put(key.clone(), Hold { holder_id: "s2".into(), created_at: now });
        assert!(!engine.holds.remove_if_stamped(&key, &stale));
        assert_eq!(engine.holds.get(&key).unwrap().holder_id, "s2");
    }

    #[tokio::test]
    async fn reconcile_evicts_holds_on_sold_seats() {
        let room = Ulid::new();
        let schedule = Ulid::new();
        let engine = seeded_engine("reconcile_sold.wal", room, schedule).await;
        let key = SeatKey::new(room, schedule, "A1");

        engine
            .commit_booking(BookingRequest {
                id: Ulid::new(),
                purchaser: "alice".into(),
                room_id: room,
                schedule_id: schedule,
                seat_ids: vec!["A1".into()],
                food: Vec::new(),
            })
            .await
            .unwrap();
        engine.holds.put(key.clone(), Hold { holder_id: "s1".into(), created_at: now_ms() });

        let mut rx = engine.notify.subscribe(&key.topic());
        let stats = reconcile_once(&engine);
        assert_eq!(stats.corrected, 1);
        assert_eq!(stats.inconsistent, 0);
        assert!(engine.holds.get(&key).is_none());

        let update = rx.recv().await.unwrap();
        assert_eq!(update.status, BroadcastStatus::Booked);
        assert_eq!(update.holder_id, SYNC_HOLDER);
    }

    #[tokio::test]
    async fn reconcile_evicts_holds_without_records() {
        let room = Ulid::new();
        let schedule = Ulid::new();
        let engine = seeded_engine("reconcile_missing.wal", room, schedule).await;

        // Hold on a seat the store never had, and one on a foreign showtime
        let ghost = SeatKey::new(room, schedule, "Z99");
        let orphan = SeatKey::new(Ulid::new(), Ulid::new(), "A1");
        engine.holds.put(ghost.clone(), Hold { holder_id: "s1".into(), created_at: now_ms() });
        engine.holds.put(orphan.clone(), Hold { holder_id: "s2".into(), created_at: now_ms() });

        let stats = reconcile_once(&engine);
        assert_eq!(stats.corrected, 0);
        assert_eq!(stats.inconsistent, 2);
        assert!(engine.holds.is_empty());
    }

    #[tokio::test]
    async fn reconcile_leaves_valid_holds() {
        let room = Ulid::new();
        let schedule = Ulid::new();
        let engine = seeded_engine("reconcile_valid.wal", room, schedule).await;
        let key = SeatKey::new(room, schedule, "A2");
        engine.holds.put(key.clone(), Hold { holder_id: "s1".into(), created_at: now_ms() });

        let stats = reconcile_once(&engine);
        assert_eq!(stats, ReconcileStats::default());
        assert_eq!(engine.holds.get(&key).unwrap().holder_id, "s1");
    }

    #[tokio::test]
    async fn reconcile_defers_locked_showtime() {
        let room = Ulid::new();
        let schedule = Ulid::new();
        let engine = seeded_engine("reconcile_locked.wal", room, schedule).await;
        let key = SeatKey::new(room, schedule, "A1");
        engine.holds.put(key.clone(), Hold { holder_id: "s1".into(), created_at: now_ms() });

        let st = engine.get_showtime(&key.showtime()).unwrap();
        let guard = st.write_owned().await;
        let stats = reconcile_once(&engine);
        drop(guard);

        assert_eq!(stats.deferred, 1);
        assert!(engine.holds.get(&key).is_some());
    }
}
