use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::holds::HoldCache;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweep::{self, SweepConfig};

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// hold cache + sweeps. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    sweep: SweepConfig,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, sweep: SweepConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            sweep,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let holds = Arc::new(HoldCache::new());
        let engine = Arc::new(Engine::new(wal_path, notify, holds)?);

        // Expiry + reconciliation + compaction run per tenant.
        let expiry_engine = engine.clone();
        let cfg = self.sweep;
        tokio::spawn(async move {
            sweep::run_expiry_sweep(expiry_engine, cfg).await;
        });
        let reconcile_engine = engine.clone();
        tokio::spawn(async move {
            sweep::run_reconciliation_sweep(reconcile_engine, cfg).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            sweep::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("usher_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn tm(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, SweepConfig::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = tm(dir);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        let room = Ulid::new();
        let schedule = Ulid::new();
        let specs = vec![SeatSpec { seat_id: "A1".into(), price: 100 }];

        // Same showtime in both tenants
        eng_a.create_seats(room, schedule, specs.clone()).await.unwrap();
        eng_b.create_seats(room, schedule, specs).await.unwrap();

        // Hold A1 in tenant A only
        eng_a
            .select_seat(SeatKey::new(room, schedule, "A1"), "session-1")
            .unwrap();

        let map_b = eng_b.seat_map(room, schedule).await.unwrap();
        assert_eq!(map_b[0].status, BroadcastStatus::Available);

        let map_a = eng_a.seat_map(room, schedule).await.unwrap();
        assert_eq!(map_a[0].status, BroadcastStatus::Selected);
        assert_eq!(map_a[0].holder_id, "session-1");
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = tm(dir.clone());

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        // Create a tenant
        let _eng = tm.get_or_create("my_db").unwrap();

        // WAL file should now exist
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = tm(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();

        // Should be the same Arc
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = tm(dir.clone());

        // Path traversal attempt
        let _eng = tm.get_or_create("../evil").unwrap();
        // Should create "evil.wal", not "../evil.wal"
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tenant_name_length_limits() {
        let dir = test_data_dir("name_len");
        let tm = tm(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let result = tm.get_or_create(&long_name);
        assert!(result.err().unwrap().to_string().contains("tenant name too long"));

        // At the limit is fine
        let name = "x".repeat(MAX_TENANT_NAME_LEN);
        assert!(tm.get_or_create(&name).is_ok());
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = tm(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let result = tm.get_or_create("one_more");
        assert!(result.err().unwrap().to_string().contains("too many tenants"));
    }
}
