use crate::model::{Hold, Ms, SeatKey};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// In-memory seat holds, keyed per seat. Shared freely across tasks; all
/// compound operations are atomic per key via the map's entry API. Nothing
/// here is ever written to the WAL, so every hold dies with the process.
pub struct HoldCache {
    map: DashMap<SeatKey, Hold>,
}

impl HoldCache {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Unconditional insert or overwrite.
    pub fn put(&self, key: SeatKey, hold: Hold) {
        self.map.insert(key, hold);
    }

    pub fn get(&self, key: &SeatKey) -> Option<Hold> {
        self.map.get(key).map(|r| r.value().clone())
    }

    pub fn remove(&self, key: &SeatKey) -> Option<Hold> {
        self.map.remove(key).map(|(_, hold)| hold)
    }

    /// Claim the seat for `holder_id`. Succeeds when the seat is unheld or
    /// already held by the same holder (which renews the timestamp). On
    /// rejection the existing hold is returned untouched.
    pub fn try_select(&self, key: SeatKey, holder_id: &str, now: Ms) -> Result<Hold, Hold> {
        match self.map.entry(key) {
            Entry::Vacant(slot) => {
                let hold = Hold { holder_id: holder_id.to_string(), created_at: now };
                slot.insert(hold.clone());
                Ok(hold)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().holder_id == holder_id {
                    slot.get_mut().created_at = now;
                    Ok(slot.get().clone())
                } else {
                    Err(slot.get().clone())
                }
            }
        }
    }

    /// Remove only if the hold belongs to `holder_id`. Returns the removed
    /// hold, or None when the seat was unheld or held by someone else.
    pub fn remove_if_holder(&self, key: &SeatKey, holder_id: &str) -> Option<Hold> {
        self.map
            .remove_if(key, |_, hold| hold.holder_id == holder_id)
            .map(|(_, hold)| hold)
    }

    /// Remove only the exact hold observed earlier. A seat re-held since the
    /// snapshot (newer timestamp or different holder) is left alone.
    pub fn remove_if_stamped(&self, key: &SeatKey, observed: &Hold) -> bool {
        self.map
            .remove_if(key, |_, hold| {
                hold.holder_id == observed.holder_id && hold.created_at == observed.created_at
            })
            .is_some()
    }

    /// Point-in-time key snapshot for the sweeps. Holds may come and go
    /// while the caller walks it.
    pub fn snapshot_keys(&self) -> Vec<SeatKey> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for HoldCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ulid::Ulid;

    fn key(seat: &str) -> SeatKey {
        SeatKey::new(Ulid::new(), Ulid::new(), seat)
    }

    #[test]
    fn select_vacant_seat() {
        let cache = HoldCache::new();
        let k = key("A1");
        let hold = cache.try_select(k.clone(), "sess-1", 100).unwrap();
        assert_eq!(hold.holder_id, "sess-1");
        assert_eq!(hold.created_at, 100);
        assert_eq!(cache.get(&k), Some(hold));
    }

    #[test]
    fn reselect_by_owner_renews_timestamp() {
        let cache = HoldCache::new();
        let k = key("A1");
        cache.try_select(k.clone(), "sess-1", 100).unwrap();
        let renewed = cache.try_select(k.clone(), "sess-1", 250).unwrap();
        assert_eq!(renewed.created_at, 250);
        assert_eq!(cache.get(&k).unwrap().created_at, 250);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn select_held_seat_rejected_with_existing_hold() {
        let cache = HoldCache::new();
        let k = key("A1");
        cache.try_select(k.clone(), "sess-1", 100).unwrap();
        let existing = cache.try_select(k.clone(), "sess-2", 200).unwrap_err();
        assert_eq!(existing.holder_id, "sess-1");
        assert_eq!(existing.created_at, 100);
        // loser did not disturb the hold
        assert_eq!(cache.get(&k).unwrap().holder_id, "sess-1");
    }

    #[test]
    fn remove_if_holder_respects_ownership() {
        let cache = HoldCache::new();
        let k = key("B3");
        cache.try_select(k.clone(), "sess-1", 100).unwrap();

        assert!(cache.remove_if_holder(&k, "sess-2").is_none());
        assert!(cache.get(&k).is_some());

        let removed = cache.remove_if_holder(&k, "sess-1").unwrap();
        assert_eq!(removed.holder_id, "sess-1");
        assert!(cache.get(&k).is_none());

        // second release is a no-op
        assert!(cache.remove_if_holder(&k, "sess-1").is_none());
    }

    #[test]
    fn remove_if_stamped_skips_newer_hold() {
        let cache = HoldCache::new();
        let k = key("C4");
        let observed = cache.try_select(k.clone(), "sess-1", 100).unwrap();

        // seat re-held after observation: expired snapshot must not win
        cache.remove(&k);
        cache.try_select(k.clone(), "sess-2", 500).unwrap();
        assert!(!cache.remove_if_stamped(&k, &observed));
        assert_eq!(cache.get(&k).unwrap().holder_id, "sess-2");

        let current = cache.get(&k).unwrap();
        assert!(cache.remove_if_stamped(&k, &current));
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn snapshot_keys_is_point_in_time() {
        let cache = HoldCache::new();
        let k1 = key("A1");
        let k2 = key("A2");
        cache.try_select(k1.clone(), "s", 1).unwrap();
        cache.try_select(k2.clone(), "s", 1).unwrap();
        let mut keys = cache.snapshot_keys();
        keys.sort_by(|a, b| a.seat_id.cmp(&b.seat_id));
        assert_eq!(keys.len(), 2);
        cache.remove(&k1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_select_has_exactly_one_winner() {
        let cache = Arc::new(HoldCache::new());
        let k = key("D7");
        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = Arc::clone(&cache);
            let k = k.clone();
            handles.push(std::thread::spawn(move || {
                cache.try_select(k, &format!("sess-{i}"), 100).is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(cache.get(&k).is_some());
    }
}
