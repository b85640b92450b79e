use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct Cell {
    count: u32,
    expires_at: DateTime<Utc>,
}

/// Key-value counts with a rolling per-key expiry. Increments go through the
/// map's entry lock, so concurrent invocations never lose an update.
#[derive(Default)]
pub struct CounterStore {
    cells: DashMap<String, Cell>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps the key and extends its expiry; an expired entry restarts at 1.
    /// Returns the count after the increment.
    pub fn increment(&self, key: &str, ttl: Duration) -> u32 {
        self.increment_at(key, ttl, Utc::now())
    }

    pub fn increment_at(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> u32 {
        let mut cell = self.cells.entry(key.to_string()).or_insert(Cell {
            count: 0,
            expires_at: now + ttl,
        });
        if now > cell.expires_at {
            cell.count = 0;
        }
        cell.count += 1;
        cell.expires_at = now + ttl;
        cell.count
    }

    pub fn get(&self, key: &str) -> u32 {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> u32 {
        match self.cells.get(key) {
            Some(c) if now <= c.expires_at => c.count,
            _ => 0,
        }
    }

    pub fn reset(&self, key: &str) {
        self.cells.remove(key);
    }
}
