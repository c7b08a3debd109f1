use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct Entry {
    address: SocketAddr,
    last_access: Instant,
}

/// `host:port` to address map, entries live as long as they keep being
/// looked up within the TTL.
///
/// There is no sweeper: an expired entry is only evicted when a lookup hits
/// it, so destinations that are never asked for again stay in memory.
#[derive(Debug)]
pub struct DnsCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> DnsCache {
        DnsCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A hit refreshes the entry. An expired hit is evicted and reported as
    /// a miss.
    pub fn resolve(&self, key: &str) -> Option<SocketAddr> {
        self.resolve_at(key, Instant::now())
    }

    pub(crate) fn resolve_at(&self, key: &str, now: Instant) -> Option<SocketAddr> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;

        if now.saturating_duration_since(entry.last_access) > self.ttl {
            trace!("dns cache: {} expired", key);
            entries.remove(key);
            return None;
        }

        entry.last_access = now;
        Some(entry.address)
    }

    /// upsert, the last writer wins
    pub fn add(&self, key: &str, address: SocketAddr) {
        self.add_at(key, address, Instant::now())
    }

    pub(crate) fn add_at(&self, key: &str, address: SocketAddr, now: Instant) {
        self.entries.lock().insert(
            key.to_owned(),
            Entry {
                address,
                last_access: now,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
