//! Peer registry: latest advertisement per peer, expired by age.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::identity::Identifier;
use crate::protocol::Capabilities;

/// What we know about a peer from its most recent advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub identifier: Identifier,
    pub server_port: u16,
    pub capabilities: Capabilities,
    /// Local receipt time; the sender's wall clock is never compared with ours.
    pub last_seen: Instant,
}

/// Result of offering an advertisement to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    New,
    Refreshed,
    /// Our own advertisement, looped back by the group.
    SelfIgnored,
    /// Delivered out of order: the stored entry was seen later.
    Stale,
}

/// Shared map of peers, guarded internally. Callers never hold the lock.
#[derive(Debug)]
pub struct PeerRegistry {
    self_id: Identifier,
    peers: RwLock<HashMap<Identifier, PeerEntry>>,
}

impl PeerRegistry {
    pub fn new(self_id: Identifier) -> Self {
        Self {
            self_id,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the entry for `entry.identifier`. Replacement is wholesale.
    pub fn upsert(&self, entry: PeerEntry) -> Upsert {
        if entry.identifier == self.self_id {
            return Upsert::SelfIgnored;
        }
        let mut peers = self.write();
        match peers.get(&entry.identifier) {
            Some(existing) if existing.last_seen > entry.last_seen => Upsert::Stale,
            Some(_) => {
                peers.insert(entry.identifier.clone(), entry);
                Upsert::Refreshed
            }
            None => {
                peers.insert(entry.identifier.clone(), entry);
                Upsert::New
            }
        }
    }

    /// Remove entries with `now - last_seen > max_age`. An entry exactly `max_age` old stays.
    pub fn sweep_expired(&self, now: Instant, max_age: Duration) -> Vec<Identifier> {
        let mut peers = self.write();
        let expired: Vec<Identifier> = peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > max_age)
            .map(|p| p.identifier.clone())
            .collect();
        for id in &expired {
            peers.remove(id);
        }
        expired
    }

    pub fn lookup(&self, id: &Identifier) -> Option<PeerEntry> {
        self.read().get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// All peers, sorted by identifier.
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        let mut out: Vec<PeerEntry> = self.read().values().cloned().collect();
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        out
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Identifier, PeerEntry>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Identifier, PeerEntry>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    fn entry(name: &str, port: u16, last_seen: Instant) -> PeerEntry {
        PeerEntry {
            identifier: id(name),
            server_port: port,
            capabilities: Capabilities {
                search: true,
                download: true,
            },
            last_seen,
        }
    }

    #[test]
    fn self_advertisement_never_stored() {
        let reg = PeerRegistry::new(id("me@here"));
        assert_eq!(
            reg.upsert(entry("me@here", 4105, Instant::now())),
            Upsert::SelfIgnored
        );
        assert!(reg.is_empty());
        assert!(reg.lookup(&id("me@here")).is_none());
    }

    #[test]
    fn upsert_replaces_and_keeps_latest() {
        let reg = PeerRegistry::new(id("me@here"));
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(500);
        assert_eq!(reg.upsert(entry("a@there", 1000, t0)), Upsert::New);
        assert_eq!(reg.upsert(entry("a@there", 2000, t1)), Upsert::Refreshed);
        assert_eq!(reg.len(), 1);
        let got = reg.lookup(&id("a@there")).unwrap();
        assert_eq!(got.last_seen, t1);
        assert_eq!(got.server_port, 2000);

        // Reordered older advertisement does not roll the entry back.
        assert_eq!(reg.upsert(entry("a@there", 1000, t0)), Upsert::Stale);
        assert_eq!(reg.lookup(&id("a@there")).unwrap().last_seen, t1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_advertisement_is_idempotent() {
        let reg = PeerRegistry::new(id("me@here"));
        let t = Instant::now();
        reg.upsert(entry("a@there", 1000, t));
        assert_eq!(reg.upsert(entry("a@there", 1000, t)), Upsert::Refreshed);
        assert_eq!(reg.snapshot(), vec![entry("a@there", 1000, t)]);
    }

    #[test]
    fn sweep_removes_strictly_older_than_max_age() {
        let reg = PeerRegistry::new(id("me@here"));
        let max_age = Duration::from_secs(10);
        let start = Instant::now();
        reg.upsert(entry("old@there", 1, start));
        reg.upsert(entry("edge@there", 2, start + Duration::from_secs(1)));
        reg.upsert(entry("fresh@there", 3, start + Duration::from_secs(5)));

        // edge is exactly max_age old: kept.
        let now = start + Duration::from_secs(11);
        let removed = reg.sweep_expired(now, max_age);
        assert_eq!(removed, vec![id("old@there")]);
        assert!(reg.lookup(&id("edge@there")).is_some());

        // One tick past the boundary: gone.
        let removed = reg.sweep_expired(now + Duration::from_nanos(1), max_age);
        assert_eq!(removed, vec![id("edge@there")]);
        assert_eq!(reg.snapshot().len(), 1);
        assert!(reg.lookup(&id("fresh@there")).is_some());
    }

    #[test]
    fn concurrent_upsert_and_sweep() {
        let reg = Arc::new(PeerRegistry::new(id("me@here")));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let name = format!("p{}@h{}", i % 10, t);
                        reg.upsert(entry(&name, i, Instant::now()));
                        reg.sweep_expired(Instant::now(), Duration::from_secs(60));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 40);
    }

    #[test]
    fn snapshot_sorted_by_identifier() {
        let reg = PeerRegistry::new(id("me@here"));
        let t = Instant::now();
        reg.upsert(entry("zed@h", 1, t));
        reg.upsert(entry("amy@h", 2, t));
        let names: Vec<String> = reg
            .snapshot()
            .into_iter()
            .map(|p| p.identifier.to_string())
            .collect();
        assert_eq!(names, vec!["amy@h", "zed@h"]);
    }
}
