//! Lease table.
//!
//! Leases are replicated state: grants, renewals and revocations are log
//! entries, and expiry is evaluated only against applied `Tick` entries.
//! Revoking a lease deletes its attached keys; the caller does that against
//! the KV store at a fresh revision.

use crate::core::error::{TesseraError, TesseraResult};
use crate::core::time::Tick;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: i64,
    /// Granted TTL in seconds.
    pub ttl: i64,
    /// Deadline after which the lease is revoked.
    pub expiry: Tick,
    /// Keys attached to this lease.
    pub keys: BTreeSet<Vec<u8>>,
}

impl Lease {
    fn new(id: i64, ttl: i64, now: Tick) -> Self {
        Self {
            id,
            ttl,
            expiry: now.add_secs(ttl as u64),
            keys: BTreeSet::new(),
        }
    }

    pub fn is_expired_at(&self, now: Tick) -> bool {
        now.is_at_or_after(self.expiry)
    }

    /// Remaining TTL in whole seconds, rounded up.
    pub fn remaining_at(&self, now: Tick) -> i64 {
        now.secs_until(self.expiry) as i64
    }
}

/// Answer to a time-to-live query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTimeToLive {
    pub id: i64,
    /// Remaining seconds, or -1 when the lease does not exist.
    pub ttl: i64,
    pub granted_ttl: i64,
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseTable {
    leases: BTreeMap<i64, Lease>,
    /// Next candidate for auto-assigned ids. Advances deterministically.
    next_id: i64,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self {
            leases: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.leases.contains_key(&id)
    }

    pub fn get(&self, id: i64) -> Option<&Lease> {
        self.leases.get(&id)
    }

    /// Grant a lease. An `id` of 0 picks the next free id.
    pub fn grant(&mut self, id: i64, ttl: i64, now: Tick) -> TesseraResult<&Lease> {
        if ttl <= 0 {
            return Err(TesseraError::invalid_argument("lease TTL must be positive"));
        }
        if id < 0 {
            return Err(TesseraError::invalid_argument("lease id must not be negative"));
        }
        let id = if id == 0 {
            while self.leases.contains_key(&self.next_id) {
                self.next_id += 1;
            }
            let assigned = self.next_id;
            self.next_id += 1;
            assigned
        } else if self.leases.contains_key(&id) {
            return Err(TesseraError::LeaseExists { lease_id: id });
        } else {
            id
        };
        Ok(self
            .leases
            .entry(id)
            .or_insert_with(|| Lease::new(id, ttl, now)))
    }

    pub fn revoke(&mut self, id: i64) -> TesseraResult<Lease> {
        self.leases
            .remove(&id)
            .ok_or(TesseraError::LeaseNotFound { lease_id: id })
    }

    /// Push the deadline out by a full TTL from `now`. Returns the TTL.
    pub fn renew(&mut self, id: i64, now: Tick) -> TesseraResult<i64> {
        let lease = self
            .leases
            .get_mut(&id)
            .ok_or(TesseraError::LeaseNotFound { lease_id: id })?;
        if lease.is_expired_at(now) {
            return Err(TesseraError::LeaseNotFound { lease_id: id });
        }
        lease.expiry = now.add_secs(lease.ttl as u64);
        Ok(lease.ttl)
    }

    /// Give every lease at least a full TTL from `now`. Applied when a new
    /// leader starts ticking so that the leaderless gap does not expire
    /// leases whose clients could not reach the cluster.
    pub fn promote(&mut self, now: Tick) {
        for lease in self.leases.values_mut() {
            lease.expiry = lease.expiry.max(now.add_secs(lease.ttl as u64));
        }
    }

    pub fn attach(&mut self, id: i64, key: &[u8]) -> TesseraResult<()> {
        let lease = self
            .leases
            .get_mut(&id)
            .ok_or(TesseraError::LeaseNotFound { lease_id: id })?;
        lease.keys.insert(key.to_vec());
        Ok(())
    }

    pub fn detach(&mut self, id: i64, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    /// Ids of leases expired at `now`, in ascending order.
    pub fn expired(&self, now: Tick) -> Vec<i64> {
        self.leases
            .values()
            .filter(|l| l.is_expired_at(now))
            .map(|l| l.id)
            .collect()
    }

    pub fn time_to_live(&self, id: i64, now: Tick, with_keys: bool) -> LeaseTimeToLive {
        match self.leases.get(&id) {
            Some(lease) => LeaseTimeToLive {
                id,
                ttl: lease.remaining_at(now),
                granted_ttl: lease.ttl,
                keys: if with_keys {
                    lease.keys.iter().cloned().collect()
                } else {
                    Vec::new()
                },
            },
            None => LeaseTimeToLive {
                id,
                ttl: -1,
                granted_ttl: 0,
                keys: Vec::new(),
            },
        }
    }

    pub fn ids(&self) -> Vec<i64> {
        self.leases.keys().copied().collect()
    }
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_ids_skip_taken_ones() {
        let mut t = LeaseTable::new();
        t.grant(2, 10, Tick::zero()).unwrap();
        assert_eq!(t.grant(0, 10, Tick::zero()).unwrap().id, 1);
        assert_eq!(t.grant(0, 10, Tick::zero()).unwrap().id, 3);
        assert!(matches!(
            t.grant(2, 10, Tick::zero()),
            Err(TesseraError::LeaseExists { lease_id: 2 })
        ));
        assert!(t.grant(0, 0, Tick::zero()).is_err());
    }

    #[test]
    fn expiry_follows_applied_ticks() {
        let mut t = LeaseTable::new();
        let now = Tick::new(1_000);
        t.grant(7, 5, now).unwrap();
        t.attach(7, b"k").unwrap();
        assert!(t.expired(now.add_secs(4)).is_empty());
        assert_eq!(t.renew(7, now.add_secs(4)).unwrap(), 5);
        assert!(t.expired(now.add_secs(8)).is_empty());
        assert_eq!(t.expired(now.add_secs(9)), vec![7]);

        let ttl = t.time_to_live(7, now.add_secs(6), true);
        assert_eq!(ttl.ttl, 3);
        assert_eq!(ttl.keys, vec![b"k".to_vec()]);
        assert_eq!(t.time_to_live(99, now, false).ttl, -1);
    }

    #[test]
    fn promote_extends_deadlines() {
        let mut t = LeaseTable::new();
        t.grant(1, 5, Tick::zero()).unwrap();
        t.promote(Tick::new(60_000));
        assert!(t.expired(Tick::new(64_000)).is_empty());
        assert_eq!(t.expired(Tick::new(65_000)), vec![1]);
    }
}
