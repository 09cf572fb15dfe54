//! Short-TTL coordination state: claim slots, broadcast records, rejections.
//!
//! The claim slot is the single-winner primitive: set-if-absent keyed by ride
//! id, auto-released by TTL. An expired claim is treated as vacant, so a
//! crashed winner cannot wedge a ride for longer than the TTL.
//!
//! Everything here is short-lived and advisory except the claim, which gates
//! the state-machine `accept`. A store backed by an external coordination
//! service would keep this interface and surface I/O failures as
//! `transient_store`.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::clock::{SharedClock, ONE_SEC_MS};
use crate::rides::{RideId, UserId};

/// Result of a claim-slot acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired,
    HeldBy(UserId),
}

#[derive(Debug, Clone)]
struct TtlEntry<T> {
    value: T,
    expires_at_ms: u64,
}

/// Ephemeral record of one ride's offer broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastRecord {
    pub ride_id: RideId,
    pub notified: HashSet<UserId>,
    pub rejected: HashSet<UserId>,
    pub radius_km: f64,
    pub expires_at_ms: u64,
}

#[derive(Default)]
pub struct CoordinationStore {
    claims: DashMap<RideId, TtlEntry<UserId>>,
    broadcasts: DashMap<RideId, BroadcastRecord>,
    rejections: DashMap<(RideId, UserId), TtlEntry<()>>,
}

impl CoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set-if-absent claim with TTL. Re-claiming by the current holder
    /// refreshes the TTL and reports `Acquired`.
    pub fn try_claim(
        &self,
        ride_id: &str,
        driver_id: &str,
        ttl_secs: u64,
        now_ms: u64,
    ) -> ClaimOutcome {
        let expires_at_ms = now_ms + ttl_secs * ONE_SEC_MS;
        let mut outcome = ClaimOutcome::Acquired;
        self.claims
            .entry(ride_id.to_string())
            .and_modify(|entry| {
                if entry.expires_at_ms > now_ms && entry.value != driver_id {
                    outcome = ClaimOutcome::HeldBy(entry.value.clone());
                } else {
                    entry.value = driver_id.to_string();
                    entry.expires_at_ms = expires_at_ms;
                }
            })
            .or_insert_with(|| TtlEntry {
                value: driver_id.to_string(),
                expires_at_ms,
            });
        outcome
    }

    /// Release a claim held by `driver_id`. A non-holder release is a no-op.
    pub fn release_claim(&self, ride_id: &str, driver_id: &str) {
        self.claims
            .remove_if(ride_id, |_, entry| entry.value == driver_id);
    }

    pub fn claim_holder(&self, ride_id: &str, now_ms: u64) -> Option<UserId> {
        self.claims.get(ride_id).and_then(|entry| {
            (entry.expires_at_ms > now_ms).then(|| entry.value.clone())
        })
    }

    pub fn put_broadcast(&self, record: BroadcastRecord) {
        self.broadcasts.insert(record.ride_id.clone(), record);
    }

    pub fn get_broadcast(&self, ride_id: &str) -> Option<BroadcastRecord> {
        self.broadcasts.get(ride_id).map(|r| r.clone())
    }

    pub fn remove_broadcast(&self, ride_id: &str) -> Option<BroadcastRecord> {
        self.broadcasts.remove(ride_id).map(|(_, r)| r)
    }

    pub fn add_rejected_to_broadcast(&self, ride_id: &str, driver_id: &str) {
        if let Some(mut record) = self.broadcasts.get_mut(ride_id) {
            record.rejected.insert(driver_id.to_string());
        }
    }

    /// Remember that `driver_id` declined this ride, for `ttl_secs`.
    pub fn record_rejection(&self, ride_id: &str, driver_id: &str, ttl_secs: u64, now_ms: u64) {
        self.rejections.insert(
            (ride_id.to_string(), driver_id.to_string()),
            TtlEntry {
                value: (),
                expires_at_ms: now_ms + ttl_secs * ONE_SEC_MS,
            },
        );
    }

    pub fn is_rejected(&self, ride_id: &str, driver_id: &str, now_ms: u64) -> bool {
        self.rejections
            .get(&(ride_id.to_string(), driver_id.to_string()))
            .map(|entry| entry.expires_at_ms > now_ms)
            .unwrap_or(false)
    }

    /// Drop expired claims, rejections, and broadcast records. Run by the
    /// cleanup sweeper.
    pub fn purge_expired(&self, now_ms: u64) {
        self.claims.retain(|_, entry| entry.expires_at_ms > now_ms);
        self.rejections.retain(|_, entry| entry.expires_at_ms > now_ms);
        self.broadcasts.retain(|_, record| record.expires_at_ms > now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_loses_within_ttl() {
        let store = CoordinationStore::new();
        assert_eq!(
            store.try_claim("ride-1", "d1", 10, 1_000),
            ClaimOutcome::Acquired
        );
        assert_eq!(
            store.try_claim("ride-1", "d2", 10, 1_500),
            ClaimOutcome::HeldBy("d1".into())
        );
        // Same holder re-claims fine.
        assert_eq!(
            store.try_claim("ride-1", "d1", 10, 2_000),
            ClaimOutcome::Acquired
        );
    }

    #[test]
    fn claim_expires_at_ttl_boundary() {
        let store = CoordinationStore::new();
        store.try_claim("ride-1", "d1", 10, 0);
        // Just before expiry the slot is still held.
        assert_eq!(
            store.try_claim("ride-1", "d2", 10, 9_999),
            ClaimOutcome::HeldBy("d1".into())
        );
        // At expiry another driver may acquire.
        assert_eq!(
            store.try_claim("ride-1", "d2", 10, 10_000),
            ClaimOutcome::Acquired
        );
    }

    #[test]
    fn release_is_holder_only() {
        let store = CoordinationStore::new();
        store.try_claim("ride-1", "d1", 10, 0);
        store.release_claim("ride-1", "d2");
        assert_eq!(store.claim_holder("ride-1", 1_000), Some("d1".into()));
        store.release_claim("ride-1", "d1");
        assert_eq!(store.claim_holder("ride-1", 1_000), None);
    }

    #[test]
    fn rejection_memory_honours_ttl() {
        let store = CoordinationStore::new();
        store.record_rejection("ride-1", "d1", 120, 0);
        assert!(store.is_rejected("ride-1", "d1", 60_000));
        assert!(!store.is_rejected("ride-1", "d1", 120_000));
        assert!(!store.is_rejected("ride-1", "d2", 60_000));
    }

    #[test]
    fn purge_drops_expired_entries() {
        let store = CoordinationStore::new();
        store.try_claim("ride-1", "d1", 10, 0);
        store.record_rejection("ride-1", "d2", 10, 0);
        store.put_broadcast(BroadcastRecord {
            ride_id: "ride-1".into(),
            notified: HashSet::new(),
            rejected: HashSet::new(),
            radius_km: 5.0,
            expires_at_ms: 5_000,
        });

        store.purge_expired(60_000);
        assert_eq!(store.claim_holder("ride-1", 60_000), None);
        assert!(store.get_broadcast("ride-1").is_none());
        assert!(!store.is_rejected("ride-1", "d2", 60_000));
    }
}
