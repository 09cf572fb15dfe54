//! Location Index: latest driver positions and radius queries.
//!
//! Positions are bucketed into H3 cells at resolution 8 (~460 m edges).
//! `query_nearby` expands a grid disk wide enough to cover the requested
//! radius, gathers the drivers in those buckets, then filters by freshness and
//! the caller's eligibility predicate and ranks by haversine distance.
//!
//! Writers are serialised per driver by the map entry; an out-of-order sample
//! (older timestamp than the stored one) is dropped, so `get` is monotonic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use h3o::{CellIndex, LatLng, Resolution};

use crate::clock::{SharedClock, ONE_SEC_MS};
use crate::error::{CoreError, CoreResult};
use crate::rides::UserId;
use crate::spatial::{haversine_km, GeoPoint};

/// Bucket resolution. Res-8 hexagons have ~461 m average edges, a good
/// granularity for city-scale radius queries.
const INDEX_RESOLUTION: Resolution = Resolution::Eight;

/// Average hexagon edge length at [`INDEX_RESOLUTION`], in km.
const AVG_EDGE_KM: f64 = 0.4614;

#[derive(Debug, Clone, PartialEq)]
pub struct LocationSample {
    pub driver_id: UserId,
    pub point: GeoPoint,
    pub accuracy_m: Option<f64>,
    pub recorded_at_ms: u64,
    /// Process-local write sequence; breaks ties between same-ms samples.
    pub seq: u64,
}

/// A candidate returned by [`LocationIndex::query_nearby`].
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyDriver {
    pub driver_id: UserId,
    pub distance_km: f64,
    pub recorded_at_ms: u64,
}

pub struct LocationIndex {
    latest: DashMap<UserId, LocationSample>,
    buckets: DashMap<CellIndex, HashSet<UserId>>,
    seq: AtomicU64,
    clock: SharedClock,
    stale_ttl_ms: u64,
}

impl LocationIndex {
    pub fn new(clock: SharedClock, stale_ttl_secs: u64) -> Self {
        Self {
            latest: DashMap::new(),
            buckets: DashMap::new(),
            seq: AtomicU64::new(0),
            clock,
            stale_ttl_ms: stale_ttl_secs * ONE_SEC_MS,
        }
    }

    fn cell_for(point: &GeoPoint) -> CoreResult<CellIndex> {
        let latlng = LatLng::new(point.latitude, point.longitude)
            .map_err(|e| CoreError::Validation(format!("invalid coordinates: {e}")))?;
        Ok(latlng.to_cell(INDEX_RESOLUTION))
    }

    /// Record a driver position. Samples older than the stored one are
    /// dropped; equal-timestamp samples are ordered by write sequence.
    pub fn upsert(
        &self,
        driver_id: &str,
        point: GeoPoint,
        accuracy_m: Option<f64>,
        recorded_at_ms: u64,
    ) -> CoreResult<()> {
        let cell = Self::cell_for(&point)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let previous_cell = {
            let mut entry = self
                .latest
                .entry(driver_id.to_string())
                .or_insert_with(|| LocationSample {
                    driver_id: driver_id.to_string(),
                    point: point.clone(),
                    accuracy_m,
                    recorded_at_ms,
                    seq,
                });
            let stored = entry.value_mut();
            if stored.seq != seq {
                if recorded_at_ms < stored.recorded_at_ms {
                    return Ok(()); // out-of-order write, drop
                }
                let previous = Self::cell_for(&stored.point)?;
                stored.point = point;
                stored.accuracy_m = accuracy_m;
                stored.recorded_at_ms = recorded_at_ms;
                stored.seq = seq;
                Some(previous)
            } else {
                None
            }
        };

        match previous_cell {
            Some(previous) if previous != cell => {
                if let Some(mut bucket) = self.buckets.get_mut(&previous) {
                    bucket.remove(driver_id);
                }
                self.buckets.entry(cell).or_default().insert(driver_id.to_string());
            }
            Some(_) => {}
            None => {
                self.buckets.entry(cell).or_default().insert(driver_id.to_string());
            }
        }
        Ok(())
    }

    /// Latest sample for a driver, regardless of freshness.
    pub fn get(&self, driver_id: &str) -> Option<LocationSample> {
        self.latest.get(driver_id).map(|s| s.clone())
    }

    /// Remove a driver from the index entirely.
    pub fn remove(&self, driver_id: &str) {
        if let Some((_, sample)) = self.latest.remove(driver_id) {
            if let Ok(cell) = Self::cell_for(&sample.point) {
                if let Some(mut bucket) = self.buckets.get_mut(&cell) {
                    bucket.remove(driver_id);
                }
            }
        }
    }

    /// Drivers within `radius_km` of `origin` whose latest sample is fresh
    /// and for which `eligible` holds, ordered by ascending distance (ties
    /// broken by most recent update).
    pub fn query_nearby(
        &self,
        origin: &GeoPoint,
        radius_km: f64,
        eligible: impl Fn(&str) -> bool,
    ) -> CoreResult<Vec<NearbyDriver>> {
        let origin_cell = Self::cell_for(origin)?;
        // Disk radius in cells: center-to-center spacing is edge · √3, plus
        // one ring of slack for points near cell borders.
        let k = (radius_km / (AVG_EDGE_KM * 3f64.sqrt())).ceil() as u32 + 1;
        let now_ms = self.clock.now_ms();

        let mut found = Vec::new();
        for cell in origin_cell.grid_disk::<Vec<_>>(k) {
            let Some(bucket) = self.buckets.get(&cell) else {
                continue;
            };
            for driver_id in bucket.iter() {
                let Some(sample) = self.latest.get(driver_id.as_str()) else {
                    continue;
                };
                if now_ms.saturating_sub(sample.recorded_at_ms) > self.stale_ttl_ms {
                    continue;
                }
                let distance_km = haversine_km(origin, &sample.point);
                if distance_km > radius_km {
                    continue;
                }
                if !eligible(driver_id) {
                    continue;
                }
                found.push(NearbyDriver {
                    driver_id: driver_id.clone(),
                    distance_km,
                    recorded_at_ms: sample.recorded_at_ms,
                });
            }
        }

        found.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.recorded_at_ms.cmp(&a.recorded_at_ms))
        });
        Ok(found)
    }
}
