//! Pluggable route providers.
//!
//! The core never computes road geometry itself: it asks a [`RouteProvider`]
//! and caches what comes back verbatim. Selectable via [`RouteProviderKind`]:
//!
//! - **`StraightLineProvider`**: haversine times a detour factor; always
//!   available, used as the fallback when the real provider is down.
//! - **`OsrmRouteProvider`** (feature `osrm`): an OSRM HTTP endpoint.
//! - **`CachingRouteProvider`**: LRU decorator over any provider.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::spatial::{haversine_km, GeoPoint};

#[cfg(feature = "osrm")]
pub mod osrm;

/// Assumed speed for duration estimates when the provider reports none.
pub const FALLBACK_SPEED_KMH: f64 = 30.0;

const ROUTE_CACHE_ENTRIES: usize = 4_096;

/// Result of a route query between two points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    /// Road-network distance in kilometres.
    pub distance_km: f64,
    /// Free-flow travel time in seconds.
    pub duration_secs: f64,
    /// Lat/lon waypoints along the road; endpoints only for the
    /// straight-line provider.
    pub waypoints: Vec<(f64, f64)>,
}

#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn route(&self, from: &GeoPoint, to: &GeoPoint) -> CoreResult<RouteResult>;
}

/// Which routing backend to use.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteProviderKind {
    /// Haversine distance scaled by a detour factor.
    StraightLine { detour_factor: f64 },
    /// OSRM HTTP endpoint (e.g. `"http://localhost:5000"`).
    #[cfg(feature = "osrm")]
    Osrm { endpoint: String },
}

impl RouteProviderKind {
    /// Build the provider, wrapped in the LRU cache.
    pub fn build(&self) -> Arc<dyn RouteProvider> {
        let inner: Arc<dyn RouteProvider> = match self {
            RouteProviderKind::StraightLine { detour_factor } => {
                Arc::new(StraightLineProvider::new(*detour_factor))
            }
            #[cfg(feature = "osrm")]
            RouteProviderKind::Osrm { endpoint } => {
                Arc::new(osrm::OsrmRouteProvider::new(endpoint))
            }
        };
        Arc::new(CachingRouteProvider::new(inner))
    }
}

/// Great-circle estimator: `haversine · detour_factor`.
#[derive(Debug, Clone, Copy)]
pub struct StraightLineProvider {
    detour_factor: f64,
}

impl StraightLineProvider {
    pub fn new(detour_factor: f64) -> Self {
        Self { detour_factor }
    }
}

#[async_trait]
impl RouteProvider for StraightLineProvider {
    async fn route(&self, from: &GeoPoint, to: &GeoPoint) -> CoreResult<RouteResult> {
        let distance_km = haversine_km(from, to) * self.detour_factor;
        Ok(RouteResult {
            distance_km,
            duration_secs: distance_km / FALLBACK_SPEED_KMH * 3_600.0,
            waypoints: vec![
                (from.latitude, from.longitude),
                (to.latitude, to.longitude),
            ],
        })
    }
}

/// Quantised cache key: ~1 m precision is plenty for route reuse.
fn cache_key(from: &GeoPoint, to: &GeoPoint) -> (i64, i64, i64, i64) {
    const SCALE: f64 = 1e5;
    (
        (from.latitude * SCALE).round() as i64,
        (from.longitude * SCALE).round() as i64,
        (to.latitude * SCALE).round() as i64,
        (to.longitude * SCALE).round() as i64,
    )
}

/// LRU decorator: returns cached geometry verbatim, queries on miss.
pub struct CachingRouteProvider {
    inner: Arc<dyn RouteProvider>,
    cache: Mutex<LruCache<(i64, i64, i64, i64), RouteResult>>,
}

impl CachingRouteProvider {
    pub fn new(inner: Arc<dyn RouteProvider>) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(ROUTE_CACHE_ENTRIES).expect("cache size must be non-zero"),
            )),
        }
    }
}

#[async_trait]
impl RouteProvider for CachingRouteProvider {
    async fn route(&self, from: &GeoPoint, to: &GeoPoint) -> CoreResult<RouteResult> {
        let key = cache_key(from, to);
        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            return Ok(hit);
        }
        let result = self.inner.route(from, to).await?;
        self.cache.lock().put(key, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn straight_line_applies_detour_factor() {
        let provider = StraightLineProvider::new(1.3);
        let from = GeoPoint::new(22.72, 75.86);
        let to = GeoPoint::new(22.75, 75.89);
        let route = provider.route(&from, &to).await.unwrap();
        let expected = haversine_km(&from, &to) * 1.3;
        assert!((route.distance_km - expected).abs() < 1e-9);
        assert!(route.duration_secs > 0.0);
        assert_eq!(route.waypoints.len(), 2);
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RouteProvider for CountingProvider {
        async fn route(&self, _from: &GeoPoint, _to: &GeoPoint) -> CoreResult<RouteResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RouteResult {
                distance_km: 3.0,
                duration_secs: 360.0,
                waypoints: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn cache_serves_repeat_queries() {
        let counting = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cached = CachingRouteProvider::new(counting.clone());
        let from = GeoPoint::new(22.72, 75.86);
        let to = GeoPoint::new(22.75, 75.89);

        cached.route(&from, &to).await.unwrap();
        cached.route(&from, &to).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        cached.route(&to, &from).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }
}
