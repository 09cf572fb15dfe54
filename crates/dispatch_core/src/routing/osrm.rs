//! OSRM HTTP route provider (feature `osrm`).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::routing::{RouteProvider, RouteResult};
use crate::spatial::GeoPoint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Thin HTTP client for the OSRM `/route` service.
#[derive(Debug, Clone)]
pub struct OsrmRouteProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl OsrmRouteProvider {
    /// Create a provider for the given OSRM endpoint
    /// (e.g. `http://localhost:5000`).
    pub fn new(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build OSRM client");
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    /// Metres.
    distance: f64,
    /// Seconds.
    duration: f64,
    geometry: OsrmGeometry,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    /// GeoJSON `[lon, lat]` pairs.
    coordinates: Vec<[f64; 2]>,
}

#[async_trait]
impl RouteProvider for OsrmRouteProvider {
    async fn route(&self, from: &GeoPoint, to: &GeoPoint) -> CoreResult<RouteResult> {
        let url = format!(
            "{}/route/v1/driving/{:.6},{:.6};{:.6},{:.6}?overview=full&geometries=geojson",
            self.endpoint, from.longitude, from.latitude, to.longitude, to.latitude
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::GatewayUnavailable(format!("osrm request: {e}")))?;
        let parsed: OsrmRouteResponse = response
            .json()
            .await
            .map_err(|e| CoreError::GatewayUnavailable(format!("osrm response: {e}")))?;

        if parsed.code != "Ok" {
            return Err(CoreError::GatewayUnavailable(format!(
                "osrm answered {}",
                parsed.code
            )));
        }
        let route = parsed.routes.into_iter().next().ok_or_else(|| {
            CoreError::GatewayUnavailable("osrm returned no routes".to_string())
        })?;

        Ok(RouteResult {
            distance_km: route.distance / 1000.0,
            duration_secs: route.duration,
            waypoints: route
                .geometry
                .coordinates
                .into_iter()
                .map(|[lon, lat]| (lat, lon))
                .collect(),
        })
    }
}
