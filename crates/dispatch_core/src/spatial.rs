//! Spatial primitives: geopoints, haversine distance, service-area checks.
//!
//! Distances are great-circle (haversine on WGS84, R = 6371 km). Service
//! areas are two axis-aligned bounding boxes; containment is inclusive, so a
//! point exactly on the primary boundary counts as inside it.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres (WGS84).
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            address: None,
        }
    }

    pub fn with_address(latitude: f64, longitude: f64, address: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            address: Some(address.into()),
        }
    }
}

/// Haversine distance between two points in kilometres.
pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let (lat1, lon1) = (a.latitude.to_radians(), a.longitude.to_radians());
    let (lat2, lon2) = (b.latitude.to_radians(), b.longitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Haversine distance in metres.
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_km(a, b) * 1000.0
}

/// Axis-aligned latitude/longitude interval. Containment is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn new(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> Self {
        Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.latitude >= self.lat_min
            && point.latitude <= self.lat_max
            && point.longitude >= self.lon_min
            && point.longitude <= self.lon_max
    }
}

/// Outcome of a service-area check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaCheck {
    WithinPrimary,
    WithinExtended,
    Outside,
}

/// Primary and extended service boundaries. Rides whose pickup or destination
/// falls outside both fail at submission; extended-area pickups are only
/// offered to drivers who opted in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceArea {
    pub primary: BoundingBox,
    pub extended: BoundingBox,
}

impl ServiceArea {
    pub fn validate_point(&self, point: &GeoPoint) -> AreaCheck {
        if self.primary.contains(point) {
            AreaCheck::WithinPrimary
        } else if self.extended.contains(point) {
            AreaCheck::WithinExtended
        } else {
            AreaCheck::Outside
        }
    }
}

impl Default for ServiceArea {
    /// Indore city boundaries with a small extended ring around them.
    fn default() -> Self {
        Self {
            primary: BoundingBox::new(22.6, 22.8, 75.7, 75.9),
            extended: BoundingBox::new(22.5, 22.9, 75.6, 76.0),
        }
    }
}
