//! The Ride aggregate and its authoritative store.
//!
//! Every mutation goes through [`RideStore::with_ride_mut`], which holds the
//! ride's map entry for the duration of the closure. That serialises
//! transitions per ride id; the state machine relies on it.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::pricing::FareQuote;
use crate::spatial::GeoPoint;

pub type RideId = String;
pub type UserId = String;

/// Cancellation reason recorded when matching exhausts every round.
pub const REASON_NO_DRIVER_FOUND: &str = "no_driver_found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Requested,
    Matched,
    DriverArriving,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// The driver is bound to the ride in these states.
    pub fn is_active_assignment(self) -> bool {
        matches!(
            self,
            RideStatus::Matched | RideStatus::DriverArriving | RideStatus::InProgress
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Matched => "matched",
            RideStatus::DriverArriving => "driver_arriving",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub cancelled_by: UserId,
    pub reason: String,
    pub fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub ride_id: RideId,
    pub rider_id: UserId,
    pub driver_id: Option<UserId>,
    pub status: RideStatus,
    pub pickup: GeoPoint,
    pub destination: GeoPoint,
    pub estimated_fare: f64,
    pub fare_quote: FareQuote,
    pub final_fare: Option<f64>,
    pub payment_status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub requested_at: u64,
    pub matched_at: Option<u64>,
    pub driver_arriving_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub cancelled_at: Option<u64>,
    pub cancellation: Option<CancellationRecord>,
    pub updated_at: u64,
}

impl Ride {
    pub fn new(
        rider_id: UserId,
        pickup: GeoPoint,
        destination: GeoPoint,
        fare_quote: FareQuote,
        now_ms: u64,
    ) -> Self {
        Self {
            ride_id: Uuid::new_v4().to_string(),
            rider_id,
            driver_id: None,
            status: RideStatus::Requested,
            pickup,
            destination,
            estimated_fare: fare_quote.total,
            fare_quote,
            final_fare: None,
            payment_status: PaymentStatus::Pending,
            transaction_id: None,
            requested_at: now_ms,
            matched_at: None,
            driver_arriving_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation: None,
            updated_at: now_ms,
        }
    }

    /// True when `driver_id` is the assigned driver of a live ride.
    pub fn is_assigned_to(&self, driver_id: &str) -> bool {
        self.status.is_active_assignment() && self.driver_id.as_deref() == Some(driver_id)
    }
}

/// In-memory authoritative ride store.
#[derive(Default)]
pub struct RideStore {
    rides: DashMap<RideId, Ride>,
}

impl RideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ride: Ride) {
        self.rides.insert(ride.ride_id.clone(), ride);
    }

    pub fn get(&self, ride_id: &str) -> CoreResult<Ride> {
        self.rides
            .get(ride_id)
            .map(|r| r.clone())
            .ok_or_else(|| CoreError::NotFound(format!("ride {ride_id}")))
    }

    pub fn try_get(&self, ride_id: &str) -> Option<Ride> {
        self.rides.get(ride_id).map(|r| r.clone())
    }

    /// Run `f` with exclusive access to the ride. Transitions for the same
    /// ride are serialised here; a closure error leaves prior mutations in
    /// place, so closures must validate before mutating.
    pub fn with_ride_mut<T>(
        &self,
        ride_id: &str,
        f: impl FnOnce(&mut Ride) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut entry = self
            .rides
            .get_mut(ride_id)
            .ok_or_else(|| CoreError::NotFound(format!("ride {ride_id}")))?;
        f(entry.value_mut())
    }

    pub fn len(&self) -> usize {
        self.rides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rides.is_empty()
    }
}
