//! Ride lifecycle transitions.
//!
//! ```text
//!           accept            arrive                start             complete
//! REQUESTED ──────▶ MATCHED ──────▶ DRIVER_ARRIVING ──────▶ IN_PROGRESS ──────▶ COMPLETED
//!     │                │                  │
//!     └─ cancel        └─ cancel          └─ cancel
//! ```
//!
//! Terminal states are COMPLETED and CANCELLED. Each function validates the
//! precondition against the ride's current state before mutating anything, so
//! callers holding the store entry get atomic check-and-apply. A rejected
//! transition surfaces `invalid_transition` and is never retried.
//!
//! Cancellation is not allowed from IN_PROGRESS: once the trip is moving the
//! only exit is `complete`.

use crate::error::{CoreError, CoreResult};
use crate::rides::{CancellationRecord, Ride, RideStatus};

/// `accept(driver)`: REQUESTED → MATCHED. Sets the driver and `matched_at`.
pub fn accept(ride: &mut Ride, driver_id: &str, now_ms: u64) -> CoreResult<()> {
    if ride.status != RideStatus::Requested {
        return Err(CoreError::InvalidTransition {
            from: ride.status,
            event: "accept",
        });
    }
    ride.driver_id = Some(driver_id.to_string());
    ride.status = RideStatus::Matched;
    ride.matched_at = Some(now_ms);
    ride.updated_at = now_ms;
    Ok(())
}

/// `arrive()`: MATCHED → DRIVER_ARRIVING, by the assigned driver only.
pub fn arrive(ride: &mut Ride, driver_id: &str, now_ms: u64) -> CoreResult<()> {
    if ride.status != RideStatus::Matched {
        return Err(CoreError::InvalidTransition {
            from: ride.status,
            event: "arrive",
        });
    }
    ensure_assigned(ride, driver_id)?;
    ride.status = RideStatus::DriverArriving;
    ride.driver_arriving_at = Some(now_ms);
    ride.updated_at = now_ms;
    Ok(())
}

/// `start()`: DRIVER_ARRIVING → IN_PROGRESS. Requires the driver's latest
/// sample to be within `max_distance_m` of the pickup.
pub fn start(
    ride: &mut Ride,
    driver_id: &str,
    distance_to_pickup_m: f64,
    max_distance_m: f64,
    now_ms: u64,
) -> CoreResult<()> {
    if ride.status != RideStatus::DriverArriving {
        return Err(CoreError::InvalidTransition {
            from: ride.status,
            event: "start",
        });
    }
    ensure_assigned(ride, driver_id)?;
    if distance_to_pickup_m >= max_distance_m {
        return Err(CoreError::Validation(format!(
            "driver is {distance_to_pickup_m:.0} m from the pickup (must be within {max_distance_m:.0} m)"
        )));
    }
    ride.status = RideStatus::InProgress;
    ride.started_at = Some(now_ms);
    ride.updated_at = now_ms;
    Ok(())
}

/// `complete(final_fare)`: IN_PROGRESS → COMPLETED.
pub fn complete(ride: &mut Ride, driver_id: &str, final_fare: f64, now_ms: u64) -> CoreResult<()> {
    if ride.status != RideStatus::InProgress {
        return Err(CoreError::InvalidTransition {
            from: ride.status,
            event: "complete",
        });
    }
    ensure_assigned(ride, driver_id)?;
    ride.status = RideStatus::Completed;
    ride.final_fare = Some(final_fare);
    ride.completed_at = Some(now_ms);
    ride.updated_at = now_ms;
    Ok(())
}

/// `cancel(actor, reason)`: allowed from REQUESTED, MATCHED, and
/// DRIVER_ARRIVING. Later timestamps stay null on a cancelled ride.
pub fn cancel(
    ride: &mut Ride,
    cancelled_by: &str,
    reason: &str,
    fee: f64,
    now_ms: u64,
) -> CoreResult<()> {
    match ride.status {
        RideStatus::Requested | RideStatus::Matched | RideStatus::DriverArriving => {}
        _ => {
            return Err(CoreError::InvalidTransition {
                from: ride.status,
                event: "cancel",
            })
        }
    }
    ride.status = RideStatus::Cancelled;
    ride.cancelled_at = Some(now_ms);
    ride.cancellation = Some(CancellationRecord {
        cancelled_by: cancelled_by.to_string(),
        reason: reason.to_string(),
        fee,
    });
    ride.updated_at = now_ms;
    Ok(())
}

fn ensure_assigned(ride: &Ride, driver_id: &str) -> CoreResult<()> {
    if ride.driver_id.as_deref() != Some(driver_id) {
        return Err(CoreError::Conflict(format!(
            "ride {} is assigned to a different driver",
            ride.ride_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FareConfig;
    use crate::pricing::{quote, DistanceSource};
    use crate::spatial::GeoPoint;

    fn requested_ride() -> Ride {
        Ride::new(
            "rider-1".into(),
            GeoPoint::new(22.72, 75.86),
            GeoPoint::new(22.75, 75.89),
            quote(&FareConfig::default(), 4.0, DistanceSource::Provider),
            1_000,
        )
    }

    #[test]
    fn full_happy_path_keeps_timestamps_ordered() {
        let mut ride = requested_ride();
        accept(&mut ride, "driver-1", 2_000).unwrap();
        arrive(&mut ride, "driver-1", 3_000).unwrap();
        start(&mut ride, "driver-1", 50.0, 200.0, 4_000).unwrap();
        complete(&mut ride, "driver-1", 84.0, 5_000).unwrap();

        assert_eq!(ride.status, RideStatus::Completed);
        assert!(ride.matched_at.unwrap() > ride.requested_at);
        assert!(ride.driver_arriving_at.unwrap() >= ride.matched_at.unwrap());
        assert!(ride.started_at.unwrap() >= ride.driver_arriving_at.unwrap());
        assert!(ride.completed_at.unwrap() > ride.started_at.unwrap());
        assert_eq!(ride.final_fare, Some(84.0));
    }

    #[test]
    fn accept_only_from_requested() {
        let mut ride = requested_ride();
        accept(&mut ride, "driver-1", 2_000).unwrap();
        let err = accept(&mut ride, "driver-2", 2_500).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        // The winning driver is untouched by the rejected second accept.
        assert_eq!(ride.driver_id.as_deref(), Some("driver-1"));
    }

    #[test]
    fn arrive_rejects_wrong_driver() {
        let mut ride = requested_ride();
        accept(&mut ride, "driver-1", 2_000).unwrap();
        let err = arrive(&mut ride, "driver-2", 3_000).unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(ride.status, RideStatus::Matched);
    }

    #[test]
    fn start_requires_proximity() {
        let mut ride = requested_ride();
        accept(&mut ride, "driver-1", 2_000).unwrap();
        arrive(&mut ride, "driver-1", 3_000).unwrap();
        let err = start(&mut ride, "driver-1", 350.0, 200.0, 4_000).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(ride.status, RideStatus::DriverArriving);
    }

    #[test]
    fn cancel_not_allowed_once_in_progress_or_terminal() {
        let mut ride = requested_ride();
        accept(&mut ride, "driver-1", 2_000).unwrap();
        arrive(&mut ride, "driver-1", 3_000).unwrap();
        start(&mut ride, "driver-1", 10.0, 200.0, 4_000).unwrap();

        let err = cancel(&mut ride, "rider-1", "changed my mind", 0.0, 4_500);
        assert_eq!(err.unwrap_err().kind(), "invalid_transition");

        complete(&mut ride, "driver-1", 90.0, 5_000).unwrap();
        let err = cancel(&mut ride, "rider-1", "too late", 0.0, 6_000);
        assert_eq!(err.unwrap_err().kind(), "invalid_transition");
    }

    #[test]
    fn cancelled_ride_keeps_later_timestamps_null() {
        let mut ride = requested_ride();
        accept(&mut ride, "driver-1", 2_000).unwrap();
        cancel(&mut ride, "rider-1", "waited too long", 50.0, 10_000).unwrap();

        assert_eq!(ride.status, RideStatus::Cancelled);
        assert!(ride.driver_arriving_at.is_none());
        assert!(ride.started_at.is_none());
        assert!(ride.completed_at.is_none());
        let record = ride.cancellation.unwrap();
        assert_eq!(record.fee, 50.0);
        assert_eq!(record.cancelled_by, "rider-1");
    }
}
