//! Driver availability registry.
//!
//! Only AVAILABLE drivers are candidates for offers. A BUSY driver owns
//! exactly one active ride; [`DriverDirectory::mark_busy`] enforces that with
//! a check-and-set under the driver's map entry, so two concurrent claims by
//! the same driver on different rides cannot both win.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::{CoreError, CoreResult};
use crate::rides::{RideId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    Available,
    Unavailable,
    Busy,
}

/// Offer-acceptance preferences declared by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriverPreferences {
    pub accept_extended_area: bool,
    pub accept_parcels: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub driver_id: UserId,
    pub status: AvailabilityStatus,
    pub active_ride: Option<RideId>,
    pub preferences: DriverPreferences,
    /// Set when the daily cancellation threshold is exceeded; lifted by the
    /// external driver-policy engine.
    pub flagged: bool,
    pub cancellations_today: u32,
    /// Resolved payout destination, when the driver has one on file.
    pub bank_account: Option<String>,
    pub vehicle: Option<serde_json::Value>,
    pub updated_at_ms: u64,
}

pub struct DriverDirectory {
    drivers: DashMap<UserId, DriverRecord>,
    clock: SharedClock,
    max_daily_cancellations: u32,
}

impl DriverDirectory {
    pub fn new(clock: SharedClock, max_daily_cancellations: u32) -> Self {
        Self {
            drivers: DashMap::new(),
            clock,
            max_daily_cancellations,
        }
    }

    /// Register (or re-register) a driver, initially UNAVAILABLE.
    pub fn register(&self, driver_id: &str, preferences: DriverPreferences) {
        let now = self.clock.now_ms();
        self.drivers
            .entry(driver_id.to_string())
            .and_modify(|r| {
                r.preferences = preferences;
                r.updated_at_ms = now;
            })
            .or_insert_with(|| DriverRecord {
                driver_id: driver_id.to_string(),
                status: AvailabilityStatus::Unavailable,
                active_ride: None,
                preferences,
                flagged: false,
                cancellations_today: 0,
                bank_account: None,
                vehicle: None,
                updated_at_ms: now,
            });
    }

    pub fn get(&self, driver_id: &str) -> Option<DriverRecord> {
        self.drivers.get(driver_id).map(|r| r.clone())
    }

    pub fn set_bank_account(&self, driver_id: &str, bank_account: impl Into<String>) {
        if let Some(mut r) = self.drivers.get_mut(driver_id) {
            r.bank_account = Some(bank_account.into());
        }
    }

    pub fn set_vehicle(&self, driver_id: &str, vehicle: serde_json::Value) {
        if let Some(mut r) = self.drivers.get_mut(driver_id) {
            r.vehicle = Some(vehicle);
        }
    }

    /// Driver comes on duty. Flagged drivers stay off the candidate pool.
    pub fn set_available(&self, driver_id: &str) -> CoreResult<()> {
        let mut record = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| CoreError::NotFound(format!("driver {driver_id}")))?;
        if record.status == AvailabilityStatus::Busy {
            return Err(CoreError::Conflict(format!(
                "driver {driver_id} has an active ride"
            )));
        }
        if record.flagged {
            return Err(CoreError::Conflict(format!(
                "driver {driver_id} is flagged and cannot go on duty"
            )));
        }
        record.status = AvailabilityStatus::Available;
        record.updated_at_ms = self.clock.now_ms();
        Ok(())
    }

    /// Driver goes off duty. Not allowed mid-ride.
    pub fn set_unavailable(&self, driver_id: &str) -> CoreResult<()> {
        let mut record = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| CoreError::NotFound(format!("driver {driver_id}")))?;
        if record.status == AvailabilityStatus::Busy {
            return Err(CoreError::Conflict(format!(
                "driver {driver_id} has an active ride"
            )));
        }
        record.status = AvailabilityStatus::Unavailable;
        record.updated_at_ms = self.clock.now_ms();
        Ok(())
    }

    /// AVAILABLE → BUSY bound to `ride_id`. Fails if the driver is anything
    /// but AVAILABLE, which is what makes a double-win impossible.
    pub fn mark_busy(&self, driver_id: &str, ride_id: &str) -> CoreResult<()> {
        let mut record = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| CoreError::NotFound(format!("driver {driver_id}")))?;
        if record.status != AvailabilityStatus::Available {
            return Err(CoreError::Conflict(format!(
                "driver {driver_id} is not available"
            )));
        }
        record.status = AvailabilityStatus::Busy;
        record.active_ride = Some(ride_id.to_string());
        record.updated_at_ms = self.clock.now_ms();
        Ok(())
    }

    /// Release the driver after a terminal ride transition: back to AVAILABLE
    /// unless flagged, in which case they land UNAVAILABLE.
    pub fn release(&self, driver_id: &str) -> CoreResult<()> {
        let mut record = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| CoreError::NotFound(format!("driver {driver_id}")))?;
        record.active_ride = None;
        record.status = if record.flagged {
            AvailabilityStatus::Unavailable
        } else {
            AvailabilityStatus::Available
        };
        record.updated_at_ms = self.clock.now_ms();
        Ok(())
    }

    pub fn is_available(&self, driver_id: &str) -> bool {
        self.drivers
            .get(driver_id)
            .map(|r| r.status == AvailabilityStatus::Available)
            .unwrap_or(false)
    }

    pub fn accepts_extended_area(&self, driver_id: &str) -> bool {
        self.drivers
            .get(driver_id)
            .map(|r| r.preferences.accept_extended_area)
            .unwrap_or(false)
    }

    /// Count a driver-initiated cancellation. Returns `true` if this one
    /// tripped the daily threshold and flagged the driver.
    pub fn record_cancellation(&self, driver_id: &str) -> CoreResult<bool> {
        let mut record = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| CoreError::NotFound(format!("driver {driver_id}")))?;
        record.cancellations_today += 1;
        record.updated_at_ms = self.clock.now_ms();
        if !record.flagged && record.cancellations_today > self.max_daily_cancellations {
            record.flagged = true;
            if record.status == AvailabilityStatus::Available {
                record.status = AvailabilityStatus::Unavailable;
            }
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn directory() -> DriverDirectory {
        DriverDirectory::new(Arc::new(ManualClock::new(1_000)), 2)
    }

    #[test]
    fn busy_driver_cannot_win_a_second_ride() {
        let dir = directory();
        dir.register("d1", DriverPreferences::default());
        dir.set_available("d1").unwrap();
        dir.mark_busy("d1", "ride-a").unwrap();

        let err = dir.mark_busy("d1", "ride-b").unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(dir.get("d1").unwrap().active_ride.as_deref(), Some("ride-a"));
    }

    #[test]
    fn release_returns_driver_to_available() {
        let dir = directory();
        dir.register("d1", DriverPreferences::default());
        dir.set_available("d1").unwrap();
        dir.mark_busy("d1", "ride-a").unwrap();
        dir.release("d1").unwrap();

        let record = dir.get("d1").unwrap();
        assert_eq!(record.status, AvailabilityStatus::Available);
        assert!(record.active_ride.is_none());
    }

    #[test]
    fn cancellations_past_threshold_flag_the_driver() {
        let dir = directory();
        dir.register("d1", DriverPreferences::default());
        dir.set_available("d1").unwrap();

        assert!(!dir.record_cancellation("d1").unwrap());
        assert!(!dir.record_cancellation("d1").unwrap());
        assert!(dir.record_cancellation("d1").unwrap());

        // Flagging pulls the driver from the pool and keeps them out.
        let record = dir.get("d1").unwrap();
        assert!(record.flagged);
        assert_eq!(record.status, AvailabilityStatus::Unavailable);
        assert_eq!(dir.set_available("d1").unwrap_err().kind(), "conflict");
    }

    #[test]
    fn unavailable_drivers_are_not_candidates() {
        let dir = directory();
        dir.register("d1", DriverPreferences::default());
        assert!(!dir.is_available("d1"));
        dir.set_available("d1").unwrap();
        assert!(dir.is_available("d1"));
        dir.set_unavailable("d1").unwrap();
        assert!(!dir.is_available("d1"));
    }
}
