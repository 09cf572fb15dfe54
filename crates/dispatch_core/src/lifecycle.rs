//! Lifecycle driver: external events → state machine + side effects.
//!
//! Arrival, trip start, completion, cancellation, and driver location events
//! land here. Each handler validates through the state machine (under the
//! ride's store entry), then fans out the side effects: availability changes,
//! realtime notifications, payment capture.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::{to_rfc3339, SharedClock, ONE_SEC_MS};
use crate::config::{FareConfig, MatchingConfig};
use crate::dispatch::Dispatcher;
use crate::drivers::DriverDirectory;
use crate::error::{CoreError, CoreResult};
use crate::location::LocationIndex;
use crate::payment::{GatewayKind, PaymentOrchestrator, Transaction, TransactionStatus};
use crate::pricing;
use crate::rides::{PaymentStatus, Ride, RideStatus, RideStore};
use crate::session::messages::ServerMessage;
use crate::session::registry::SessionRegistry;
use crate::spatial::{haversine_m, GeoPoint};
use crate::state_machine;

/// Gateway used for ride settlement; alternates live behind the same trait.
const SETTLEMENT_GATEWAY: GatewayKind = GatewayKind::Razorpay;

pub struct LifecycleDriver {
    clock: SharedClock,
    matching: MatchingConfig,
    fare: FareConfig,
    rides: Arc<RideStore>,
    drivers: Arc<DriverDirectory>,
    location: Arc<LocationIndex>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    payments: Arc<PaymentOrchestrator>,
}

impl LifecycleDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: SharedClock,
        matching: MatchingConfig,
        fare: FareConfig,
        rides: Arc<RideStore>,
        drivers: Arc<DriverDirectory>,
        location: Arc<LocationIndex>,
        sessions: Arc<SessionRegistry>,
        dispatcher: Arc<Dispatcher>,
        payments: Arc<PaymentOrchestrator>,
    ) -> Self {
        Self {
            clock,
            matching,
            fare,
            rides,
            drivers,
            location,
            sessions,
            dispatcher,
            payments,
        }
    }

    /// The assigned driver reports they are en route to the pickup.
    pub fn driver_arrived(&self, ride_id: &str, driver_id: &str) -> CoreResult<()> {
        let now_ms = self.clock.now_ms();
        self.rides
            .with_ride_mut(ride_id, |ride| state_machine::arrive(ride, driver_id, now_ms))
    }

    /// The assigned driver starts the trip at the pickup.
    pub fn trip_started(&self, ride_id: &str, driver_id: &str) -> CoreResult<()> {
        let ride = self.rides.get(ride_id)?;
        let distance_to_pickup_m = self
            .location
            .get(driver_id)
            .map(|sample| haversine_m(&sample.point, &ride.pickup))
            .ok_or_else(|| {
                CoreError::Validation(format!("no known location for driver {driver_id}"))
            })?;
        let now_ms = self.clock.now_ms();
        self.rides.with_ride_mut(ride_id, |ride| {
            state_machine::start(
                ride,
                driver_id,
                distance_to_pickup_m,
                self.matching.pickup_proximity_m,
                now_ms,
            )
        })
    }

    /// The assigned driver ends the trip. Applies fare protection, settles
    /// the payment, and schedules the payout through the orchestrator.
    ///
    /// `actual_distance_km` is the driver-reported trip distance; when absent
    /// the quoted distance stands.
    pub async fn trip_completed(
        &self,
        ride_id: &str,
        driver_id: &str,
        actual_distance_km: Option<f64>,
    ) -> CoreResult<Transaction> {
        let ride = self.rides.get(ride_id)?;
        let estimated = ride.estimated_fare;
        let actual_fare = match actual_distance_km {
            Some(distance_km) => self.fare.base_fare + distance_km * self.fare.per_km_rate,
            None => estimated,
        };
        let final_fare = pricing::protected_final_fare(&self.fare, estimated, actual_fare);
        let protection_applied = final_fare < actual_fare;

        let now_ms = self.clock.now_ms();
        self.rides.with_ride_mut(ride_id, |ride| {
            state_machine::complete(ride, driver_id, final_fare, now_ms)
        })?;
        self.drivers.release(driver_id)?;
        info!(ride_id, driver_id, final_fare, "trip completed");

        let ride = self.rides.get(ride_id)?;
        let mut breakdown = ride.fare_quote.breakdown.clone();
        breakdown.distance = final_fare - breakdown.base - breakdown.surcharges;
        breakdown.protection_applied = protection_applied;
        let completed = ServerMessage::RideCompleted {
            ride_id: ride_id.to_string(),
            final_fare,
            breakdown,
        };
        self.sessions.send(&ride.rider_id, completed.clone());
        self.sessions.send(driver_id, completed);

        let transaction = self
            .payments
            .process_payment(ride_id, final_fare, SETTLEMENT_GATEWAY)
            .await;
        match &transaction {
            Ok(transaction) => {
                let status = match transaction.status {
                    TransactionStatus::Success => PaymentStatus::Completed,
                    TransactionStatus::Failed => PaymentStatus::Failed,
                    TransactionStatus::Pending => PaymentStatus::Pending,
                };
                self.sessions.send(
                    &ride.rider_id,
                    ServerMessage::PaymentResult {
                        ride_id: ride_id.to_string(),
                        status,
                        transaction_id: Some(transaction.transaction_id.clone()),
                    },
                );
            }
            Err(e) => {
                warn!(ride_id, error = %e, "payment could not be attempted");
                self.sessions.send(
                    &ride.rider_id,
                    ServerMessage::PaymentResult {
                        ride_id: ride_id.to_string(),
                        status: PaymentStatus::Pending,
                        transaction_id: None,
                    },
                );
            }
        }
        transaction
    }

    /// Rider or assigned driver cancels the ride.
    pub fn cancel(&self, ride_id: &str, actor_id: &str, reason: &str) -> CoreResult<f64> {
        let ride = self.rides.get(ride_id)?;
        let now_ms = self.clock.now_ms();

        let actor_is_rider = ride.rider_id == actor_id;
        let actor_is_driver = ride.driver_id.as_deref() == Some(actor_id);
        if !actor_is_rider && !actor_is_driver {
            return Err(CoreError::Conflict(format!(
                "{actor_id} is not a party to ride {ride_id}"
            )));
        }

        let fee = if actor_is_rider {
            self.rider_cancellation_fee(&ride, now_ms)
        } else {
            0.0
        };

        self.rides.with_ride_mut(ride_id, |ride| {
            state_machine::cancel(ride, actor_id, reason, fee, now_ms)
        })?;

        if let Some(assigned) = ride.driver_id.as_deref() {
            if actor_is_driver {
                let flagged = self.drivers.record_cancellation(assigned)?;
                if flagged {
                    warn!(driver_id = assigned, "driver flagged for excessive cancellations");
                }
            }
            self.drivers.release(assigned)?;
        }

        let was_matching = self.dispatcher.on_ride_cancelled(ride_id);
        info!(ride_id, actor_id, fee, was_matching, "ride cancelled");

        // The counterparty (if any) hears about it directly; drivers holding
        // open offers are told by the matcher.
        let counterparty = if actor_is_rider {
            ride.driver_id.clone()
        } else {
            Some(ride.rider_id.clone())
        };
        if let Some(counterparty) = counterparty {
            self.sessions.send(
                &counterparty,
                ServerMessage::RideCancelled {
                    ride_id: ride_id.to_string(),
                    cancelled_by: actor_id.to_string(),
                    reason: reason.to_string(),
                    fee: (fee > 0.0).then_some(fee),
                },
            );
        }
        Ok(fee)
    }

    /// A location update from a driver on an active ride: forward to the
    /// rider and raise `driver_nearby` during DRIVER_ARRIVING.
    pub fn driver_location_event(
        &self,
        driver_id: &str,
        ride_id: &str,
        point: &GeoPoint,
        accuracy_m: Option<f64>,
    ) -> CoreResult<()> {
        let ride = self.rides.get(ride_id)?;
        if !ride.is_assigned_to(driver_id) {
            return Err(CoreError::Conflict(format!(
                "ride {ride_id} is not an active ride of driver {driver_id}"
            )));
        }

        let now_ms = self.clock.now_ms();
        self.sessions.send(
            &ride.rider_id,
            ServerMessage::DriverLocationUpdate {
                ride_id: ride_id.to_string(),
                driver_id: driver_id.to_string(),
                latitude: point.latitude,
                longitude: point.longitude,
                accuracy: accuracy_m,
                timestamp: to_rfc3339(now_ms),
            },
        );

        if ride.status == RideStatus::DriverArriving {
            let distance_meters = haversine_m(point, &ride.pickup);
            if distance_meters <= self.matching.proximity_notify_m {
                self.sessions.send(
                    &ride.rider_id,
                    ServerMessage::DriverNearby {
                        ride_id: ride_id.to_string(),
                        driver_id: driver_id.to_string(),
                        distance_meters: (distance_meters * 100.0).round() / 100.0,
                    },
                );
            }
        }
        Ok(())
    }

    fn rider_cancellation_fee(&self, ride: &Ride, now_ms: u64) -> f64 {
        match ride.status {
            RideStatus::Requested => 0.0,
            RideStatus::Matched | RideStatus::DriverArriving => {
                let matched_at = ride.matched_at.unwrap_or(now_ms);
                let free_window_ms = self.fare.free_cancel_window_secs * ONE_SEC_MS;
                if now_ms.saturating_sub(matched_at) <= free_window_ms {
                    0.0
                } else {
                    self.fare.cancellation_fee
                }
            }
            _ => 0.0,
        }
    }
}
