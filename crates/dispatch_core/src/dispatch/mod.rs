//! Dispatcher / matching engine.
//!
//! One matcher task per live ride walks the radius-expansion protocol:
//! query nearby available drivers, offer the ride to the newcomers, wait a
//! round for a claim, widen, until a driver wins, the rider cancels, or the
//! overall deadline passes. Matchers for distinct rides run in parallel and
//! suspend only on the claim signal, the round timer, and shutdown.
//!
//! Acceptance is a single-winner race: a driver must first take the ride's
//! claim slot (set-if-absent, short TTL), then flip their own availability
//! AVAILABLE→BUSY, then drive the state machine REQUESTED→MATCHED. Losing any
//! of those steps unwinds the earlier ones, so no partial win can leak.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{to_rfc3339, SharedClock, ONE_SEC_MS};
use crate::config::MatchingConfig;
use crate::coordination::{BroadcastRecord, ClaimOutcome, CoordinationStore};
use crate::drivers::DriverDirectory;
use crate::error::CoreError;
use crate::location::LocationIndex;
use crate::rides::{RideId, RideStatus, RideStore, REASON_NO_DRIVER_FOUND};
use crate::routing::FALLBACK_SPEED_KMH;
use crate::session::messages::{
    ServerMessage, REASON_ALREADY_MATCHED, REASON_ALREADY_TERMINAL, REASON_ERROR,
    REASON_MATCHED_ELSEWHERE, REASON_RIDE_CANCELLED,
};
use crate::session::registry::SessionRegistry;
use crate::spatial::{haversine_km, AreaCheck, ServiceArea};
use crate::state_machine;

/// Outcome of a driver's accept attempt, mirrored to the wire replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// This driver won; confirmations and loser cancellations were sent.
    Confirmed,
    /// Another driver already holds the ride.
    AlreadyMatched,
    /// The ride reached a terminal state before the accept.
    AlreadyTerminal,
    /// Another driver's claim is in flight; the sender may retry.
    Processing,
    /// Unknown ride or driver-side failure.
    Failed,
}

enum MatchSignal {
    Claimed,
    Cancelled,
}

enum MatchEnd {
    Matched,
    Cancelled,
    TimedOut,
    Gone,
    Shutdown,
}

struct ActiveMatch {
    signal_tx: mpsc::Sender<MatchSignal>,
}

pub struct Dispatcher {
    config: MatchingConfig,
    service_area: ServiceArea,
    clock: SharedClock,
    location: Arc<LocationIndex>,
    drivers: Arc<DriverDirectory>,
    rides: Arc<RideStore>,
    coordination: Arc<CoordinationStore>,
    sessions: Arc<SessionRegistry>,
    active: DashMap<RideId, ActiveMatch>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MatchingConfig,
        service_area: ServiceArea,
        clock: SharedClock,
        location: Arc<LocationIndex>,
        drivers: Arc<DriverDirectory>,
        rides: Arc<RideStore>,
        coordination: Arc<CoordinationStore>,
        sessions: Arc<SessionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            service_area,
            clock,
            location,
            drivers,
            rides,
            coordination,
            sessions,
            active: DashMap::new(),
            shutdown,
        }
    }

    /// Launch the matcher task for a freshly created ride.
    pub fn spawn_matcher(self: &Arc<Self>, ride_id: RideId) -> JoinHandle<()> {
        let (signal_tx, signal_rx) = mpsc::channel(4);
        self.active.insert(ride_id.clone(), ActiveMatch { signal_tx });
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run_matcher(ride_id, signal_rx).await;
        })
    }

    /// True while a matcher task is live for the ride.
    pub fn is_matching(&self, ride_id: &str) -> bool {
        self.active.contains_key(ride_id)
    }

    async fn run_matcher(&self, ride_id: RideId, mut signal_rx: mpsc::Receiver<MatchSignal>) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.match_timeout_secs);
        let mut radius_km = self.config.initial_search_radius_km;
        let mut notified: HashSet<String> = HashSet::new();
        let mut shutdown = self.shutdown.clone();
        let mut round: u32 = 0;

        let end = loop {
            let Some(ride) = self.rides.try_get(&ride_id) else {
                break MatchEnd::Gone;
            };
            if ride.status != RideStatus::Requested {
                break MatchEnd::Gone;
            }
            let extended_pickup = matches!(
                self.service_area.validate_point(&ride.pickup),
                AreaCheck::WithinExtended
            );
            let now_ms = self.clock.now_ms();

            let candidates = match self.location.query_nearby(&ride.pickup, radius_km, |d| {
                self.drivers.is_available(d)
                    && !notified.contains(d)
                    && !self.coordination.is_rejected(&ride_id, d, now_ms)
                    && (!extended_pickup || self.drivers.accepts_extended_area(d))
            }) {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(%ride_id, error = %e, "candidate query failed, skipping round");
                    Vec::new()
                }
            };

            let expires_at_ms = now_ms + self.config.round_timeout_secs * ONE_SEC_MS;
            let expires_at = to_rfc3339(expires_at_ms);
            for candidate in &candidates {
                let offer = ServerMessage::RideOffer {
                    ride_id: ride_id.clone(),
                    pickup: ride.pickup.clone(),
                    destination: ride.destination.clone(),
                    estimated_fare: ride.estimated_fare,
                    distance_km: candidate.distance_km,
                    expires_at: expires_at.clone(),
                };
                // A failed send leaves the driver un-notified; the next round
                // reselects them.
                if self.sessions.send(&candidate.driver_id, offer) {
                    notified.insert(candidate.driver_id.clone());
                }
            }
            debug!(
                %ride_id,
                round,
                radius_km,
                offered = candidates.len(),
                notified = notified.len(),
                "broadcast round"
            );

            let rejected = self
                .coordination
                .get_broadcast(&ride_id)
                .map(|r| r.rejected)
                .unwrap_or_default();
            self.coordination.put_broadcast(BroadcastRecord {
                ride_id: ride_id.clone(),
                notified: notified.clone(),
                rejected,
                radius_km,
                expires_at_ms,
            });

            let round_deadline = tokio::time::Instant::now()
                + Duration::from_secs(self.config.round_timeout_secs);
            let wait_until = round_deadline.min(deadline);
            tokio::select! {
                signal = signal_rx.recv() => match signal {
                    Some(MatchSignal::Claimed) => break MatchEnd::Matched,
                    Some(MatchSignal::Cancelled) | None => break MatchEnd::Cancelled,
                },
                _ = tokio::time::sleep_until(wait_until) => {}
                _ = shutdown.changed() => break MatchEnd::Shutdown,
            }

            if tokio::time::Instant::now() >= deadline {
                break MatchEnd::TimedOut;
            }
            let next_radius = radius_km + self.config.search_radius_expansion_km;
            if next_radius > self.config.max_search_radius_km {
                break MatchEnd::TimedOut;
            }
            radius_km = next_radius;
            round += 1;
        };

        self.active.remove(&ride_id);
        match end {
            MatchEnd::Matched => {
                info!(%ride_id, "ride matched");
            }
            MatchEnd::Cancelled => {
                let targets = self
                    .coordination
                    .remove_broadcast(&ride_id)
                    .map(|r| r.notified)
                    .unwrap_or(notified);
                let cancelled = ServerMessage::RideNoLongerAvailable {
                    ride_id: ride_id.clone(),
                    reason: REASON_RIDE_CANCELLED.to_string(),
                };
                let targets: Vec<String> = targets.into_iter().collect();
                self.sessions.broadcast(&targets, &cancelled);
                info!(%ride_id, "matching cancelled by rider");
            }
            MatchEnd::TimedOut => {
                self.coordination.remove_broadcast(&ride_id);
                let now_ms = self.clock.now_ms();
                let cancelled = self.rides.with_ride_mut(&ride_id, |ride| {
                    state_machine::cancel(ride, "system", REASON_NO_DRIVER_FOUND, 0.0, now_ms)
                });
                match cancelled {
                    Ok(()) => {
                        if let Some(ride) = self.rides.try_get(&ride_id) {
                            self.sessions.send(
                                &ride.rider_id,
                                ServerMessage::RideMatchFailed {
                                    ride_id: ride_id.clone(),
                                    reason: REASON_NO_DRIVER_FOUND.to_string(),
                                },
                            );
                        }
                        info!(%ride_id, "no driver found before the deadline");
                    }
                    Err(e) => {
                        // Raced with a last-instant accept or cancel; the
                        // winning transition stands.
                        debug!(%ride_id, error = %e, "timeout lost the race");
                    }
                }
            }
            MatchEnd::Gone | MatchEnd::Shutdown => {
                self.coordination.remove_broadcast(&ride_id);
            }
        }
    }

    /// Handle a driver's `ride_accept`: the single-winner race.
    pub fn claim(&self, ride_id: &str, driver_id: &str) -> AcceptOutcome {
        let now_ms = self.clock.now_ms();
        let Some(ride) = self.rides.try_get(ride_id) else {
            self.sessions.send(
                driver_id,
                ServerMessage::RideMatchFailed {
                    ride_id: ride_id.to_string(),
                    reason: REASON_ERROR.to_string(),
                },
            );
            return AcceptOutcome::Failed;
        };
        if ride.status != RideStatus::Requested {
            let reason = if ride.status.is_terminal() {
                REASON_ALREADY_TERMINAL
            } else {
                REASON_ALREADY_MATCHED
            };
            self.sessions.send(
                driver_id,
                ServerMessage::RideMatchFailed {
                    ride_id: ride_id.to_string(),
                    reason: reason.to_string(),
                },
            );
            return if reason == REASON_ALREADY_MATCHED {
                AcceptOutcome::AlreadyMatched
            } else {
                AcceptOutcome::AlreadyTerminal
            };
        }

        match self
            .coordination
            .try_claim(ride_id, driver_id, self.config.claim_ttl_secs, now_ms)
        {
            ClaimOutcome::HeldBy(holder) => {
                debug!(ride_id, driver_id, %holder, "claim already held");
                self.sessions.send(
                    driver_id,
                    ServerMessage::RideMatchProcessing {
                        ride_id: ride_id.to_string(),
                    },
                );
                return AcceptOutcome::Processing;
            }
            ClaimOutcome::Acquired => {}
        }

        if let Err(e) = self.drivers.mark_busy(driver_id, ride_id) {
            self.coordination.release_claim(ride_id, driver_id);
            warn!(ride_id, driver_id, error = %e, "accepting driver is not available");
            self.sessions.send(
                driver_id,
                ServerMessage::RideMatchFailed {
                    ride_id: ride_id.to_string(),
                    reason: REASON_ERROR.to_string(),
                },
            );
            return AcceptOutcome::Failed;
        }

        let accepted = self
            .rides
            .with_ride_mut(ride_id, |ride| state_machine::accept(ride, driver_id, now_ms));
        if let Err(e) = accepted {
            let _ = self.drivers.release(driver_id);
            self.coordination.release_claim(ride_id, driver_id);
            let (reason, outcome) = match e {
                CoreError::InvalidTransition {
                    from: RideStatus::Cancelled | RideStatus::Completed,
                    ..
                } => (REASON_ALREADY_TERMINAL, AcceptOutcome::AlreadyTerminal),
                CoreError::InvalidTransition { .. } => {
                    (REASON_ALREADY_MATCHED, AcceptOutcome::AlreadyMatched)
                }
                _ => (REASON_ERROR, AcceptOutcome::Failed),
            };
            self.sessions.send(
                driver_id,
                ServerMessage::RideMatchFailed {
                    ride_id: ride_id.to_string(),
                    reason: reason.to_string(),
                },
            );
            return outcome;
        }

        self.announce_match(ride_id, driver_id, now_ms);
        self.coordination.release_claim(ride_id, driver_id);
        if let Some(active) = self.active.get(ride_id) {
            let _ = active.signal_tx.try_send(MatchSignal::Claimed);
        }
        info!(ride_id, driver_id, "accept won the claim race");
        AcceptOutcome::Confirmed
    }

    fn announce_match(&self, ride_id: &str, driver_id: &str, now_ms: u64) {
        let Some(ride) = self.rides.try_get(ride_id) else {
            return;
        };

        self.sessions.send(
            driver_id,
            ServerMessage::RideMatchConfirmed {
                ride_id: ride_id.to_string(),
                rider_id: ride.rider_id.clone(),
                pickup: ride.pickup.clone(),
                destination: ride.destination.clone(),
                estimated_fare: ride.estimated_fare,
            },
        );

        let distance_to_pickup_km = self
            .location
            .get(driver_id)
            .map(|sample| haversine_km(&sample.point, &ride.pickup))
            .unwrap_or(0.0);
        let eta_minutes = distance_to_pickup_km / FALLBACK_SPEED_KMH * 60.0;
        self.sessions.send(
            &ride.rider_id,
            ServerMessage::RideMatched {
                ride_id: ride_id.to_string(),
                driver_id: driver_id.to_string(),
                vehicle: self.drivers.get(driver_id).and_then(|r| r.vehicle),
                eta_minutes,
                distance_to_pickup_km,
                matched_at: to_rfc3339(now_ms),
            },
        );

        if let Some(record) = self.coordination.remove_broadcast(ride_id) {
            let losers: Vec<String> = record
                .notified
                .into_iter()
                .filter(|d| d != driver_id)
                .collect();
            let gone = ServerMessage::RideNoLongerAvailable {
                ride_id: ride_id.to_string(),
                reason: REASON_MATCHED_ELSEWHERE.to_string(),
            };
            self.sessions.broadcast(&losers, &gone);
        }
    }

    /// Handle a driver's `ride_reject`: remember the refusal for this ride's
    /// whole matching window so expansion never re-offers it to them.
    pub fn reject(&self, ride_id: &str, driver_id: &str) {
        let now_ms = self.clock.now_ms();
        self.coordination.record_rejection(
            ride_id,
            driver_id,
            self.config.match_timeout_secs,
            now_ms,
        );
        self.coordination.add_rejected_to_broadcast(ride_id, driver_id);
        debug!(ride_id, driver_id, "offer rejected");
        self.sessions.send(
            driver_id,
            ServerMessage::RideRejectConfirmed {
                ride_id: ride_id.to_string(),
            },
        );
    }

    /// Called when a ride is cancelled while its matcher may be live. The
    /// matcher notifies the offered drivers and deletes the broadcast record.
    pub fn on_ride_cancelled(&self, ride_id: &str) -> bool {
        if let Some(active) = self.active.get(ride_id) {
            let _ = active.signal_tx.try_send(MatchSignal::Cancelled);
            true
        } else {
            false
        }
    }
}
