//! Process-wide wiring of the dispatch core.
//!
//! [`DispatchCore`] owns the stores, the session registry, the dispatcher,
//! and the payment orchestrator, and exposes the handful of entry points the
//! embedding shell calls: `submit_ride`, session connect/spawn, lifecycle
//! events, and shutdown. Everything is built explicitly at startup and
//! injected through constructors; there are no module-level singletons.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::CoreConfig;
use crate::coordination::CoordinationStore;
use crate::dispatch::Dispatcher;
use crate::drivers::DriverDirectory;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::LifecycleDriver;
use crate::location::LocationIndex;
use crate::payment::payout::run_payout_sweeper;
use crate::payment::{
    GatewayKind, PaymentGatewayApi, PaymentOrchestrator, PayoutGatewayApi, PayoutStore,
    TransactionStore,
};
use crate::pricing::{self, DistanceSource};
use crate::rides::{Ride, RideId, RideStore};
use crate::routing::RouteProvider;
use crate::session::registry::{Claims, Outbound, SessionRegistry, TokenVerifier};
use crate::session::router::SessionRouter;
use crate::spatial::{haversine_km, AreaCheck, GeoPoint};

/// External collaborators injected at startup.
pub struct CoreDependencies {
    pub verifier: Arc<dyn TokenVerifier>,
    pub route_provider: Arc<dyn RouteProvider>,
    pub payment_gateways: HashMap<GatewayKind, Arc<dyn PaymentGatewayApi>>,
    pub payout_gateway: Arc<dyn PayoutGatewayApi>,
}

pub struct DispatchCore {
    config: CoreConfig,
    clock: SharedClock,
    verifier: Arc<dyn TokenVerifier>,
    route_provider: Arc<dyn RouteProvider>,
    rides: Arc<RideStore>,
    drivers: Arc<DriverDirectory>,
    location: Arc<LocationIndex>,
    coordination: Arc<CoordinationStore>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    payments: Arc<PaymentOrchestrator>,
    lifecycle: Arc<LifecycleDriver>,
    router: Arc<SessionRouter>,
    shutdown_tx: watch::Sender<bool>,
}

impl DispatchCore {
    pub fn new(config: CoreConfig, clock: SharedClock, deps: CoreDependencies) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let rides = Arc::new(RideStore::new());
        let drivers = Arc::new(DriverDirectory::new(
            clock.clone(),
            config.max_daily_driver_cancellations,
        ));
        let location = Arc::new(LocationIndex::new(
            clock.clone(),
            config.matching.stale_location_ttl_secs,
        ));
        let coordination = Arc::new(CoordinationStore::new());
        let sessions = Arc::new(SessionRegistry::new(clock.clone(), &config.session));

        let dispatcher = Arc::new(Dispatcher::new(
            config.matching,
            config.service_area.clone(),
            clock.clone(),
            location.clone(),
            drivers.clone(),
            rides.clone(),
            coordination.clone(),
            sessions.clone(),
            shutdown_rx.clone(),
        ));

        let payments = Arc::new(PaymentOrchestrator::new(
            clock.clone(),
            config.payment,
            deps.payment_gateways,
            Arc::new(TransactionStore::new()),
            Arc::new(PayoutStore::new()),
            rides.clone(),
            drivers.clone(),
        ));

        let lifecycle = Arc::new(LifecycleDriver::new(
            clock.clone(),
            config.matching,
            config.fare,
            rides.clone(),
            drivers.clone(),
            location.clone(),
            sessions.clone(),
            dispatcher.clone(),
            payments.clone(),
        ));

        let router = Arc::new(SessionRouter::new(
            clock.clone(),
            config.session,
            sessions.clone(),
            location.clone(),
            dispatcher.clone(),
            lifecycle.clone(),
        ));

        let core = Arc::new(Self {
            config,
            clock,
            verifier: deps.verifier,
            route_provider: deps.route_provider,
            rides,
            drivers,
            location,
            coordination,
            sessions,
            dispatcher,
            payments,
            lifecycle,
            router,
            shutdown_tx,
        });

        core.spawn_background(deps.payout_gateway);
        core
    }

    fn spawn_background(self: &Arc<Self>, payout_gateway: Arc<dyn PayoutGatewayApi>) {
        tokio::spawn(run_payout_sweeper(
            self.payments.payouts().clone(),
            payout_gateway,
            self.clock.clone(),
            self.config.payment.payout_sweep_interval_secs,
            self.shutdown_tx.subscribe(),
        ));

        // Broadcast-expiry and claim cleanup sweeper.
        let coordination = self.coordination.clone();
        let clock = self.clock.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let sweep_secs = self.config.matching.round_timeout_secs;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(sweep_secs)) => {
                        coordination.purge_expired(clock.now_ms());
                    }
                }
            }
        });
    }

    /// Create a ride and launch its matcher task.
    ///
    /// Validates both endpoints against the service area, quotes the fare
    /// (falling back to the straight-line estimate when the route provider is
    /// unavailable), persists the ride in REQUESTED, and returns immediately;
    /// matching proceeds asynchronously.
    pub async fn submit_ride(
        self: &Arc<Self>,
        rider_id: &str,
        pickup: GeoPoint,
        destination: GeoPoint,
    ) -> CoreResult<RideId> {
        for (label, point) in [("pickup", &pickup), ("destination", &destination)] {
            if self.config.service_area.validate_point(point) == AreaCheck::Outside {
                return Err(CoreError::Validation(format!(
                    "{label} is outside the service area"
                )));
            }
        }

        let quote = match self.route_provider.route(&pickup, &destination).await {
            Ok(route) => pricing::quote(
                &self.config.fare,
                route.distance_km,
                DistanceSource::Provider,
            ),
            Err(e) => {
                warn!(error = %e, "route provider unavailable, quoting straight-line estimate");
                let distance_km =
                    haversine_km(&pickup, &destination) * self.config.fare.route_detour_factor;
                pricing::quote(
                    &self.config.fare,
                    distance_km,
                    DistanceSource::StraightLineEstimate,
                )
            }
        };

        let ride = Ride::new(
            rider_id.to_string(),
            pickup,
            destination,
            quote,
            self.clock.now_ms(),
        );
        let ride_id = ride.ride_id.clone();
        self.rides.insert(ride);
        self.dispatcher.spawn_matcher(ride_id.clone());
        info!(%ride_id, rider_id, "ride submitted");
        Ok(ride_id)
    }

    /// Authenticate a token and register the session. Returns the claims and
    /// the outbound stream the transport must drain.
    pub fn connect_session(
        &self,
        token: &str,
    ) -> CoreResult<(Claims, mpsc::Receiver<Outbound>)> {
        self.sessions
            .authenticate_and_connect(self.verifier.as_ref(), token)
    }

    /// Spawn the reader task for a connected session. The transport feeds raw
    /// inbound frames into the returned-handle's channel counterpart.
    pub fn spawn_session(
        self: &Arc<Self>,
        claims: Claims,
        inbound: mpsc::Receiver<String>,
    ) -> JoinHandle<()> {
        let router = self.router.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            router.run(claims, inbound, shutdown).await;
        })
    }

    /// Flip the shutdown signal; every matcher, router, and sweeper observes
    /// it at its next suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn rides(&self) -> &Arc<RideStore> {
        &self.rides
    }

    pub fn drivers(&self) -> &Arc<DriverDirectory> {
        &self.drivers
    }

    pub fn location(&self) -> &Arc<LocationIndex> {
        &self.location
    }

    pub fn coordination(&self) -> &Arc<CoordinationStore> {
        &self.coordination
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn payments(&self) -> &Arc<PaymentOrchestrator> {
        &self.payments
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleDriver> {
        &self.lifecycle
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }
}

impl Drop for DispatchCore {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
