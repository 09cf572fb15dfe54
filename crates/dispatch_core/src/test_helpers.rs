//! Test helpers: an in-memory platform harness and scripted collaborators.
//!
//! This module provides shared test utilities to reduce duplication across
//! test modules: a fully wired [`DispatchCore`] with a manual clock, a
//! prefix-based token verifier, a scriptable payment gateway, and channel
//! draining helpers.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::clock::{Clock, ManualClock};
use crate::config::CoreConfig;
use crate::core::{CoreDependencies, DispatchCore};
use crate::error::{CoreError, CoreResult};
use crate::payment::gateway::{
    ChargeRequest, ChargeResponse, GatewayKind, PaymentGatewayApi, PayoutGatewayApi,
};
use crate::routing::RouteProviderKind;
use crate::session::messages::ServerMessage;
use crate::session::registry::{Claims, Outbound, TokenVerifier, UserType};
use crate::spatial::GeoPoint;

/// Verifier for tokens of the form `rider:<id>` / `driver:<id>`.
pub struct PrefixVerifier;

impl TokenVerifier for PrefixVerifier {
    fn verify(&self, token: &str) -> CoreResult<Claims> {
        let (user_type, user_id) = token
            .split_once(':')
            .ok_or_else(|| CoreError::Validation("malformed token".to_string()))?;
        let user_type = match user_type {
            "rider" => UserType::Rider,
            "driver" => UserType::Driver,
            _ => return Err(CoreError::Validation("unknown user type".to_string())),
        };
        Ok(Claims {
            user_id: user_id.to_string(),
            user_type,
            phone_verified: true,
        })
    }
}

/// Payment gateway with a scriptable outcome queue. An empty queue means
/// every call succeeds.
pub struct ScriptedChargeGateway {
    outcomes: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
}

impl ScriptedChargeGateway {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue outcomes for the next calls: `true` succeeds, `false` fails.
    pub fn script(&self, outcomes: &[bool]) {
        self.outcomes.lock().extend(outcomes.iter().copied());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PaymentGatewayApi for ScriptedChargeGateway {
    async fn create_payment(&self, request: &ChargeRequest) -> CoreResult<ChargeResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let succeed = self.outcomes.lock().pop_front().unwrap_or(true);
        if succeed {
            Ok(ChargeResponse {
                gateway_transaction_id: format!("gw-txn-{call}"),
                raw: serde_json::json!({
                    "status": "created",
                    "order_id": request.order_id,
                }),
            })
        } else {
            Err(CoreError::GatewayUnavailable("gateway declined".to_string()))
        }
    }

    async fn verify_payment(
        &self,
        _payment_id: &str,
        _order_id: &str,
        _signature: &str,
    ) -> CoreResult<bool> {
        Ok(true)
    }

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<f64>,
    ) -> CoreResult<serde_json::Value> {
        Ok(serde_json::json!({
            "refund_of": payment_id,
            "amount": amount,
        }))
    }
}

/// Payout gateway that always succeeds and counts transfers.
pub struct CountingPayoutGateway {
    pub transfers: AtomicUsize,
}

#[async_trait::async_trait]
impl PayoutGatewayApi for CountingPayoutGateway {
    async fn transfer(
        &self,
        payout_id: &str,
        _bank_account: &str,
        _amount: f64,
    ) -> CoreResult<serde_json::Value> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "payout_id": format!("gw-{payout_id}") }))
    }
}

pub struct TestPlatform {
    pub core: Arc<DispatchCore>,
    pub clock: Arc<ManualClock>,
    pub charge_gateway: Arc<ScriptedChargeGateway>,
    pub payout_gateway: Arc<CountingPayoutGateway>,
}

impl TestPlatform {
    /// Connect a rider session and return its outbound stream (with the
    /// `connection_established` frame already consumed).
    pub async fn connect_rider(&self, rider_id: &str) -> mpsc::Receiver<Outbound> {
        let (_claims, mut rx) = self
            .core
            .connect_session(&format!("rider:{rider_id}"))
            .expect("rider connect");
        let _ = rx.recv().await;
        rx
    }

    /// Register an available driver at the given position and connect their
    /// session.
    pub async fn add_driver(
        &self,
        driver_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> mpsc::Receiver<Outbound> {
        let drivers = self.core.drivers();
        drivers.register(driver_id, Default::default());
        drivers.set_available(driver_id).expect("set available");
        self.core
            .location()
            .upsert(
                driver_id,
                GeoPoint::new(latitude, longitude),
                Some(5.0),
                self.clock.now_ms(),
            )
            .expect("seed location");
        let (_claims, mut rx) = self
            .core
            .connect_session(&format!("driver:{driver_id}"))
            .expect("driver connect");
        let _ = rx.recv().await;
        rx
    }
}

/// Build a platform with the default config.
pub fn test_platform() -> TestPlatform {
    test_platform_with(CoreConfig::default())
}

/// Build a platform with a custom config.
pub fn test_platform_with(config: CoreConfig) -> TestPlatform {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let charge_gateway = Arc::new(ScriptedChargeGateway::new());
    let payout_gateway = Arc::new(CountingPayoutGateway {
        transfers: AtomicUsize::new(0),
    });

    let mut payment_gateways: HashMap<GatewayKind, Arc<dyn PaymentGatewayApi>> = HashMap::new();
    payment_gateways.insert(GatewayKind::Razorpay, charge_gateway.clone());

    let core = DispatchCore::new(
        config,
        clock.clone(),
        CoreDependencies {
            verifier: Arc::new(PrefixVerifier),
            route_provider: RouteProviderKind::StraightLine { detour_factor: 1.3 }.build(),
            payment_gateways,
            payout_gateway: payout_gateway.clone(),
        },
    );

    TestPlatform {
        core,
        clock,
        charge_gateway,
        payout_gateway,
    }
}

/// Seed a COMPLETED, not-yet-settled ride for payment-path tests.
pub fn seed_completed_ride(
    platform: &TestPlatform,
    rider_id: &str,
    driver_id: &str,
    fare: f64,
) -> String {
    use crate::pricing::{quote, DistanceSource};
    use crate::rides::{Ride, RideStatus};

    platform.core.drivers().register(driver_id, Default::default());
    platform
        .core
        .drivers()
        .set_bank_account(driver_id, "acct-test");

    let now_ms = platform.clock.now_ms();
    let mut ride = Ride::new(
        rider_id.to_string(),
        GeoPoint::new(22.72, 75.86),
        GeoPoint::new(22.75, 75.89),
        quote(
            &platform.core.config().fare,
            (fare - platform.core.config().fare.base_fare) / platform.core.config().fare.per_km_rate,
            DistanceSource::Provider,
        ),
        now_ms,
    );
    ride.driver_id = Some(driver_id.to_string());
    ride.status = RideStatus::Completed;
    ride.matched_at = Some(now_ms);
    ride.driver_arriving_at = Some(now_ms);
    ride.started_at = Some(now_ms);
    ride.completed_at = Some(now_ms);
    let ride_id = ride.ride_id.clone();
    platform.core.rides().insert(ride);
    ride_id
}

/// Await the next server message on a session stream, panicking on close.
pub async fn next_message(rx: &mut mpsc::Receiver<Outbound>) -> ServerMessage {
    match rx.recv().await.expect("channel open") {
        Outbound::Message(envelope) => envelope.message,
        Outbound::Close { reason, .. } => panic!("unexpected close: {reason}"),
    }
}

/// Collect everything currently buffered on a session stream.
pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(outbound) = rx.try_recv() {
        if let Outbound::Message(envelope) = outbound {
            messages.push(envelope.message);
        }
    }
    messages
}

/// Let spawned tasks (matchers, routers) run their pending steps.
pub async fn yield_tasks() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
