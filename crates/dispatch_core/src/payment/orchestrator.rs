//! Payment capture with bounded retries and breaker isolation.
//!
//! `process_payment` owns the whole retry policy: nobody else in the core
//! retries gateway calls. Retries mutate the same Transaction record (same
//! id, monotone `retry_count`); backoff doubles per attempt (1 s, 2 s, 4 s).
//! A ride can have at most one SUCCESS transaction, and re-processing a paid
//! ride returns the existing record without gateway I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{SharedClock, ONE_HOUR_MS};
use crate::config::PaymentConfig;
use crate::drivers::DriverDirectory;
use crate::error::{CoreError, CoreResult};
use crate::payment::breaker::CircuitBreaker;
use crate::payment::gateway::{ChargeRequest, GatewayKind, PaymentGatewayApi};
use crate::payment::payout::PayoutStore;
use crate::pricing;
use crate::rides::{PaymentStatus, RideId, RideStore, UserId};
use crate::session::registry::UserType;

pub type TransactionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub ride_id: RideId,
    pub rider_id: UserId,
    pub driver_id: UserId,
    pub amount: f64,
    pub gateway: GatewayKind,
    pub status: TransactionStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub retry_count: u32,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

#[derive(Default)]
pub struct TransactionStore {
    transactions: DashMap<TransactionId, Transaction>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, transaction: Transaction) {
        self.transactions
            .insert(transaction.transaction_id.clone(), transaction);
    }

    pub fn get(&self, transaction_id: &str) -> CoreResult<Transaction> {
        self.transactions
            .get(transaction_id)
            .map(|t| t.clone())
            .ok_or_else(|| CoreError::NotFound(format!("transaction {transaction_id}")))
    }

    pub fn with_mut<T>(
        &self,
        transaction_id: &str,
        f: impl FnOnce(&mut Transaction) -> T,
    ) -> CoreResult<T> {
        let mut entry = self
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| CoreError::NotFound(format!("transaction {transaction_id}")))?;
        Ok(f(entry.value_mut()))
    }

    /// The SUCCESS transaction for a ride, if any. At most one exists.
    pub fn success_for_ride(&self, ride_id: &str) -> Option<Transaction> {
        self.transactions
            .iter()
            .find(|t| t.ride_id == ride_id && t.status == TransactionStatus::Success)
            .map(|t| t.clone())
    }

    /// The most recent non-SUCCESS transaction for a ride; retries reuse it.
    pub fn open_for_ride(&self, ride_id: &str) -> Option<Transaction> {
        self.transactions
            .iter()
            .filter(|t| t.ride_id == ride_id && t.status != TransactionStatus::Success)
            .max_by_key(|t| t.created_at_ms)
            .map(|t| t.clone())
    }

    /// Transaction history for a user, most recent first.
    pub fn history_for_user(&self, user_id: &str, user_type: UserType) -> Vec<Transaction> {
        let mut transactions: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| match user_type {
                UserType::Rider => t.rider_id == user_id,
                UserType::Driver => t.driver_id == user_id,
            })
            .map(|t| t.clone())
            .collect();
        transactions.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        transactions
    }
}

pub struct PaymentOrchestrator {
    clock: SharedClock,
    config: PaymentConfig,
    gateways: HashMap<GatewayKind, Arc<dyn PaymentGatewayApi>>,
    breakers: HashMap<GatewayKind, CircuitBreaker>,
    transactions: Arc<TransactionStore>,
    payouts: Arc<PayoutStore>,
    rides: Arc<RideStore>,
    drivers: Arc<DriverDirectory>,
}

impl PaymentOrchestrator {
    pub fn new(
        clock: SharedClock,
        config: PaymentConfig,
        gateways: HashMap<GatewayKind, Arc<dyn PaymentGatewayApi>>,
        transactions: Arc<TransactionStore>,
        payouts: Arc<PayoutStore>,
        rides: Arc<RideStore>,
        drivers: Arc<DriverDirectory>,
    ) -> Self {
        let breakers = gateways
            .keys()
            .map(|kind| {
                (
                    *kind,
                    CircuitBreaker::new(
                        kind.as_str(),
                        config.gateway_failure_threshold,
                        config.gateway_recovery_secs,
                    ),
                )
            })
            .collect();
        Self {
            clock,
            config,
            gateways,
            breakers,
            transactions,
            payouts,
            rides,
            drivers,
        }
    }

    pub fn transactions(&self) -> &Arc<TransactionStore> {
        &self.transactions
    }

    pub fn payouts(&self) -> &Arc<PayoutStore> {
        &self.payouts
    }

    fn gateway(&self, kind: GatewayKind) -> CoreResult<&Arc<dyn PaymentGatewayApi>> {
        self.gateways
            .get(&kind)
            .ok_or_else(|| CoreError::GatewayUnavailable(format!("{} not configured", kind.as_str())))
    }

    fn breaker(&self, kind: GatewayKind) -> CoreResult<&CircuitBreaker> {
        self.breakers
            .get(&kind)
            .ok_or_else(|| CoreError::GatewayUnavailable(format!("{} not configured", kind.as_str())))
    }

    /// Capture the fare for a completed ride.
    ///
    /// Idempotent: an existing SUCCESS transaction for the ride is returned
    /// as-is. While the gateway's breaker is OPEN the transaction stays
    /// PENDING and `gateway_unavailable` surfaces, so the caller can retry
    /// later with the same record.
    pub async fn process_payment(
        &self,
        ride_id: &str,
        amount: f64,
        gateway_kind: GatewayKind,
    ) -> CoreResult<Transaction> {
        if let Some(existing) = self.transactions.success_for_ride(ride_id) {
            return Ok(existing);
        }

        let ride = self.rides.get(ride_id)?;
        let driver_id = ride.driver_id.clone().ok_or_else(|| {
            CoreError::Fatal(format!("ride {ride_id} has no driver at settlement"))
        })?;

        let now_ms = self.clock.now_ms();
        let transaction_id = match self.transactions.open_for_ride(ride_id) {
            Some(open) => {
                self.transactions.with_mut(&open.transaction_id, |t| {
                    t.status = TransactionStatus::Pending;
                    t.amount = amount;
                    t.gateway = gateway_kind;
                })?;
                open.transaction_id
            }
            None => {
                let transaction = Transaction {
                    transaction_id: Uuid::new_v4().to_string(),
                    ride_id: ride_id.to_string(),
                    rider_id: ride.rider_id.clone(),
                    driver_id: driver_id.clone(),
                    amount,
                    gateway: gateway_kind,
                    status: TransactionStatus::Pending,
                    gateway_transaction_id: None,
                    gateway_response: None,
                    retry_count: 0,
                    created_at_ms: now_ms,
                    completed_at_ms: None,
                };
                let id = transaction.transaction_id.clone();
                self.transactions.insert(transaction);
                id
            }
        };

        let gateway = self.gateway(gateway_kind)?.clone();
        let breaker = self.breaker(gateway_kind)?;
        let request = ChargeRequest {
            order_id: ride_id.to_string(),
            amount,
            currency: "INR".to_string(),
            customer: serde_json::json!({
                "rider_id": ride.rider_id,
                "ride_id": ride_id,
            }),
        };

        let attempt_timeout = Duration::from_secs(self.config.attempt_timeout_secs);
        for attempt in 0..=self.config.max_retries {
            breaker.try_acquire()?;

            let outcome = match timeout(attempt_timeout, gateway.create_payment(&request)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::GatewayUnavailable(format!(
                    "{} call timed out",
                    gateway_kind.as_str()
                ))),
            };

            match outcome {
                Ok(response) => {
                    breaker.record_success();
                    let now_ms = self.clock.now_ms();
                    self.transactions.with_mut(&transaction_id, |t| {
                        t.status = TransactionStatus::Success;
                        t.retry_count = attempt;
                        t.gateway_transaction_id = Some(response.gateway_transaction_id.clone());
                        t.gateway_response = Some(response.raw.clone());
                        t.completed_at_ms = Some(now_ms);
                    })?;
                    self.rides.with_ride_mut(ride_id, |r| {
                        r.payment_status = PaymentStatus::Completed;
                        r.transaction_id = Some(transaction_id.clone());
                        Ok(())
                    })?;
                    self.schedule_driver_payout(&driver_id, ride_id, amount, now_ms);
                    info!(ride_id, attempt, "payment captured");
                    return self.transactions.get(&transaction_id);
                }
                Err(e) => {
                    breaker.record_failure();
                    warn!(ride_id, attempt, error = %e, "payment attempt failed");
                    let exhausted = attempt == self.config.max_retries;
                    let now_ms = self.clock.now_ms();
                    self.transactions.with_mut(&transaction_id, |t| {
                        t.retry_count = attempt;
                        t.gateway_response = Some(serde_json::json!({
                            "error": e.to_string(),
                            "retries_exhausted": exhausted,
                        }));
                        if exhausted {
                            t.status = TransactionStatus::Failed;
                            t.completed_at_ms = Some(now_ms);
                        }
                    })?;
                    if exhausted {
                        self.rides.with_ride_mut(ride_id, |r| {
                            r.payment_status = PaymentStatus::Failed;
                            Ok(())
                        })?;
                        return self.transactions.get(&transaction_id);
                    }
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                }
            }
        }
        unreachable!("payment loop always returns from the final attempt")
    }

    /// Re-run capture for a FAILED transaction, reusing its record.
    pub async fn retry_payment(&self, transaction_id: &str) -> CoreResult<Transaction> {
        let transaction = self.transactions.get(transaction_id)?;
        if transaction.status != TransactionStatus::Failed {
            return Err(CoreError::Conflict(
                "only failed transactions can be retried".to_string(),
            ));
        }
        self.transactions.with_mut(transaction_id, |t| {
            t.status = TransactionStatus::Pending;
            t.retry_count = 0;
            t.completed_at_ms = None;
        })?;
        self.process_payment(&transaction.ride_id, transaction.amount, transaction.gateway)
            .await
    }

    /// Verify a captured payment's signature with its gateway.
    pub async fn verify_payment(
        &self,
        transaction_id: &str,
        signature: &str,
    ) -> CoreResult<bool> {
        let transaction = self.transactions.get(transaction_id)?;
        let payment_id = transaction.gateway_transaction_id.as_deref().ok_or_else(|| {
            CoreError::Conflict("transaction has no gateway payment id".to_string())
        })?;
        self.gateway(transaction.gateway)?
            .verify_payment(payment_id, &transaction.ride_id, signature)
            .await
    }

    /// Refund a captured payment (full when `amount` is `None`).
    pub async fn refund_payment(
        &self,
        transaction_id: &str,
        amount: Option<f64>,
    ) -> CoreResult<serde_json::Value> {
        let transaction = self.transactions.get(transaction_id)?;
        if transaction.status != TransactionStatus::Success {
            return Err(CoreError::Conflict(
                "only captured transactions can be refunded".to_string(),
            ));
        }
        let payment_id = transaction.gateway_transaction_id.as_deref().ok_or_else(|| {
            CoreError::Conflict("transaction has no gateway payment id".to_string())
        })?;
        let breaker = self.breaker(transaction.gateway)?;
        breaker.try_acquire()?;
        let result = self
            .gateway(transaction.gateway)?
            .refund_payment(payment_id, amount)
            .await;
        match &result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }

    fn schedule_driver_payout(&self, driver_id: &str, ride_id: &str, amount: f64, now_ms: u64) {
        let share = pricing::driver_earnings(amount, self.config.driver_share);
        let bank_account = self.drivers.get(driver_id).and_then(|d| d.bank_account);
        let scheduled_for_ms = now_ms + self.config.payout_delay_hours * ONE_HOUR_MS;
        let payout = self.payouts.schedule(
            driver_id,
            ride_id,
            share,
            bank_account,
            scheduled_for_ms,
            now_ms,
        );
        info!(
            ride_id,
            driver_id,
            payout_id = %payout.payout_id,
            amount = share,
            "driver payout scheduled"
        );
    }
}
