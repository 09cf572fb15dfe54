//! Deferred driver payouts.
//!
//! Payouts are created SCHEDULED with `scheduled_for = completion +
//! payout_delay` and picked up by a singleton sweeper that walks
//! SCHEDULED→PROCESSING→COMPLETED/FAILED. The PROCESSING check-and-set under
//! the store entry makes a sweep idempotent: a payout is attempted once per
//! terminal outcome even if sweeps overlap a restart.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{CoreError, CoreResult};
use crate::payment::gateway::PayoutGatewayApi;
use crate::rides::{RideId, UserId};

pub type PayoutId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Scheduled,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverPayout {
    pub payout_id: PayoutId,
    pub driver_id: UserId,
    pub amount: f64,
    pub rides: Vec<RideId>,
    pub status: PayoutStatus,
    pub bank_account: Option<String>,
    pub gateway_payout_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub scheduled_for_ms: u64,
    pub processed_at_ms: Option<u64>,
    pub created_at_ms: u64,
}

#[derive(Default)]
pub struct PayoutStore {
    payouts: DashMap<PayoutId, DriverPayout>,
}

impl PayoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &self,
        driver_id: &str,
        ride_id: &str,
        amount: f64,
        bank_account: Option<String>,
        scheduled_for_ms: u64,
        now_ms: u64,
    ) -> DriverPayout {
        let payout = DriverPayout {
            payout_id: Uuid::new_v4().to_string(),
            driver_id: driver_id.to_string(),
            amount,
            rides: vec![ride_id.to_string()],
            status: PayoutStatus::Scheduled,
            bank_account,
            gateway_payout_id: None,
            gateway_response: None,
            scheduled_for_ms,
            processed_at_ms: None,
            created_at_ms: now_ms,
        };
        self.payouts.insert(payout.payout_id.clone(), payout.clone());
        payout
    }

    pub fn get(&self, payout_id: &str) -> Option<DriverPayout> {
        self.payouts.get(payout_id).map(|p| p.clone())
    }

    /// Ids of payouts due at `now_ms`, i.e. SCHEDULED with
    /// `scheduled_for <= now`.
    pub fn due(&self, now_ms: u64) -> Vec<PayoutId> {
        self.payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Scheduled && p.scheduled_for_ms <= now_ms)
            .map(|p| p.payout_id.clone())
            .collect()
    }

    /// SCHEDULED→PROCESSING check-and-set. `None` if someone else got there
    /// first (or the payout vanished).
    pub fn begin_processing(&self, payout_id: &str) -> Option<DriverPayout> {
        let mut entry = self.payouts.get_mut(payout_id)?;
        if entry.status != PayoutStatus::Scheduled {
            return None;
        }
        entry.status = PayoutStatus::Processing;
        Some(entry.clone())
    }

    pub fn finish(
        &self,
        payout_id: &str,
        status: PayoutStatus,
        gateway_payout_id: Option<String>,
        gateway_response: Option<serde_json::Value>,
        now_ms: u64,
    ) -> CoreResult<()> {
        let mut entry = self
            .payouts
            .get_mut(payout_id)
            .ok_or_else(|| CoreError::NotFound(format!("payout {payout_id}")))?;
        entry.status = status;
        entry.gateway_payout_id = gateway_payout_id;
        entry.gateway_response = gateway_response;
        entry.processed_at_ms = Some(now_ms);
        Ok(())
    }

    /// Payout history for a driver, most recent first.
    pub fn history_for_driver(&self, driver_id: &str) -> Vec<DriverPayout> {
        let mut payouts: Vec<DriverPayout> = self
            .payouts
            .iter()
            .filter(|p| p.driver_id == driver_id)
            .map(|p| p.clone())
            .collect();
        payouts.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        payouts
    }
}

/// Process every due payout once. Returns how many reached a terminal state.
pub async fn sweep_due_payouts(
    store: &PayoutStore,
    gateway: &dyn PayoutGatewayApi,
    clock: &SharedClock,
) -> usize {
    let now_ms = clock.now_ms();
    let mut processed = 0;
    for payout_id in store.due(now_ms) {
        let Some(payout) = store.begin_processing(&payout_id) else {
            continue; // raced with another sweep
        };
        let outcome = match payout.bank_account.as_deref() {
            Some(bank_account) => gateway.transfer(&payout_id, bank_account, payout.amount).await,
            None => Err(CoreError::Validation(
                "no payout destination on file".to_string(),
            )),
        };
        let now_ms = clock.now_ms();
        let result = match outcome {
            Ok(response) => {
                let gateway_payout_id = response
                    .get("payout_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                info!(%payout_id, driver_id = %payout.driver_id, "payout completed");
                store.finish(
                    &payout_id,
                    PayoutStatus::Completed,
                    gateway_payout_id,
                    Some(response),
                    now_ms,
                )
            }
            Err(e) => {
                warn!(%payout_id, error = %e, "payout failed");
                store.finish(
                    &payout_id,
                    PayoutStatus::Failed,
                    None,
                    Some(serde_json::json!({ "error": e.to_string() })),
                    now_ms,
                )
            }
        };
        if result.is_ok() {
            processed += 1;
        }
    }
    processed
}

/// Singleton background sweeper. Runs until shutdown flips.
pub async fn run_payout_sweeper(
    store: Arc<PayoutStore>,
    gateway: Arc<dyn PayoutGatewayApi>,
    clock: SharedClock,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(interval_secs);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("payout sweeper stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                sweep_due_payouts(&store, gateway.as_ref(), &clock).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, ONE_HOUR_MS};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingPayoutGateway {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PayoutGatewayApi for RecordingPayoutGateway {
        async fn transfer(
            &self,
            payout_id: &str,
            _bank_account: &str,
            _amount: f64,
        ) -> CoreResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CoreError::GatewayUnavailable("transfer refused".into()))
            } else {
                Ok(serde_json::json!({ "payout_id": format!("gw-{payout_id}") }))
            }
        }
    }

    fn clock_at(now_ms: u64) -> SharedClock {
        Arc::new(ManualClock::new(now_ms))
    }

    #[tokio::test]
    async fn due_payouts_complete_and_record_gateway_id() {
        let store = PayoutStore::new();
        let clock = clock_at(25 * ONE_HOUR_MS);
        let payout = store.schedule("d1", "ride-1", 200.0, Some("acct-9".into()), ONE_HOUR_MS, 0);
        let gateway = RecordingPayoutGateway {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        let processed = sweep_due_payouts(&store, &gateway, &clock).await;
        assert_eq!(processed, 1);
        let stored = store.get(&payout.payout_id).unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
        assert!(stored.gateway_payout_id.unwrap().starts_with("gw-"));
        assert!(stored.processed_at_ms.is_some());
    }

    #[tokio::test]
    async fn not_yet_due_payouts_are_left_alone() {
        let store = PayoutStore::new();
        let clock = clock_at(ONE_HOUR_MS);
        let payout = store.schedule("d1", "ride-1", 200.0, Some("acct-9".into()), 24 * ONE_HOUR_MS, 0);
        let gateway = RecordingPayoutGateway {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        let processed = sweep_due_payouts(&store, &gateway, &clock).await;
        assert_eq!(processed, 0);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(&payout.payout_id).unwrap().status, PayoutStatus::Scheduled);
    }

    #[tokio::test]
    async fn second_sweep_does_not_retry_terminal_payouts() {
        let store = PayoutStore::new();
        let clock = clock_at(25 * ONE_HOUR_MS);
        store.schedule("d1", "ride-1", 200.0, Some("acct-9".into()), ONE_HOUR_MS, 0);
        let gateway = RecordingPayoutGateway {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        sweep_due_payouts(&store, &gateway, &clock).await;
        sweep_due_payouts(&store, &gateway, &clock).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gateway_refusal_marks_the_payout_failed() {
        let store = PayoutStore::new();
        let clock = clock_at(25 * ONE_HOUR_MS);
        let payout = store.schedule("d1", "ride-1", 200.0, Some("acct-9".into()), ONE_HOUR_MS, 0);
        let gateway = RecordingPayoutGateway {
            calls: AtomicUsize::new(0),
            fail: true,
        };

        sweep_due_payouts(&store, &gateway, &clock).await;
        let stored = store.get(&payout.payout_id).unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert!(stored.gateway_response.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("transfer refused"));
    }

    #[tokio::test]
    async fn missing_destination_fails_without_gateway_io() {
        let store = PayoutStore::new();
        let clock = clock_at(25 * ONE_HOUR_MS);
        let payout = store.schedule("d1", "ride-1", 200.0, None, ONE_HOUR_MS, 0);
        let gateway = RecordingPayoutGateway {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        sweep_due_payouts(&store, &gateway, &clock).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(&payout.payout_id).unwrap().status, PayoutStatus::Failed);
    }
}
