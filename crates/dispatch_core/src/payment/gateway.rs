//! Payment and payout gateway capability traits.
//!
//! Gateways expose the uniform `{create_payment, verify_payment,
//! refund_payment}` surface; the orchestrator selects one by
//! [`GatewayKind`] and composes a circuit breaker around it. Real adapters
//! (HTTP clients for the vendors) live with the deployment shell; the core
//! depends only on these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Razorpay,
    Paytm,
}

impl GatewayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GatewayKind::Razorpay => "razorpay",
            GatewayKind::Paytm => "paytm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Order reference; the ride id.
    pub order_id: String,
    pub amount: f64,
    pub currency: String,
    pub customer: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub gateway_transaction_id: String,
    /// Gateway response blob, stored verbatim on the transaction.
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGatewayApi: Send + Sync {
    async fn create_payment(&self, request: &ChargeRequest) -> CoreResult<ChargeResponse>;

    async fn verify_payment(
        &self,
        payment_id: &str,
        order_id: &str,
        signature: &str,
    ) -> CoreResult<bool>;

    /// Full refund when `amount` is `None`, partial otherwise.
    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<f64>,
    ) -> CoreResult<serde_json::Value>;
}

#[async_trait]
pub trait PayoutGatewayApi: Send + Sync {
    /// Transfer `amount` to the resolved destination. Idempotent per
    /// `payout_id`.
    async fn transfer(
        &self,
        payout_id: &str,
        bank_account: &str,
        amount: f64,
    ) -> CoreResult<serde_json::Value>;
}
