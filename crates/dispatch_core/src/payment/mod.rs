//! Payment capture and payout orchestration.
//!
//! Each external gateway sits behind a [`breaker::CircuitBreaker`]; the
//! [`orchestrator::PaymentOrchestrator`] owns retry/backoff for capture
//! attempts, and [`payout::run_payout_sweeper`] drives deferred driver
//! payouts in the background.

pub mod breaker;
pub mod gateway;
pub mod orchestrator;
pub mod payout;

pub use breaker::CircuitBreaker;
pub use gateway::{ChargeRequest, ChargeResponse, GatewayKind, PaymentGatewayApi, PayoutGatewayApi};
pub use orchestrator::{PaymentOrchestrator, Transaction, TransactionStatus, TransactionStore};
pub use payout::{DriverPayout, PayoutStatus, PayoutStore};
