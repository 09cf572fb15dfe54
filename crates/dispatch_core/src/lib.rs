//! # Ride Dispatch Core
//!
//! The real-time matching and lifecycle engine of a ride-hailing platform.
//!
//! ## Overview
//!
//! This crate provides the dispatch core, including:
//!
//! - **Matching Engine**: Radius-expanding search with a single-winner
//!   acceptance race per ride
//! - **Realtime Sessions**: Authenticated per-user channels with ordered,
//!   non-blocking delivery
//! - **Ride Lifecycle**: Authoritative state machine from request to
//!   settlement
//! - **Payments**: Bounded-retry capture, per-gateway circuit breakers,
//!   deferred driver payouts
//! - **Location Index**: H3-bucketed driver positions with freshness-aware
//!   radius queries
//!
//! ## Key Concepts
//!
//! - **One matcher task per ride**: concurrent rides match in parallel;
//!   every wait is cancellable by rider cancel or shutdown
//! - **Single winner**: concurrent accepts race for a TTL claim slot; losers
//!   get a definitive answer
//! - **Injected collaborators**: token verification, route lookup, and
//!   payment gateways are traits supplied by the embedding shell
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use dispatch_core::clock::SystemClock;
//! use dispatch_core::config::CoreConfig;
//! use dispatch_core::core::{CoreDependencies, DispatchCore};
//! use dispatch_core::routing::RouteProviderKind;
//! use dispatch_core::spatial::GeoPoint;
//! # use dispatch_core::session::registry::{Claims, TokenVerifier};
//! # use dispatch_core::payment::PayoutGatewayApi;
//! # fn verifier() -> Arc<dyn TokenVerifier> { unimplemented!() }
//! # fn payout_gateway() -> Arc<dyn PayoutGatewayApi> { unimplemented!() }
//!
//! # async fn run() -> Result<(), dispatch_core::error::CoreError> {
//! let core = DispatchCore::new(
//!     CoreConfig::default(),
//!     Arc::new(SystemClock),
//!     CoreDependencies {
//!         verifier: verifier(),
//!         route_provider: RouteProviderKind::StraightLine { detour_factor: 1.3 }.build(),
//!         payment_gateways: HashMap::new(),
//!         payout_gateway: payout_gateway(),
//!     },
//! );
//!
//! let ride_id = core
//!     .submit_ride(
//!         "rider-42",
//!         GeoPoint::new(22.72, 75.86),
//!         GeoPoint::new(22.75, 75.89),
//!     )
//!     .await?;
//! # Ok(()) }
//! ```

pub mod clock;
pub mod config;
pub mod coordination;
pub mod core;
pub mod dispatch;
pub mod drivers;
pub mod error;
pub mod lifecycle;
pub mod location;
pub mod payment;
pub mod pricing;
pub mod rides;
pub mod routing;
pub mod session;
pub mod spatial;
pub mod state_machine;

#[cfg(test)]
pub mod test_helpers;
