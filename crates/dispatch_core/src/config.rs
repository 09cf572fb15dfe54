//! Typed configuration for the dispatch core.
//!
//! Defaults carry the platform's documented values; embedders override the
//! pieces they care about through the `with_*` builders:
//!
//! ```rust
//! use dispatch_core::config::{CoreConfig, MatchingConfig};
//!
//! let config = CoreConfig::default()
//!     .with_matching(MatchingConfig {
//!         initial_search_radius_km: 3.0,
//!         ..MatchingConfig::default()
//!     });
//! ```

use crate::spatial::ServiceArea;

/// Matching-engine knobs: search expansion, timeouts, freshness, proximity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchingConfig {
    /// R₀: radius of the first search round, in km.
    pub initial_search_radius_km: f64,
    /// ΔR: radius growth per round, in km.
    pub search_radius_expansion_km: f64,
    /// R_max: radius cap, in km.
    pub max_search_radius_km: f64,
    /// T_total: overall matching deadline, in seconds.
    pub match_timeout_secs: u64,
    /// T_round: per-round wait before expanding, in seconds.
    pub round_timeout_secs: u64,
    /// TTL of the per-ride claim slot, in seconds.
    pub claim_ttl_secs: u64,
    /// Location samples older than this are ignored by candidate selection.
    pub stale_location_ttl_secs: u64,
    /// Maximum driver-to-pickup distance for starting the trip, in metres.
    pub pickup_proximity_m: f64,
    /// Distance at which the rider is told the driver is nearby, in metres.
    pub proximity_notify_m: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            initial_search_radius_km: 5.0,
            search_radius_expansion_km: 2.0,
            max_search_radius_km: 15.0,
            match_timeout_secs: 120,
            round_timeout_secs: 30,
            claim_ttl_secs: 10,
            stale_location_ttl_secs: 60,
            pickup_proximity_m: 200.0,
            proximity_notify_m: 500.0,
        }
    }
}

/// Fare and cancellation-fee knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareConfig {
    /// Base fare in currency units.
    pub base_fare: f64,
    /// Per-kilometre rate in currency units.
    pub per_km_rate: f64,
    /// Overshoot fraction beyond which the rider-charged fare is capped at
    /// `estimate · (1 + threshold)`.
    pub fare_protection_threshold: f64,
    /// Multiplier applied to the straight-line distance when the route
    /// provider is unavailable.
    pub route_detour_factor: f64,
    /// Flat fee when the rider cancels after the free window.
    pub cancellation_fee: f64,
    /// Seconds after matching during which a rider cancel is free.
    pub free_cancel_window_secs: u64,
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fare: 30.0,
            per_km_rate: 12.0,
            fare_protection_threshold: 0.20,
            route_detour_factor: 1.3,
            cancellation_fee: 50.0,
            free_cancel_window_secs: 120,
        }
    }
}

/// Payment capture, circuit breaker, and payout knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaymentConfig {
    /// Fraction of the fare paid out to the driver.
    pub driver_share: f64,
    /// Delay between ride completion and the scheduled payout, in hours.
    pub payout_delay_hours: u64,
    /// Retries after the first capture attempt (2 retries = 3 attempts).
    pub max_retries: u32,
    /// Consecutive failures that open a gateway's circuit breaker.
    pub gateway_failure_threshold: u32,
    /// Seconds an open breaker rejects before admitting a probe.
    pub gateway_recovery_secs: u64,
    /// Per-attempt gateway deadline, in seconds.
    pub attempt_timeout_secs: u64,
    /// Interval of the payout sweeper, in seconds.
    pub payout_sweep_interval_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            driver_share: 0.80,
            payout_delay_hours: 24,
            max_retries: 2,
            gateway_failure_threshold: 5,
            gateway_recovery_secs: 60,
            attempt_timeout_secs: 10,
            payout_sweep_interval_secs: 60,
        }
    }
}

/// Realtime session knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Outbound messages buffered per connection before it is dropped.
    pub send_buffer: usize,
    /// Channel close after this many seconds without an inbound frame.
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_buffer: 64,
            idle_timeout_secs: 90,
        }
    }
}

/// Aggregate configuration injected into [`crate::core::DispatchCore`].
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    pub matching: MatchingConfig,
    pub fare: FareConfig,
    pub payment: PaymentConfig,
    pub session: SessionConfig,
    pub service_area: ServiceArea,
    /// Daily driver cancellations beyond which the driver is flagged.
    pub max_daily_driver_cancellations: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            matching: MatchingConfig::default(),
            fare: FareConfig::default(),
            payment: PaymentConfig::default(),
            session: SessionConfig::default(),
            service_area: ServiceArea::default(),
            max_daily_driver_cancellations: 5,
        }
    }
}

impl CoreConfig {
    pub fn with_matching(mut self, matching: MatchingConfig) -> Self {
        self.matching = matching;
        self
    }

    pub fn with_fare(mut self, fare: FareConfig) -> Self {
        self.fare = fare;
        self
    }

    pub fn with_payment(mut self, payment: PaymentConfig) -> Self {
        self.payment = payment;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_service_area(mut self, service_area: ServiceArea) -> Self {
        self.service_area = service_area;
        self
    }
}
