//! Fare calculation: quote at request time, protection at completion.

use serde::{Deserialize, Serialize};

use crate::config::FareConfig;

/// Where the quoted route distance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceSource {
    /// The external route provider answered.
    Provider,
    /// Provider unavailable; distance is haversine times the detour factor.
    StraightLineEstimate,
}

/// Itemised fare. Components sum to the quoted total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareBreakdown {
    pub base: f64,
    pub distance: f64,
    pub surcharges: f64,
    pub distance_source: DistanceSource,
    /// Set when fare protection capped the rider-charged amount.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub protection_applied: bool,
}

/// A fare quote for a requested ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareQuote {
    pub total: f64,
    pub distance_km: f64,
    pub breakdown: FareBreakdown,
}

/// Quote a fare for the given route distance.
///
/// Formula: `base_fare + per_km_rate · distance_km`, no surcharges.
pub fn quote(config: &FareConfig, distance_km: f64, source: DistanceSource) -> FareQuote {
    let distance_component = distance_km * config.per_km_rate;
    FareQuote {
        total: config.base_fare + distance_component,
        distance_km,
        breakdown: FareBreakdown {
            base: config.base_fare,
            distance: distance_component,
            surcharges: 0.0,
            distance_source: source,
            protection_applied: false,
        },
    }
}

/// Rider-charged fare at completion under fare protection.
///
/// When the actual fare overshoots the estimate by more than the protection
/// threshold, the charge is capped at `estimated · (1 + threshold)`; the
/// overshoot is absorbed for out-of-band settlement.
pub fn protected_final_fare(config: &FareConfig, estimated: f64, actual: f64) -> f64 {
    actual.min(estimated * (1.0 + config.fare_protection_threshold))
}

/// Driver's share of a captured fare.
pub fn driver_earnings(amount: f64, driver_share: f64) -> f64 {
    amount * driver_share
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakdown_sums_to_total() {
        let config = FareConfig::default();
        let q = quote(&config, 7.5, DistanceSource::Provider);
        let sum = q.breakdown.base + q.breakdown.distance + q.breakdown.surcharges;
        assert!((sum - q.total).abs() < 0.01);
        assert_eq!(q.total, 30.0 + 7.5 * 12.0);
    }

    #[test]
    fn protection_caps_large_overshoot() {
        let config = FareConfig::default();
        // 50% over the 100.0 estimate: capped at 120.0.
        assert!((protected_final_fare(&config, 100.0, 150.0) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn protection_passes_small_overshoot_and_undershoot() {
        let config = FareConfig::default();
        assert_eq!(protected_final_fare(&config, 100.0, 110.0), 110.0);
        assert_eq!(protected_final_fare(&config, 100.0, 80.0), 80.0);
    }

    #[test]
    fn driver_share_of_fare() {
        assert!((driver_earnings(250.0, 0.8) - 200.0).abs() < 1e-9);
    }
}
