//! Semantic error kinds shared across the dispatch core.
//!
//! Every fallible operation returns [`CoreError`]. The variants map 1:1 to the
//! error kinds user-facing surfaces understand; [`CoreError::kind`] yields the
//! wire form. Stack traces and internal details never cross the wire.

use thiserror::Error;

use crate::rides::RideStatus;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed input or out-of-service-area coordinates. Not retried.
    #[error("{0}")]
    Validation(String),

    /// Unknown ride, driver, transaction, or payout. Not retried.
    #[error("{0} not found")]
    NotFound(String),

    /// The state machine rejected the event for the ride's current state.
    #[error("cannot {event} a ride in state {from}")]
    InvalidTransition {
        from: RideStatus,
        event: &'static str,
    },

    /// Lost a race: claim held elsewhere, duplicate accept, duplicate rating.
    #[error("{0}")]
    Conflict(String),

    /// Circuit breaker open, or the gateway timed out / answered 5xx.
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Storage or coordination-store I/O failure. Retried internally with
    /// backoff before being surfaced.
    #[error("storage unavailable: {0}")]
    TransientStore(String),

    /// Overall deadline exceeded. Side effects (e.g. cancellation) applied.
    #[error("operation timed out")]
    Timeout,

    /// Invariant violation. Logged; the operation is aborted unmutated.
    #[error("invariant violated: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Wire form of the error kind (lowercase snake_case).
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::Conflict(_) => "conflict",
            CoreError::GatewayUnavailable(_) => "gateway_unavailable",
            CoreError::TransientStore(_) => "transient_store",
            CoreError::Timeout => "timeout",
            CoreError::Fatal(_) => "fatal",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_wire_form() {
        assert_eq!(CoreError::Validation("x".into()).kind(), "validation");
        assert_eq!(CoreError::Timeout.kind(), "timeout");
        let err = CoreError::InvalidTransition {
            from: RideStatus::Completed,
            event: "start",
        };
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(err.to_string(), "cannot start a ride in state completed");
    }
}
