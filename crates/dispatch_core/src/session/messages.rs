//! JSON wire messages for the realtime channel.
//!
//! Both directions share the `{type, data}` envelope; server→client frames
//! also carry an RFC 3339 `timestamp`. Discriminants and enum payloads are
//! lowercase snake_case on the wire. An inbound frame with an unknown `type`
//! or malformed `data` is answered with an `error` message, never dropped
//! silently.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::pricing::FareBreakdown;
use crate::rides::{PaymentStatus, RideId, UserId};
use crate::session::registry::UserType;
use crate::spatial::GeoPoint;

/// `ride_match_failed` / matcher-failure reasons.
pub const REASON_ALREADY_MATCHED: &str = "already_matched";
pub const REASON_ALREADY_TERMINAL: &str = "already_terminal";
pub const REASON_ERROR: &str = "error";
/// Reason sent to losing drivers when another driver wins.
pub const REASON_MATCHED_ELSEWHERE: &str = "ride has been matched to another driver";
/// Reason sent to notified drivers when the rider cancels mid-match.
pub const REASON_RIDE_CANCELLED: &str = "ride was cancelled by the rider";

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<String>,
    },
    DriverLocationUpdate {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        accuracy: Option<f64>,
        #[serde(default)]
        ride_id: Option<RideId>,
    },
    RideAccept {
        ride_id: RideId,
        rider_id: UserId,
    },
    RideReject {
        ride_id: RideId,
    },
}

/// Parse an inbound frame. Unknown `type` or malformed `data` is a
/// `validation` error the router answers with `error`.
pub fn parse_client_message(raw: &str) -> CoreResult<ClientMessage> {
    serde_json::from_str(raw).map_err(|e| CoreError::Validation(format!("invalid message: {e}")))
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        user_id: UserId,
        user_type: UserType,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    LocationUpdateAck {
        received: bool,
        timestamp: String,
    },
    RideOffer {
        ride_id: RideId,
        pickup: GeoPoint,
        destination: GeoPoint,
        estimated_fare: f64,
        distance_km: f64,
        expires_at: String,
    },
    RideMatchConfirmed {
        ride_id: RideId,
        rider_id: UserId,
        pickup: GeoPoint,
        destination: GeoPoint,
        estimated_fare: f64,
    },
    RideMatched {
        ride_id: RideId,
        driver_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vehicle: Option<serde_json::Value>,
        eta_minutes: f64,
        distance_to_pickup_km: f64,
        matched_at: String,
    },
    RideNoLongerAvailable {
        ride_id: RideId,
        reason: String,
    },
    RideMatchFailed {
        ride_id: RideId,
        reason: String,
    },
    RideMatchProcessing {
        ride_id: RideId,
    },
    DriverLocationUpdate {
        ride_id: RideId,
        driver_id: UserId,
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
        timestamp: String,
    },
    DriverNearby {
        ride_id: RideId,
        driver_id: UserId,
        distance_meters: f64,
    },
    RideCancelled {
        ride_id: RideId,
        cancelled_by: UserId,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fee: Option<f64>,
    },
    RideCompleted {
        ride_id: RideId,
        final_fare: f64,
        breakdown: FareBreakdown,
    },
    PaymentResult {
        ride_id: RideId,
        status: PaymentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
    },
    RideRejectConfirmed {
        ride_id: RideId,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation: Option<String>,
    },
}

/// A stamped outbound frame, ready for serialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: String,
}

impl Envelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_from_wire_form() {
        let msg = parse_client_message(
            r#"{"type":"ride_accept","data":{"ride_id":"r1","rider_id":"u1"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::RideAccept {
                ride_id: "r1".into(),
                rider_id: "u1".into()
            }
        );

        let msg = parse_client_message(
            r#"{"type":"driver_location_update","data":{"latitude":22.72,"longitude":75.86}}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::DriverLocationUpdate { ride_id: None, .. }));

        let msg = parse_client_message(r#"{"type":"ping","data":{}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { timestamp: None });
    }

    #[test]
    fn unknown_type_is_a_validation_error() {
        let err = parse_client_message(r#"{"type":"teleport","data":{}}"#).unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = parse_client_message("not json").unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn envelope_carries_type_data_and_timestamp() {
        let envelope = Envelope {
            message: ServerMessage::RideNoLongerAvailable {
                ride_id: "r1".into(),
                reason: REASON_MATCHED_ELSEWHERE.into(),
            },
            timestamp: "2024-05-01T10:00:00.000Z".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(value["type"], "ride_no_longer_available");
        assert_eq!(value["data"]["ride_id"], "r1");
        assert_eq!(value["timestamp"], "2024-05-01T10:00:00.000Z");
    }

    #[test]
    fn payment_status_uses_lowercase_wire_form() {
        let envelope = Envelope {
            message: ServerMessage::PaymentResult {
                ride_id: "r1".into(),
                status: PaymentStatus::Completed,
                transaction_id: Some("t1".into()),
            },
            timestamp: "2024-05-01T10:00:00.000Z".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(value["data"]["status"], "completed");
    }
}
