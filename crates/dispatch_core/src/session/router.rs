//! Per-connection inbound loop.
//!
//! The transport feeds raw frames into an mpsc channel; one router task per
//! connection drains it, answers heartbeats, and hands the recognised
//! messages to the location index, the dispatcher, and the lifecycle driver.
//! The loop ends on remote close, idle timeout, or shutdown, removing the
//! registration either way.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::clock::{to_rfc3339, SharedClock};
use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::lifecycle::LifecycleDriver;
use crate::location::LocationIndex;
use crate::session::messages::{parse_client_message, ClientMessage, ServerMessage};
use crate::session::registry::{Claims, SessionRegistry, UserType};
use crate::spatial::GeoPoint;

pub struct SessionRouter {
    clock: SharedClock,
    config: SessionConfig,
    sessions: Arc<SessionRegistry>,
    location: Arc<LocationIndex>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<LifecycleDriver>,
}

impl SessionRouter {
    pub fn new(
        clock: SharedClock,
        config: SessionConfig,
        sessions: Arc<SessionRegistry>,
        location: Arc<LocationIndex>,
        dispatcher: Arc<Dispatcher>,
        lifecycle: Arc<LifecycleDriver>,
    ) -> Self {
        Self {
            clock,
            config,
            sessions,
            location,
            dispatcher,
            lifecycle,
        }
    }

    /// Drive one connection until it closes, idles out, or shutdown flips.
    pub async fn run(
        &self,
        claims: Claims,
        mut inbound: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.sessions.disconnect(&claims.user_id);
                    return;
                }
                frame = timeout(idle, inbound.recv()) => match frame {
                    Err(_) => {
                        info!(user_id = %claims.user_id, "session idle timeout");
                        self.sessions.disconnect(&claims.user_id);
                        return;
                    }
                    Ok(None) => {
                        debug!(user_id = %claims.user_id, "session closed by remote");
                        self.sessions.disconnect(&claims.user_id);
                        return;
                    }
                    Ok(Some(raw)) => self.handle_frame(&claims, &raw),
                }
            }
        }
    }

    /// Process one inbound frame. Malformed or unauthorised frames are
    /// answered with `error`; they never tear the connection down.
    pub fn handle_frame(&self, claims: &Claims, raw: &str) {
        let message = match parse_client_message(raw) {
            Ok(message) => message,
            Err(e) => {
                self.send_error(&claims.user_id, e.to_string());
                return;
            }
        };

        match message {
            ClientMessage::Ping { timestamp } => {
                self.sessions
                    .send(&claims.user_id, ServerMessage::Pong { timestamp });
            }
            ClientMessage::DriverLocationUpdate {
                latitude,
                longitude,
                accuracy,
                ride_id,
            } => {
                if !self.require_driver(claims, "driver_location_update") {
                    return;
                }
                let point = GeoPoint::new(latitude, longitude);
                let now_ms = self.clock.now_ms();
                if let Err(e) = self.location.upsert(&claims.user_id, point.clone(), accuracy, now_ms)
                {
                    self.send_error(&claims.user_id, e.to_string());
                    return;
                }
                self.sessions.send(
                    &claims.user_id,
                    ServerMessage::LocationUpdateAck {
                        received: true,
                        timestamp: to_rfc3339(now_ms),
                    },
                );
                if let Some(ride_id) = ride_id {
                    if let Err(e) = self.lifecycle.driver_location_event(
                        &claims.user_id,
                        &ride_id,
                        &point,
                        accuracy,
                    ) {
                        debug!(user_id = %claims.user_id, %ride_id, error = %e,
                            "location update not forwarded");
                    }
                }
            }
            ClientMessage::RideAccept { ride_id, .. } => {
                if !self.require_driver(claims, "ride_accept") {
                    return;
                }
                let outcome = self.dispatcher.claim(&ride_id, &claims.user_id);
                debug!(user_id = %claims.user_id, %ride_id, ?outcome, "ride_accept handled");
            }
            ClientMessage::RideReject { ride_id } => {
                if !self.require_driver(claims, "ride_reject") {
                    return;
                }
                self.dispatcher.reject(&ride_id, &claims.user_id);
            }
        }
    }

    fn require_driver(&self, claims: &Claims, message_type: &str) -> bool {
        if claims.user_type == UserType::Driver {
            return true;
        }
        self.send_error(
            &claims.user_id,
            format!("only drivers can send {message_type}"),
        );
        false
    }

    fn send_error(&self, user_id: &str, message: String) {
        self.sessions.send(
            user_id,
            ServerMessage::Error {
                message,
                correlation: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::AcceptOutcome;
    use crate::rides::RideStatus;
    use crate::test_helpers::{drain, next_message, test_platform, yield_tasks};

    fn claims_for(user_id: &str, user_type: UserType) -> Claims {
        Claims {
            user_id: user_id.to_string(),
            user_type,
            phone_verified: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ping_is_answered_with_pong_echoing_the_timestamp() {
        let platform = test_platform();
        let mut rx = platform.connect_rider("u1").await;
        platform.core.router().handle_frame(
            &claims_for("u1", UserType::Rider),
            r#"{"type":"ping","data":{"timestamp":"2024-05-01T10:00:00Z"}}"#,
        );
        let ServerMessage::Pong { timestamp } = next_message(&mut rx).await else {
            panic!("expected pong");
        };
        assert_eq!(timestamp.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_message_types_get_an_error_reply() {
        let platform = test_platform();
        let mut rx = platform.connect_rider("u1").await;
        platform
            .core
            .router()
            .handle_frame(&claims_for("u1", UserType::Rider), r#"{"type":"warp","data":{}}"#);
        assert!(matches!(
            next_message(&mut rx).await,
            ServerMessage::Error { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn riders_cannot_send_driver_messages() {
        let platform = test_platform();
        let mut rx = platform.connect_rider("u1").await;
        platform.core.router().handle_frame(
            &claims_for("u1", UserType::Rider),
            r#"{"type":"driver_location_update","data":{"latitude":22.72,"longitude":75.86}}"#,
        );
        let ServerMessage::Error { message, .. } = next_message(&mut rx).await else {
            panic!("expected error");
        };
        assert!(message.contains("only drivers"));
    }

    #[tokio::test(start_paused = true)]
    async fn location_updates_are_acked_and_forwarded_to_the_rider() {
        let platform = test_platform();
        let mut rider_rx = platform.connect_rider("r1").await;
        let mut driver_rx = platform.add_driver("d1", 22.721, 75.861).await;

        let ride_id = platform
            .core
            .submit_ride(
                "r1",
                GeoPoint::new(22.72, 75.86),
                GeoPoint::new(22.75, 75.89),
            )
            .await
            .unwrap();
        yield_tasks().await;
        let _offer = next_message(&mut driver_rx).await;
        assert_eq!(
            platform.core.dispatcher().claim(&ride_id, "d1"),
            AcceptOutcome::Confirmed
        );
        drain(&mut rider_rx);
        drain(&mut driver_rx);

        let frame = format!(
            r#"{{"type":"driver_location_update","data":{{"latitude":22.7215,"longitude":75.8605,"accuracy":4.0,"ride_id":"{ride_id}"}}}}"#
        );
        platform
            .core
            .router()
            .handle_frame(&claims_for("d1", UserType::Driver), &frame);

        assert!(matches!(
            next_message(&mut driver_rx).await,
            ServerMessage::LocationUpdateAck { received: true, .. }
        ));
        let ServerMessage::DriverLocationUpdate {
            ride_id: forwarded,
            driver_id,
            ..
        } = next_message(&mut rider_rx).await
        else {
            panic!("expected forwarded location");
        };
        assert_eq!(forwarded, ride_id);
        assert_eq!(driver_id, "d1");
        assert_eq!(
            platform.core.rides().get(&ride_id).unwrap().status,
            RideStatus::Matched
        );
    }

    #[tokio::test(start_paused = true)]
    async fn accept_and_reject_flow_through_the_router() {
        let platform = test_platform();
        let _rider_rx = platform.connect_rider("r1").await;
        let mut d1_rx = platform.add_driver("d1", 22.721, 75.861).await;
        let mut d2_rx = platform.add_driver("d2", 22.722, 75.862).await;

        let ride_id = platform
            .core
            .submit_ride(
                "r1",
                GeoPoint::new(22.72, 75.86),
                GeoPoint::new(22.75, 75.89),
            )
            .await
            .unwrap();
        yield_tasks().await;
        let _ = next_message(&mut d1_rx).await;
        let _ = next_message(&mut d2_rx).await;

        platform.core.router().handle_frame(
            &claims_for("d2", UserType::Driver),
            &format!(r#"{{"type":"ride_reject","data":{{"ride_id":"{ride_id}"}}}}"#),
        );
        assert!(matches!(
            next_message(&mut d2_rx).await,
            ServerMessage::RideRejectConfirmed { .. }
        ));

        platform.core.router().handle_frame(
            &claims_for("d1", UserType::Driver),
            &format!(
                r#"{{"type":"ride_accept","data":{{"ride_id":"{ride_id}","rider_id":"r1"}}}}"#
            ),
        );
        assert!(matches!(
            next_message(&mut d1_rx).await,
            ServerMessage::RideMatchConfirmed { .. }
        ));
        assert_eq!(
            platform.core.rides().get(&ride_id).unwrap().driver_id.as_deref(),
            Some("d1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_disconnected() {
        let platform = test_platform();
        let (claims, _outbound_rx) = platform.core.connect_session("driver:d9").unwrap();
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let handle = platform.core.spawn_session(claims, inbound_rx);

        // Keep the sender alive but silent past the idle window.
        tokio::time::advance(Duration::from_secs(91)).await;
        handle.await.unwrap();
        assert!(!platform.core.sessions().is_connected("d9"));
        drop(inbound_tx);
    }
}
