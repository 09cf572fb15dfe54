//! Per-user channel registry.
//!
//! One active channel per user id: a newcomer displaces the previous channel,
//! which is closed with a policy-violation directive. Sends are non-blocking
//! `try_send`s into a bounded per-connection buffer; a full or closed buffer
//! drops that connection so one slow consumer can never stall the matcher or
//! another user's delivery. Per-channel ordering falls out of the mpsc queue.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::{to_rfc3339, SharedClock};
use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::rides::UserId;
use crate::session::messages::{Envelope, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Rider,
    Driver,
}

/// Identity derived from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: UserId,
    pub user_type: UserType,
    pub phone_verified: bool,
}

/// Validates presented tokens. Token issuance lives outside the core.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> CoreResult<Claims>;
}

/// WebSocket-style close code for policy violations.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// What the transport receives on its outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(Envelope),
    /// Close the underlying connection with this code and reason.
    Close { code: u16, reason: String },
}

struct SessionHandle {
    user_type: UserType,
    tx: mpsc::Sender<Outbound>,
}

pub struct SessionRegistry {
    sessions: DashMap<UserId, SessionHandle>,
    clock: SharedClock,
    send_buffer: usize,
}

impl SessionRegistry {
    pub fn new(clock: SharedClock, config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
            send_buffer: config.send_buffer,
        }
    }

    /// Register a verified user and hand back the outbound stream for the
    /// transport to drain. Any pre-existing channel for the same user is
    /// displaced and closed with a policy-violation directive.
    pub fn connect(&self, claims: &Claims) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.send_buffer);
        let displaced = self.sessions.insert(
            claims.user_id.clone(),
            SessionHandle {
                user_type: claims.user_type,
                tx,
            },
        );
        if let Some(previous) = displaced {
            debug!(user_id = %claims.user_id, "displacing existing session");
            let _ = previous.tx.try_send(Outbound::Close {
                code: CLOSE_POLICY_VIOLATION,
                reason: "superseded by a newer connection".to_string(),
            });
        }
        self.send(
            &claims.user_id,
            ServerMessage::ConnectionEstablished {
                user_id: claims.user_id.clone(),
                user_type: claims.user_type,
            },
        );
        rx
    }

    /// Verify a token and connect in one step.
    pub fn authenticate_and_connect(
        &self,
        verifier: &dyn TokenVerifier,
        token: &str,
    ) -> CoreResult<(Claims, mpsc::Receiver<Outbound>)> {
        if token.is_empty() {
            return Err(CoreError::Validation(
                "authentication token required".to_string(),
            ));
        }
        let claims = verifier.verify(token)?;
        let rx = self.connect(&claims);
        Ok((claims, rx))
    }

    /// Deliver one message. Returns whether it was handed to the channel; a
    /// full or closed buffer removes the registration.
    pub fn send(&self, user_id: &str, message: ServerMessage) -> bool {
        let envelope = Envelope {
            message,
            timestamp: to_rfc3339(self.clock.now_ms()),
        };
        let tx = match self.sessions.get(user_id) {
            Some(handle) => handle.tx.clone(),
            None => return false,
        };
        match tx.try_send(Outbound::Message(envelope)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user_id, "outbound buffer full, dropping connection");
                self.disconnect(user_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.disconnect(user_id);
                false
            }
        }
    }

    /// Deliver to every listed user; returns how many sends succeeded.
    pub fn broadcast(&self, user_ids: &[UserId], message: &ServerMessage) -> usize {
        user_ids
            .iter()
            .filter(|user_id| self.send(user_id, message.clone()))
            .count()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Remove a registration. Idempotent.
    pub fn disconnect(&self, user_id: &str) -> bool {
        self.sessions.remove(user_id).is_some()
    }

    /// Connected (riders, drivers) counts.
    pub fn connection_counts(&self) -> (usize, usize) {
        let mut riders = 0;
        let mut drivers = 0;
        for entry in self.sessions.iter() {
            match entry.user_type {
                UserType::Rider => riders += 1,
                UserType::Driver => drivers += 1,
            }
        }
        (riders, drivers)
    }
}
