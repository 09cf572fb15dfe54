//! Realtime session layer: message envelopes, the per-user channel registry,
//! and the per-connection inbound router.

pub mod messages;
pub mod registry;
pub mod router;

pub use messages::{ClientMessage, Envelope, ServerMessage};
pub use registry::{Claims, Outbound, SessionRegistry, TokenVerifier, UserType};
pub use router::SessionRouter;
