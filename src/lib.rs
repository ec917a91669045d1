#![deny(missing_debug_implementations)]
//! # call-relay
//! Selective forwarding relay for group calls. Every participant keeps one
//! websocket for signaling and one WebRTC connection for media; each track a
//! participant publishes is forwarded unchanged to everyone else in the room.
//!
//! [`gateway::run`] starts the HTTP server. The room and peer types can also be
//! driven directly through any [`peer::SignalSink`].

/// Environment configuration for the gateway, the presence store and the relay.
pub mod config;
pub mod error;
/// HTTP server and websocket signaling.
pub mod gateway;
pub(crate) mod media_engine;
/// Forwarding of a single published track.
pub mod media_track;
/// Negotiation state of one participant.
pub mod peer;
/// Shared record of which call each user is in.
pub mod presence;
pub mod registry;
/// Membership and track fan-out of one room.
pub mod room;
/// JSON envelope exchanged over the signaling connection.
pub mod signal;

pub use error::Error;
pub use registry::RoomRegistry;
pub use room::Room;
