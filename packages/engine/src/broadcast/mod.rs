// packages/engine/src/broadcast/mod.rs
//! Real-time fan-out to dashboard clients
//!
//! - **Hub**: per-subscription bounded outbox + delivery task
//! - **Protocol**: newline-delimited JSON messages and filters
//! - **Server**: TCP listener wiring connections into the hub

pub mod hub;
pub mod protocol;
pub mod server;

pub use hub::{BroadcastHub, Connection, SubscriptionId};
pub use protocol::{ClientMessage, DisconnectReason, MessageKind, ServerMessage, SubscriptionFilter};
pub use server::{RealtimeServer, SnapshotFn};
