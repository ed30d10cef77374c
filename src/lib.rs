//! `bxmesh` is the connection and transaction core of a high-throughput
//! peer-to-peer relay node, propagating blockchain transactions and blocks
//! between gateways and relays on a low-latency mesh overlay.
//!
//! The crate is built around three tightly coupled subsystems:
//!
//! - an event-driven connection core (non-blocking sockets, framed-message
//!   state machines, byte buffers, and an alarm queue);
//! - the length-prefixed wire protocol, its message factory and validator,
//!   and protocol version negotiation with downgrade converters;
//! - a content-addressed transaction service mapping between transaction
//!   hashes, short ids and raw contents, with bounded memory and
//!   time- and confirmation-based eviction.

pub mod mesh;
