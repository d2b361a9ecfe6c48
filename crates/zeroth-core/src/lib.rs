//! Zeroth Core - Group 0 bootstrap and membership
//!
//! This crate provides:
//! - The pure discovery state machine that finds or founds group 0
//! - Discovery persisted in the system keyspace
//! - The gossiper seed service and direct failure detector pinger
//! - The group 0 orchestrator: join, promote, leave and remove members

pub mod discovery;
pub mod gossip;
pub mod group0;
pub mod persistent_discovery;

pub use discovery::{Discovery, TickOutput};
pub use gossip::{DirectFdPinger, Gossiper, StaticGossiper, register_ping_handler};
pub use group0::{Group0Phase, RaftGroup0};
pub use persistent_discovery::PersistentDiscovery;
