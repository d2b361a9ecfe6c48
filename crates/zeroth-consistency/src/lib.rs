//! Zeroth Consistency - Consensus engine boundary and local durable state
//!
//! This crate provides:
//! - The traits the group 0 orchestrator uses to drive a consensus engine
//! - The raft group registry, address map and direct failure detector
//! - An openraft-backed engine with RocksDB storage
//! - The local system keyspace

pub mod address_map;
pub mod failure_detector;
pub mod raft;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod system_keyspace;

pub use address_map::RaftAddressMap;
pub use failure_detector::{DirectFailureDetector, EndpointId, FailureDetectorConfig, Pinger};
pub use registry::RaftGroupRegistry;
pub use rpc::{RaftEnvelope, RaftRpc};
pub use server::{
    MembershipChangeHook, RaftConfiguration, RaftPersistence, RaftServer, RaftServerFactory,
    RaftServerForGroup, RaftTicker,
};
pub use system_keyspace::{
    MemorySystemStorage, RocksSystemStorage, SystemKeyspace, SystemStorage,
};
