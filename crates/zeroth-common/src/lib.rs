//! Zeroth Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Zeroth components:
//! - Error types
//! - Server, group and address identifiers
//! - The shutdown gate and abortable waits
//! - The primary execution context
//! - Utility functions

pub mod context;
pub mod error;
pub mod gate;
pub mod ids;
pub mod utils;

// Re-exports for convenience
pub use context::PrimaryContext;
pub use error::{Result, RpcError, ZerothError};
pub use gate::{Gate, GateHolder, abortable, sleep_abortable};
pub use ids::{GroupId, Peer, ServerAddress, ServerId, ServerInfo};
pub use utils::local_ip;
