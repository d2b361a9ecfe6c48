//! Zeroth Server - process wiring for a group 0 member
//!
//! This crate provides:
//! - Configuration from `conf/application.yml`, environment and command line
//! - Multi-file logging
//! - The HTTP endpoint serving internal RPC verbs
//! - Signal-driven graceful shutdown

pub mod model;
pub mod startup;
