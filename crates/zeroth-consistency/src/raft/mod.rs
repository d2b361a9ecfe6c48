// openraft engine adapter
// Backs the consensus engine boundary with openraft, RocksDB storage and the
// messaging service

pub mod config;
pub mod log_store;
pub mod network;
pub mod node;
pub mod state_machine;
pub mod types;

pub use config::RaftConfig;
pub use log_store::{RocksLogStore, RocksRaftPersistence};
pub use network::{OpenRaftConnection, OpenRaftNetworkFactory};
pub use node::{ModifyConfigForward, OpenRaftFactory, OpenRaftServer};
pub use state_machine::{Group0StateMachine, MetadataReader};
pub use types::{Group0Command, Group0Response, Raft, RaftMetrics, TypeConfig};
