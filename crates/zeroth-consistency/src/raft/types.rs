// Raft type configuration for openraft
// Server ids double as openraft node ids; the node payload carries the location

use std::io::Cursor;

use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use zeroth_common::ServerId;

/// Cluster metadata commands replicated through group 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Group0Command {
    Put { key: String, value: String },
    Delete { key: String },
}

impl Group0Command {
    pub fn op_type(&self) -> &'static str {
        match self {
            Group0Command::Put { .. } => "put",
            Group0Command::Delete { .. } => "delete",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Group0Command::Put { key, .. } | Group0Command::Delete { key } => key,
        }
    }
}

/// Result of applying a [`Group0Command`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group0Response {
    pub success: bool,
    /// Value stored under the key before the command was applied
    pub previous: Option<String>,
    pub message: Option<String>,
}

impl Group0Response {
    pub fn success(previous: Option<String>) -> Self {
        Self {
            success: true,
            previous,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            previous: None,
            message: Some(message.into()),
        }
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Group0Command,
        R = Group0Response,
        Node = openraft::BasicNode,
        NodeId = ServerId,
);

/// Type alias for the Raft instance
pub type Raft = openraft::Raft<TypeConfig>;

pub type LogId = openraft::LogId<ServerId>;

pub type StoredMembership = openraft::StoredMembership<ServerId, BasicNode>;

pub type SnapshotMeta = openraft::SnapshotMeta<ServerId, BasicNode>;

pub type RaftMetrics = openraft::RaftMetrics<ServerId, BasicNode>;
