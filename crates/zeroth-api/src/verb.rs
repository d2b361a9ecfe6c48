// Verbs exchanged between Zeroth nodes
// Each verb maps to one handler in the receiving node's registry

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Group0PeerExchange,
    Group0ModifyConfig,
    RaftAppendEntries,
    RaftVote,
    RaftInstallSnapshot,
    RaftModifyConfig,
    DirectFdPing,
}

impl Verb {
    pub const ALL: [Verb; 7] = [
        Verb::Group0PeerExchange,
        Verb::Group0ModifyConfig,
        Verb::RaftAppendEntries,
        Verb::RaftVote,
        Verb::RaftInstallSnapshot,
        Verb::RaftModifyConfig,
        Verb::DirectFdPing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Group0PeerExchange => "group0_peer_exchange",
            Verb::Group0ModifyConfig => "group0_modify_config",
            Verb::RaftAppendEntries => "raft_append_entries",
            Verb::RaftVote => "raft_vote",
            Verb::RaftInstallSnapshot => "raft_install_snapshot",
            Verb::RaftModifyConfig => "raft_modify_config",
            Verb::DirectFdPing => "direct_fd_ping",
        }
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .iter()
            .copied()
            .find(|verb| verb.as_str() == s)
            .ok_or_else(|| format!("unknown verb '{}'", s))
    }
}
