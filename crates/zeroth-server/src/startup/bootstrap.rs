//! Reporting of the group 0 setup run at node start
//!
//! Only a shutdown signal stops the process. A node whose setup failed keeps
//! serving its endpoint unbootstrapped, so peers can still reach it and an
//! operator can inspect it before restarting.

use tracing::{error, info};
use zeroth_common::{GroupId, Result, ZerothError};

/// How group 0 setup ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Bootstrap is complete, with the group 0 id when raft is enabled
    Bootstrapped(Option<GroupId>),
    /// Shutdown arrived before setup finished
    Interrupted,
    /// Setup failed; the node stays up without group 0
    Failed,
}

/// Log the result of setup. `group0_id` is the id joined, if any.
pub fn report_setup(result: Result<()>, group0_id: Option<GroupId>) -> SetupOutcome {
    match result {
        Ok(()) => {
            match group0_id {
                Some(gid) => info!("Bootstrap complete, group 0 id {}", gid),
                None => info!("Bootstrap complete without group 0"),
            }
            SetupOutcome::Bootstrapped(group0_id)
        }
        Err(ZerothError::Aborted) => {
            info!("Group 0 setup interrupted by shutdown");
            SetupOutcome::Interrupted
        }
        Err(e) => {
            error!(
                "Group 0 setup failed: {}. The node keeps serving without group 0 and stays unbootstrapped",
                e
            );
            SetupOutcome::Failed
        }
    }
}
