//! Clustered job references: lease records for timed actions owned by a node.

use serde::{Deserialize, Serialize};

use super::ids::ClusteredJobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusteredJobType {
    /// Gives up on an unanswered stop request.
    CancelTimeout,
}

/// Which node owns a deferred timed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteredJobReference {
    pub id: ClusteredJobId,
    pub owner: String,
    pub job_type: ClusteredJobType,
    pub task_name: String,
    /// Free-form data for whoever inspects the lease.
    #[serde(default)]
    pub telemetry: Option<serde_json::Value>,
}
