//! Persisted deployment state and audit records.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use weft_core::{InstanceNode, Props, Value};

/// Lifecycle of a whole deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Handlers are (or were, at a crash) in flight.
    Applying,
    /// Every handler completed and outputs are persisted.
    Deployed,
    /// The deployment stopped on an error.
    Failed,
}

/// Lifecycle of a single resource, held in memory and persisted per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Known but not yet started.
    Pending,
    /// Its handler or cleanup is running.
    Applying,
    /// Its handler completed.
    Deployed,
    /// Its handler failed.
    Failed,
}

/// One persisted instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Deterministic instance ID.
    pub id: String,
    /// Resource path segments the ID derives from.
    pub path: Vec<String>,
    /// Resolved props snapshot.
    pub props: Props,
    /// Outputs written by the handler, if it ran.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, Value>,
    /// Resource state at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ResourceState>,
}

impl NodeRecord {
    /// Snapshot a live instance into its persisted form.
    pub fn of(node: &InstanceNode, state: Option<ResourceState>) -> Self {
        Self {
            id: node.id().to_string(),
            path: node.path().to_vec(),
            props: node.props_snapshot(),
            outputs: node.outputs(),
            state,
        }
    }
}

/// The state blob saved to the backend, replaced atomically per save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    /// The stack this state belongs to.
    pub stack_name: String,
    /// Every known instance.
    pub nodes: Vec<NodeRecord>,
    /// Deployment lifecycle at save time.
    pub status: DeploymentStatus,
    /// IDs whose handlers were in flight; drives crash recovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applying_node_ids: Vec<String>,
    /// Milliseconds since the Unix epoch of the last save.
    pub last_deployed_at: i64,
    /// Operator identity, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A deployment started applying.
    DeployStart,
    /// A deployment completed.
    DeployComplete,
    /// A deployment failed.
    DeployFailed,
    /// A resource's handler completed.
    ResourceApplied,
    /// A resource was destroyed.
    ResourceDestroyed,
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// What happened.
    pub action: AuditAction,
    /// The resource involved, for per-resource actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Operator identity, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Free-form context, e.g. the failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
