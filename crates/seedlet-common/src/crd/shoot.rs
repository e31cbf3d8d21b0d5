//! Shoot resource: a tenant cluster whose control plane runs on a seed

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Shoot describes a tenant cluster.
///
/// Only the fields seedlet reads or writes are modelled; unknown fields are
/// preserved by merge patches because they are never sent.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.seedlet.dev",
    version = "v1beta1",
    kind = "Shoot",
    namespaced,
    status = "ShootStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Seed the shoot is scheduled to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_name: Option<String>,
    /// Provider region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Purpose, e.g. "production"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

/// Shoot status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    /// Seed currently hosting the control plane (differs from spec during migration)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_name: Option<String>,
    /// Namespace of the control plane in the seed (`shoot--<project>--<name>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_id: Option<String>,
    /// Most recent operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
}

/// Progress of the latest shoot operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Operation type (Create, Reconcile, Delete, Migrate, Restore)
    #[serde(rename = "type")]
    pub operation_type: String,
    /// Current state
    pub state: LastOperationState,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Percentage done
    #[serde(default)]
    pub progress: i32,
    /// RFC 3339 timestamp of the last update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// State of a shoot operation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationState {
    /// Still running
    #[default]
    Processing,
    /// Finished successfully
    Succeeded,
    /// Failed, will be retried
    Error,
    /// Failed permanently
    Failed,
    /// Waiting for something external
    Pending,
    /// Interrupted (e.g. by an agent restart)
    Aborted,
}

impl Shoot {
    /// Name of the seed responsible for this shoot.
    ///
    /// During control-plane migration spec and status disagree and the
    /// status seed stays responsible until the migration completes.
    pub fn responsible_seed(&self) -> Option<&str> {
        let spec = self.spec.seed_name.as_deref()?;
        match self.status.as_ref().and_then(|s| s.seed_name.as_deref()) {
            Some(status) => Some(status),
            None => Some(spec),
        }
    }

    /// True if the last operation is still marked as processing
    pub fn is_processing(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.last_operation.as_ref())
            .is_some_and(|op| op.state == LastOperationState::Processing)
    }
}
