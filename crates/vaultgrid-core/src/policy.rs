//! Policy hooks consulted during an open.

use std::collections::HashMap;

use vaultgrid_types::{LogicalPath, ResourceIdentity, ResourceName, VaultScheme};

use crate::open::OpenIntent;
use crate::replica_list::ReplicaList;

/// Errors raised by a policy hook.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy refused the operation.
    #[error("vetoed by policy: {reason}")]
    Vetoed { reason: String },

    #[error("policy evaluation failed: {0}")]
    Failed(String),
}

/// Whether the quota gate runs for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaPolicy {
    On,
    #[default]
    Off,
}

/// How new replicas on a resource are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultPathPolicy {
    pub scheme: VaultScheme,
    pub add_user_name: bool,
    /// Leading logical segments dropped by the graft scheme.
    pub trim_count: usize,
}

impl Default for VaultPathPolicy {
    fn default() -> Self {
        Self {
            scheme: VaultScheme::Graft,
            add_user_name: false,
            trim_count: 1,
        }
    }
}

/// Everything a pre-open hook may inspect, plus the replica list it may
/// reorder or prune.
#[derive(Debug)]
pub struct OpenContext<'a> {
    pub user: &'a str,
    pub path: &'a LogicalPath,
    pub intent: OpenIntent,
    pub replicas: &'a mut ReplicaList,
}

/// Site policy. All hooks are synchronous.
pub trait PolicyHooks: Send + Sync {
    /// Runs before a replica is chosen. May veto or rewrite the list.
    fn preprocess_open(&self, ctx: &mut OpenContext<'_>) -> Result<(), PolicyError>;

    fn vault_path_policy(&self, resource: &ResourceIdentity)
    -> Result<VaultPathPolicy, PolicyError>;

    fn quota_policy(&self) -> QuotaPolicy;

    /// Resource used for writes that name no destination.
    fn default_resource(&self, path: &LogicalPath) -> Option<ResourceName>;
}

/// Policy fixed at construction, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    vault: VaultPathPolicy,
    per_resource: HashMap<ResourceName, VaultPathPolicy>,
    quota: QuotaPolicy,
    default_resource: Option<ResourceName>,
}

impl StaticPolicy {
    pub fn new(vault: VaultPathPolicy) -> Self {
        Self {
            vault,
            ..Self::default()
        }
    }

    pub fn with_quota(mut self, quota: QuotaPolicy) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_default_resource(mut self, resource: impl Into<ResourceName>) -> Self {
        self.default_resource = Some(resource.into());
        self
    }

    /// Overrides the vault naming for one resource.
    pub fn with_resource_policy(
        mut self,
        resource: impl Into<ResourceName>,
        policy: VaultPathPolicy,
    ) -> Self {
        self.per_resource.insert(resource.into(), policy);
        self
    }
}

impl PolicyHooks for StaticPolicy {
    fn preprocess_open(&self, _ctx: &mut OpenContext<'_>) -> Result<(), PolicyError> {
        Ok(())
    }

    fn vault_path_policy(
        &self,
        resource: &ResourceIdentity,
    ) -> Result<VaultPathPolicy, PolicyError> {
        Ok(self
            .per_resource
            .get(&resource.name)
            .copied()
            .unwrap_or(self.vault))
    }

    fn quota_policy(&self) -> QuotaPolicy {
        self.quota
    }

    fn default_resource(&self, _path: &LogicalPath) -> Option<ResourceName> {
        self.default_resource.clone()
    }
}
