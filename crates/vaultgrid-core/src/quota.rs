//! Quota gate.
//!
//! Quota state is scoped to one connection. The first write that needs it
//! loads the user's limits and usage from the catalog (exactly once); after
//! that the cache is updated locally as writes are recorded.
//!
//! A [`QuotaPair`] is exceeded by a request of `size` bytes when the limit
//! is positive and `overrun + size >= limit`. Several global rows may apply
//! to one user; the one with the highest overrun wins, decided at load time
//! only, so retries within a connection never count a write twice.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vaultgrid_types::{ResourceIdentity, ResourceName};

use crate::GridError;
use crate::catalog::Catalog;
use crate::policy::QuotaPolicy;

/// A limit and the bytes already charged against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaPair {
    /// Limit in bytes; zero or negative means unlimited.
    pub limit: i64,
    /// Bytes charged against `limit`.
    pub overrun: i64,
}

impl QuotaPair {
    pub fn is_limited(&self) -> bool {
        self.limit > 0
    }

    /// Returns true if writing `size` more bytes would reach the limit.
    pub fn would_exceed(&self, size: u64) -> bool {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        self.is_limited() && self.overrun.saturating_add(size) >= self.limit
    }

    fn charge(&mut self, bytes: u64) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.overrun = self.overrun.saturating_add(bytes);
    }
}

/// Limits and usage reported by the catalog for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Cross-resource limits.
    pub global: Vec<QuotaPair>,
    /// Per-resource limits, keyed by resource name.
    pub resources: HashMap<ResourceName, QuotaPair>,
}

#[derive(Debug, Clone, Default)]
struct LoadedQuota {
    /// Worst (highest overrun) global pair.
    global: Option<QuotaPair>,
    resources: HashMap<ResourceName, QuotaPair>,
}

impl From<QuotaUsage> for LoadedQuota {
    fn from(usage: QuotaUsage) -> Self {
        Self {
            global: usage.global.iter().copied().max_by_key(|pair| pair.overrun),
            resources: usage.resources,
        }
    }
}

/// Connection-scoped quota cache. `None` until the first load.
#[derive(Debug, Clone, Default)]
pub struct QuotaCache {
    loaded: Option<LoadedQuota>,
}

impl QuotaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// The worst global pair, once loaded.
    pub fn global(&self) -> Option<QuotaPair> {
        self.loaded.as_ref().and_then(|q| q.global)
    }

    pub fn resource(&self, name: &ResourceName) -> Option<QuotaPair> {
        self.loaded
            .as_ref()
            .and_then(|q| q.resources.get(name).copied())
    }

    fn ensure_loaded(
        &mut self,
        catalog: &dyn Catalog,
        user: &str,
    ) -> Result<&mut LoadedQuota, GridError> {
        if self.loaded.is_none() {
            let loaded = LoadedQuota::from(catalog.quota_usage(user)?);
            debug!(
                user,
                resources = loaded.resources.len(),
                global = ?loaded.global,
                "loaded quota usage"
            );
            self.loaded = Some(loaded);
        }
        Ok(self.loaded.get_or_insert_with(LoadedQuota::default))
    }

    /// Drops every candidate resource that cannot take `size` more bytes.
    ///
    /// Returns the remaining candidates in their original order, or
    /// [`GridError::QuotaExceeded`] if none remain or the global limit is
    /// reached. With quota enforcement off the candidates pass unchanged and
    /// the catalog is not consulted.
    pub fn filter(
        &mut self,
        policy: QuotaPolicy,
        catalog: &dyn Catalog,
        user: &str,
        candidates: Vec<ResourceIdentity>,
        size: u64,
    ) -> Result<Vec<ResourceIdentity>, GridError> {
        if policy == QuotaPolicy::Off {
            return Ok(candidates);
        }
        let quota = self.ensure_loaded(catalog, user)?;

        if let Some(global) = quota.global {
            if global.would_exceed(size) {
                warn!(
                    user,
                    limit = global.limit,
                    overrun = global.overrun,
                    "global quota exceeded"
                );
                return Err(GridError::QuotaExceeded { requested: size });
            }
        }

        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match quota.resources.get(&candidate.name) {
                Some(pair) if pair.would_exceed(size) => {
                    warn!(
                        user,
                        resource = %candidate.name,
                        limit = pair.limit,
                        overrun = pair.overrun,
                        "resource excluded by quota"
                    );
                }
                _ => kept.push(candidate),
            }
        }

        if kept.is_empty() {
            return Err(GridError::QuotaExceeded { requested: size });
        }
        Ok(kept)
    }

    /// Charges `bytes` written to `resource` against the cached usage.
    /// Does nothing until the cache has been loaded.
    pub fn record_write(&mut self, resource: &ResourceName, bytes: u64) {
        let Some(quota) = self.loaded.as_mut() else {
            return;
        };
        if let Some(global) = quota.global.as_mut() {
            global.charge(bytes);
        }
        if let Some(pair) = quota.resources.get_mut(resource) {
            pair.charge(bytes);
        }
    }
}
