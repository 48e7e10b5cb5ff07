//! Resource registry and per-category file drivers.

use std::collections::HashMap;
use std::sync::Arc;

use vaultgrid_io::FileDriver;
use vaultgrid_types::{ResourceCategory, ResourceClass, ResourceIdentity, ResourceName};

use crate::GridError;

/// Every resource known to this node, addressable by resource name or by
/// resource-group name.
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    resources: Vec<ResourceIdentity>,
}

impl ResourceTable {
    pub fn new(resources: Vec<ResourceIdentity>) -> Self {
        Self { resources }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceIdentity> {
        self.resources.iter()
    }

    pub fn get(&self, name: &ResourceName) -> Option<&ResourceIdentity> {
        self.resources.iter().find(|r| &r.name == name)
    }

    /// The named resource, or every member of the named group.
    pub fn resolve(&self, name: &ResourceName) -> Result<Vec<ResourceIdentity>, GridError> {
        if let Some(resource) = self.get(name) {
            return Ok(vec![resource.clone()]);
        }
        let members: Vec<_> = self
            .resources
            .iter()
            .filter(|r| r.group.as_ref() == Some(name))
            .cloned()
            .collect();
        if members.is_empty() {
            return Err(GridError::ResourceNotFound { name: name.clone() });
        }
        Ok(members)
    }

    /// The cache member of the group `resource` belongs to.
    pub fn cache_for(&self, resource: &ResourceIdentity) -> Result<ResourceIdentity, GridError> {
        self.sibling(resource, ResourceClass::Cache, "cache")
    }

    /// The archive member of the group `resource` belongs to.
    pub fn archive_for(&self, resource: &ResourceIdentity) -> Result<ResourceIdentity, GridError> {
        self.sibling(resource, ResourceClass::Archive, "archive")
    }

    fn sibling(
        &self,
        resource: &ResourceIdentity,
        class: ResourceClass,
        wanted: &'static str,
    ) -> Result<ResourceIdentity, GridError> {
        let Some(group) = &resource.group else {
            return Err(GridError::NoUsableGroupMember {
                group: resource.name.clone(),
                wanted,
            });
        };
        self.resources
            .iter()
            .find(|r| r.class == class && r.group.as_ref() == Some(group))
            .cloned()
            .ok_or_else(|| GridError::NoUsableGroupMember {
                group: group.clone(),
                wanted,
            })
    }
}

/// File drivers keyed by resource category.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<ResourceCategory, Arc<dyn FileDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(mut self, category: ResourceCategory, driver: Arc<dyn FileDriver>) -> Self {
        self.drivers.insert(category, driver);
        self
    }

    /// The driver serving `resource`'s category.
    pub fn for_resource(&self, resource: &ResourceIdentity) -> Result<&dyn FileDriver, GridError> {
        self.drivers
            .get(&resource.category)
            .map(|driver| &**driver)
            .ok_or_else(|| GridError::ResourceTypeUnsupported {
                name: resource.name.clone(),
                class: resource.class,
                operation: "file access",
            })
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("categories", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}
