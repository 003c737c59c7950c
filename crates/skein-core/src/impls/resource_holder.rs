//! Single-node resource holder: this node owns whatever it registered.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{ClusteredJobId, ClusteredJobReference};
use crate::ports::ResourceHolder;

#[derive(Default)]
pub struct InMemoryResourceHolder {
    resources: Mutex<HashMap<ClusteredJobId, ClusteredJobReference>>,
}

impl InMemoryResourceHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate another node taking over a resource.
    pub fn hand_off(&self, id: ClusteredJobId) {
        self.deregister_resource_locally(id);
    }
}

impl ResourceHolder for InMemoryResourceHolder {
    fn local_resources(&self) -> Vec<ClusteredJobReference> {
        let resources = self.resources.lock().unwrap_or_else(|p| p.into_inner());
        resources.values().cloned().collect()
    }

    fn register_resource_locally(&self, resource: ClusteredJobReference) {
        let mut resources = self.resources.lock().unwrap_or_else(|p| p.into_inner());
        resources.insert(resource.id, resource);
    }

    fn deregister_resource_locally(&self, id: ClusteredJobId) {
        let mut resources = self.resources.lock().unwrap_or_else(|p| p.into_inner());
        resources.remove(&id);
    }

    fn is_owned(&self, id: ClusteredJobId) -> bool {
        let resources = self.resources.lock().unwrap_or_else(|p| p.into_inner());
        resources.contains_key(&id)
    }
}
