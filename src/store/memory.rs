//! In-process instance store.
//!
//! Used for development setups without a cluster API and by tests. Can be
//! seeded from a YAML file holding a list of instance records:
//!
//! ```yaml
//! - metadata: {name: fedora, namespace: default}
//!   spec: {domain: {devices: {autoattachVSOCK: true}}}
//!   status: {nodeName: node01, phase: Running, VSOCKCID: 3}
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::{InstanceStore, StoreError};
use crate::model::{InstanceRef, VirtualMachineInstance};

/// Instance records keyed by namespace and name.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<InstanceRef, VirtualMachineInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_instances(instances: impl IntoIterator<Item = VirtualMachineInstance>) -> Self {
        let map = instances
            .into_iter()
            .map(|vmi| (vmi.instance_ref(), vmi))
            .collect();
        Self {
            instances: RwLock::new(map),
        }
    }

    /// Load a YAML list of instance records.
    pub fn from_yaml_file(path: &str) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("failed to read {path}: {e}")))?;
        let instances: Vec<VirtualMachineInstance> = serde_yaml::from_str(&content)
            .map_err(|e| StoreError::Decode(format!("{path}: {e}")))?;
        info!("Loaded {} instances from {path}", instances.len());
        Ok(Self::from_instances(instances))
    }

    /// Insert or replace a record.
    pub async fn insert(&self, vmi: VirtualMachineInstance) {
        self.instances.write().await.insert(vmi.instance_ref(), vmi);
    }

    /// Remove a record, returning it if present.
    pub async fn remove(&self, namespace: &str, name: &str) -> Option<VirtualMachineInstance> {
        self.instances
            .write()
            .await
            .remove(&InstanceRef::new(namespace, name))
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachineInstance, StoreError> {
        self.instances
            .read()
            .await
            .get(&InstanceRef::new(namespace, name))
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}
