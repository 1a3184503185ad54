//! Cluster state access for instance records.
//!
//! - [`InstanceStore`] — read-only `get(namespace, name)` collaborator
//! - [`locate`] — the instance locator used by the streamer
//! - [`memory::MemoryStore`] — in-process store, optionally seeded from YAML
//! - [`api::ApiStore`] — cluster REST API store

pub mod api;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::error::TunnelError;
use crate::model::{InstanceRef, VirtualMachineInstance};

pub use api::ApiStore;
pub use memory::MemoryStore;

/// Errors from the cluster state collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("access denied by cluster API (HTTP {0})")]
    Unauthorized(u16),
    #[error("cluster state unavailable: {0}")]
    Unavailable(String),
    #[error("malformed instance record: {0}")]
    Decode(String),
}

/// Read-only view of cluster state.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str)
        -> Result<VirtualMachineInstance, StoreError>;
}

/// Fetch the current record for `instance`, mapping a missing record to
/// [`TunnelError::NotFound`] and anything else to [`TunnelError::Store`].
pub async fn locate(
    store: &dyn InstanceStore,
    instance: &InstanceRef,
) -> Result<VirtualMachineInstance, TunnelError> {
    match store.get(&instance.namespace, &instance.name).await {
        Ok(vmi) => Ok(vmi),
        Err(StoreError::NotFound) => Err(TunnelError::NotFound(instance.clone())),
        Err(source) => {
            warn!(instance = %instance, error = %source, "Failed to fetch instance");
            Err(TunnelError::Store {
                instance: instance.clone(),
                source,
            })
        }
    }
}

/// Build the store selected by `[cluster]`: the REST API when `api_url` is
/// set, else an in-memory store seeded from `instances_file` (if any).
pub fn from_config(config: &ClusterConfig) -> Result<Arc<dyn InstanceStore>, StoreError> {
    if let Some(ref api_url) = config.api_url {
        info!("Reading instances from cluster API at {api_url}");
        return Ok(Arc::new(ApiStore::from_config(api_url, config)?));
    }
    if let Some(ref path) = config.instances_file {
        return Ok(Arc::new(MemoryStore::from_yaml_file(path)?));
    }
    warn!("No cluster API or instances file configured; every lookup will return not found");
    Ok(Arc::new(MemoryStore::new()))
}
