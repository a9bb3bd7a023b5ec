use crate::error::ClusterError;
use crate::types::{NodeInfo, PodInfo};
use async_trait::async_trait;

pub mod kubernetes;
pub use kubernetes::KubeCluster;

/// Read-only view of the cluster inventory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    /// Lists pods across all namespaces.
    async fn list_pods(&self) -> Result<Vec<PodInfo>, ClusterError>;

    /// Succeeds only while the pod still exists.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
