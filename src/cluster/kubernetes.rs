use super::ClusterApi;
use crate::error::ClusterError;
use crate::types::{NodeInfo, PodInfo};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use log::{debug, info};

const INTERNAL_IP: &str = "InternalIP";

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects using the in-cluster service account, falling back to the
    /// local kubeconfig when running outside a pod.
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        info!("Connected to Kubernetes API server");
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(node_info).collect())
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api.list(&ListParams::default()).await?;
        debug!("Listed {} pods", pods.items.len());
        Ok(pods.items.iter().map(pod_info).collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await? {
            Some(_) => Ok(()),
            None => Err(ClusterError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }
}

fn node_info(node: &Node) -> NodeInfo {
    let internal_ip = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == INTERNAL_IP))
        .map(|a| a.address.clone());
    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        internal_ip,
    }
}

fn pod_info(pod: &Pod) -> PodInfo {
    PodInfo {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        pod_ip: pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty()),
        annotations: pod.metadata.annotations.clone().unwrap_or_default(),
    }
}
