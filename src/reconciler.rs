//! Periodic reconciliation of cluster workloads into the registry.
//!
//! One cycle runs four passes in a fixed order: register nodes,
//! deregister vanished nodes, register pods, deregister vanished pods.
//! The registry is re-read before each deregistration pass so every pass
//! works from what the registry holds at that moment. The engine assumes
//! it is the only writer for its cluster name.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::registry::Registry;
use crate::shard::ShardSelector;
use crate::types::{meta, PodInfo, ServiceEntry, ServiceId, KUBELET_PORT};

/// Port node entries are registered under; scrapers reach node metrics
/// through the relay listening here.
pub const RELAY_PORT: u16 = 31112;

/// Counters for one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub registered: usize,
    pub already_present: usize,
    pub deregistered: usize,
    /// Workloads or entries skipped because of bad data.
    pub skipped: usize,
    /// Remote calls that failed.
    pub failed: usize,
}

pub struct Reconciler<C, R> {
    cluster: C,
    registry: R,
    cluster_name: String,
    period: Duration,
    shards: ShardSelector,
}

impl<C: ClusterApi, R: Registry> Reconciler<C, R> {
    pub fn new(cluster: C, registry: R, config: &Config, shards: ShardSelector) -> Self {
        Self {
            cluster,
            registry,
            cluster_name: config.cluster_name.clone(),
            period: config.sync_period(),
            shards,
        }
    }

    /// Runs cycles until `shutdown` flips or its sender is dropped.
    /// The signal is only observed between cycles.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            info!("Starting registration and deregistration cycle...");
            let report = self.run_cycle().await;
            info!(
                "Cycle finished: {} registered, {} already present, {} deregistered, {} skipped, {} failed. Sleeping for {:?}",
                report.registered,
                report.already_present,
                report.deregistered,
                report.skipped,
                report.failed,
                self.period
            );

            tokio::select! {
                _ = sleep(self.period) => {}
                _ = shutdown.changed() => {
                    info!("Reconciler received shutdown signal");
                    return;
                }
            }
        }
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let mut existing: HashSet<String> = match self.registry.services().await {
            Ok(services) => services.into_keys().collect(),
            Err(e) => {
                error!(
                    "Error fetching services from registry: {}. Skipping existence check for this cycle.",
                    e
                );
                report.failed += 1;
                HashSet::new()
            }
        };
        info!("Found {} existing services in registry", existing.len());

        self.sync_nodes(&mut existing, &mut report).await;
        self.deregister_nodes(&mut report).await;
        if self.sync_pods(&mut existing, &mut report).await {
            self.deregister_pods(&mut report).await;
        } else {
            warn!("Pod listing failed, skipping pod deregistration this cycle");
        }

        report
    }

    async fn sync_nodes(&mut self, existing: &mut HashSet<String>, report: &mut CycleReport) {
        let nodes = match self.cluster.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("Error listing nodes: {}", e);
                report.failed += 1;
                return;
            }
        };

        for node in nodes {
            let Some(ip) = node.internal_ip else {
                warn!("Could not find InternalIP for node {}", node.name);
                report.skipped += 1;
                continue;
            };
            let entry = self.node_entry(&ip);
            self.register_once(entry, existing, report).await;
        }
    }

    async fn deregister_nodes(&mut self, report: &mut CycleReport) {
        let services = match self.registry.services().await {
            Ok(services) => services,
            Err(e) => {
                error!("Error retrieving services from registry: {}", e);
                report.failed += 1;
                return;
            }
        };
        let live_ips: HashSet<String> = match self.cluster.list_nodes().await {
            Ok(nodes) => nodes.into_iter().filter_map(|n| n.internal_ip).collect(),
            Err(e) => {
                error!("Error listing nodes: {}", e);
                report.failed += 1;
                return;
            }
        };

        for (id, entry) in sorted(services) {
            if !ServiceId::is_node_id(&id) || !entry.belongs_to(&self.cluster_name) {
                continue;
            }
            let ip = match ServiceId::parse(&id) {
                Ok(ServiceId::Node { ip }) => ip,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping malformed node service: {}", e);
                    report.skipped += 1;
                    continue;
                }
            };
            if !live_ips.contains(&ip) {
                self.deregister(&id, report).await;
            }
        }
    }

    /// Returns false when pods could not be listed at all.
    async fn sync_pods(&mut self, existing: &mut HashSet<String>, report: &mut CycleReport) -> bool {
        let pods = match self.cluster.list_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                error!("Error listing pods: {}", e);
                report.failed += 1;
                return false;
            }
        };
        info!("There are {} pods in the cluster", pods.len());

        for pod in pods {
            let target = match pod.scrape_target() {
                Ok(Some(target)) => target,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping pod {}/{}: {}", pod.namespace, pod.name, e);
                    report.skipped += 1;
                    continue;
                }
            };
            // Pods still waiting for an IP are left for a later cycle rather
            // than registered with an empty address.
            let Some(entry) = self.pod_entry(&pod, &target.path, target.port, &target.port_text)
            else {
                warn!("Skipping pod {}/{}: no pod IP yet", pod.namespace, pod.name);
                report.skipped += 1;
                continue;
            };
            debug!(
                "Pod: {}, Metrics Path: {}, Metrics Port: {}",
                pod.name, target.path, target.port_text
            );
            self.register_once(entry, existing, report).await;
        }
        true
    }

    async fn deregister_pods(&mut self, report: &mut CycleReport) {
        let services = match self.registry.services().await {
            Ok(services) => services,
            Err(e) => {
                error!("Error retrieving services from registry: {}", e);
                report.failed += 1;
                return;
            }
        };

        for (id, entry) in sorted(services) {
            if !ServiceId::is_pod_id(&id) || !entry.belongs_to(&self.cluster_name) {
                continue;
            }
            let (namespace, name) = match ServiceId::parse(&id) {
                Ok(ServiceId::Pod { namespace, name }) => (namespace, name),
                Ok(_) => continue,
                Err(e) => {
                    warn!("Invalid pod service ID format in registry: {}", e);
                    report.skipped += 1;
                    continue;
                }
            };
            if let Some(ns) = entry.meta.get(meta::NAMESPACE) {
                if *ns != namespace {
                    warn!(
                        "Namespace mismatch for service ID {}: metadata has {}, parsed from ID has {}",
                        id, ns, namespace
                    );
                }
            }
            if let Err(e) = self.cluster.get_pod(&namespace, &name).await {
                debug!("Pod lookup for {} failed: {}", id, e);
                self.deregister(&id, report).await;
            }
        }
    }

    async fn register_once(
        &mut self,
        entry: ServiceEntry,
        existing: &mut HashSet<String>,
        report: &mut CycleReport,
    ) {
        if existing.contains(&entry.id) {
            debug!("Service {} already registered, skipping", entry.id);
            report.already_present += 1;
            return;
        }
        match self.registry.register(&entry).await {
            Ok(()) => {
                info!("Successfully registered service {}", entry.id);
                report.registered += 1;
                existing.insert(entry.id);
            }
            Err(e) => {
                error!("Error registering service {}: {}", entry.id, e);
                report.failed += 1;
            }
        }
    }

    async fn deregister(&mut self, id: &str, report: &mut CycleReport) {
        match self.registry.deregister(id).await {
            Ok(()) => {
                info!("Successfully deregistered service {}", id);
                report.deregistered += 1;
            }
            Err(e) => {
                error!("Error deregistering service {}: {}", id, e);
                report.failed += 1;
            }
        }
    }

    fn node_entry(&mut self, ip: &str) -> ServiceEntry {
        let mut meta = HashMap::from([
            (meta::CLUSTER_NAME.to_string(), self.cluster_name.clone()),
            (meta::METRICS_IP.to_string(), ip.to_string()),
            (meta::METRICS_PORT.to_string(), RELAY_PORT.to_string()),
            (
                meta::METRICS_PATH.to_string(),
                format!("/api/v1/nodes/{}:{}/metrics/cadvisor", ip, KUBELET_PORT),
            ),
        ]);
        self.attach_shard(&mut meta);
        ServiceEntry::new(&ServiceId::node(ip), ip, RELAY_PORT, meta)
    }

    fn pod_entry(
        &mut self,
        pod: &PodInfo,
        path: &str,
        port: u16,
        port_text: &str,
    ) -> Option<ServiceEntry> {
        let ip = pod.pod_ip.as_deref()?;
        let mut meta = HashMap::from([
            (meta::CLUSTER_NAME.to_string(), self.cluster_name.clone()),
            (meta::METRICS_PATH.to_string(), path.to_string()),
            (meta::METRIC_IP.to_string(), ip.to_string()),
            (meta::POD_IP.to_string(), ip.to_string()),
            (meta::POD_NAME.to_string(), pod.name.clone()),
            (meta::INSTANCE.to_string(), format!("{}:{}", ip, port_text)),
            (meta::METRICS_PORT.to_string(), port_text.to_string()),
            (meta::NAMESPACE.to_string(), pod.namespace.clone()),
        ]);
        self.attach_shard(&mut meta);
        Some(ServiceEntry::new(
            &ServiceId::pod(&pod.namespace, &pod.name),
            ip,
            port,
            meta,
        ))
    }

    fn attach_shard(&mut self, meta: &mut HashMap<String, String>) {
        if let Some(shard) = self.shards.pick() {
            meta.insert(meta::SHARD_PATH.to_string(), shard);
        }
    }
}

fn sorted(services: HashMap<String, ServiceEntry>) -> Vec<(String, ServiceEntry)> {
    let mut services: Vec<_> = services.into_iter().collect();
    services.sort_by(|a, b| a.0.cmp(&b.0));
    services
}
