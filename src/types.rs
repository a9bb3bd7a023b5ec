//! Data structures shared by the reconciler and the registry client.
//!
//! A [`ServiceId`] is the join key between the cluster and the registry:
//! every workload maps to exactly one identifier and every identifier
//! carrying one of our prefixes can be mapped back to the workload it
//! was derived from.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;

const NODE_PREFIX: &str = "node--";
const POD_PREFIX: &str = "pod--";
const SEPARATOR: &str = "--";

/// Port the kubelet serves its metrics on.
pub const KUBELET_PORT: u16 = 10250;

/// Metadata keys written to and read back from registry entries.
pub mod meta {
    pub const CLUSTER_NAME: &str = "cluster_name";
    pub const METRICS_IP: &str = "metrics_ip";
    pub const METRIC_IP: &str = "metric_ip";
    pub const METRICS_PORT: &str = "metrics_port";
    pub const METRICS_PATH: &str = "metrics_path";
    pub const POD_IP: &str = "pod_ip";
    pub const POD_NAME: &str = "pod_name";
    pub const INSTANCE: &str = "instance";
    pub const NAMESPACE: &str = "namespace";
    pub const SHARD_PATH: &str = "shard_path";
}

/// Pod annotations that opt a pod into scraping.
pub mod annotations {
    pub const SCRAPE: &str = "prometheus.io/scrape";
    pub const PATH: &str = "prometheus.io/path";
    pub const PORT: &str = "prometheus.io/port";
}

/// A cluster node as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// First address of type `InternalIP`, if the node reports one.
    pub internal_ip: Option<String>,
}

/// A pod as seen by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub pod_ip: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

/// Scrape settings taken from an eligible pod's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub path: String,
    pub port: u16,
    /// Port exactly as annotated, reused verbatim in metadata.
    pub port_text: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("metrics port annotation {0:?} is not an integer")]
    InvalidPort(String),
}

impl PodInfo {
    /// Returns `Ok(None)` for pods that have not opted in with the literal
    /// value `"true"`.
    pub fn scrape_target(&self) -> Result<Option<ScrapeTarget>, ScrapeError> {
        if self.annotations.get(annotations::SCRAPE).map(String::as_str) != Some("true") {
            return Ok(None);
        }
        let path = match self.annotations.get(annotations::PATH) {
            Some(p) if !p.is_empty() => p.clone(),
            _ => "/metrics".to_string(),
        };
        let port_text = self
            .annotations
            .get(annotations::PORT)
            .cloned()
            .unwrap_or_default();
        let port = port_text
            .parse::<u16>()
            .map_err(|_| ScrapeError::InvalidPort(port_text.clone()))?;
        Ok(Some(ScrapeTarget {
            path,
            port,
            port_text,
        }))
    }
}

/// Registry-side projection of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

impl ServiceEntry {
    /// Builds an entry whose name and single tag both equal the identifier.
    pub fn new(
        id: &ServiceId,
        address: impl Into<String>,
        port: u16,
        meta: HashMap<String, String>,
    ) -> Self {
        let id = id.to_string();
        Self {
            name: id.clone(),
            tags: vec![id.clone()],
            id,
            address: address.into(),
            port,
            meta,
        }
    }

    /// True when the entry's `cluster_name` metadata equals `cluster`.
    /// Entries without the key belong to nobody and are never touched.
    pub fn belongs_to(&self, cluster: &str) -> bool {
        self.meta.get(meta::CLUSTER_NAME).map(String::as_str) == Some(cluster)
    }
}

/// Identifier of a managed registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceId {
    Node { ip: String },
    Pod { namespace: String, name: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("identifier {0:?} has no managed prefix")]
    Unmanaged(String),
    #[error("pod identifier {0:?} is missing the namespace separator")]
    MissingSeparator(String),
    #[error("identifier {0:?} has an empty component")]
    Empty(String),
}

impl ServiceId {
    pub fn node(ip: impl Into<String>) -> Self {
        Self::Node { ip: ip.into() }
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Pod {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_node_id(raw: &str) -> bool {
        raw.starts_with(NODE_PREFIX)
    }

    pub fn is_pod_id(raw: &str) -> bool {
        raw.starts_with(POD_PREFIX)
    }

    /// Parses a registry identifier. Pod identifiers are split on the first
    /// separator after the prefix, so a pod name may itself contain `--`.
    pub fn parse(raw: &str) -> Result<Self, IdParseError> {
        if let Some(ip) = raw.strip_prefix(NODE_PREFIX) {
            if ip.is_empty() {
                return Err(IdParseError::Empty(raw.to_string()));
            }
            return Ok(Self::node(ip));
        }
        if let Some(rest) = raw.strip_prefix(POD_PREFIX) {
            let (namespace, name) = rest
                .split_once(SEPARATOR)
                .ok_or_else(|| IdParseError::MissingSeparator(raw.to_string()))?;
            if namespace.is_empty() || name.is_empty() {
                return Err(IdParseError::Empty(raw.to_string()));
            }
            return Ok(Self::pod(namespace, name));
        }
        Err(IdParseError::Unmanaged(raw.to_string()))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Node { ip } => write!(f, "{NODE_PREFIX}{ip}"),
            ServiceId::Pod { namespace, name } => {
                write!(f, "{POD_PREFIX}{namespace}{SEPARATOR}{name}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with(annotations: &[(&str, &str)]) -> PodInfo {
        PodInfo {
            namespace: "default".into(),
            name: "web-0".into(),
            pod_ip: Some("10.1.0.7".into()),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn node_and_pod_ids_are_formatted_with_double_dash() {
        assert_eq!(ServiceId::node("10.0.0.5").to_string(), "node--10.0.0.5");
        assert_eq!(
            ServiceId::pod("kube-system", "core-dns-abc").to_string(),
            "pod--kube-system--core-dns-abc"
        );
    }

    #[test]
    fn parse_recovers_namespace_and_name_with_single_dashes() {
        let id = ServiceId::pod("team-a-prod", "api-server-7d9f-x2");
        assert_eq!(ServiceId::parse(&id.to_string()).unwrap(), id);
        assert_eq!(
            ServiceId::parse("node--10.0.0.9").unwrap(),
            ServiceId::node("10.0.0.9")
        );
    }

    #[test]
    fn parse_splits_on_first_separator_only() {
        assert_eq!(
            ServiceId::parse("pod--ns--name--with--dashes").unwrap(),
            ServiceId::pod("ns", "name--with--dashes")
        );
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert_eq!(
            ServiceId::parse("pod--noseparator"),
            Err(IdParseError::MissingSeparator("pod--noseparator".into()))
        );
        assert!(matches!(
            ServiceId::parse("pod----name"),
            Err(IdParseError::Empty(_))
        ));
        assert!(matches!(
            ServiceId::parse("node--"),
            Err(IdParseError::Empty(_))
        ));
        assert!(matches!(
            ServiceId::parse("consul"),
            Err(IdParseError::Unmanaged(_))
        ));
    }

    #[test]
    fn scrape_requires_literal_true() {
        assert_eq!(pod_with(&[]).scrape_target(), Ok(None));
        assert_eq!(
            pod_with(&[(annotations::SCRAPE, "True"), (annotations::PORT, "9090")])
                .scrape_target(),
            Ok(None)
        );
        assert_eq!(
            pod_with(&[(annotations::SCRAPE, "yes"), (annotations::PORT, "9090")])
                .scrape_target(),
            Ok(None)
        );
    }

    #[test]
    fn scrape_defaults_path_and_rejects_bad_port() {
        let target = pod_with(&[(annotations::SCRAPE, "true"), (annotations::PORT, "9102")])
            .scrape_target()
            .unwrap()
            .unwrap();
        assert_eq!(target.path, "/metrics");
        assert_eq!(target.port, 9102);

        assert_eq!(
            pod_with(&[(annotations::SCRAPE, "true"), (annotations::PORT, "http")])
                .scrape_target(),
            Err(ScrapeError::InvalidPort("http".into()))
        );
        assert_eq!(
            pod_with(&[(annotations::SCRAPE, "true")]).scrape_target(),
            Err(ScrapeError::InvalidPort(String::new()))
        );
    }

    #[test]
    fn entry_name_and_tag_mirror_id() {
        let entry = ServiceEntry::new(&ServiceId::node("10.0.0.1"), "10.0.0.1", 31112, HashMap::new());
        assert_eq!(entry.id, "node--10.0.0.1");
        assert_eq!(entry.name, entry.id);
        assert_eq!(entry.tags, vec![entry.id.clone()]);
        assert!(!entry.belongs_to("cluster-test"));
    }
}
