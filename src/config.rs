use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 600;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CLUSTER_NAME: &str = "cluster-test";
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Environment keys read as-is (no prefix) so existing deployments keep working.
const ENV_KEYS: &[&str] = &[
    "mode",
    "consul_address",
    "sync_period",
    "cluster_name",
    "shard_paths",
    "listen_addr",
    "token_path",
    "upstream_timeout",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Registrar,
    Proxy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mode: Mode,
    pub consul_address: String,
    #[serde(deserialize_with = "period_or_default")]
    pub sync_period: u64,
    #[serde(deserialize_with = "any_string")]
    pub cluster_name: String,
    #[serde(deserialize_with = "comma_list")]
    pub shard_paths: Vec<String>,
    pub listen_addr: SocketAddr,
    pub token_path: String,
    #[serde(deserialize_with = "timeout_or_default")]
    pub upstream_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Registrar,
            consul_address: "localhost:8500".into(),
            sync_period: DEFAULT_SYNC_PERIOD_SECS,
            cluster_name: DEFAULT_CLUSTER_NAME.into(),
            shard_paths: Vec::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            token_path: DEFAULT_TOKEN_PATH.into(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("registrar.toml"))
                .merge(Env::raw().only(ENV_KEYS)),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.cluster_name.trim().is_empty() {
            warn!("CLUSTER_NAME is empty, using {}", DEFAULT_CLUSTER_NAME);
            config.cluster_name = DEFAULT_CLUSTER_NAME.into();
        }

        Ok(config)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    /// Base URL of the Consul agent; bare `host:port` values get `http://`.
    pub fn consul_url(&self) -> String {
        let address = self.consul_address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }
}

/// Environment values arrive typed (`42` is an integer, `true` a bool),
/// so string-ish settings accept any scalar.
#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Lenient {
    fn into_text(self) -> String {
        match self {
            Lenient::Bool(b) => b.to_string(),
            Lenient::Int(n) => n.to_string(),
            Lenient::Float(f) => f.to_string(),
            Lenient::Text(s) => s,
        }
    }

    fn positive(self) -> Option<u64> {
        let n = match self {
            Lenient::Int(n) => n,
            Lenient::Text(s) => s.trim().parse::<i64>().ok()?,
            Lenient::Bool(_) | Lenient::Float(_) => return None,
        };
        u64::try_from(n).ok().filter(|n| *n > 0)
    }
}

fn positive_or(value: Lenient, key: &str, default: u64) -> u64 {
    value.positive().unwrap_or_else(|| {
        warn!("Invalid or missing {}, defaulting to {} seconds", key, default);
        default
    })
}

/// Non-positive or non-numeric periods fall back to the default.
fn period_or_default<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    Ok(positive_or(
        Lenient::deserialize(de)?,
        "SYNC_PERIOD",
        DEFAULT_SYNC_PERIOD_SECS,
    ))
}

fn timeout_or_default<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    Ok(positive_or(
        Lenient::deserialize(de)?,
        "UPSTREAM_TIMEOUT",
        DEFAULT_UPSTREAM_TIMEOUT_SECS,
    ))
}

fn any_string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(Lenient::deserialize(de)?.into_text())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrText {
    List(Vec<Lenient>),
    Scalar(Lenient),
}

fn comma_list<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    let items: Vec<String> = match ListOrText::deserialize(de)? {
        ListOrText::List(items) => items.into_iter().map(Lenient::into_text).collect(),
        ListOrText::Scalar(value) => value
            .into_text()
            .split(',')
            .map(str::to_string)
            .collect(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}
