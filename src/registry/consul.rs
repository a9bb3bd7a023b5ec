//! Consul agent client.
//!
//! Only the three agent endpoints the reconciler needs are wrapped:
//! list local services, register and deregister.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use super::Registry;
use crate::error::RegistryError;
use crate::types::ServiceEntry;

pub struct ConsulAgent {
    base_url: String,
    http: Client,
}

/// Wire shape of `PUT /v1/agent/service/register`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Registration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: &'a HashMap<String, String>,
}

/// Wire shape of one value in `GET /v1/agent/services`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

impl From<AgentService> for ServiceEntry {
    fn from(s: AgentService) -> Self {
        ServiceEntry {
            id: s.id,
            name: s.service,
            address: s.address,
            port: s.port,
            tags: s.tags.unwrap_or_default(),
            meta: s.meta.unwrap_or_default(),
        }
    }
}

impl ConsulAgent {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response, RegistryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl Registry for ConsulAgent {
    async fn services(&self) -> Result<HashMap<String, ServiceEntry>, RegistryError> {
        let response = self.http.get(self.url("/v1/agent/services")).send().await?;
        let services: HashMap<String, AgentService> = Self::check(response).await?.json().await?;
        Ok(services
            .into_iter()
            .map(|(id, svc)| (id, ServiceEntry::from(svc)))
            .collect())
    }

    async fn register(&self, entry: &ServiceEntry) -> Result<(), RegistryError> {
        let body = Registration {
            id: &entry.id,
            name: &entry.name,
            address: &entry.address,
            port: entry.port,
            tags: &entry.tags,
            meta: &entry.meta,
        };
        let response = self
            .http
            .put(self.url("/v1/agent/service/register"))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        debug!("Registered {} at {}:{}", entry.id, entry.address, entry.port);
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let response = self
            .http
            .put(self.url(&format!("/v1/agent/service/deregister/{}", id)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
