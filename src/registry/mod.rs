use std::collections::HashMap;

use crate::error::RegistryError;
use crate::types::ServiceEntry;
use async_trait::async_trait;

pub mod consul;
pub use consul::ConsulAgent;

/// The external service catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    /// All entries currently known to the agent, keyed by identifier.
    async fn services(&self) -> Result<HashMap<String, ServiceEntry>, RegistryError>;

    /// Upserts an entry by identifier.
    async fn register(&self, entry: &ServiceEntry) -> Result<(), RegistryError>;

    async fn deregister(&self, id: &str) -> Result<(), RegistryError>;
}
