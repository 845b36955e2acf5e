pub mod catalog;
pub mod dockermachine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;

pub use catalog::{MachineCatalog, MemoryCatalog};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Metadata record for a provisioned host. `name` is immutable once the
/// machine is persisted; `creation_params` are the exact post-merge options
/// used to create it and always contain a `driver` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub creation_params: HashMap<String, String>,
    pub ca_cert_path: Option<String>,
    pub provider_name: String,
}

impl Machine {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum IaasError {
    #[error("driver is mandatory")]
    DriverNotSet,
    #[error("IaaS provider \"{0}\" is not registered")]
    ProviderUnknown(String),
    #[error("machine \"{0}\" already exists")]
    NameTaken(String),
    #[error("machine \"{0}\" not found")]
    NotFound(String),
    #[error("invalid machine params: {0}")]
    BadParams(String),
    #[error("failed to list machines")]
    CatalogList(#[source] BoxError),
    #[error("machine catalog error")]
    Catalog(#[source] BoxError),
    #[error("failed to initialize driver invoker")]
    InvokerInit(#[source] BoxError),
    #[error("failed to release driver invoker resources")]
    InvokerRelease(#[source] BoxError),
    #[error("failed to create machine")]
    Create(#[source] BoxError),
    #[error("failed to delete machine")]
    Delete(#[source] BoxError),
    #[error("failed to remove failed machine: {cleanup} (machine creation failed: {create})")]
    CleanupFailed {
        create: Box<IaasError>,
        cleanup: BoxError,
    },
    #[error("operation cancelled")]
    Cancelled,
}

/// A named, configured adapter that creates and destroys cloud machines.
#[async_trait]
pub trait IaaS: Send + Sync + std::fmt::Debug {
    async fn create_machine(&self, params: HashMap<String, String>) -> Result<Machine, IaasError>;

    async fn delete_machine(&self, machine: &Machine) -> Result<(), IaasError>;

    /// Human documentation of the provider's parameters, exposed verbatim to
    /// the admin surface.
    fn describe(&self) -> String;
}

/// Everything a provider factory needs besides the base kind: the instance
/// name it was resolved under, the config tree and the machine catalog.
#[derive(Clone)]
pub struct ProviderContext {
    pub instance_name: String,
    pub config: Arc<Config>,
    pub catalog: Arc<dyn MachineCatalog>,
}

pub type ProviderFactory = fn(ProviderContext) -> Arc<dyn IaaS>;

/// Table of provider kinds. The process-wide instance is populated once,
/// inside its lazy initializer, and only read afterwards.
pub struct ProviderRegistry {
    table: HashMap<&'static str, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, factory: ProviderFactory) {
        self.table.insert(kind, factory);
    }

    pub fn resolve(&self, kind: &str, ctx: ProviderContext) -> Result<Arc<dyn IaaS>, IaasError> {
        let factory = self
            .table
            .get(kind)
            .ok_or_else(|| IaasError::ProviderUnknown(kind.to_string()))?;
        Ok(factory(ctx))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.table.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    static ref PROVIDERS: ProviderRegistry = {
        let mut registry = ProviderRegistry::new();
        registry.register("dockermachine", dockermachine::DockerMachineIaas::factory);
        registry
    };
}

/// Resolve a named provider instance of the given kind from the process-wide
/// registry.
pub fn resolve(
    kind: &str,
    instance_name: &str,
    config: Arc<Config>,
    catalog: Arc<dyn MachineCatalog>,
) -> Result<Arc<dyn IaaS>, IaasError> {
    PROVIDERS.resolve(
        kind,
        ProviderContext {
            instance_name: instance_name.to_string(),
            config,
            catalog,
        },
    )
}

pub fn registered_kinds() -> Vec<&'static str> {
    PROVIDERS.kinds()
}
