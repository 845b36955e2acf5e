pub mod juju;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::iaas::BoxError;

pub use juju::{BootstrapHealer, JujuProbe, Report};

#[derive(Debug, Error)]
pub enum HealError {
    #[error("healer \"{0}\" is not registered")]
    UnknownHealer(String),
    #[error("failed to probe cluster status")]
    Probe(#[source] BoxError),
    #[error("bootstrap node address unavailable")]
    AddressUnavailable,
    #[error("remote recovery command failed: {0}")]
    Remote(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// A probe plus a remediation, registered under a name. `needs_heal` is a
/// side-effect-free inspection; `heal` runs the remediation.
#[async_trait]
pub trait Healer: Send + Sync + std::fmt::Debug {
    async fn needs_heal(&self) -> Result<bool, HealError>;

    async fn heal(&self) -> Result<(), HealError>;
}

struct HealerEntry {
    healer: Arc<dyn Healer>,
    // Serialises invocations of this healer; different healers run in
    // parallel.
    gate: Mutex<()>,
}

/// Table of named healers. The process-wide instance is populated once,
/// inside its lazy initializer, and only read afterwards.
pub struct HealerRegistry {
    table: HashMap<&'static str, HealerEntry>,
}

impl HealerRegistry {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, healer: Arc<dyn Healer>) {
        self.table.insert(
            name,
            HealerEntry {
                healer,
                gate: Mutex::new(()),
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Healer>, HealError> {
        self.table
            .get(name)
            .map(|entry| entry.healer.clone())
            .ok_or_else(|| HealError::UnknownHealer(name.to_string()))
    }

    /// Probes the named healer and runs its remediation only when the probe
    /// says so. When healthy, no remote side effect happens at all.
    pub async fn run(&self, name: &str) -> Result<(), HealError> {
        let entry = self
            .table
            .get(name)
            .ok_or_else(|| HealError::UnknownHealer(name.to_string()))?;
        let _guard = entry.gate.lock().await;
        if entry.healer.needs_heal().await? {
            info!(healer = name, "unhealthy, running heal");
            entry.healer.heal().await?;
            info!(healer = name, "heal finished");
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.table.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for HealerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    static ref HEALERS: HealerRegistry = {
        let mut registry = HealerRegistry::new();
        registry.register("bootstrap", Arc::new(BootstrapHealer::new()));
        registry
    };
}

pub fn get(name: &str) -> Result<Arc<dyn Healer>, HealError> {
    HEALERS.get(name)
}

pub async fn run(name: &str) -> Result<(), HealError> {
    HEALERS.run(name).await
}

pub fn registered_names() -> Vec<&'static str> {
    HEALERS.names()
}
