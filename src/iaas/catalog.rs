use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{IaasError, Machine};

/// Store of `{name -> Machine}` with uniqueness on name. `put` of a duplicate
/// name fails with `NameTaken` instead of overwriting; the list size feeds
/// machine-name synthesis.
#[async_trait]
pub trait MachineCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<Machine>, IaasError>;

    async fn get(&self, name: &str) -> Result<Option<Machine>, IaasError>;

    async fn put(&self, machine: Machine) -> Result<(), IaasError>;

    async fn delete(&self, name: &str) -> Result<(), IaasError>;
}

/// In-process catalog. The durable counterpart lives in
/// `crate::storage::MachineStore`.
#[derive(Default)]
pub struct MemoryCatalog {
    machines: RwLock<HashMap<String, Machine>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MachineCatalog for MemoryCatalog {
    async fn list(&self) -> Result<Vec<Machine>, IaasError> {
        let machines = self.machines.read().await;
        let mut list: Vec<_> = machines.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn get(&self, name: &str) -> Result<Option<Machine>, IaasError> {
        Ok(self.machines.read().await.get(name).cloned())
    }

    async fn put(&self, machine: Machine) -> Result<(), IaasError> {
        let mut machines = self.machines.write().await;
        if machines.contains_key(&machine.name) {
            return Err(IaasError::NameTaken(machine.name));
        }
        machines.insert(machine.name.clone(), machine);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), IaasError> {
        let mut machines = self.machines.write().await;
        machines
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| IaasError::NotFound(name.to_string()))
    }
}
