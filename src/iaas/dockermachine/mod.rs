pub mod invoker;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ProviderBinding;

use super::{IaaS, IaasError, Machine, ProviderContext};

pub use invoker::{CliInvoker, DockerMachineApi, DockerMachineConfig, InvokerError};

pub const KIND: &str = "dockermachine";

type ApiFactory =
    Arc<dyn Fn(DockerMachineConfig) -> Result<Box<dyn DockerMachineApi>, IaasError> + Send + Sync>;

/// IaaS provider backed by a docker-machine style driver CLI. Merges layered
/// driver options, synthesises machine names from the catalog size and
/// compensates by deleting half-created machines when provisioning fails.
pub struct DockerMachineIaas {
    binding: ProviderBinding,
    ctx: ProviderContext,
    api_factory: ApiFactory,
}

impl std::fmt::Debug for DockerMachineIaas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerMachineIaas")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl DockerMachineIaas {
    pub fn new(ctx: ProviderContext) -> Self {
        Self {
            binding: ProviderBinding::new(KIND, &ctx.instance_name),
            ctx,
            api_factory: Arc::new(|config| {
                CliInvoker::new(config).map(|api| Box::new(api) as Box<dyn DockerMachineApi>)
            }),
        }
    }

    pub fn factory(ctx: ProviderContext) -> Arc<dyn IaaS> {
        Arc::new(Self::new(ctx))
    }

    /// Same as `new` but with an injected invoker factory, for tests.
    pub fn with_api_factory<F>(ctx: ProviderContext, factory: F) -> Self
    where
        F: Fn(DockerMachineConfig) -> Result<Box<dyn DockerMachineApi>, IaasError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            binding: ProviderBinding::new(KIND, &ctx.instance_name),
            ctx,
            api_factory: Arc::new(factory),
        }
    }

    fn param_or_config(&self, key: &str, params: &HashMap<String, String>) -> Option<String> {
        params
            .get(key)
            .cloned()
            .or_else(|| self.binding.get_string(&self.ctx.config, key))
    }

    /// Overlay of configured `driver:options` defaults with the call params;
    /// params win on conflict. Non-string keys at the top level of the config
    /// mapping are dropped.
    fn build_driver_opts(&self, params: &HashMap<String, String>) -> HashMap<String, Value> {
        let mut opts = HashMap::new();
        if let Some(defaults) = self
            .binding
            .get(&self.ctx.config, "driver:options")
            .and_then(|v| v.as_mapping())
        {
            for (key, value) in defaults {
                match key.as_str() {
                    Some(key) => match serde_json::to_value(value) {
                        Ok(value) => {
                            opts.insert(key.to_string(), value);
                        }
                        Err(err) => {
                            debug!("skipping unrepresentable driver option {key:?}: {err}");
                        }
                    },
                    None => {
                        debug!("skipping non-string driver option key {key:?}");
                    }
                }
            }
        }
        for (key, value) in params {
            opts.insert(key.clone(), Value::String(value.clone()));
        }
        opts
    }

    async fn provision(
        &self,
        api: &dyn DockerMachineApi,
        name: &str,
        driver: &str,
        opts: &HashMap<String, Value>,
    ) -> Result<Machine, IaasError> {
        let err = match api.create_machine(name, driver, opts).await {
            Ok(machine) => return Ok(machine),
            Err(err) => err,
        };
        let InvokerError { partial, source } = err;
        // A cancelled create is propagated as-is; only scoped releases run.
        if matches!(source, IaasError::Cancelled) {
            return Err(IaasError::Cancelled);
        }
        if let Some(partial) = partial {
            warn!(machine = %partial.name, "machine creation failed, removing partial machine");
            if let Err(cleanup) = api.delete_machine(&partial).await {
                return Err(IaasError::CleanupFailed {
                    create: Box::new(source),
                    cleanup: Box::new(cleanup),
                });
            }
        }
        Err(source)
    }
}

#[async_trait]
impl IaaS for DockerMachineIaas {
    async fn create_machine(
        &self,
        mut params: HashMap<String, String>,
    ) -> Result<Machine, IaasError> {
        let ca_path = self.binding.get_string(&self.ctx.config, "ca-path");
        let driver = match params.get("driver") {
            Some(driver) => driver.clone(),
            None => self
                .binding
                .get_string(&self.ctx.config, "driver:name")
                .ok_or(IaasError::DriverNotSet)?,
        };
        let install_url = self.param_or_config("docker-install-url", &params);
        let insecure_registry = self.param_or_config("insecure-registry", &params);
        let name = match params.remove("name") {
            Some(name) => name,
            None => {
                let machines = self
                    .ctx
                    .catalog
                    .list()
                    .await
                    .map_err(|err| IaasError::CatalogList(Box::new(err)))?;
                let pool = params.get("pool").map(String::as_str).unwrap_or_default();
                format!("{}-{}", pool, machines.len() + 1)
            }
        };
        let driver_opts = self.build_driver_opts(&params);
        let api = (self.api_factory)(DockerMachineConfig {
            ca_path,
            insecure_registry,
            docker_engine_install_url: install_url,
        })?;
        let outcome = self.provision(api.as_ref(), &name, &driver, &driver_opts).await;
        if let Err(err) = api.close().await {
            warn!("failed to release docker machine invoker: {err}");
        }
        let mut machine = outcome?;
        // The recorded params must always name the driver that was used, even
        // when it came from config rather than the caller.
        params.entry("driver".to_string()).or_insert(driver);
        machine.creation_params = params;
        machine.provider_name = self.ctx.instance_name.clone();
        self.ctx.catalog.put(machine.clone()).await?;
        Ok(machine)
    }

    async fn delete_machine(&self, machine: &Machine) -> Result<(), IaasError> {
        let api = (self.api_factory)(DockerMachineConfig::default())?;
        let outcome = api.delete_machine(machine).await;
        if let Err(err) = api.close().await {
            warn!("failed to release docker machine invoker: {err}");
        }
        outcome?;
        match self.ctx.catalog.delete(&machine.name).await {
            Ok(()) | Err(IaasError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn describe(&self) -> String {
        r#"DockerMachine IaaS required params:
  driver=<driver>                         Driver to be used by docker machine. Can be set on the IaaS configuration.

Optional params:
  name=<name>                             Hostname for the created machine
  docker-install-url=<docker-install-url> Remote script to be used for docker installation. Defaults to: http://get.docker.com. Can be set on the IaaS configuration.
  insecure-registry=<insecure-registry>   Registry to be added as insecure-registry to the docker engine. Can be set on the IaaS configuration.
"#
        .to_string()
    }
}
