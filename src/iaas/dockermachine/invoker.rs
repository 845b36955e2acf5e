use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::iaas::{IaasError, Machine};

const DOCKER_MACHINE_BIN: &str = "docker-machine";
const CREATE_TIMEOUT: Duration = Duration::from_secs(600);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Construction parameters for the driver invoker.
#[derive(Debug, Clone, Default)]
pub struct DockerMachineConfig {
    pub ca_path: Option<String>,
    pub insecure_registry: Option<String>,
    /// Empty means the driver's default install script.
    pub docker_engine_install_url: Option<String>,
}

/// Creation failure that may carry a partially-constructed machine so the
/// provider can compensate by deleting it.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct InvokerError {
    pub partial: Option<Machine>,
    #[source]
    pub source: IaasError,
}

impl InvokerError {
    pub fn new(source: IaasError) -> Self {
        Self {
            partial: None,
            source,
        }
    }

    pub fn with_partial(partial: Machine, source: IaasError) -> Self {
        Self {
            partial: Some(partial),
            source,
        }
    }
}

/// Opaque adapter over a docker-machine style driver backend.
#[async_trait]
pub trait DockerMachineApi: Send + Sync {
    async fn create_machine(
        &self,
        name: &str,
        driver: &str,
        opts: &HashMap<String, Value>,
    ) -> Result<Machine, InvokerError>;

    /// Idempotent: deleting an already-gone machine succeeds.
    async fn delete_machine(&self, machine: &Machine) -> Result<(), IaasError>;

    /// Releases the invoker's transient resources. Must be called on every
    /// exit path, success or failure.
    async fn close(&self) -> Result<(), IaasError>;
}

#[derive(Debug, Error)]
#[error("{command} failed: {stderr}")]
struct CommandFailed {
    command: String,
    stderr: String,
}

enum RunError {
    Cancelled,
    Io(std::io::Error),
}

/// Production invoker: shells out to the docker-machine binary with a
/// per-call scratch directory as its storage path.
pub struct CliInvoker {
    config: DockerMachineConfig,
    storage_path: PathBuf,
}

impl CliInvoker {
    pub fn new(config: DockerMachineConfig) -> Result<Self, IaasError> {
        let storage_path =
            std::env::temp_dir().join(format!("forge-machine-{}", Uuid::new_v4()));
        Ok(Self {
            config,
            storage_path,
        })
    }

    /// Stages the scratch storage area; runs once before the first command of
    /// a call so the constructor stays free of filesystem work.
    async fn prepare(&self) -> Result<(), IaasError> {
        let init_err = |err: std::io::Error| IaasError::InvokerInit(Box::new(err));
        tokio::fs::create_dir_all(self.storage_path.join("machines"))
            .await
            .map_err(init_err)?;
        if let Some(ref ca_path) = self.config.ca_path {
            // Stage the CA bundle where docker-machine expects its certs.
            let certs = self.storage_path.join("certs");
            tokio::fs::create_dir_all(&certs).await.map_err(init_err)?;
            tokio::fs::copy(Path::new(ca_path).join("ca.pem"), certs.join("ca.pem"))
                .await
                .map_err(init_err)?;
        }
        Ok(())
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<Output, RunError> {
        debug!("running {} {}", DOCKER_MACHINE_BIN, args.join(" "));
        let mut command = tokio::process::Command::new(DOCKER_MACHINE_BIN);
        command
            .arg("--storage-path")
            .arg(&self.storage_path)
            .args(args)
            .kill_on_drop(true);
        match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(RunError::Io(err)),
            Err(_) => Err(RunError::Cancelled),
        }
    }

    fn create_args(
        &self,
        name: &str,
        driver: &str,
        opts: &HashMap<String, Value>,
    ) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            name.to_string(),
            "--driver".to_string(),
            driver.to_string(),
        ];
        if let Some(ref url) = self.config.docker_engine_install_url {
            if !url.is_empty() {
                args.push("--engine-install-url".to_string());
                args.push(url.clone());
            }
        }
        if let Some(ref registry) = self.config.insecure_registry {
            if !registry.is_empty() {
                args.push("--engine-insecure-registry".to_string());
                args.push(registry.clone());
            }
        }
        // Deterministic flag order keeps command invocations reproducible.
        let mut keys: Vec<_> = opts.keys().collect();
        keys.sort_unstable();
        for key in keys {
            if key == "driver" {
                continue;
            }
            match &opts[key] {
                Value::Bool(true) => args.push(format!("--{key}")),
                Value::Bool(false) | Value::Null => {}
                Value::String(s) => {
                    args.push(format!("--{key}"));
                    args.push(s.clone());
                }
                other => {
                    args.push(format!("--{key}"));
                    args.push(other.to_string());
                }
            }
        }
        args
    }

    fn partial_machine(&self, name: &str) -> Option<Machine> {
        // docker-machine leaves a host directory behind when provisioning got
        // far enough to allocate cloud resources.
        let host_dir = self.storage_path.join("machines").join(name);
        host_dir.exists().then(|| Machine::named(name))
    }

    async fn inspect(&self, name: &str) -> Result<(String, u16), IaasError> {
        let ip_out = self
            .run(&["ip".to_string(), name.to_string()], COMMAND_TIMEOUT)
            .await
            .map_err(|err| err.into_iaas(IaasError::Create))?;
        if !ip_out.status.success() {
            return Err(command_failed("docker-machine ip", &ip_out, IaasError::Create));
        }
        let address = String::from_utf8_lossy(&ip_out.stdout).trim().to_string();
        let url_out = self
            .run(&["url".to_string(), name.to_string()], COMMAND_TIMEOUT)
            .await
            .map_err(|err| err.into_iaas(IaasError::Create))?;
        if !url_out.status.success() {
            return Err(command_failed("docker-machine url", &url_out, IaasError::Create));
        }
        let url = String::from_utf8_lossy(&url_out.stdout).trim().to_string();
        let port = parse_engine_port(&url).unwrap_or(0);
        Ok((address, port))
    }
}

impl RunError {
    fn into_iaas(self, wrap: fn(crate::iaas::BoxError) -> IaasError) -> IaasError {
        match self {
            RunError::Cancelled => IaasError::Cancelled,
            RunError::Io(err) => wrap(Box::new(err)),
        }
    }
}

fn command_failed(
    command: &str,
    output: &Output,
    wrap: fn(crate::iaas::BoxError) -> IaasError,
) -> IaasError {
    wrap(Box::new(CommandFailed {
        command: command.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }))
}

/// Engine port out of a `tcp://host:port` URL.
fn parse_engine_port(url: &str) -> Option<u16> {
    url.rsplit(':').next()?.parse().ok()
}

#[async_trait]
impl DockerMachineApi for CliInvoker {
    async fn create_machine(
        &self,
        name: &str,
        driver: &str,
        opts: &HashMap<String, Value>,
    ) -> Result<Machine, InvokerError> {
        self.prepare().await.map_err(InvokerError::new)?;
        let args = self.create_args(name, driver, opts);
        let output = self.run(&args, CREATE_TIMEOUT).await.map_err(|err| {
            InvokerError::new(err.into_iaas(IaasError::Create))
        })?;
        if !output.status.success() {
            let err = command_failed("docker-machine create", &output, IaasError::Create);
            return Err(match self.partial_machine(name) {
                Some(partial) => InvokerError::with_partial(partial, err),
                None => InvokerError::new(err),
            });
        }
        // Host exists from here on; failures below must still be compensable.
        let partial = Machine::named(name);
        let (address, port) = self
            .inspect(name)
            .await
            .map_err(|err| InvokerError::with_partial(partial.clone(), err))?;
        Ok(Machine {
            name: name.to_string(),
            address,
            port,
            ca_cert_path: self
                .config
                .ca_path
                .as_ref()
                .map(|p| Path::new(p).join("ca.pem").display().to_string()),
            ..Default::default()
        })
    }

    async fn delete_machine(&self, machine: &Machine) -> Result<(), IaasError> {
        self.prepare().await?;
        let args = vec!["rm".to_string(), "-y".to_string(), machine.name.clone()];
        let output = self
            .run(&args, COMMAND_TIMEOUT)
            .await
            .map_err(|err| err.into_iaas(IaasError::Delete))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not exist") {
            debug!(machine = %machine.name, "machine already gone, treating delete as success");
            return Ok(());
        }
        Err(command_failed("docker-machine rm", &output, IaasError::Delete))
    }

    async fn close(&self) -> Result<(), IaasError> {
        match tokio::fs::remove_dir_all(&self.storage_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(IaasError::InvokerRelease(Box::new(err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_port_from_url() {
        assert_eq!(parse_engine_port("tcp://192.168.99.100:2376"), Some(2376));
        assert_eq!(parse_engine_port("not a url"), None);
    }

    #[tokio::test]
    async fn prepare_stages_scratch_area_and_ca_bundle() {
        let ca_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(ca_dir.path().join("ca.pem"), "dummy cert").unwrap();
        let invoker = CliInvoker::new(DockerMachineConfig {
            ca_path: Some(ca_dir.path().display().to_string()),
            ..Default::default()
        })
        .unwrap();
        // the constructor does no filesystem work
        assert!(!invoker.storage_path.exists());

        invoker.prepare().await.unwrap();
        assert!(invoker.storage_path.join("machines").is_dir());
        assert!(invoker.storage_path.join("certs").join("ca.pem").is_file());

        invoker.close().await.unwrap();
        assert!(!invoker.storage_path.exists());
    }

    #[test]
    fn create_args_are_deterministic() {
        let invoker = CliInvoker {
            config: DockerMachineConfig {
                docker_engine_install_url: Some("http://get.docker.com".to_string()),
                ..Default::default()
            },
            storage_path: PathBuf::from("/tmp/x"),
        };
        let mut opts = HashMap::new();
        opts.insert("region".to_string(), json!("us-east-1"));
        opts.insert("driver".to_string(), json!("amazonec2"));
        opts.insert("swarm".to_string(), json!(true));
        opts.insert("count".to_string(), json!(2));
        let args = invoker.create_args("dev-1", "amazonec2", &opts);
        assert_eq!(
            args,
            vec![
                "create",
                "dev-1",
                "--driver",
                "amazonec2",
                "--engine-install-url",
                "http://get.docker.com",
                "--count",
                "2",
                "--region",
                "us-east-1",
                "--swarm",
            ]
        );
    }
}
