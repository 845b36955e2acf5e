use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;
use tracing::{debug, warn};

use super::{HealError, Healer};

const JUJU_BIN: &str = "juju";
const SSH_BIN: &str = "ssh";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one cluster status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Healthy,
    BootstrapDown,
    /// Command failure, timeout or unparseable status document.
    Unknown,
}

#[derive(Debug, Clone, Default)]
struct BootstrapStatus {
    agent_state: Option<String>,
    dns_name: Option<String>,
}

/// The status document keys machines by number; depending on the YAML
/// emitter that key may arrive as an integer or a string.
fn bootstrap_entry(doc: &serde_yaml::Value) -> Option<&serde_yaml::Value> {
    let machines = doc.get("machines")?.as_mapping()?;
    machines.iter().find_map(|(key, value)| {
        let is_zero = key.as_u64() == Some(0) || key.as_str() == Some("0");
        is_zero.then_some(value)
    })
}

fn parse_status(doc: &str) -> Option<BootstrapStatus> {
    let doc: serde_yaml::Value = serde_yaml::from_str(doc).ok()?;
    let machine = bootstrap_entry(&doc)?;
    Some(BootstrapStatus {
        agent_state: machine
            .get("agent-state")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        dns_name: machine
            .get("dns-name")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

enum CommandError {
    Cancelled,
    Io(std::io::Error),
}

async fn run_command(
    bin: &str,
    args: &[String],
    timeout: Duration,
) -> Result<Output, CommandError> {
    debug!("running {} {}", bin, args.join(" "));
    let mut command = tokio::process::Command::new(bin);
    command.args(args).kill_on_drop(true);
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(CommandError::Io(err)),
        Err(_) => Err(CommandError::Cancelled),
    }
}

/// Executes `juju status` and decides whether the bootstrap node is healthy.
/// One command execution per probe, fixed timeout, no retries.
#[derive(Debug, Clone, Default)]
pub struct JujuProbe;

impl JujuProbe {
    pub fn new() -> Self {
        Self
    }

    async fn read_status(&self) -> Result<BootstrapStatus, HealError> {
        let output = run_command(JUJU_BIN, &["status".to_string()], PROBE_TIMEOUT)
            .await
            .map_err(|err| match err {
                CommandError::Cancelled => HealError::Cancelled,
                CommandError::Io(err) => HealError::Probe(Box::new(err)),
            })?;
        if !output.status.success() {
            return Err(HealError::Probe(
                format!(
                    "juju status exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )
                .into(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_status(&stdout).ok_or_else(|| {
            HealError::Probe("juju status output has no bootstrap machine".into())
        })
    }

    pub async fn status(&self) -> Report {
        let status = match self.read_status().await {
            Ok(status) => status,
            Err(err) => {
                warn!("cluster probe failed: {err}");
                return Report::Unknown;
            }
        };
        match status.agent_state.as_deref() {
            Some("running") => Report::Healthy,
            Some(state) => {
                debug!("bootstrap agent-state is {state:?}");
                Report::BootstrapDown
            }
            None => Report::Unknown,
        }
    }

    /// Address of the bootstrap node, re-read from a fresh status document.
    pub async fn bootstrap_address(&self) -> Result<String, HealError> {
        self.read_status()
            .await?
            .dns_name
            .ok_or(HealError::AddressUnavailable)
    }
}

/// Restarts the orchestrator's machine agent on the bootstrap node when the
/// probe reports it down.
#[derive(Debug, Default)]
pub struct BootstrapHealer {
    probe: JujuProbe,
}

impl BootstrapHealer {
    pub fn new() -> Self {
        Self {
            probe: JujuProbe::new(),
        }
    }

    async fn restart_machine_agent(&self, address: &str) -> Result<(), HealError> {
        // Argument order is part of the contract; tests assert on it.
        let args: Vec<String> = [
            "-o",
            "StrictHostKeyChecking no",
            "-q",
            "-l",
            "ubuntu",
            address,
            "sudo",
            "restart",
            "juju-machine-agent",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let output = run_command(SSH_BIN, &args, REMOTE_TIMEOUT)
            .await
            .map_err(|err| match err {
                CommandError::Cancelled => HealError::Cancelled,
                CommandError::Io(err) => HealError::Remote(err.to_string()),
            })?;
        if !output.status.success() {
            return Err(HealError::Remote(format!(
                "ssh exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Healer for BootstrapHealer {
    async fn needs_heal(&self) -> Result<bool, HealError> {
        Ok(self.probe.status().await == Report::BootstrapDown)
    }

    async fn heal(&self) -> Result<(), HealError> {
        let address = self.probe.bootstrap_address().await?;
        self.restart_machine_agent(&address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_RUNNING: &str = r#"
machines:
  "0":
    agent-state: running
    dns-name: 10.10.10.96
    instance-id: i-00000zz6
services: {}
"#;

    const STATUS_NUMERIC_KEY: &str = r#"
machines:
  0:
    agent-state: down
    dns-name: 10.10.10.96
"#;

    #[test]
    fn parses_quoted_machine_key() {
        let status = parse_status(STATUS_RUNNING).unwrap();
        assert_eq!(status.agent_state.as_deref(), Some("running"));
        assert_eq!(status.dns_name.as_deref(), Some("10.10.10.96"));
    }

    #[test]
    fn parses_numeric_machine_key() {
        let status = parse_status(STATUS_NUMERIC_KEY).unwrap();
        assert_eq!(status.agent_state.as_deref(), Some("down"));
    }

    #[test]
    fn missing_bootstrap_machine_is_unparseable() {
        assert!(parse_status("machines: {}\n").is_none());
        assert!(parse_status("not yaml: [").is_none());
    }
}
