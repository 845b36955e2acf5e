use async_trait::async_trait;
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use forge::heal::{self, HealError, Healer, HealerRegistry};

const STATUS_RUNNING: &str = r#"machines:
  "0":
    agent-state: running
    dns-name: 10.10.10.96
    instance-id: i-00000zz6
services: {}
"#;

const STATUS_BOOTSTRAP_DOWN: &str = r#"machines:
  "0":
    agent-state: down
    dns-name: 10.10.10.96
    instance-id: i-00000zz6
services: {}
"#;

/// Stages a fake executable that appends its argv to `<name>.calls` (one
/// invocation per line, args separated by the unit separator) and prints a
/// canned document on stdout.
fn mock_command(dir: &Path, name: &str, output: &str) {
    let path = dir.join(name);
    let calls_file = dir.join(format!("{name}.calls"));
    let out_file = dir.join(format!("{name}.out"));
    let script = format!(
        "#!/bin/sh\n\
         printf '%s\\037' \"$@\" >> \"{calls}\"\n\
         printf '\\n' >> \"{calls}\"\n\
         cat \"{out}\" 2>/dev/null\n\
         exit 0\n",
        calls = calls_file.display(),
        out = out_file.display(),
    );
    std::fs::write(&path, script).unwrap();
    std::fs::write(dir.join(format!("{name}.out")), output).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn calls(dir: &Path, name: &str) -> Vec<Vec<String>> {
    match std::fs::read_to_string(dir.join(format!("{name}.calls"))) {
        Ok(contents) => contents
            .lines()
            .map(|line| {
                line.split('\u{1f}')
                    .filter(|arg| !arg.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

struct PathGuard {
    original: Option<std::ffi::OsString>,
}

fn prepend_path(dir: &Path) -> PathGuard {
    let original = std::env::var_os("PATH");
    let mut paths = vec![PathBuf::from(dir)];
    if let Some(ref old) = original {
        paths.extend(std::env::split_paths(old));
    }
    std::env::set_var("PATH", std::env::join_paths(paths).unwrap());
    PathGuard { original }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        match self.original.take() {
            Some(old) => std::env::set_var("PATH", old),
            None => std::env::remove_var("PATH"),
        }
    }
}

#[tokio::test]
#[serial]
async fn bootstrap_healer_is_registered() {
    assert!(heal::get("bootstrap").is_ok());
    let err = heal::get("nonexistent").unwrap_err();
    assert!(matches!(err, HealError::UnknownHealer(_)));
}

#[tokio::test]
#[serial]
async fn needs_heal_when_bootstrap_is_down() {
    let dir = TempDir::new().unwrap();
    mock_command(dir.path(), "juju", STATUS_BOOTSTRAP_DOWN);
    let _path = prepend_path(dir.path());

    let healer = heal::get("bootstrap").unwrap();
    assert!(healer.needs_heal().await.unwrap());
    assert_eq!(calls(dir.path(), "juju"), vec![vec!["status".to_string()]]);
}

#[tokio::test]
#[serial]
async fn does_not_need_heal_when_bootstrap_is_running() {
    let dir = TempDir::new().unwrap();
    mock_command(dir.path(), "juju", STATUS_RUNNING);
    let _path = prepend_path(dir.path());

    let healer = heal::get("bootstrap").unwrap();
    assert!(!healer.needs_heal().await.unwrap());
}

#[tokio::test]
#[serial]
async fn heal_restarts_the_machine_agent_over_ssh() {
    let dir = TempDir::new().unwrap();
    mock_command(dir.path(), "juju", STATUS_BOOTSTRAP_DOWN);
    mock_command(dir.path(), "ssh", "");
    let _path = prepend_path(dir.path());

    heal::run("bootstrap").await.unwrap();

    // one status probe to decide, one to look up the bootstrap address
    assert_eq!(
        calls(dir.path(), "juju"),
        vec![vec!["status".to_string()], vec!["status".to_string()]]
    );
    let ssh_calls = calls(dir.path(), "ssh");
    assert_eq!(
        ssh_calls,
        vec![vec![
            "-o".to_string(),
            "StrictHostKeyChecking no".to_string(),
            "-q".to_string(),
            "-l".to_string(),
            "ubuntu".to_string(),
            "10.10.10.96".to_string(),
            "sudo".to_string(),
            "restart".to_string(),
            "juju-machine-agent".to_string(),
        ]]
    );
}

#[tokio::test]
#[serial]
async fn healthy_bootstrap_runs_zero_remote_commands() {
    let dir = TempDir::new().unwrap();
    mock_command(dir.path(), "juju", STATUS_RUNNING);
    mock_command(dir.path(), "ssh", "");
    let _path = prepend_path(dir.path());

    heal::run("bootstrap").await.unwrap();

    assert_eq!(calls(dir.path(), "juju"), vec![vec!["status".to_string()]]);
    assert!(calls(dir.path(), "ssh").is_empty());
}

#[tokio::test]
#[serial]
async fn unparseable_status_is_not_healed() {
    let dir = TempDir::new().unwrap();
    mock_command(dir.path(), "juju", "not: [valid");
    mock_command(dir.path(), "ssh", "");
    let _path = prepend_path(dir.path());

    heal::run("bootstrap").await.unwrap();

    assert!(calls(dir.path(), "ssh").is_empty());
}

#[tokio::test]
#[serial]
async fn running_an_unknown_healer_fails() {
    let err = heal::run("nonexistent").await.unwrap_err();
    assert!(matches!(err, HealError::UnknownHealer(_)));
}

#[derive(Debug, Default)]
struct SlowHealer {
    active: AtomicUsize,
    max_active: AtomicUsize,
    heals: AtomicUsize,
}

#[async_trait]
impl Healer for SlowHealer {
    async fn needs_heal(&self) -> Result<bool, HealError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(true)
    }

    async fn heal(&self) -> Result<(), HealError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.heals.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn same_healer_never_runs_concurrently() {
    let healer = Arc::new(SlowHealer::default());
    let mut registry = HealerRegistry::new();
    registry.register("slow", healer.clone());

    let (first, second) = tokio::join!(registry.run("slow"), registry.run("slow"));
    first.unwrap();
    second.unwrap();

    // both invocations ran, but never overlapped
    assert_eq!(healer.heals.load(Ordering::SeqCst), 2);
    assert_eq!(healer.max_active.load(Ordering::SeqCst), 1);
}
