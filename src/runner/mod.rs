//! The `ServiceRunner` façade: the capability set the core drives to apply
//! a committed generation to the OS. Concrete init-system and compose CLIs
//! are treated as external collaborators, but a narrow, real
//! implementation of each variant is kept here (shelling out via
//! `tokio::process::Command`) since the daemon has nothing to drive
//! without at least one.

pub mod compose;
pub mod init;

use async_trait::async_trait;

use crate::errors::Result;

/// Status of one supervised component (a systemd unit, or a single
/// container within a compose project).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComponentStatus {
    /// Component name (unit name, or container name).
    pub name: String,
    /// Free-form state string (`active`, `running`, `exited`, ...).
    pub state: String,
    /// True if the component is considered healthy/up.
    pub healthy: bool,
    /// Extra detail (exit code, restart count, ...), when available.
    pub detail: Option<String>,
}

/// Options controlling `Install`.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Whether to pull images before bringing the project up (Compose
    /// only). `None` means "use whatever is cached".
    pub pull: Option<PullPolicy>,
    /// Environment file path to pass through, if any.
    pub env_file: Option<std::path::PathBuf>,
}

/// Compose pull policy, mirroring `docker compose --pull`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    /// Never attempt to pull.
    Never,
    /// Always pull before starting.
    Always,
}

/// Output of a `Logs` call.
#[derive(Debug, Clone)]
pub struct LogChunk {
    /// Raw combined stdout/stderr bytes for this chunk.
    pub bytes: Vec<u8>,
}

/// Lifecycle + logs + remove: the minimum capability every runner variant
/// must provide.
#[async_trait]
pub trait ServiceRunner: Send + Sync {
    /// Install (or reinstall) the unit/project definition and bring it up.
    async fn install(&self, service: &str, opts: &InstallOptions) -> Result<()>;
    /// Start the service.
    async fn start(&self, service: &str) -> Result<()>;
    /// Stop the service.
    async fn stop(&self, service: &str) -> Result<()>;
    /// Restart the service.
    async fn restart(&self, service: &str) -> Result<()>;
    /// Fetch logs. `follow` streams until the caller drops the returned
    /// receiver; otherwise at most `lines` historical lines are returned.
    async fn logs(
        &self,
        service: &str,
        follow: bool,
        lines: Option<u32>,
    ) -> Result<tokio::sync::mpsc::Receiver<LogChunk>>;
    /// Per-component status (one entry for Init, one per container for
    /// Compose).
    async fn status(&self, service: &str) -> Result<Vec<ComponentStatus>>;
    /// Remove the service's supervised definition. Must tolerate the
    /// underlying CLI reporting "not installed" rather than erroring.
    async fn remove(&self, service: &str) -> Result<()>;
}

/// Optional capability: enable/disable at boot. Not every runner variant
/// needs to support this (a bare compose project has no boot-enable
/// concept beyond the wrapping systemd unit, which the Compose runner
/// manages itself).
#[async_trait]
pub trait Enabler: Send + Sync {
    /// Enable the service to start at boot.
    async fn enable(&self, service: &str) -> Result<()>;
    /// Disable boot-start.
    async fn disable(&self, service: &str) -> Result<()>;
}

/// Run a shell command and capture combined output: build one shell
/// string, execute under `sh -c`, and report success/failure plus
/// stdout/stderr rather than propagating a raw `ExitStatus`.
pub(crate) async fn run_shell(cmd: &str) -> Result<CommandOutput> {
    use tokio::process::Command;

    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(|e| crate::errors::Error::Runner(format!("failed to spawn '{cmd}': {e}")))?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Captured result of a shelled-out command.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr concatenated, for error messages and log display.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}
