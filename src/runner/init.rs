//! `Init` service variant: drives `systemctl` for a single supervised
//! unit. No unit file templating lives here, only invocation.

use async_trait::async_trait;

use super::{run_shell, CommandOutput, ComponentStatus, Enabler, InstallOptions, LogChunk, ServiceRunner};
use crate::errors::{Error, Result};

/// Naming convention for the systemd unit backing a given service.
pub fn unit_name(service: &str) -> String {
    format!("catchd-{service}.service")
}

/// `systemctl`-backed runner for `Init` services.
pub struct SystemdRunner;

impl SystemdRunner {
    /// Construct a new runner. Stateless — every call shells out fresh.
    pub fn new() -> Self {
        SystemdRunner
    }

    async fn systemctl(&self, args: &str) -> Result<CommandOutput> {
        run_shell(&format!("systemctl {args}")).await
    }
}

impl Default for SystemdRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRunner for SystemdRunner {
    async fn install(&self, service: &str, _opts: &InstallOptions) -> Result<()> {
        let unit = unit_name(service);
        let out = self.systemctl(&format!("daemon-reload && systemctl enable {unit}")).await?;
        if !out.success {
            return Err(Error::Runner(format!(
                "failed to install unit {unit}: {}",
                out.combined()
            )));
        }
        Ok(())
    }

    async fn start(&self, service: &str) -> Result<()> {
        let out = self.systemctl(&format!("start {}", unit_name(service))).await?;
        if !out.success {
            return Err(Error::Runner(out.combined()));
        }
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        let out = self.systemctl(&format!("stop {}", unit_name(service))).await?;
        if !out.success {
            return Err(Error::Runner(out.combined()));
        }
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        let out = self.systemctl(&format!("restart {}", unit_name(service))).await?;
        if !out.success {
            return Err(Error::Runner(out.combined()));
        }
        Ok(())
    }

    async fn logs(
        &self,
        service: &str,
        follow: bool,
        lines: Option<u32>,
    ) -> Result<tokio::sync::mpsc::Receiver<LogChunk>> {
        let unit = unit_name(service);
        let lines_arg = lines.map(|n| format!("-n {n}")).unwrap_or_default();
        let follow_arg = if follow { "-f" } else { "--no-pager" };
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        if follow {
            let cmd = format!("journalctl -u {unit} {follow_arg} {lines_arg}");
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                use tokio::process::Command;
                let mut child = match Command::new("sh")
                    .arg("-c")
                    .arg(&cmd)
                    .stdout(std::process::Stdio::piped())
                    .spawn()
                {
                    Ok(c) => c,
                    Err(_) => return,
                };
                if let Some(mut stdout) = child.stdout.take() {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stdout.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tx
                                    .send(LogChunk {
                                        bytes: buf[..n].to_vec(),
                                    })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                }
                let _ = child.wait().await;
            });
        } else {
            let out = run_shell(&format!("journalctl -u {unit} {follow_arg} {lines_arg}")).await?;
            let _ = tx
                .send(LogChunk {
                    bytes: out.combined().into_bytes(),
                })
                .await;
        }

        Ok(rx)
    }

    async fn status(&self, service: &str) -> Result<Vec<ComponentStatus>> {
        let unit = unit_name(service);
        let out = self
            .systemctl(&format!("show {unit} --property=ActiveState,SubState"))
            .await?;
        let mut active_state = String::from("unknown");
        for line in out.stdout.lines() {
            if let Some(v) = line.strip_prefix("ActiveState=") {
                active_state = v.to_string();
            }
        }
        Ok(vec![ComponentStatus {
            name: unit,
            healthy: active_state == "active",
            detail: Some(out.stdout.trim().to_string()),
            state: active_state,
        }])
    }

    async fn remove(&self, service: &str) -> Result<()> {
        let unit = unit_name(service);
        let out = self
            .systemctl(&format!("stop {unit}; systemctl disable {unit}"))
            .await?;
        // ErrNotInstalled is tolerated: a unit that was never installed
        // (or already removed) is not an error for Remove.
        if !out.success && !out.stderr.contains("not loaded") && !out.stderr.contains("does not exist")
        {
            return Err(Error::Runner(out.combined()));
        }
        let _ = self.systemctl("daemon-reload").await;
        Ok(())
    }
}

#[async_trait]
impl Enabler for SystemdRunner {
    async fn enable(&self, service: &str) -> Result<()> {
        let out = self.systemctl(&format!("enable {}", unit_name(service))).await?;
        if !out.success {
            return Err(Error::Runner(out.combined()));
        }
        Ok(())
    }

    async fn disable(&self, service: &str) -> Result<()> {
        let out = self.systemctl(&format!("disable {}", unit_name(service))).await?;
        if !out.success {
            return Err(Error::Runner(out.combined()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_name_is_namespaced() {
        assert_eq!(unit_name("foo"), "catchd-foo.service");
    }
}
