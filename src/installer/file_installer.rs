//! The File Installer.
//!
//! Receives a payload stream for one service, classifies it, writes
//! versioned artifacts under the service's bin/env directories, lazily
//! configures networking, and stages (or, unless `stage_only`, hands off
//! to the Generation Installer to commit) the result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;

use crate::catalog::model::{ArtifactName, Service, ServiceKind};
use crate::catalog::store::CatalogStore;
use crate::config::ServerConfig;
use crate::errors::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::installer::errors::InstallerError;
use crate::installer::kind::{Kind, KindDetector};
use crate::installer::network::{Family, NetworkConfigurator, NetworkOverrides};
use crate::installer::rate::{Progress, RateEstimator};
use crate::runner::init::SystemdRunner;
use crate::runner::{Enabler, PullPolicy, ServiceRunner};

/// A systemd timer request, carried by the `cron` dispatcher verb through
/// to the installer.
#[derive(Debug, Clone)]
pub struct TimerCfg {
    /// Pre-converted `OnCalendar=` value.
    pub on_calendar: String,
}

/// Everything a single upload needs, gathered by the dispatcher before the
/// first byte arrives.
#[derive(Debug, Clone)]
pub struct FileInstallerCfg {
    /// Target service name.
    pub service_name: String,
    /// Unix user the service should run as.
    pub user: String,
    /// Octal file mode override for a written `EnvFile` artifact, if any.
    pub env_file_mode: Option<u32>,
    /// Extra process arguments recorded alongside the binary/script unit.
    pub args: Vec<String>,
    /// Requested network address families.
    pub network: Vec<Family>,
    /// Stage only; do not hand off to the Generation Installer.
    pub stage_only: bool,
    /// Skip binary/script/compose detection entirely: only (re)configure
    /// the network and/or systemd unit for an already-installed service.
    pub no_binary: bool,
    /// `host:container` port mappings to rewrite into a compose payload.
    pub publish_ports: Vec<String>,
    /// Compose pull policy for this install, if requested.
    pub pull: Option<PullPolicy>,
    /// Name the payload was uploaded under (used for TypeScript/Python
    /// wrapper generation and log messages).
    pub payload_name: String,
    /// Timer to attach to the generated systemd unit, if this is a `cron`
    /// install.
    pub timer: Option<TimerCfg>,
}

/// What happened when the upload closed successfully.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    /// Staged only; nothing was committed.
    Staged,
    /// Handed off to the Generation Installer, which committed this
    /// generation number.
    Committed(u64),
}

/// A single upload in progress.
pub struct FileInstaller {
    cfg: FileInstallerCfg,
    store: CatalogStore,
    events: EventBus,
    server_cfg: Arc<ServerConfig>,
    detector: Arc<dyn KindDetector>,
    init: Arc<SystemdRunner>,
    scratch_dir: PathBuf,
    scratch_path: PathBuf,
    file: Option<tokio::fs::File>,
    rate: RateEstimator,
    failed: Option<String>,
    version: String,
}

impl FileInstaller {
    /// Begin a new upload: create the per-upload scratch directory under
    /// the service bin directory.
    pub async fn create(
        cfg: FileInstallerCfg,
        store: CatalogStore,
        events: EventBus,
        server_cfg: Arc<ServerConfig>,
        detector: Arc<dyn KindDetector>,
        init: Arc<SystemdRunner>,
    ) -> Result<Self> {
        let bin_dir = server_cfg.service_bin_dir(&cfg.service_name);
        tokio::fs::create_dir_all(&bin_dir).await?;

        let scratch_dir = bin_dir.join(format!(".upload-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch_dir).await?;
        let scratch_path = scratch_dir.join(&cfg.payload_name);
        let file = tokio::fs::File::create(&scratch_path).await?;

        let version = version_tag();

        Ok(FileInstaller {
            cfg,
            store,
            events,
            server_cfg,
            detector,
            init,
            scratch_dir,
            scratch_path,
            file: Some(file),
            rate: RateEstimator::new(),
            failed: None,
            version,
        })
    }

    /// Append `buf` to the scratch file and sample the rate estimator.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Internal("write after close".into()))?;
        file.write_all(buf).await?;
        self.rate.sample(buf.len(), Instant::now());
        Ok(())
    }

    /// Current progress snapshot, surfaced over the exec session's side
    /// channel rather than the Event Bus.
    pub fn progress(&self) -> Progress {
        Progress {
            received_bytes: self.rate.total_bytes(),
            rate_bytes_per_sec: self.rate.rate_bytes_per_sec(),
        }
    }

    /// Mark this upload as failed. `Close` will then return an error
    /// without installing, and the scratch directory is removed.
    pub async fn fail(&mut self, reason: impl Into<String>) {
        self.failed = Some(reason.into());
        self.file = None;
        let _ = tokio::fs::remove_dir_all(&self.scratch_dir).await;
    }

    async fn cleanup_scratch(&self) {
        let _ = tokio::fs::remove_dir_all(&self.scratch_dir).await;
    }

    /// Finish the upload: detect, install, stage, and (unless
    /// `stage_only`) hand off to `generation` to commit.
    pub async fn close(
        mut self,
        generation: &crate::installer::generation::GenerationInstaller,
    ) -> Result<CloseOutcome> {
        if let Some(reason) = self.failed.take() {
            self.cleanup_scratch().await;
            return Err(InstallerError::Failed(reason).into());
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let result = self.close_inner(generation).await;
        self.cleanup_scratch().await;
        result
    }

    async fn close_inner(
        &self,
        generation: &crate::installer::generation::GenerationInstaller,
    ) -> Result<CloseOutcome> {
        let service = self.cfg.service_name.clone();

        if self.cfg.no_binary {
            self.configure_network_if_requested(&service).await?;
            return self.finish(generation, &service).await;
        }

        let mut kind = self.detector.detect(&self.scratch_path).await?;
        if matches!(kind, Kind::Zstd) {
            self.decompress_in_place().await?;
            kind = self.detector.detect(&self.scratch_path).await?;
            if matches!(kind, Kind::Zstd) {
                return Err(InstallerError::UnsupportedKind("nested zstd".into()).into());
            }
        }

        if self.cfg.pull.is_some() && !kind.permits_pull() {
            return Err(InstallerError::PullNotPermitted {
                kind: kind.to_string(),
            }
            .into());
        }

        let new_service_kind = match kind {
            Kind::Binary | Kind::Script => ServiceKind::Init,
            Kind::ComposeFile | Kind::TypeScript | Kind::Python => ServiceKind::Compose,
            Kind::Zstd => unreachable!("re-detected above"),
        };

        self.check_kind_transition(&service, new_service_kind)
            .await?;

        match kind {
            Kind::Binary | Kind::Script => self.install_binary_or_script(&service, kind).await?,
            Kind::ComposeFile => self.install_compose_file(&service).await?,
            Kind::TypeScript | Kind::Python => {
                self.install_wrapped_script(&service, kind).await?
            }
            Kind::Zstd => unreachable!(),
        }

        self.configure_network_if_requested(&service).await?;

        self.store
            .mutate_service(
                &service,
                || Service::new(&service, &self.cfg.user, new_service_kind),
                |svc| {
                    svc.kind = new_service_kind;
                    svc.user = self.cfg.user.clone();
                    Ok(())
                },
            )
            .await?;

        self.finish(generation, &service).await
    }

    async fn finish(
        &self,
        generation: &crate::installer::generation::GenerationInstaller,
        service: &str,
    ) -> Result<CloseOutcome> {
        if self.cfg.stage_only {
            self.events
                .publish(Event::new(service, EventKind::ServiceConfigStaged))
                .await;
            Ok(CloseOutcome::Staged)
        } else {
            let gen = generation.install_gen(service, 0).await?;
            Ok(CloseOutcome::Committed(gen))
        }
    }

    async fn check_kind_transition(&self, service: &str, new_kind: ServiceKind) -> Result<()> {
        let snapshot = self.store.get().await;
        let Some(existing) = snapshot.services.get(service) else {
            return Ok(());
        };
        if existing.latest_generation == 0 {
            return Ok(());
        }
        let upgrade_exempt = existing.kind == ServiceKind::Init && new_kind == ServiceKind::Compose;
        if existing.kind != new_kind && !upgrade_exempt {
            return Err(Error::KindDowngrade {
                name: service.to_string(),
                from: existing.kind,
                to: new_kind,
            });
        }
        if upgrade_exempt && existing.kind != new_kind {
            // The prior init unit is about to be superseded by a compose
            // project; pruning alone would leave it installed-but-orphaned,
            // so stop and disable it explicitly rather than rely on the
            // next generation's reap pass to make it inert.
            if let Err(e) = self.init.stop(service).await {
                log::warn!("stopping prior init unit for '{service}' during compose upgrade: {e}");
            }
            if let Err(e) = self.init.disable(service).await {
                log::warn!("disabling prior init unit for '{service}' during compose upgrade: {e}");
            }
        }
        Ok(())
    }

    async fn decompress_in_place(&self) -> Result<()> {
        let compressed = tokio::fs::read(&self.scratch_path).await?;
        let decompressed = tokio::task::spawn_blocking(move || zstd::decode_all(&compressed[..]))
            .await
            .map_err(|e| Error::Internal(format!("zstd decode task panicked: {e}")))??;
        tokio::fs::write(&self.scratch_path, decompressed).await?;
        Ok(())
    }

    async fn install_binary_or_script(&self, service: &str, kind: Kind) -> Result<()> {
        let ext = if matches!(kind, Kind::Script) { "" } else { "" };
        let dest = self
            .server_cfg
            .service_bin_dir(service)
            .join(format!("{service}-{}{ext}", self.version));
        tokio::fs::create_dir_all(self.server_cfg.service_bin_dir(service)).await?;
        tokio::fs::copy(&self.scratch_path, &dest).await?;
        set_executable(&dest).await?;

        let unit_path = self.ensure_systemd_unit(service, &dest).await?;

        let artifact_name = if matches!(kind, Kind::Script) {
            ArtifactName::Script
        } else {
            ArtifactName::Binary
        };

        self.store
            .mutate_service(
                service,
                || Service::new(service, &self.cfg.user, ServiceKind::Init),
                |svc| {
                    svc.artifact_mut(artifact_name)
                        .refs
                        .insert("staged".into(), dest.to_string_lossy().into_owned());
                    svc.artifact_mut(ArtifactName::InitUnit)
                        .refs
                        .insert("staged".into(), unit_path.to_string_lossy().into_owned());
                    Ok(())
                },
            )
            .await?;

        if let Some(timer) = &self.cfg.timer {
            let timer_path = self.write_systemd_timer(service, timer).await?;
            self.store
                .mutate_service(
                    service,
                    || Service::new(service, &self.cfg.user, ServiceKind::Init),
                    |svc| {
                        svc.artifact_mut(ArtifactName::InitTimer)
                            .refs
                            .insert("staged".into(), timer_path.to_string_lossy().into_owned());
                        Ok(())
                    },
                )
                .await?;
        }

        Ok(())
    }

    async fn install_compose_file(&self, service: &str) -> Result<()> {
        let mut yaml = tokio::fs::read_to_string(&self.scratch_path).await?;
        if !self.cfg.publish_ports.is_empty() {
            yaml = crate::installer::compose_file::rewrite_ports(
                &yaml,
                service,
                &self.cfg.publish_ports,
            )?;
        }

        let dest = self
            .server_cfg
            .service_bin_dir(service)
            .join(format!("compose.{}.yml", self.version));
        tokio::fs::create_dir_all(self.server_cfg.service_bin_dir(service)).await?;
        tokio::fs::write(&dest, yaml).await?;

        self.store
            .mutate_service(
                service,
                || Service::new(service, &self.cfg.user, ServiceKind::Compose),
                |svc| {
                    svc.artifact_mut(ArtifactName::ComposeFile)
                        .refs
                        .insert("staged".into(), dest.to_string_lossy().into_owned());
                    Ok(())
                },
            )
            .await?;
        Ok(())
    }

    async fn install_wrapped_script(&self, service: &str, kind: Kind) -> Result<()> {
        let ext = match kind {
            Kind::TypeScript => "ts",
            Kind::Python => "py",
            _ => unreachable!(),
        };
        let script_name = format!("{service}-{}.{ext}", self.version);
        let script_dest = self.server_cfg.service_bin_dir(service).join(&script_name);
        tokio::fs::create_dir_all(self.server_cfg.service_bin_dir(service)).await?;
        tokio::fs::copy(&self.scratch_path, &script_dest).await?;

        let wrapper_yaml = crate::installer::compose_file::synth_wrapper_compose(
            service,
            kind,
            &script_dest.to_string_lossy(),
            &script_name,
        )?;
        let compose_dest = self
            .server_cfg
            .service_bin_dir(service)
            .join(format!("compose.{}.yml", self.version));
        tokio::fs::write(&compose_dest, wrapper_yaml).await?;

        let script_artifact = if matches!(kind, Kind::TypeScript) {
            ArtifactName::TypeScriptFile
        } else {
            ArtifactName::PythonFile
        };

        self.store
            .mutate_service(
                service,
                || Service::new(service, &self.cfg.user, ServiceKind::Compose),
                |svc| {
                    svc.artifact_mut(script_artifact)
                        .refs
                        .insert("staged".into(), script_dest.to_string_lossy().into_owned());
                    svc.artifact_mut(ArtifactName::ComposeFile).refs.insert(
                        "staged".into(),
                        compose_dest.to_string_lossy().into_owned(),
                    );
                    Ok(())
                },
            )
            .await?;
        Ok(())
    }

    async fn configure_network_if_requested(&self, service: &str) -> Result<()> {
        if self.cfg.network.is_empty() {
            return Ok(());
        }

        let snapshot = self.store.get().await;
        let already_configured = snapshot
            .services
            .get(service)
            .map(|s| s.svc_network.is_some() || s.macvlan.is_some() || s.tailscale_net.is_some())
            .unwrap_or(false);
        if already_configured {
            return Ok(());
        }

        let configurator = NetworkConfigurator::new(&self.server_cfg);
        let (artifacts, svc_net, macvlan, ts_net) = configurator
            .configure(
                service,
                &self.cfg.network,
                &snapshot,
                &NetworkOverrides::default(),
            )
            .await?;

        let run_dir = self.server_cfg.service_run_dir(service);
        tokio::fs::create_dir_all(&run_dir).await?;

        let mut resolv_path = None;
        if let Some(resolv) = &artifacts.resolv_conf {
            let path = run_dir.join("resolv.conf");
            tokio::fs::write(&path, resolv).await?;
            resolv_path = Some(path);
        }

        let network_yaml_path = self
            .server_cfg
            .service_bin_dir(service)
            .join(format!("network.{}.compose.yml", self.version));
        tokio::fs::create_dir_all(self.server_cfg.service_bin_dir(service)).await?;
        tokio::fs::write(&network_yaml_path, &artifacts.compose_network_yaml).await?;

        self.store
            .mutate_service(
                service,
                || Service::new(service, &self.cfg.user, ServiceKind::Init),
                |svc| {
                    if let Some(net) = svc_net {
                        svc.svc_network = Some(net);
                    }
                    if let Some(mv) = macvlan {
                        svc.macvlan = Some(mv);
                    }
                    if let Some(ts) = ts_net {
                        svc.tailscale_net = Some(ts);
                    }
                    if let Some(resolv_path) = &resolv_path {
                        svc.artifact_mut(ArtifactName::NetNSResolv).refs.insert(
                            "staged".into(),
                            resolv_path.to_string_lossy().into_owned(),
                        );
                    }
                    svc.artifact_mut(ArtifactName::ComposeNetwork).refs.insert(
                        "staged".into(),
                        network_yaml_path.to_string_lossy().into_owned(),
                    );
                    Ok(())
                },
            )
            .await?;
        Ok(())
    }

    async fn ensure_systemd_unit(&self, service: &str, exec_path: &std::path::Path) -> Result<PathBuf> {
        let snapshot = self.store.get().await;
        if let Some(existing) = snapshot
            .services
            .get(service)
            .and_then(|s| s.artifacts.get(&ArtifactName::InitUnit))
            .and_then(|a| a.get("latest").or_else(|| a.get("staged")))
        {
            return Ok(PathBuf::from(existing));
        }

        let unit = format!(
            "[Unit]\nDescription=catchd managed service {service}\n\n\
             [Service]\nUser={user}\nExecStart={exec} {args}\nRestart=on-failure\n\n\
             [Install]\nWantedBy=multi-user.target\n",
            user = self.cfg.user,
            exec = exec_path.display(),
            args = self.cfg.args.join(" "),
        );
        let path = self
            .server_cfg
            .service_bin_dir(service)
            .join(format!("{service}.service"));
        tokio::fs::write(&path, unit).await?;
        Ok(path)
    }

    async fn write_systemd_timer(&self, service: &str, timer: &TimerCfg) -> Result<PathBuf> {
        let unit = format!(
            "[Unit]\nDescription=catchd timer for {service}\n\n\
             [Timer]\nOnCalendar={}\nPersistent=true\n\n\
             [Install]\nWantedBy=timers.target\n",
            timer.on_calendar
        );
        let path = self
            .server_cfg
            .service_bin_dir(service)
            .join(format!("{service}.timer"));
        tokio::fs::write(&path, unit).await?;
        Ok(path)
    }
}

#[cfg(unix)]
async fn set_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

/// Monotonically sortable version tag, `YYYYMMDDhhmmss`.
fn version_tag() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::kind::DefaultKindDetector;

    fn test_cfg(service: &str) -> FileInstallerCfg {
        FileInstallerCfg {
            service_name: service.to_string(),
            user: "root".to_string(),
            env_file_mode: None,
            args: Vec::new(),
            network: Vec::new(),
            stage_only: true,
            no_binary: false,
            publish_ports: Vec::new(),
            pull: None,
            payload_name: "payload".to_string(),
            timer: None,
        }
    }

    async fn harness(dir: &std::path::Path) -> (CatalogStore, EventBus, Arc<ServerConfig>) {
        let cfg = Arc::new(ServerConfig {
            data_dir: dir.to_path_buf(),
            ..ServerConfig::from_env()
        });
        let store = CatalogStore::open(cfg.catalog_path()).await.unwrap();
        (store, EventBus::new(), cfg)
    }

    #[tokio::test]
    async fn stages_a_script_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events, cfg) = harness(dir.path()).await;
        let generation = crate::installer::generation::GenerationInstaller::new(
            store.clone(),
            events.clone(),
            cfg.clone(),
            Arc::new(crate::runner::compose::ComposeRunner::new()),
            Arc::new(crate::runner::init::SystemdRunner::new()),
        );

        let mut installer = FileInstaller::create(
            test_cfg("svc-a"),
            store.clone(),
            events,
            cfg,
            Arc::new(DefaultKindDetector),
        )
        .await
        .unwrap();
        installer.write(b"#!/bin/sh\necho hi\n").await.unwrap();
        let outcome = installer.close(&generation).await.unwrap();
        assert!(matches!(outcome, CloseOutcome::Staged));

        let snap = store.get().await;
        let svc = &snap.services["svc-a"];
        assert!(svc.artifacts[&ArtifactName::Script].get("staged").is_some());
    }

    #[tokio::test]
    async fn rejects_pull_for_binary_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events, cfg) = harness(dir.path()).await;
        let generation = crate::installer::generation::GenerationInstaller::new(
            store.clone(),
            events.clone(),
            cfg.clone(),
            Arc::new(crate::runner::compose::ComposeRunner::new()),
            Arc::new(crate::runner::init::SystemdRunner::new()),
        );

        let mut bad_cfg = test_cfg("svc-b");
        bad_cfg.pull = Some(PullPolicy::Always);
        let mut installer = FileInstaller::create(
            bad_cfg,
            store,
            events,
            cfg,
            Arc::new(DefaultKindDetector),
        )
        .await
        .unwrap();
        installer.write(b"\x7fELFjunk").await.unwrap();
        let err = installer.close(&generation).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Installer(InstallerError::PullNotPermitted { .. })
        ));
    }
}
