//! Component H: the TTY Exec Dispatcher.
//!
//! Parses the first token of an exec session's `args` and routes to the
//! Installer/Registry/Runner collaborators, the same way the registry's
//! `RegistryHandler` routes `/v2/...` paths by scanning path segments —
//! here the "path" is a verb plus sub-arguments instead of a URL.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::catalog::model::{ArtifactName, ServiceKind, REF_LATEST, REF_STAGED};
use crate::catalog::store::CatalogStore;
use crate::config::ServerConfig;
use crate::errors::{Error, Result};
use crate::events::{EventBus, Filter};
use crate::installer::cron::cron_to_on_calendar;
use crate::installer::env_file::{self, Assignment};
use crate::installer::file_installer::{CloseOutcome, FileInstaller, FileInstallerCfg, TimerCfg};
use crate::installer::generation::GenerationInstaller;
use crate::installer::kind::{DefaultKindDetector, KindDetector};
use crate::installer::network::Family;
use crate::rpc::authorize::PeerIdentity;
use crate::rpc::exec::ExecChannel;
use crate::runner::compose::ComposeRunner;
use crate::runner::init::SystemdRunner;
use crate::runner::{Enabler, InstallOptions, PullPolicy, ServiceRunner};
use crate::tailnet::{track_for_version, TailnetControlPlane, TailnetCredential};
use crate::volumes;

/// Collaborators the dispatcher needs to route verbs, assembled once at
/// startup by `main` and shared across every exec session.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: CatalogStore,
    pub events: EventBus,
    pub cfg: Arc<ServerConfig>,
    pub compose: Arc<ComposeRunner>,
    pub init: Arc<SystemdRunner>,
    pub generation: GenerationInstaller,
    pub detector: Arc<dyn KindDetector>,
    pub tailnet: Arc<dyn TailnetControlPlane>,
    /// The server's own ACL tags, used by the built-in authorization
    /// policy and by `tailscale update`'s sidecar re-registration.
    pub server_tags: Vec<String>,
    /// Path to the workspace `tailscale.key` secret.
    pub tailnet_key_path: std::path::PathBuf,
}

impl Collaborators {
    fn detector(&self) -> Arc<dyn KindDetector> {
        self.detector.clone()
    }
}

/// A single exec session's request context, parsed from the first
/// `/rpc/exec` frame.
pub struct ExecSession {
    pub service: String,
    pub run_as_user: String,
    pub args: Vec<String>,
    pub payload_name: Option<String>,
    pub tty: bool,
    pub term: Option<String>,
    pub rows: u16,
    pub cols: u16,
    pub peer: PeerIdentity,
    pub remote_ip: IpAddr,
}

async fn write_line(chan: &ExecChannel, line: impl AsRef<str>) -> Result<()> {
    let mut out = line.as_ref().as_bytes().to_vec();
    out.push(b'\n');
    chan.stdout_tx
        .send(out)
        .await
        .map_err(|_| Error::Transient("exec session stdout closed".into()))
}

/// Collect every stdin chunk until the client signals `stdin-close` or
/// drops the connection. Used by the payload-carrying verbs, which bypass
/// the pty input side entirely (spec's own design note on binary mangling).
async fn drain_stdin(chan: &mut ExecChannel) -> Vec<u8> {
    let mut buf = Vec::new();
    while let Some(chunk) = chan.stdin_rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
    buf
}

/// Run one exec session to completion, returning the verb's exit code.
pub async fn run(collaborators: Arc<Collaborators>, session: ExecSession, mut chan: ExecChannel) -> Result<i32> {
    let verb = session.args.first().cloned().unwrap_or_default();
    let rest = &session.args[session.args.len().min(1)..];

    match verb.as_str() {
        "run" => verb_run(&collaborators, &session, rest, &mut chan, false).await,
        "stage" => verb_stage(&collaborators, &session, rest, &mut chan).await,
        "copy" => verb_copy(&collaborators, &session, rest, &mut chan).await,
        "env" => verb_env(&collaborators, &session, rest, &mut chan).await,
        "start" => verb_lifecycle(&collaborators, &session, &chan, Lifecycle::Start).await,
        "stop" => verb_lifecycle(&collaborators, &session, &chan, Lifecycle::Stop).await,
        "restart" => verb_lifecycle(&collaborators, &session, &chan, Lifecycle::Restart).await,
        "enable" => verb_enable(&collaborators, &session, &chan, true).await,
        "disable" => verb_enable(&collaborators, &session, &chan, false).await,
        "rollback" => verb_rollback(&collaborators, &session, &chan).await,
        "status" => verb_status(&collaborators, &session, rest, &chan).await,
        "logs" => verb_logs(&collaborators, &session, rest, &mut chan).await,
        "edit" => verb_edit(&collaborators, &session, rest, &mut chan).await,
        "remove" => verb_remove(&collaborators, &session, &chan).await,
        "mount" => verb_mount(&collaborators, rest, &chan).await,
        "umount" => verb_umount(&collaborators, rest, &chan).await,
        "tailscale" | "ts" => verb_tailscale(&collaborators, &session, rest, &mut chan).await,
        "cron" => verb_cron(&collaborators, &session, rest, &mut chan).await,
        "events" => verb_events(&collaborators, &session, rest, &mut chan).await,
        "version" => verb_version(rest, &chan).await,
        "" => {
            write_line(&chan, "no verb given").await?;
            Ok(1)
        }
        other => {
            write_line(&chan, format!("unknown verb: {other}")).await?;
            Ok(1)
        }
    }
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn repeated_flag_values(args: &[String], name: &str) -> Vec<String> {
    args.iter()
        .zip(args.iter().skip(1))
        .filter(|(a, _)| *a == name)
        .map(|(_, v)| v.clone())
        .collect()
}

async fn install_cfg_from_args(
    session: &ExecSession,
    args: &[String],
    stage_only: bool,
    no_binary: bool,
    timer: Option<TimerCfg>,
) -> Result<FileInstallerCfg> {
    let payload_name = session
        .payload_name
        .clone()
        .unwrap_or_else(|| "payload".to_string());

    let user = flag_value(args, "--user")
        .map(str::to_string)
        .unwrap_or_else(|| session.run_as_user.clone());

    let mut network = Vec::new();
    if let Some(raw) = flag_value(args, "--network") {
        for token in raw.split(',') {
            network.push(token.parse::<Family>()?);
        }
    }

    let pull = match flag_value(args, "--pull") {
        Some("always") => Some(PullPolicy::Always),
        Some("never") => Some(PullPolicy::Never),
        Some(other) => return Err(Error::InvalidInput(format!("unknown --pull value '{other}'"))),
        None => None,
    };

    Ok(FileInstallerCfg {
        service_name: session.service.clone(),
        user,
        env_file_mode: None,
        args: args.to_vec(),
        network,
        stage_only,
        no_binary,
        publish_ports: repeated_flag_values(args, "--publish"),
        pull,
        payload_name,
        timer,
    })
}

async fn stream_payload_into_installer(
    chan: &mut ExecChannel,
    mut installer: FileInstaller,
) -> Result<FileInstaller> {
    while let Some(chunk) = chan.stdin_rx.recv().await {
        if let Err(e) = installer.write(&chunk).await {
            installer.fail(e.to_string()).await;
            return Err(e);
        }
    }
    Ok(installer)
}

async fn verb_run(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
    stage_only: bool,
) -> Result<i32> {
    let no_binary = has_flag(args, "--no-binary");
    let cfg = install_cfg_from_args(session, args, stage_only, no_binary, None).await?;
    let installer = FileInstaller::create(
        cfg,
        collaborators.catalog.clone(),
        collaborators.events.clone(),
        collaborators.cfg.clone(),
        collaborators.detector(),
        collaborators.init.clone(),
    )
    .await?;
    let installer = stream_payload_into_installer(chan, installer).await?;
    match installer.close(&collaborators.generation).await? {
        CloseOutcome::Staged => write_line(chan, "staged").await?,
        CloseOutcome::Committed(gen) => write_line(chan, format!("committed generation {gen}")).await?,
    }
    Ok(0)
}

async fn verb_stage(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    match args.first().map(String::as_str) {
        None | Some("commit") => {
            let sub_args = if args.first().map(String::as_str) == Some("commit") {
                &args[1..]
            } else {
                args
            };
            if args.first().map(String::as_str) == Some("commit") {
                let gen = collaborators.generation.install_gen(&session.service, 0).await?;
                write_line(chan, format!("committed generation {gen}")).await?;
                Ok(0)
            } else {
                verb_run(collaborators, session, sub_args, chan, true).await
            }
        }
        Some("show") => {
            let snapshot = collaborators.catalog.get().await;
            let svc = snapshot
                .services
                .get(&session.service)
                .ok_or_else(|| Error::ServiceNotFound {
                    name: session.service.clone(),
                })?;
            let staged: BTreeMap<_, _> = svc
                .artifacts
                .iter()
                .filter_map(|(name, artifact)| artifact.get(REF_STAGED).map(|p| (format!("{name:?}"), p.to_string())))
                .collect();
            write_line(chan, serde_json::to_string_pretty(&staged).unwrap()).await?;
            Ok(0)
        }
        Some("clear") => {
            // Reserved: no staged-ref clearing mechanism exists yet beyond
            // letting the next staged write overwrite it.
            write_line(chan, "stage clear is reserved").await?;
            Ok(1)
        }
        Some(other) => {
            write_line(chan, format!("unknown stage subcommand: {other}")).await?;
            Ok(1)
        }
    }
}

/// Validate that `candidate` resolves to a path under the service's data
/// directory, rejecting `..` escapes.
fn validate_data_subtree(cfg: &ServerConfig, service: &str, candidate: &str) -> Result<std::path::PathBuf> {
    if candidate.contains("..") {
        return Err(Error::InvalidInput(format!("path '{candidate}' may not contain '..'")));
    }
    let trimmed = candidate.trim_start_matches('/');
    Ok(cfg.service_data_dir(service).join(trimmed))
}

/// `YEETCOPY1 <kind> <base64-name>` header, read as the first line of the
/// copy payload stream.
struct CopyHeader {
    kind: String,
    name: String,
}

fn parse_copy_header(buf: &[u8]) -> Option<(CopyHeader, &[u8])> {
    let newline = buf.iter().position(|b| *b == b'\n')?;
    let line = std::str::from_utf8(&buf[..newline]).ok()?;
    let mut parts = line.split_whitespace();
    if parts.next()? != "YEETCOPY1" {
        return None;
    }
    let kind = parts.next()?.to_string();
    let name_b64 = parts.next()?;
    use base64::Engine;
    let name_bytes = base64::engine::general_purpose::STANDARD.decode(name_b64).ok()?;
    let name = String::from_utf8(name_bytes).ok()?;
    Some((CopyHeader { kind, name }, &buf[newline + 1..]))
}

async fn verb_copy(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    let dest_arg = args
        .first()
        .ok_or_else(|| Error::InvalidInput("copy requires a destination path".into()))?;
    let dest = validate_data_subtree(&collaborators.cfg, &session.service, dest_arg)?;

    let payload = drain_stdin(chan).await;

    match parse_copy_header(&payload) {
        Some((header, rest)) if header.kind == "gzip" => {
            let decoded = crate::compression::decode_request_body(Some("gzip"), bytes::Bytes::copy_from_slice(rest))?;
            write_file_creating_parents(&dest.join(&header.name), &decoded).await?;
            write_line(chan, format!("copied {} (gzip)", header.name)).await?;
        }
        Some((header, rest)) if header.kind == "archive" => {
            tokio::fs::create_dir_all(&dest).await?;
            let mut archive = tar::Archive::new(rest);
            archive
                .unpack(&dest)
                .map_err(|e| Error::InvalidInput(format!("bad tar archive: {e}")))?;
            write_line(chan, format!("extracted archive into {}", dest.display())).await?;
            let _ = header.name;
        }
        Some((header, _)) => {
            return Err(Error::InvalidInput(format!("unknown copy kind '{}'", header.kind)));
        }
        None => {
            write_file_creating_parents(&dest, &payload).await?;
            write_line(chan, format!("copied {} bytes", payload.len())).await?;
        }
    }
    Ok(0)
}

async fn write_file_creating_parents(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn verb_env(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    let snapshot = collaborators.catalog.get().await;
    let path = snapshot
        .services
        .get(&session.service)
        .and_then(|s| s.artifacts.get(&ArtifactName::EnvFile))
        .and_then(|a| a.get(REF_LATEST).or_else(|| a.get(REF_STAGED)))
        .map(std::path::PathBuf::from);

    match args.first().map(String::as_str) {
        Some("show") => {
            let content = match &path {
                Some(p) => tokio::fs::read_to_string(p).await.unwrap_or_default(),
                None => String::new(),
            };
            write_line(chan, content.trim_end()).await?;
            Ok(0)
        }
        Some("copy") => {
            let content = match &path {
                Some(p) => tokio::fs::read_to_string(p).await.unwrap_or_default(),
                None => String::new(),
            };
            chan.stdout_tx
                .send(content.into_bytes())
                .await
                .map_err(|_| Error::Transient("exec session stdout closed".into()))?;
            Ok(0)
        }
        Some("edit") => {
            let payload = drain_stdin(chan).await;
            let new_content = String::from_utf8(payload)
                .map_err(|e| Error::InvalidInput(format!("env edit payload is not utf-8: {e}")))?;
            write_env_file(collaborators, &session.service, &new_content).await?;
            write_line(chan, "env replaced").await?;
            Ok(0)
        }
        Some("set") => {
            let assigns: Result<Vec<Assignment>> = args[1..].iter().map(|t| Assignment::parse(t)).collect();
            let assigns = assigns?;
            let content = match &path {
                Some(p) => tokio::fs::read_to_string(p).await.unwrap_or_default(),
                None => String::new(),
            };
            let updated = env_file::apply(&content, &assigns);
            write_env_file(collaborators, &session.service, &updated).await?;
            write_line(chan, "env updated").await?;
            Ok(0)
        }
        _ => {
            write_line(chan, "env requires a subcommand: show|edit|copy|set").await?;
            Ok(1)
        }
    }
}

async fn write_env_file(collaborators: &Collaborators, service: &str, content: &str) -> Result<()> {
    let dir = collaborators.cfg.service_env_dir(service);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("env-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, content.as_bytes()).await?;

    collaborators
        .catalog
        .mutate_service(
            service,
            || unreachable!("env edit requires an existing service"),
            |svc| {
                svc.artifact_mut(ArtifactName::EnvFile)
                    .refs
                    .insert(REF_STAGED.into(), path.to_string_lossy().into_owned());
                Ok(())
            },
        )
        .await?;
    Ok(())
}

enum Lifecycle {
    Start,
    Stop,
    Restart,
}

async fn runner_for(collaborators: &Collaborators, service: &str) -> Result<Arc<dyn ServiceRunner>> {
    let snapshot = collaborators.catalog.get().await;
    let kind = snapshot
        .services
        .get(service)
        .map(|s| s.kind)
        .ok_or_else(|| Error::ServiceNotFound {
            name: service.to_string(),
        })?;
    Ok(match kind {
        ServiceKind::Init => collaborators.init.clone() as Arc<dyn ServiceRunner>,
        ServiceKind::Compose => collaborators.compose.clone() as Arc<dyn ServiceRunner>,
    })
}

async fn verb_lifecycle(
    collaborators: &Collaborators,
    session: &ExecSession,
    chan: &ExecChannel,
    action: Lifecycle,
) -> Result<i32> {
    let runner = runner_for(collaborators, &session.service).await?;
    match action {
        Lifecycle::Start => runner.start(&session.service).await?,
        Lifecycle::Stop => runner.stop(&session.service).await?,
        Lifecycle::Restart => runner.restart(&session.service).await?,
    }
    collaborators
        .events
        .publish(crate::events::Event::new(
            &session.service,
            crate::events::EventKind::ServiceStatusChanged { detail: None },
        ))
        .await;
    write_line(chan, "ok").await?;
    Ok(0)
}

async fn verb_enable(
    collaborators: &Collaborators,
    session: &ExecSession,
    chan: &ExecChannel,
    enable: bool,
) -> Result<i32> {
    let snapshot = collaborators.catalog.get().await;
    let kind = snapshot
        .services
        .get(&session.service)
        .map(|s| s.kind)
        .ok_or_else(|| Error::ServiceNotFound {
            name: session.service.clone(),
        })?;
    match kind {
        ServiceKind::Init => {
            if enable {
                collaborators.init.enable(&session.service).await?;
            } else {
                collaborators.init.disable(&session.service).await?;
            }
            write_line(chan, "ok").await?;
            Ok(0)
        }
        ServiceKind::Compose => {
            write_line(chan, "enable/disable is not meaningful for Compose services").await?;
            Ok(1)
        }
    }
}

async fn verb_rollback(collaborators: &Collaborators, session: &ExecSession, chan: &ExecChannel) -> Result<i32> {
    let gen = collaborators.generation.rollback(&session.service).await?;
    write_line(chan, format!("rolled back to generation {gen}")).await?;
    Ok(0)
}

async fn verb_status(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &ExecChannel,
) -> Result<i32> {
    let runner = runner_for(collaborators, &session.service).await?;
    let statuses = runner.status(&session.service).await?;

    let format = flag_value(args, "--format").unwrap_or("table");
    match format {
        "json" => write_line(chan, serde_json::to_string(&statuses).unwrap()).await?,
        "json-pretty" => write_line(chan, serde_json::to_string_pretty(&statuses).unwrap()).await?,
        _ => {
            for s in &statuses {
                write_line(
                    chan,
                    format!(
                        "{:<24} {:<12} {:<8} {}",
                        s.name,
                        s.state,
                        if s.healthy { "healthy" } else { "unhealthy" },
                        s.detail.clone().unwrap_or_default()
                    ),
                )
                .await?;
            }
        }
    }
    Ok(0)
}

async fn verb_logs(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    let runner = runner_for(collaborators, &session.service).await?;
    let follow = has_flag(args, "--follow");
    let lines = flag_value(args, "--lines").and_then(|s| s.parse::<u32>().ok());

    let mut rx = runner.logs(&session.service, follow, lines).await?;
    loop {
        tokio::select! {
            chunk = rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        if chan.stdout_tx.send(chunk.bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            resize = chan.resize_rx.recv(), if follow => {
                if resize.is_none() {
                    break;
                }
            }
            control = chan.stdin_rx.recv(), if follow => {
                if control.is_none() {
                    break;
                }
            }
        }
    }
    Ok(0)
}

async fn verb_remove(collaborators: &Collaborators, session: &ExecSession, chan: &ExecChannel) -> Result<i32> {
    let runner = runner_for(collaborators, &session.service).await?;
    runner.remove(&session.service).await?;

    collaborators
        .catalog
        .mutate_data(|data| {
            data.services.remove(&session.service);
            Ok(())
        })
        .await?;

    collaborators
        .events
        .publish(crate::events::Event::new(
            &session.service,
            crate::events::EventKind::ServiceDeleted,
        ))
        .await;

    write_line(chan, "removed").await?;
    Ok(0)
}

async fn verb_mount(collaborators: &Collaborators, args: &[String], chan: &ExecChannel) -> Result<i32> {
    let name = args
        .first()
        .ok_or_else(|| Error::InvalidInput("mount requires a volume name".into()))?;
    volumes::mount(&collaborators.cfg, &collaborators.catalog, name).await?;
    write_line(chan, "mounted").await?;
    Ok(0)
}

async fn verb_umount(collaborators: &Collaborators, args: &[String], chan: &ExecChannel) -> Result<i32> {
    let name = args
        .first()
        .ok_or_else(|| Error::InvalidInput("umount requires a volume name".into()))?;
    volumes::umount(&collaborators.cfg, &collaborators.catalog, name).await?;
    write_line(chan, "unmounted").await?;
    Ok(0)
}

async fn verb_cron(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    if args.len() < 5 {
        write_line(chan, "cron requires 5 fields: m h dom mon dow [args...]").await?;
        return Ok(1);
    }
    let expr = args[..5].join(" ");
    let on_calendar = cron_to_on_calendar(&expr)?;
    let extra_args = &args[5..];

    let cfg = install_cfg_from_args(
        session,
        extra_args,
        false,
        false,
        Some(TimerCfg { on_calendar: on_calendar.clone() }),
    )
    .await?;
    let installer = FileInstaller::create(
        cfg,
        collaborators.catalog.clone(),
        collaborators.events.clone(),
        collaborators.cfg.clone(),
        collaborators.detector(),
        collaborators.init.clone(),
    )
    .await?;
    let installer = stream_payload_into_installer(chan, installer).await?;
    match installer.close(&collaborators.generation).await? {
        CloseOutcome::Staged => write_line(chan, format!("staged (OnCalendar={on_calendar})")).await?,
        CloseOutcome::Committed(gen) => {
            write_line(chan, format!("committed generation {gen} (OnCalendar={on_calendar})")).await?
        }
    }
    Ok(0)
}

async fn verb_events(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    let filter = if has_flag(args, "--all") {
        Filter::all()
    } else {
        Filter::for_service(&session.service)
    };
    let mut subscription = collaborators.events.subscribe(filter).await;
    loop {
        tokio::select! {
            evt = subscription.recv() => {
                let Some(evt) = evt else { break };
                let line = serde_json::to_string(&evt).unwrap();
                if chan.stdout_tx.send(format!("{line}\n").into_bytes()).await.is_err() {
                    break;
                }
            }
            control = chan.stdin_rx.recv() => {
                if control.is_none() {
                    break;
                }
            }
        }
    }
    Ok(0)
}

async fn verb_version(args: &[String], chan: &ExecChannel) -> Result<i32> {
    if has_flag(args, "--json") {
        let body = serde_json::json!({
            "version": crate::BUILD_INFO.version,
            "target": crate::BUILD_INFO.target,
            "profile": crate::BUILD_INFO.profile,
        });
        write_line(chan, body.to_string()).await?;
    } else {
        write_line(
            chan,
            format!(
                "catchd {} ({}, {})",
                crate::BUILD_INFO.version,
                crate::BUILD_INFO.target,
                crate::BUILD_INFO.profile
            ),
        )
        .await?;
    }
    Ok(0)
}

async fn verb_tailscale(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    if let Some(pos) = args.iter().position(|a| a == "--") {
        return verb_tailscale_passthrough(collaborators, session, &args[pos + 1..], chan).await;
    }

    match args.first().map(String::as_str) {
        Some("update") => verb_tailscale_update(collaborators, session, &args[1..], chan).await,
        _ => {
            write_line(chan, "usage: tailscale update [<version>]").await?;
            Ok(1)
        }
    }
}

/// `--` disables the internal subcommand dispatch entirely and execs the
/// per-service tailscale client directly with the raw args, the way
/// `--` does for the system `tailscale` CLI itself.
async fn verb_tailscale_passthrough(
    collaborators: &Collaborators,
    session: &ExecSession,
    raw_args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    let binary = collaborators.cfg.service_run_dir(&session.service).join("tailscale");
    if !tokio::fs::try_exists(&binary).await.unwrap_or(false) {
        write_line(
            chan,
            format!(
                "no tailscale client installed for service '{}' (run `tailscale update` first)",
                session.service
            ),
        )
        .await?;
        return Ok(1);
    }

    let output = tokio::process::Command::new(&binary)
        .args(raw_args)
        .output()
        .await
        .map_err(|e| Error::Runner(format!("failed to spawn '{}': {e}", binary.display())))?;

    if !output.stdout.is_empty() {
        chan.stdout_tx
            .send(output.stdout)
            .await
            .map_err(|_| Error::Transient("exec session stdout closed".into()))?;
    }
    if !output.stderr.is_empty() {
        write_line(chan, String::from_utf8_lossy(&output.stderr)).await?;
    }

    Ok(output.status.code().unwrap_or(1))
}

async fn verb_tailscale_update(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    let snapshot = collaborators.catalog.get().await;
    let svc = snapshot
        .services
        .get(&session.service)
        .ok_or_else(|| Error::ServiceNotFound {
            name: session.service.clone(),
        })?;
    let current = svc
        .tailscale_net
        .as_ref()
        .ok_or_else(|| Error::Conflict(format!("service '{}' has no tailscale sidecar configured", session.service)))?
        .version
        .clone();
    drop(snapshot);

    let target_version = match args.first() {
        Some(v) => v.clone(),
        None => {
            let track = track_for_version(&current)
                .ok_or_else(|| Error::InvalidInput(format!("cannot resolve track for version '{current}'")))?;
            collaborators.tailnet.latest_version(track).await?
        }
    };

    write_line(chan, format!("update {current} -> {target_version}? (y/n)")).await?;
    let answer = read_confirmation(chan).await?;
    if !answer {
        write_line(chan, "aborted").await?;
        return Ok(1);
    }

    let cred = TailnetCredential::load(&collaborators.tailnet_key_path).await?;
    let run_dir = collaborators.cfg.service_run_dir(&session.service);
    tokio::fs::create_dir_all(&run_dir).await?;

    for binary in ["tailscale", "tailscaled"] {
        let tmp_path = run_dir.join(format!(".{binary}-{target_version}.tmp"));
        download_tailscale_binary(&cred, binary, &target_version, &tmp_path).await?;
        let final_path = run_dir.join(format!("{binary}-{target_version}"));
        tokio::fs::rename(&tmp_path, &final_path).await?;
        let link_path = run_dir.join(binary);
        let _ = tokio::fs::remove_file(&link_path).await;
        #[cfg(unix)]
        tokio::fs::symlink(&final_path, &link_path).await?;
        #[cfg(not(unix))]
        tokio::fs::copy(&final_path, &link_path).await?;
    }

    collaborators
        .catalog
        .mutate_service(
            &session.service,
            || unreachable!("service already confirmed present above"),
            |svc| {
                if let Some(net) = svc.tailscale_net.as_mut() {
                    net.version = target_version.clone();
                }
                Ok(())
            },
        )
        .await?;

    let sidecar_unit = format!("catchd-{}-tailscale", session.service);
    collaborators.init.restart(&sidecar_unit).await?;

    write_line(chan, format!("updated to {target_version}")).await?;
    Ok(0)
}

async fn download_tailscale_binary(
    _cred: &TailnetCredential,
    binary: &str,
    version: &str,
    dest: &std::path::Path,
) -> Result<()> {
    // The real release CDN is a static download surface, not an
    // authenticated control-plane call; no credential is needed on the
    // wire, only to resolve the track/version beforehand.
    let url = format!("https://pkgs.tailscale.com/stable/tailscale_{version}_amd64/{binary}");
    let client = reqwest::Client::new();
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Transient(format!("tailscale binary download failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::Transient(format!(
            "tailscale binary download failed: HTTP {}",
            resp.status()
        )));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| Error::Transient(format!("tailscale binary download failed: {e}")))?;
    write_file_creating_parents(dest, &bytes).await?;
    Ok(())
}

/// Read a single `y`/`n` answer from the stdin channel (a text control
/// frame carrying plain bytes, not a structured `ControlFrame`).
async fn read_confirmation(chan: &mut ExecChannel) -> Result<bool> {
    match chan.stdin_rx.recv().await {
        Some(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(text.trim().eq_ignore_ascii_case("y"))
        }
        None => Ok(false),
    }
}

async fn verb_edit(
    collaborators: &Collaborators,
    session: &ExecSession,
    args: &[String],
    chan: &mut ExecChannel,
) -> Result<i32> {
    let config_mode = has_flag(args, "--config");

    let snapshot = collaborators.catalog.get().await;
    let svc = snapshot
        .services
        .get(&session.service)
        .ok_or_else(|| Error::ServiceNotFound {
            name: session.service.clone(),
        })?;

    let artifact_name = if config_mode {
        ArtifactName::EnvFile
    } else {
        match svc.kind {
            ServiceKind::Init => ArtifactName::Script,
            ServiceKind::Compose => ArtifactName::ComposeFile,
        }
    };
    let source_path = svc
        .artifacts
        .get(&artifact_name)
        .and_then(|a| a.get(REF_LATEST))
        .map(std::path::PathBuf::from)
        .ok_or_else(|| Error::Conflict(format!("service '{}' has no {artifact_name:?} to edit", session.service)))?;
    drop(snapshot);

    let original = tokio::fs::read_to_string(&source_path).await?;
    let edited = run_editor(&collaborators.cfg.editor, &original, chan, session.tty).await?;

    if edited == original {
        write_line(chan, "no changes").await?;
        return Ok(0);
    }

    let bin_dir = collaborators.cfg.service_bin_dir(&session.service);
    tokio::fs::create_dir_all(&bin_dir).await?;
    let staged_path = bin_dir.join(format!(
        "{}-{}",
        artifact_name_file_stem(artifact_name),
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&staged_path, edited.as_bytes()).await?;

    collaborators
        .catalog
        .mutate_service(
            &session.service,
            || unreachable!("service already confirmed present above"),
            |svc| {
                svc.artifact_mut(artifact_name)
                    .refs
                    .insert(REF_STAGED.into(), staged_path.to_string_lossy().into_owned());
                Ok(())
            },
        )
        .await?;

    let gen = collaborators.generation.install_gen(&session.service, 0).await?;
    write_line(chan, format!("committed generation {gen}")).await?;
    Ok(0)
}

fn artifact_name_file_stem(name: ArtifactName) -> &'static str {
    match name {
        ArtifactName::EnvFile => "env",
        ArtifactName::Script => "script",
        ArtifactName::ComposeFile => "compose",
        _ => "artifact",
    }
}

/// Run `editor` against `original`'s contents. Unix with a requested pty
/// gets a real interactive terminal; otherwise the editor runs headless
/// against a scratch file (usable for non-interactive `$EDITOR` values
/// like `cat` or scripted test doubles, which never need a controlling
/// terminal).
async fn run_editor(editor: &str, original: &str, chan: &mut ExecChannel, tty: bool) -> Result<String> {
    let scratch = std::env::temp_dir().join(format!("catchd-edit-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&scratch, original.as_bytes()).await?;

    #[cfg(unix)]
    if tty {
        return run_editor_with_pty(editor, &scratch, chan).await;
    }
    let _ = (chan, tty);

    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(format!("{editor} {}", scratch.display()))
        .status()
        .await?;
    if !status.success() {
        return Err(Error::Runner(format!("editor '{editor}' exited with {status}")));
    }
    let edited = tokio::fs::read_to_string(&scratch).await?;
    let _ = tokio::fs::remove_file(&scratch).await;
    Ok(edited)
}

#[cfg(unix)]
async fn run_editor_with_pty(editor: &str, scratch: &std::path::Path, chan: &mut ExecChannel) -> Result<String> {
    let pty = crate::pty::open(24, 80)?;
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(format!("{editor} {}", scratch.display()));
    crate::pty::attach_child_to_pty(&mut cmd, &pty.user_path);
    let mut child = cmd.spawn()?;

    let mut controller = pty.into_controller_file();
    let mut read_buf = [0u8; 4096];

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(Error::Runner(format!("editor '{editor}' exited with {status}")));
                }
                break;
            }
            n = tokio::io::AsyncReadExt::read(&mut controller, &mut read_buf) => {
                match n {
                    Ok(0) | Err(_) => continue,
                    Ok(n) => {
                        let _ = chan.stdout_tx.send(read_buf[..n].to_vec()).await;
                    }
                }
            }
            input = chan.stdin_rx.recv() => {
                match input {
                    Some(bytes) => {
                        let _ = tokio::io::AsyncWriteExt::write_all(&mut controller, &bytes).await;
                    }
                    None => continue,
                }
            }
            resize = chan.resize_rx.recv() => {
                if let Some((rows, cols)) = resize {
                    let _ = crate::pty::resize(
                        &crate::pty::Pty { controller: std::os::fd::AsFd::as_fd(&controller).try_clone_to_owned().unwrap(), user_path: String::new() },
                        rows,
                        cols,
                    );
                }
            }
        }
    }

    let edited = tokio::fs::read_to_string(scratch).await?;
    let _ = tokio::fs::remove_file(scratch).await;
    Ok(edited)
}
