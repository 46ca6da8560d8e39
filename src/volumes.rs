//! Component: volume management (the `mount`/`umount` dispatcher verbs).
//!
//! Volumes are managed via a `systemd-mount` analogue rather than the raw
//! `mount(2)` syscall, the same way the `ServiceRunner` variants drive
//! `systemctl`/`docker compose` instead of talking to the kernel directly:
//! shell out and let the init system own the unit's lifecycle. `deps` are
//! mounted depth-first before the requested volume, matching the ordering
//! `.mount`/`.automount` units get from `Requires=`/`After=`.

use crate::catalog::model::Volume;
use crate::catalog::store::CatalogStore;
use crate::config::ServerConfig;
use crate::errors::{Error, Result};
use crate::runner::run_shell;

fn lookup<'a>(volumes: &'a std::collections::BTreeMap<String, Volume>, name: &str) -> Result<&'a Volume> {
    volumes
        .get(name)
        .ok_or_else(|| Error::InvalidInput(format!("no such volume: {name}")))
}

fn mount_point(cfg: &ServerConfig, volume_name: &str, volume: &Volume) -> std::path::PathBuf {
    if volume.path.starts_with('/') {
        std::path::PathBuf::from(&volume.path)
    } else {
        cfg.mounts_dir().join(volume_name)
    }
}

/// Mount `name`, mounting its `deps` first (depth-first, each dep's own
/// deps ahead of it). Already-mounted volumes are tolerated: `systemd-mount`
/// itself is idempotent against an existing matching mount.
pub async fn mount(cfg: &ServerConfig, catalog: &CatalogStore, name: &str) -> Result<()> {
    mount_with_seen(cfg, catalog, name, &mut Vec::new()).await
}

async fn mount_with_seen(
    cfg: &ServerConfig,
    catalog: &CatalogStore,
    name: &str,
    seen: &mut Vec<String>,
) -> Result<()> {
    if seen.iter().any(|s| s == name) {
        return Err(Error::Conflict(format!(
            "volume dependency cycle involving '{name}'"
        )));
    }
    seen.push(name.to_string());

    let snapshot = catalog.get().await;
    let volume = lookup(&snapshot.volumes, name)?.clone();
    drop(snapshot);

    for dep in volume.deps.clone() {
        Box::pin(mount_with_seen(cfg, catalog, &dep, seen)).await?;
    }

    let target = mount_point(cfg, name, &volume);
    tokio::fs::create_dir_all(&target).await?;

    let mut cmd = format!(
        "systemd-mount --no-block --collect -t {} {} {}",
        shell_quote(&volume.r#type),
        shell_quote(&volume.src),
        shell_quote(&target.to_string_lossy()),
    );
    if !volume.opts.is_empty() {
        cmd.push_str(&format!(" -o {}", shell_quote(&volume.opts)));
    }

    let out = run_shell(&cmd).await?;
    if !out.success {
        return Err(Error::Runner(format!(
            "mounting volume '{name}' failed: {}",
            out.combined()
        )));
    }
    Ok(())
}

/// Unmount `name` via `systemd-umount`. Tolerates "not mounted" the way
/// `ServiceRunner::remove` tolerates "not installed" — unmounting something
/// already down is a no-op, not an error.
pub async fn umount(cfg: &ServerConfig, catalog: &CatalogStore, name: &str) -> Result<()> {
    let snapshot = catalog.get().await;
    let volume = lookup(&snapshot.volumes, name)?.clone();
    drop(snapshot);

    let target = mount_point(cfg, name, &volume);
    let cmd = format!("systemd-umount {}", shell_quote(&target.to_string_lossy()));
    let out = run_shell(&cmd).await?;
    if !out.success && !out.combined().to_lowercase().contains("not mounted") {
        return Err(Error::Runner(format!(
            "unmounting volume '{name}' failed: {}",
            out.combined()
        )));
    }
    Ok(())
}

/// Quote a single shell argument defensively; volume fields come from the
/// catalog (operator-controlled, not request bodies) but command
/// construction should never trust embedded whitespace/metacharacters.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::CatalogData;

    #[tokio::test]
    async fn unknown_volume_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..ServerConfig::from_env()
        };
        let catalog = CatalogStore::open(dir.path().join("db.json")).await.unwrap();
        let err = mount(&cfg, &catalog, "nope").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn dependency_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..ServerConfig::from_env()
        };
        let catalog = CatalogStore::open(dir.path().join("db.json")).await.unwrap();
        catalog
            .mutate_data(|data: &mut CatalogData| {
                data.volumes.insert(
                    "a".into(),
                    Volume {
                        src: "/dev/null".into(),
                        path: "a".into(),
                        r#type: "bind".into(),
                        opts: "".into(),
                        deps: vec!["b".into()],
                    },
                );
                data.volumes.insert(
                    "b".into(),
                    Volume {
                        src: "/dev/null".into(),
                        path: "b".into(),
                        r#type: "bind".into(),
                        opts: "".into(),
                        deps: vec!["a".into()],
                    },
                );
                Ok(())
            })
            .await
            .unwrap();

        let err = mount(&cfg, &catalog, "a").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
