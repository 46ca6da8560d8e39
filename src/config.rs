//! Process-wide configuration, sourced from environment variables plus
//! defaults — env-driven connection setup rather than a config-file format.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Default tailnet control-plane base URL.
pub const DEFAULT_TS_BASE_URL: &str = "https://api.tailscale.com";
/// Default nameserver written into netns resolv.conf when neither tailscale
/// DNS nor `DEFAULT_NS` apply.
pub const DEFAULT_FALLBACK_NS: &str = "8.8.8.8";
/// Default editor for the `edit` verb.
pub const DEFAULT_EDITOR: &str = "vim";

/// Process-wide server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root of the persisted layout: `db.json`, `registry/`,
    /// `services/`, `mounts/`, `tsd/`.
    pub data_dir: PathBuf,
    /// Address the RPC/registry HTTP listener binds.
    pub listen_addr: SocketAddr,
    /// Tailnet control-plane base URL override.
    pub ts_base_url: String,
    /// Default nameserver for netns resolv.conf.
    pub default_ns: String,
    /// Optional search domains appended to netns resolv.conf.
    pub default_search_domains: Option<String>,
    /// Editor invoked by the `edit` verb.
    pub editor: String,
    /// Process-wide default retention window.
    pub max_generations: u32,
}

impl ServerConfig {
    /// Build configuration from the environment, defaulting `data_dir` to
    /// `./data` when `CATCHD_DATA_DIR` is unset.
    pub fn from_env() -> Self {
        ServerConfig {
            data_dir: std::env::var("CATCHD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            listen_addr: std::env::var("CATCHD_LISTEN_ADDR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| "0.0.0.0:4433".parse().unwrap()),
            ts_base_url: std::env::var("TS_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_TS_BASE_URL.to_string()),
            default_ns: std::env::var("DEFAULT_NS")
                .unwrap_or_else(|_| DEFAULT_FALLBACK_NS.to_string()),
            default_search_domains: std::env::var("DEFAULT_SEARCH_DOMAINS").ok(),
            editor: std::env::var("EDITOR").unwrap_or_else(|_| DEFAULT_EDITOR.to_string()),
            max_generations: crate::catalog::model::DEFAULT_MAX_GENERATIONS,
        }
    }

    /// Path to the catalog document.
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("db.json")
    }

    /// Root of the content-addressed registry storage.
    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("registry")
    }

    /// Root of per-service directories (`services/<svc>/{bin,data,env,run}`).
    pub fn services_dir(&self) -> PathBuf {
        self.data_dir.join("services")
    }

    /// Root of managed mounts (`mounts/<name>/`).
    pub fn mounts_dir(&self) -> PathBuf {
        self.data_dir.join("mounts")
    }

    /// Root of the tailscale sidecar daemon binaries (`tsd/`).
    pub fn tsd_dir(&self) -> PathBuf {
        self.data_dir.join("tsd")
    }

    /// Per-service bin directory.
    pub fn service_bin_dir(&self, service: &str) -> PathBuf {
        self.services_dir().join(service).join("bin")
    }

    /// Per-service data directory (survives `Remove`).
    pub fn service_data_dir(&self, service: &str) -> PathBuf {
        self.services_dir().join(service).join("data")
    }

    /// Per-service env directory.
    pub fn service_env_dir(&self, service: &str) -> PathBuf {
        self.services_dir().join(service).join("env")
    }

    /// Per-service run directory (sockets, pid files, sidecar state).
    pub fn service_run_dir(&self, service: &str) -> PathBuf {
        self.services_dir().join(service).join("run")
    }

    /// Per-service tailscale directory.
    pub fn service_tailscale_dir(&self, service: &str) -> PathBuf {
        self.services_dir().join(service).join("tailscale")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_data_dir() {
        let cfg = ServerConfig {
            data_dir: PathBuf::from("/var/lib/catchd"),
            ..ServerConfig::from_env()
        };
        assert_eq!(
            cfg.catalog_path(),
            PathBuf::from("/var/lib/catchd/db.json")
        );
        assert_eq!(
            cfg.service_bin_dir("svc-a"),
            PathBuf::from("/var/lib/catchd/services/svc-a/bin")
        );
    }
}
