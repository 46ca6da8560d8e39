//! Persisted data model: services, artifacts, image repos and volumes.
//!
//! This is a map-of-maps, not a pointer graph (see DESIGN.md) — indirection
//! through refs and content-addressed paths means nothing holds a
//! long-lived reference to a mutable artifact. Readers snapshot the whole
//! `CatalogData` (behind an `Arc`) before use rather than sharing a lock
//! across calls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Ref name reserved for the most recently staged (not yet committed)
/// artifact version.
pub const REF_STAGED: &str = "staged";
/// Ref name that always mirrors `gen-<currentGeneration>`.
pub const REF_LATEST: &str = "latest";

/// Build the ref name for a specific generation.
pub fn gen_ref(n: u64) -> String {
    format!("gen-{n}")
}

/// True if `name` is one of the reserved ref names (`staged`, `latest`, or
/// `gen-<N>` for any `N`).
pub fn is_reserved_ref(name: &str) -> bool {
    name == REF_STAGED || name == REF_LATEST || parse_gen_ref(name).is_some()
}

/// Parse `gen-<N>` into `N`, or `None` if `name` isn't of that shape.
pub fn parse_gen_ref(name: &str) -> Option<u64> {
    name.strip_prefix("gen-").and_then(|s| s.parse().ok())
}

/// The kind of supervision a service's artifacts are installed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Supervised directly by the host init system (systemd units).
    Init,
    /// Supervised by the local container-compose runner.
    Compose,
}

/// The closed set of artifact names a service may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum ArtifactName {
    /// A compiled/supervised binary.
    Binary,
    /// A shell or interpreted script installed in place of a binary.
    Script,
    /// A docker-compose (or compatible) project file.
    ComposeFile,
    /// An environment file (`KEY=VALUE` lines) passed to the unit/compose.
    EnvFile,
    /// A generated systemd unit file.
    InitUnit,
    /// A generated systemd timer file (for `cron` verb installs).
    InitTimer,
    /// Per-service network namespace service unit.
    NetNSService,
    /// Per-service network namespace resolv.conf.
    NetNSResolv,
    /// Tailscale sidecar systemd service unit.
    TSService,
    /// Tailscale sidecar configuration.
    TSConfig,
    /// Tailscale sidecar environment file.
    TSEnv,
    /// Tailscale sidecar daemon binary.
    TSBinary,
    /// Compose network-driver descriptor binding a project to the netns.
    ComposeNetwork,
    /// A staged TypeScript source file (wrapped into a synthetic compose
    /// project before install).
    TypeScriptFile,
    /// A staged Python source file (wrapped into a synthetic compose
    /// project before install).
    PythonFile,
}

impl ArtifactName {
    /// All artifact kinds, in a stable order — used when iterating a
    /// service's full artifact set (e.g. during generation commit/prune).
    pub const ALL: &'static [ArtifactName] = &[
        ArtifactName::Binary,
        ArtifactName::Script,
        ArtifactName::ComposeFile,
        ArtifactName::EnvFile,
        ArtifactName::InitUnit,
        ArtifactName::InitTimer,
        ArtifactName::NetNSService,
        ArtifactName::NetNSResolv,
        ArtifactName::TSService,
        ArtifactName::TSConfig,
        ArtifactName::TSEnv,
        ArtifactName::TSBinary,
        ArtifactName::ComposeNetwork,
        ArtifactName::TypeScriptFile,
        ArtifactName::PythonFile,
    ];
}

/// A single artifact: a ref -> filesystem path mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifact {
    /// `"staged"`, `"latest"`, `"gen-<N>"`, or any caller-chosen ref.
    pub refs: BTreeMap<String, String>,
}

impl Artifact {
    /// Fetch the path stored under `ref_name`, if any.
    pub fn get(&self, ref_name: &str) -> Option<&str> {
        self.refs.get(ref_name).map(String::as_str)
    }

    /// Promote the value under `from` to also live under `to`. No-op if
    /// `from` is absent.
    pub fn promote(&mut self, from: &str, to: &str) {
        if let Some(path) = self.refs.get(from).cloned() {
            self.refs.insert(to.to_string(), path);
        }
    }
}

/// macvlan network descriptor embedded in a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Macvlan {
    /// Name of the macvlan interface created inside the netns.
    pub iface: String,
    /// Host interface macvlan attaches to (the default-route parent).
    pub parent: String,
    /// Locally-administered unicast MAC address assigned to `iface`.
    pub mac: String,
    /// Optional 802.1Q VLAN tag.
    pub vlan: Option<u16>,
}

/// Plain per-service network descriptor (the `svc` family).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcNetwork {
    /// Allocated `/24` host IPv4 address, e.g. `192.168.100.37`.
    pub ipv4: String,
}

/// Tailscale sidecar descriptor (the `ts` family).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailscaleNet {
    /// TUN/TAP interface name tailscaled manages.
    pub iface: String,
    /// Tailscale daemon version currently installed.
    pub version: String,
    /// Exit node to route through, if any.
    pub exit_node: Option<String>,
    /// ACL tags applied to this node.
    pub tags: Vec<String>,
    /// Stable tailnet device id, once registered.
    pub stable_id: Option<String>,
}

/// A single service entry in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Unique service name.
    pub name: String,
    /// Supervision kind.
    pub kind: ServiceKind,
    /// Highest generation number ever committed (0 = uninitialized).
    pub latest_generation: u64,
    /// Generation currently installed and running (<= latest_generation).
    pub current_generation: u64,
    /// Per-service override of the retention window; falls back to the
    /// process-wide default (10) when absent.
    pub max_generations: Option<u32>,
    /// Plain per-service network, if configured.
    pub svc_network: Option<SvcNetwork>,
    /// macvlan network, if configured.
    pub macvlan: Option<Macvlan>,
    /// Tailscale sidecar, if configured.
    pub tailscale_net: Option<TailscaleNet>,
    /// This service's artifacts, keyed by the closed `ArtifactName` set.
    pub artifacts: BTreeMap<ArtifactName, Artifact>,
    /// Unix user the service runs as.
    pub user: String,
}

impl Service {
    /// Construct a brand-new, uninitialized service entry.
    pub fn new(name: impl Into<String>, user: impl Into<String>, kind: ServiceKind) -> Self {
        Service {
            name: name.into(),
            kind,
            latest_generation: 0,
            current_generation: 0,
            max_generations: None,
            svc_network: None,
            macvlan: None,
            tailscale_net: None,
            artifacts: BTreeMap::new(),
            user: user.into(),
        }
    }

    /// Effective retention window for this service.
    pub fn max_generations(&self, default_max_generations: u32) -> u32 {
        self.max_generations.unwrap_or(default_max_generations)
    }

    /// Mutable access to an artifact, creating an empty one if absent.
    pub fn artifact_mut(&mut self, name: ArtifactName) -> &mut Artifact {
        self.artifacts.entry(name).or_default()
    }
}

/// A single ref -> digest/manifest-metadata entry in an image repo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRepo {
    /// ref name (tag, digest, or reserved ref) -> digest string.
    pub refs: BTreeMap<String, String>,
}

impl ImageRepo {
    /// Promote the value under `from` to also live under `to`. No-op if
    /// `from` is absent.
    pub fn promote(&mut self, from: &str, to: &str) {
        if let Some(digest) = self.refs.get(from).cloned() {
            self.refs.insert(to.to_string(), digest);
        }
    }
}

/// A named, mountable volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Source path or identifier on the host.
    pub src: String,
    /// Mount point inside the service's view.
    pub path: String,
    /// Mount type (`bind`, `tmpfs`, ...).
    pub r#type: String,
    /// Raw mount options string.
    pub opts: String,
    /// Other volume names that must be mounted first.
    pub deps: Vec<String>,
}

/// The whole persisted catalog document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogData {
    /// Schema version, bumped on incompatible struct changes.
    pub version: u32,
    /// Services keyed by name.
    pub services: BTreeMap<String, Service>,
    /// Image repos keyed by `<serviceName>/<imageName>`.
    pub image_repos: BTreeMap<String, ImageRepo>,
    /// Volumes keyed by name.
    pub volumes: BTreeMap<String, Volume>,
}

impl Default for CatalogData {
    fn default() -> Self {
        CatalogData {
            version: 1,
            services: BTreeMap::new(),
            image_repos: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }
}

/// Default retention window when a service does not override it.
pub const DEFAULT_MAX_GENERATIONS: u32 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ref_recognizes_gen_refs() {
        assert!(is_reserved_ref("staged"));
        assert!(is_reserved_ref("latest"));
        assert!(is_reserved_ref("gen-7"));
        assert!(!is_reserved_ref("gen-"));
        assert!(!is_reserved_ref("v1.2.3"));
    }

    #[test]
    fn artifact_promote_copies_value() {
        let mut a = Artifact::default();
        a.refs.insert("staged".into(), "/bin/svc-1".into());
        a.promote("staged", "gen-1");
        assert_eq!(a.get("gen-1"), Some("/bin/svc-1"));
    }
}
