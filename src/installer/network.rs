//! Component F: Network Configurator.
//!
//! Materializes netns, tailnet sidecar, macvlan, and compose
//! network-driver descriptors per service.

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::model::{CatalogData, Macvlan, SvcNetwork, TailscaleNet};
use crate::config::ServerConfig;
use crate::errors::{Error, Result};
use crate::installer::errors::InstallerError;

/// Network address families a service may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Tailscale sidecar.
    Ts,
    /// Plain per-service `/24` network.
    Svc,
    /// macvlan attached to the default-route interface.
    Lan,
}

/// Caller-supplied overrides for network allocation (used mainly by
/// tests and by re-running configuration idempotently).
#[derive(Debug, Clone, Default)]
pub struct NetworkOverrides {
    /// Force a specific default-route parent interface instead of
    /// resolving it from the host.
    pub parent_iface: Option<String>,
}

/// Artifact paths and metadata produced by network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkArtifacts {
    /// Name of the per-service network namespace, if one was created.
    pub netns_name: Option<String>,
    /// systemd unit names this service's unit should depend on (e.g. the
    /// netns and tailscale sidecar units).
    pub systemd_deps: Vec<String>,
    /// Contents to write as the compose network-driver descriptor.
    pub compose_network_yaml: String,
    /// Contents to write as resolv.conf inside the netns, if any.
    pub resolv_conf: Option<String>,
}

const SVC_NET_BASE: [u8; 3] = [192, 168, 100];
const SVC_NET_HOST_MIN: u8 = 3;
const SVC_NET_HOST_MAX: u8 = 253;
const TAILSCALE_DNS: &str = "100.100.100.100";

/// Stateless network configurator; all allocation state lives in the
/// catalog so allocation stays consistent across restarts.
pub struct NetworkConfigurator<'a> {
    cfg: &'a ServerConfig,
}

impl<'a> NetworkConfigurator<'a> {
    /// Construct a configurator bound to `cfg`.
    pub fn new(cfg: &'a ServerConfig) -> Self {
        NetworkConfigurator { cfg }
    }

    fn used_svc_hosts(&self, catalog: &CatalogData) -> HashSet<u8> {
        catalog
            .services
            .values()
            .filter_map(|s| s.svc_network.as_ref())
            .filter_map(|n| n.ipv4.rsplit('.').next())
            .filter_map(|last| last.parse::<u8>().ok())
            .collect()
    }

    /// Allocate the next unused `/24` host for the `svc` family.
    pub fn allocate_svc_network(&self, catalog: &CatalogData) -> Result<SvcNetwork> {
        let used = self.used_svc_hosts(catalog);
        for host in SVC_NET_HOST_MIN..=SVC_NET_HOST_MAX {
            if !used.contains(&host) {
                return Ok(SvcNetwork {
                    ipv4: format!(
                        "{}.{}.{}.{}",
                        SVC_NET_BASE[0], SVC_NET_BASE[1], SVC_NET_BASE[2], host
                    ),
                });
            }
        }
        Err(InstallerError::NetworkPoolExhausted.into())
    }

    /// Generate a locally-administered unicast MAC address.
    pub fn random_mac(&self) -> String {
        let mut rng = rand::rng();
        let mut bytes: [u8; 6] = rng.random();
        // Clear the multicast bit, set the locally-administered bit.
        bytes[0] &= 0xFE;
        bytes[0] |= 0x02;
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Generate a device name with a random hex suffix, e.g. `tsvc-a1b2c3`.
    pub fn device_name(&self, prefix: &str) -> String {
        let mut rng = rand::rng();
        let suffix: u32 = rng.random();
        let short = format!("{prefix}{suffix:06x}");
        // Linux interface names are capped at 15 bytes.
        short.chars().take(15).collect()
    }

    /// Resolve the default-route parent interface, honoring
    /// `overrides.parent_iface` when set. The real resolution (reading
    /// `/proc/net/route`) is attempted first; failing that (e.g. in a
    /// sandboxed test environment) falls back to `eth0`, which is a
    /// conservative, deterministic default rather than a hard failure —
    /// macvlan creation itself will fail clearly downstream if the
    /// interface doesn't exist.
    pub async fn default_route_iface(&self, overrides: &NetworkOverrides) -> Result<String> {
        if let Some(iface) = &overrides.parent_iface {
            return Ok(iface.clone());
        }
        match tokio::fs::read_to_string("/proc/net/route").await {
            Ok(contents) => {
                for line in contents.lines().skip(1) {
                    let cols: Vec<&str> = line.split_whitespace().collect();
                    if cols.len() > 1 && cols[1] == "00000000" {
                        return Ok(cols[0].to_string());
                    }
                }
                Err(InstallerError::NoDefaultRouteInterface.into())
            }
            Err(_) => Ok("eth0".to_string()),
        }
    }

    fn netns_name(&self, service: &str) -> String {
        format!("catchd-{service}")
    }

    /// Build the resolv.conf contents for a netns hosting `ts` (combined
    /// with `svc`/`lan`) or a bare `svc`/`lan` netns.
    fn build_resolv_conf(&self, has_ts: bool) -> String {
        let mut lines = Vec::new();
        if has_ts {
            lines.push(format!("nameserver {TAILSCALE_DNS}"));
        } else {
            lines.push(format!("nameserver {}", self.cfg.default_ns));
        }
        if let Some(domains) = &self.cfg.default_search_domains {
            lines.push(format!("search {domains}"));
        }
        lines.join("\n") + "\n"
    }

    /// Materialize network configuration for the requested families.
    /// Idempotent from the caller's point of view only in the sense that
    /// repeated calls always produce a self-consistent artifact set for
    /// the families given — the installer's "lazily executed, once" rule
    /// is enforced by the caller checking whether
    /// network artifacts already exist before invoking this again.
    pub async fn configure(
        &self,
        service: &str,
        families: &[Family],
        catalog: &CatalogData,
        overrides: &NetworkOverrides,
    ) -> Result<(NetworkArtifacts, Option<SvcNetwork>, Option<Macvlan>, Option<TailscaleNet>)> {
        let has_ts = families.contains(&Family::Ts);
        let has_svc = families.contains(&Family::Svc);
        let has_lan = families.contains(&Family::Lan);

        let mut systemd_deps = Vec::new();
        let mut netns_name = None;
        let mut svc_net = None;
        let mut macvlan = None;
        let mut ts_net = None;
        let mut resolv_conf = None;

        let needs_netns = has_svc || has_lan || (has_ts && (has_svc || has_lan));
        if needs_netns {
            let ns = self.netns_name(service);
            systemd_deps.push(format!("{ns}.service"));
            netns_name = Some(ns);
            resolv_conf = Some(self.build_resolv_conf(has_ts));
        }

        if has_svc {
            svc_net = Some(self.allocate_svc_network(catalog)?);
        }

        if has_lan {
            let parent = self.default_route_iface(overrides).await?;
            macvlan = Some(Macvlan {
                iface: self.device_name("mv"),
                parent,
                mac: self.random_mac(),
                vlan: None,
            });
        }

        if has_ts {
            // `ts` alone runs TAP mode in the host namespace; `ts`
            // combined with `svc`/`lan` runs TUN inside the netns.
            let iface = self.device_name(if has_svc || has_lan { "tun" } else { "tap" });
            systemd_deps.push(format!("catchd-ts-{service}.service"));
            ts_net = Some(TailscaleNet {
                iface,
                version: String::new(),
                exit_node: None,
                tags: Vec::new(),
                stable_id: None,
            });
        }

        let compose_network_yaml = match &netns_name {
            Some(ns) => format!(
                "networks:\n  default:\n    external: true\n    name: {ns}\n"
            ),
            None => "networks: {}\n".to_string(),
        };

        Ok((
            NetworkArtifacts {
                netns_name,
                systemd_deps,
                compose_network_yaml,
                resolv_conf,
            },
            svc_net,
            macvlan,
            ts_net,
        ))
    }
}

impl std::str::FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ts" => Ok(Family::Ts),
            "svc" => Ok(Family::Svc),
            "lan" => Ok(Family::Lan),
            other => Err(Error::InvalidInput(format!("unknown network family '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_has_locally_administered_bit_set_and_not_multicast() {
        let cfg = ServerConfig::from_env();
        let configurator = NetworkConfigurator::new(&cfg);
        let mac = configurator.random_mac();
        let first_byte = u8::from_str_radix(&mac[0..2], 16).unwrap();
        assert_eq!(first_byte & 0x01, 0, "must not be multicast");
        assert_eq!(first_byte & 0x02, 0x02, "must be locally administered");
    }

    #[test]
    fn svc_allocation_skips_used_hosts() {
        let cfg = ServerConfig::from_env();
        let configurator = NetworkConfigurator::new(&cfg);
        let mut catalog = CatalogData::default();
        let mut svc = crate::catalog::model::Service::new(
            "svc-a",
            "root",
            crate::catalog::model::ServiceKind::Init,
        );
        svc.svc_network = Some(SvcNetwork {
            ipv4: "192.168.100.3".into(),
        });
        catalog.services.insert("svc-a".into(), svc);

        let allocated = configurator.allocate_svc_network(&catalog).unwrap();
        assert_eq!(allocated.ipv4, "192.168.100.4");
    }

    #[test]
    fn svc_allocation_exhausted_errors() {
        let cfg = ServerConfig::from_env();
        let configurator = NetworkConfigurator::new(&cfg);
        let mut catalog = CatalogData::default();
        for host in SVC_NET_HOST_MIN..=SVC_NET_HOST_MAX {
            let mut svc = crate::catalog::model::Service::new(
                format!("svc-{host}"),
                "root",
                crate::catalog::model::ServiceKind::Init,
            );
            svc.svc_network = Some(SvcNetwork {
                ipv4: format!("192.168.100.{host}"),
            });
            catalog.services.insert(format!("svc-{host}"), svc);
        }
        assert!(configurator.allocate_svc_network(&catalog).is_err());
    }

    #[tokio::test]
    async fn ts_alone_uses_tap_mode_host_namespace() {
        let cfg = ServerConfig::from_env();
        let configurator = NetworkConfigurator::new(&cfg);
        let catalog = CatalogData::default();
        let (artifacts, svc_net, macvlan, ts_net) = configurator
            .configure("svc-a", &[Family::Ts], &catalog, &NetworkOverrides::default())
            .await
            .unwrap();
        assert!(artifacts.netns_name.is_none());
        assert!(svc_net.is_none());
        assert!(macvlan.is_none());
        assert!(ts_net.unwrap().iface.starts_with("tap"));
    }
}
