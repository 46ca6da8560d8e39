//! Per-request authorization for the RPC plane.
//!
//! The tailnet transport library is an external collaborator: this core
//! assumes an authenticated peer identity is supplied per RPC,
//! carried here as a request header populated by whatever sits in front of
//! catchd on the real tailnet (the equivalent of Tailscale's `whois` LocalAPI
//! call). [`HeaderIdentityResolver`] is the narrow default that reads it;
//! callers needing real tailnet identity resolution swap in their own
//! [`IdentityResolver`].

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{Error, Result};

/// The header carrying the resolved peer identity as JSON, set by
/// whatever terminates the tailnet connection in front of this process.
pub const PEER_IDENTITY_HEADER: &str = "x-catchd-peer-identity";

/// A resolved RPC caller.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerIdentity {
    /// Stable user id (tailnet login name or equivalent).
    pub user_id: String,
    /// ACL tags attached to the peer node, if any.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Resolves the authenticated peer identity for an inbound RPC connection.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, headers: &http::HeaderMap, remote_ip: std::net::IpAddr) -> Result<PeerIdentity>;
}

/// Reads [`PEER_IDENTITY_HEADER`] as JSON. Falls back to treating the bare
/// remote IP as the user id when the header is absent, so a loopback
/// deployment without a tailnet in front of it still has a stable identity
/// to evaluate policy against.
pub struct HeaderIdentityResolver;

#[async_trait]
impl IdentityResolver for HeaderIdentityResolver {
    async fn resolve(&self, headers: &http::HeaderMap, remote_ip: std::net::IpAddr) -> Result<PeerIdentity> {
        if let Some(raw) = headers.get(PEER_IDENTITY_HEADER) {
            let raw = raw
                .to_str()
                .map_err(|_| Error::Unauthorized)?;
            return serde_json::from_str(raw).map_err(|_| Error::Unauthorized);
        }
        Ok(PeerIdentity {
            user_id: remote_ip.to_string(),
            tags: Vec::new(),
        })
    }
}

/// Caller-supplied authorization override.
#[async_trait]
pub trait Authorize: Send + Sync {
    async fn authorize(&self, peer: &PeerIdentity, remote_ip: std::net::IpAddr) -> Result<()>;
}

/// The built-in policy:
/// - peer tagged, server tagged: require overlapping tags
/// - peer tagged, server untagged: allow
/// - server tagged, peer untagged: allow
/// - neither tagged: require matching user id
pub struct BuiltinPolicy {
    pub server_tags: Vec<String>,
    pub server_user_id: String,
}

#[async_trait]
impl Authorize for BuiltinPolicy {
    async fn authorize(&self, peer: &PeerIdentity, _remote_ip: std::net::IpAddr) -> Result<()> {
        let peer_tagged = !peer.tags.is_empty();
        let server_tagged = !self.server_tags.is_empty();

        let allowed = match (peer_tagged, server_tagged) {
            (true, true) => peer.tags.iter().any(|t| self.server_tags.contains(t)),
            (true, false) => true,
            (false, true) => true,
            (false, false) => peer.user_id == self.server_user_id,
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(user_id: &str, tags: &[&str]) -> PeerIdentity {
        PeerIdentity {
            user_id: user_id.to_string(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn overlapping_tags_allowed() {
        let policy = BuiltinPolicy {
            server_tags: vec!["tag:prod".into()],
            server_user_id: "root".into(),
        };
        let p = peer("alice", &["tag:prod", "tag:dev"]);
        assert!(policy.authorize(&p, [127, 0, 0, 1].into()).await.is_ok());
    }

    #[tokio::test]
    async fn non_overlapping_tags_rejected() {
        let policy = BuiltinPolicy {
            server_tags: vec!["tag:prod".into()],
            server_user_id: "root".into(),
        };
        let p = peer("alice", &["tag:dev"]);
        assert!(policy.authorize(&p, [127, 0, 0, 1].into()).await.is_err());
    }

    #[tokio::test]
    async fn untagged_server_allows_tagged_peer() {
        let policy = BuiltinPolicy {
            server_tags: vec![],
            server_user_id: "root".into(),
        };
        let p = peer("alice", &["tag:dev"]);
        assert!(policy.authorize(&p, [127, 0, 0, 1].into()).await.is_ok());
    }

    #[tokio::test]
    async fn untagged_requires_matching_user_id() {
        let policy = BuiltinPolicy {
            server_tags: vec![],
            server_user_id: "root".into(),
        };
        assert!(policy.authorize(&peer("root", &[]), [127, 0, 0, 1].into()).await.is_ok());
        assert!(policy.authorize(&peer("alice", &[]), [127, 0, 0, 1].into()).await.is_err());
    }
}
