//! Component G: the RPC plane. Three endpoints on one HTTP listener —
//! `/rpc` (JSON-RPC 2.0), `/rpc/exec` and `/rpc/events` (WebSocket) — each
//! wrapped by the same per-request authorization policy before dispatch,
//! the same "authorize, then route" shape [`crate::registry::http`] uses
//! for the registry's loopback check.

pub mod authorize;
pub mod exec;
pub mod events;
pub mod jsonrpc;

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use crate::dispatcher::Collaborators;
use crate::events::EventBus;
use authorize::{Authorize, HeaderIdentityResolver, IdentityResolver};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

fn full_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|never: Infallible| match never {}).boxed()
}

fn empty_body() -> BoxBody {
    full_body(Bytes::new())
}

fn status_body(status: StatusCode, message: impl Into<String>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(full_body(Bytes::from(message.into())))
        .unwrap()
}

/// Drives `/rpc`, `/rpc/exec`, `/rpc/events` on one hyper listener.
#[derive(Clone)]
pub struct RpcHandler {
    collaborators: Arc<Collaborators>,
    events: EventBus,
    identity: Arc<dyn IdentityResolver>,
    authorize: Arc<dyn Authorize>,
    shutdown: tokio_util::sync::CancellationToken,
}

impl RpcHandler {
    pub fn new(
        collaborators: Arc<Collaborators>,
        events: EventBus,
        authorize: Arc<dyn Authorize>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Self {
        RpcHandler {
            collaborators,
            events,
            identity: Arc::new(HeaderIdentityResolver),
            authorize,
            shutdown,
        }
    }

    pub async fn handle(&self, mut req: Request<Incoming>, remote_ip: IpAddr) -> Response<BoxBody> {
        let peer = match self.identity.resolve(req.headers(), remote_ip).await {
            Ok(peer) => peer,
            Err(_) => return status_body(StatusCode::UNAUTHORIZED, "identity resolution failed"),
        };
        if self.authorize.authorize(&peer, remote_ip).await.is_err() {
            return status_body(StatusCode::UNAUTHORIZED, "unauthorized");
        }

        let path = req.uri().path().to_string();
        let method = req.method().clone();

        match (method.clone(), path.as_str()) {
            (Method::POST, "/rpc") => self.handle_rpc(req).await,
            (Method::GET, "/rpc/exec") => self.handle_exec_upgrade(&mut req, peer, remote_ip),
            (Method::GET, "/rpc/events") => self.handle_events_upgrade(&mut req),
            _ => status_body(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn handle_rpc(&self, req: Request<Incoming>) -> Response<BoxBody> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return status_body(StatusCode::BAD_REQUEST, format!("failed to read body: {e}")),
        };
        match jsonrpc::handle_request(&self.collaborators.catalog, &body).await {
            Some(resp) => Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(full_body(Bytes::from(serde_json::to_vec(&resp).unwrap())))
                .unwrap(),
            None => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(empty_body())
                .unwrap(),
        }
    }

    fn handle_exec_upgrade(
        &self,
        req: &mut Request<Incoming>,
        peer: authorize::PeerIdentity,
        remote_ip: IpAddr,
    ) -> Response<BoxBody> {
        let Some(response) = websocket_upgrade_response(req) else {
            return status_body(StatusCode::BAD_REQUEST, "expected a websocket upgrade request");
        };
        let collaborators = self.collaborators.clone();
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = exec::serve(upgraded, collaborators, peer, remote_ip).await {
                        log::warn!("exec session ended with error: {e}");
                    }
                }
                Err(e) => log::warn!("exec upgrade failed: {e}"),
            }
        });
        response
    }

    fn handle_events_upgrade(&self, req: &mut Request<Incoming>) -> Response<BoxBody> {
        let Some(response) = websocket_upgrade_response(req) else {
            return status_body(StatusCode::BAD_REQUEST, "expected a websocket upgrade request");
        };
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = events::serve(upgraded, events, shutdown).await {
                        log::warn!("events session ended with error: {e}");
                    }
                }
                Err(e) => log::warn!("events upgrade failed: {e}"),
            }
        });
        response
    }
}

/// Validate the websocket handshake headers and build the `101 Switching
/// Protocols` response hyper-tungstenite needs, by hand — `tokio-tungstenite`
/// is pulled in with `default-features = false`, so its own hyper glue isn't
/// available.
fn websocket_upgrade_response(req: &Request<Incoming>) -> Option<Response<BoxBody>> {
    let upgrade_ok = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_ok {
        return None;
    }
    let key = req.headers().get("sec-websocket-key")?;
    let accept = tokio_tungstenite::tungstenite::handshake::derive_accept_key(key.as_bytes());

    Some(
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(http::header::CONNECTION, "Upgrade")
            .header(http::header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Accept", accept)
            .body(empty_body())
            .unwrap(),
    )
}
