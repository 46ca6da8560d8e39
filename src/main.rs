//! `catchd`: process entry point. Wires every component together and
//! drives two hyper listeners — the tailnet-facing one (RPC plane +
//! registry) and a loopback-only one serving just the registry, for the
//! local container engine's pulls.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;

use catch_core::catalog::store::CatalogStore;
use catch_core::config::ServerConfig;
use catch_core::dispatcher::Collaborators;
use catch_core::events::EventBus;
use catch_core::installer::generation::GenerationInstaller;
use catch_core::installer::kind::DefaultKindDetector;
use catch_core::registry::fs_storage::FsStorage;
use catch_core::registry::http::RegistryHandler;
use catch_core::rpc::authorize::{Authorize, BuiltinPolicy};
use catch_core::rpc::RpcHandler;
use catch_core::runner::compose::ComposeRunner;
use catch_core::runner::init::SystemdRunner;
use catch_core::tailnet::{HttpTailnetControlPlane, TailnetControlPlane};
use catch_core::Shutdown;

/// Default loopback address the registry is additionally served on, for
/// the local container engine's pulls from `internal-registry/...`.
const DEFAULT_LOOPBACK_ADDR: &str = "127.0.0.1:4434";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> catch_core::Result<()> {
    let cfg = Arc::new(ServerConfig::from_env());
    log::info!("catchd {} starting, data dir {}", catch_core::BUILD_INFO.version, cfg.data_dir.display());

    tokio::fs::create_dir_all(&cfg.data_dir).await?;
    tokio::fs::create_dir_all(cfg.registry_dir()).await?;
    tokio::fs::create_dir_all(cfg.services_dir()).await?;
    tokio::fs::create_dir_all(cfg.mounts_dir()).await?;
    tokio::fs::create_dir_all(cfg.tsd_dir()).await?;

    let catalog = CatalogStore::open(cfg.catalog_path()).await?;
    let events = EventBus::new();
    let shutdown = Shutdown::new();

    events.spawn_heartbeat(shutdown.token());

    let compose = Arc::new(ComposeRunner::new());
    let init = Arc::new(SystemdRunner::new());
    let detector = Arc::new(DefaultKindDetector) as Arc<dyn catch_core::installer::kind::KindDetector>;
    let tailnet = Arc::new(HttpTailnetControlPlane::new(cfg.ts_base_url.clone())) as Arc<dyn TailnetControlPlane>;

    let generation = GenerationInstaller::new(catalog.clone(), events.clone(), cfg.clone(), compose.clone(), init.clone());

    let server_tags: Vec<String> = std::env::var("CATCHD_SERVER_TAGS")
        .ok()
        .map(|raw| raw.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    let server_user_id = std::env::var("CATCHD_SERVER_USER_ID").unwrap_or_else(|_| "root".to_string());

    let collaborators = Arc::new(Collaborators {
        catalog: catalog.clone(),
        events: events.clone(),
        cfg: cfg.clone(),
        compose: compose.clone(),
        init: init.clone(),
        generation: generation.clone(),
        detector,
        tailnet,
        server_tags: server_tags.clone(),
        tailnet_key_path: cfg.data_dir.join("tailscale.key"),
    });

    let authorize: Arc<dyn Authorize> = Arc::new(BuiltinPolicy {
        server_tags,
        server_user_id,
    });

    let storage = Arc::new(FsStorage::new(cfg.registry_dir()));
    let registry = Arc::new(RegistryHandler::new(storage, catalog.clone(), events.clone(), cfg.clone(), generation.clone()));

    let rpc = Arc::new(RpcHandler::new(collaborators.clone(), events.clone(), authorize, shutdown.token()));

    let tailnet_addr = cfg.listen_addr;
    let loopback_addr: SocketAddr = std::env::var("CATCHD_LOOPBACK_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| DEFAULT_LOOPBACK_ADDR.parse().unwrap());

    shutdown
        .track(serve_tailnet(tailnet_addr, rpc, registry.clone(), shutdown.token()))
        .await;
    shutdown
        .track(serve_loopback(loopback_addr, registry, shutdown.token()))
        .await;

    wait_for_signal().await;
    log::info!("shutdown requested, draining in-flight sessions");
    shutdown.shutdown().await;
    log::info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Serve the tailnet-facing listener: both the RPC plane (`/rpc`,
/// `/rpc/exec`, `/rpc/events`) and the registry (`/v2/...`), dispatched by
/// path prefix on one hyper listener.
async fn serve_tailnet(
    addr: SocketAddr,
    rpc: Arc<RpcHandler>,
    registry: Arc<RegistryHandler>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind tailnet listener on {addr}: {e}");
            return;
        }
    };
    log::info!("rpc + registry listening on {addr}");
    serve_loop(listener, cancel, move |req, remote_ip| {
        let rpc = rpc.clone();
        let registry = registry.clone();
        async move {
            if req.uri().path().starts_with("/v2/") || req.uri().path() == "/v2" {
                Ok(registry.handle(req, remote_ip).await)
            } else {
                Ok(rpc.handle(req, remote_ip).await)
            }
        }
    })
    .await;
}

/// Serve the loopback-only listener: the registry alone, for the local
/// container engine's pulls of `internal-registry/<svc>/<name>`.
async fn serve_loopback(addr: SocketAddr, registry: Arc<RegistryHandler>, cancel: tokio_util::sync::CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind loopback registry listener on {addr}: {e}");
            return;
        }
    };
    log::info!("loopback registry listening on {addr}");
    serve_loop(listener, cancel, move |req, remote_ip| {
        let registry = registry.clone();
        async move { Ok(registry.handle(req, remote_ip).await) }
    })
    .await;
}

/// Shared accept loop: spawn one task per connection, track it under a
/// `GracefulShutdown` watcher, and stop accepting once `cancel` fires.
async fn serve_loop<F, Fut>(listener: TcpListener, cancel: tokio_util::sync::CancellationToken, handler: F)
where
    F: Fn(Request<Incoming>, std::net::IpAddr) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = catch_core::Result<Response<catch_core::registry::http::BoxBody>>> + Send + 'static,
{
    let server = auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let remote_ip = remote.ip();
                let io = TokioIo::new(stream);
                let handler = handler.clone();
                let svc = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let resp = handler(req, remote_ip).await.unwrap_or_else(error_response);
                        Ok::<_, std::convert::Infallible>(resp)
                    }
                });

                // `with_upgrades` because `/rpc/exec` and `/rpc/events` ride the
                // websocket upgrade handshake over this same connection.
                let conn = server.serve_connection_with_upgrades(io, svc).into_owned();
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        log::debug!("connection error: {e}");
                    }
                });
            }
        }
    }

    drop(listener);
    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
            log::warn!("graceful shutdown timed out, dropping remaining connections");
        }
    }
}

fn error_response(err: catch_core::Error) -> Response<catch_core::registry::http::BoxBody> {
    let body = http_body_util::Full::new(bytes::Bytes::from(err.to_string()))
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed();
    Response::builder()
        .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
        .body(body)
        .unwrap()
}
