//! Registry HTTP-surface integration tests, driving the real
//! `RegistryHandler` over a live TCP listener (the exec-session verbs and
//! JSON-RPC methods are covered by their own in-module unit tests; this
//! file exercises the one surface `Request<Incoming>` can't be
//! synthesized for without a real connection): stage-only manifest push,
//! cross-repo blob mount, and loopback-origin manifest PUT rejection.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use catch_core::catalog::model::{ArtifactName, REF_LATEST, REF_STAGED};
use catch_core::catalog::store::CatalogStore;
use catch_core::config::ServerConfig;
use catch_core::events::{EventBus, EventKind, Filter};
use catch_core::installer::generation::GenerationInstaller;
use catch_core::registry::fs_storage::FsStorage;
use catch_core::registry::http::RegistryHandler;
use catch_core::runner::compose::ComposeRunner;
use catch_core::runner::init::SystemdRunner;

/// A tailnet-peer-shaped address, used to exercise the "not loopback"
/// branch of manifest PUT from a test client that necessarily connects
/// over 127.0.0.1. The real daemon never second-guesses its accept loop's
/// peer address this way (see `main.rs`); this header is a test-harness
/// convenience only, with no counterpart in production code.
const TEST_REMOTE_IP_HEADER: &str = "x-test-remote-ip";

struct Harness {
    addr: SocketAddr,
    catalog: CatalogStore,
    events: EventBus,
    _data_dir: tempfile::TempDir,
}

async fn spawn_registry() -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let cfg = Arc::new(ServerConfig {
        data_dir: data_dir.path().to_path_buf(),
        ..ServerConfig::from_env()
    });
    let catalog = CatalogStore::open(cfg.catalog_path()).await.unwrap();
    let events = EventBus::new();
    let storage = Arc::new(FsStorage::new(cfg.registry_dir()));
    let generation = GenerationInstaller::new(
        catalog.clone(),
        events.clone(),
        cfg.clone(),
        Arc::new(ComposeRunner::new()),
        Arc::new(SystemdRunner::new()),
    );
    let registry = Arc::new(RegistryHandler::new(
        storage,
        catalog.clone(),
        events.clone(),
        cfg.clone(),
        generation,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let registry = registry.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let default_ip = peer.ip();
                let svc = service_fn(move |req: Request<Incoming>| {
                    let registry = registry.clone();
                    let remote_ip = req
                        .headers()
                        .get(TEST_REMOTE_IP_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<IpAddr>().ok())
                        .unwrap_or(default_ip);
                    async move { Ok::<_, Infallible>(registry.handle(req, remote_ip).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });

    Harness {
        addr,
        catalog,
        events,
        _data_dir: data_dir,
    }
}

fn oci_manifest_body() -> &'static str {
    r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:0000000000000000000000000000000000000000000000000000000000aa","size":2},"layers":[]}"#
}

/// S1 — a manifest pushed to the `latest` tag from a non-loopback peer
/// stages the service without committing a generation, and emits
/// `ServiceConfigStaged`.
#[tokio::test]
async fn s1_manifest_latest_stages_without_committing() {
    let harness = spawn_registry().await;
    let mut sub = harness.events.subscribe(Filter::for_service("svc-a")).await;

    let client = reqwest::Client::new();
    let resp = client
        .put(format!("http://{}/v2/svc-a/app/manifests/latest", harness.addr))
        .header(TEST_REMOTE_IP_HEADER, "100.64.0.5")
        .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
        .body(oci_manifest_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

    let snapshot = harness.catalog.get().await;
    let svc = snapshot.services.get("svc-a").expect("service staged lazily");
    let compose = svc
        .artifacts
        .get(&ArtifactName::ComposeFile)
        .expect("compose file artifact recorded");
    assert!(compose.refs.contains_key(REF_STAGED));
    assert!(
        !compose.refs.contains_key(REF_LATEST),
        "stage-only push must not promote to a running ref"
    );

    let evt = tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv())
        .await
        .expect("event received before timeout")
        .expect("bus still open");
    assert_eq!(evt.service, "svc-a");
    assert!(matches!(evt.kind, EventKind::ServiceConfigStaged));
}

/// S5 — cross-repo mount never copies bytes: mounting a blob already
/// present under another repo succeeds with 201 and the on-disk blob
/// count is unchanged.
#[tokio::test]
async fn s5_cross_repo_mount_copies_no_bytes() {
    let harness = spawn_registry().await;
    let client = reqwest::Client::new();

    let payload = b"a blob shared across two repos";
    let digest = format!("sha256:{}", hex::encode(sha2_digest(payload)));

    let push = client
        .post(format!(
            "http://{}/v2/svc-a/app/blobs/uploads/?digest={}",
            harness.addr, digest
        ))
        .header(TEST_REMOTE_IP_HEADER, "100.64.0.5")
        .body(payload.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(push.status(), reqwest::StatusCode::CREATED);

    let blob_count_before = count_blob_files(&harness).await;

    let mount = client
        .post(format!(
            "http://{}/v2/svc-b/app/blobs/uploads/?mount={}&from=svc-a/app",
            harness.addr, digest
        ))
        .header(TEST_REMOTE_IP_HEADER, "100.64.0.5")
        .send()
        .await
        .unwrap();
    assert_eq!(mount.status(), reqwest::StatusCode::CREATED);
    let location = mount
        .headers()
        .get("Location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(location, format!("/v2/svc-b/app/blobs/{digest}"));

    let blob_count_after = count_blob_files(&harness).await;
    assert_eq!(blob_count_before, blob_count_after, "mount must not write a second blob");
}

/// S6 (first half) — a manifest PUT arriving from the loopback interface
/// (the local container engine, never an authorized tailnet peer) is
/// rejected at the registry's own policy layer, independent of the RPC
/// plane's separate `Authorize` wrapper.
#[tokio::test]
async fn s6_loopback_manifest_put_rejected() {
    let harness = spawn_registry().await;
    let client = reqwest::Client::new();

    // No override header: the real socket peer address is 127.0.0.1,
    // since the test client itself runs on localhost.
    let resp = client
        .put(format!("http://{}/v2/svc-a/app/manifests/latest", harness.addr))
        .body(oci_manifest_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    let snapshot = harness.catalog.get().await;
    assert!(
        !snapshot.services.contains_key("svc-a"),
        "a rejected loopback push must not touch the catalog"
    );
}

fn sha2_digest(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

async fn count_blob_files(harness: &Harness) -> usize {
    let root = harness._data_dir.path().join("registry").join("blobs").join("sha256");
    let mut count = 0;
    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                count += 1;
            }
        }
    }
    count
}
