//! The Distribution Spec v1.1 HTTP surface (`/v2/...`). Storage-agnostic:
//! every operation goes through the [`Storage`] trait, so the same routing
//! logic drives both [`crate::registry::fs_storage::FsStorage`] and
//! [`crate::registry::content_store::ContentStoreBacked`].
//!
//! Path parsing follows the Distribution Spec's own convention: a `repo`
//! may itself contain slashes, so the operation keyword (`manifests`,
//! `blobs`, or `tags`) is located by scanning the path segments rather than
//! assuming a fixed position.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use crate::catalog::model::{ArtifactName, Service, ServiceKind, REF_STAGED};
use crate::catalog::store::CatalogStore;
use crate::compression::{decode_request_body, encode_response_body, negotiate_response_encoding};
use crate::config::ServerConfig;
use crate::errors::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::installer::generation::GenerationInstaller;
use crate::registry::errors::{error_body, RegistryError};
use crate::registry::storage::Storage;
use crate::registry::upload::{mount_blob, validate_chunk_offset, ByteRange};

/// Response body type every handler returns.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

fn full_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|never: Infallible| match never {}).boxed()
}

fn empty_body() -> BoxBody {
    full_body(Bytes::new())
}

enum Op {
    Manifests,
    Blobs,
    Tags,
}

struct ParsedPath {
    repo: String,
    op: Op,
    rest: Vec<String>,
}

/// Parse `/v2/<repo.../>manifests|blobs|tags/<rest...>`, locating the
/// keyword by scanning segments since `repo` may itself contain slashes.
fn parse_path(path: &str) -> Option<ParsedPath> {
    let body = path.strip_prefix("/v2/")?;
    let segments: Vec<&str> = body.split('/').filter(|s| !s.is_empty()).collect();
    let idx = segments
        .iter()
        .position(|s| matches!(*s, "manifests" | "blobs" | "tags"))?;
    if idx == 0 {
        return None;
    }
    let repo = segments[..idx].join("/");
    let op = match segments[idx] {
        "manifests" => Op::Manifests,
        "blobs" => Op::Blobs,
        "tags" => Op::Tags,
        _ => unreachable!(),
    };
    let rest = segments[idx + 1..].iter().map(|s| s.to_string()).collect();
    Some(ParsedPath { repo, op, rest })
}

#[derive(Debug, Default, serde::Deserialize)]
struct UploadQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
}

fn query_of(req: &Request<Incoming>) -> UploadQuery {
    req.uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default()
}

fn header_str<'a>(req: &'a Request<Incoming>, name: http::header::HeaderName) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn is_digest_reference(reference: &str) -> bool {
    reference.starts_with("sha256:")
}

/// Parse a manifest PUT body as JSON, check its embedded `mediaType` (if
/// any) against the request's `Content-Type` (if any), and return the
/// `subject.digest` field, if present, so the caller can echo it as
/// `OCI-Subject`. The body's media type must match `Content-Type` when
/// both are present; mismatches are `MANIFEST_INVALID`.
fn validate_manifest_media_type(body: &Bytes, content_type: Option<&str>) -> Result<Option<String>> {
    let parsed: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| RegistryError::ManifestInvalid(format!("manifest body is not valid JSON: {e}")))?;

    if let (Some(content_type), Some(body_media_type)) =
        (content_type, parsed.get("mediaType").and_then(|v| v.as_str()))
    {
        if content_type != body_media_type {
            return Err(RegistryError::ManifestInvalid(format!(
                "Content-Type '{content_type}' does not match manifest mediaType '{body_media_type}'"
            ))
            .into());
        }
    }

    Ok(parsed
        .get("subject")
        .and_then(|s| s.get("digest"))
        .and_then(|d| d.as_str())
        .map(str::to_string))
}

/// Drives the OCI Distribution Spec HTTP surface. Holds the catalog/runner
/// collaborators needed to turn a `latest`/`run` manifest push into a
/// staged or fully-committed service generation.
#[derive(Clone)]
pub struct RegistryHandler {
    storage: Arc<dyn Storage>,
    catalog: CatalogStore,
    events: EventBus,
    cfg: Arc<ServerConfig>,
    generation: GenerationInstaller,
}

impl RegistryHandler {
    /// Construct a handler bound to `storage`, driving `catalog`/`events`/
    /// `generation` for manifest-push installs.
    pub fn new(
        storage: Arc<dyn Storage>,
        catalog: CatalogStore,
        events: EventBus,
        cfg: Arc<ServerConfig>,
        generation: GenerationInstaller,
    ) -> Self {
        RegistryHandler {
            storage,
            catalog,
            events,
            cfg,
            generation,
        }
    }

    /// Handle one HTTP request. `remote_ip` is the connecting peer's
    /// address, used to reject manifest pushes originating from the
    /// loopback interface (scenario S6: only an in-fleet peer, never the
    /// host itself, may drive an install this way).
    pub async fn handle(&self, req: Request<Incoming>, remote_ip: IpAddr) -> Response<BoxBody> {
        let accept_encoding = header_str(&req, http::header::ACCEPT_ENCODING).map(str::to_string);
        let result = self.route(req, remote_ip).await;
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => error_response(err),
        };
        apply_response_compression(resp, accept_encoding.as_deref()).await
    }

    async fn route(&self, req: Request<Incoming>, remote_ip: IpAddr) -> Result<Response<BoxBody>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if path == "/v2/" || path == "/v2" {
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Docker-Distribution-Api-Version", "registry/2.0")
                .body(empty_body())
                .unwrap());
        }

        let parsed = parse_path(&path).ok_or_else(|| {
            Error::InvalidInput(format!("'{path}' is not a recognized registry path"))
        })?;

        match parsed.op {
            Op::Manifests => self.handle_manifest(&method, req, &parsed, remote_ip).await,
            Op::Blobs => self.handle_blob(&method, req, &parsed).await,
            Op::Tags => self.handle_tags(&method, &parsed).await,
        }
    }

    async fn handle_manifest(
        &self,
        method: &Method,
        req: Request<Incoming>,
        parsed: &ParsedPath,
        remote_ip: IpAddr,
    ) -> Result<Response<BoxBody>> {
        let reference = parsed.rest.first().cloned().ok_or_else(|| {
            Error::InvalidInput("manifest reference missing from path".into())
        })?;

        match *method {
            Method::GET | Method::HEAD => {
                let found = self.storage.get_manifest(&parsed.repo, &reference).await?;
                let Some(stored) = found else {
                    return Err(RegistryError::ManifestUnknown {
                        repo: parsed.repo.clone(),
                        reference,
                    }
                    .into());
                };
                let mut builder = Response::builder()
                    .status(StatusCode::OK)
                    .header("Docker-Content-Digest", stored.digest.clone())
                    .header(
                        http::header::CONTENT_TYPE,
                        stored
                            .media_type
                            .clone()
                            .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".into()),
                    );
                if *method == Method::HEAD {
                    builder = builder.header(http::header::CONTENT_LENGTH, stored.bytes.len());
                    return Ok(builder.body(empty_body()).unwrap());
                }
                Ok(builder.body(full_body(stored.bytes)).unwrap())
            }
            Method::PUT => {
                if remote_ip.is_loopback() {
                    return Ok(Response::builder()
                        .status(StatusCode::METHOD_NOT_ALLOWED)
                        .body(empty_body())
                        .unwrap());
                }
                if !is_digest_reference(&reference) && reference != "latest" && reference != "run" {
                    return Err(RegistryError::ManifestInvalid(format!(
                        "tag '{reference}' is not one of 'latest' or 'run'"
                    ))
                    .into());
                }

                let content_type = header_str(&req, http::header::CONTENT_TYPE).map(str::to_string);
                let content_encoding = header_str(&req, http::header::CONTENT_ENCODING).map(str::to_string);
                let raw = req
                    .into_body()
                    .collect()
                    .await
                    .map(|c| c.to_bytes())
                    .map_err(|e| Error::InvalidInput(format!("failed to read manifest body: {e}")))?;
                let body = decode_request_body(content_encoding.as_deref(), raw)?;

                let subject_digest = validate_manifest_media_type(&body, content_type.as_deref())?;

                let digest = self
                    .put_manifest(&parsed.repo, &reference, content_type, body)
                    .await?;

                let mut builder = Response::builder()
                    .status(StatusCode::CREATED)
                    .header("Location", format!("/v2/{}/manifests/{}", parsed.repo, reference))
                    .header("Docker-Content-Digest", digest);
                if let Some(subject) = subject_digest {
                    builder = builder.header("OCI-Subject", subject);
                }
                Ok(builder.body(empty_body()).unwrap())
            }
            Method::DELETE => {
                self.storage.delete_manifest(&parsed.repo, &reference).await?;
                Ok(Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .body(empty_body())
                    .unwrap())
            }
            _ => Err(Error::InvalidInput(format!(
                "unsupported manifest operation on '{}'",
                parsed.repo
            ))),
        }
    }

    async fn handle_blob(
        &self,
        method: &Method,
        req: Request<Incoming>,
        parsed: &ParsedPath,
    ) -> Result<Response<BoxBody>> {
        let first = parsed.rest.first().map(String::as_str);
        let second = parsed.rest.get(1).map(String::as_str);

        match (method, first, second, parsed.rest.len()) {
            (&Method::POST, Some("uploads"), None, 1) => self.initiate_upload(req, parsed).await,
            (&Method::PATCH, Some("uploads"), Some(id), 2) => {
                self.patch_upload(req, parsed, id).await
            }
            (&Method::PUT, Some("uploads"), Some(id), 2) => {
                self.complete_upload(req, parsed, id).await
            }
            (&Method::GET, Some("uploads"), Some(id), 2) => self.upload_status(parsed, id).await,
            (&Method::DELETE, Some("uploads"), Some(id), 2) => {
                self.cancel_upload(parsed, id).await
            }
            (&Method::GET, Some(digest), None, 1) | (&Method::HEAD, Some(digest), None, 1) => {
                self.read_blob(method, parsed, digest).await
            }
            (&Method::DELETE, Some(digest), None, 1) => {
                self.storage.delete_blob(digest).await?;
                Ok(Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .body(empty_body())
                    .unwrap())
            }
            _ => Err(Error::InvalidInput(format!(
                "unsupported blob operation on '{}'",
                parsed.repo
            ))),
        }
    }

    async fn initiate_upload(
        &self,
        req: Request<Incoming>,
        parsed: &ParsedPath,
    ) -> Result<Response<BoxBody>> {
        let query = query_of(&req);

        if let (Some(digest), Some(from)) = (query.mount.clone(), query.from.clone()) {
            match mount_blob(self.storage.as_ref(), &digest, &from).await {
                Ok(mounted) => {
                    return Ok(Response::builder()
                        .status(StatusCode::CREATED)
                        .header("Location", format!("/v2/{}/blobs/{}", parsed.repo, mounted.digest))
                        .header("Docker-Content-Digest", mounted.digest)
                        .body(empty_body())
                        .unwrap());
                }
                Err(Error::Registry(RegistryError::BlobUnknown { .. })) => {
                    // Fall through to a normal upload, per the Distribution
                    // Spec's mount-failure fallback.
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(digest) = query.digest.clone() {
            // Monolithic single-POST upload: the whole blob is the body.
            let content_encoding = header_str(&req, http::header::CONTENT_ENCODING).map(str::to_string);
            let body = req.into_body().collect().await.map(|c| c.to_bytes())
                .map_err(|e| Error::InvalidInput(format!("failed to read upload body: {e}")))?;
            let body = decode_request_body(content_encoding.as_deref(), body)?;
            let stored_digest = self.storage.put_blob(body).await?;
            if stored_digest != digest {
                return Err(RegistryError::DigestInvalid {
                    expected: digest,
                    computed: stored_digest,
                }
                .into());
            }
            return Ok(Response::builder()
                .status(StatusCode::CREATED)
                .header("Location", format!("/v2/{}/blobs/{}", parsed.repo, stored_digest))
                .header("Docker-Content-Digest", stored_digest)
                .body(empty_body())
                .unwrap());
        }

        let session = self.storage.start_upload().await?;
        let id = session.id();
        Ok(Response::builder()
            .status(StatusCode::ACCEPTED)
            .header("Location", format!("/v2/{}/blobs/uploads/{id}", parsed.repo))
            .header("Docker-Upload-UUID", id.to_string())
            .header("Range", ByteRange::for_written(0).to_header())
            .body(empty_body())
            .unwrap())
    }

    async fn patch_upload(
        &self,
        req: Request<Incoming>,
        parsed: &ParsedPath,
        id: &str,
    ) -> Result<Response<BoxBody>> {
        let uuid = uuid::Uuid::parse_str(id)
            .map_err(|_| RegistryError::BlobUploadInvalid(format!("bad upload id '{id}'")))?;
        let content_range = header_str(&req, http::header::CONTENT_RANGE).map(str::to_string);
        let mut session = self.storage.get_upload(uuid).await?;
        validate_chunk_offset(content_range.as_deref(), session.written())?;

        let chunk = req
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .map_err(|e| Error::InvalidInput(format!("failed to read upload chunk: {e}")))?;
        session.write_chunk(&chunk).await?;

        Ok(Response::builder()
            .status(StatusCode::ACCEPTED)
            .header("Location", format!("/v2/{}/blobs/uploads/{id}", parsed.repo))
            .header("Docker-Upload-UUID", id)
            .header("Range", ByteRange::for_written(session.written()).to_header())
            .body(empty_body())
            .unwrap())
    }

    async fn complete_upload(
        &self,
        req: Request<Incoming>,
        parsed: &ParsedPath,
        id: &str,
    ) -> Result<Response<BoxBody>> {
        let uuid = uuid::Uuid::parse_str(id)
            .map_err(|_| RegistryError::BlobUploadInvalid(format!("bad upload id '{id}'")))?;
        let query = query_of(&req);
        let digest = query.digest.ok_or_else(|| {
            RegistryError::BlobUploadInvalid("PUT to complete an upload requires ?digest=".into())
        })?;

        let session = self.storage.get_upload(uuid).await?;
        let trailing = req
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .map_err(|e| Error::InvalidInput(format!("failed to read final chunk: {e}")))?;
        let final_digest = session.complete(&trailing, &digest).await?;

        Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header("Location", format!("/v2/{}/blobs/{}", parsed.repo, final_digest))
            .header("Docker-Content-Digest", final_digest)
            .body(empty_body())
            .unwrap())
    }

    async fn upload_status(&self, parsed: &ParsedPath, id: &str) -> Result<Response<BoxBody>> {
        let uuid = uuid::Uuid::parse_str(id)
            .map_err(|_| RegistryError::BlobUploadInvalid(format!("bad upload id '{id}'")))?;
        let session = self.storage.get_upload(uuid).await?;
        Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Location", format!("/v2/{}/blobs/uploads/{id}", parsed.repo))
            .header("Docker-Upload-UUID", id)
            .header("Range", ByteRange::for_written(session.written()).to_header())
            .body(empty_body())
            .unwrap())
    }

    async fn cancel_upload(&self, _parsed: &ParsedPath, id: &str) -> Result<Response<BoxBody>> {
        let uuid = uuid::Uuid::parse_str(id)
            .map_err(|_| RegistryError::BlobUploadInvalid(format!("bad upload id '{id}'")))?;
        let session = self.storage.get_upload(uuid).await?;
        session.cancel().await?;
        Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap())
    }

    async fn read_blob(
        &self,
        method: &Method,
        _parsed: &ParsedPath,
        digest: &str,
    ) -> Result<Response<BoxBody>> {
        if *method == Method::HEAD {
            let size = self.storage.blob_size(digest).await?;
            let Some(size) = size else {
                return Err(RegistryError::BlobUnknown {
                    digest: digest.to_string(),
                }
                .into());
            };
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Docker-Content-Digest", digest)
                .header(http::header::CONTENT_LENGTH, size)
                .body(empty_body())
                .unwrap());
        }

        let bytes = self.storage.read_blob(digest).await?;
        let Some(bytes) = bytes else {
            return Err(RegistryError::BlobUnknown {
                digest: digest.to_string(),
            }
            .into());
        };
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Docker-Content-Digest", digest)
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .body(full_body(bytes))
            .unwrap())
    }

    async fn handle_tags(&self, method: &Method, parsed: &ParsedPath) -> Result<Response<BoxBody>> {
        if *method != Method::GET || parsed.rest.first().map(String::as_str) != Some("list") {
            return Err(Error::InvalidInput(format!(
                "unsupported tags operation on '{}'",
                parsed.repo
            )));
        }
        let tags = self.storage.list_tags(&parsed.repo).await?;
        let body = serde_json::json!({ "name": parsed.repo, "tags": tags });
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(full_body(Bytes::from(serde_json::to_vec(&body)?)))
            .unwrap())
    }

    /// Push a manifest: store it and, for `latest`/`run` tags, drive the
    /// installer. Digest references are accepted purely for content storage
    /// (e.g. as the target of a later tag push) and never trigger an
    /// install by themselves.
    async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        content_type: Option<String>,
        body: Bytes,
    ) -> Result<String> {
        let stored = self
            .storage
            .put_manifest(repo, reference, body, content_type)
            .await?;

        if reference == "latest" || reference == "run" {
            self.drive_manifest_install(repo, reference, &stored.digest)
                .await?;
        }

        Ok(stored.digest)
    }

    async fn drive_manifest_install(&self, repo: &str, reference: &str, digest: &str) -> Result<()> {
        let (service, _name) = repo.split_once('/').ok_or_else(|| {
            RegistryError::ManifestInvalid(format!("repo '{repo}' is not '<service>/<name>'"))
        })?;

        let image_ref = format!("internal-registry/{repo}@{digest}");
        let compose_yaml = format!(
            "services:\n  {service}:\n    image: {image_ref}\n    restart: unless-stopped\n"
        );
        let short_digest = digest.strip_prefix("sha256:").unwrap_or(digest);
        let dest = self
            .cfg
            .service_bin_dir(service)
            .join(format!("compose.{short_digest}.yml"));
        tokio::fs::create_dir_all(self.cfg.service_bin_dir(service)).await?;
        tokio::fs::write(&dest, compose_yaml).await?;

        let dest_str = dest.to_string_lossy().into_owned();
        self.catalog
            .mutate_service(
                service,
                || Service::new(service, "root", ServiceKind::Compose),
                |svc| {
                    svc.kind = ServiceKind::Compose;
                    svc.artifact_mut(ArtifactName::ComposeFile)
                        .refs
                        .insert(REF_STAGED.into(), dest_str.clone());
                    Ok(())
                },
            )
            .await?;

        if reference == "run" {
            self.generation.install_gen(service, 0).await?;
        } else {
            self.events
                .publish(Event::new(service, EventKind::ServiceConfigStaged))
                .await;
        }
        Ok(())
    }
}

/// Compress a response body per the negotiated `Accept-Encoding`, leaving
/// it untouched when nothing acceptable was offered. Bodies in this
/// registry are always whole-buffer (`Full<Bytes>`), so compression is a
/// collect-compress-rebuild rather than a streaming transform.
async fn apply_response_compression(
    resp: Response<BoxBody>,
    accept_encoding: Option<&str>,
) -> Response<BoxBody> {
    let Some(encoding) = negotiate_response_encoding(accept_encoding) else {
        return resp;
    };

    let (mut parts, body) = resp.into_parts();
    let Ok(collected) = body.collect().await else {
        return Response::from_parts(parts, empty_body());
    };
    let raw = collected.to_bytes();
    if raw.is_empty() {
        return Response::from_parts(parts, full_body(raw));
    }

    let compressed = match encode_response_body(encoding, &raw) {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, full_body(raw)),
    };

    parts.headers.remove(http::header::CONTENT_LENGTH);
    parts
        .headers
        .insert(http::header::CONTENT_ENCODING, encoding.as_str().parse().unwrap());
    parts.headers.insert(http::header::VARY, "Accept-Encoding".parse().unwrap());
    Response::from_parts(parts, full_body(compressed))
}

fn error_response(err: Error) -> Response<BoxBody> {
    match err {
        Error::Registry(e) => {
            let body = error_body(&e);
            Response::builder()
                .status(e.code().http_status())
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(full_body(Bytes::from(serde_json::to_vec(&body).unwrap_or_default())))
                .unwrap()
        }
        other => {
            log::error!("registry request failed: {other}");
            let body = serde_json::json!({
                "errors": [{ "code": "UNKNOWN", "message": other.to_string(), "detail": null }]
            });
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(full_body(Bytes::from(serde_json::to_vec(&body).unwrap_or_default())))
                .unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_locates_keyword_past_multi_segment_repo() {
        let parsed = parse_path("/v2/svc-a/sidecar/app/manifests/latest").unwrap();
        assert_eq!(parsed.repo, "svc-a/sidecar/app");
        assert!(matches!(parsed.op, Op::Manifests));
        assert_eq!(parsed.rest, vec!["latest".to_string()]);
    }

    #[test]
    fn parse_path_rejects_missing_repo() {
        assert!(parse_path("/v2/manifests/latest").is_none());
    }

    #[test]
    fn parse_path_handles_blob_uploads() {
        let parsed = parse_path("/v2/svc-a/app/blobs/uploads/abc-123").unwrap();
        assert_eq!(parsed.repo, "svc-a/app");
        assert!(matches!(parsed.op, Op::Blobs));
        assert_eq!(parsed.rest, vec!["uploads".to_string(), "abc-123".to_string()]);
    }

    #[test]
    fn tag_name_validation_rejects_arbitrary_tags() {
        assert!(!is_digest_reference("v1.2.3"));
    }
}
