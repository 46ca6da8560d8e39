//! JSON-RPC 2.0 request/response envelopes and the `catch.*` method
//! dispatch table served on `/rpc`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::catalog::model::{ArtifactName, ServiceKind};
use crate::catalog::store::CatalogStore;
use crate::errors::{Error, Result};

/// Standard JSON-RPC 2.0 error codes this server can produce.
pub mod error_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent ⇒ notification: dispatch runs but no response is sent.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        RpcResponse {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        RpcResponse {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

fn error_to_jsonrpc(err: Error) -> (i64, String) {
    let code = if err.is_not_found() {
        error_code::INVALID_PARAMS
    } else {
        match &err {
            Error::InvalidInput(_) => error_code::INVALID_PARAMS,
            _ => error_code::INTERNAL_ERROR,
        }
    };
    (code, err.to_string())
}

/// Parse a raw JSON-RPC request body (may be malformed) and dispatch it.
/// Returns `None` for notifications (no `id`), which must not be written
/// back to the caller.
pub async fn handle_request(catalog: &CatalogStore, raw: &[u8]) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_slice(raw) {
        Ok(r) => r,
        Err(e) => {
            return Some(RpcResponse::err(
                Value::Null,
                error_code::PARSE_ERROR,
                format!("invalid JSON: {e}"),
            ))
        }
    };

    let id = request.id.clone();
    let result = dispatch(catalog, &request.method, request.params).await;

    let id = match id {
        Some(id) => id,
        None => return None, // notification: caller gets no response
    };

    match result {
        Ok(value) => Some(RpcResponse::ok(id, value)),
        Err(DispatchError::MethodNotFound) => Some(RpcResponse::err(
            id,
            error_code::METHOD_NOT_FOUND,
            format!("method not found: {}", request.method),
        )),
        Err(DispatchError::InvalidParams(msg)) => {
            Some(RpcResponse::err(id, error_code::INVALID_PARAMS, msg))
        }
        Err(DispatchError::Core(err)) => {
            let (code, message) = error_to_jsonrpc(err);
            Some(RpcResponse::err(id, code, message))
        }
    }
}

enum DispatchError {
    MethodNotFound,
    InvalidParams(String),
    Core(Error),
}

impl From<Error> for DispatchError {
    fn from(e: Error) -> Self {
        DispatchError::Core(e)
    }
}

async fn dispatch(catalog: &CatalogStore, method: &str, params: Value) -> std::result::Result<Value, DispatchError> {
    match method {
        "catch.Info" => Ok(serde_json::to_value(info()).unwrap()),
        "catch.ServicesList" => Ok(serde_json::to_value(services_list(catalog).await).unwrap()),
        "catch.ServiceInfo" => {
            let service = param_service(&params)?;
            let info = service_info(catalog, &service).await?;
            Ok(serde_json::to_value(info).unwrap())
        }
        "catch.ArtifactHashes" => {
            let service = param_service(&params)?;
            let hashes = artifact_hashes(catalog, &service).await?;
            Ok(serde_json::to_value(hashes).unwrap())
        }
        _ => Err(DispatchError::MethodNotFound),
    }
}

fn param_service(params: &Value) -> std::result::Result<String, DispatchError> {
    params
        .get("service")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DispatchError::InvalidParams("missing required param 'service'".into()))
}

#[derive(Serialize)]
struct InfoResult {
    version: &'static str,
    target: &'static str,
    profile: &'static str,
}

fn info() -> InfoResult {
    InfoResult {
        version: crate::BUILD_INFO.version,
        target: crate::BUILD_INFO.target,
        profile: crate::BUILD_INFO.profile,
    }
}

#[derive(Serialize)]
struct ServiceSummary {
    name: String,
    kind: ServiceKind,
    latest_generation: u64,
    current_generation: u64,
}

async fn services_list(catalog: &CatalogStore) -> Vec<ServiceSummary> {
    let snapshot = catalog.get().await;
    snapshot
        .services
        .values()
        .map(|s| ServiceSummary {
            name: s.name.clone(),
            kind: s.kind,
            latest_generation: s.latest_generation,
            current_generation: s.current_generation,
        })
        .collect()
}

#[derive(Serialize)]
struct ServiceInfoResult {
    name: String,
    kind: ServiceKind,
    latest_generation: u64,
    current_generation: u64,
    user: String,
    artifacts: BTreeMap<String, BTreeMap<String, String>>,
}

async fn service_info(catalog: &CatalogStore, service: &str) -> Result<ServiceInfoResult> {
    let snapshot = catalog.get().await;
    let svc = snapshot
        .services
        .get(service)
        .ok_or_else(|| Error::ServiceNotFound {
            name: service.to_string(),
        })?;
    let artifacts = svc
        .artifacts
        .iter()
        .map(|(name, artifact)| (format!("{name:?}"), artifact.refs.clone()))
        .collect();
    Ok(ServiceInfoResult {
        name: svc.name.clone(),
        kind: svc.kind,
        latest_generation: svc.latest_generation,
        current_generation: svc.current_generation,
        user: svc.user.clone(),
        artifacts,
    })
}

/// sha256 of every artifact ref's backing file, for integrity verification
/// by a caller comparing against its own build output.
async fn artifact_hashes(catalog: &CatalogStore, service: &str) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
    let snapshot = catalog.get().await;
    let svc = snapshot
        .services
        .get(service)
        .ok_or_else(|| Error::ServiceNotFound {
            name: service.to_string(),
        })?;

    let mut out: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (name, artifact) in &svc.artifacts {
        let mut refs = BTreeMap::new();
        for (ref_name, path) in &artifact.refs {
            if let Ok(bytes) = tokio::fs::read(path).await {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                refs.insert(ref_name.clone(), format!("sha256:{:x}", hasher.finalize()));
            }
        }
        if !refs.is_empty() {
            out.insert(artifact_name_key(*name), refs);
        }
    }
    Ok(out)
}

fn artifact_name_key(name: ArtifactName) -> String {
    format!("{name:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogStore::open(dir.path().join("db.json")).await.unwrap();
        let resp = handle_request(&catalog, br#"{"jsonrpc":"2.0","method":"catch.Nope","id":1}"#)
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, error_code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notification_without_id_yields_no_response() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogStore::open(dir.path().join("db.json")).await.unwrap();
        let resp = handle_request(&catalog, br#"{"jsonrpc":"2.0","method":"catch.Info"}"#).await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn info_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogStore::open(dir.path().join("db.json")).await.unwrap();
        let resp = handle_request(&catalog, br#"{"jsonrpc":"2.0","method":"catch.Info","id":1}"#)
            .await
            .unwrap();
        assert!(resp.error.is_none());
        assert!(resp.result.unwrap().get("version").is_some());
    }

    #[tokio::test]
    async fn service_info_missing_param_is_invalid_params() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogStore::open(dir.path().join("db.json")).await.unwrap();
        let resp = handle_request(
            &catalog,
            br#"{"jsonrpc":"2.0","method":"catch.ServiceInfo","params":{},"id":1}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, error_code::INVALID_PARAMS);
    }
}
