use crate::error::{EngineError, EngineResult};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

// ─── Envelope ─────────────────────────────────────────────────

/// HTTP-style envelope every storage endpoint returns:
/// 200/201 success, 404 not found, 403 unauthorized. Error bodies carry
/// `{message}`.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status_code: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status_code: u16, body: Value) -> Self {
        Self { status_code, body }
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            body: serde_json::json!({ "message": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status_code, 200 | 201)
    }

    pub fn message(&self) -> String {
        self.body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// The `data` field of a success body, when present.
    pub fn data(&self) -> Option<&Value> {
        self.body.get("data")
    }
}

// ─── Request bodies ───────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DescribeFileRequest {
    pub file_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DescribeFileVersionRequest {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetFileVersionRequest {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutFileRequest {
    pub file_path: String,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutFileVersionRequest {
    pub file_path: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_files: Option<Vec<String>>,
    /// `internal` or `external`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidateFileAccessRequest {
    pub file_path: String,
    pub requested_permission_names: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindFileRequest {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recursion_max_depth: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListFileVersionsRequest {
    pub file_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteFileRequest {
    pub file_path: String,
}

// ─── Collaborator trait ───────────────────────────────────────

/// The storage collaborator. The core only consumes this interface; the
/// real backend lives in another service and authenticates every request
/// with the JWT passed as `token` (the `x-ratio-authorization` header on
/// the wire).
///
/// `Err` means transport failure. Service-level failures come back as
/// non-2xx [`ApiResponse`]s so callers can branch on 404 vs 403.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn describe_file(&self, token: &str, request: DescribeFileRequest) -> Result<ApiResponse>;

    async fn describe_file_version(
        &self,
        token: &str,
        request: DescribeFileVersionRequest,
    ) -> Result<ApiResponse>;

    async fn get_file_version(&self, token: &str, request: GetFileVersionRequest)
        -> Result<ApiResponse>;

    async fn put_file(&self, token: &str, request: PutFileRequest) -> Result<ApiResponse>;

    async fn put_file_version(
        &self,
        token: &str,
        request: PutFileVersionRequest,
    ) -> Result<ApiResponse>;

    async fn validate_file_access(
        &self,
        token: &str,
        request: ValidateFileAccessRequest,
    ) -> Result<ApiResponse>;

    async fn find_file(&self, token: &str, request: FindFileRequest) -> Result<ApiResponse>;

    async fn list_file_versions(
        &self,
        token: &str,
        request: ListFileVersionsRequest,
    ) -> Result<ApiResponse>;

    async fn delete_file(&self, token: &str, request: DeleteFileRequest) -> Result<ApiResponse>;
}

// ─── Path helpers ─────────────────────────────────────────────

// Storage paths are `/`-separated and absolute; these helpers are not OS
// path operations.

pub fn join_path(base: &str, leaf: &str) -> String {
    if base == "/" {
        format!("/{leaf}")
    } else {
        format!("{}/{leaf}", base.trim_end_matches('/'))
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn parent_directory(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

// ─── Call helpers ─────────────────────────────────────────────

/// Fetch the latest version of a file and return its raw data string.
pub async fn fetch_file_data(
    storage: &Arc<dyn StorageClient>,
    token: &str,
    file_path: &str,
) -> EngineResult<String> {
    let response = storage
        .get_file_version(
            token,
            GetFileVersionRequest {
                file_path: file_path.to_string(),
                version_id: None,
            },
        )
        .await?;

    if response.status_code != 200 {
        return Err(EngineError::Other(anyhow::anyhow!(
            "unable to load file {file_path}: {} - {}",
            response.status_code,
            response.message()
        )));
    }

    let data = response
        .data()
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Other(anyhow::anyhow!("file {file_path} has no data field")))?;

    Ok(data.to_string())
}

/// Fetch a file and parse its content as JSON.
pub async fn fetch_json(
    storage: &Arc<dyn StorageClient>,
    token: &str,
    file_path: &str,
) -> EngineResult<Value> {
    let data = fetch_file_data(storage, token, file_path).await?;
    serde_json::from_str(&data).map_err(|err| {
        EngineError::Other(anyhow::anyhow!("file {file_path} is not valid JSON: {err}"))
    })
}

/// Create a file entry and write its first/next version. Non-2xx from
/// either call is a [`EngineError::FileCreationFailure`].
pub async fn write_file(
    storage: &Arc<dyn StorageClient>,
    token: &str,
    file_path: &str,
    file_type: &str,
    permissions: &str,
    metadata: Option<Map<String, Value>>,
    data: &str,
) -> EngineResult<()> {
    let response = storage
        .put_file(
            token,
            PutFileRequest {
                file_path: file_path.to_string(),
                file_type: file_type.to_string(),
                metadata,
                permissions: Some(permissions.to_string()),
            },
        )
        .await?;

    if !response.is_success() {
        return Err(EngineError::FileCreationFailure {
            path: file_path.to_string(),
            reason: format!(
                "unexpected response code: {} - {}",
                response.status_code,
                response.message()
            ),
        });
    }

    let response = storage
        .put_file_version(
            token,
            PutFileVersionRequest {
                file_path: file_path.to_string(),
                data: data.to_string(),
                metadata: None,
                source_files: None,
                origin: Some("internal".to_string()),
            },
        )
        .await?;

    if !response.is_success() {
        return Err(EngineError::FileCreationFailure {
            path: file_path.to_string(),
            reason: format!(
                "unexpected response code: {} - {}",
                response.status_code,
                response.message()
            ),
        });
    }

    Ok(())
}

/// Make sure a directory exists, creating it when storage reports 404.
pub async fn ensure_directory(
    storage: &Arc<dyn StorageClient>,
    token: &str,
    directory_path: &str,
) -> EngineResult<()> {
    let response = storage
        .describe_file(
            token,
            DescribeFileRequest {
                file_path: directory_path.to_string(),
            },
        )
        .await?;

    match response.status_code {
        200 => Ok(()),
        404 => {
            let created = storage
                .put_file(
                    token,
                    PutFileRequest {
                        file_path: directory_path.to_string(),
                        file_type: crate::types::DIRECTORY_FILE_TYPE.to_string(),
                        metadata: None,
                        permissions: Some("755".to_string()),
                    },
                )
                .await?;

            if created.is_success() {
                Ok(())
            } else {
                Err(EngineError::FileCreationFailure {
                    path: directory_path.to_string(),
                    reason: format!(
                        "unexpected response code: {} - {}",
                        created.status_code,
                        created.message()
                    ),
                })
            }
        }
        other => Err(EngineError::FileCreationFailure {
            path: directory_path.to_string(),
            reason: format!("unexpected response code: {other} - {}", response.message()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/work", "arguments.aio"), "/work/arguments.aio");
        assert_eq!(join_path("/work/", "x"), "/work/x");
        assert_eq!(join_path("/", "x"), "/x");
    }

    #[test]
    fn test_parent_directory_of_top_level_file() {
        assert_eq!(parent_directory("/a"), "/");
        assert_eq!(parent_directory("/a/b/c"), "/a/b");
        assert_eq!(file_name("/a/b/c.aio"), "c.aio");
    }
}
