use crate::storage::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

// ─── Entries ──────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct FileVersion {
    version_id: String,
    data: String,
    metadata: Map<String, Value>,
    origin: String,
    added_on: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct FileEntry {
    file_type: String,
    permissions: String,
    metadata: Map<String, Value>,
    versions: Vec<FileVersion>,
    next_version: u64,
    added_on: DateTime<Utc>,
}

impl FileEntry {
    fn is_directory(&self) -> bool {
        self.file_type == crate::types::DIRECTORY_FILE_TYPE
    }

    /// Latest version: last writer wins, which is exactly the semantics
    /// the parallel-join arbitration file relies on.
    fn latest(&self) -> Option<&FileVersion> {
        self.versions.last()
    }
}

struct Inner {
    files: BTreeMap<String, FileEntry>,
    /// `(file_path, permission_name)` pairs the test harness denies.
    denied: BTreeSet<(String, String)>,
}

/// In-memory implementation of [`StorageClient`] for POC/testing.
///
/// Versions are append-only; the latest version is the last one written
/// (strict last-write-wins). Access checks grant everything unless a
/// path/permission pair was explicitly denied via [`MemoryStorage::deny`].
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                files: BTreeMap::new(),
                denied: BTreeSet::new(),
            }),
        }
    }

    /// Deny a permission on a path for access-control tests.
    pub async fn deny(&self, file_path: &str, permission_name: &str) {
        let mut w = self.inner.write().await;
        w.denied
            .insert((file_path.to_string(), permission_name.to_string()));
    }

    /// Seed a file with a single version, bypassing the API surface.
    pub async fn seed_file(&self, file_path: &str, file_type: &str, data: &str) {
        let mut w = self.inner.write().await;
        let entry = w.files.entry(file_path.to_string()).or_insert(FileEntry {
            file_type: file_type.to_string(),
            permissions: "644".to_string(),
            metadata: Map::new(),
            versions: Vec::new(),
            next_version: 1,
            added_on: Utc::now(),
        });
        let version_id = entry.next_version.to_string();
        entry.next_version += 1;
        entry.versions.push(FileVersion {
            version_id,
            data: data.to_string(),
            metadata: Map::new(),
            origin: "internal".to_string(),
            added_on: Utc::now(),
        });
    }

    /// Seed a directory entry (working directories in tests).
    pub async fn seed_directory(&self, directory_path: &str) {
        let mut w = self.inner.write().await;
        w.files
            .entry(directory_path.to_string())
            .or_insert(FileEntry {
                file_type: crate::types::DIRECTORY_FILE_TYPE.to_string(),
                permissions: "755".to_string(),
                metadata: Map::new(),
                versions: Vec::new(),
                next_version: 1,
                added_on: Utc::now(),
            });
    }

    /// Latest data of a file, for test assertions.
    pub async fn latest_data(&self, file_path: &str) -> Option<String> {
        let r = self.inner.read().await;
        r.files
            .get(file_path)
            .and_then(|entry| entry.latest())
            .map(|version| version.data.clone())
    }

    pub async fn file_exists(&self, file_path: &str) -> bool {
        let r = self.inner.read().await;
        r.files.contains_key(file_path)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(file_path: &str) -> ApiResponse {
    ApiResponse::error(404, format!("file not found: {file_path}"))
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn describe_file(&self, _token: &str, request: DescribeFileRequest) -> Result<ApiResponse> {
        let r = self.inner.read().await;
        let Some(entry) = r.files.get(&request.file_path) else {
            return Ok(not_found(&request.file_path));
        };

        Ok(ApiResponse::new(
            200,
            json!({
                "file_path": request.file_path,
                "file_name": file_name(&request.file_path),
                "parent_directory": parent_directory(&request.file_path),
                "file_type": entry.file_type,
                "is_directory": entry.is_directory(),
                "permissions": entry.permissions,
                "owner": "system",
                "group": "system",
                "added_on": entry.added_on.to_rfc3339(),
                "metadata": entry.metadata,
            }),
        ))
    }

    async fn describe_file_version(
        &self,
        _token: &str,
        request: DescribeFileVersionRequest,
    ) -> Result<ApiResponse> {
        let r = self.inner.read().await;
        let Some(entry) = r.files.get(&request.file_path) else {
            return Ok(not_found(&request.file_path));
        };

        let version = match &request.version_id {
            Some(version_id) => entry.versions.iter().find(|v| &v.version_id == version_id),
            None => entry.latest(),
        };
        let Some(version) = version else {
            return Ok(not_found(&request.file_path));
        };

        Ok(ApiResponse::new(
            200,
            json!({
                "data": {
                    "file_path": request.file_path,
                    "version_id": version.version_id,
                    "origin": version.origin,
                    "added_on": version.added_on.to_rfc3339(),
                    "metadata": version.metadata,
                }
            }),
        ))
    }

    async fn get_file_version(
        &self,
        _token: &str,
        request: GetFileVersionRequest,
    ) -> Result<ApiResponse> {
        let r = self.inner.read().await;
        let Some(entry) = r.files.get(&request.file_path) else {
            return Ok(not_found(&request.file_path));
        };

        let version = match &request.version_id {
            Some(version_id) => entry.versions.iter().find(|v| &v.version_id == version_id),
            None => entry.latest(),
        };
        let Some(version) = version else {
            return Ok(not_found(&request.file_path));
        };

        Ok(ApiResponse::new(
            200,
            json!({
                "data": version.data,
                "details": {
                    "version_id": version.version_id,
                    "base_64_encoded": false,
                }
            }),
        ))
    }

    async fn put_file(&self, _token: &str, request: PutFileRequest) -> Result<ApiResponse> {
        let mut w = self.inner.write().await;
        let entry = w.files.entry(request.file_path.clone()).or_insert(FileEntry {
            file_type: request.file_type.clone(),
            permissions: "644".to_string(),
            metadata: Map::new(),
            versions: Vec::new(),
            next_version: 1,
            added_on: Utc::now(),
        });

        entry.file_type = request.file_type;
        if let Some(permissions) = request.permissions {
            entry.permissions = permissions;
        }
        if let Some(metadata) = request.metadata {
            entry.metadata = metadata;
        }

        Ok(ApiResponse::new(
            201,
            json!({"file_path": request.file_path}),
        ))
    }

    async fn put_file_version(
        &self,
        _token: &str,
        request: PutFileVersionRequest,
    ) -> Result<ApiResponse> {
        let mut w = self.inner.write().await;
        let Some(entry) = w.files.get_mut(&request.file_path) else {
            return Ok(not_found(&request.file_path));
        };

        let version_id = entry.next_version.to_string();
        entry.next_version += 1;
        entry.versions.push(FileVersion {
            version_id: version_id.clone(),
            data: request.data,
            metadata: request.metadata.unwrap_or_default(),
            origin: request.origin.unwrap_or_else(|| "internal".to_string()),
            added_on: Utc::now(),
        });

        Ok(ApiResponse::new(201, json!({"version_id": version_id})))
    }

    async fn validate_file_access(
        &self,
        _token: &str,
        request: ValidateFileAccessRequest,
    ) -> Result<ApiResponse> {
        let r = self.inner.read().await;
        if !r.files.contains_key(&request.file_path) {
            return Ok(not_found(&request.file_path));
        }

        let denied = request.requested_permission_names.iter().any(|permission| {
            r.denied
                .contains(&(request.file_path.clone(), permission.clone()))
        });

        Ok(ApiResponse::new(
            200,
            json!({"entity_has_access": !denied}),
        ))
    }

    async fn find_file(&self, _token: &str, request: FindFileRequest) -> Result<ApiResponse> {
        let r = self.inner.read().await;
        if !r.files.contains_key(&request.file_path) {
            return Ok(not_found(&request.file_path));
        }

        let prefix = if request.file_path == "/" {
            "/".to_string()
        } else {
            format!("{}/", request.file_path.trim_end_matches('/'))
        };

        let max_depth = request.recursion_max_depth.unwrap_or(1) as usize;
        let mut found = Vec::new();
        for (path, entry) in r.files.iter() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() || rest.matches('/').count() >= max_depth {
                continue;
            }
            found.push(json!({
                "file_path": path,
                "file_type": entry.file_type,
                "is_directory": entry.is_directory(),
            }));
        }

        Ok(ApiResponse::new(200, json!({"data": found})))
    }

    async fn list_file_versions(
        &self,
        _token: &str,
        request: ListFileVersionsRequest,
    ) -> Result<ApiResponse> {
        let r = self.inner.read().await;
        let Some(entry) = r.files.get(&request.file_path) else {
            return Ok(not_found(&request.file_path));
        };

        let versions: Vec<Value> = entry
            .versions
            .iter()
            .map(|version| {
                json!({
                    "file_path": request.file_path,
                    "version_id": version.version_id,
                    "origin": version.origin,
                    "added_on": version.added_on.to_rfc3339(),
                })
            })
            .collect();

        Ok(ApiResponse::new(200, json!({"data": versions})))
    }

    async fn delete_file(&self, _token: &str, request: DeleteFileRequest) -> Result<ApiResponse> {
        let mut w = self.inner.write().await;
        if w.files.remove(&request.file_path).is_none() {
            return Ok(not_found(&request.file_path));
        }
        Ok(ApiResponse::new(200, json!({"file_path": request.file_path})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_version_round_trip_last_write_wins() {
        let storage = MemoryStorage::new();

        storage
            .put_file(
                "tok",
                PutFileRequest {
                    file_path: "/work/note.txt".into(),
                    file_type: "ratio::file".into(),
                    metadata: None,
                    permissions: Some("644".into()),
                },
            )
            .await
            .unwrap();

        for data in ["one", "two"] {
            let response = storage
                .put_file_version(
                    "tok",
                    PutFileVersionRequest {
                        file_path: "/work/note.txt".into(),
                        data: data.into(),
                        metadata: None,
                        source_files: None,
                        origin: None,
                    },
                )
                .await
                .unwrap();
            assert_eq!(response.status_code, 201);
        }

        let latest = storage
            .get_file_version(
                "tok",
                GetFileVersionRequest {
                    file_path: "/work/note.txt".into(),
                    version_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(latest.data().unwrap(), "two");

        let first = storage
            .get_file_version(
                "tok",
                GetFileVersionRequest {
                    file_path: "/work/note.txt".into(),
                    version_id: Some("1".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(first.data().unwrap(), "one");
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let storage = MemoryStorage::new();
        let response = storage
            .get_file_version(
                "tok",
                GetFileVersionRequest {
                    file_path: "/nope".into(),
                    version_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(response.status_code, 404);

        let version_of_empty = storage
            .put_file_version(
                "tok",
                PutFileVersionRequest {
                    file_path: "/nope".into(),
                    data: "x".into(),
                    metadata: None,
                    source_files: None,
                    origin: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(version_of_empty.status_code, 404);
    }

    #[tokio::test]
    async fn test_access_validation_denial() {
        let storage = MemoryStorage::new();
        storage.seed_directory("/work").await;

        let allowed = storage
            .validate_file_access(
                "tok",
                ValidateFileAccessRequest {
                    file_path: "/work".into(),
                    requested_permission_names: vec!["read".into(), "write".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(allowed.body["entity_has_access"], json!(true));

        storage.deny("/work", "write").await;
        let denied = storage
            .validate_file_access(
                "tok",
                ValidateFileAccessRequest {
                    file_path: "/work".into(),
                    requested_permission_names: vec!["read".into(), "write".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(denied.body["entity_has_access"], json!(false));
    }

    #[tokio::test]
    async fn test_find_file_depth_one() {
        let storage = MemoryStorage::new();
        storage.seed_directory("/work").await;
        storage.seed_file("/work/a.txt", "ratio::file", "a").await;
        storage.seed_file("/work/sub/b.txt", "ratio::file", "b").await;

        let found = storage
            .find_file(
                "tok",
                FindFileRequest {
                    file_path: "/work".into(),
                    recursion_max_depth: Some(1),
                },
            )
            .await
            .unwrap();
        let listed: Vec<String> = found.data().unwrap().as_array().unwrap()
            .iter()
            .map(|f| f["file_path"].as_str().unwrap().to_string())
            .collect();
        assert!(listed.contains(&"/work/a.txt".to_string()));
        assert!(!listed.contains(&"/work/sub/b.txt".to_string()));
    }
}
