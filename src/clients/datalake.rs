//! Data lake clients: file systems, paths and recursive access control.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::StorageClient;
use crate::acl::{
    change_access_control_recursive, to_acl_string, to_remove_acl_string,
    AccessControlChangeCounters, AccessControlChangeFailure, AccessControlChangeResult,
    AclBatchRequest, AclBatchResponse, AclBatchTarget, AclChangeMode, AclOptions,
    PathAccessControlItem, RemovePathAccessControlItem,
};
use crate::errors::{Result, StorageError};
use crate::operations::{validate_resource_name, Operation, PathResource};
use crate::request::ResponseMeta;
use crate::transfer::{self, Chunk, TransferOptions, UploadTarget};

// -- FileSystemClient ---------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FileSystemClient {
    client: StorageClient,
    name: String,
}

impl FileSystemClient {
    pub fn new(client: StorageClient, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self, path: &str) -> PathClient {
        PathClient {
            client: self.client.clone(),
            file_system: self.name.clone(),
            path: path.trim_start_matches('/').to_string(),
        }
    }

    pub async fn create(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        validate_resource_name("file system", &self.name)?;
        let op = Operation::CreateFileSystem {
            file_system: self.name.clone(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    pub async fn delete(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        let op = Operation::DeleteFileSystem {
            file_system: self.name.clone(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }
}

// -- PathClient ---------------------------------------------------------------

/// A file or directory inside a file system.
#[derive(Debug, Clone)]
pub struct PathClient {
    client: StorageClient,
    file_system: String,
    path: String,
}

impl PathClient {
    pub fn file_system_name(&self) -> &str {
        &self.file_system
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn create(&self, resource: PathResource, cancel: &CancellationToken) -> Result<ResponseMeta> {
        let op = Operation::CreatePath {
            file_system: self.file_system.clone(),
            path: self.path.clone(),
            resource,
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    /// Create (or truncate) an empty file.
    pub async fn create_file(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        self.create(PathResource::File, cancel).await
    }

    pub async fn create_directory(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        self.create(PathResource::Directory, cancel).await
    }

    /// Append uncommitted data at `position`.
    pub async fn append(
        &self,
        position: u64,
        body: Bytes,
        transactional_md5: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let op = Operation::AppendData {
            file_system: self.file_system.clone(),
            path: self.path.clone(),
            position,
            body,
            transactional_md5,
        };
        self.client.execute(&op, cancel).await?;
        Ok(())
    }

    /// Commit appended data up to `position`, the final file length.
    pub async fn flush(&self, position: u64, cancel: &CancellationToken) -> Result<ResponseMeta> {
        let op = Operation::FlushData {
            file_system: self.file_system.clone(),
            path: self.path.clone(),
            position,
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    /// Create the file and upload `data` into it.
    pub async fn upload_buffer(
        &self,
        data: Bytes,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.create_file(cancel).await?;
        let target = FileUpload {
            path: self,
            transactional_md5: options.transactional_md5,
        };
        transfer::upload_buffer(&target, data, options, cancel).await
    }

    /// Create the file and upload the local file at `source` into it.
    pub async fn upload_file(
        &self,
        source: &Path,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.create_file(cancel).await?;
        let target = FileUpload {
            path: self,
            transactional_md5: options.transactional_md5,
        };
        transfer::upload_file(&target, source, options, cancel).await
    }

    // -- Recursive access control ---------------------------------------------

    /// Replace the ACL of this path and everything below it.
    pub async fn set_access_control_recursive(
        &self,
        acl: &[PathAccessControlItem],
        options: &AclOptions,
        cancel: &CancellationToken,
    ) -> Result<AccessControlChangeResult> {
        change_access_control_recursive(self, AclChangeMode::Set, &to_acl_string(acl), options, cancel)
            .await
    }

    /// Add or update the given entries below this path.
    pub async fn update_access_control_recursive(
        &self,
        acl: &[PathAccessControlItem],
        options: &AclOptions,
        cancel: &CancellationToken,
    ) -> Result<AccessControlChangeResult> {
        change_access_control_recursive(
            self,
            AclChangeMode::Modify,
            &to_acl_string(acl),
            options,
            cancel,
        )
        .await
    }

    /// Remove the given entries below this path.
    pub async fn remove_access_control_recursive(
        &self,
        acl: &[RemovePathAccessControlItem],
        options: &AclOptions,
        cancel: &CancellationToken,
    ) -> Result<AccessControlChangeResult> {
        change_access_control_recursive(
            self,
            AclChangeMode::Remove,
            &to_remove_acl_string(acl),
            options,
            cancel,
        )
        .await
    }
}

/// Body of a setAccessControlRecursive response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AclBatchBody {
    directories_successful: u64,
    files_successful: u64,
    failure_count: u64,
    failed_entries: Vec<FailedEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FailedEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    error_message: String,
}

fn parse_acl_batch_body(body: &[u8]) -> Result<AclBatchBody> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(AclBatchBody::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        StorageError::Internal(anyhow::anyhow!(
            "invalid setAccessControlRecursive response: {}",
            e
        ))
    })
}

impl AclBatchTarget for PathClient {
    fn apply_batch<'a>(
        &'a self,
        batch: AclBatchRequest<'a>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<AclBatchResponse>> + Send + 'a>> {
        Box::pin(async move {
            let op = Operation::SetAccessControlRecursive {
                file_system: self.file_system.clone(),
                path: self.path.clone(),
                mode: batch.mode,
                acl: batch.acl.to_string(),
                max_records: batch.batch_size,
                continuation: batch.continuation.map(str::to_string),
                force_flag: batch.force_flag,
            };
            let response = self.client.execute(&op, cancel).await?;
            let continuation = response.meta().continuation;
            let body = parse_acl_batch_body(&response.bytes().await?)?;

            Ok(AclBatchResponse {
                counters: AccessControlChangeCounters {
                    changed_directories_count: body.directories_successful,
                    changed_files_count: body.files_successful,
                    failed_changes_count: body.failure_count,
                },
                failures: body
                    .failed_entries
                    .into_iter()
                    .map(|e| AccessControlChangeFailure {
                        is_directory: e.kind.eq_ignore_ascii_case("directory"),
                        name: e.name,
                        error_message: e.error_message,
                    })
                    .collect(),
                continuation,
            })
        })
    }
}

/// Upload into a created file: chunks append at their offset, and a single
/// flush at the total length commits them.
struct FileUpload<'a> {
    path: &'a PathClient,
    transactional_md5: bool,
}

impl UploadTarget for FileUpload<'_> {
    fn upload_single<'a>(
        &'a self,
        data: Bytes,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let total = data.len() as u64;
            if total > 0 {
                self.path
                    .append(0, data, self.transactional_md5, cancel)
                    .await?;
            }
            self.path.flush(total, cancel).await?;
            Ok(())
        })
    }

    fn stage_chunk<'a>(
        &'a self,
        chunk: Chunk,
        data: Bytes,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.path
                .append(chunk.offset, data, self.transactional_md5, cancel)
                .await
        })
    }

    fn commit<'a>(
        &'a self,
        _chunks: &'a [Chunk],
        total: u64,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            debug!(
                "flushing {} bytes to {}/{}",
                total, self.path.file_system, self.path.path
            );
            self.path.flush(total, cancel).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::parse_acl;
    use crate::clients::ServiceEndpoints;
    use crate::credentials::Credential;
    use crate::pipeline::test_support::{Scripted, ScriptedTransport};
    use crate::pipeline::{new_pipeline, PipelineOptions, RetryOptions};
    use http::Method;
    use std::sync::{Arc, Mutex};

    fn client(transport: Arc<ScriptedTransport>) -> StorageClient {
        let options = PipelineOptions {
            retry: RetryOptions {
                max_tries: 1,
                ..RetryOptions::default()
            },
            http_client: Some(transport),
            ..PipelineOptions::default()
        };
        let pipeline = new_pipeline(Credential::Anonymous, options).unwrap();
        let endpoints = ServiceEndpoints::for_account("acct", "https", "core.windows.net").unwrap();
        StorageClient::new(Arc::new(pipeline), endpoints)
    }

    #[tokio::test]
    async fn test_recursive_acl_batches_follow_continuation() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Full(
                200,
                vec![("x-ms-continuation", "tok-1")],
                r#"{"directoriesSuccessful":1,"filesSuccessful":2,"failureCount":1,"failedEntries":[{"errorMessage":"denied","name":"dir/x","type":"FILE"}]}"#,
            ),
            Scripted::StatusWithBody(
                200,
                r#"{"directoriesSuccessful":0,"filesSuccessful":3,"failureCount":0,"failedEntries":[]}"#,
            ),
        ]));
        let path = client(transport.clone()).file_system("fs").path("dir");
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let options = AclOptions {
            batch_size: Some(2),
            on_progress: Some(Arc::new(move |changes: &crate::acl::AccessControlChanges| {
                sink.lock()
                    .unwrap()
                    .extend(changes.batch_failures.iter().cloned());
            })),
            ..AclOptions::default()
        };
        let acl = parse_acl("user::rwx,group::r-x,other::---").unwrap();
        let result = path
            .set_access_control_recursive(&acl, &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.counters.changed_directories_count, 1);
        assert_eq!(result.counters.changed_files_count, 5);
        assert_eq!(result.counters.failed_changes_count, 1);
        assert_eq!(result.continuation_token, None);

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "dir/x");
        assert!(!failures[0].is_directory);

        let seen = transport.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method, Method::PATCH);
        assert_eq!(seen[0].header("x-ms-acl"), Some("user::rwx,group::r-x,other::---"));
        assert!(!seen[0].url.query().unwrap().contains("continuation"));
        assert!(seen[1].url.query().unwrap().contains("continuation=tok-1"));
        assert!(seen[1].url.query().unwrap().contains("maxRecords=2"));
    }

    #[tokio::test]
    async fn test_recursive_acl_service_failure_is_resumable() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Full(
                200,
                vec![("x-ms-continuation", "tok-1")],
                r#"{"directoriesSuccessful":1,"filesSuccessful":0,"failureCount":0}"#,
            ),
            Scripted::Full(403, vec![("x-ms-error-code", "AuthorizationPermissionMismatch")], ""),
        ]));
        let path = client(transport).file_system("fs").path("dir");
        let remove = vec!["user:oid".parse::<RemovePathAccessControlItem>().unwrap()];
        let err = path
            .remove_access_control_recursive(&remove, &AclOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            StorageError::AclChangeFailed {
                source,
                continuation_token,
            } => {
                assert_eq!(source.code(), "AuthorizationPermissionMismatch");
                assert_eq!(continuation_token.as_deref(), Some("tok-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_file_upload_appends_then_flushes() {
        let transport = Arc::new(ScriptedTransport::default());
        let path = client(transport.clone()).file_system("fs").path("/logs/a.txt");
        let options = TransferOptions {
            chunk_size: 4,
            single_shot_threshold: 4,
            max_concurrency: 1,
            ..TransferOptions::default()
        };
        path.upload_buffer(Bytes::from_static(b"0123456789"), &options, &CancellationToken::new())
            .await
            .unwrap();

        let seen = transport.requests();
        let queries: Vec<String> = seen
            .iter()
            .map(|r| r.url.query().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            queries,
            vec![
                "resource=file",
                "action=append&position=0",
                "action=append&position=4",
                "action=append&position=8",
                "action=flush&position=10",
            ]
        );
        assert_eq!(seen[0].url.path(), "/fs/logs/a.txt");
    }

    #[tokio::test]
    async fn test_empty_file_upload_only_flushes() {
        let transport = Arc::new(ScriptedTransport::default());
        client(transport.clone())
            .file_system("fs")
            .path("empty")
            .upload_buffer(Bytes::new(), &TransferOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let seen = transport.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].url.query(), Some("action=flush&position=0"));
    }

    #[test]
    fn test_parse_empty_acl_body() {
        let body = parse_acl_batch_body(b"").unwrap();
        assert_eq!(body.files_successful, 0);
        assert!(parse_acl_batch_body(b"not json").is_err());
    }
}
