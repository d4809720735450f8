//! Typed operation descriptors.
//!
//! Every REST call the client makes is one [`Operation`] variant.  An
//! operation knows which service endpoint it targets and how to render
//! itself into a [`Request`]: method, percent-encoded path, query and
//! operation-specific headers.  Signing, retries and request ids are added
//! later by the pipeline.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::Method;
use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;

use crate::acl::AclChangeMode;
use crate::errors::{Result, StorageError};
use crate::request::{ByteRange, Request, X_MS_RANGE, X_MS_VERSION};
use crate::xml;

/// REST API version sent on every request.
pub const SERVICE_VERSION: &str = "2020-02-10";

/// Percent-encoding set for blob and path names: encode everything except
/// unreserved characters and '/'.
const PATH_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Percent-encoding set for query values: unreserved characters only.
const QUERY_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Which endpoint an operation is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Blob,
    Dfs,
    Queue,
}

/// Data lake path resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathResource {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub enum Operation {
    // -- Blob -----------------------------------------------------------------
    CreateContainer {
        container: String,
    },
    DeleteContainer {
        container: String,
    },
    ListBlobs {
        container: String,
        prefix: Option<String>,
        marker: Option<String>,
        max_results: Option<u32>,
    },
    PutBlob {
        container: String,
        blob: String,
        body: Bytes,
        content_type: Option<String>,
    },
    GetBlob {
        container: String,
        blob: String,
        range: Option<ByteRange>,
    },
    GetBlobProperties {
        container: String,
        blob: String,
    },
    DeleteBlob {
        container: String,
        blob: String,
    },
    StageBlock {
        container: String,
        blob: String,
        block_id: String,
        body: Bytes,
        transactional_md5: bool,
    },
    CommitBlockList {
        container: String,
        blob: String,
        block_ids: Vec<String>,
        content_type: Option<String>,
    },

    // -- Data lake ------------------------------------------------------------
    CreateFileSystem {
        file_system: String,
    },
    DeleteFileSystem {
        file_system: String,
    },
    CreatePath {
        file_system: String,
        path: String,
        resource: PathResource,
    },
    AppendData {
        file_system: String,
        path: String,
        position: u64,
        body: Bytes,
        transactional_md5: bool,
    },
    FlushData {
        file_system: String,
        path: String,
        position: u64,
    },
    SetAccessControlRecursive {
        file_system: String,
        path: String,
        mode: AclChangeMode,
        acl: String,
        max_records: Option<u32>,
        continuation: Option<String>,
        force_flag: bool,
    },

    // -- Queue ----------------------------------------------------------------
    CreateQueue {
        queue: String,
    },
    DeleteQueue {
        queue: String,
    },
    PutMessage {
        queue: String,
        text: String,
    },
    ClearMessages {
        queue: String,
    },
}

/// Base64 MD5 digest, as sent in `Content-MD5`.
pub fn content_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    BASE64_STANDARD.encode(hasher.finalize())
}

impl Operation {
    /// Stable operation name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateContainer { .. } => "CreateContainer",
            Operation::DeleteContainer { .. } => "DeleteContainer",
            Operation::ListBlobs { .. } => "ListBlobs",
            Operation::PutBlob { .. } => "PutBlob",
            Operation::GetBlob { .. } => "GetBlob",
            Operation::GetBlobProperties { .. } => "GetBlobProperties",
            Operation::DeleteBlob { .. } => "DeleteBlob",
            Operation::StageBlock { .. } => "StageBlock",
            Operation::CommitBlockList { .. } => "CommitBlockList",
            Operation::CreateFileSystem { .. } => "CreateFileSystem",
            Operation::DeleteFileSystem { .. } => "DeleteFileSystem",
            Operation::CreatePath { .. } => "CreatePath",
            Operation::AppendData { .. } => "AppendData",
            Operation::FlushData { .. } => "FlushData",
            Operation::SetAccessControlRecursive { .. } => "SetAccessControlRecursive",
            Operation::CreateQueue { .. } => "CreateQueue",
            Operation::DeleteQueue { .. } => "DeleteQueue",
            Operation::PutMessage { .. } => "PutMessage",
            Operation::ClearMessages { .. } => "ClearMessages",
        }
    }

    pub fn service(&self) -> Service {
        match self {
            Operation::CreateContainer { .. }
            | Operation::DeleteContainer { .. }
            | Operation::ListBlobs { .. }
            | Operation::PutBlob { .. }
            | Operation::GetBlob { .. }
            | Operation::GetBlobProperties { .. }
            | Operation::DeleteBlob { .. }
            | Operation::StageBlock { .. }
            | Operation::CommitBlockList { .. } => Service::Blob,
            Operation::CreateFileSystem { .. }
            | Operation::DeleteFileSystem { .. }
            | Operation::CreatePath { .. }
            | Operation::AppendData { .. }
            | Operation::FlushData { .. }
            | Operation::SetAccessControlRecursive { .. } => Service::Dfs,
            Operation::CreateQueue { .. }
            | Operation::DeleteQueue { .. }
            | Operation::PutMessage { .. }
            | Operation::ClearMessages { .. } => Service::Queue,
        }
    }

    /// Render into a request against `endpoint` (the service root URL).
    pub fn to_request(&self, endpoint: &Url) -> Result<Request> {
        let mut query: Vec<(&str, String)> = Vec::new();
        let mut headers: Vec<(&str, String)> = Vec::new();
        let mut body = Bytes::new();

        let (method, path) = match self {
            Operation::CreateContainer { container } => {
                query.push(("restype", "container".into()));
                (Method::PUT, resource_path(&[container]))
            }
            Operation::DeleteContainer { container } => {
                query.push(("restype", "container".into()));
                (Method::DELETE, resource_path(&[container]))
            }
            Operation::ListBlobs {
                container,
                prefix,
                marker,
                max_results,
            } => {
                query.push(("restype", "container".into()));
                query.push(("comp", "list".into()));
                if let Some(p) = prefix {
                    query.push(("prefix", p.clone()));
                }
                if let Some(m) = marker {
                    query.push(("marker", m.clone()));
                }
                if let Some(n) = max_results {
                    query.push(("maxresults", n.to_string()));
                }
                (Method::GET, resource_path(&[container]))
            }
            Operation::PutBlob {
                container,
                blob,
                body: data,
                content_type,
            } => {
                headers.push(("x-ms-blob-type", "BlockBlob".into()));
                headers.push((
                    "content-type",
                    content_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".into()),
                ));
                body = data.clone();
                (Method::PUT, resource_path(&[container, blob]))
            }
            Operation::GetBlob {
                container,
                blob,
                range,
            } => {
                if let Some(r) = range {
                    headers.push((X_MS_RANGE, r.to_header_value()));
                }
                (Method::GET, resource_path(&[container, blob]))
            }
            Operation::GetBlobProperties { container, blob } => {
                (Method::HEAD, resource_path(&[container, blob]))
            }
            Operation::DeleteBlob { container, blob } => {
                (Method::DELETE, resource_path(&[container, blob]))
            }
            Operation::StageBlock {
                container,
                blob,
                block_id,
                body: data,
                transactional_md5,
            } => {
                query.push(("comp", "block".into()));
                query.push(("blockid", block_id.clone()));
                headers.push(("content-type", "application/octet-stream".into()));
                if *transactional_md5 {
                    headers.push(("content-md5", content_md5(data)));
                }
                body = data.clone();
                (Method::PUT, resource_path(&[container, blob]))
            }
            Operation::CommitBlockList {
                container,
                blob,
                block_ids,
                content_type,
            } => {
                query.push(("comp", "blocklist".into()));
                headers.push(("content-type", "application/xml".into()));
                if let Some(ct) = content_type {
                    headers.push(("x-ms-blob-content-type", ct.clone()));
                }
                body = Bytes::from(xml::render_block_list(block_ids)?);
                (Method::PUT, resource_path(&[container, blob]))
            }
            Operation::CreateFileSystem { file_system } => {
                query.push(("resource", "filesystem".into()));
                (Method::PUT, resource_path(&[file_system]))
            }
            Operation::DeleteFileSystem { file_system } => {
                query.push(("resource", "filesystem".into()));
                (Method::DELETE, resource_path(&[file_system]))
            }
            Operation::CreatePath {
                file_system,
                path,
                resource,
            } => {
                let kind = match resource {
                    PathResource::File => "file",
                    PathResource::Directory => "directory",
                };
                query.push(("resource", kind.into()));
                (Method::PUT, resource_path(&[file_system, path]))
            }
            Operation::AppendData {
                file_system,
                path,
                position,
                body: data,
                transactional_md5,
            } => {
                query.push(("action", "append".into()));
                query.push(("position", position.to_string()));
                if *transactional_md5 {
                    headers.push(("content-md5", content_md5(data)));
                }
                body = data.clone();
                (Method::PATCH, resource_path(&[file_system, path]))
            }
            Operation::FlushData {
                file_system,
                path,
                position,
            } => {
                query.push(("action", "flush".into()));
                query.push(("position", position.to_string()));
                (Method::PATCH, resource_path(&[file_system, path]))
            }
            Operation::SetAccessControlRecursive {
                file_system,
                path,
                mode,
                acl,
                max_records,
                continuation,
                force_flag,
            } => {
                query.push(("action", "setAccessControlRecursive".into()));
                query.push(("mode", mode.as_str().into()));
                if let Some(n) = max_records {
                    query.push(("maxRecords", n.to_string()));
                }
                if let Some(c) = continuation {
                    query.push(("continuation", c.clone()));
                }
                if *force_flag {
                    query.push(("forceFlag", "true".into()));
                }
                headers.push(("x-ms-acl", acl.clone()));
                (Method::PATCH, resource_path(&[file_system, path]))
            }
            Operation::CreateQueue { queue } => (Method::PUT, resource_path(&[queue])),
            Operation::DeleteQueue { queue } => (Method::DELETE, resource_path(&[queue])),
            Operation::PutMessage { queue, text } => {
                headers.push(("content-type", "application/xml".into()));
                body = Bytes::from(xml::render_queue_message(text)?);
                (Method::POST, format!("{}/messages", resource_path(&[queue])))
            }
            Operation::ClearMessages { queue } => {
                (Method::DELETE, format!("{}/messages", resource_path(&[queue])))
            }
        };

        let mut url = endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", base, path));
        if query.is_empty() {
            url.set_query(None);
        } else {
            let rendered: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, &QUERY_ENCODE_SET)))
                .collect();
            url.set_query(Some(&rendered.join("&")));
        }

        let mut request = Request::new(method, url).with_body(body);
        request.set_header(X_MS_VERSION, SERVICE_VERSION)?;
        for (name, value) in &headers {
            request.set_header(name, value)?;
        }
        Ok(request)
    }
}

/// `/{segment}/{segment}...` with each segment percent-encoded.
fn resource_path(segments: &[&String]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&utf8_percent_encode(segment.trim_start_matches('/'), &PATH_ENCODE_SET).to_string());
    }
    out
}

/// Validate a container, file system or queue name.
pub fn validate_resource_name(kind: &str, name: &str) -> Result<()> {
    let valid = (3..=63).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--");
    if valid {
        Ok(())
    } else {
        Err(StorageError::invalid_argument(format!(
            "invalid {} name: {:?}",
            kind, name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Url {
        Url::parse("https://acct.blob.core.windows.net").unwrap()
    }

    #[test]
    fn test_create_container_request() {
        let req = Operation::CreateContainer {
            container: "photos".into(),
        }
        .to_request(&endpoint())
        .unwrap();
        assert_eq!(req.method, Method::PUT);
        assert_eq!(
            req.url.as_str(),
            "https://acct.blob.core.windows.net/photos?restype=container"
        );
        assert_eq!(req.header("x-ms-version"), Some(SERVICE_VERSION));
    }

    #[test]
    fn test_blob_name_encoding() {
        let req = Operation::GetBlob {
            container: "photos".into(),
            blob: "2020/cat & dog+1.jpg".into(),
            range: Some(ByteRange::new(0, Some(4))),
        }
        .to_request(&endpoint())
        .unwrap();
        assert_eq!(req.url.path(), "/photos/2020/cat%20%26%20dog%2B1.jpg");
        assert_eq!(req.header("x-ms-range"), Some("bytes=0-3"));
    }

    #[test]
    fn test_stage_block_query_and_md5() {
        let req = Operation::StageBlock {
            container: "c".into(),
            blob: "b".into(),
            block_id: "YS0wMDAwMDE=".into(),
            body: Bytes::from_static(b"hello"),
            transactional_md5: true,
        }
        .to_request(&endpoint())
        .unwrap();
        assert_eq!(req.url.query(), Some("comp=block&blockid=YS0wMDAwMDE%3D"));
        assert_eq!(req.header("content-md5"), Some("XUFAKrxLKna5cZ2REBfFkg=="));
        assert_eq!(req.body.as_ref(), b"hello");
    }

    #[test]
    fn test_commit_block_list_body() {
        let req = Operation::CommitBlockList {
            container: "c".into(),
            blob: "b".into(),
            block_ids: vec!["QQ==".into(), "Qg==".into()],
            content_type: None,
        }
        .to_request(&endpoint())
        .unwrap();
        let body = String::from_utf8(req.body.to_vec()).unwrap();
        assert!(body.contains("<Latest>QQ==</Latest><Latest>Qg==</Latest>"));
        assert_eq!(req.header("content-type"), Some("application/xml"));
    }

    #[test]
    fn test_set_access_control_recursive_request() {
        let dfs = Url::parse("https://acct.dfs.core.windows.net").unwrap();
        let req = Operation::SetAccessControlRecursive {
            file_system: "fs".into(),
            path: "dir".into(),
            mode: AclChangeMode::Modify,
            acl: "user::rwx".into(),
            max_records: Some(2000),
            continuation: Some("VBaz/1+2=".into()),
            force_flag: true,
        }
        .to_request(&dfs)
        .unwrap();
        assert_eq!(req.method, Method::PATCH);
        assert_eq!(
            req.url.query(),
            Some("action=setAccessControlRecursive&mode=modify&maxRecords=2000&continuation=VBaz%2F1%2B2%3D&forceFlag=true")
        );
        assert_eq!(req.header("x-ms-acl"), Some("user::rwx"));
    }

    #[test]
    fn test_endpoint_with_path_prefix() {
        // Emulator style endpoints carry the account in the path.
        let emulator = Url::parse("http://127.0.0.1:10000/devstoreaccount1").unwrap();
        let req = Operation::DeleteBlob {
            container: "c".into(),
            blob: "b".into(),
        }
        .to_request(&emulator)
        .unwrap();
        assert_eq!(req.url.as_str(), "http://127.0.0.1:10000/devstoreaccount1/c/b");
    }

    #[test]
    fn test_queue_message_request() {
        let queue = Url::parse("https://acct.queue.core.windows.net").unwrap();
        let req = Operation::PutMessage {
            queue: "jobs".into(),
            text: "hello".into(),
        }
        .to_request(&queue)
        .unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.url.path(), "/jobs/messages");
    }

    #[test]
    fn test_validate_resource_name() {
        assert!(validate_resource_name("container", "photos-2020").is_ok());
        assert!(validate_resource_name("container", "ab").is_err());
        assert!(validate_resource_name("container", "Photos").is_err());
        assert!(validate_resource_name("container", "a--b").is_err());
        assert!(validate_resource_name("container", "-abc").is_err());
    }
}
