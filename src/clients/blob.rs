//! Blob service clients: containers and block blobs.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::StorageClient;
use crate::errors::{Result, StorageError};
use crate::operations::{validate_resource_name, Operation};
use crate::request::{ByteRange, Response, ResponseMeta};
use crate::transfer::upload::block_id;
use crate::transfer::{self, Chunk, DownloadSource, TransferOptions, UploadTarget};
use crate::xml::{self, BlobItem, ListBlobsPage};

// -- ContainerClient ----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ContainerClient {
    client: StorageClient,
    name: String,
}

impl ContainerClient {
    pub fn new(client: StorageClient, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blob(&self, name: &str) -> BlobClient {
        BlobClient {
            client: self.client.clone(),
            container: self.name.clone(),
            name: name.to_string(),
        }
    }

    pub async fn create(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        validate_resource_name("container", &self.name)?;
        let op = Operation::CreateContainer {
            container: self.name.clone(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    pub async fn delete(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        let op = Operation::DeleteContainer {
            container: self.name.clone(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    /// One page of a flat blob listing. Pass the returned `next_marker` back
    /// as `marker` to get the following page.
    pub async fn list_blobs_page(
        &self,
        prefix: Option<&str>,
        marker: Option<&str>,
        max_results: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ListBlobsPage> {
        let op = Operation::ListBlobs {
            container: self.name.clone(),
            prefix: prefix.map(str::to_string),
            marker: marker.map(str::to_string),
            max_results,
        };
        let body = self.client.execute(&op, cancel).await?.bytes().await?;
        xml::parse_list_blobs(&body)
    }

    /// Every blob under `prefix`, following markers until the listing ends.
    pub async fn list_blobs(
        &self,
        prefix: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<BlobItem>> {
        let mut blobs = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .list_blobs_page(prefix, marker.as_deref(), None, cancel)
                .await?;
            blobs.extend(page.blobs);
            match page.next_marker {
                Some(m) if !m.is_empty() => marker = Some(m),
                _ => break,
            }
        }
        Ok(blobs)
    }
}

// -- BlobClient ---------------------------------------------------------------

/// Properties returned by a HEAD on a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BlobClient {
    client: StorageClient,
    container: String,
    name: String,
}

impl BlobClient {
    pub fn container_name(&self) -> &str {
        &self.container
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upload `body` as a block blob in one call.
    pub async fn put(
        &self,
        body: Bytes,
        content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ResponseMeta> {
        let op = Operation::PutBlob {
            container: self.container.clone(),
            blob: self.name.clone(),
            body,
            content_type: content_type.map(str::to_string),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    /// Read the blob, or `range` of it. The body is left unread.
    pub async fn get(
        &self,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let op = Operation::GetBlob {
            container: self.container.clone(),
            blob: self.name.clone(),
            range,
        };
        self.client.execute(&op, cancel).await
    }

    pub async fn get_properties(&self, cancel: &CancellationToken) -> Result<BlobProperties> {
        let op = Operation::GetBlobProperties {
            container: self.container.clone(),
            blob: self.name.clone(),
        };
        let response = self.client.execute(&op, cancel).await?;
        let meta = response.meta();
        let content_length = meta.content_length.ok_or_else(|| {
            StorageError::Internal(anyhow::anyhow!(
                "GetBlobProperties response for {}/{} has no content-length",
                self.container,
                self.name
            ))
        })?;
        Ok(BlobProperties {
            content_length,
            content_type: response.header("content-type").map(str::to_string),
            etag: meta.etag,
            last_modified: meta.last_modified,
        })
    }

    pub async fn delete(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        let op = Operation::DeleteBlob {
            container: self.container.clone(),
            blob: self.name.clone(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    pub async fn stage_block(
        &self,
        block_id: &str,
        body: Bytes,
        transactional_md5: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let op = Operation::StageBlock {
            container: self.container.clone(),
            blob: self.name.clone(),
            block_id: block_id.to_string(),
            body,
            transactional_md5,
        };
        self.client.execute(&op, cancel).await?;
        Ok(())
    }

    /// Commit staged blocks in the given order.
    pub async fn commit_block_list(
        &self,
        block_ids: Vec<String>,
        content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ResponseMeta> {
        let op = Operation::CommitBlockList {
            container: self.container.clone(),
            blob: self.name.clone(),
            block_ids,
            content_type: content_type.map(str::to_string),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    // -- Parallel transfers ---------------------------------------------------

    fn block_upload(&self, options: &TransferOptions) -> BlockBlobUpload<'_> {
        BlockBlobUpload {
            blob: self,
            prefix: Uuid::new_v4().simple().to_string(),
            transactional_md5: options.transactional_md5,
        }
    }

    pub async fn upload_buffer(
        &self,
        data: Bytes,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        transfer::upload_buffer(&self.block_upload(options), data, options, cancel).await
    }

    pub async fn upload_file(
        &self,
        path: &Path,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        transfer::upload_file(&self.block_upload(options), path, options, cancel).await
    }

    pub async fn upload_stream<R>(
        &self,
        reader: R,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        transfer::upload_stream(&self.block_upload(options), reader, options, cancel).await
    }

    pub async fn download_to_buffer(
        &self,
        offset: u64,
        count: Option<u64>,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        transfer::download_to_buffer(self, offset, count, options, cancel).await
    }

    pub async fn download_to_file(
        &self,
        path: &Path,
        offset: u64,
        count: Option<u64>,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        transfer::download_to_file(self, path, offset, count, options, cancel).await
    }
}

impl DownloadSource for BlobClient {
    fn content_length<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move { Ok(self.get_properties(cancel).await?.content_length) })
    }

    fn read_range<'a>(
        &'a self,
        range: ByteRange,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<BoxStream<'static, Result<Bytes>>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.get(Some(range), cancel).await?.into_stream()) })
    }
}

/// One block blob upload. Block ids share a per-upload random prefix.
struct BlockBlobUpload<'a> {
    blob: &'a BlobClient,
    prefix: String,
    transactional_md5: bool,
}

impl UploadTarget for BlockBlobUpload<'_> {
    fn upload_single<'a>(
        &'a self,
        data: Bytes,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.blob.put(data, None, cancel).await?;
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
            let id = block_id(&self.prefix, chunk.index);
            self.blob
                .stage_block(&id, data, self.transactional_md5, cancel)
                .await
        })
    }

    fn commit<'a>(
        &'a self,
        chunks: &'a [Chunk],
        _total: u64,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut ordered: Vec<&Chunk> = chunks.iter().collect();
            ordered.sort_by_key(|c| c.index);
            let ids: Vec<String> = ordered
                .iter()
                .map(|c| block_id(&self.prefix, c.index))
                .collect();
            debug!(
                "committing {} blocks to {}/{}",
                ids.len(),
                self.blob.container,
                self.blob.name
            );
            self.blob.commit_block_list(ids, None, cancel).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ServiceEndpoints;
    use crate::credentials::Credential;
    use crate::pipeline::test_support::{Scripted, ScriptedTransport};
    use crate::pipeline::{new_pipeline, PipelineOptions, RetryOptions};
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use http::Method;
    use std::sync::Arc;

    fn client(transport: Arc<ScriptedTransport>) -> StorageClient {
        let options = PipelineOptions {
            retry: RetryOptions {
                max_tries: 2,
                retry_delay_ms: 1,
                max_retry_delay_ms: 2,
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
    async fn test_create_container_rejects_bad_name_without_calling() {
        let transport = Arc::new(ScriptedTransport::default());
        let err = client(transport.clone())
            .container("Bad_Name")
            .create(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_service_error_surfaces_code() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Full(
            409,
            vec![("x-ms-error-code", "ContainerAlreadyExists")],
            "",
        )]));
        let err = client(transport)
            .container("photos")
            .create(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ContainerAlreadyExists");
    }

    #[tokio::test]
    async fn test_list_blobs_follows_markers() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::StatusWithBody(
                200,
                "<EnumerationResults><Blobs><Blob><Name>a</Name><Properties><Content-Length>1</Content-Length></Properties></Blob></Blobs><NextMarker>m1</NextMarker></EnumerationResults>",
            ),
            Scripted::StatusWithBody(
                200,
                "<EnumerationResults><Blobs><Blob><Name>b</Name><Properties><Content-Length>2</Content-Length></Properties></Blob></Blobs><NextMarker/></EnumerationResults>",
            ),
        ]));
        let blobs = client(transport.clone())
            .container("photos")
            .list_blobs(Some("x/"), &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<&str> = blobs.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let seen = transport.requests();
        assert!(seen[1].url.query().unwrap().contains("marker=m1"));
        assert!(seen[0].url.query().unwrap().contains("prefix=x%2F"));
    }

    #[tokio::test]
    async fn test_get_properties() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Full(
            200,
            vec![
                ("content-length", "1234"),
                ("etag", "\"0x1\""),
                ("content-type", "text/plain"),
            ],
            "",
        )]));
        let props = client(transport.clone())
            .container("c")
            .blob("b.txt")
            .get_properties(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(props.content_length, 1234);
        assert_eq!(props.etag.as_deref(), Some("\"0x1\""));
        assert_eq!(props.content_type.as_deref(), Some("text/plain"));
        assert_eq!(transport.requests()[0].method, Method::HEAD);
    }

    #[tokio::test]
    async fn test_chunked_upload_stages_then_commits_in_order() {
        let transport = Arc::new(ScriptedTransport::default());
        let blob = client(transport.clone()).container("c").blob("big.bin");
        let options = TransferOptions {
            chunk_size: 4,
            single_shot_threshold: 4,
            max_concurrency: 2,
            ..TransferOptions::default()
        };
        let n = blob
            .upload_buffer(Bytes::from_static(b"0123456789"), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 10);

        let seen = transport.requests();
        assert_eq!(seen.len(), 4);
        for req in &seen[..3] {
            assert!(req.url.query().unwrap().starts_with("comp=block&blockid="));
        }
        let commit = &seen[3];
        assert_eq!(commit.url.query(), Some("comp=blocklist"));
        let body = String::from_utf8(commit.body.to_vec()).unwrap();
        let decoded: Vec<String> = body
            .split("<Latest>")
            .skip(1)
            .map(|s| s.split("</Latest>").next().unwrap())
            .map(|id| String::from_utf8(BASE64_STANDARD.decode(id).unwrap()).unwrap())
            .collect();
        assert_eq!(decoded.len(), 3);
        // one shared prefix, increasing indexes
        let prefix = decoded[0].trim_end_matches("-000000");
        assert_eq!(prefix.len(), 32);
        assert_eq!(decoded[1], format!("{}-000001", prefix));
        assert_eq!(decoded[2], format!("{}-000002", prefix));
    }

    #[tokio::test]
    async fn test_small_upload_is_single_put() {
        let transport = Arc::new(ScriptedTransport::default());
        client(transport.clone())
            .container("c")
            .blob("small.txt")
            .upload_buffer(
                Bytes::from_static(b"hi"),
                &TransferOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let seen = transport.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::PUT);
        assert_eq!(seen[0].header("x-ms-blob-type"), Some("BlockBlob"));
    }

    #[tokio::test]
    async fn test_download_sends_range_headers() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::StatusWithBody(206, "abcd"),
            Scripted::StatusWithBody(206, "ef"),
        ]));
        let options = TransferOptions {
            chunk_size: 4,
            max_concurrency: 1,
            ..TransferOptions::default()
        };
        let data = client(transport.clone())
            .container("c")
            .blob("b")
            .download_to_buffer(10, Some(6), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"abcdef");
        let seen = transport.requests();
        assert_eq!(seen[0].header("x-ms-range"), Some("bytes=10-13"));
        assert_eq!(seen[1].header("x-ms-range"), Some("bytes=14-15"));
    }
}
