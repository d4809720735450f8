//! Queue service client.

use tokio_util::sync::CancellationToken;

use super::StorageClient;
use crate::errors::Result;
use crate::operations::{validate_resource_name, Operation};
use crate::request::ResponseMeta;

#[derive(Debug, Clone)]
pub struct QueueClient {
    client: StorageClient,
    name: String,
}

impl QueueClient {
    pub fn new(client: StorageClient, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn create(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        validate_resource_name("queue", &self.name)?;
        let op = Operation::CreateQueue {
            queue: self.name.clone(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    pub async fn delete(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        let op = Operation::DeleteQueue {
            queue: self.name.clone(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    /// Enqueue one message. The text is sent as-is inside `<MessageText>`.
    pub async fn send_message(&self, text: &str, cancel: &CancellationToken) -> Result<ResponseMeta> {
        let op = Operation::PutMessage {
            queue: self.name.clone(),
            text: text.to_string(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }

    pub async fn clear_messages(&self, cancel: &CancellationToken) -> Result<ResponseMeta> {
        let op = Operation::ClearMessages {
            queue: self.name.clone(),
        };
        Ok(self.client.execute(&op, cancel).await?.meta())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ServiceEndpoints;
    use crate::credentials::Credential;
    use crate::pipeline::test_support::ScriptedTransport;
    use crate::pipeline::{new_pipeline, PipelineOptions};
    use http::Method;
    use std::sync::Arc;

    fn queue(transport: Arc<ScriptedTransport>) -> QueueClient {
        let options = PipelineOptions {
            http_client: Some(transport),
            ..PipelineOptions::default()
        };
        let pipeline = new_pipeline(Credential::Anonymous, options).unwrap();
        let endpoints = ServiceEndpoints::for_account("acct", "https", "core.windows.net").unwrap();
        StorageClient::new(Arc::new(pipeline), endpoints).queue("jobs")
    }

    #[tokio::test]
    async fn test_send_message_posts_xml() {
        let transport = Arc::new(ScriptedTransport::default());
        queue(transport.clone())
            .send_message("hello <world>", &CancellationToken::new())
            .await
            .unwrap();
        let seen = transport.requests();
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(
            seen[0].url.as_str(),
            "https://acct.queue.core.windows.net/jobs/messages"
        );
        let body = String::from_utf8(seen[0].body.to_vec()).unwrap();
        assert!(body.contains("<MessageText>hello &lt;world&gt;</MessageText>"));
    }

    #[tokio::test]
    async fn test_clear_messages_deletes_collection() {
        let transport = Arc::new(ScriptedTransport::default());
        queue(transport.clone())
            .clear_messages(&CancellationToken::new())
            .await
            .unwrap();
        let seen = transport.requests();
        assert_eq!(seen[0].method, Method::DELETE);
        assert_eq!(seen[0].url.path(), "/jobs/messages");
    }
}
