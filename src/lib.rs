//! azstore: client library for cloud blob, data lake and queue storage.
//!
//! Requests flow through an immutable [`pipeline::Pipeline`] of policies
//! (keep-alive, telemetry, request id, retry, logging, credential) before
//! reaching a replaceable [`transport::HttpClient`].  On top of that sit the
//! typed [`operations::Operation`] descriptors, the service clients, a
//! parallel chunked [`transfer`] engine and the recursive [`acl`] batch
//! engine.

pub mod acl;
pub mod clients;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod metrics;
pub mod operations;
pub mod pipeline;
pub mod request;
pub mod testing;
pub mod transfer;
pub mod transport;
pub mod xml;

pub use clients::{
    BlobClient, ContainerClient, FileSystemClient, PathClient, QueueClient, ServiceEndpoints,
    StorageClient,
};
pub use credentials::Credential;
pub use errors::{Result, StorageError};
pub use pipeline::{new_pipeline, Pipeline, PipelineOptions};
pub use transfer::TransferOptions;
