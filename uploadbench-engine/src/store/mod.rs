//! Storage collaborators: the upload target and the bucket lifecycle.
//!
//! Workers never share a store. Every worker calls [`StoreConnector::connect`] on its own
//! runtime while preparing, so connection pools are never shared across worker threads.

use std::collections::BTreeSet;
use std::fmt::Debug;

use crate::error::StoreResult;
use crate::payload::Payload;

mod in_memory;
mod local_fs;
mod s3;

pub use in_memory::InMemoryStore;
pub use local_fs::{LocalFs, LocalFsConnector};
pub use s3::{S3BucketAdmin, S3Config, S3Connector, S3Store};

/// A type-erased [`ObjectStore`] instance.
pub type BoxedStore = Box<dyn ObjectStore>;

/// The upload target of a benchmark.
#[async_trait::async_trait]
pub trait ObjectStore: Debug + Send + Sync + 'static {
    /// The store name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Uploads the payload under the given key.
    ///
    /// The call is timed by the caller and must not retry internally beyond what the underlying
    /// client does on its own.
    async fn put_object(&self, key: &str, payload: &Payload) -> StoreResult<()>;
}

/// Opens independent connections to an [`ObjectStore`].
#[async_trait::async_trait]
pub trait StoreConnector: Debug + Send + Sync + 'static {
    /// Opens a new connection for the calling worker.
    async fn connect(&self) -> StoreResult<BoxedStore>;

    /// Drops any credentials or session state held by the connector.
    ///
    /// Connections opened before remain usable until they are dropped.
    fn revoke(&self) {}
}

/// Bucket lifecycle operations, used once during setup.
#[async_trait::async_trait]
pub trait BucketAdmin: Debug + Send + Sync {
    /// Lists the names of all buckets visible with the configured credentials.
    async fn list_buckets(&self) -> StoreResult<BTreeSet<String>>;

    /// Creates a bucket with the given name.
    async fn create_bucket(&self, name: &str) -> StoreResult<()>;
}
