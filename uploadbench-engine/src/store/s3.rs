use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use secrecy::{ExposeSecret, SecretString};

use super::{BoxedStore, BucketAdmin, ObjectStore, StoreConnector};
use crate::error::{StoreError, StoreResult};
use crate::payload::Payload;

/// Region in which buckets are created without a location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// Connection parameters of an S3-compatible service.
#[derive(Debug)]
pub struct S3Config {
    /// Region of the bucket.
    pub region: String,
    /// Custom endpoint URL, for example `http://localhost:9000` for MinIO.
    pub endpoint: Option<String>,
    /// Name of the target bucket.
    pub bucket: String,
    /// Access key ID.
    pub access_key: Option<SecretString>,
    /// Secret access key.
    pub secret_key: Option<SecretString>,
    /// Address buckets as a path component instead of a subdomain.
    pub path_style: bool,
}

struct S3Credentials {
    access_key: SecretString,
    secret_key: SecretString,
}

/// Opens S3 clients for workers.
pub struct S3Connector {
    region: String,
    endpoint: Option<String>,
    bucket: String,
    path_style: bool,
    credentials: Mutex<Option<S3Credentials>>,
}

impl S3Connector {
    /// Creates a connector from the given config.
    pub fn new(config: S3Config) -> Self {
        let credentials = match (config.access_key, config.secret_key) {
            (Some(access_key), Some(secret_key)) => Some(S3Credentials {
                access_key,
                secret_key,
            }),
            _ => None,
        };

        Self {
            region: config.region,
            endpoint: config.endpoint,
            bucket: config.bucket,
            path_style: config.path_style,
            credentials: Mutex::new(credentials),
        }
    }

    /// Name of the target bucket.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns a handle for bucket lifecycle operations.
    pub fn admin(&self) -> StoreResult<S3BucketAdmin> {
        Ok(S3BucketAdmin {
            client: self.client()?,
            region: self.region.clone(),
        })
    }

    fn client(&self) -> StoreResult<Client> {
        let guard = self
            .credentials
            .lock()
            .map_err(|_| StoreError::MissingCredentials("s3"))?;
        let Some(credentials) = guard.as_ref() else {
            return Err(StoreError::MissingCredentials("s3"));
        };

        let credentials = Credentials::new(
            credentials.access_key.expose_secret(),
            credentials.secret_key.expose_secret(),
            None,
            None,
            "uploadbench",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(self.path_style);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Client::from_conf(builder.build()))
    }
}

impl fmt::Debug for S3Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Connector")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl StoreConnector for S3Connector {
    async fn connect(&self) -> StoreResult<BoxedStore> {
        Ok(Box::new(S3Store {
            client: self.client()?,
            bucket: self.bucket.clone(),
        }))
    }

    fn revoke(&self) {
        if let Ok(mut credentials) = self.credentials.lock() {
            credentials.take();
        }
    }
}

/// Uploads objects into a single S3 bucket.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl fmt::Debug for S3Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[tracing::instrument(level = "trace", fields(%key), skip_all)]
    async fn put_object(&self, key: &str, payload: &Payload) -> StoreResult<()> {
        let body = match payload {
            Payload::Memory(bytes) => ByteStream::from(bytes.clone()),
            Payload::File { path, .. } => ByteStream::from_path(path)
                .await
                .map_err(|err| StoreError::request("failed to open payload file", err))?,
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(payload.len() as i64)
            .body(body)
            .send()
            .await
            .map_err(|err| StoreError::request(format!("failed to put `{key}`"), err))?;

        Ok(())
    }
}

/// Bucket lifecycle operations against an S3-compatible service.
pub struct S3BucketAdmin {
    client: Client,
    region: String,
}

impl fmt::Debug for S3BucketAdmin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3BucketAdmin")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl BucketAdmin for S3BucketAdmin {
    async fn list_buckets(&self) -> StoreResult<BTreeSet<String>> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|err| StoreError::request("failed to list buckets", err))?;

        Ok(output
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name())
            .map(str::to_owned)
            .collect())
    }

    async fn create_bucket(&self, name: &str) -> StoreResult<()> {
        let mut request = self.client.create_bucket().bucket(name);
        if self.region != DEFAULT_REGION {
            let configuration = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build();
            request = request.create_bucket_configuration(configuration);
        }

        request
            .send()
            .await
            .map_err(|err| StoreError::request(format!("failed to create bucket `{name}`"), err))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(with_credentials: bool) -> S3Config {
        S3Config {
            region: "eu-central-1".into(),
            endpoint: Some("http://localhost:9000".into()),
            bucket: "bench".into(),
            access_key: with_credentials.then(|| SecretString::from("access".to_owned())),
            secret_key: with_credentials.then(|| SecretString::from("secret".to_owned())),
            path_style: true,
        }
    }

    #[tokio::test]
    async fn connect_requires_credentials() {
        let connector = S3Connector::new(config(false));
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, StoreError::MissingCredentials("s3")));
    }

    #[tokio::test]
    async fn revoke_drops_credentials() {
        let connector = S3Connector::new(config(true));
        assert!(connector.connect().await.is_ok());

        connector.revoke();
        assert!(connector.connect().await.is_err());
        assert!(connector.admin().is_err());
    }

    #[tokio::test]
    async fn missing_payload_file_is_reported_once() {
        let store = S3Connector::new(config(true)).connect().await.unwrap();
        let payload = Payload::File {
            path: "/nonexistent/uploadbench/payload".into(),
            len: 1,
        };

        let err = store.put_object("key", &payload).await.unwrap_err();
        assert_eq!(err.to_string(), "failed to open payload file");

        let chain = crate::error::display_chain(&err);
        assert_eq!(chain.matches("failed to open payload file").count(), 1);
        assert!(chain.starts_with("failed to open payload file: "));
    }

    #[test]
    fn debug_hides_credentials() {
        let connector = S3Connector::new(config(true));
        let debug = format!("{connector:?}");
        assert!(debug.contains("bench"));
        assert!(!debug.contains("secret"));
    }
}
