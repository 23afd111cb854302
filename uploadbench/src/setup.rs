//! Preparation of the storage target.

use uploadbench_engine::error::StoreError;
use uploadbench_engine::store::{BucketAdmin, LocalFsConnector, S3Connector};

use crate::config::{Config, Storage};
use crate::error::{CliError, SetupError};
use crate::preflight;

/// The state of the bucket after [`ensure_bucket`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BucketStatus {
    /// The bucket existed before.
    Existing,
    /// The bucket was created.
    Created,
}

/// Creates the bucket unless it is already listed.
///
/// Running this twice with the same name never creates a second bucket.
pub async fn ensure_bucket(
    admin: &dyn BucketAdmin,
    bucket: &str,
) -> Result<BucketStatus, SetupError> {
    let to_error = |cause: StoreError| SetupError::Bucket {
        bucket: bucket.to_owned(),
        cause,
    };

    let buckets = admin.list_buckets().await.map_err(to_error)?;
    if buckets.contains(bucket) {
        tracing::debug!(bucket, "bucket exists");
        return Ok(BucketStatus::Existing);
    }

    admin.create_bucket(bucket).await.map_err(to_error)?;
    tracing::info!(bucket, "created bucket");
    Ok(BucketStatus::Created)
}

/// Checks credentials and prepares the configured storage target.
pub async fn setup(config: &Config) -> Result<(), CliError> {
    preflight::check_storage(&config.storage, &config.benchmark)?;

    match &config.storage {
        Storage::S3(s3) => {
            let connector = S3Connector::new(s3.to_config());
            let bucket = connector.bucket().to_owned();
            let admin = connector.admin().map_err(|cause| SetupError::Bucket {
                bucket: bucket.clone(),
                cause,
            })?;

            match ensure_bucket(&admin, &bucket).await? {
                BucketStatus::Existing => println!("bucket `{bucket}` is ready"),
                BucketStatus::Created => println!("created bucket `{bucket}`"),
            }
        }
        Storage::FileSystem { path } => {
            let connector = LocalFsConnector::new(path);
            connector
                .ensure_root()
                .await
                .map_err(|cause| SetupError::Bucket {
                    bucket: path.display().to_string(),
                    cause,
                })?;
            println!("target directory {} is ready", path.display());
        }
    }

    Ok(())
}
