use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{BoxedStore, ObjectStore, StoreConnector};
use crate::error::StoreResult;
use crate::payload::Payload;

/// Opens [`LocalFs`] stores below a shared root directory.
#[derive(Debug)]
pub struct LocalFsConnector {
    root: PathBuf,
}

impl LocalFsConnector {
    /// Creates a connector for the given root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory receiving all objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> StoreResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreConnector for LocalFsConnector {
    async fn connect(&self) -> StoreResult<BoxedStore> {
        Ok(Box::new(LocalFs::new(&self.root)))
    }
}

/// Stores objects as files below a root directory.
///
/// Object keys map to relative paths, so key segments separated by `/` become directories.
#[derive(Debug)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Creates a store writing below `root`.
    pub fn new(root: &Path) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalFs {
    fn name(&self) -> &'static str {
        "local-fs"
    }

    #[tracing::instrument(level = "trace", fields(%key), skip_all)]
    async fn put_object(&self, key: &str, payload: &Payload) -> StoreResult<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let mut writer = BufWriter::new(file);
        match payload {
            Payload::Memory(bytes) => writer.write_all(bytes).await?,
            Payload::File { path, .. } => {
                let mut reader = File::open(path).await?;
                tokio::io::copy(&mut reader, &mut writer).await?;
            }
        }
        writer.flush().await?;

        let file = writer.into_inner();
        file.sync_data().await?;

        Ok(())
    }
}
