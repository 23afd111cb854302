//! Generation of upload payloads and object keys.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use uuid::Uuid;

use crate::error::PreparationError;

/// Contents of a single upload.
#[derive(Clone, Debug)]
pub enum Payload {
    /// Random bytes held in memory.
    Memory(Bytes),
    /// Random bytes written to a scratch file.
    File {
        /// Location of the payload file.
        path: PathBuf,
        /// Size of the payload file in bytes.
        len: u64,
    },
}

impl Payload {
    /// The length of the payload in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    /// Returns `true` if the payload has no contents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Produces fixed-size payloads filled with random bytes.
///
/// The bytes carry no meaning and only need to defeat compression and deduplication along the
/// upload path, so a fast non-cryptographic RNG is used.
#[derive(Debug)]
pub struct ContentGenerator {
    block_size: usize,
    scratch_dir: Option<PathBuf>,
    rng: SmallRng,
}

impl ContentGenerator {
    /// Creates a generator for in-memory payloads.
    pub fn in_memory(block_size: usize) -> Self {
        Self {
            block_size,
            scratch_dir: None,
            rng: SmallRng::seed_from_u64(rand::random()),
        }
    }

    /// Creates a generator writing payload files below `scratch_dir`.
    pub fn on_disk(block_size: usize, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            block_size,
            scratch_dir: Some(scratch_dir.into()),
            rng: SmallRng::seed_from_u64(rand::random()),
        }
    }

    /// Generates `count` payloads.
    ///
    /// For file-backed payloads the scratch directory is created first. The first write error
    /// aborts generation. Yields to the runtime after every payload, so that a caller racing
    /// generation against an abort signal can interrupt it.
    pub async fn generate_all(&mut self, count: usize) -> Result<Vec<Payload>, PreparationError> {
        if let Some(dir) = &self.scratch_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|cause| PreparationError::Scratch {
                    path: dir.clone(),
                    cause,
                })?;
        }

        let mut payloads = Vec::with_capacity(count);
        for index in 0..count {
            payloads.push(self.generate(index).await?);
            tokio::task::yield_now().await;
        }
        Ok(payloads)
    }

    /// Generates the payload with the given index.
    pub async fn generate(&mut self, index: usize) -> Result<Payload, PreparationError> {
        let mut buf = vec![0; self.block_size];
        self.rng.fill_bytes(&mut buf);

        match &self.scratch_dir {
            None => Ok(Payload::Memory(buf.into())),
            Some(dir) => {
                let path = payload_path(dir, index);
                tokio::fs::write(&path, &buf)
                    .await
                    .map_err(|cause| PreparationError::Write {
                        path: path.clone(),
                        cause,
                    })?;
                Ok(Payload::File {
                    path,
                    len: buf.len() as u64,
                })
            }
        }
    }
}

fn payload_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("block-{index:06}"))
}

/// Produces unique object keys.
///
/// Every key combines the configured prefix, a random shard prefix and a random UUID. The shard
/// prefix spreads keys across the keyspace of stores that partition by key prefix.
#[derive(Debug)]
pub struct KeyGenerator {
    prefix: String,
    rng: SmallRng,
}

impl KeyGenerator {
    /// Creates a generator for keys below `prefix`. An empty prefix is allowed.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_owned(),
            rng: SmallRng::seed_from_u64(rand::random()),
        }
    }

    /// Returns the next key.
    pub fn next_key(&mut self) -> String {
        let shard: u16 = self.rng.random();
        let id = Uuid::new_v4();
        if self.prefix.is_empty() {
            format!("{shard:04x}/{id}")
        } else {
            format!("{}/{shard:04x}/{id}", self.prefix)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[tokio::test]
    async fn memory_payloads() {
        let mut generator = ContentGenerator::in_memory(4096);
        let payloads = generator.generate_all(3).await.unwrap();

        assert_eq!(payloads.len(), 3);
        for payload in &payloads {
            assert!(matches!(payload, Payload::Memory(_)));
            assert_eq!(payload.len(), 4096);
        }

        let (Payload::Memory(first), Payload::Memory(second)) = (&payloads[0], &payloads[1])
        else {
            unreachable!();
        };
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn file_payloads() {
        let tempdir = tempfile::tempdir().unwrap();
        let scratch = tempdir.path().join("worker");

        let mut generator = ContentGenerator::on_disk(1000, &scratch);
        let payloads = generator.generate_all(2).await.unwrap();

        for payload in &payloads {
            let Payload::File { path, len } = payload else {
                panic!("expected a file payload");
            };
            assert!(path.starts_with(&scratch));
            assert_eq!(*len, 1000);
            assert_eq!(std::fs::metadata(path).unwrap().len(), 1000);
        }
    }

    #[tokio::test]
    async fn unwritable_scratch_fails() {
        let tempdir = tempfile::tempdir().unwrap();
        let blocker = tempdir.path().join("taken");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let mut generator = ContentGenerator::on_disk(16, &blocker);
        let err = generator.generate_all(1).await.unwrap_err();
        assert!(matches!(err, PreparationError::Scratch { .. }));
    }

    #[test]
    fn keys_are_unique() {
        let mut keys = KeyGenerator::new("bench/");
        let generated: HashSet<_> = (0..1000).map(|_| keys.next_key()).collect();

        assert_eq!(generated.len(), 1000);
        assert!(generated.iter().all(|key| key.starts_with("bench/")));
        assert!(!generated.iter().any(|key| key.contains("//")));
    }

    #[test]
    fn keys_without_prefix() {
        let key = KeyGenerator::new("").next_key();
        assert!(!key.starts_with('/'));
        assert_eq!(key.split('/').count(), 2);
    }
}
