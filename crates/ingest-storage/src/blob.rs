//! Blob storage for binaries, deadletters and oversized stream messages.
//!
//! Objects are addressed by `(bucket, key)`. Each knowledge box owns one
//! bucket; deadlettered broker messages and proxied stream messages live in
//! dedicated buckets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use prost::Message as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use ingest_types::{BrokerMessage, CloudFile, CloudFileSource};

use crate::error::StorageError;

/// Bucket holding deadlettered broker messages
pub const DEADLETTER_BUCKET: &str = "deadletter";

/// Bucket holding broker messages too large for the transport
pub const STREAM_MESSAGES_BUCKET: &str = "stream-messages";

/// Bucket holding export and import payloads
pub const EXPORTS_BUCKET: &str = "exports";

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Chunked byte stream
pub type ByteStream<'a> = BoxStream<'a, Result<Vec<u8>, StorageError>>;

pub fn kb_bucket(kbid: &str) -> String {
    format!("kb-{kbid}")
}

/// Storage key of a field binary inside its KB bucket.
pub fn resource_file_key(uuid: &str, field: &str) -> String {
    format!("{uuid}/f/{field}")
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Which [`CloudFileSource`] files uploaded here carry.
    fn source(&self) -> CloudFileSource;

    async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<CloudFile, StorageError>;

    /// Upload from a chunk stream; returns the number of bytes written.
    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        chunks: ByteStream<'_>,
    ) -> Result<u64, StorageError>;

    /// Download as a stream of chunks.
    async fn download(&self, bucket: &str, key: &str) -> Result<ByteStream<'static>, StorageError>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete_upload(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Keys of a bucket starting with `prefix`, sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn download_all(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let chunks: Vec<Vec<u8>> = self.download(bucket, key).await?.try_collect().await?;
        Ok(chunks.concat())
    }

    /// Store a broker message that could not be processed.
    async fn deadletter(
        &self,
        message: &BrokerMessage,
        seq: u64,
        seqid: i64,
        partition: &str,
    ) -> Result<String, StorageError> {
        let key = format!("deadletter/{partition}/{seqid}/{seq}");
        self.upload(DEADLETTER_BUCKET, &key, message.encode_to_vec())
            .await?;
        info!(key = %key, kbid = %message.kbid, "Deadlettered broker message");
        Ok(key)
    }

    /// Store an oversized broker message; returns its storage key.
    async fn set_stream_message(
        &self,
        kbid: &str,
        uuid: &str,
        data: Vec<u8>,
    ) -> Result<String, StorageError> {
        let key = format!("{kbid}/{uuid}/{}", uuid::Uuid::new_v4().simple());
        self.upload(STREAM_MESSAGES_BUCKET, &key, data).await?;
        Ok(key)
    }

    async fn get_stream_message(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.download_all(STREAM_MESSAGES_BUCKET, key).await
    }

    async fn del_stream_message(&self, key: &str) -> Result<(), StorageError> {
        self.delete_upload(STREAM_MESSAGES_BUCKET, key).await
    }

    /// Remove every binary of a resource. Returns the number deleted.
    async fn delete_resource_files(&self, kbid: &str, uuid: &str) -> Result<usize, StorageError> {
        let bucket = kb_bucket(kbid);
        let keys = self.list(&bucket, &format!("{uuid}/")).await?;
        for key in &keys {
            self.delete_upload(&bucket, key).await?;
        }
        Ok(keys.len())
    }
}

/// Blob storage on the local filesystem: `{root}/{bucket}/{key}`.
pub struct LocalBlobStorage {
    root: PathBuf,
    chunk_size: usize,
}

impl LocalBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        if key.split('/').any(|part| part == "..") || bucket.contains('/') {
            return Err(StorageError::Key(format!("invalid blob path {bucket}/{key}")));
        }
        Ok(self.root.join(bucket).join(key))
    }

    fn cloud_file(&self, bucket: &str, key: &str, size: u64) -> CloudFile {
        let mut cf = CloudFile {
            uri: key.to_string(),
            bucket_name: bucket.to_string(),
            size,
            ..Default::default()
        };
        cf.set_source(CloudFileSource::Local);
        cf
    }
}

async fn walk(dir: &Path, base: &Path, out: &mut Vec<String>) -> Result<(), StorageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            Box::pin(walk(&path, base, out)).await?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    fn source(&self) -> CloudFileSource {
        CloudFileSource::Local
    }

    async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<CloudFile, StorageError> {
        let path = self.path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = data.len() as u64;
        tokio::fs::write(&path, data).await?;
        debug!(bucket, key, size, "Uploaded blob");
        Ok(self.cloud_file(bucket, key, size))
    }

    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        mut chunks: ByteStream<'_>,
    ) -> Result<u64, StorageError> {
        let path = self.path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(bucket, key, size = written, "Uploaded blob stream");
        Ok(written)
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<ByteStream<'static>, StorageError> {
        let path = self.path(bucket, key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::BlobNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let chunk_size = self.chunk_size;
        let chunks = stream::try_unfold(file, move |mut file| async move {
            let mut buf = vec![0u8; chunk_size];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, StorageError>(None);
            }
            buf.truncate(n);
            Ok::<_, StorageError>(Some((buf, file)))
        });
        Ok(chunks.boxed())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.path(bucket, key)?).await?)
    }

    async fn delete_upload(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path(bucket, key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let base = self.root.join(bucket);
        let mut keys = Vec::new();
        walk(&base, &base, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// Blob storage kept in process memory.
#[derive(Default, Clone)]
pub struct MemoryBlobStorage {
    objects: Arc<DashMap<(String, String), Vec<u8>>>,
    chunk_size: Option<usize>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    fn source(&self) -> CloudFileSource {
        CloudFileSource::Memory
    }

    async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<CloudFile, StorageError> {
        let size = data.len() as u64;
        self.objects
            .insert((bucket.to_string(), key.to_string()), data);
        let mut cf = CloudFile {
            uri: key.to_string(),
            bucket_name: bucket.to_string(),
            size,
            ..Default::default()
        };
        cf.set_source(CloudFileSource::Memory);
        Ok(cf)
    }

    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        chunks: ByteStream<'_>,
    ) -> Result<u64, StorageError> {
        let parts: Vec<Vec<u8>> = chunks.try_collect().await?;
        let data = parts.concat();
        let size = data.len() as u64;
        self.upload(bucket, key, data).await?;
        Ok(size)
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<ByteStream<'static>, StorageError> {
        let data = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::BlobNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        let chunk_size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let chunks: Vec<Result<Vec<u8>, StorageError>> =
            data.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn delete_upload(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket && entry.key().1.starts_with(prefix))
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
