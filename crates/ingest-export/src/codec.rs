//! Framing of export streams.
//!
//! An export stream is a sequence of entries:
//!
//! ```text
//! +---------+----------------+-----------------+
//! | tag (3) | length (4, BE) | payload         |
//! +---------+----------------+-----------------+
//! ```
//!
//! Tags are `RES` (broker message), `ENT` (entities groups), `LAB` (labels),
//! `LEA` (learning configuration, JSON) and `BIN`. A `BIN` payload is a
//! `CloudFile` descriptor, followed by a second 4-byte BE length and that many
//! raw bytes of the binary itself.
//!
//! Streams are read strictly in order. Seeking consumes bytes.

use futures::stream::{self, BoxStream, StreamExt};
use prost::Message as _;

use ingest_storage::ByteStream;
use ingest_types::{
    BrokerMessage, CloudFile, EntitiesGroups, ExportedItemType, Labels, LearningConfiguration,
};

use crate::error::ExportError;

const LEN_BYTES: usize = 4;

/// Largest slice read at once when skipping bytes.
const SKIP_CHUNK: usize = 64 * 1024;

/// Outcome of a raw read.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamRead {
    Data(Vec<u8>),
    /// The source ended with nothing left to read
    EndOfStream,
}

/// Chunks of a binary being read out of the stream.
pub type BinaryStream<'r> = BoxStream<'r, Result<Vec<u8>, ExportError>>;

/// One decoded entry.
pub enum ExportItem<'r> {
    Resource(BrokerMessage),
    Binary(BinaryPayload<'r>),
    Entities(EntitiesGroups),
    Labels(Labels),
}

impl ExportItem<'_> {
    pub fn item_type(&self) -> ExportedItemType {
        match self {
            ExportItem::Resource(_) => ExportedItemType::Resource,
            ExportItem::Binary(_) => ExportedItemType::Binary,
            ExportItem::Entities(_) => ExportedItemType::EntitiesGroups,
            ExportItem::Labels(_) => ExportedItemType::Labels,
        }
    }
}

/// Reads entries out of a chunked byte stream without holding more than the
/// current entry in memory.
pub struct ExportStreamReader {
    source: ByteStream<'static>,
    buffer: Vec<u8>,
    /// Start of unread data in `buffer`
    pos: usize,
    source_done: bool,
    read_bytes: u64,
    /// Raw bytes of the last binary not yet consumed
    pending_binary: u64,
}

impl ExportStreamReader {
    pub fn new(source: ByteStream<'static>) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            pos: 0,
            source_done: false,
            read_bytes: 0,
            pending_binary: 0,
        }
    }

    /// Bytes consumed so far. After an entry is fully read this is the offset
    /// of the next entry.
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes
    }

    fn available(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Read exactly `n` bytes. `EndOfStream` only when nothing at all is left;
    /// a partial read is a truncated stream.
    pub async fn read(&mut self, n: usize) -> Result<StreamRead, ExportError> {
        while self.available() < n && !self.source_done {
            match self.source.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        self.source_done = true;
                    } else {
                        self.buffer.drain(..self.pos);
                        self.pos = 0;
                        self.buffer.extend_from_slice(&chunk);
                    }
                }
                None => self.source_done = true,
            }
        }

        let available = self.available();
        if available >= n {
            let data = self.buffer[self.pos..self.pos + n].to_vec();
            self.pos += n;
            self.read_bytes += n as u64;
            return Ok(StreamRead::Data(data));
        }
        if available == 0 {
            return Ok(StreamRead::EndOfStream);
        }
        Err(ExportError::format(format!(
            "stream truncated: wanted {n} bytes, {available} left"
        )))
    }

    /// Put bytes back in front of the unread data.
    fn unread(&mut self, bytes: Vec<u8>) {
        let mut restored = bytes;
        self.read_bytes -= restored.len() as u64;
        restored.extend_from_slice(&self.buffer[self.pos..]);
        self.buffer = restored;
        self.pos = 0;
    }

    async fn read_exact(&mut self, n: usize, what: &str) -> Result<Vec<u8>, ExportError> {
        match self.read(n).await? {
            StreamRead::Data(data) => Ok(data),
            StreamRead::EndOfStream => Err(ExportError::format(format!(
                "stream ended while reading {what}"
            ))),
        }
    }

    async fn read_len(&mut self, what: &str) -> Result<usize, ExportError> {
        let bytes = self.read_exact(LEN_BYTES, what).await?;
        let mut len = [0u8; LEN_BYTES];
        len.copy_from_slice(&bytes);
        Ok(u32::from_be_bytes(len) as usize)
    }

    async fn read_payload(&mut self, what: &str) -> Result<Vec<u8>, ExportError> {
        let len = self.read_len(what).await?;
        self.read_exact(len, what).await
    }

    /// Discard `offset` bytes.
    pub async fn seek(&mut self, offset: u64) -> Result<(), ExportError> {
        let mut left = offset;
        while left > 0 {
            let step = left.min(SKIP_CHUNK as u64) as usize;
            self.read_exact(step, "seek").await?;
            left -= step as u64;
        }
        Ok(())
    }

    async fn skip_pending_binary(&mut self) -> Result<(), ExportError> {
        while self.pending_binary > 0 {
            let step = self.pending_binary.min(SKIP_CHUNK as u64) as usize;
            self.read_exact(step, "binary").await?;
            self.pending_binary -= step as u64;
        }
        Ok(())
    }

    /// Read a leading learning configuration entry if there is one.
    ///
    /// Only valid at the start of the stream. Streams written before the
    /// entry existed start directly with another tag; those bytes are put
    /// back untouched.
    pub async fn maybe_read_learning_config(
        &mut self,
    ) -> Result<Option<LearningConfiguration>, ExportError> {
        let tag = match self.read(ExportedItemType::TAG_LEN).await? {
            StreamRead::EndOfStream => return Ok(None),
            StreamRead::Data(tag) => tag,
        };
        if tag.as_slice() != ExportedItemType::LearningConfig.tag() {
            self.unread(tag);
            return Ok(None);
        }
        let payload = self.read_payload("learning config").await?;
        LearningConfiguration::from_bytes(&payload)
            .map(Some)
            .map_err(|e| ExportError::format(format!("invalid learning config: {e}")))
    }

    /// Next entry, or `None` at a clean end of stream.
    ///
    /// A binary left partly unread is skipped first.
    pub async fn next_item(&mut self) -> Result<Option<ExportItem<'_>>, ExportError> {
        self.skip_pending_binary().await?;
        let tag = match self.read(ExportedItemType::TAG_LEN).await? {
            StreamRead::EndOfStream => return Ok(None),
            StreamRead::Data(tag) => tag,
        };
        let kind = ExportedItemType::from_tag(&tag).ok_or_else(|| {
            ExportError::format(format!("unknown tag {:?}", String::from_utf8_lossy(&tag)))
        })?;

        let item = match kind {
            ExportedItemType::Resource => {
                let payload = self.read_payload("resource").await?;
                ExportItem::Resource(decode(&payload, "broker message")?)
            }
            ExportedItemType::EntitiesGroups => {
                let payload = self.read_payload("entities").await?;
                ExportItem::Entities(decode(&payload, "entities groups")?)
            }
            ExportedItemType::Labels => {
                let payload = self.read_payload("labels").await?;
                ExportItem::Labels(decode(&payload, "labels")?)
            }
            ExportedItemType::Binary => {
                let payload = self.read_payload("binary descriptor").await?;
                let cloud_file: CloudFile = decode(&payload, "cloud file")?;
                let size = self.read_len("binary length").await? as u64;
                self.pending_binary = size;
                ExportItem::Binary(BinaryPayload {
                    cloud_file,
                    size,
                    reader: self,
                })
            }
            ExportedItemType::LearningConfig => {
                return Err(ExportError::format(
                    "learning config is only allowed as the first entry",
                ))
            }
        };
        Ok(Some(item))
    }
}

fn decode<M: prost::Message + Default>(payload: &[u8], what: &str) -> Result<M, ExportError> {
    M::decode(payload).map_err(|e| ExportError::format(format!("invalid {what}: {e}")))
}

/// Raw bytes of a `BIN` entry, read lazily from the stream.
pub struct BinaryPayload<'r> {
    pub cloud_file: CloudFile,
    size: u64,
    reader: &'r mut ExportStreamReader,
}

impl<'r> BinaryPayload<'r> {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Up to `chunk_size` more bytes, `None` once the binary is consumed.
    pub async fn next_chunk(&mut self, chunk_size: usize) -> Result<Option<Vec<u8>>, ExportError> {
        let step = self.reader.pending_binary.min(chunk_size.max(1) as u64) as usize;
        if step == 0 {
            return Ok(None);
        }
        let chunk = self.reader.read_exact(step, "binary").await?;
        self.reader.pending_binary -= step as u64;
        Ok(Some(chunk))
    }

    /// The remaining bytes as a stream of `chunk_size` chunks.
    pub fn into_stream(self, chunk_size: usize) -> BinaryStream<'r> {
        stream::try_unfold(self, move |mut payload| async move {
            Ok(payload
                .next_chunk(chunk_size)
                .await?
                .map(|chunk| (chunk, payload)))
        })
        .boxed()
    }
}

fn entry(kind: ExportedItemType, payload: &[u8]) -> Result<Vec<u8>, ExportError> {
    let len = u32::try_from(payload.len()).map_err(|_| ExportError::ItemTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(ExportedItemType::TAG_LEN + LEN_BYTES + payload.len());
    out.extend_from_slice(kind.tag());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encoders for every entry kind.
pub struct ExportStreamWriter;

impl ExportStreamWriter {
    pub fn resource(bm: &BrokerMessage) -> Result<Vec<u8>, ExportError> {
        entry(ExportedItemType::Resource, &bm.encode_to_vec())
    }

    pub fn entities(entities: &EntitiesGroups) -> Result<Vec<u8>, ExportError> {
        entry(ExportedItemType::EntitiesGroups, &entities.encode_to_vec())
    }

    pub fn labels(labels: &Labels) -> Result<Vec<u8>, ExportError> {
        entry(ExportedItemType::Labels, &labels.encode_to_vec())
    }

    pub fn learning_config(config: &LearningConfiguration) -> Result<Vec<u8>, ExportError> {
        let payload = config
            .to_bytes()
            .map_err(|e| ExportError::format(format!("unserializable learning config: {e}")))?;
        entry(ExportedItemType::LearningConfig, &payload)
    }

    /// Everything of a `BIN` entry up to the raw bytes, which the caller
    /// writes next.
    pub fn binary_header(cloud_file: &CloudFile, binary_len: u64) -> Result<Vec<u8>, ExportError> {
        let len = u32::try_from(binary_len).map_err(|_| ExportError::ItemTooLarge(binary_len as usize))?;
        let mut out = entry(ExportedItemType::Binary, &cloud_file.encode_to_vec())?;
        out.extend_from_slice(&len.to_be_bytes());
        Ok(out)
    }
}
