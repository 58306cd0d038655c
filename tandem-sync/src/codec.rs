//! Chunked snapshot codec.
//!
//! A document's full CRDT state is stored as a header record at the
//! document path, plus zero or more chunk records when the state does not
//! fit in one store document:
//!
//! ```text
//! docs/readme                        SnapshotHeader { generation: g, Inline(bytes) | Chunked { count }, .. }
//! docs/readme/chunks/<g>/000000      ChunkRecord { generation: g, index: 0, bytes }
//! docs/readme/chunks/<g>/000001      ChunkRecord { generation: g, index: 1, bytes }
//! ```
//!
//! Every write gets a fresh generation id and its chunks live under that
//! generation's own prefix, so writing a new snapshot never touches the
//! chunks the current header points at. A reader only accepts chunks whose
//! generation matches the header; chunks of any other generation are
//! leftovers of a replaced or abandoned write.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::unix_millis;

/// Sub-path segment holding chunk records.
pub const CHUNKS_SEGMENT: &str = "chunks";

/// Upper bound on bytes reserved for record framing (generation, lengths,
/// enum tags) when sizing chunks against a store limit.
pub const RECORD_OVERHEAD: usize = 64;

/// Largest record the decoder will allocate for.
const DECODE_LIMIT: usize = 256 * 1024 * 1024;

pub(crate) fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

pub(crate) fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let config = bincode::config::standard().with_limit::<DECODE_LIMIT>();
    let (record, read) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    if read != bytes.len() {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes after record",
            bytes.len() - read
        )));
    }
    Ok(record)
}

/// Compression applied to the full state before chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    /// lz4_flex block format with prepended size.
    Lz4,
}

/// Where the snapshot payload lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotContent {
    /// Payload stored in the header itself.
    Inline(Vec<u8>),
    /// Payload split across `count` chunk records.
    Chunked { count: u32 },
}

/// Record stored at the document path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Unique per write
    pub generation: Uuid,
    pub content: SnapshotContent,
    /// Payload length after compression, before chunking
    pub total_len: u64,
    /// Milliseconds since the Unix epoch
    pub last_updated: u64,
    pub compression: Compression,
}

impl SnapshotHeader {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_record(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_record(bytes)
    }

    /// Number of chunk records this header expects.
    pub fn chunk_count(&self) -> u32 {
        match self.content {
            SnapshotContent::Inline(_) => 0,
            SnapshotContent::Chunked { count } => count,
        }
    }
}

/// Record stored at `<path>/chunks/<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub generation: Uuid,
    pub index: u32,
    pub bytes: Vec<u8>,
}

impl ChunkRecord {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_record(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_record(bytes)
    }
}

/// A snapshot ready to be written.
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub header: SnapshotHeader,
    pub chunks: Vec<ChunkRecord>,
}

/// Prefix under which all of a document's chunks live, every generation.
pub fn chunk_prefix(doc_path: &str) -> String {
    format!("{doc_path}/{CHUNKS_SEGMENT}/")
}

/// Prefix under which the chunks of one generation live.
pub fn generation_prefix(doc_path: &str, generation: Uuid) -> String {
    format!("{doc_path}/{CHUNKS_SEGMENT}/{generation}/")
}

/// Store path of chunk `index` of `generation`. Zero-padded so prefix
/// listings sort by index.
pub fn chunk_path(doc_path: &str, generation: Uuid, index: u32) -> String {
    format!("{doc_path}/{CHUNKS_SEGMENT}/{generation}/{index:06}")
}

/// Parse generation and index out of a store path, if it is a chunk of
/// `doc_path`.
pub fn parse_chunk_path(doc_path: &str, path: &str) -> Option<(Uuid, u32)> {
    let rest = path.strip_prefix(&chunk_prefix(doc_path))?;
    let (generation, index) = rest.split_once('/')?;
    Some((generation.parse().ok()?, index.parse().ok()?))
}

/// Splits full CRDT state into size-bounded records and reassembles it.
#[derive(Debug, Clone)]
pub struct SnapshotCodec {
    chunk_size: usize,
    compression: Compression,
}

impl SnapshotCodec {
    pub fn new(chunk_size: usize, compression: Compression) -> Result<Self, CodecError> {
        if chunk_size == 0 {
            return Err(CodecError::ChunkSize(chunk_size));
        }
        Ok(Self {
            chunk_size,
            compression,
        })
    }

    /// Size chunks so every record fits a store's per-document limit.
    pub fn for_store_limit(
        max_document_size: usize,
        compression: Compression,
    ) -> Result<Self, CodecError> {
        let chunk_size = max_document_size.saturating_sub(RECORD_OVERHEAD);
        if chunk_size == 0 {
            return Err(CodecError::ChunkSize(max_document_size));
        }
        Self::new(chunk_size, compression)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Encode a full state under a fresh generation.
    pub fn encode(&self, full_state: &[u8]) -> EncodedSnapshot {
        let payload = match self.compression {
            Compression::None => full_state.to_vec(),
            Compression::Lz4 => lz4_flex::compress_prepend_size(full_state),
        };
        let generation = Uuid::new_v4();
        let total_len = payload.len() as u64;

        let (content, chunks) = if payload.len() <= self.chunk_size {
            (SnapshotContent::Inline(payload), Vec::new())
        } else {
            let chunks: Vec<ChunkRecord> = payload
                .chunks(self.chunk_size)
                .enumerate()
                .map(|(index, bytes)| ChunkRecord {
                    generation,
                    index: index as u32,
                    bytes: bytes.to_vec(),
                })
                .collect();
            let count = chunks.len() as u32;
            (SnapshotContent::Chunked { count }, chunks)
        };

        EncodedSnapshot {
            header: SnapshotHeader {
                generation,
                content,
                total_len,
                last_updated: unix_millis(),
                compression: self.compression,
            },
            chunks,
        }
    }

    /// Reassemble and decompress the full state a header describes.
    ///
    /// `chunks` may arrive in any order and may include orphans from older
    /// snapshots. Anything short of a complete, consistent set of the
    /// header's generation is rejected.
    pub fn decode(header: &SnapshotHeader, chunks: &[ChunkRecord]) -> Result<Vec<u8>, CodecError> {
        let payload = match &header.content {
            SnapshotContent::Inline(bytes) => bytes.clone(),
            SnapshotContent::Chunked { count } => {
                let mut parts: Vec<&ChunkRecord> =
                    chunks.iter().filter(|c| c.index < *count).collect();
                parts.sort_by_key(|c| c.index);

                if parts.len() != *count as usize {
                    return Err(CodecError::ReassemblyMismatch(format!(
                        "expected {count} chunks, found {}",
                        parts.len()
                    )));
                }

                let mut payload = Vec::with_capacity(header.total_len as usize);
                for (expected, part) in parts.iter().enumerate() {
                    if part.index as usize != expected {
                        return Err(CodecError::ReassemblyMismatch(format!(
                            "chunk {expected} missing or duplicated"
                        )));
                    }
                    if part.generation != header.generation {
                        return Err(CodecError::ReassemblyMismatch(format!(
                            "chunk {} belongs to generation {}, header is {}",
                            part.index, part.generation, header.generation
                        )));
                    }
                    payload.extend_from_slice(&part.bytes);
                }
                payload
            }
        };

        if payload.len() as u64 != header.total_len {
            return Err(CodecError::ReassemblyMismatch(format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.total_len
            )));
        }

        match header.compression {
            Compression::None => Ok(payload),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(&payload)
                .map_err(|e| CodecError::Decompression(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_small_state_is_inline() {
        let codec = SnapshotCodec::new(1024, Compression::None).unwrap();
        let state = payload(100);
        let encoded = codec.encode(&state);

        assert!(encoded.chunks.is_empty());
        assert_eq!(encoded.header.chunk_count(), 0);
        assert_eq!(SnapshotCodec::decode(&encoded.header, &[]).unwrap(), state);
    }

    #[test]
    fn test_oversized_state_round_trips_through_chunks() {
        let codec = SnapshotCodec::new(100, Compression::None).unwrap();
        let state = payload(1050);
        let encoded = codec.encode(&state);

        assert_eq!(encoded.chunks.len(), 11);
        assert!(encoded.chunks.iter().all(|c| c.bytes.len() <= 100));
        assert_eq!(encoded.header.content, SnapshotContent::Chunked { count: 11 });

        // Order of arrival does not matter
        let mut shuffled = encoded.chunks.clone();
        shuffled.reverse();
        shuffled.swap(2, 7);
        assert_eq!(SnapshotCodec::decode(&encoded.header, &shuffled).unwrap(), state);
    }

    #[test]
    fn test_lz4_round_trip() {
        let codec = SnapshotCodec::new(64, Compression::Lz4).unwrap();
        assert_eq!(codec.compression(), Compression::Lz4);
        let state = b"abcabcabc".repeat(500);
        let encoded = codec.encode(&state);

        assert_eq!(encoded.header.compression, codec.compression());
        assert!(encoded.header.total_len < state.len() as u64);
        assert_eq!(
            SnapshotCodec::decode(&encoded.header, &encoded.chunks).unwrap(),
            state
        );
    }

    #[test]
    fn test_missing_chunk_is_mismatch() {
        let codec = SnapshotCodec::new(10, Compression::None).unwrap();
        let encoded = codec.encode(&payload(35));
        let partial = &encoded.chunks[..3];

        let err = SnapshotCodec::decode(&encoded.header, partial).unwrap_err();
        assert!(matches!(err, CodecError::ReassemblyMismatch(_)));
    }

    #[test]
    fn test_foreign_generation_is_mismatch() {
        let codec = SnapshotCodec::new(10, Compression::None).unwrap();
        let state = payload(30);
        let first = codec.encode(&state);
        let second = codec.encode(&state);

        let mut mixed = first.chunks.clone();
        mixed[1] = second.chunks[1].clone();
        let err = SnapshotCodec::decode(&first.header, &mixed).unwrap_err();
        assert!(matches!(err, CodecError::ReassemblyMismatch(_)));
    }

    #[test]
    fn test_orphan_chunks_ignored() {
        let codec = SnapshotCodec::new(10, Compression::None).unwrap();
        let state = payload(20);
        let encoded = codec.encode(&state);

        let mut with_orphan = encoded.chunks.clone();
        with_orphan.push(ChunkRecord {
            generation: Uuid::new_v4(),
            index: 2,
            bytes: vec![0xAA; 10],
        });
        assert_eq!(
            SnapshotCodec::decode(&encoded.header, &with_orphan).unwrap(),
            state
        );
    }

    #[test]
    fn test_header_record_round_trip() {
        let codec = SnapshotCodec::new(10, Compression::Lz4).unwrap();
        let encoded = codec.encode(&payload(200));
        let bytes = encoded.header.encode().unwrap();
        assert_eq!(SnapshotHeader::decode(&bytes).unwrap(), encoded.header);

        let chunk_bytes = encoded.chunks[0].encode().unwrap();
        assert_eq!(ChunkRecord::decode(&chunk_bytes).unwrap(), encoded.chunks[0]);
    }

    #[test]
    fn test_garbage_record_rejected() {
        assert!(matches!(
            SnapshotHeader::decode(&[0xFF; 7]),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_records_fit_store_limit() {
        let limit = 512;
        let codec = SnapshotCodec::for_store_limit(limit, Compression::None).unwrap();
        let encoded = codec.encode(&payload(5000));

        for chunk in &encoded.chunks {
            assert!(chunk.encode().unwrap().len() <= limit);
        }
        let inline = codec.encode(&payload(codec.chunk_size()));
        assert!(inline.header.encode().unwrap().len() <= limit);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(SnapshotCodec::new(0, Compression::None).is_err());
        assert!(SnapshotCodec::for_store_limit(RECORD_OVERHEAD, Compression::None).is_err());
    }

    #[test]
    fn test_chunk_paths() {
        let generation = Uuid::from_u128(0x42);
        let path = chunk_path("docs/a", generation, 3);
        assert_eq!(path, format!("docs/a/chunks/{generation}/000003"));
        assert!(path.starts_with(&generation_prefix("docs/a", generation)));
        assert_eq!(parse_chunk_path("docs/a", &path), Some((generation, 3)));

        assert_eq!(parse_chunk_path("docs/ab", &path), None);
        assert_eq!(parse_chunk_path("docs/a", "docs/a/chunks/000012"), None);
        assert_eq!(parse_chunk_path("docs/a", "docs/a/presence/7"), None);
    }

    #[test]
    fn test_generations_never_share_paths() {
        let codec = SnapshotCodec::new(8, Compression::None).unwrap();
        let first = codec.encode(&payload(40));
        let second = codec.encode(&payload(40));
        for (a, b) in first.chunks.iter().zip(&second.chunks) {
            assert_eq!(a.index, b.index);
            assert_ne!(
                chunk_path("docs/a", first.header.generation, a.index),
                chunk_path("docs/a", second.header.generation, b.index)
            );
        }
    }
}
