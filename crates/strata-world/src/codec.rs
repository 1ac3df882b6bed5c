//! Versioned binary form of a saved chunk.
//!
//! Layout: `[u32 header_len][bincode RecordHeader][body]` where the body is
//! the bincode-encoded snapshot plus its deferred updates, LZ4-compressed
//! (size-prepended) when the header says so.

use serde::{Deserialize, Serialize};
use std::io::Write;
use strata_common::{ChunkCoord, MagicBytes, SchemaVersion};
use thiserror::Error;

use crate::snapshot::{ChunkSnapshot, DynamicBlockUpdate};

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    /// Deserialization failed
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
    /// Invalid magic bytes
    #[error("Invalid chunk format")]
    InvalidFormat,
    /// Version mismatch
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Expected version
        expected: String,
        /// Actual version
        actual: String,
    },
    /// Compression failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Writing to the destination failed
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Header preceding every chunk record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Magic bytes for format identification
    pub magic: [u8; 4],
    /// Schema version
    pub version: SchemaVersion,
    /// Chunk coordinate
    pub coord: ChunkCoord,
    /// Whether the body is LZ4 compressed
    pub compressed: bool,
}

impl RecordHeader {
    /// Creates a header for the current schema.
    #[must_use]
    pub fn new(coord: ChunkCoord, compressed: bool) -> Self {
        Self {
            magic: MagicBytes::CHUNK.0,
            version: SchemaVersion::CHUNK_FORMAT,
            coord,
            compressed,
        }
    }

    /// Validates the header.
    pub fn validate(&self) -> CodecResult<()> {
        if self.magic != MagicBytes::CHUNK.0 {
            return Err(CodecError::InvalidFormat);
        }
        if !SchemaVersion::CHUNK_FORMAT.can_read(&self.version) {
            return Err(CodecError::VersionMismatch {
                expected: SchemaVersion::CHUNK_FORMAT.to_string(),
                actual: self.version.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RecordBodyRef<'a> {
    snapshot: &'a ChunkSnapshot,
    updates: &'a [DynamicBlockUpdate],
}

/// A decoded chunk record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChunkRecord {
    /// Snapshot as it was written
    pub snapshot: ChunkSnapshot,
    /// Deferred updates written alongside it
    pub updates: Vec<DynamicBlockUpdate>,
}

/// Encodes a snapshot and its updates into `out`. Returns the bytes written.
pub fn write_chunk<W: Write>(
    out: &mut W,
    snapshot: &ChunkSnapshot,
    updates: &[DynamicBlockUpdate],
    compress: bool,
) -> CodecResult<usize> {
    let header = RecordHeader::new(snapshot.coord(), compress);
    let header_bytes =
        bincode::serialize(&header).map_err(|e| CodecError::SerializationFailed(e.to_string()))?;

    let body = bincode::serialize(&RecordBodyRef { snapshot, updates })
        .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
    let body = if compress {
        lz4_flex::compress_prepend_size(&body)
    } else {
        body
    };

    out.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
    out.write_all(&header_bytes)?;
    out.write_all(&body)?;

    Ok(4 + header_bytes.len() + body.len())
}

/// Encodes into a fresh buffer.
pub fn encode_chunk(
    snapshot: &ChunkSnapshot,
    updates: &[DynamicBlockUpdate],
    compress: bool,
) -> CodecResult<Vec<u8>> {
    let mut bytes = Vec::new();
    write_chunk(&mut bytes, snapshot, updates, compress)?;
    Ok(bytes)
}

/// Decodes a record produced by [`write_chunk`].
pub fn read_chunk(bytes: &[u8]) -> CodecResult<ChunkRecord> {
    if bytes.len() < 4 {
        return Err(CodecError::DeserializationFailed("data too short".into()));
    }

    let header_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if bytes.len() < 4 + header_len {
        return Err(CodecError::DeserializationFailed(
            "header length mismatch".into(),
        ));
    }

    let header: RecordHeader = bincode::deserialize(&bytes[4..4 + header_len])
        .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;
    header.validate()?;

    let body = &bytes[4 + header_len..];
    let record: ChunkRecord = if header.compressed {
        let raw = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| CodecError::CompressionFailed(e.to_string()))?;
        bincode::deserialize::<ChunkRecord>(&raw)
    } else {
        bincode::deserialize::<ChunkRecord>(body)
    }
    .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;

    if record.snapshot.coord() != header.coord {
        return Err(CodecError::DeserializationFailed(format!(
            "header says chunk {} but body holds {}",
            header.coord,
            record.snapshot.coord()
        )));
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{BlockState, Chunk, EntityRecord};
    use strata_common::{EntityId, LocalCoord, WorldId};

    fn sample() -> (ChunkSnapshot, Vec<DynamicBlockUpdate>) {
        let chunk = Chunk::new(WorldId::from_raw(3), ChunkCoord::new(-2, 5, 1));
        chunk.fill(BlockState::new(1, 0));
        chunk.set_block(LocalCoord::new(0, 15, 0), BlockState::new(42, 7));
        chunk.add_entity(EntityRecord {
            id: EntityId::from_raw(11),
            kind: "minecart".into(),
            position: [0.5, 15.0, 0.5],
        });
        chunk.set_data("light", vec![15; 8]);
        let updates = vec![
            DynamicBlockUpdate::new(LocalCoord::new(0, 15, 0), 120, 1),
            DynamicBlockUpdate::new(LocalCoord::new(3, 3, 3), 140, -1),
        ];
        (chunk.snapshot("overworld"), updates)
    }

    #[test]
    fn test_compressed_record_decodes_to_same_content() {
        let (snapshot, updates) = sample();
        let bytes = encode_chunk(&snapshot, &updates, true).expect("encode");
        let record = read_chunk(&bytes).expect("decode");
        assert_eq!(record.snapshot, snapshot);
        assert_eq!(record.updates, updates);
    }

    #[test]
    fn test_uniform_chunk_compresses() {
        let (snapshot, updates) = sample();
        let raw = encode_chunk(&snapshot, &updates, false).expect("encode raw");
        let packed = encode_chunk(&snapshot, &updates, true).expect("encode lz4");
        assert!(packed.len() < raw.len());
        assert_eq!(read_chunk(&raw).expect("decode raw").snapshot, snapshot);
    }

    #[test]
    fn test_write_chunk_reports_length() {
        let (snapshot, updates) = sample();
        let mut out = Vec::new();
        let written = write_chunk(&mut out, &snapshot, &updates, true).expect("write");
        assert_eq!(written, out.len());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let (snapshot, updates) = sample();
        let mut bytes = encode_chunk(&snapshot, &updates, false).expect("encode");
        bytes[4] = b'X';
        assert!(matches!(read_chunk(&bytes), Err(CodecError::InvalidFormat)));
    }

    #[test]
    fn test_truncated_record_rejected() {
        assert!(read_chunk(&[1, 0]).is_err());
        let (snapshot, updates) = sample();
        let bytes = encode_chunk(&snapshot, &updates, true).expect("encode");
        assert!(read_chunk(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_header_validation() {
        let mut header = RecordHeader::new(ChunkCoord::new(0, 0, 0), false);
        assert!(header.validate().is_ok());
        header.version = SchemaVersion::new(9, 0, 0);
        assert!(matches!(
            header.validate(),
            Err(CodecError::VersionMismatch { .. })
        ));
    }
}
