//! Region file layout.
//!
//! Each region file stores a 16x16x16 block of chunks:
//! - Fixed header
//! - Chunk offset table and timestamp table
//! - Chunk payloads aligned to 4 KiB sectors
//!
//! The payload bytes are opaque here; see [`crate::codec`] for their format.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};
use strata_common::{ChunkCoord, MagicBytes};
use thiserror::Error;

/// Chunks per region along each axis.
pub const REGION_SIZE: u32 = 16;

/// Total chunks in a region.
pub const CHUNKS_PER_REGION: usize = (REGION_SIZE * REGION_SIZE * REGION_SIZE) as usize;

/// Current region format version.
pub const REGION_FORMAT_VERSION: u32 = 1;

/// Sector size for chunk alignment (4KB).
pub const SECTOR_SIZE: u32 = 4096;

/// Maximum chunk size in sectors (255 * 4KB).
pub const MAX_CHUNK_SECTORS: u32 = u8::MAX as u32;

/// Region file header.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RegionHeader {
    /// Magic bytes for identification.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// Region X coordinate.
    pub region_x: i32,
    /// Region Y coordinate.
    pub region_y: i32,
    /// Region Z coordinate.
    pub region_z: i32,
    /// Number of chunks stored.
    pub chunk_count: u32,
    /// Seconds since epoch of the last write.
    pub timestamp: u64,
    /// Reserved for future use.
    pub reserved: [u32; 6],
}

impl RegionHeader {
    /// Header size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create a new region header.
    #[must_use]
    pub fn new(coord: RegionCoord) -> Self {
        Self {
            magic: MagicBytes::REGION.0,
            version: REGION_FORMAT_VERSION,
            region_x: coord.x,
            region_y: coord.y,
            region_z: coord.z,
            chunk_count: 0,
            timestamp: 0,
            reserved: [0; 6],
        }
    }

    /// Validate magic and version.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == MagicBytes::REGION.0 && self.version <= REGION_FORMAT_VERSION
    }

    /// Region coordinate recorded in the header.
    #[must_use]
    pub fn coord(&self) -> RegionCoord {
        RegionCoord::new(self.region_x, self.region_y, self.region_z)
    }
}

/// Chunk location entry in the offset table.
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ChunkLocation {
    /// Sector offset from start of file.
    pub sector_offset: u32,
    /// Number of sectors used.
    pub sector_count: u8,
    /// Reserved for alignment.
    pub reserved: [u8; 3],
}

impl ChunkLocation {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Check if this location is empty (no chunk stored).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sector_offset == 0 && self.sector_count == 0
    }

    /// Get byte offset in file.
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        u64::from(self.sector_offset) * u64::from(SECTOR_SIZE)
    }

    /// Get byte size.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.sector_count as usize * SECTOR_SIZE as usize
    }
}

/// Chunk timestamp entry.
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct ChunkTimestamp {
    /// Seconds since epoch.
    pub timestamp: u32,
}

impl ChunkTimestamp {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Region coordinate (one region covers 16x16x16 chunks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionCoord {
    /// Region X.
    pub x: i32,
    /// Region Y.
    pub y: i32,
    /// Region Z.
    pub z: i32,
}

impl RegionCoord {
    /// Creates a region coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Region containing a chunk.
    #[must_use]
    pub const fn from_chunk(chunk: ChunkCoord) -> Self {
        let size = REGION_SIZE as i32;
        Self {
            x: chunk.x.div_euclid(size),
            y: chunk.y.div_euclid(size),
            z: chunk.z.div_euclid(size),
        }
    }

    /// Index of a chunk within its region's tables.
    #[must_use]
    pub const fn local_chunk_index(chunk: ChunkCoord) -> usize {
        let size = REGION_SIZE as i32;
        let lx = chunk.x.rem_euclid(size) as usize;
        let ly = chunk.y.rem_euclid(size) as usize;
        let lz = chunk.z.rem_euclid(size) as usize;
        (ly * REGION_SIZE as usize + lz) * REGION_SIZE as usize + lx
    }

    /// Region filename.
    #[must_use]
    pub fn filename(&self) -> String {
        format!("r.{}.{}.{}.srg", self.x, self.y, self.z)
    }
}

/// Region file error.
#[derive(Debug, Error)]
pub enum RegionError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Invalid region file magic.
    #[error("Invalid region file magic")]
    InvalidMagic,
    /// Header does not describe the expected region.
    #[error("Region header mismatch: file holds {found:?}, expected {expected:?}")]
    HeaderMismatch {
        /// Region the caller asked for
        expected: RegionCoord,
        /// Region recorded in the file
        found: RegionCoord,
    },
    /// Chunk too large.
    #[error("Chunk too large: {0} bytes")]
    ChunkTooLarge(usize),
    /// Chunk index outside the region.
    #[error("Chunk index {0} outside region")]
    ChunkOutOfRange(usize),
    /// Stored length does not fit the chunk's sectors.
    #[error("Chunk {index} claims {length} bytes but owns {capacity}")]
    CorruptChunk {
        /// Local chunk index
        index: usize,
        /// Length read from disk
        length: usize,
        /// Bytes allocated to the chunk
        capacity: usize,
    },
}

/// Result type for region operations.
pub type RegionResult<T> = Result<T, RegionError>;

/// Open region file handle.
#[derive(Debug)]
pub struct RegionFile {
    /// File handle.
    file: File,
    /// Region header.
    header: RegionHeader,
    /// Chunk locations.
    locations: Vec<ChunkLocation>,
    /// Chunk timestamps.
    timestamps: Vec<ChunkTimestamp>,
    /// Path to file.
    path: PathBuf,
    /// Whether tables changed since the last flush.
    dirty: bool,
}

impl RegionFile {
    /// Size of the offset table in bytes.
    const OFFSET_TABLE_SIZE: usize = CHUNKS_PER_REGION * ChunkLocation::SIZE;

    /// Size of the timestamp table in bytes.
    const TIMESTAMP_TABLE_SIZE: usize = CHUNKS_PER_REGION * ChunkTimestamp::SIZE;

    /// Start of chunk data (after header and tables).
    const DATA_START: u64 =
        (RegionHeader::SIZE + Self::OFFSET_TABLE_SIZE + Self::TIMESTAMP_TABLE_SIZE) as u64;

    /// Create or open a region file.
    pub fn open(path: &Path, coord: RegionCoord) -> RegionResult<Self> {
        let exists = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if exists {
            Self::load_existing(file, path.to_path_buf(), coord)
        } else {
            Self::create_new(file, path.to_path_buf(), coord)
        }
    }

    fn load_existing(mut file: File, path: PathBuf, coord: RegionCoord) -> RegionResult<Self> {
        let mut header_bytes = [0u8; RegionHeader::SIZE];
        file.read_exact(&mut header_bytes)?;
        let header: RegionHeader = bytemuck::pod_read_unaligned(&header_bytes);

        if !header.is_valid() {
            return Err(RegionError::InvalidMagic);
        }
        if header.coord() != coord {
            return Err(RegionError::HeaderMismatch {
                expected: coord,
                found: header.coord(),
            });
        }

        let mut location_bytes = vec![0u8; Self::OFFSET_TABLE_SIZE];
        file.read_exact(&mut location_bytes)?;
        let locations: Vec<ChunkLocation> = location_bytes
            .chunks_exact(ChunkLocation::SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect();

        let mut timestamp_bytes = vec![0u8; Self::TIMESTAMP_TABLE_SIZE];
        file.read_exact(&mut timestamp_bytes)?;
        let timestamps: Vec<ChunkTimestamp> = timestamp_bytes
            .chunks_exact(ChunkTimestamp::SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect();

        Ok(Self {
            file,
            header,
            locations,
            timestamps,
            path,
            dirty: false,
        })
    }

    fn create_new(mut file: File, path: PathBuf, coord: RegionCoord) -> RegionResult<Self> {
        let header = RegionHeader::new(coord);
        let locations = vec![ChunkLocation::default(); CHUNKS_PER_REGION];
        let timestamps = vec![ChunkTimestamp::default(); CHUNKS_PER_REGION];

        file.write_all(bytemuck::bytes_of(&header))?;
        file.write_all(bytemuck::cast_slice(&locations))?;
        file.write_all(bytemuck::cast_slice(&timestamps))?;
        file.sync_all()?;

        Ok(Self {
            file,
            header,
            locations,
            timestamps,
            path,
            dirty: false,
        })
    }

    /// Read chunk data.
    pub fn read_chunk(&mut self, local_index: usize) -> RegionResult<Option<Vec<u8>>> {
        let location = *self
            .locations
            .get(local_index)
            .ok_or(RegionError::ChunkOutOfRange(local_index))?;
        if location.is_empty() {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(location.byte_offset()))?;

        let mut length_bytes = [0u8; 4];
        self.file.read_exact(&mut length_bytes)?;
        let length = u32::from_le_bytes(length_bytes) as usize;
        if 4 + length > location.byte_size() {
            return Err(RegionError::CorruptChunk {
                index: local_index,
                length,
                capacity: location.byte_size(),
            });
        }

        let mut data = vec![0u8; length];
        self.file.read_exact(&mut data)?;

        Ok(Some(data))
    }

    /// Write chunk data.
    pub fn write_chunk(&mut self, local_index: usize, data: &[u8]) -> RegionResult<()> {
        if local_index >= CHUNKS_PER_REGION {
            return Err(RegionError::ChunkOutOfRange(local_index));
        }

        let total_size = 4 + data.len();
        let sectors_needed = total_size.div_ceil(SECTOR_SIZE as usize) as u32;

        if sectors_needed > MAX_CHUNK_SECTORS {
            return Err(RegionError::ChunkTooLarge(data.len()));
        }

        let sector_offset = self.find_free_space(local_index, sectors_needed);
        let now = unix_seconds();

        self.file
            .seek(SeekFrom::Start(u64::from(sector_offset) * u64::from(SECTOR_SIZE)))?;
        self.file.write_all(&(data.len() as u32).to_le_bytes())?;
        self.file.write_all(data)?;

        let padding = (sectors_needed as usize * SECTOR_SIZE as usize) - total_size;
        if padding > 0 {
            self.file.write_all(&vec![0u8; padding])?;
        }

        // Tables are updated only once the payload is in place.
        self.locations[local_index] = ChunkLocation {
            sector_offset,
            sector_count: sectors_needed as u8,
            reserved: [0; 3],
        };
        self.timestamps[local_index] = ChunkTimestamp {
            timestamp: now as u32,
        };
        self.header.timestamp = now;
        self.header.chunk_count = self.count_chunks();
        self.dirty = true;

        Ok(())
    }

    /// Find free space in the region file.
    fn find_free_space(&self, local_index: usize, sectors_needed: u32) -> u32 {
        let current = &self.locations[local_index];
        if !current.is_empty() && u32::from(current.sector_count) >= sectors_needed {
            return current.sector_offset;
        }

        let mut max_sector = Self::DATA_START.div_ceil(u64::from(SECTOR_SIZE)) as u32;
        for loc in &self.locations {
            if !loc.is_empty() {
                max_sector = max_sector.max(loc.sector_offset + u32::from(loc.sector_count));
            }
        }
        max_sector
    }

    /// Delete a chunk.
    pub fn delete_chunk(&mut self, local_index: usize) -> RegionResult<()> {
        if local_index >= CHUNKS_PER_REGION {
            return Err(RegionError::ChunkOutOfRange(local_index));
        }

        self.locations[local_index] = ChunkLocation::default();
        self.timestamps[local_index] = ChunkTimestamp::default();
        self.header.chunk_count = self.count_chunks();
        self.dirty = true;

        Ok(())
    }

    fn count_chunks(&self) -> u32 {
        self.locations.iter().filter(|l| !l.is_empty()).count() as u32
    }

    /// Check if chunk exists.
    #[must_use]
    pub fn has_chunk(&self, local_index: usize) -> bool {
        self.locations
            .get(local_index)
            .is_some_and(|l| !l.is_empty())
    }

    /// Get chunk timestamp.
    #[must_use]
    pub fn chunk_timestamp(&self, local_index: usize) -> Option<u32> {
        if self.has_chunk(local_index) {
            Some(self.timestamps[local_index].timestamp)
        } else {
            None
        }
    }

    /// Write the tables back and sync to disk.
    pub fn flush(&mut self) -> RegionResult<()> {
        if !self.dirty {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytemuck::bytes_of(&self.header))?;
        self.file.write_all(bytemuck::cast_slice(&self.locations))?;
        self.file.write_all(bytemuck::cast_slice(&self.timestamps))?;
        self.file.sync_all()?;
        self.dirty = false;

        Ok(())
    }

    /// Get region coordinate.
    #[must_use]
    pub fn coord(&self) -> RegionCoord {
        self.header.coord()
    }

    /// Get number of stored chunks.
    #[must_use]
    pub fn chunk_count(&self) -> u32 {
        self.header.chunk_count
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegionFile {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("Failed to flush region {}: {e}", self.path.display());
        }
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_region_coord_from_chunk() {
        assert_eq!(
            RegionCoord::from_chunk(ChunkCoord::new(0, 0, 0)),
            RegionCoord::new(0, 0, 0)
        );
        assert_eq!(
            RegionCoord::from_chunk(ChunkCoord::new(15, 15, 15)),
            RegionCoord::new(0, 0, 0)
        );
        assert_eq!(
            RegionCoord::from_chunk(ChunkCoord::new(16, 0, -1)),
            RegionCoord::new(1, 0, -1)
        );
    }

    #[test]
    fn test_local_chunk_index() {
        assert_eq!(RegionCoord::local_chunk_index(ChunkCoord::new(0, 0, 0)), 0);
        assert_eq!(RegionCoord::local_chunk_index(ChunkCoord::new(1, 0, 0)), 1);
        assert_eq!(RegionCoord::local_chunk_index(ChunkCoord::new(0, 0, 1)), 16);
        assert_eq!(RegionCoord::local_chunk_index(ChunkCoord::new(0, 1, 0)), 256);
        assert_eq!(
            RegionCoord::local_chunk_index(ChunkCoord::new(-1, -1, -1)),
            CHUNKS_PER_REGION - 1
        );
    }

    #[test]
    fn test_region_filename() {
        assert_eq!(RegionCoord::new(5, -3, 0).filename(), "r.5.-3.0.srg");
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(RegionHeader::SIZE, 56);
        assert_eq!(ChunkLocation::SIZE, 8);
        assert_eq!(ChunkTimestamp::SIZE, 4);
    }

    #[test]
    fn test_chunk_location() {
        let loc = ChunkLocation::default();
        assert!(loc.is_empty());

        let loc = ChunkLocation {
            sector_offset: 10,
            sector_count: 2,
            reserved: [0; 3],
        };
        assert!(!loc.is_empty());
        assert_eq!(loc.byte_offset(), 10 * 4096);
        assert_eq!(loc.byte_size(), 2 * 4096);
    }

    #[test]
    fn test_region_file_write_read_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("r.0.0.0.srg");
        let coord = RegionCoord::new(0, 0, 0);

        {
            let mut region = RegionFile::open(&path, coord).expect("create");
            region.write_chunk(0, &[1, 2, 3, 4, 5]).expect("write 0");
            region.write_chunk(7, &[9; 5000]).expect("write 7");
            assert_eq!(region.read_chunk(0).expect("read"), Some(vec![1, 2, 3, 4, 5]));
            assert_eq!(region.chunk_count(), 2);
        }

        let mut region = RegionFile::open(&path, coord).expect("reopen");
        assert_eq!(region.read_chunk(7).expect("read"), Some(vec![9; 5000]));
        assert!(region.has_chunk(0));
        assert!(region.chunk_timestamp(7).is_some());
        assert_eq!(region.read_chunk(1).expect("read empty"), None);
    }

    #[test]
    fn test_rewrite_larger_chunk_moves_it() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("r.0.0.0.srg");
        let mut region = RegionFile::open(&path, RegionCoord::new(0, 0, 0)).expect("create");

        region.write_chunk(3, &[1; 10]).expect("small");
        region.write_chunk(4, &[2; 10]).expect("neighbour");
        region.write_chunk(3, &[3; 9000]).expect("grow");

        assert_eq!(region.read_chunk(3).expect("read"), Some(vec![3; 9000]));
        assert_eq!(region.read_chunk(4).expect("read"), Some(vec![2; 10]));
    }

    #[test]
    fn test_delete_chunk() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("r.0.0.0.srg");
        let mut region = RegionFile::open(&path, RegionCoord::new(0, 0, 0)).expect("create");
        region.write_chunk(2, b"gone soon").expect("write");
        region.delete_chunk(2).expect("delete");
        assert!(!region.has_chunk(2));
        assert_eq!(region.chunk_count(), 0);
    }

    #[test]
    fn test_oversized_and_out_of_range_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("r.0.0.0.srg");
        let mut region = RegionFile::open(&path, RegionCoord::new(0, 0, 0)).expect("create");

        let huge = vec![0u8; (MAX_CHUNK_SECTORS * SECTOR_SIZE) as usize];
        assert!(matches!(
            region.write_chunk(0, &huge),
            Err(RegionError::ChunkTooLarge(_))
        ));
        assert!(matches!(
            region.write_chunk(CHUNKS_PER_REGION, b"x"),
            Err(RegionError::ChunkOutOfRange(_))
        ));
    }

    #[test]
    fn test_header_mismatch_detected() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("r.0.0.0.srg");
        drop(RegionFile::open(&path, RegionCoord::new(0, 0, 0)).expect("create"));

        assert!(matches!(
            RegionFile::open(&path, RegionCoord::new(1, 0, 0)),
            Err(RegionError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupt_length_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("r.0.0.0.srg");
        let coord = RegionCoord::new(0, 0, 0);

        let offset = {
            let mut region = RegionFile::open(&path, coord).expect("create");
            region.write_chunk(5, &[7; 100]).expect("write");
            region.locations[5].byte_offset()
        };

        {
            let mut file = OpenOptions::new().write(true).open(&path).expect("open raw");
            file.seek(SeekFrom::Start(offset)).expect("seek");
            file.write_all(&u32::MAX.to_le_bytes()).expect("corrupt length");
        }

        let mut region = RegionFile::open(&path, coord).expect("reopen");
        assert!(matches!(
            region.read_chunk(5),
            Err(RegionError::CorruptChunk { index: 5, .. })
        ));
    }

    proptest! {
        #[test]
        fn chunk_maps_into_its_region(
            x in -1000i32..1000,
            y in -1000i32..1000,
            z in -1000i32..1000,
        ) {
            let chunk = ChunkCoord::new(x, y, z);
            let region = RegionCoord::from_chunk(chunk);
            let index = RegionCoord::local_chunk_index(chunk);
            prop_assert!(index < CHUNKS_PER_REGION);
            let size = REGION_SIZE as i32;
            prop_assert!(region.x * size <= x && x < (region.x + 1) * size);
            prop_assert!(region.y * size <= y && y < (region.y + 1) * size);
            prop_assert!(region.z * size <= z && z < (region.z + 1) * size);
        }
    }
}
