//! Per-world region file manager.
//!
//! Owns every open [`RegionFile`] of a world behind a single lock. Writers get
//! a [`ChunkOutputStream`] that buffers one encoded chunk and commits it into
//! the region on [`ChunkOutputStream::finish`]. A background timeout thread
//! closes regions that have been idle for too long.
//!
//! Shutdown is two idempotent steps, always in this order:
//! [`RegionFileManager::stop_timeout_thread`] then [`RegionFileManager::close_all`].

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use strata_common::ChunkCoord;
use tracing::{debug, error, info, warn};

use crate::config::PersistenceConfig;
use crate::region::{RegionCoord, RegionFile, RegionResult};
use crate::snapshot::ChunkSnapshot;

#[derive(Debug)]
struct OpenRegion {
    file: RegionFile,
    last_access: Instant,
}

/// Cache of open region handles.
#[derive(Debug)]
struct RegionCache {
    base_path: PathBuf,
    regions: HashMap<RegionCoord, OpenRegion>,
    max_open: usize,
}

impl RegionCache {
    fn region(&mut self, coord: RegionCoord) -> RegionResult<&mut RegionFile> {
        if self.regions.len() >= self.max_open && !self.regions.contains_key(&coord) {
            self.evict_least_recent();
        }

        let entry = match self.regions.entry(coord) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                fs::create_dir_all(&self.base_path)?;
                let path = self.base_path.join(coord.filename());
                let file = RegionFile::open(&path, coord)?;
                debug!("Opened region {}", path.display());
                e.insert(OpenRegion {
                    file,
                    last_access: Instant::now(),
                })
            },
        };
        entry.last_access = Instant::now();
        Ok(&mut entry.file)
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .regions
            .iter()
            .min_by_key(|(_, r)| r.last_access)
            .map(|(coord, _)| *coord);
        if let Some(coord) = oldest {
            if let Some(region) = self.regions.remove(&coord) {
                Self::close_region(region);
            }
        }
    }

    fn evict_idle(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let idle: Vec<RegionCoord> = self
            .regions
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_access) >= timeout)
            .map(|(coord, _)| *coord)
            .collect();
        for coord in &idle {
            if let Some(region) = self.regions.remove(coord) {
                Self::close_region(region);
            }
        }
        idle.len()
    }

    fn close_all(&mut self) -> usize {
        let count = self.regions.len();
        for (_, region) in self.regions.drain() {
            Self::close_region(region);
        }
        count
    }

    fn close_region(mut region: OpenRegion) {
        if let Err(e) = region.file.flush() {
            error!(
                "Failed to flush region {} on close: {e}",
                region.file.path().display()
            );
        }
    }
}

/// Handle to the idle-timeout thread. Dropping `stop` wakes and ends it.
#[derive(Debug)]
struct TimeoutThread {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Region file statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Number of open region handles.
    pub open_regions: usize,
    /// Total chunks across open regions.
    pub total_chunks: u32,
}

/// Owner of a world's region file handles.
#[derive(Debug)]
pub struct RegionFileManager {
    cache: Arc<Mutex<RegionCache>>,
    timeout_thread: Mutex<Option<TimeoutThread>>,
    idle_timeout: Duration,
    check_interval: Duration,
}

impl RegionFileManager {
    /// Creates a manager storing regions under `base_path`. No thread is started.
    #[must_use]
    pub fn new<P: AsRef<Path>>(base_path: P, config: &PersistenceConfig) -> Self {
        Self {
            cache: Arc::new(Mutex::new(RegionCache {
                base_path: base_path.as_ref().to_path_buf(),
                regions: HashMap::new(),
                max_open: config.max_open_regions.max(1),
            })),
            timeout_thread: Mutex::new(None),
            idle_timeout: config.region_idle_timeout(),
            check_interval: config.timeout_check_interval(),
        }
    }

    /// Directory holding the region files.
    #[must_use]
    pub fn base_path(&self) -> PathBuf {
        self.cache.lock().base_path.clone()
    }

    /// Starts the idle-timeout thread if it is not running.
    pub fn start_timeout_thread(&self, name: &str) -> io::Result<()> {
        let mut slot = self.timeout_thread.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (stop, stopped) = bounded::<()>(0);
        let cache = Arc::clone(&self.cache);
        let idle_timeout = self.idle_timeout;
        let interval = self.check_interval;

        let handle = thread::Builder::new()
            .name(format!("region-timeout-{name}"))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let closed = cache.lock().evict_idle(idle_timeout);
                        if closed > 0 {
                            debug!("Closed {closed} idle region files");
                        }
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        *slot = Some(TimeoutThread { stop, handle });
        Ok(())
    }

    /// Stops the idle-timeout thread and waits for it. Safe to call repeatedly.
    pub fn stop_timeout_thread(&self) {
        let Some(thread) = self.timeout_thread.lock().take() else {
            return;
        };
        drop(thread.stop);
        if thread.handle.join().is_err() {
            warn!("Region timeout thread panicked");
        }
    }

    /// Returns whether the idle-timeout thread is running.
    #[must_use]
    pub fn is_timeout_thread_running(&self) -> bool {
        self.timeout_thread.lock().is_some()
    }

    /// Flushes and releases every open handle. Safe to call repeatedly.
    ///
    /// Regions are reopened on demand by later requests.
    pub fn close_all(&self) {
        let closed = self.cache.lock().close_all();
        if closed > 0 {
            info!("Closed {closed} region files");
        }
    }

    /// Opens a destination for a snapshot's chunk.
    ///
    /// Ordinary I/O failures are logged and reported as `None`.
    pub fn get_output_stream_for(&self, snapshot: &ChunkSnapshot) -> Option<ChunkOutputStream> {
        let coord = snapshot.coord();
        let region = RegionCoord::from_chunk(coord);
        if let Err(e) = self.cache.lock().region(region) {
            warn!("Unable to open region {region:?} for chunk {coord}: {e}");
            return None;
        }
        Some(ChunkOutputStream {
            cache: Arc::clone(&self.cache),
            coord,
            buffer: Vec::new(),
        })
    }

    /// Reads the stored bytes of a chunk, if any.
    pub fn read_chunk(&self, coord: ChunkCoord) -> RegionResult<Option<Vec<u8>>> {
        let mut cache = self.cache.lock();
        let region = cache.region(RegionCoord::from_chunk(coord))?;
        region.read_chunk(RegionCoord::local_chunk_index(coord))
    }

    /// Checks whether a chunk has been stored.
    pub fn has_chunk(&self, coord: ChunkCoord) -> RegionResult<bool> {
        let mut cache = self.cache.lock();
        let region = cache.region(RegionCoord::from_chunk(coord))?;
        Ok(region.has_chunk(RegionCoord::local_chunk_index(coord)))
    }

    /// Deletes a stored chunk.
    pub fn delete_chunk(&self, coord: ChunkCoord) -> RegionResult<()> {
        let mut cache = self.cache.lock();
        let region = cache.region(RegionCoord::from_chunk(coord))?;
        region.delete_chunk(RegionCoord::local_chunk_index(coord))
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> RegionStats {
        let cache = self.cache.lock();
        RegionStats {
            open_regions: cache.regions.len(),
            total_chunks: cache.regions.values().map(|r| r.file.chunk_count()).sum(),
        }
    }
}

impl Drop for RegionFileManager {
    fn drop(&mut self) {
        self.stop_timeout_thread();
        self.close_all();
    }
}

/// Buffered destination for one chunk record.
///
/// Nothing reaches the region file until [`ChunkOutputStream::finish`]
/// succeeds; dropping an unfinished stream discards the buffer.
#[derive(Debug)]
pub struct ChunkOutputStream {
    cache: Arc<Mutex<RegionCache>>,
    coord: ChunkCoord,
    buffer: Vec<u8>,
}

impl ChunkOutputStream {
    /// Chunk this stream writes.
    #[must_use]
    pub const fn coord(&self) -> ChunkCoord {
        self.coord
    }

    /// Bytes buffered so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Commits the buffered record into its region and syncs the tables.
    pub fn finish(self) -> RegionResult<()> {
        let mut cache = self.cache.lock();
        let region = cache.region(RegionCoord::from_chunk(self.coord))?;
        region.write_chunk(RegionCoord::local_chunk_index(self.coord), &self.buffer)?;
        region.flush()
    }
}

impl Write for ChunkOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use strata_common::WorldId;
    use tempfile::TempDir;

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            region_idle_timeout_ms: 20,
            timeout_check_interval_ms: 10,
            ..PersistenceConfig::default()
        }
    }

    fn snapshot(coord: ChunkCoord) -> ChunkSnapshot {
        Chunk::new(WorldId::from_raw(1), coord).snapshot("test")
    }

    #[test]
    fn test_stream_commits_only_on_finish() {
        let dir = TempDir::new().expect("temp dir");
        let manager = RegionFileManager::new(dir.path(), &config());
        let coord = ChunkCoord::new(1, 2, 3);

        let mut out = manager
            .get_output_stream_for(&snapshot(coord))
            .expect("destination");
        out.write_all(b"payload").expect("buffer");
        assert_eq!(out.len(), 7);
        assert_eq!(manager.read_chunk(coord).expect("read"), None);

        out.finish().expect("commit");
        assert_eq!(
            manager.read_chunk(coord).expect("read"),
            Some(b"payload".to_vec())
        );
    }

    #[test]
    fn test_dropped_stream_writes_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let manager = RegionFileManager::new(dir.path(), &config());
        let coord = ChunkCoord::new(0, 0, 0);
        {
            let mut out = manager
                .get_output_stream_for(&snapshot(coord))
                .expect("destination");
            out.write_all(b"abandoned").expect("buffer");
        }
        assert!(!manager.has_chunk(coord).expect("has_chunk"));
    }

    #[test]
    fn test_unopenable_destination_is_none() {
        let dir = TempDir::new().expect("temp dir");
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").expect("write blocker");

        let manager = RegionFileManager::new(blocker.join("region"), &config());
        assert!(manager
            .get_output_stream_for(&snapshot(ChunkCoord::new(0, 0, 0)))
            .is_none());
    }

    #[test]
    fn test_stop_and_close_are_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let manager = RegionFileManager::new(dir.path(), &config());
        manager.start_timeout_thread("test").expect("start");
        manager.start_timeout_thread("test").expect("start again");
        assert!(manager.is_timeout_thread_running());

        let coord = ChunkCoord::new(0, 0, 0);
        let mut out = manager
            .get_output_stream_for(&snapshot(coord))
            .expect("destination");
        out.write_all(b"data").expect("buffer");
        out.finish().expect("commit");

        manager.stop_timeout_thread();
        manager.stop_timeout_thread();
        assert!(!manager.is_timeout_thread_running());

        manager.close_all();
        manager.close_all();
        assert_eq!(manager.stats().open_regions, 0);

        // Closed managers still serve reads by reopening the region.
        assert_eq!(manager.read_chunk(coord).expect("read"), Some(b"data".to_vec()));
    }

    #[test]
    fn test_timeout_thread_closes_idle_regions() {
        let dir = TempDir::new().expect("temp dir");
        let manager = RegionFileManager::new(dir.path(), &config());
        manager
            .get_output_stream_for(&snapshot(ChunkCoord::new(0, 0, 0)))
            .expect("destination");
        assert_eq!(manager.stats().open_regions, 1);

        manager.start_timeout_thread("test").expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.stats().open_regions > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        manager.stop_timeout_thread();
        assert_eq!(manager.stats().open_regions, 0);
    }

    #[test]
    fn test_cache_limit_evicts_least_recent() {
        let dir = TempDir::new().expect("temp dir");
        let config = PersistenceConfig {
            max_open_regions: 2,
            ..PersistenceConfig::default()
        };
        let manager = RegionFileManager::new(dir.path(), &config);

        for x in 0..3 {
            let coord = ChunkCoord::new(x * 16, 0, 0);
            let mut out = manager
                .get_output_stream_for(&snapshot(coord))
                .expect("destination");
            out.write_all(&[x as u8]).expect("buffer");
            out.finish().expect("commit");
        }

        assert_eq!(manager.stats().open_regions, 2);
        assert_eq!(
            manager.read_chunk(ChunkCoord::new(0, 0, 0)).expect("read"),
            Some(vec![0])
        );
    }
}
