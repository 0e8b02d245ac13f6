//! Immutable on-disk blocks: `<ulid>/{meta.json, index, chunks/*, tombstones}`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::chunks::ChunkReader;
use crate::index::{IndexReader, INDEX_FILE};
use crate::tombstones::{self, MemTombstones};
use crate::{clamp_interval, Error, Interval, Result, Tsid};

pub const META_FILE: &str = "meta.json";
pub const META_VERSION: u32 = 1;

/// Block sample/series statistics, kept in `meta.json`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub num_samples: u64,
    pub num_series: u64,
    pub num_chunks: u64,
    pub num_tombstones: u64,
}

/// Compaction lineage of a block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetaCompaction {
    /// Number of compactions this block went through, starting at 1 for
    /// blocks persisted from the head.
    pub level: u32,
    /// ULIDs of the level-1 blocks this block descends from.
    pub sources: Vec<Ulid>,
    /// Direct inputs whose data this block subsumes; deleted on reload.
    pub parents: Vec<Ulid>,
    pub deletable: bool,
}

/// Metadata describing one block directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub ulid: Ulid,
    /// Inclusive lower bound of the block's time range.
    pub min_time: i64,
    /// Exclusive upper bound of the block's time range.
    pub max_time: i64,
    pub stats: BlockStats,
    pub compaction: BlockMetaCompaction,
    pub version: u32,
}

impl BlockMeta {
    pub fn new(ulid: Ulid, min_time: i64, max_time: i64) -> Self {
        Self {
            ulid,
            min_time,
            max_time,
            stats: BlockStats::default(),
            compaction: BlockMetaCompaction {
                level: 1,
                ..Default::default()
            },
            version: META_VERSION,
        }
    }

    pub fn overlap_closed(&self, mint: i64, maxt: i64) -> bool {
        self.min_time <= maxt && mint < self.max_time
    }
}

/// Read `dir/meta.json`.
pub fn read_block_meta(dir: &Path) -> Result<BlockMeta> {
    let data = fs::read(dir.join(META_FILE))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write `dir/meta.json` atomically, pretty-printed.
pub fn write_block_meta(dir: &Path, meta: &BlockMeta) -> Result<()> {
    let tmp = dir.join(format!("{META_FILE}.tmp"));
    let mut file = File::create(&tmp)?;
    serde_json::to_writer_pretty(&mut file, meta)?;
    file.write_all(b"\n")?;
    file.sync_data()?;
    fs::rename(&tmp, dir.join(META_FILE))?;
    Ok(())
}

/// Subdirectories of `dir` whose names parse as ULIDs.
pub fn block_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if Ulid::from_string(name).is_ok() {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// An opened block: its three readers behind a pending-reader gate.
pub struct Block {
    dir: PathBuf,
    meta: RwLock<BlockMeta>,
    index: IndexReader,
    chunks: ChunkReader,
    stones: MemTombstones,
    size: u64,
    pending_readers: Mutex<usize>,
    drained: Condvar,
    closing: AtomicBool,
}

impl Block {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Block> {
        let dir = dir.into();
        let meta = read_block_meta(&dir)?;
        let index = IndexReader::open(&dir.join(INDEX_FILE))?;
        let chunks = ChunkReader::open(&dir.join("chunks"))?;
        let stones = tombstones::read_tombstones(&dir)?;

        let mut size = index.size() + chunks.size();
        for name in [META_FILE, tombstones::TOMBSTONES_FILE] {
            if let Ok(md) = fs::metadata(dir.join(name)) {
                size += md.len();
            }
        }
        Ok(Block {
            dir,
            meta: RwLock::new(meta),
            index,
            chunks,
            stones,
            size,
            pending_readers: Mutex::new(0),
            drained: Condvar::new(),
            closing: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> BlockMeta {
        self.meta.read().unwrap().clone()
    }

    pub fn ulid(&self) -> Ulid {
        self.meta.read().unwrap().ulid
    }

    /// Bytes the block occupies on disk.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn overlap_closed(&self, mint: i64, maxt: i64) -> bool {
        self.meta.read().unwrap().overlap_closed(mint, maxt)
    }

    pub(crate) fn index(&self) -> &IndexReader {
        &self.index
    }

    pub(crate) fn chunks(&self) -> &ChunkReader {
        &self.chunks
    }

    pub(crate) fn tombstones(&self) -> &MemTombstones {
        &self.stones
    }

    /// Register a reader. Returns `None` once the block started closing.
    pub fn start_read(self: &Arc<Self>) -> Option<BlockReadGuard> {
        let mut pending = self.pending_readers.lock().unwrap();
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        *pending += 1;
        Some(BlockReadGuard {
            block: self.clone(),
        })
    }

    fn end_read(&self) {
        let mut pending = self.pending_readers.lock().unwrap();
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    /// Flag the block for deletion on the next reload.
    pub fn set_deletable(&self) -> Result<()> {
        let mut meta = self.meta.write().unwrap();
        meta.compaction.deletable = true;
        write_block_meta(&self.dir, &meta)
    }

    /// Add deletion intervals for `[mint, maxt]` to every listed series
    /// with overlapping chunks and persist the tombstone file.
    pub fn del(&self, mint: i64, maxt: i64, tsids: &[Tsid]) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotFound);
        }
        let (mint, maxt) = {
            let meta = self.meta.read().unwrap();
            clamp_interval(mint, maxt, meta.min_time, meta.max_time - 1)
        };
        if mint > maxt {
            return Ok(());
        }

        let mut dirty = false;
        for tsid in tsids {
            let Some(chunks) = self.index.series(tsid)? else {
                continue;
            };
            if chunks.iter().any(|c| c.overlap_closed(mint, maxt)) {
                self.stones.add_interval(*tsid, Interval::new(mint, maxt));
                dirty = true;
            }
        }
        if !dirty {
            return Ok(());
        }

        tombstones::write_tombstones(&self.dir, &self.stones)?;
        let mut meta = self.meta.write().unwrap();
        meta.stats.num_tombstones = self.stones.total();
        write_block_meta(&self.dir, &meta)
    }

    /// Block until every outstanding reader released its handle.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let mut pending = self.pending_readers.lock().unwrap();
        while *pending > 0 {
            pending = self.drained.wait(pending).unwrap();
        }
        debug!(dir = %self.dir.display(), "block closed");
    }
}

/// Keeps a block's readers alive; dropping releases the pending-reader
/// count so `close` can finish.
pub struct BlockReadGuard {
    block: Arc<Block>,
}

impl BlockReadGuard {
    pub fn block(&self) -> &Block {
        &self.block
    }
}

impl Drop for BlockReadGuard {
    fn drop(&mut self) {
        self.block.end_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_json_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut meta = BlockMeta::new(Ulid::new(), 0, 7_200_000);
        meta.stats.num_samples = 1234;
        meta.compaction.sources = vec![meta.ulid];
        write_block_meta(dir.path(), &meta).unwrap();

        let read = read_block_meta(dir.path()).unwrap();
        assert_eq!(read, meta);

        // The serialized form uses the documented camelCase keys.
        let raw = fs::read_to_string(dir.path().join(META_FILE)).unwrap();
        for key in ["minTime", "maxTime", "numSamples", "deletable", "version"] {
            assert!(raw.contains(key), "missing key {key} in {raw}");
        }
    }

    #[test]
    fn block_dir_listing_ignores_foreign_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let ulid = Ulid::new();
        fs::create_dir(dir.path().join(ulid.to_string())).unwrap();
        fs::create_dir(dir.path().join("wal")).unwrap();
        fs::create_dir(dir.path().join("tmp-01HZZZZZZZZZZZZZZZZZZZZZZZ")).unwrap();
        let dirs = block_dirs(dir.path()).unwrap();
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].ends_with(ulid.to_string()));
    }

    #[test]
    fn overlap_semantics() {
        let meta = BlockMeta::new(Ulid::new(), 1000, 2000);
        assert!(meta.overlap_closed(1500, 1600));
        assert!(meta.overlap_closed(0, 1000));
        // max_time is exclusive.
        assert!(!meta.overlap_closed(2000, 3000));
        assert!(meta.overlap_closed(1999, 3000));
    }
}
