//! The database: directory lock, block set, head, and the background
//! compaction/retention loop.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, tick, Receiver, Sender};
use fs2::FileExt;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::block::{block_dirs, read_block_meta, Block, BlockMeta};
use crate::compact::{exponential_block_ranges, LeveledCompactor, WriteSource};
use crate::head::{Append, Head};
use crate::querier::{Querier, SubQuerier};
use crate::{range_for_timestamp, Error, Result, Tsid};

/// Default width of the first compaction range: two hours of milliseconds.
pub const DEFAULT_BLOCK_RANGE: i64 = 2 * 60 * 60 * 1000;

const COMPACT_TICK: Duration = Duration::from_secs(60);
const RELOAD_TICK: Duration = Duration::from_secs(10);
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Ascending compaction range widths in milliseconds; the first is the
    /// head's chunk range.
    pub block_ranges: Vec<i64>,
    /// Drop blocks older than this many milliseconds behind the newest
    /// block. Zero disables time retention.
    pub retention_duration: u64,
    /// Drop oldest blocks once the total size exceeds this. Zero or
    /// negative disables size retention.
    pub max_bytes: i64,
    /// WAL segment size; 0 selects the default, negative disables the WAL.
    pub wal_segment_size: i64,
    pub no_lock_file: bool,
    pub allow_overlapping_blocks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_ranges: exponential_block_ranges(DEFAULT_BLOCK_RANGE, 3, 3),
            retention_duration: 0,
            max_bytes: 0,
            wal_segment_size: 0,
            no_lock_file: false,
            allow_overlapping_blocks: false,
        }
    }
}

struct DbInner {
    dir: PathBuf,
    opts: Options,
    head: Head,
    compactor: LeveledCompactor,
    blocks: RwLock<Vec<Arc<Block>>>,
    /// Compactions and deletions never run simultaneously.
    cmutex: Mutex<()>,
    auto_compact: AtomicBool,
    compactc: Sender<()>,
    /// Held for the database's lifetime; dropping releases the flock.
    _lockfile: Option<File>,
}

/// A ChronosDB storage engine handle.
pub struct Db {
    inner: Arc<DbInner>,
    stopc: Sender<()>,
    cancelc: Sender<()>,
    handle: Option<JoinHandle<()>>,
    closed: bool,
}

impl Db {
    /// Open (or create) the engine in `dir` and start its background loop.
    pub fn open(dir: impl Into<PathBuf>, opts: Options) -> Result<Db> {
        let dir = dir.into();
        if opts.block_ranges.is_empty() {
            return Err(Error::InvalidOptions("no block ranges".into()));
        }
        fs::create_dir_all(&dir)?;

        let lockfile = if opts.no_lock_file {
            None
        } else {
            let path = dir.join("lock");
            let file = File::create(&path)?;
            file.try_lock_exclusive()
                .map_err(|_| Error::LockHeldElsewhere(path))?;
            Some(file)
        };

        let (cancelc, cancel_rx) = bounded(1);
        let compactor =
            LeveledCompactor::new(opts.block_ranges.clone(), cancel_rx)?;

        let wal = if opts.wal_segment_size >= 0 {
            Some(chronos_wal::Wal::open(
                dir.join("wal"),
                opts.wal_segment_size as u64,
            )?)
        } else {
            None
        };
        let head = Head::new(opts.block_ranges[0], wal)?;

        let (compactc, compact_rx) = bounded(1);
        let inner = Arc::new(DbInner {
            dir,
            opts,
            head,
            compactor,
            blocks: RwLock::new(Vec::new()),
            cmutex: Mutex::new(()),
            auto_compact: AtomicBool::new(true),
            compactc,
            _lockfile: lockfile,
        });

        inner.reload()?;
        // Ingested samples may not go below the newest persisted block.
        let min_valid_time = inner
            .blocks
            .read()
            .unwrap()
            .iter()
            .map(|b| b.meta().max_time)
            .max()
            .unwrap_or(i64::MIN);
        inner.head.init(min_valid_time)?;

        let (stopc, stop_rx) = bounded(1);
        let loop_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("chronos-db".into())
            .spawn(move || loop_inner.run(stop_rx, compact_rx))?;

        Ok(Db {
            inner,
            stopc,
            cancelc,
            handle: Some(handle),
            closed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn head(&self) -> &Head {
        &self.inner.head
    }

    /// Metadata of all live blocks, ordered by `min_time`.
    pub fn block_metas(&self) -> Vec<BlockMeta> {
        self.inner
            .blocks
            .read()
            .unwrap()
            .iter()
            .map(|b| b.meta())
            .collect()
    }

    /// An appender batching writes into the head.
    pub fn appender(&self) -> DbAppender<'_> {
        DbAppender {
            app: self.inner.head.appender(),
            inner: &self.inner,
        }
    }

    /// A point-in-time view over `[mint, maxt]`.
    pub fn querier(&self, mint: i64, maxt: i64) -> Result<Querier<'_>> {
        let blocks = self.inner.blocks.read().unwrap();
        let mut subs = Vec::new();
        let mut metas = Vec::new();
        for block in blocks.iter() {
            if !block.overlap_closed(mint, maxt) {
                continue;
            }
            // A block mid-close has already left the live set; skip it.
            let Some(guard) = block.start_read() else {
                continue;
            };
            metas.push(block.meta());
            subs.push(SubQuerier::Block(guard));
        }
        if maxt >= self.inner.head.min_time() {
            subs.push(SubQuerier::Head {
                head: &self.inner.head,
            });
        }

        let overlaps = overlapping_blocks(&mut metas);
        if !overlaps.is_empty() {
            return Err(Error::BlockOverlap(overlaps.join("; ")));
        }
        Ok(Querier::new(subs, mint, maxt))
    }

    /// Delete `[mint, maxt]` of the given series everywhere, fanning out to
    /// overlapping blocks and the head in parallel.
    pub fn del(&self, mint: i64, maxt: i64, tsids: &[Tsid]) -> Result<()> {
        self.inner.del(mint, maxt, tsids)
    }

    /// Rewrite all blocks carrying tombstones so the deleted samples are
    /// physically removed.
    pub fn clean_tombstones(&self) -> Result<()> {
        self.inner.clean_tombstones()
    }

    /// Run the compaction cycle now: persist overdue head windows, then
    /// merge planned blocks until the plan is empty.
    pub fn compact(&self) -> Result<()> {
        self.inner.compact()
    }

    /// Re-scan the directory for blocks and apply retention.
    pub fn reload(&self) -> Result<()> {
        self.inner.reload_locked()
    }

    pub fn disable_auto_compaction(&self) {
        self.inner.auto_compact.store(false, Ordering::SeqCst);
        info!("auto compaction disabled");
    }

    pub fn enable_auto_compaction(&self) {
        self.inner.auto_compact.store(true, Ordering::SeqCst);
        info!("auto compaction enabled");
    }

    /// Stop the background loop, close all blocks and release the lock.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stopc.try_send(());
        let _ = self.cancelc.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        for block in self.inner.blocks.write().unwrap().drain(..) {
            block.close();
        }
        if let Err(e) = self.inner.head.close() {
            error!(error = %e, "closing head failed");
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.close();
    }
}

impl DbInner {
    /// The background loop: waits on stop, the compaction tick, appender
    /// compact signals and the reload tick, handling one event at a time.
    /// Compaction failures back off exponentially between one second and
    /// one minute.
    fn run(self: Arc<Self>, stopc: Receiver<()>, compactc: Receiver<()>) {
        let compact_tick = tick(COMPACT_TICK);
        let reload_tick = tick(RELOAD_TICK);
        let mut backoff = Duration::ZERO;
        loop {
            if !backoff.is_zero() {
                select! {
                    recv(stopc) -> _ => return,
                    recv(after(backoff)) -> _ => {}
                }
            }
            select! {
                recv(stopc) -> _ => return,
                recv(compact_tick) -> _ => backoff = self.auto_compact(backoff),
                recv(compactc) -> _ => backoff = self.auto_compact(backoff),
                recv(reload_tick) -> _ => {
                    if let Err(e) = self.reload_locked() {
                        error!(error = %e, "reload failed");
                    }
                }
            }
        }
    }

    fn auto_compact(&self, backoff: Duration) -> Duration {
        if !self.auto_compact.load(Ordering::SeqCst) {
            return Duration::ZERO;
        }
        match self.compact() {
            Ok(()) => Duration::ZERO,
            Err(Error::Cancelled) => Duration::ZERO,
            Err(e) => {
                error!(error = %e, "compaction failed");
                exponential(backoff, BACKOFF_MIN, BACKOFF_MAX)
            }
        }
    }

    fn get_block(&self, ulid: Ulid) -> Option<Arc<Block>> {
        self.blocks
            .read()
            .unwrap()
            .iter()
            .find(|b| b.ulid() == ulid)
            .cloned()
    }

    /// Like [`DbInner::reload`], serialized against compactions and
    /// deletions. `compact` and `del` already hold the lock and call the
    /// bare version.
    fn reload_locked(&self) -> Result<()> {
        let _guard = self.cmutex.lock().unwrap();
        self.reload()
    }

    /// Reload blocks from disk and trigger head truncation if new blocks
    /// appeared. Blocks obsoleted by replacement or retention are deleted.
    fn reload(&self) -> Result<()> {
        // Leftovers of failed block writes.
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with("tmp-"))
            {
                warn!(dir = %entry.path().display(), "removing stale block tmp dir");
                fs::remove_dir_all(entry.path())?;
            }
        }

        let mut corrupted: HashMap<Ulid, Error> = HashMap::new();
        let mut loadable: Vec<Arc<Block>> = Vec::new();
        for dir in block_dirs(&self.dir)? {
            let meta = match read_block_meta(&dir) {
                Ok(meta) => meta,
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "cannot read block meta");
                    continue;
                }
            };
            match self.get_block(meta.ulid) {
                Some(block) => loadable.push(block),
                None => match Block::open(&dir) {
                    Ok(block) => loadable.push(Arc::new(block)),
                    Err(e) => {
                        corrupted.insert(meta.ulid, e);
                    }
                },
            }
        }

        let mut deletable = self.deletable_blocks(&mut loadable);

        // Corrupted blocks replaced by their children are deleted instead
        // of failing the reload; creation of a block and deletion of its
        // parents cannot happen atomically, so pick up where a crash left
        // off.
        for block in &loadable {
            for parent in &block.meta().compaction.parents {
                corrupted.remove(parent);
                deletable.entry(*parent).or_insert(None);
            }
        }
        if !corrupted.is_empty() {
            let list: Vec<String> =
                corrupted.keys().map(|u| u.to_string()).collect();
            return Err(Error::CorruptedBlocks(list.join(", ")));
        }

        let mut live: Vec<Arc<Block>> = Vec::new();
        for block in loadable {
            let ulid = block.ulid();
            if let std::collections::hash_map::Entry::Occupied(mut e) =
                deletable.entry(ulid)
            {
                e.insert(Some(block));
            } else {
                live.push(block);
            }
        }
        live.sort_by_key(|b| b.meta().min_time);

        let mut metas: Vec<BlockMeta> = live.iter().map(|b| b.meta()).collect();
        let overlaps = overlapping_blocks(&mut metas);
        if !overlaps.is_empty() {
            if self.opts.allow_overlapping_blocks {
                warn!(detail = %overlaps.join("; "), "overlapping blocks found during reload");
            } else {
                return Err(Error::BlockOverlap(overlaps.join("; ")));
            }
        }

        // Swap in the new set first so fresh queriers see it.
        let max_time = live.last().map(|b| b.meta().max_time);
        {
            let mut blocks = self.blocks.write().unwrap();
            for old in blocks.iter() {
                if let std::collections::hash_map::Entry::Occupied(mut e) =
                    deletable.entry(old.ulid())
                {
                    e.insert(Some(old.clone()));
                }
            }
            *blocks = live;
        }

        self.delete_blocks(&deletable)?;

        // Garbage-collect head data covered by persisted blocks.
        match max_time {
            Some(max_time) => self.head.truncate(max_time),
            None => Ok(()),
        }
    }

    /// All blocks that should be removed: explicitly flagged ones plus
    /// everything beyond the retention policies, evaluated newest-first by
    /// `max_time`.
    fn deletable_blocks(
        &self,
        blocks: &mut [Arc<Block>],
    ) -> HashMap<Ulid, Option<Arc<Block>>> {
        blocks.sort_by_key(|b| std::cmp::Reverse(b.meta().max_time));

        let mut deletable: HashMap<Ulid, Option<Arc<Block>>> = HashMap::new();
        for block in blocks.iter() {
            if block.meta().compaction.deletable {
                deletable.insert(block.ulid(), Some(block.clone()));
            }
        }
        for block in self.beyond_time_retention(blocks) {
            deletable.insert(block.ulid(), Some(block));
        }
        for block in self.beyond_size_retention(blocks) {
            deletable.insert(block.ulid(), Some(block));
        }
        deletable
    }

    fn beyond_time_retention(&self, blocks: &[Arc<Block>]) -> Vec<Arc<Block>> {
        if blocks.is_empty() || self.opts.retention_duration == 0 {
            return Vec::new();
        }
        let newest = blocks[0].meta().max_time;
        for (i, block) in blocks.iter().enumerate() {
            if i > 0
                && newest - block.meta().max_time
                    > self.opts.retention_duration as i64
            {
                // This block and all older ones fall out of retention.
                return blocks[i..].to_vec();
            }
        }
        Vec::new()
    }

    fn beyond_size_retention(&self, blocks: &[Arc<Block>]) -> Vec<Arc<Block>> {
        if blocks.is_empty() || self.opts.max_bytes <= 0 {
            return Vec::new();
        }
        let mut total = 0u64;
        for (i, block) in blocks.iter().enumerate() {
            total += block.size();
            if total > self.opts.max_bytes as u64 {
                return blocks[i..].to_vec();
            }
        }
        Vec::new()
    }

    /// Close and unlink blocks. Loaded entries are closed first, which
    /// waits for pending readers to finish.
    fn delete_blocks(
        &self,
        deletable: &HashMap<Ulid, Option<Arc<Block>>>,
    ) -> Result<()> {
        for (ulid, block) in deletable {
            if let Some(block) = block {
                block.close();
            }
            match fs::remove_dir_all(self.dir.join(ulid.to_string())) {
                Ok(()) => info!(%ulid, "deleted block"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Persist overdue head windows, then merge blocks until the plan is
    /// empty. Obsolete blocks are deleted by the reload after each step.
    fn compact(&self) -> Result<()> {
        let _guard = self.cmutex.lock().unwrap();
        let range = self.opts.block_ranges[0];

        loop {
            if self.head.min_time() == i64::MAX {
                break;
            }
            // The head is compactable once 1.5 level-0 ranges sit between
            // its bounds; the extra 0.5 buffers the appendable window.
            if self.head.max_time() - self.head.min_time() <= range / 2 * 3 {
                break;
            }
            let mint = self.head.min_time();
            let maxt = range_for_timestamp(mint, range);
            info!(mint, maxt, "persisting head block");

            // Block intervals are half-open, chunk intervals closed; strip
            // the last value so overlaps stay consistent.
            let uid = self.compactor.write(
                &self.dir,
                WriteSource::HeadRange {
                    head: &self.head,
                    mint,
                    maxt: maxt - 1,
                },
                mint,
                maxt,
                None,
            )?;
            if let Err(e) = self.reload() {
                if let Some(uid) = uid {
                    let _ = fs::remove_dir_all(self.dir.join(uid.to_string()));
                }
                return Err(e);
            }
            if uid.is_none() {
                // Nothing was persisted, so reload could not move the head
                // forward; truncate it manually.
                self.head.truncate(maxt)?;
            }
        }

        loop {
            let plan = self.compactor.plan(&self.dir)?;
            if plan.is_empty() {
                break;
            }
            let uid = self.compactor.compact(&self.dir, &plan)?;
            if let Err(e) = self.reload() {
                if let Some(uid) = uid {
                    let _ = fs::remove_dir_all(self.dir.join(uid.to_string()));
                }
                return Err(e);
            }
            if uid.is_none() {
                // Deletable-only plan; the reload above removed it.
                break;
            }
        }
        Ok(())
    }

    fn del(&self, mint: i64, maxt: i64, tsids: &[Tsid]) -> Result<()> {
        let _guard = self.cmutex.lock().unwrap();
        let blocks: Vec<Arc<Block>> = self
            .blocks
            .read()
            .unwrap()
            .iter()
            .filter(|b| b.overlap_closed(mint, maxt))
            .cloned()
            .collect();

        let mut errs: Vec<Error> = Vec::new();
        thread::scope(|scope| {
            let mut handles = Vec::new();
            for block in &blocks {
                handles.push(scope.spawn(move || block.del(mint, maxt, tsids)));
            }
            let head_handle = self
                .head
                .overlap_closed(mint, maxt)
                .then(|| scope.spawn(|| self.head.del(mint, maxt, tsids)));

            for handle in handles {
                if let Err(e) = handle.join().expect("del worker panicked") {
                    errs.push(e);
                }
            }
            if let Some(handle) = head_handle {
                if let Err(e) = handle.join().expect("del worker panicked") {
                    errs.push(e);
                }
            }
        });

        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.pop().unwrap()),
            _ => Err(Error::Multi(errs)),
        }
    }

    fn clean_tombstones(&self) -> Result<()> {
        let _guard = self.cmutex.lock().unwrap();
        let blocks: Vec<Arc<Block>> = self.blocks.read().unwrap().clone();

        let mut new_ulids = Vec::new();
        for block in &blocks {
            match self.compactor.clean_tombstones(&self.dir, block) {
                Ok(Some(uid)) => new_ulids.push(uid),
                Ok(None) => {}
                Err(e) => {
                    // Roll back blocks written before the failure.
                    for uid in new_ulids {
                        let _ =
                            fs::remove_dir_all(self.dir.join(uid.to_string()));
                    }
                    return Err(e);
                }
            }
        }
        self.reload()
    }
}

/// Appender handle: delegates to the head and signals the compaction loop
/// when the head has outgrown its window.
pub struct DbAppender<'db> {
    app: Box<dyn Append + 'db>,
    inner: &'db DbInner,
}

impl<'db> Append for DbAppender<'db> {
    fn add(&mut self, tsid: Tsid, t: i64, v: f64) -> Result<()> {
        self.app.add(tsid, t, v)
    }

    fn commit(&mut self) -> Result<()> {
        self.app.commit()?;
        let head = &self.inner.head;
        if head.min_time() != i64::MAX
            && head.max_time() - head.min_time()
                > self.inner.opts.block_ranges[0] / 2 * 3
        {
            let _ = self.inner.compactc.try_send(());
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.app.rollback()
    }
}

fn exponential(cur: Duration, min: Duration, max: Duration) -> Duration {
    if cur.is_zero() {
        min
    } else {
        (cur * 2).min(max)
    }
}

/// Describe every overlapping pair among the given metas. Sorts by
/// `min_time` as a side effect.
fn overlapping_blocks(metas: &mut [BlockMeta]) -> Vec<String> {
    metas.sort_by_key(|m| m.min_time);
    let mut overlaps = Vec::new();
    for pair in metas.windows(2) {
        if pair[1].min_time < pair[0].max_time {
            overlaps.push(format!(
                "{} [{}, {}) and {} [{}, {})",
                pair[0].ulid,
                pair[0].min_time,
                pair[0].max_time,
                pair[1].ulid,
                pair[1].min_time,
                pair[1].max_time
            ));
        }
    }
    overlaps
}
