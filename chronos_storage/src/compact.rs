//! Leveled compaction: persisting head windows and merging blocks.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crossbeam_channel::Receiver;
use tracing::{info, warn};
use ulid::Ulid;

use crate::block::{
    block_dirs, read_block_meta, write_block_meta, Block, BlockMeta,
};
use crate::chunks::{ChunkMeta, ChunkWriter};
use crate::head::Head;
use crate::index::{IndexWriter, INDEX_FILE};
use crate::querier::{
    block_series_meta, head_series_meta, ChunkSeriesMeta, SeriesIterator,
};
use crate::series::SAMPLES_PER_CHUNK;
use crate::tombstones::{self, add_interval, MemTombstones};
use crate::{range_for_timestamp, Error, Result, Tsid};

/// Geometric range ladder `min * factor^i`, the compactor's level widths.
pub fn exponential_block_ranges(min: i64, steps: usize, factor: i64) -> Vec<i64> {
    let mut ranges = Vec::with_capacity(steps);
    let mut cur = min;
    for _ in 0..steps {
        ranges.push(cur);
        cur = cur.saturating_mul(factor);
    }
    ranges
}

/// What a block write reads its series stream from.
pub enum WriteSource<'a> {
    /// A bounded window of the head.
    HeadRange {
        head: &'a Head,
        mint: i64,
        maxt: i64,
    },
    /// An existing block, e.g. for tombstone cleaning.
    Block(&'a Block),
}

impl<'a> WriteSource<'a> {
    fn tsids(&self) -> Vec<Tsid> {
        match self {
            WriteSource::HeadRange { head, .. } => head.postings(),
            WriteSource::Block(block) => block.index().tsids(),
        }
    }

    fn series_meta(&self, tsid: &Tsid) -> Result<Option<ChunkSeriesMeta>> {
        match self {
            WriteSource::HeadRange { head, mint, maxt } => {
                Ok(head_series_meta(head, tsid, *mint, *maxt))
            }
            WriteSource::Block(block) => {
                let meta = block.meta();
                block_series_meta(block, tsid, meta.min_time, meta.max_time - 1)
            }
        }
    }
}

/// Plans and executes merges over a ladder of ascending time ranges.
pub struct LeveledCompactor {
    ranges: Vec<i64>,
    cancel: Receiver<()>,
}

impl LeveledCompactor {
    pub fn new(ranges: Vec<i64>, cancel: Receiver<()>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(Error::InvalidOptions(
                "at least one compaction range required".into(),
            ));
        }
        if ranges.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::InvalidOptions(
                "compaction ranges must ascend".into(),
            ));
        }
        Ok(Self { ranges, cancel })
    }

    fn cancelled(&self) -> bool {
        self.cancel.try_recv().is_ok()
    }

    /// Select the next set of block directories to compact together.
    ///
    /// Deletable-flagged blocks are returned alone so the caller's reload
    /// removes them promptly. Otherwise the first run of two or more
    /// same-level neighbours completing a `ranges[i]` bucket (i > 0) with a
    /// combined span of at least `ranges[i - 1]` is chosen.
    pub fn plan(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut metas = Vec::new();
        for path in block_dirs(dir)? {
            match read_block_meta(&path) {
                Ok(meta) => metas.push((path, meta)),
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "skipping unreadable block meta");
                }
            }
        }
        metas.sort_by_key(|(_, m)| m.min_time);

        if let Some((path, _)) =
            metas.iter().find(|(_, m)| m.compaction.deletable)
        {
            return Ok(vec![path.clone()]);
        }

        for i in 1..self.ranges.len() {
            let range = self.ranges[i];
            let min_span = self.ranges[i - 1];
            let mut j = 0;
            while j < metas.len() {
                let bucket_end = range_for_timestamp(metas[j].1.min_time, range);
                let level = metas[j].1.compaction.level;
                let mut k = j + 1;
                while k < metas.len()
                    && metas[k].1.max_time <= bucket_end
                    && metas[k].1.compaction.level == level
                {
                    k += 1;
                }
                let group = &metas[j..k];
                let last = &group[group.len() - 1].1;
                if group.len() >= 2
                    && last.max_time == bucket_end
                    && last.max_time - group[0].1.min_time >= min_span
                {
                    return Ok(group.iter().map(|(p, _)| p.clone()).collect());
                }
                j = k.max(j + 1);
            }
        }
        Ok(Vec::new())
    }

    /// Merge the planned blocks into one block of the next level, written
    /// atomically into `dest`. Returns `None` when the merge produced no
    /// samples (the inputs are removed by the caller's reload either way).
    pub fn compact(&self, dest: &Path, plan: &[PathBuf]) -> Result<Option<Ulid>> {
        let mut blocks = Vec::with_capacity(plan.len());
        for path in plan {
            blocks.push(Block::open(path)?);
        }
        let metas: Vec<BlockMeta> = blocks.iter().map(|b| b.meta()).collect();
        if metas.iter().all(|m| m.compaction.deletable) {
            // Nothing to merge; reload unlinks flagged blocks.
            return Ok(None);
        }

        let uid = Ulid::new();
        let mut out = BlockMeta::new(
            uid,
            metas.iter().map(|m| m.min_time).min().unwrap(),
            metas.iter().map(|m| m.max_time).max().unwrap(),
        );
        out.compaction.level =
            metas.iter().map(|m| m.compaction.level).max().unwrap() + 1;
        let mut sources: BTreeSet<Ulid> = BTreeSet::new();
        for meta in &metas {
            if meta.compaction.sources.is_empty() {
                sources.insert(meta.ulid);
            }
            sources.extend(meta.compaction.sources.iter().copied());
        }
        out.compaction.sources = sources.into_iter().collect();
        out.compaction.parents = metas.iter().map(|m| m.ulid).collect();

        let mut tsids = BTreeSet::new();
        for block in &blocks {
            tsids.extend(block.index().tsids());
        }

        let written = self.write_block(dest, &mut out, tsids, |tsid| {
            let mut merged = ChunkSeriesMeta {
                tsid: *tsid,
                ..Default::default()
            };
            for block in &blocks {
                let meta = block.meta();
                if let Some(sm) = block_series_meta(
                    block,
                    tsid,
                    meta.min_time,
                    meta.max_time - 1,
                )? {
                    merged.chunks.extend(sm.chunks);
                    for itvl in sm.intervals {
                        add_interval(&mut merged.intervals, itvl);
                    }
                }
            }
            merged.chunks.sort_by_key(|c| c.min_time);
            Ok(merged)
        })?;

        if written {
            info!(
                ulid = %uid,
                inputs = plan.len(),
                level = out.compaction.level,
                "compacted blocks"
            );
            Ok(Some(uid))
        } else {
            Ok(None)
        }
    }

    /// Persist a source as a level-1 (or parent-level) block covering
    /// `[mint, maxt)`. Returns `None` when the source holds no samples in
    /// range.
    pub fn write(
        &self,
        dest: &Path,
        source: WriteSource<'_>,
        mint: i64,
        maxt: i64,
        parent: Option<&BlockMeta>,
    ) -> Result<Option<Ulid>> {
        let uid = Ulid::new();
        let mut out = BlockMeta::new(uid, mint, maxt);
        match parent {
            Some(p) => {
                out.compaction.level = p.compaction.level;
                out.compaction.sources = if p.compaction.sources.is_empty() {
                    vec![p.ulid]
                } else {
                    p.compaction.sources.clone()
                };
                out.compaction.parents = vec![p.ulid];
            }
            None => {
                out.compaction.level = 1;
                out.compaction.sources = vec![uid];
            }
        }

        let tsids: BTreeSet<Tsid> = source.tsids().into_iter().collect();
        let written = self.write_block(dest, &mut out, tsids, |tsid| {
            Ok(source.series_meta(tsid)?.unwrap_or_else(|| ChunkSeriesMeta {
                tsid: *tsid,
                ..Default::default()
            }))
        })?;
        Ok(written.then_some(uid))
    }

    /// Rewrite a block without its tombstoned samples. Returns the new
    /// block's ULID, or `None` when the block has no tombstones; a block
    /// emptied by the rewrite is flagged deletable instead.
    pub fn clean_tombstones(
        &self,
        dest: &Path,
        block: &Block,
    ) -> Result<Option<Ulid>> {
        if block.tombstones().total() == 0 {
            return Ok(None);
        }
        let meta = block.meta();
        let uid = self.write(
            dest,
            WriteSource::Block(block),
            meta.min_time,
            meta.max_time,
            Some(&meta),
        )?;
        if uid.is_none() {
            // All samples were deleted; let reload unlink the block.
            block.set_deletable()?;
        }
        Ok(uid)
    }

    /// Stream series into `tmp-<ulid>` under `dest`, then fsync and rename.
    /// Returns false (and cleans up) when no chunk was produced.
    fn write_block(
        &self,
        dest: &Path,
        meta: &mut BlockMeta,
        tsids: BTreeSet<Tsid>,
        mut series_meta: impl FnMut(&Tsid) -> Result<ChunkSeriesMeta>,
    ) -> Result<bool> {
        let tmp = dest.join(format!("tmp-{}", meta.ulid));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let result = self.write_block_inner(&tmp, dest, meta, tsids, &mut series_meta);
        if !matches!(result, Ok(true)) {
            let _ = fs::remove_dir_all(&tmp);
        }
        result
    }

    fn write_block_inner(
        &self,
        tmp: &Path,
        dest: &Path,
        meta: &mut BlockMeta,
        tsids: BTreeSet<Tsid>,
        series_meta: &mut impl FnMut(&Tsid) -> Result<ChunkSeriesMeta>,
    ) -> Result<bool> {
        let mut chunk_writer = ChunkWriter::new(tmp.join("chunks"))?;
        let mut index_writer = IndexWriter::create(tmp.join(INDEX_FILE))?;
        // Sample bounds are inclusive; the block interval is half-open.
        let maxt_inclusive = meta.max_time - 1;

        for tsid in &tsids {
            // Long compactions abort at series granularity.
            if self.cancelled() {
                return Err(Error::Cancelled);
            }
            let sm = series_meta(tsid)?;
            if sm.chunks.is_empty() {
                continue;
            }

            let mut chunks: Vec<ChunkMeta> = Vec::new();
            let mut builder = ChunkBuilder::new();
            let mut iter = SeriesIterator::new(&sm, meta.min_time, maxt_inclusive);
            for item in &mut iter {
                let sample = item?;
                if builder.len() == SAMPLES_PER_CHUNK {
                    chunks.push(builder.finish());
                    builder = ChunkBuilder::new();
                }
                builder.append(sample.t, sample.v);
            }
            if builder.len() > 0 {
                chunks.push(builder.finish());
            }
            if chunks.is_empty() {
                continue;
            }

            meta.stats.num_series += 1;
            meta.stats.num_chunks += chunks.len() as u64;
            for c in &chunks {
                meta.stats.num_samples +=
                    c.chunk.as_ref().map_or(0, |c| c.num_samples() as u64);
            }
            chunk_writer.write_chunks(&mut chunks)?;
            index_writer.add_series(*tsid, &chunks)?;
        }

        if meta.stats.num_samples == 0 {
            return Ok(false);
        }

        chunk_writer.close()?;
        index_writer.close()?;
        tombstones::write_tombstones(tmp, &MemTombstones::new())?;
        write_block_meta(tmp, meta)?;

        let final_dir = dest.join(meta.ulid.to_string());
        fs::rename(tmp, &final_dir)?;
        File::open(dest)?.sync_all()?;
        Ok(true)
    }
}

/// Accumulates samples into a fresh XOR chunk.
struct ChunkBuilder {
    chunk: chronos_core::XorChunk,
    app: chronos_core::XorAppender,
    min_time: i64,
    max_time: i64,
    count: usize,
}

impl ChunkBuilder {
    fn new() -> Self {
        Self {
            chunk: chronos_core::XorChunk::new(),
            app: chronos_core::XorAppender::new(),
            min_time: i64::MAX,
            max_time: i64::MIN,
            count: 0,
        }
    }

    fn len(&self) -> usize {
        self.count
    }

    fn append(&mut self, t: i64, v: f64) {
        self.chunk.append(&mut self.app, t, v);
        self.min_time = self.min_time.min(t);
        self.max_time = self.max_time.max(t);
        self.count += 1;
    }

    fn finish(self) -> ChunkMeta {
        ChunkMeta {
            ref_id: 0,
            min_time: self.min_time,
            max_time: self.max_time,
            chunk: Some(self.chunk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::{Append, Head};
    use chronos_core::Tsid;
    use crossbeam_channel::bounded;
    use tempfile::TempDir;

    fn compactor(ranges: Vec<i64>) -> LeveledCompactor {
        let (_tx, rx) = bounded(1);
        // Leak the sender so the channel stays open for the test.
        std::mem::forget(_tx);
        LeveledCompactor::new(ranges, rx).unwrap()
    }

    fn tsid(b: u8) -> Tsid {
        Tsid::from_bytes([b; 16])
    }

    /// Persist `[mint, maxt)` of a freshly filled head as a block.
    fn head_block(
        dir: &Path,
        compactor: &LeveledCompactor,
        mint: i64,
        maxt: i64,
        step: i64,
    ) -> Ulid {
        let head = Head::new(maxt - mint, None).unwrap();
        head.init(i64::MIN).unwrap();
        let mut app = head.appender();
        let mut t = mint;
        while t < maxt {
            app.add(tsid(1), t, t as f64).unwrap();
            t += step;
        }
        app.commit().unwrap();
        drop(app);

        compactor
            .write(
                dir,
                WriteSource::HeadRange {
                    head: &head,
                    mint,
                    maxt: maxt - 1,
                },
                mint,
                maxt,
                None,
            )
            .unwrap()
            .expect("non-empty block")
    }

    #[test]
    fn exponential_ranges() {
        assert_eq!(
            exponential_block_ranges(7_200_000, 3, 3),
            vec![7_200_000, 21_600_000, 64_800_000]
        );
    }

    #[test]
    fn write_and_reopen_block() {
        let dir = TempDir::new().unwrap();
        let c = compactor(vec![10_000]);
        let uid = head_block(dir.path(), &c, 0, 10_000, 100);

        let block = Block::open(dir.path().join(uid.to_string())).unwrap();
        let meta = block.meta();
        assert_eq!((meta.min_time, meta.max_time), (0, 10_000));
        assert_eq!(meta.stats.num_samples, 100);
        assert_eq!(meta.compaction.level, 1);
        assert_eq!(meta.compaction.sources, vec![uid]);

        let sm = block_series_meta(&block, &tsid(1), 0, 9_999)
            .unwrap()
            .unwrap();
        let samples: Vec<_> = SeriesIterator::new(&sm, 0, 9_999)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(samples.len(), 100);
    }

    #[test]
    fn empty_write_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let c = compactor(vec![10_000]);
        let head = Head::new(10_000, None).unwrap();
        head.init(i64::MIN).unwrap();
        let uid = c
            .write(
                dir.path(),
                WriteSource::HeadRange {
                    head: &head,
                    mint: 0,
                    maxt: 9_999,
                },
                0,
                10_000,
                None,
            )
            .unwrap();
        assert!(uid.is_none());
        assert!(block_dirs(dir.path()).unwrap().is_empty());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn plan_waits_for_full_bucket_then_merges() {
        let dir = TempDir::new().unwrap();
        let c = compactor(vec![10_000, 30_000]);

        head_block(dir.path(), &c, 0, 10_000, 100);
        assert!(c.plan(dir.path()).unwrap().is_empty());

        head_block(dir.path(), &c, 10_000, 20_000, 100);
        // Two of three range slots filled: not yet.
        assert!(c.plan(dir.path()).unwrap().is_empty());

        head_block(dir.path(), &c, 20_000, 30_000, 100);
        let plan = c.plan(dir.path()).unwrap();
        assert_eq!(plan.len(), 3);

        let uid = c.compact(dir.path(), &plan).unwrap().expect("merged block");
        let merged = Block::open(dir.path().join(uid.to_string())).unwrap();
        let meta = merged.meta();
        assert_eq!((meta.min_time, meta.max_time), (0, 30_000));
        assert_eq!(meta.compaction.level, 2);
        assert_eq!(meta.compaction.parents.len(), 3);
        assert_eq!(meta.compaction.sources.len(), 3);
        assert_eq!(meta.stats.num_samples, 300);
    }

    #[test]
    fn plan_prefers_deletable_blocks() {
        let dir = TempDir::new().unwrap();
        let c = compactor(vec![10_000, 30_000]);
        let uid = head_block(dir.path(), &c, 0, 10_000, 100);
        let block = Block::open(dir.path().join(uid.to_string())).unwrap();
        block.set_deletable().unwrap();

        let plan = c.plan(dir.path()).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan[0].ends_with(uid.to_string()));
        // Compacting a lone deletable block writes nothing.
        assert!(c.compact(dir.path(), &plan).unwrap().is_none());
    }

    #[test]
    fn clean_tombstones_rewrites_block() {
        let dir = TempDir::new().unwrap();
        let c = compactor(vec![10_000]);
        let uid = head_block(dir.path(), &c, 0, 10_000, 100);
        let block = Block::open(dir.path().join(uid.to_string())).unwrap();

        // Nothing to do without stones.
        assert!(c.clean_tombstones(dir.path(), &block).unwrap().is_none());

        block.del(2_000, 4_000, &[tsid(1)]).unwrap();
        let new_uid = c
            .clean_tombstones(dir.path(), &block)
            .unwrap()
            .expect("rewritten block");

        let rewritten =
            Block::open(dir.path().join(new_uid.to_string())).unwrap();
        let meta = rewritten.meta();
        assert_eq!(meta.compaction.parents, vec![uid]);
        assert_eq!(meta.compaction.level, 1);
        // 100 samples minus t in [2000, 4000] (21 samples).
        assert_eq!(meta.stats.num_samples, 79);
        assert_eq!(rewritten.tombstones().total(), 0);
    }
}
