//! Range queries: composing per-block readers and the head into merged
//! per-series sample iterators.

use std::collections::BTreeSet;

use chronos_core::chunk::XorIterator;
use chronos_core::{Sample, Tsid};

use crate::block::BlockReadGuard;
use crate::chunks::ChunkMeta;
use crate::head::Head;
use crate::series::TailIterator;
use crate::tombstones::{self, add_interval, Intervals};
use crate::{Error, Result};

/// Everything needed to iterate one series in a time range: populated chunk
/// metas ordered by `min_time`, deletion intervals, and (for head reads)
/// the plain tail buffer keyed by the growing chunk's ref.
#[derive(Debug, Default)]
pub struct ChunkSeriesMeta {
    pub tsid: Tsid,
    pub chunks: Vec<ChunkMeta>,
    pub intervals: Intervals,
    pub tail: Option<(u64, [Sample; 4])>,
}

/// Resolve the chunk series meta of `tsid` within one block, dropping
/// chunks fully covered by tombstones and populating chunk data.
pub(crate) fn block_series_meta(
    block: &crate::block::Block,
    tsid: &Tsid,
    mint: i64,
    maxt: i64,
) -> Result<Option<ChunkSeriesMeta>> {
    let Some(mut chunks) = block.index().series(tsid)? else {
        return Ok(None);
    };
    let intervals = block.tombstones().get(tsid);
    chunks.retain(|meta| {
        meta.overlap_closed(mint, maxt)
            && !tombstones::is_subrange(meta.min_time, meta.max_time, &intervals)
    });
    for meta in &mut chunks {
        meta.chunk = Some(block.chunks().chunk(meta.ref_id)?);
    }
    Ok(Some(ChunkSeriesMeta {
        tsid: *tsid,
        chunks,
        intervals,
        tail: None,
    }))
}

/// Snapshot the chunk series meta of `tsid` from the head, bounded below by
/// the head's own minimum time.
pub(crate) fn head_series_meta(
    head: &Head,
    tsid: &Tsid,
    mint: i64,
    maxt: i64,
) -> Option<ChunkSeriesMeta> {
    let series = head.series_handle(tsid)?;
    let mint = mint.max(head.min_time());
    let s = series.lock().unwrap();
    let (chunks, tail) = s.snapshot(mint, maxt);
    if chunks.is_empty() {
        return None;
    }
    Some(ChunkSeriesMeta {
        tsid: *tsid,
        chunks,
        intervals: Intervals::new(),
        tail,
    })
}

/// One sub-view of the queried range: a block or the head.
pub(crate) enum SubQuerier<'db> {
    Block(BlockReadGuard),
    Head {
        head: &'db Head,
    },
}

impl<'db> SubQuerier<'db> {
    fn series_meta(
        &self,
        tsid: &Tsid,
        mint: i64,
        maxt: i64,
    ) -> Result<Option<ChunkSeriesMeta>> {
        match self {
            SubQuerier::Block(guard) => {
                block_series_meta(guard.block(), tsid, mint, maxt)
            }
            SubQuerier::Head { head } => {
                Ok(head_series_meta(head, tsid, mint, maxt))
            }
        }
    }
}

/// A point-in-time view over `[mint, maxt]`.
pub struct Querier<'db> {
    pub(crate) subs: Vec<SubQuerier<'db>>,
    mint: i64,
    maxt: i64,
}

impl<'db> Querier<'db> {
    pub(crate) fn new(subs: Vec<SubQuerier<'db>>, mint: i64, maxt: i64) -> Self {
        Self { subs, mint, maxt }
    }

    pub fn min_time(&self) -> i64 {
        self.mint
    }

    pub fn max_time(&self) -> i64 {
        self.maxt
    }

    /// Iterate the given series in identifier order. Identifiers without
    /// any data in range are skipped.
    pub fn series(&self, tsids: &BTreeSet<Tsid>) -> SeriesSet<'_> {
        SeriesSet {
            querier: self,
            tsids: tsids.iter().copied().collect(),
            next: 0,
        }
    }

    /// Every series the view knows about, for full scans.
    pub fn all_tsids(&self) -> Result<BTreeSet<Tsid>> {
        let mut all = BTreeSet::new();
        for sub in &self.subs {
            match sub {
                SubQuerier::Block(guard) => {
                    all.extend(guard.block().index().tsids())
                }
                SubQuerier::Head { head } => all.extend(head.postings()),
            }
        }
        Ok(all)
    }

    fn gather(&self, tsid: &Tsid) -> Result<Option<SeriesEntry>> {
        let mut merged = ChunkSeriesMeta {
            tsid: *tsid,
            ..Default::default()
        };
        for sub in &self.subs {
            let Some(meta) = sub.series_meta(tsid, self.mint, self.maxt)? else {
                continue;
            };
            merged.chunks.extend(meta.chunks);
            for itvl in meta.intervals {
                add_interval(&mut merged.intervals, itvl);
            }
            if meta.tail.is_some() {
                merged.tail = meta.tail;
            }
        }
        if merged.chunks.is_empty() {
            return Ok(None);
        }
        merged.chunks.sort_by_key(|c| c.min_time);
        Ok(Some(SeriesEntry {
            meta: merged,
            mint: self.mint,
            maxt: self.maxt,
        }))
    }
}

/// Iterator of the selected series.
pub struct SeriesSet<'q> {
    querier: &'q Querier<'q>,
    tsids: Vec<Tsid>,
    next: usize,
}

impl<'q> Iterator for SeriesSet<'q> {
    type Item = Result<SeriesEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.tsids.len() {
            let tsid = self.tsids[self.next];
            self.next += 1;
            match self.querier.gather(&tsid) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// One selected series with its merged chunk chain.
pub struct SeriesEntry {
    meta: ChunkSeriesMeta,
    mint: i64,
    maxt: i64,
}

impl SeriesEntry {
    pub fn tsid(&self) -> Tsid {
        self.meta.tsid
    }

    /// Lazy sample cursor over `[mint, maxt]`, skipping deleted intervals.
    pub fn samples(&self) -> SeriesIterator<'_> {
        SeriesIterator::new(&self.meta, self.mint, self.maxt)
    }
}

enum ChunkCursor<'a> {
    Xor(XorIterator<'a>),
    Tail(TailIterator<'a>),
}

impl<'a> Iterator for ChunkCursor<'a> {
    type Item = chronos_core::Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ChunkCursor::Xor(it) => it.next(),
            ChunkCursor::Tail(it) => it.next(),
        }
    }
}

/// Sample iterator over a merged chunk chain.
pub struct SeriesIterator<'a> {
    meta: &'a ChunkSeriesMeta,
    mint: i64,
    maxt: i64,
    idx: usize,
    cur: Option<ChunkCursor<'a>>,
    done: bool,
}

impl<'a> SeriesIterator<'a> {
    pub(crate) fn new(meta: &'a ChunkSeriesMeta, mint: i64, maxt: i64) -> Self {
        Self {
            meta,
            mint,
            maxt,
            idx: 0,
            cur: None,
            done: false,
        }
    }

    fn open_next_chunk(&mut self) -> bool {
        while self.idx < self.meta.chunks.len() {
            let meta = &self.meta.chunks[self.idx];
            self.idx += 1;
            if meta.min_time > self.maxt {
                // Chunks are sorted; nothing later can be in range.
                return false;
            }
            if meta.max_time < self.mint {
                continue;
            }
            let Some(chunk) = meta.chunk.as_ref() else {
                continue;
            };
            let cursor = match &self.meta.tail {
                Some((tail_ref, buf)) if *tail_ref == meta.ref_id => {
                    ChunkCursor::Tail(TailIterator::new(chunk, buf))
                }
                _ => ChunkCursor::Xor(chunk.iterator()),
            };
            self.cur = Some(cursor);
            return true;
        }
        false
    }
}

impl<'a> Iterator for SeriesIterator<'a> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.cur.is_none() && !self.open_next_chunk() {
                self.done = true;
                return None;
            }
            match self.cur.as_mut().unwrap().next() {
                Some(Ok(sample)) => {
                    if sample.t > self.maxt {
                        // Samples within a chunk ascend; skip its remainder.
                        self.cur = None;
                        continue;
                    }
                    if sample.t < self.mint
                        || tombstones::is_deleted(sample.t, &self.meta.intervals)
                    {
                        continue;
                    }
                    return Some(Ok(sample));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(Error::Codec(e)));
                }
                None => {
                    self.cur = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronos_core::{Interval, XorAppender, XorChunk};

    fn chunk_of(range: std::ops::Range<i64>, step: i64) -> ChunkMeta {
        let mut chunk = XorChunk::new();
        let mut app = XorAppender::new();
        let mut maxt = range.start;
        let mut t = range.start;
        while t < range.end {
            chunk.append(&mut app, t, t as f64);
            maxt = t;
            t += step;
        }
        ChunkMeta {
            ref_id: range.start as u64,
            min_time: range.start,
            max_time: maxt,
            chunk: Some(chunk),
        }
    }

    #[test]
    fn iterates_chunks_in_range() {
        let meta = ChunkSeriesMeta {
            tsid: Tsid::from_bytes([1; 16]),
            chunks: vec![
                chunk_of(0..1000, 100),
                chunk_of(1000..2000, 100),
                chunk_of(2000..3000, 100),
            ],
            intervals: Intervals::new(),
            tail: None,
        };
        let samples: Vec<Sample> = SeriesIterator::new(&meta, 500, 2400)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(samples.first().unwrap().t, 500);
        assert_eq!(samples.last().unwrap().t, 2400);
        assert!(samples.windows(2).all(|w| w[0].t < w[1].t));
    }

    #[test]
    fn skips_deleted_intervals() {
        let mut intervals = Intervals::new();
        add_interval(&mut intervals, Interval::new(300, 700));
        let meta = ChunkSeriesMeta {
            tsid: Tsid::from_bytes([1; 16]),
            chunks: vec![chunk_of(0..1000, 100)],
            intervals,
            tail: None,
        };
        let times: Vec<i64> = SeriesIterator::new(&meta, 0, 1000)
            .map(|r| r.unwrap().t)
            .collect();
        assert_eq!(times, vec![0, 100, 200, 800, 900]);
    }
}
