//! In-memory series: compressed chunk chains behind stripe-partitioned locks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chronos_core::chunk::XorIterator;
use chronos_core::{Sample, Tsid, XorAppender, XorChunk};
use crossbeam_utils::CachePadded;

use crate::chunks::ChunkMeta;
use crate::range_for_timestamp;
use crate::Result;

/// Desired number of samples per chunk.
pub const SAMPLES_PER_CHUNK: usize = 120;

/// Number of lock-partitioned buckets in the head series map.
pub const STRIPE_SIZE: usize = 1 << 14;
const STRIPE_MASK: u64 = (STRIPE_SIZE - 1) as u64;

/// One chunk of a live series.
#[derive(Debug)]
pub struct MemChunk {
    pub chunk: XorChunk,
    pub min_time: i64,
    pub max_time: i64,
}

/// Estimate the cut timestamp for a chunk that is 25 % full, pacing chunk
/// emission so it lands near the target sample count. `next_at` stays the
/// upper bound.
fn compute_chunk_end_time(min_time: i64, max_time: i64, next_at: i64) -> i64 {
    let a = (next_at - min_time) / ((max_time - min_time + 1) * 4);
    if a == 0 {
        next_at
    } else {
        min_time + (next_at - min_time) / a
    }
}

/// A live series: its chunk chain, appender state and the plain-text tail
/// buffer readers use for the still-growing chunk.
#[derive(Debug)]
pub struct MemSeries {
    pub tsid: Tsid,
    chunk_range: i64,
    chunks: VecDeque<MemChunk>,
    /// Chunk id of `chunks[0]`; ids of later chunks follow densely.
    first_chunk_id: i64,
    /// Timestamp at which to cut the next chunk.
    next_cut_at: i64,
    /// The last four appended samples in plain form. Readers of the tail
    /// chunk take its final samples from here, so a concurrent append never
    /// corrupts an in-flight read of the compressed stream.
    sample_buf: [Sample; 4],
    pub pending_commit: bool,
    app: XorAppender,
}

impl MemSeries {
    pub fn new(tsid: Tsid, chunk_range: i64) -> Self {
        Self {
            tsid,
            chunk_range,
            chunks: VecDeque::new(),
            first_chunk_id: 0,
            next_cut_at: i64::MIN,
            sample_buf: [Sample::default(); 4],
            pending_commit: false,
            app: XorAppender::new(),
        }
    }

    /// The series' oldest timestamp, if it has any chunk.
    pub fn min_time(&self) -> Option<i64> {
        self.chunks.front().map(|c| c.min_time)
    }

    /// The series' newest timestamp, if it has any chunk.
    pub fn max_time(&self) -> Option<i64> {
        self.chunks.back().map(|c| c.max_time)
    }

    pub fn chunks(&self) -> &VecDeque<MemChunk> {
        &self.chunks
    }

    pub fn sample_buf(&self) -> &[Sample; 4] {
        &self.sample_buf
    }

    /// Whether appending `t` would violate sample ordering.
    pub fn appendable(&self, t: i64) -> Result<()> {
        match self.max_time() {
            Some(maxt) if t <= maxt => Err(crate::Error::OutOfOrderSample),
            _ => Ok(()),
        }
    }

    /// Append a sample. Returns `(appended, chunk_created)`; `appended` is
    /// false for out-of-order timestamps.
    pub fn append(&mut self, t: i64, v: f64) -> (bool, bool) {
        let mut chunk_created = false;
        if self.chunks.is_empty() {
            self.cut(t);
            chunk_created = true;
        }

        let head = self.chunks.back().unwrap();
        if head.max_time >= t {
            return (false, chunk_created);
        }

        // Once a chunk reaches 25 % of its target fill, re-estimate the cut
        // time from the observed sample rate. It can only move earlier; the
        // range-aligned bound set at cut time still holds.
        if head.chunk.num_samples() as usize == SAMPLES_PER_CHUNK / 4 {
            self.next_cut_at =
                compute_chunk_end_time(head.min_time, head.max_time, self.next_cut_at);
        }
        if t >= self.next_cut_at {
            self.cut(t);
            chunk_created = true;
        }

        let head = self.chunks.back_mut().unwrap();
        head.chunk.append(&mut self.app, t, v);
        head.max_time = t;

        self.sample_buf.rotate_left(1);
        self.sample_buf[3] = Sample::new(t, v);

        (true, chunk_created)
    }

    /// Start a new chunk at `t`. The next cut happens at the end of the
    /// `chunk_range`-aligned bucket containing `t` at the latest, so a chunk
    /// never crosses a range boundary.
    fn cut(&mut self, t: i64) {
        self.chunks.push_back(MemChunk {
            chunk: XorChunk::new(),
            min_time: t,
            max_time: i64::MIN,
        });
        self.next_cut_at = range_for_timestamp(t, self.chunk_range);
        self.app = XorAppender::new();
    }

    /// Drop all state, e.g. before re-appending surviving samples during a
    /// tombstone rewrite.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.first_chunk_id = 0;
        self.next_cut_at = i64::MIN;
        self.sample_buf = [Sample::default(); 4];
        self.pending_commit = false;
        self.app = XorAppender::new();
    }

    /// The chunk with the given dense id.
    pub fn chunk(&self, id: i64) -> Option<&MemChunk> {
        let idx = id - self.first_chunk_id;
        if idx < 0 || idx as usize >= self.chunks.len() {
            return None;
        }
        self.chunks.get(idx as usize)
    }

    /// The dense id of the chunk at `pos`.
    pub fn chunk_id(&self, pos: usize) -> i64 {
        self.first_chunk_id + pos as i64
    }

    /// Whether `id` addresses the still-growing tail chunk.
    pub fn is_tail_chunk(&self, id: i64) -> bool {
        !self.chunks.is_empty()
            && id == self.first_chunk_id + self.chunks.len() as i64 - 1
    }

    /// Drop chunks whose data lies entirely before `mint`. Returns the
    /// number of removed chunks.
    pub fn truncate_chunks_before(&mut self, mint: i64) -> usize {
        let mut removed = 0;
        while matches!(self.chunks.front(), Some(c) if c.max_time < mint) {
            self.chunks.pop_front();
            self.first_chunk_id += 1;
            removed += 1;
        }
        removed
    }

    /// Snapshot the chunks overlapping `[mint, maxt]` as populated metas
    /// keyed by dense chunk id, plus the tail buffer when the snapshot
    /// includes the growing chunk. Call with the series lock held.
    pub fn snapshot(
        &self,
        mint: i64,
        maxt: i64,
    ) -> (Vec<ChunkMeta>, Option<(u64, [Sample; 4])>) {
        let mut metas = Vec::new();
        let mut tail = None;
        for (pos, mc) in self.chunks.iter().enumerate() {
            if mc.max_time < mint || mc.min_time > maxt {
                continue;
            }
            let id = self.chunk_id(pos) as u64;
            metas.push(ChunkMeta {
                ref_id: id,
                min_time: mc.min_time,
                max_time: mc.max_time,
                chunk: Some(mc.chunk.clone()),
            });
            if pos + 1 == self.chunks.len() {
                tail = Some((id, self.sample_buf));
            }
        }
        (metas, tail)
    }
}

/// Iterator over a tail chunk: the first `n - 4` samples come from the
/// compressed stream, the final ones from the series' plain sample buffer.
pub struct TailIterator<'a> {
    inner: XorIterator<'a>,
    buf: &'a [Sample; 4],
    total: u16,
    read: u16,
}

impl<'a> TailIterator<'a> {
    pub fn new(chunk: &'a XorChunk, buf: &'a [Sample; 4]) -> Self {
        let inner = chunk.iterator();
        let total = inner.num_samples();
        Self {
            inner,
            buf,
            total,
            read: 0,
        }
    }
}

impl<'a> Iterator for TailIterator<'a> {
    type Item = chronos_core::Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.read >= self.total {
            return None;
        }
        let remaining = self.total - self.read;
        self.read += 1;
        if remaining > 4 {
            self.inner.next()
        } else {
            Some(Ok(self.buf[4 - remaining as usize]))
        }
    }
}

type Bucket = HashMap<Tsid, Arc<Mutex<MemSeries>>>;

/// The head's series map, partitioned into [`STRIPE_SIZE`] buckets to
/// reduce lock contention. Locks are padded so neighbouring buckets do not
/// share a cache line.
pub struct StripeSeries {
    buckets: Vec<CachePadded<RwLock<Bucket>>>,
}

impl Default for StripeSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl StripeSeries {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(STRIPE_SIZE);
        buckets.resize_with(STRIPE_SIZE, || CachePadded::new(RwLock::new(Bucket::new())));
        Self { buckets }
    }

    fn bucket(&self, tsid: &Tsid) -> &RwLock<Bucket> {
        &self.buckets[(tsid.fold64() & STRIPE_MASK) as usize]
    }

    pub fn get(&self, tsid: &Tsid) -> Option<Arc<Mutex<MemSeries>>> {
        self.bucket(tsid).read().unwrap().get(tsid).cloned()
    }

    /// Insert `series` unless the identifier is already present; either way
    /// the single observable instance is returned, with `true` when the
    /// insert won.
    pub fn get_or_set(
        &self,
        tsid: Tsid,
        series: Arc<Mutex<MemSeries>>,
    ) -> (Arc<Mutex<MemSeries>>, bool) {
        let mut bucket = self.bucket(&tsid).write().unwrap();
        match bucket.get(&tsid) {
            Some(existing) => (existing.clone(), false),
            None => {
                bucket.insert(tsid, series.clone());
                (series, true)
            }
        }
    }

    /// Truncate chunks strictly before `min_time` in every series and drop
    /// series left with no chunks and no pending commit. Returns the removed
    /// identifiers and the number of dropped chunks.
    pub fn gc(&self, min_time: i64) -> (HashSet<Tsid>, usize) {
        let mut removed = HashSet::new();
        let mut chunks_removed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.write().unwrap();
            bucket.retain(|tsid, series| {
                // Series lock nests inside the stripe lock; appenders take
                // them in the same order.
                let mut s = series.lock().unwrap();
                chunks_removed += s.truncate_chunks_before(min_time);
                if s.chunks().is_empty() && !s.pending_commit {
                    removed.insert(*tsid);
                    false
                } else {
                    true
                }
            });
        }
        (removed, chunks_removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsid(b: u8) -> Tsid {
        Tsid::from_bytes([b; 16])
    }

    #[test]
    fn append_and_iterate() {
        let mut s = MemSeries::new(tsid(1), 3_600_000);
        for i in 0..500i64 {
            let (ok, _) = s.append(i * 1000, i as f64);
            assert!(ok);
        }
        assert_eq!(s.min_time(), Some(0));
        assert_eq!(s.max_time(), Some(499_000));

        let mut all = Vec::new();
        for mc in s.chunks() {
            for item in mc.chunk.iterator() {
                all.push(item.unwrap());
            }
        }
        assert_eq!(all.len(), 500);
        assert!(all.windows(2).all(|w| w[0].t < w[1].t));
    }

    #[test]
    fn out_of_order_rejected() {
        let mut s = MemSeries::new(tsid(1), 3_600_000);
        assert!(s.append(1000, 1.0).0);
        assert!(!s.append(1000, 2.0).0);
        assert!(!s.append(500, 2.0).0);
        assert!(s.append(1001, 2.0).0);
        assert!(s.appendable(1001).is_err());
        assert!(s.appendable(1002).is_ok());
    }

    #[test]
    fn chunks_never_cross_range_boundary() {
        let range = 10_000i64;
        let mut s = MemSeries::new(tsid(1), range);
        for i in 0..1000i64 {
            s.append(i * 100, i as f64);
        }
        for mc in s.chunks() {
            let bucket_end = range_for_timestamp(mc.min_time, range);
            assert!(
                mc.max_time < bucket_end,
                "chunk [{}, {}] crosses {}",
                mc.min_time,
                mc.max_time,
                bucket_end
            );
        }
    }

    #[test]
    fn chunk_pacing_near_target() {
        // Steady 1-sample/sec traffic against a large range should still
        // produce chunks near the target fill, not one giant chunk.
        let mut s = MemSeries::new(tsid(1), 3_600_000);
        for i in 0..3600i64 {
            s.append(i * 1000, 0.0);
        }
        assert!(s.chunks().len() > 1);
        for mc in s.chunks().iter().take(s.chunks().len() - 1) {
            let n = mc.chunk.num_samples() as usize;
            assert!(n <= 2 * SAMPLES_PER_CHUNK, "oversized chunk: {n}");
        }
    }

    #[test]
    fn truncate_drops_old_chunks() {
        let mut s = MemSeries::new(tsid(1), 10_000);
        for i in 0..100i64 {
            s.append(i * 1000, i as f64);
        }
        let before = s.chunks().len();
        assert!(before > 1);
        let cutoff = 50_000;
        s.truncate_chunks_before(cutoff);
        assert!(s.chunks().len() < before);
        for mc in s.chunks() {
            assert!(mc.max_time >= cutoff);
        }
        // Chunk ids remain addressable after truncation.
        let id = s.chunk_id(0);
        assert!(s.chunk(id).is_some());
        assert!(s.chunk(id - 1).is_none());
    }

    #[test]
    fn tail_iterator_mixes_stream_and_buffer() {
        let mut s = MemSeries::new(tsid(1), i64::MAX / 4);
        for i in 0..10i64 {
            s.append(i, i as f64);
        }
        let mc = s.chunks().back().unwrap();
        let samples: Vec<Sample> = TailIterator::new(&mc.chunk, s.sample_buf())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(samples.len(), 10);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.t, i as i64);
            assert_eq!(sample.v, i as f64);
        }
    }

    #[test]
    fn stripe_get_or_set_single_instance() {
        let stripes = StripeSeries::new();
        let id = tsid(9);
        let a = Arc::new(Mutex::new(MemSeries::new(id, 1000)));
        let b = Arc::new(Mutex::new(MemSeries::new(id, 1000)));
        let (first, created) = stripes.get_or_set(id, a.clone());
        assert!(created);
        let (second, created) = stripes.get_or_set(id, b);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&stripes.get(&id).unwrap(), &a));
    }

    #[test]
    fn stripe_gc_removes_empty_series() {
        let stripes = StripeSeries::new();
        let keep = tsid(1);
        let drop_ = tsid(2);
        let pending = tsid(3);
        for id in [keep, drop_, pending] {
            let series = Arc::new(Mutex::new(MemSeries::new(id, 1_000_000)));
            stripes.get_or_set(id, series);
        }
        stripes.get(&keep).unwrap().lock().unwrap().append(5000, 1.0);
        stripes.get(&drop_).unwrap().lock().unwrap().append(10, 1.0);
        stripes.get(&pending).unwrap().lock().unwrap().pending_commit = true;

        let (removed, _) = stripes.gc(1000);
        assert!(removed.contains(&drop_));
        assert!(!removed.contains(&keep));
        assert!(!removed.contains(&pending), "pending commit protects series");
        assert!(stripes.get(&drop_).is_none());
        assert!(stripes.get(&keep).is_some());
        assert!(stripes.get(&pending).is_some());
    }
}
