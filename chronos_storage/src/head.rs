//! The in-memory head: the writable prefix of the time axis.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::sync::RwLock;
use std::thread;
use std::time::Instant;

use chronos_core::{Sample, Tsid};
use chronos_wal::record::{self, RefSample, Stone};
use chronos_wal::{
    checkpoint, delete_checkpoints, last_checkpoint, SegmentReader, Wal,
    WalError,
};
use crossbeam_utils::sync::WaitGroup;
use tracing::{debug, info, warn};

use crate::series::{MemSeries, StripeSeries};
use crate::tombstones::{self, Intervals, MemTombstones};
use crate::{clamp_interval, Error, Interval, Result};

/// Number of worker shards used while replaying SAMPLES records.
const REPLAY_SHARDS: usize = 8;

/// Appending interface shared by the head and database handles.
pub trait Append {
    /// Queue a sample. Fails with [`Error::OutOfBounds`] below the
    /// appender's minimum valid time and [`Error::OutOfOrderSample`] at or
    /// before the series' newest committed sample.
    fn add(&mut self, tsid: Tsid, t: i64, v: f64) -> Result<()>;
    /// Write queued series and samples to the WAL, then apply them.
    fn commit(&mut self) -> Result<()>;
    /// Drop queued samples. Newly created series are still logged; their
    /// identifiers are permanent.
    fn rollback(&mut self) -> Result<()>;
}

pub struct Head {
    chunk_range: i64,
    wal: Option<Mutex<Wal>>,
    series: StripeSeries,
    /// Sorted set of live identifiers, for full-scan enumeration only.
    postings: RwLock<BTreeSet<Tsid>>,
    min_time: AtomicI64,
    max_time: AtomicI64,
    valid_time: AtomicI64,
    unknown_wal_refs: AtomicU64,
}

impl Head {
    pub fn new(chunk_range: i64, wal: Option<Wal>) -> Result<Self> {
        if chunk_range < 1 {
            return Err(Error::InvalidOptions(format!(
                "invalid chunk range {chunk_range}"
            )));
        }
        Ok(Self {
            chunk_range,
            wal: wal.map(Mutex::new),
            series: StripeSeries::new(),
            postings: RwLock::new(BTreeSet::new()),
            min_time: AtomicI64::new(i64::MAX),
            max_time: AtomicI64::new(i64::MIN),
            valid_time: AtomicI64::new(i64::MIN),
            unknown_wal_refs: AtomicU64::new(0),
        })
    }

    pub fn min_time(&self) -> i64 {
        self.min_time.load(Ordering::SeqCst)
    }

    pub fn max_time(&self) -> i64 {
        self.max_time.load(Ordering::SeqCst)
    }

    pub fn chunk_range(&self) -> i64 {
        self.chunk_range
    }

    /// Samples referencing unknown series seen during WAL replay.
    pub fn unknown_wal_refs(&self) -> u64 {
        self.unknown_wal_refs.load(Ordering::SeqCst)
    }

    pub fn overlap_closed(&self, mint: i64, maxt: i64) -> bool {
        self.min_time() <= maxt && mint <= self.max_time()
    }

    /// Identifiers of all live series, sorted.
    pub fn postings(&self) -> Vec<Tsid> {
        self.postings.read().unwrap().iter().copied().collect()
    }

    pub(crate) fn series_handle(&self, tsid: &Tsid) -> Option<Arc<Mutex<MemSeries>>> {
        self.series.get(tsid)
    }

    /// Load data from the write-ahead log and prepare the head for writes.
    /// Must be called before the first appender is handed out; samples below
    /// `min_valid_time` are ignored.
    pub fn init(&self, min_valid_time: i64) -> Result<()> {
        self.valid_time.store(min_valid_time, Ordering::SeqCst);
        let Some(wal) = &self.wal else { return Ok(()) };

        let dir = wal.lock().unwrap().dir().to_path_buf();
        let mut from = 1;
        match last_checkpoint(&dir) {
            Ok((cp_dir, idx)) => {
                // A corrupted checkpoint is a hard error; there is little
                // data to recover from one anyway.
                let mut reader = SegmentReader::open_dir(&cp_dir)?;
                self.load_wal(&mut reader)?;
                from = idx + 1;
            }
            Err(WalError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let mut reader = SegmentReader::open_from(&dir, from)?;
        match self.load_wal(&mut reader) {
            Ok(()) => {
                self.gc();
                Ok(())
            }
            Err(WalError::Corruption {
                segment,
                offset,
                cause,
            }) => {
                warn!(segment, offset, cause = %cause, "encountered WAL error, attempting repair");
                drop(reader);
                wal.lock().unwrap().repair(segment, offset)?;
                self.gc();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_wal(
        &self,
        reader: &mut SegmentReader,
    ) -> std::result::Result<(), WalError> {
        let all_stones = MemTombstones::new();

        thread::scope(|scope| -> std::result::Result<(), WalError> {
            let mut shards = Vec::with_capacity(REPLAY_SHARDS);
            for _ in 0..REPLAY_SHARDS {
                let (tx, rx) = crossbeam_channel::unbounded::<(
                    Vec<RefSample>,
                    WaitGroup,
                )>();
                scope.spawn(move || {
                    for (batch, wg) in rx {
                        self.process_wal_samples(batch);
                        drop(wg);
                    }
                });
                shards.push(tx);
            }

            while let Some(rec) = reader.next_record()? {
                let corrupt = |cause: &str| WalError::Corruption {
                    segment: reader.segment(),
                    offset: reader.last_offset(),
                    cause: cause.into(),
                };
                match record::record_type(&rec)
                    .map_err(|_| corrupt("invalid record type"))?
                {
                    record::RECORD_SERIES => {
                        let tsids = record::decode_series(&rec)
                            .map_err(|_| corrupt("decode series"))?;
                        for tsid in tsids {
                            self.get_or_create(&tsid);
                        }
                    }
                    record::RECORD_SAMPLES => {
                        let samples = record::decode_samples(&rec)
                            .map_err(|_| corrupt("decode samples"))?;
                        let mut batches: Vec<Vec<RefSample>> =
                            vec![Vec::new(); REPLAY_SHARDS];
                        for s in samples {
                            batches[(s.tsid.fold64() % REPLAY_SHARDS as u64)
                                as usize]
                                .push(s);
                        }
                        // All shards of a record drain before the next
                        // record is read.
                        let wg = WaitGroup::new();
                        for (i, batch) in batches.into_iter().enumerate() {
                            if !batch.is_empty() {
                                let _ = shards[i].send((batch, wg.clone()));
                            }
                        }
                        wg.wait();
                    }
                    record::RECORD_TOMBSTONES => {
                        let stones = record::decode_tombstones(&rec)
                            .map_err(|_| corrupt("decode tombstones"))?;
                        let valid_time = self.valid_time.load(Ordering::SeqCst);
                        for stone in stones {
                            for itvl in stone.intervals {
                                if itvl.maxt < valid_time {
                                    continue;
                                }
                                all_stones.add_interval(stone.tsid, itvl);
                            }
                        }
                    }
                    _ => unreachable!("record_type filters unknown types"),
                }
            }
            Ok(())
        })?;

        all_stones
            .try_iter(|tsid, itvls| self.chunk_rewrite(tsid, itvls))
            .map_err(|e| WalError::Corruption {
                segment: reader.segment(),
                offset: reader.last_offset(),
                cause: format!("deleting samples from tombstones: {e}"),
            })?;

        let unknown = self.unknown_wal_refs();
        if unknown > 0 {
            warn!(unknown_refs = unknown, "unknown series references in WAL");
        }
        Ok(())
    }

    /// Apply one replay shard: samples below the validity floor are
    /// skipped, samples for unknown series counted.
    fn process_wal_samples(&self, samples: Vec<RefSample>) {
        let mut series_map: HashMap<Tsid, Arc<Mutex<MemSeries>>> = HashMap::new();
        let min_valid_time = self.valid_time.load(Ordering::SeqCst);
        let mut mint = i64::MAX;
        let mut maxt = i64::MIN;

        for s in samples {
            if s.t < min_valid_time {
                continue;
            }
            let series = match series_map.get(&s.tsid) {
                Some(series) => series.clone(),
                None => match self.series.get(&s.tsid) {
                    Some(series) => {
                        series_map.insert(s.tsid, series.clone());
                        series
                    }
                    None => {
                        self.unknown_wal_refs.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                },
            };
            series.lock().unwrap().append(s.t, s.v);
            mint = mint.min(s.t);
            maxt = maxt.max(s.t);
        }
        self.update_min_max_time(mint, maxt);
    }

    /// Initialize a completely fresh head with its first timestamp. Returns
    /// true when the initialization took effect.
    pub fn init_time(&self, t: i64) -> bool {
        if self
            .min_time
            .compare_exchange(i64::MAX, t, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        // Concurrent appenders may already have raised max_time.
        let _ = self.max_time.compare_exchange(
            i64::MIN,
            t,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        true
    }

    /// Monotone CAS update of the head time bounds: `min_time` only
    /// decreases (never below the validity floor), `max_time` only grows.
    pub fn update_min_max_time(&self, mint: i64, maxt: i64) {
        loop {
            let lt = self.min_time.load(Ordering::SeqCst);
            if mint >= lt || self.valid_time.load(Ordering::SeqCst) >= mint {
                break;
            }
            if self
                .min_time
                .compare_exchange(lt, mint, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        loop {
            let ht = self.max_time.load(Ordering::SeqCst);
            if maxt <= ht {
                break;
            }
            if self
                .max_time
                .compare_exchange(ht, maxt, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Look up or optimistically create the series for `tsid`. Exactly one
    /// instance is ever observable; losing a creation race returns the
    /// winner.
    pub fn get_or_create(&self, tsid: &Tsid) -> (Arc<Mutex<MemSeries>>, bool) {
        if let Some(series) = self.series.get(tsid) {
            return (series, false);
        }
        let fresh = Arc::new(Mutex::new(MemSeries::new(*tsid, self.chunk_range)));
        let (series, created) = self.series.get_or_set(*tsid, fresh);
        if created {
            self.postings.write().unwrap().insert(*tsid);
        }
        (series, created)
    }

    /// The appender for the head. Until the head has observed a first
    /// timestamp, an init appender defers the choice of the validity floor.
    pub fn appender(&self) -> Box<dyn Append + '_> {
        if self.min_time() == i64::MAX {
            Box::new(InitAppender {
                head: self,
                app: None,
            })
        } else {
            Box::new(self.head_appender())
        }
    }

    fn head_appender(&self) -> HeadAppender<'_> {
        HeadAppender {
            head: self,
            // No samples within half a chunk range of the newest timestamp
            // of the compaction window, to avoid races with persistence.
            min_valid_time: self
                .valid_time
                .load(Ordering::SeqCst)
                .max(self.max_time() - self.chunk_range / 2),
            min_time: i64::MAX,
            max_time: i64::MIN,
            new_series: Vec::new(),
            samples: Vec::new(),
        }
    }

    fn wal_log(&self, rec: &[u8]) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.lock().unwrap().log(rec)?;
        }
        Ok(())
    }

    /// Re-write the chunks of one series with the given ranges removed.
    /// The series is emptied when no samples remain.
    pub fn chunk_rewrite(&self, tsid: &Tsid, dranges: &Intervals) -> Result<()> {
        if dranges.is_empty() {
            return Ok(());
        }
        let Some(series) = self.series.get(tsid) else {
            return Ok(());
        };
        let mut s = series.lock().unwrap();
        if s.chunks().is_empty() {
            return Ok(());
        }

        let mut surviving: Vec<Sample> = Vec::new();
        for mc in s.chunks() {
            for item in mc.chunk.iterator() {
                let sample = item?;
                if !tombstones::is_deleted(sample.t, dranges) {
                    surviving.push(sample);
                }
            }
        }
        s.reset();
        for sample in surviving {
            if !s.append(sample.t, sample.v).0 {
                warn!(%tsid, t = sample.t, "failed to re-add sample during delete");
            }
        }
        Ok(())
    }

    /// Delete `[mint, maxt]` for the given series: rewrite their chunks and
    /// log a tombstones record so a restart replays the deletion.
    pub fn del(&self, mint: i64, maxt: i64, tsids: &[Tsid]) -> Result<()> {
        let (mint, maxt) = clamp_interval(mint, maxt, self.min_time(), self.max_time());
        if mint > maxt {
            return Err(Error::InvalidOptions(
                "given range outside the head range".into(),
            ));
        }

        let mut stones = Vec::new();
        let mut dirty = false;
        for tsid in tsids {
            let Some(series) = self.series.get(tsid) else {
                return Err(Error::NotFound);
            };
            let (t0, t1) = {
                let s = series.lock().unwrap();
                match (s.min_time(), s.max_time()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                }
            };
            // Delete only up to the current values, not beyond.
            let (lo, hi) = clamp_interval(mint, maxt, t0, t1);
            if lo > hi {
                continue;
            }
            let itvls = vec![Interval::new(lo, hi)];
            if self.wal.is_some() {
                stones.push(Stone {
                    tsid: *tsid,
                    intervals: itvls.clone(),
                });
            }
            self.chunk_rewrite(tsid, &itvls)?;
            dirty = true;
        }
        if self.wal.is_some() && !stones.is_empty() {
            // The stones are not kept in head memory, but a restart must
            // re-apply them while loading the WAL.
            let mut rec = Vec::new();
            record::encode_tombstones(&stones, &mut rec);
            self.wal_log(&rec)?;
        }
        if dirty {
            self.gc();
        }
        Ok(())
    }

    /// Drop chunks strictly before the head's `min_time` and forget series
    /// left empty.
    pub fn gc(&self) {
        let mint = self.min_time();
        let (removed, chunks_removed) = self.series.gc(mint);
        if removed.is_empty() && chunks_removed == 0 {
            debug!("head gc: nothing to collect");
            return;
        }
        let mut postings = self.postings.write().unwrap();
        for tsid in &removed {
            postings.remove(tsid);
        }
        debug!(
            series = removed.len(),
            chunks = chunks_removed,
            "head gc complete"
        );
    }

    /// Advance the head's lower bound to `mint`, garbage-collect, and move
    /// the WAL forward by checkpointing the lower third of its segments.
    /// A no-op before the head observed its first timestamp.
    pub fn truncate(&self, mint: i64) -> Result<()> {
        let uninitialized = self.min_time() == i64::MAX;
        if self.min_time() >= mint && !uninitialized {
            return Ok(());
        }
        self.min_time.store(mint, Ordering::SeqCst);
        self.valid_time.store(mint, Ordering::SeqCst);
        // Max time stays at least as high as min time.
        let maxt = self.max_time();
        if maxt < mint {
            let _ = self.max_time.compare_exchange(
                maxt,
                mint,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        // Initial truncation after loading blocks on startup: the WAL has
        // not been read back yet, leave it alone.
        if uninitialized {
            return Ok(());
        }

        let start = Instant::now();
        self.gc();
        info!(min_time = mint, elapsed = ?start.elapsed(), "head gc completed");

        let Some(wal) = &self.wal else { return Ok(()) };
        let start = Instant::now();
        let dir = wal.lock().unwrap().dir().to_path_buf();
        let Some((first, last)) = chronos_wal::segments(&dir)? else {
            return Ok(());
        };
        // Never consider the last segment for checkpointing, and only
        // bother once enough segments accumulated: the lower third holds
        // mostly obsolete samples.
        if last <= first {
            return Ok(());
        }
        let last = first + (last - 1 - first) / 3;
        if last <= first {
            return Ok(());
        }

        {
            let mut wal = wal.lock().unwrap();
            checkpoint(&mut wal, first, last, |tsid| self.series.get(tsid).is_some(), mint)?;
            if let Err(e) = wal.truncate(last + 1) {
                // Leftover segments are superseded by the checkpoint and
                // ignored in the future; retry at the next checkpoint.
                warn!(error = %e, "truncating WAL segments failed");
            }
        }
        if let Err(e) = delete_checkpoints(&dir, last) {
            // Old checkpoints only occupy disk space; a higher checkpoint
            // supersedes them.
            warn!(error = %e, "deleting old checkpoints failed");
        }
        info!(first, last, elapsed = ?start.elapsed(), "WAL checkpoint complete");
        Ok(())
    }

    /// Sync the WAL tail. Called on database close.
    pub fn close(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.lock().unwrap().close()?;
        }
        Ok(())
    }
}

struct PendingSample {
    tsid: Tsid,
    t: i64,
    v: f64,
    series: Arc<Mutex<MemSeries>>,
}

/// Appender bound to an initialized head.
pub struct HeadAppender<'h> {
    head: &'h Head,
    /// No samples below this timestamp are allowed.
    min_valid_time: i64,
    min_time: i64,
    max_time: i64,
    new_series: Vec<Tsid>,
    samples: Vec<PendingSample>,
}

impl<'h> HeadAppender<'h> {
    fn log(&mut self) -> Result<()> {
        if !self.new_series.is_empty() {
            let mut rec = Vec::new();
            record::encode_series(&self.new_series, &mut rec);
            self.head.wal_log(&rec)?;
        }
        if !self.samples.is_empty() {
            let refs: Vec<RefSample> = self
                .samples
                .iter()
                .map(|s| RefSample {
                    tsid: s.tsid,
                    t: s.t,
                    v: s.v,
                })
                .collect();
            let mut rec = Vec::new();
            record::encode_samples(&refs, &mut rec);
            self.head.wal_log(&rec)?;
        }
        Ok(())
    }
}

impl<'h> Append for HeadAppender<'h> {
    fn add(&mut self, tsid: Tsid, t: i64, v: f64) -> Result<()> {
        if t < self.min_valid_time {
            return Err(Error::OutOfBounds);
        }
        let (series, created) = self.head.get_or_create(&tsid);
        if created {
            self.new_series.push(tsid);
        }
        {
            let mut s = series.lock().unwrap();
            s.appendable(t)?;
            s.pending_commit = true;
        }
        self.samples.push(PendingSample {
            tsid,
            t,
            v,
            series,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.log()?;
        // Apply per series under a single lock hold, so readers observe a
        // commit's samples for one series all at once or not at all.
        let mut groups: Vec<(Arc<Mutex<MemSeries>>, Vec<(i64, f64)>)> = Vec::new();
        let mut index: HashMap<Tsid, usize> = HashMap::new();
        for pending in self.samples.drain(..) {
            let slot = *index.entry(pending.tsid).or_insert_with(|| {
                groups.push((pending.series.clone(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push((pending.t, pending.v));
        }
        for (series, samples) in groups {
            let mut s = series.lock().unwrap();
            for (t, v) in samples {
                if s.append(t, v).0 {
                    self.min_time = self.min_time.min(t);
                    self.max_time = self.max_time.max(t);
                }
            }
            s.pending_commit = false;
        }
        self.new_series.clear();
        self.head
            .update_min_max_time(self.min_time, self.max_time);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        for pending in self.samples.drain(..) {
            pending.series.lock().unwrap().pending_commit = false;
        }
        // Series created by this appender exist in the head regardless of
        // the rollback, so their records must still reach the WAL.
        let result = self.log();
        self.new_series.clear();
        result
    }
}

/// Appender handed out before the head has observed any timestamp. The
/// first `add` fixes the head's initial time bounds, then delegates to a
/// regular head appender.
pub struct InitAppender<'h> {
    head: &'h Head,
    app: Option<HeadAppender<'h>>,
}

impl<'h> Append for InitAppender<'h> {
    fn add(&mut self, tsid: Tsid, t: i64, v: f64) -> Result<()> {
        if self.app.is_none() {
            self.head.init_time(t);
            self.app = Some(self.head.head_appender());
        }
        self.app.as_mut().unwrap().add(tsid, t, v)
    }

    fn commit(&mut self) -> Result<()> {
        match &mut self.app {
            Some(app) => app.commit(),
            None => Ok(()),
        }
    }

    fn rollback(&mut self) -> Result<()> {
        match &mut self.app {
            Some(app) => app.rollback(),
            None => Ok(()),
        }
    }
}
