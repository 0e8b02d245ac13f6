//! Checkpointing: compacting a range of segments into a superseding image.
//!
//! A checkpoint is a directory `checkpoint.N` (N = the last compacted
//! segment) holding a regular WAL whose records are the filtered union of
//! the previous checkpoint and segments `[from, to]`. Once written, the
//! source segments can be truncated and earlier checkpoints deleted.

use std::fs;
use std::path::{Path, PathBuf};

use chronos_core::Tsid;
use tracing::info;

use crate::reader::SegmentReader;
use crate::record::{self, RefSample, Stone};
use crate::{list_segments, Result, Wal, WalError};

const CHECKPOINT_PREFIX: &str = "checkpoint.";

/// Counters describing what a checkpoint kept and dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckpointStats {
    pub kept_series: usize,
    pub dropped_series: usize,
    pub kept_samples: usize,
    pub dropped_samples: usize,
    pub kept_tombstones: usize,
    pub dropped_tombstones: usize,
}

/// The highest-numbered checkpoint directory in `dir`.
///
/// Returns [`WalError::NotFound`] when none exists.
pub fn last_checkpoint(dir: &Path) -> Result<(PathBuf, u64)> {
    let mut best: Option<(PathBuf, u64)> = None;
    if !dir.exists() {
        return Err(WalError::NotFound);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(idx) = name.strip_prefix(CHECKPOINT_PREFIX) else {
            continue;
        };
        let Ok(idx) = idx.parse::<u64>() else { continue };
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if best.as_ref().map_or(true, |(_, b)| idx > *b) {
            best = Some((entry.path(), idx));
        }
    }
    best.ok_or(WalError::NotFound)
}

/// Delete all checkpoint directories with an index below `max_index`.
pub fn delete_checkpoints(dir: &Path, max_index: u64) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(idx) = name.strip_prefix(CHECKPOINT_PREFIX) else {
            continue;
        };
        // Stale tmp directories are always removed.
        if idx.ends_with(".tmp") {
            fs::remove_dir_all(entry.path())?;
            continue;
        }
        let Ok(idx) = idx.parse::<u64>() else { continue };
        if idx < max_index {
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

/// Compact the previous checkpoint and segments `[from, to]` of `wal` into
/// a new `checkpoint.{to}` directory.
///
/// Series for which `keep` returns false are dropped, as are samples below
/// `min_valid_time` and tombstone intervals ending before it. The caller
/// may truncate the source segments once this returns.
pub fn checkpoint(
    wal: &mut Wal,
    from: u64,
    to: u64,
    keep: impl Fn(&Tsid) -> bool,
    min_valid_time: i64,
) -> Result<CheckpointStats> {
    let dir = wal.dir().to_path_buf();
    let mut sources = Vec::new();
    let mut from = from;
    match last_checkpoint(&dir) {
        Ok((cp_dir, idx)) => {
            // The previous checkpoint supersedes everything up to its index.
            sources.extend(list_segments(&cp_dir)?);
            from = from.max(idx + 1);
        }
        Err(WalError::NotFound) => {}
        Err(e) => return Err(e),
    }
    sources.extend(
        list_segments(&dir)?
            .into_iter()
            .filter(|(seq, _)| (from..=to).contains(seq)),
    );

    let final_dir = dir.join(format!("{CHECKPOINT_PREFIX}{:08}", to));
    let tmp_dir = dir.join(format!("{CHECKPOINT_PREFIX}{:08}.tmp", to));
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)?;
    }

    let mut stats = CheckpointStats::default();
    {
        let mut out = Wal::open(&tmp_dir, wal.segment_size())?;
        let mut reader = SegmentReader::over(sources)?;
        let mut buf = Vec::new();

        while let Some(rec) = reader.next_record()? {
            buf.clear();
            match record::record_type(&rec)? {
                record::RECORD_SERIES => {
                    let tsids: Vec<Tsid> = record::decode_series(&rec)?
                        .into_iter()
                        .filter(|tsid| {
                            let keep = keep(tsid);
                            if keep {
                                stats.kept_series += 1;
                            } else {
                                stats.dropped_series += 1;
                            }
                            keep
                        })
                        .collect();
                    if tsids.is_empty() {
                        continue;
                    }
                    record::encode_series(&tsids, &mut buf);
                }
                record::RECORD_SAMPLES => {
                    let samples: Vec<RefSample> = record::decode_samples(&rec)?
                        .into_iter()
                        .filter(|s| {
                            let keep = s.t >= min_valid_time;
                            if keep {
                                stats.kept_samples += 1;
                            } else {
                                stats.dropped_samples += 1;
                            }
                            keep
                        })
                        .collect();
                    if samples.is_empty() {
                        continue;
                    }
                    record::encode_samples(&samples, &mut buf);
                }
                record::RECORD_TOMBSTONES => {
                    let stones: Vec<Stone> = record::decode_tombstones(&rec)?
                        .into_iter()
                        .filter_map(|mut stone| {
                            let before = stone.intervals.len();
                            stone
                                .intervals
                                .retain(|itvl| itvl.maxt >= min_valid_time);
                            stats.kept_tombstones += stone.intervals.len();
                            stats.dropped_tombstones +=
                                before - stone.intervals.len();
                            (!stone.intervals.is_empty()).then_some(stone)
                        })
                        .collect();
                    if stones.is_empty() {
                        continue;
                    }
                    record::encode_tombstones(&stones, &mut buf);
                }
                _ => unreachable!("record_type filters unknown types"),
            }
            out.log(&buf)?;
        }
        out.close()?;
    }

    if final_dir.exists() {
        fs::remove_dir_all(&final_dir)?;
    }
    fs::rename(&tmp_dir, &final_dir)?;
    if let Ok(parent) = fs::File::open(&dir) {
        parent.sync_all()?;
    }
    info!(
        from,
        to,
        kept_samples = stats.kept_samples,
        dropped_samples = stats.dropped_samples,
        "checkpoint written"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RefSample, Stone};
    use chronos_core::Interval;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn tsid(b: u8) -> Tsid {
        Tsid::from_bytes([b; 16])
    }

    fn replay(dir: &Path, from: u64) -> (Vec<Tsid>, Vec<RefSample>, Vec<Stone>) {
        let mut series = Vec::new();
        let mut samples = Vec::new();
        let mut stones = Vec::new();

        let mut sources = Vec::new();
        let mut from = from;
        if let Ok((cp, idx)) = last_checkpoint(dir) {
            sources.extend(list_segments(&cp).unwrap());
            from = from.max(idx + 1);
        }
        sources.extend(
            list_segments(dir)
                .unwrap()
                .into_iter()
                .filter(|(seq, _)| *seq >= from),
        );
        let mut reader = SegmentReader::over(sources).unwrap();
        while let Some(rec) = reader.next_record().unwrap() {
            match record::record_type(&rec).unwrap() {
                record::RECORD_SERIES => {
                    series.extend(record::decode_series(&rec).unwrap())
                }
                record::RECORD_SAMPLES => {
                    samples.extend(record::decode_samples(&rec).unwrap())
                }
                record::RECORD_TOMBSTONES => {
                    stones.extend(record::decode_tombstones(&rec).unwrap())
                }
                _ => unreachable!(),
            }
        }
        (series, samples, stones)
    }

    #[test]
    fn checkpoint_filters_and_supersedes() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), crate::PAGE_SIZE as u64).unwrap();

        let mut buf = Vec::new();
        record::encode_series(&[tsid(1), tsid(2)], &mut buf);
        wal.log(&buf).unwrap();

        buf.clear();
        record::encode_tombstones(
            &[Stone {
                tsid: tsid(1),
                intervals: vec![Interval::new(0, 50), Interval::new(4000, 4100)],
            }],
            &mut buf,
        );
        wal.log(&buf).unwrap();

        for i in 0..3000i64 {
            buf.clear();
            record::encode_samples(
                &[
                    RefSample { tsid: tsid(1), t: i * 10, v: i as f64 },
                    RefSample { tsid: tsid(2), t: i * 10, v: -i as f64 },
                ],
                &mut buf,
            );
            wal.log(&buf).unwrap();
        }
        wal.close().unwrap();

        let (_, last) = crate::segments(dir.path()).unwrap().unwrap();
        assert!(last >= 3, "need several segments, got {last}");
        let upto = last - 1;

        // Drop series 2 and everything before t=3000.
        let stats = checkpoint(&mut wal, 1, upto, |t| *t == tsid(1), 3000).unwrap();
        assert!(stats.dropped_samples > 0);
        assert_eq!(
            last_checkpoint(dir.path()).unwrap().1,
            upto,
            "checkpoint directory index"
        );
        wal.truncate(upto + 1).unwrap();

        let (series, samples, stones) = replay(dir.path(), 1);
        let ids: HashSet<Tsid> = series.into_iter().collect();
        assert!(ids.contains(&tsid(1)));
        // Checkpointed samples respect the validity floor; samples from the
        // segments beyond the checkpoint are untouched.
        let checkpointed: Vec<&RefSample> =
            samples.iter().filter(|s| s.t < 3000).collect();
        for s in checkpointed {
            panic!("sample below min_valid_time survived: {:?}", s);
        }
        assert!(!samples.is_empty());
        assert_eq!(stones.len(), 1);
        assert_eq!(stones[0].intervals, vec![Interval::new(4000, 4100)]);
    }

    #[test]
    fn checkpoint_equivalence() {
        // Replaying checkpoint.N + segments[N+1..] equals replaying
        // segments[0..] with the same filters applied.
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), crate::PAGE_SIZE as u64).unwrap();

        let mut buf = Vec::new();
        record::encode_series(&[tsid(7)], &mut buf);
        wal.log(&buf).unwrap();
        for i in 0..2000i64 {
            buf.clear();
            record::encode_samples(
                &[RefSample { tsid: tsid(7), t: i, v: i as f64 }],
                &mut buf,
            );
            wal.log(&buf).unwrap();
        }
        wal.close().unwrap();

        let (_, before_samples, _) = replay(dir.path(), 1);

        let (_, last) = crate::segments(dir.path()).unwrap().unwrap();
        let upto = last - 1;
        checkpoint(&mut wal, 1, upto, |_| true, i64::MIN).unwrap();
        wal.truncate(upto + 1).unwrap();
        delete_checkpoints(dir.path(), upto).unwrap();

        let (_, after_samples, _) = replay(dir.path(), 1);
        assert_eq!(before_samples, after_samples);
    }

    #[test]
    fn last_checkpoint_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            last_checkpoint(dir.path()),
            Err(WalError::NotFound)
        ));
    }
}
