//! Per-series deletion intervals and their on-disk file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::RwLock;

use chronos_core::encoding::{Decbuf, Encbuf};
use chronos_core::{Interval, Tsid};

use crate::{Error, Result};

pub const TOMBSTONES_FILE: &str = "tombstones";

const MAGIC_TOMBSTONES: u32 = 0x0130_ba30;
const TOMBSTONES_FORMAT_V1: u8 = 1;

/// Ordered, non-overlapping deletion intervals for one series.
pub type Intervals = Vec<Interval>;

/// Merge `itvl` into `itvls`, coalescing overlapping and adjacent entries.
pub fn add_interval(itvls: &mut Intervals, itvl: Interval) {
    let mut merged = Interval::new(itvl.mint, itvl.maxt);
    let mut out = Vec::with_capacity(itvls.len() + 1);
    let mut placed = false;
    for &cur in itvls.iter() {
        if cur.maxt < merged.mint.saturating_sub(1) {
            out.push(cur);
        } else if cur.mint > merged.maxt.saturating_add(1) {
            if !placed {
                out.push(merged);
                placed = true;
            }
            out.push(cur);
        } else {
            merged.mint = merged.mint.min(cur.mint);
            merged.maxt = merged.maxt.max(cur.maxt);
        }
    }
    if !placed {
        out.push(merged);
    }
    *itvls = out;
}

/// Whether `[mint, maxt]` is fully covered by a single interval.
pub fn is_subrange(mint: i64, maxt: i64, itvls: &Intervals) -> bool {
    itvls
        .iter()
        .any(|itvl| itvl.mint <= mint && maxt <= itvl.maxt)
}

/// Whether `t` falls inside any of the intervals.
pub fn is_deleted(t: i64, itvls: &Intervals) -> bool {
    itvls.iter().any(|itvl| itvl.contains(t))
}

/// In-memory tombstone set guarded by a read-write lock.
#[derive(Debug, Default)]
pub struct MemTombstones {
    groups: RwLock<HashMap<Tsid, Intervals>>,
}

impl MemTombstones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tsid: &Tsid) -> Intervals {
        self.groups
            .read()
            .unwrap()
            .get(tsid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_interval(&self, tsid: Tsid, itvl: Interval) {
        let mut groups = self.groups.write().unwrap();
        add_interval(groups.entry(tsid).or_default(), itvl);
    }

    /// Total number of intervals across all series.
    pub fn total(&self) -> u64 {
        self.groups
            .read()
            .unwrap()
            .values()
            .map(|itvls| itvls.len() as u64)
            .sum()
    }

    pub fn iter(&self, mut f: impl FnMut(&Tsid, &Intervals)) {
        for (tsid, itvls) in self.groups.read().unwrap().iter() {
            f(tsid, itvls);
        }
    }

    pub fn try_iter(
        &self,
        mut f: impl FnMut(&Tsid, &Intervals) -> Result<()>,
    ) -> Result<()> {
        for (tsid, itvls) in self.groups.read().unwrap().iter() {
            f(tsid, itvls)?;
        }
        Ok(())
    }
}

/// Write the tombstone set of a block directory atomically.
pub fn write_tombstones(dir: &Path, stones: &MemTombstones) -> Result<()> {
    let mut enc = Encbuf::new();
    enc.put_u32_be(MAGIC_TOMBSTONES);
    enc.put_byte(TOMBSTONES_FORMAT_V1);
    stones.iter(|tsid, itvls| {
        enc.put_tsid(tsid);
        enc.put_uvarint(itvls.len() as u64);
        for itvl in itvls {
            enc.put_varint(itvl.mint);
            enc.put_uvarint((itvl.maxt - itvl.mint) as u64);
        }
    });
    enc.put_crc32();

    let tmp = dir.join(format!("{TOMBSTONES_FILE}.tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(enc.as_slice())?;
    file.sync_data()?;
    fs::rename(&tmp, dir.join(TOMBSTONES_FILE))?;
    Ok(())
}

/// Read the tombstone file of a block directory. A missing file yields an
/// empty set.
pub fn read_tombstones(dir: &Path) -> Result<MemTombstones> {
    let stones = MemTombstones::new();
    let data = match fs::read(dir.join(TOMBSTONES_FILE)) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stones),
        Err(e) => return Err(e.into()),
    };
    if data.len() < 9 {
        return Err(Error::InvalidMagic("tombstones"));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
    if crc32c::crc32c(body) != crc {
        return Err(Error::ChecksumMismatch("tombstones"));
    }

    let mut dec = Decbuf::new(body);
    if dec.get_u32_be() != MAGIC_TOMBSTONES {
        return Err(Error::InvalidMagic("tombstones"));
    }
    if dec.get_byte() != TOMBSTONES_FORMAT_V1 {
        return Err(Error::InvalidVersion("tombstones"));
    }
    while dec.remaining() > 0 && dec.err().is_none() {
        let tsid = dec.get_tsid();
        let count = dec.get_uvarint();
        for _ in 0..count {
            let mint = dec.get_varint();
            let span = dec.get_uvarint() as i64;
            stones.add_interval(tsid, Interval::new(mint, mint + span));
            if dec.err().is_some() {
                break;
            }
        }
    }
    dec.finish().map_err(Error::from)?;
    Ok(stones)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(a: i64, b: i64) -> Interval {
        Interval::new(a, b)
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let mut itvls = Intervals::new();
        add_interval(&mut itvls, iv(10, 20));
        add_interval(&mut itvls, iv(30, 40));
        assert_eq!(itvls, vec![iv(10, 20), iv(30, 40)]);

        // Overlap joins.
        add_interval(&mut itvls, iv(15, 35));
        assert_eq!(itvls, vec![iv(10, 40)]);

        // Adjacency joins too.
        add_interval(&mut itvls, iv(41, 50));
        assert_eq!(itvls, vec![iv(10, 50)]);
        add_interval(&mut itvls, iv(5, 9));
        assert_eq!(itvls, vec![iv(5, 50)]);

        // Disjoint stays ordered.
        add_interval(&mut itvls, iv(100, 110));
        add_interval(&mut itvls, iv(60, 70));
        assert_eq!(itvls, vec![iv(5, 50), iv(60, 70), iv(100, 110)]);
    }

    #[test]
    fn subrange_and_membership() {
        let itvls = vec![iv(0, 100), iv(200, 300)];
        assert!(is_subrange(10, 90, &itvls));
        assert!(!is_subrange(90, 210, &itvls));
        assert!(is_deleted(250, &itvls));
        assert!(!is_deleted(150, &itvls));
    }

    #[test]
    fn random_inserts_stay_sorted_and_disjoint() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xdead);
        let mut itvls = Intervals::new();
        let mut deleted = std::collections::BTreeSet::new();
        for _ in 0..500 {
            let mint = rng.gen_range(-1000i64..1000);
            let maxt = mint + rng.gen_range(0i64..50);
            add_interval(&mut itvls, iv(mint, maxt));
            deleted.extend(mint..=maxt);
        }
        // Sorted, non-overlapping, non-adjacent.
        for pair in itvls.windows(2) {
            assert!(pair[0].maxt + 1 < pair[1].mint, "{pair:?}");
        }
        // Membership matches the naive model.
        for t in -1100..1100 {
            assert_eq!(is_deleted(t, &itvls), deleted.contains(&t), "t={t}");
        }
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let stones = MemTombstones::new();
        let a = Tsid::from_bytes([1; 16]);
        let b = Tsid::from_bytes([2; 16]);
        stones.add_interval(a, iv(-100, 50));
        stones.add_interval(a, iv(70, 80));
        stones.add_interval(b, iv(0, 0));
        write_tombstones(dir.path(), &stones).unwrap();

        let read = read_tombstones(dir.path()).unwrap();
        assert_eq!(read.get(&a), vec![iv(-100, 50), iv(70, 80)]);
        assert_eq!(read.get(&b), vec![iv(0, 0)]);
        assert_eq!(read.total(), 3);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let stones = read_tombstones(dir.path()).unwrap();
        assert_eq!(stones.total(), 0);
    }

    #[test]
    fn corrupted_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let stones = MemTombstones::new();
        stones.add_interval(Tsid::from_bytes([9; 16]), iv(1, 2));
        write_tombstones(dir.path(), &stones).unwrap();

        let path = dir.path().join(TOMBSTONES_FILE);
        let mut data = fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0x55;
        fs::write(&path, data).unwrap();
        assert!(read_tombstones(dir.path()).is_err());
    }
}
