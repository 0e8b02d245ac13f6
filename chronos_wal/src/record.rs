//! Encoding and decoding of the logical record types stored in the log.
//!
//! Every record payload starts with a one-byte entry type. Series records
//! catalogue identifiers so replay can learn them without samples; sample
//! records delta-encode against the first sample; tombstone records carry
//! per-series deletion intervals.

use chronos_core::encoding::{Decbuf, Encbuf};
use chronos_core::{Interval, Tsid};

use crate::{Result, WalError};

/// Record entry types.
pub const RECORD_SERIES: u8 = 1;
pub const RECORD_SAMPLES: u8 = 2;
pub const RECORD_TOMBSTONES: u8 = 3;

/// A timestamped value bound to its series identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefSample {
    pub tsid: Tsid,
    pub t: i64,
    pub v: f64,
}

/// Deletion intervals for one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stone {
    pub tsid: Tsid,
    pub intervals: Vec<Interval>,
}

/// The entry type of an encoded record.
pub fn record_type(rec: &[u8]) -> Result<u8> {
    match rec.first() {
        Some(&t @ (RECORD_SERIES | RECORD_SAMPLES | RECORD_TOMBSTONES)) => Ok(t),
        Some(_) => Err(WalError::InvalidRecord("unknown record type")),
        None => Err(WalError::InvalidRecord("empty record")),
    }
}

/// Encode a series record: the type byte followed by raw identifiers.
pub fn encode_series(tsids: &[Tsid], buf: &mut Vec<u8>) {
    buf.push(RECORD_SERIES);
    for tsid in tsids {
        buf.extend_from_slice(tsid.as_bytes());
    }
}

pub fn decode_series(rec: &[u8]) -> Result<Vec<Tsid>> {
    let body = rec
        .strip_prefix(&[RECORD_SERIES])
        .ok_or(WalError::InvalidRecord("not a series record"))?;
    if body.len() % Tsid::LEN != 0 {
        return Err(WalError::InvalidRecord("series record length"));
    }
    body.chunks_exact(Tsid::LEN)
        .map(|c| Tsid::read_from(c).map_err(WalError::from))
        .collect()
}

/// Encode a samples record. The first sample's identifier and timestamp are
/// the baselines; each sample stores a zig-zag identifier delta, a zig-zag
/// timestamp delta and the raw big-endian value bits.
pub fn encode_samples(samples: &[RefSample], buf: &mut Vec<u8>) {
    buf.push(RECORD_SAMPLES);
    let Some(first) = samples.first() else {
        return;
    };
    let mut enc = Encbuf::new();
    enc.put_tsid(&first.tsid);
    enc.put_u64_be(first.t as u64);
    let base_id = first.tsid.to_u128();
    for s in samples {
        enc.put_varint128(s.tsid.to_u128().wrapping_sub(base_id) as i128);
        enc.put_varint(s.t - first.t);
        enc.put_u64_be(s.v.to_bits());
    }
    buf.extend_from_slice(enc.as_slice());
}

pub fn decode_samples(rec: &[u8]) -> Result<Vec<RefSample>> {
    let body = rec
        .strip_prefix(&[RECORD_SAMPLES])
        .ok_or(WalError::InvalidRecord("not a samples record"))?;
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let mut dec = Decbuf::new(body);
    let base_tsid = dec.get_tsid();
    let base_t = dec.get_u64_be() as i64;
    let base_id = base_tsid.to_u128();

    let mut samples = Vec::new();
    while dec.remaining() > 0 && dec.err().is_none() {
        let id_delta = dec.get_varint128();
        let t_delta = dec.get_varint();
        let v_bits = dec.get_u64_be();
        samples.push(RefSample {
            tsid: Tsid::from_u128(base_id.wrapping_add(id_delta as u128)),
            t: base_t + t_delta,
            v: f64::from_bits(v_bits),
        });
    }
    dec.finish()?;
    Ok(samples)
}

/// Encode a tombstones record.
pub fn encode_tombstones(stones: &[Stone], buf: &mut Vec<u8>) {
    buf.push(RECORD_TOMBSTONES);
    let mut enc = Encbuf::new();
    for stone in stones {
        enc.put_tsid(&stone.tsid);
        enc.put_uvarint(stone.intervals.len() as u64);
        for itvl in &stone.intervals {
            enc.put_varint(itvl.mint);
            enc.put_uvarint((itvl.maxt - itvl.mint) as u64);
        }
    }
    buf.extend_from_slice(enc.as_slice());
}

pub fn decode_tombstones(rec: &[u8]) -> Result<Vec<Stone>> {
    let body = rec
        .strip_prefix(&[RECORD_TOMBSTONES])
        .ok_or(WalError::InvalidRecord("not a tombstones record"))?;
    let mut dec = Decbuf::new(body);
    let mut stones = Vec::new();
    while dec.remaining() > 0 && dec.err().is_none() {
        let tsid = dec.get_tsid();
        let count = dec.get_uvarint();
        let mut intervals = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let mint = dec.get_varint();
            let span = dec.get_uvarint() as i64;
            intervals.push(Interval::new(mint, mint + span));
            if dec.err().is_some() {
                break;
            }
        }
        stones.push(Stone { tsid, intervals });
    }
    dec.finish()?;
    Ok(stones)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsid(b: u8) -> Tsid {
        Tsid::from_bytes([b; 16])
    }

    #[test]
    fn series_roundtrip() {
        let tsids = vec![tsid(1), tsid(2), tsid(0xff)];
        let mut buf = Vec::new();
        encode_series(&tsids, &mut buf);
        assert_eq!(record_type(&buf).unwrap(), RECORD_SERIES);
        assert_eq!(decode_series(&buf).unwrap(), tsids);
    }

    #[test]
    fn samples_roundtrip() {
        let samples = vec![
            RefSample { tsid: tsid(9), t: 1_000, v: 1.5 },
            RefSample { tsid: tsid(9), t: 2_000, v: -2.5 },
            RefSample { tsid: tsid(1), t: 900, v: f64::NAN },
            RefSample { tsid: tsid(0xfe), t: 3_000, v: 0.0 },
        ];
        let mut buf = Vec::new();
        encode_samples(&samples, &mut buf);
        let decoded = decode_samples(&buf).unwrap();
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in decoded.iter().zip(&samples) {
            assert_eq!(a.tsid, b.tsid);
            assert_eq!(a.t, b.t);
            assert_eq!(a.v.to_bits(), b.v.to_bits());
        }
    }

    #[test]
    fn empty_samples_record() {
        let mut buf = Vec::new();
        encode_samples(&[], &mut buf);
        assert!(decode_samples(&buf).unwrap().is_empty());
    }

    #[test]
    fn tombstones_roundtrip() {
        let stones = vec![
            Stone {
                tsid: tsid(3),
                intervals: vec![Interval::new(-50, 100), Interval::new(200, 300)],
            },
            Stone { tsid: tsid(4), intervals: vec![Interval::new(0, 0)] },
        ];
        let mut buf = Vec::new();
        encode_tombstones(&stones, &mut buf);
        assert_eq!(decode_tombstones(&buf).unwrap(), stones);
    }

    #[test]
    fn truncated_record_fails() {
        let samples = vec![RefSample { tsid: tsid(7), t: 42, v: 3.0 }];
        let mut buf = Vec::new();
        encode_samples(&samples, &mut buf);
        buf.truncate(buf.len() - 3);
        assert!(decode_samples(&buf).is_err());
    }
}
