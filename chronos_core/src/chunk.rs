//! Gorilla-style XOR compression of `(i64, f64)` sample pairs.
//!
//! Byte layout: the first two bytes hold the sample count big-endian,
//! followed by a single bit stream interleaving timestamps and values.
//!
//! - sample 0: full timestamp as a signed varint, full 64 value bits
//! - sample 1: timestamp delta as an unsigned varint, value XOR write
//! - sample n: timestamp delta-of-delta with prefix buckets
//!   `0`, `10`+7b, `110`+9b, `1110`+12b, `1111`+32b, value XOR write
//!
//! An XOR write is a `0` bit for an unchanged value, otherwise a `1` bit and
//! either a `0` bit reusing the previous leading/trailing window or a `1`
//! bit followed by a 5-bit leading-zero count, a 6-bit meaningful-bit count
//! (64 wraps to 0) and the meaningful bits themselves.

use crate::bitstream::{BitReader, BitWriter};
use crate::encoding;
use crate::{CodecError, Result, Sample};

/// Chunk encoding tag as stored in chunk files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    None = 0,
    Xor = 1,
}

impl Encoding {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Encoding::None),
            1 => Ok(Encoding::Xor),
            _ => Err(CodecError::Invalid("unknown chunk encoding")),
        }
    }
}

const HEADER_BITS: usize = 16;

/// A compressed run of samples for one series.
#[derive(Debug, Clone)]
pub struct XorChunk {
    stream: BitWriter,
}

impl Default for XorChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl XorChunk {
    pub fn new() -> Self {
        let mut stream = BitWriter::new();
        stream.write_bits(0, HEADER_BITS);
        Self { stream }
    }

    /// Wrap encoded chunk bytes read back from disk.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < 2 {
            return Err(CodecError::Eof);
        }
        Ok(Self {
            stream: BitWriter::from_bytes(data),
        })
    }

    pub fn encoding(&self) -> Encoding {
        Encoding::Xor
    }

    /// The encoded bytes. Valid and decodable after every append.
    pub fn bytes(&self) -> &[u8] {
        self.stream.as_raw_slice()
    }

    pub fn size(&self) -> usize {
        self.stream.as_raw_slice().len()
    }

    pub fn num_samples(&self) -> u16 {
        let mut r = BitReader::new(self.stream.as_bits());
        r.read_bits(HEADER_BITS).unwrap_or(0) as u16
    }

    fn set_num_samples(&mut self, n: u16) {
        self.stream.overwrite_bits(0, n as u64, HEADER_BITS);
    }

    /// Append a sample using the given appender state.
    ///
    /// Ordering (`t` strictly greater than the previous timestamp) is
    /// enforced by the owning series, not here.
    pub fn append(&mut self, app: &mut XorAppender, t: i64, v: f64) {
        let num = self.num_samples();
        match num {
            0 => {
                let mut buf = Vec::with_capacity(encoding::MAX_VARINT_LEN_64);
                encoding::encode_varint(&mut buf, t);
                for b in buf {
                    self.stream.write_byte(b);
                }
                self.stream.write_bits(v.to_bits(), 64);
            }
            1 => {
                let tdelta = (t - app.t) as u64;
                let mut buf = Vec::with_capacity(encoding::MAX_VARINT_LEN_64);
                encoding::encode_uvarint(&mut buf, tdelta);
                for b in buf {
                    self.stream.write_byte(b);
                }
                app.tdelta = tdelta;
                self.write_value(app, v);
            }
            _ => {
                let tdelta = (t - app.t) as u64;
                let dod = tdelta.wrapping_sub(app.tdelta) as i64;
                match dod {
                    0 => self.stream.write_bit(false),
                    _ if bit_range(dod, 7) => {
                        self.stream.write_bits(0b10, 2);
                        self.stream.write_bits(dod as u64 & 0x7f, 7);
                    }
                    _ if bit_range(dod, 9) => {
                        self.stream.write_bits(0b110, 3);
                        self.stream.write_bits(dod as u64 & 0x1ff, 9);
                    }
                    _ if bit_range(dod, 12) => {
                        self.stream.write_bits(0b1110, 4);
                        self.stream.write_bits(dod as u64 & 0xfff, 12);
                    }
                    _ => {
                        self.stream.write_bits(0b1111, 4);
                        self.stream.write_bits(dod as u64 & 0xffff_ffff, 32);
                    }
                }
                app.tdelta = tdelta;
                self.write_value(app, v);
            }
        }
        app.t = t;
        app.v_bits = v.to_bits();
        self.set_num_samples(num + 1);
    }

    fn write_value(&mut self, app: &mut XorAppender, v: f64) {
        let cur = v.to_bits();
        let xor = app.v_bits ^ cur;
        if xor == 0 {
            self.stream.write_bit(false);
            return;
        }
        self.stream.write_bit(true);

        let mut leading = xor.leading_zeros() as u8;
        let trailing = xor.trailing_zeros() as u8;
        // The leading count field is 5 bits wide.
        if leading >= 32 {
            leading = 31;
        }

        if app.leading != XorAppender::LEADING_UNSET
            && leading >= app.leading
            && trailing >= app.trailing
        {
            self.stream.write_bit(false);
            let sigbits = 64 - app.leading as usize - app.trailing as usize;
            self.stream.write_bits(xor >> app.trailing, sigbits);
        } else {
            app.leading = leading;
            app.trailing = trailing;
            self.stream.write_bit(true);
            self.stream.write_bits(leading as u64, 5);
            let sigbits = 64 - leading as usize - trailing as usize;
            // sigbits is never 0 here (xor != 0); 64 wraps to 0 in 6 bits.
            self.stream.write_bits((sigbits & 0x3f) as u64, 6);
            self.stream.write_bits(xor >> trailing, sigbits);
        }
    }

    /// An O(1)-per-sample cursor over the chunk's samples.
    pub fn iterator(&self) -> XorIterator<'_> {
        let mut reader = BitReader::new(self.stream.as_bits());
        reader.skip(HEADER_BITS);
        XorIterator {
            reader,
            total: self.num_samples(),
            read: 0,
            t: 0,
            v_bits: 0,
            tdelta: 0,
            leading: 0,
            trailing: 0,
            failed: false,
        }
    }
}

/// `-(2^(n-1) - 1) <= x <= 2^(n-1)`: the signed range an `n`-bit
/// delta-of-delta bucket can carry.
fn bit_range(x: i64, nbits: u8) -> bool {
    -((1i64 << (nbits - 1)) - 1) <= x && x <= 1i64 << (nbits - 1)
}

/// Appender state for the chunk currently being written.
///
/// Kept outside the chunk so the owning series can persist it across
/// appends; create a fresh one whenever a new chunk is cut.
#[derive(Debug, Clone)]
pub struct XorAppender {
    pub t: i64,
    pub v_bits: u64,
    pub tdelta: u64,
    leading: u8,
    trailing: u8,
}

impl XorAppender {
    const LEADING_UNSET: u8 = 0xff;

    pub fn new() -> Self {
        Self {
            t: 0,
            v_bits: 0,
            tdelta: 0,
            leading: Self::LEADING_UNSET,
            trailing: 0,
        }
    }
}

impl Default for XorAppender {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoding cursor yielding `(t, v)` pairs.
///
/// Truncated or malformed streams surface as a single `Err` item; iteration
/// stops afterwards.
pub struct XorIterator<'a> {
    reader: BitReader<'a>,
    total: u16,
    read: u16,
    t: i64,
    v_bits: u64,
    tdelta: u64,
    leading: u8,
    trailing: u8,
    failed: bool,
}

impl<'a> XorIterator<'a> {
    pub fn num_samples(&self) -> u16 {
        self.total
    }

    fn next_sample(&mut self) -> Result<Sample> {
        if self.read == 0 {
            self.t = self.reader.read_varint()?;
            self.v_bits = self.reader.read_bits(64)?;
        } else if self.read == 1 {
            self.tdelta = self.reader.read_uvarint()?;
            self.t += self.tdelta as i64;
            self.read_value()?;
        } else {
            let mut size = 0u8;
            // Count leading ones of the bucket prefix, at most four.
            for _ in 0..4 {
                if !self.reader.read_bit()? {
                    break;
                }
                size += 1;
            }
            let dod = match size {
                0 => 0,
                1 => sign_extend(self.reader.read_bits(7)?, 7),
                2 => sign_extend(self.reader.read_bits(9)?, 9),
                3 => sign_extend(self.reader.read_bits(12)?, 12),
                _ => sign_extend(self.reader.read_bits(32)?, 32),
            };
            self.tdelta = self.tdelta.wrapping_add(dod as u64);
            self.t += self.tdelta as i64;
            self.read_value()?;
        }
        self.read += 1;
        Ok(Sample::new(self.t, f64::from_bits(self.v_bits)))
    }

    fn read_value(&mut self) -> Result<()> {
        if !self.reader.read_bit()? {
            // Value unchanged.
            return Ok(());
        }
        if self.reader.read_bit()? {
            self.leading = self.reader.read_bits(5)? as u8;
            let mut sigbits = self.reader.read_bits(6)? as u8;
            if sigbits == 0 {
                sigbits = 64;
            }
            if self.leading as usize + sigbits as usize > 64 {
                return Err(CodecError::Invalid("bad xor window"));
            }
            self.trailing = 64 - self.leading - sigbits;
        }
        let sigbits = 64 - self.leading as usize - self.trailing as usize;
        let bits = self.reader.read_bits(sigbits)?;
        self.v_bits ^= bits << self.trailing;
        Ok(())
    }
}

/// Interpret the low `nbits` of `v` as a signed bucket value: raw values
/// above `2^(nbits-1)` wrap to the negative range.
fn sign_extend(v: u64, nbits: u8) -> i64 {
    if v > 1 << (nbits - 1) {
        v as i64 - (1i64 << nbits)
    } else {
        v as i64
    }
}

impl<'a> Iterator for XorIterator<'a> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.read >= self.total {
            return None;
        }
        match self.next_sample() {
            Ok(s) => Some(Ok(s)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn roundtrip(samples: &[Sample]) {
        let mut chunk = XorChunk::new();
        let mut app = XorAppender::new();
        for s in samples {
            chunk.append(&mut app, s.t, s.v);
        }
        assert_eq!(chunk.num_samples() as usize, samples.len());
        let decoded: Vec<Sample> = chunk
            .iterator()
            .map(|r| r.expect("decode"))
            .collect();
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in decoded.iter().zip(samples) {
            assert_eq!(a.t, b.t);
            assert_eq!(a.v.to_bits(), b.v.to_bits());
        }
    }

    #[test]
    fn empty_chunk() {
        let chunk = XorChunk::new();
        assert_eq!(chunk.num_samples(), 0);
        assert!(chunk.iterator().next().is_none());
        assert_eq!(chunk.bytes().len(), 2);
    }

    #[test]
    fn single_sample() {
        roundtrip(&[Sample::new(1234567890, 42.5)]);
    }

    #[test]
    fn regular_steps() {
        let samples: Vec<Sample> = (0..120)
            .map(|i| Sample::new(1_600_000_000_000 + i * 1000, i as f64 / 2.0))
            .collect();
        roundtrip(&samples);
    }

    #[test]
    fn negative_start_and_jittered_deltas() {
        let mut t = -5_000i64;
        let mut samples = Vec::new();
        for i in 0..200 {
            t += 900 + (i % 7) * 37;
            samples.push(Sample::new(t, (i as f64).sin() * 1e6));
        }
        roundtrip(&samples);
    }

    #[test]
    fn constant_values() {
        let samples: Vec<Sample> =
            (0..50).map(|i| Sample::new(i * 15_000, 3.25)).collect();
        roundtrip(&samples);
    }

    #[test]
    fn random_walk() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut t = 0i64;
        let mut v = 100.0f64;
        let mut samples = Vec::new();
        for _ in 0..1000 {
            t += rng.gen_range(1..100_000);
            v += rng.gen_range(-1.0..1.0);
            samples.push(Sample::new(t, v));
        }
        roundtrip(&samples);
    }

    #[test]
    fn special_values() {
        roundtrip(&[
            Sample::new(0, 0.0),
            Sample::new(10, f64::INFINITY),
            Sample::new(20, f64::NEG_INFINITY),
            Sample::new(30, f64::MIN_POSITIVE),
            Sample::new(40, -0.0),
        ]);
    }

    #[test]
    fn bytes_reopen_roundtrip() {
        let mut chunk = XorChunk::new();
        let mut app = XorAppender::new();
        for i in 0..77 {
            chunk.append(&mut app, i * 30_000, i as f64 * 1.5);
        }
        let reopened = XorChunk::from_bytes(chunk.bytes().to_vec()).unwrap();
        assert_eq!(reopened.num_samples(), 77);
        let decoded: Vec<Sample> =
            reopened.iterator().map(|r| r.unwrap()).collect();
        assert_eq!(decoded.len(), 77);
        assert_eq!(decoded[76].t, 76 * 30_000);
    }

    #[test]
    fn truncated_stream_reports_error() {
        let mut chunk = XorChunk::new();
        let mut app = XorAppender::new();
        for i in 0..10 {
            chunk.append(&mut app, i * 1000, i as f64);
        }
        let mut bytes = chunk.bytes().to_vec();
        bytes.truncate(4); // keep the header, cut the stream short
        let truncated = XorChunk::from_bytes(bytes).unwrap();
        let results: Vec<_> = truncated.iterator().collect();
        assert!(results.last().unwrap().is_err());
    }

    #[test]
    fn decodable_mid_append() {
        let mut chunk = XorChunk::new();
        let mut app = XorAppender::new();
        for i in 0..60 {
            chunk.append(&mut app, i * 1000, i as f64);
            // The buffer must stay decodable after every append.
            let n = chunk
                .iterator()
                .map(|r| r.expect("decode mid-append"))
                .count();
            assert_eq!(n, i as usize + 1);
        }
    }
}
