//! Block index files: the per-block mapping `tsid -> chunk metas`.
//!
//! ```text
//! magic u32 | version u8
//! <series entries, 16-byte aligned>
//!   len uvarint
//!     chunk_count uvarint
//!     first:  min_t varint | (max_t - min_t) uvarint | ref uvarint
//!     next:   (min_t - prev.max_t) uvarint | (max_t - min_t) uvarint
//!             | (ref - prev.ref) varint
//!   crc32 u32
//! <offset table>
//!   len u32 | entry_count u32 | repeat: tsid | entry_offset/16 uvarint
//!   | crc32 u32
//! <TOC, last 20 bytes>
//!   series_offset u64 | offset_table_offset u64 | crc32 u32
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chronos_core::encoding::{self, decode_uvarint, Decbuf, Encbuf};
use chronos_core::Tsid;

use crate::chunks::ChunkMeta;
use crate::mmap::MmapSlice;
use crate::{Error, Result};

pub const INDEX_FILE: &str = "index";

const MAGIC_INDEX: u32 = 0xbaaa_d700;
const INDEX_FORMAT_V1: u8 = 1;
const SERIES_ALIGNMENT: u64 = 16;
const TOC_SIZE: usize = 20;

/// Writes an index file. Series must be added before [`IndexWriter::close`]
/// emits the offset table and TOC.
pub struct IndexWriter {
    path: PathBuf,
    file: BufWriter<File>,
    pos: u64,
    series_offset: u64,
    /// Aligned entry offsets divided by 16, keyed by series.
    series: HashMap<Tsid, u64>,
    buf1: Encbuf,
    buf2: Encbuf,
    done: bool,
}

impl IndexWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let mut writer = Self {
            file: BufWriter::new(File::create(&path)?),
            path,
            pos: 0,
            series_offset: 0,
            series: HashMap::new(),
            buf1: Encbuf::new(),
            buf2: Encbuf::new(),
            done: false,
        };
        writer.buf1.reset();
        writer.buf1.put_u32_be(MAGIC_INDEX);
        writer.buf1.put_byte(INDEX_FORMAT_V1);
        writer.flush_buf1()?;
        writer.series_offset = writer.pos;
        Ok(writer)
    }

    fn flush_buf1(&mut self) -> Result<()> {
        self.file.write_all(self.buf1.as_slice())?;
        self.pos += self.buf1.len() as u64;
        self.buf1.reset();
        Ok(())
    }

    fn add_padding(&mut self, alignment: u64) -> Result<()> {
        let rem = self.pos % alignment;
        if rem != 0 {
            let pad = vec![0u8; (alignment - rem) as usize];
            self.file.write_all(&pad)?;
            self.pos += pad.len() as u64;
        }
        Ok(())
    }

    /// Add the chunk meta list of one series. `chunks` must be sorted by
    /// `min_time`.
    pub fn add_series(&mut self, tsid: Tsid, chunks: &[ChunkMeta]) -> Result<()> {
        if self.done {
            return Err(Error::InvalidOptions(
                "index writer already closed".into(),
            ));
        }
        if self.series.contains_key(&tsid) {
            return Err(Error::InvalidOptions(format!(
                "series {tsid} already added"
            )));
        }

        self.add_padding(SERIES_ALIGNMENT)?;
        self.series.insert(tsid, self.pos / SERIES_ALIGNMENT);

        self.buf2.reset();
        self.buf2.put_uvarint(chunks.len() as u64);
        if let Some(first) = chunks.first() {
            self.buf2.put_varint(first.min_time);
            self.buf2
                .put_uvarint((first.max_time - first.min_time) as u64);
            self.buf2.put_uvarint(first.ref_id);

            let mut last_t = first.max_time;
            let mut last_ref = first.ref_id as i64;
            for meta in &chunks[1..] {
                self.buf2.put_uvarint((meta.min_time - last_t) as u64);
                self.buf2
                    .put_uvarint((meta.max_time - meta.min_time) as u64);
                self.buf2.put_varint(meta.ref_id as i64 - last_ref);
                last_t = meta.max_time;
                last_ref = meta.ref_id as i64;
            }
        }

        self.buf1.reset();
        self.buf1.put_uvarint(self.buf2.len() as u64);
        self.buf2.put_crc32();
        self.flush_buf1()?;
        self.file.write_all(self.buf2.as_slice())?;
        self.pos += self.buf2.len() as u64;
        Ok(())
    }

    fn write_offset_table(&mut self) -> Result<()> {
        self.buf2.reset();
        self.buf2.put_u32_be(self.series.len() as u32);
        let mut entries: Vec<(&Tsid, &u64)> = self.series.iter().collect();
        entries.sort_by_key(|(tsid, _)| **tsid);
        for (tsid, offset) in entries {
            self.buf2.put_tsid(tsid);
            self.buf2.put_uvarint(*offset);
        }

        self.buf1.reset();
        self.buf1.put_u32_be(self.buf2.len() as u32);
        self.buf2.put_crc32();
        self.flush_buf1()?;
        self.file.write_all(self.buf2.as_slice())?;
        self.pos += self.buf2.len() as u64;
        Ok(())
    }

    /// Emit the offset table and TOC, then sync the file.
    pub fn close(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        let offset_table = self.pos;
        self.write_offset_table()?;

        self.buf1.reset();
        self.buf1.put_u64_be(self.series_offset);
        self.buf1.put_u64_be(offset_table);
        self.buf1.put_crc32();
        self.flush_buf1()?;

        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Memory-mapped index reader.
pub struct IndexReader {
    map: MmapSlice,
    offsets: HashMap<Tsid, u64>,
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self> {
        let map = MmapSlice::open(path)?;
        if map.len() < 5 + TOC_SIZE {
            return Err(Error::InvalidMagic("index"));
        }
        if encoding::get_u32_be(map.range(0, 4)?)? != MAGIC_INDEX {
            return Err(Error::InvalidMagic("index"));
        }
        if map.range(4, 5)?[0] != INDEX_FORMAT_V1 {
            return Err(Error::InvalidVersion("index"));
        }

        // TOC: the last 20 bytes, CRC over the first 16.
        let toc = map.range(map.len() - TOC_SIZE, map.len())?;
        let crc = u32::from_be_bytes(toc[16..].try_into().unwrap());
        if crc32c::crc32c(&toc[..16]) != crc {
            return Err(Error::ChecksumMismatch("index TOC"));
        }
        let offset_table = u64::from_be_bytes(toc[8..16].try_into().unwrap());

        let offsets = Self::read_offset_table(&map, offset_table)?;
        Ok(Self { map, offsets })
    }

    fn read_offset_table(
        map: &MmapSlice,
        offset: u64,
    ) -> Result<HashMap<Tsid, u64>> {
        let offset = offset as usize;
        let len =
            encoding::get_u32_be(map.range(offset, offset + 4)?)? as usize;
        let body = map.range(offset + 4, offset + 4 + len)?;
        let crc_bytes = map.range(offset + 4 + len, offset + 8 + len)?;
        if crc32c::crc32c(body) != u32::from_be_bytes(crc_bytes.try_into().unwrap())
        {
            return Err(Error::ChecksumMismatch("index offset table"));
        }

        let mut dec = Decbuf::new(body);
        let entries = dec.get_u32_be();
        let mut offsets = HashMap::with_capacity(entries as usize);
        for _ in 0..entries {
            let tsid = dec.get_tsid();
            let entry_offset = dec.get_uvarint();
            offsets.insert(tsid, entry_offset);
        }
        dec.finish().map_err(Error::from)?;
        Ok(offsets)
    }

    /// Number of series in the block.
    pub fn num_series(&self) -> usize {
        self.offsets.len()
    }

    /// All series identifiers in the block, sorted.
    pub fn tsids(&self) -> Vec<Tsid> {
        let mut tsids: Vec<Tsid> = self.offsets.keys().copied().collect();
        tsids.sort();
        tsids
    }

    pub fn contains(&self, tsid: &Tsid) -> bool {
        self.offsets.contains_key(tsid)
    }

    /// Decode the chunk meta list of `tsid`, without chunk data. Returns
    /// `None` when the block does not contain the series.
    pub fn series(&self, tsid: &Tsid) -> Result<Option<Vec<ChunkMeta>>> {
        let Some(&entry) = self.offsets.get(tsid) else {
            return Ok(None);
        };
        let start = (entry * SERIES_ALIGNMENT) as usize;

        let head = self.map.range(
            start,
            (start + encoding::MAX_VARINT_LEN_64).min(self.map.len()),
        )?;
        let (len, varint_len) = decode_uvarint(head)?;
        let body_start = start + varint_len;
        let body = self.map.range(body_start, body_start + len as usize)?;
        let crc_bytes = self
            .map
            .range(body_start + len as usize, body_start + len as usize + 4)?;
        if crc32c::crc32c(body) != u32::from_be_bytes(crc_bytes.try_into().unwrap())
        {
            return Err(Error::ChecksumMismatch("index series entry"));
        }

        let mut dec = Decbuf::new(body);
        let count = dec.get_uvarint();
        let mut chunks = Vec::with_capacity(count as usize);
        if count > 0 {
            let mut min_time = dec.get_varint();
            let mut span = dec.get_uvarint() as i64;
            let mut ref_id = dec.get_uvarint() as i64;
            chunks.push(ChunkMeta {
                ref_id: ref_id as u64,
                min_time,
                max_time: min_time + span,
                chunk: None,
            });
            for _ in 1..count {
                min_time += span + dec.get_uvarint() as i64;
                span = dec.get_uvarint() as i64;
                ref_id += dec.get_varint();
                chunks.push(ChunkMeta {
                    ref_id: ref_id as u64,
                    min_time,
                    max_time: min_time + span,
                    chunk: None,
                });
            }
        }
        dec.finish().map_err(Error::from)?;
        Ok(Some(chunks))
    }

    /// Total index size in bytes.
    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ref_id: u64, mint: i64, maxt: i64) -> ChunkMeta {
        ChunkMeta {
            ref_id,
            min_time: mint,
            max_time: maxt,
            chunk: None,
        }
    }

    #[test]
    fn roundtrip_many_series() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILE);

        let mut expected = Vec::new();
        {
            let mut writer = IndexWriter::create(&path).unwrap();
            for i in 0u8..50 {
                let tsid = Tsid::from_bytes([i; 16]);
                let chunks: Vec<ChunkMeta> = (0..4)
                    .map(|c| {
                        meta(
                            (1u64 << 32) | (i as u64 * 1000 + c * 100),
                            c as i64 * 10_000,
                            c as i64 * 10_000 + 9_999,
                        )
                    })
                    .collect();
                writer.add_series(tsid, &chunks).unwrap();
                expected.push((tsid, chunks));
            }
            writer.close().unwrap();
        }

        let reader = IndexReader::open(&path).unwrap();
        assert_eq!(reader.num_series(), 50);
        for (tsid, chunks) in &expected {
            let read = reader.series(tsid).unwrap().unwrap();
            assert_eq!(read.len(), chunks.len());
            for (a, b) in read.iter().zip(chunks) {
                assert_eq!(a.ref_id, b.ref_id);
                assert_eq!(a.min_time, b.min_time);
                assert_eq!(a.max_time, b.max_time);
            }
        }
        assert!(reader
            .series(&Tsid::from_bytes([0xee; 16]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn negative_and_delta_refs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let tsid = Tsid::from_bytes([7; 16]);
        // Decreasing refs exercise the signed ref delta.
        let chunks = vec![
            meta(5_000, -10_000, -5_000),
            meta(2_000, -4_999, 0),
            meta(9_000, 1, 100),
        ];
        {
            let mut writer = IndexWriter::create(&path).unwrap();
            writer.add_series(tsid, &chunks).unwrap();
            writer.close().unwrap();
        }
        let reader = IndexReader::open(&path).unwrap();
        let read = reader.series(&tsid).unwrap().unwrap();
        for (a, b) in read.iter().zip(&chunks) {
            assert_eq!((a.ref_id, a.min_time, a.max_time), (b.ref_id, b.min_time, b.max_time));
        }
    }

    #[test]
    fn empty_series_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let tsid = Tsid::from_bytes([1; 16]);
        {
            let mut writer = IndexWriter::create(&path).unwrap();
            writer.add_series(tsid, &[]).unwrap();
            writer.close().unwrap();
        }
        let reader = IndexReader::open(&path).unwrap();
        assert_eq!(reader.series(&tsid).unwrap().unwrap().len(), 0);
    }

    #[test]
    fn duplicate_series_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let tsid = Tsid::from_bytes([1; 16]);
        let mut writer = IndexWriter::create(&path).unwrap();
        writer.add_series(tsid, &[]).unwrap();
        assert!(writer.add_series(tsid, &[]).is_err());
    }

    #[test]
    fn sorted_tsid_enumeration() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILE);
        {
            let mut writer = IndexWriter::create(&path).unwrap();
            for b in [9u8, 3, 7, 1] {
                writer.add_series(Tsid::from_bytes([b; 16]), &[]).unwrap();
            }
            writer.close().unwrap();
        }
        let reader = IndexReader::open(&path).unwrap();
        let tsids = reader.tsids();
        let mut sorted = tsids.clone();
        sorted.sort();
        assert_eq!(tsids, sorted);
    }
}
