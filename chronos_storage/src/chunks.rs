//! Chunk files: sequences of encoded chunks inside a block directory.
//!
//! ```text
//! magic u32 | format u8 | padding to 8
//! repeat:
//!   len uvarint | enc u8 | bytes[len] | crc32 u32 (over enc || bytes)
//! ```
//!
//! A chunk is addressed by `(segment_seq << 32) | file_offset`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chronos_core::chunk::Encoding;
use chronos_core::encoding::{self, decode_uvarint};
use chronos_core::XorChunk;
use tracing::debug;

use crate::mmap::MmapSlice;
use crate::{Error, Result};

pub const MAGIC_CHUNKS: u32 = 0xaec7_33c4;
pub const CHUNKS_FORMAT_V1: u8 = 1;
const HEADER_SIZE: u64 = 8;

/// Size at which the writer starts a new chunk segment file.
pub const DEFAULT_CHUNK_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

/// Location and time bounds of one chunk, optionally carrying its data.
#[derive(Debug, Clone, Default)]
pub struct ChunkMeta {
    /// `(segment_seq << 32) | offset` on disk; a per-series counter in the
    /// head.
    pub ref_id: u64,
    pub min_time: i64,
    pub max_time: i64,
    /// Populated when the chunk bytes travel with the meta (head reads,
    /// compaction, the write path). Bare metas come from the index.
    pub chunk: Option<XorChunk>,
}

impl ChunkMeta {
    pub fn overlap_closed(&self, mint: i64, maxt: i64) -> bool {
        self.min_time <= maxt && mint <= self.max_time
    }
}

/// Numeric sequence files in `dir`, sorted ascending.
pub fn sequence_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(seq) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        {
            files.push((seq, entry.path()));
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

/// Appends encoded chunks to segmented files under `dir/chunks`.
pub struct ChunkWriter {
    dir: PathBuf,
    file: Option<BufWriter<File>>,
    seq: u64,
    pos: u64,
    segment_size: u64,
}

impl ChunkWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_segment_size(dir, DEFAULT_CHUNK_SEGMENT_SIZE)
    }

    pub fn with_segment_size(
        dir: impl Into<PathBuf>,
        segment_size: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            file: None,
            seq: 0,
            pos: 0,
            segment_size,
        })
    }

    fn finalize_tail(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Sync and close the tail file, then open the next sequence file and
    /// write its header.
    fn cut(&mut self) -> Result<()> {
        self.finalize_tail()?;
        self.seq += 1;
        let path = self.dir.join(format!("{:08}", self.seq));
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        let mut file = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE as usize];
        encoding::put_u32_be(&mut header, MAGIC_CHUNKS);
        header[4] = CHUNKS_FORMAT_V1;
        file.write_all(&header)?;

        self.file = Some(file);
        self.pos = HEADER_SIZE;
        debug!(seq = self.seq, "cut new chunk segment");
        Ok(())
    }

    /// Write a batch of chunks, assigning each meta's `ref_id` before its
    /// bytes are flushed.
    pub fn write_chunks(&mut self, chunks: &mut [ChunkMeta]) -> Result<()> {
        let mut batch_len = 0u64;
        for meta in chunks.iter() {
            let chunk = meta.chunk.as_ref().ok_or(Error::NotFound)?;
            batch_len += 5
                + encoding::MAX_VARINT_LEN_32 as u64
                + chunk.size() as u64;
        }

        if self.file.is_none()
            || self.pos > self.segment_size
            || (self.pos + batch_len > self.segment_size
                && batch_len <= self.segment_size)
        {
            self.cut()?;
        }
        let sequence = self.seq << 32;

        let mut varint = Vec::with_capacity(encoding::MAX_VARINT_LEN_32);
        for meta in chunks.iter_mut() {
            let chunk = meta.chunk.as_ref().ok_or(Error::NotFound)?;
            meta.ref_id = sequence | self.pos;

            varint.clear();
            encoding::encode_uvarint(&mut varint, chunk.size() as u64);
            self.write(&varint)?;
            self.write(&[chunk.encoding() as u8])?;
            self.write(chunk.bytes())?;

            let mut crc = crc32c::crc32c(&[chunk.encoding() as u8]);
            crc = crc32c::crc32c_append(crc, chunk.bytes());
            self.write(&crc.to_be_bytes())?;
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::NotFound)?;
        file.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.finalize_tail()
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        let _ = self.finalize_tail();
    }
}

/// Memory-mapped read access to the chunk files of a block.
pub struct ChunkReader {
    maps: Vec<MmapSlice>,
    size: u64,
}

impl ChunkReader {
    /// Map every sequence file in `dir` and validate its magic.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut maps = Vec::new();
        let mut size = 0u64;
        for (seq, path) in sequence_files(dir)? {
            let map = MmapSlice::open(&path)?;
            if map.len() < HEADER_SIZE as usize
                || encoding::get_u32_be(map.range(0, 4)?)? != MAGIC_CHUNKS
            {
                return Err(Error::InvalidMagic("chunk file"));
            }
            if maps.len() + 1 != seq as usize {
                return Err(Error::InvalidChunkRef(seq << 32));
            }
            size += map.len() as u64;
            maps.push(map);
        }
        Ok(Self { maps, size })
    }

    /// Total mapped bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Resolve a chunk ref into a decoded chunk. Bytes are copied out of
    /// the mapping; chunks are small.
    pub fn chunk(&self, ref_id: u64) -> Result<XorChunk> {
        let seq = (ref_id >> 32) as usize;
        let offset = (ref_id & 0xffff_ffff) as usize;
        let map = self
            .maps
            .get(seq.wrapping_sub(1))
            .ok_or(Error::InvalidChunkRef(ref_id))?;
        if offset >= map.len() {
            return Err(Error::InvalidChunkRef(ref_id));
        }

        let tail = map.range(offset, map.len())?;
        let (len, varint_len) = decode_uvarint(tail)?;
        let len = len as usize;
        let payload_start = varint_len + 1;
        if payload_start + len > tail.len() {
            return Err(Error::InvalidChunkRef(ref_id));
        }
        let enc = Encoding::from_u8(tail[varint_len])?;
        if enc != Encoding::Xor {
            return Err(Error::InvalidChunkRef(ref_id));
        }
        let bytes = tail[payload_start..payload_start + len].to_vec();
        Ok(XorChunk::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronos_core::XorAppender;

    fn build_chunk(start: i64, n: usize) -> ChunkMeta {
        let mut chunk = XorChunk::new();
        let mut app = XorAppender::new();
        for i in 0..n as i64 {
            chunk.append(&mut app, start + i * 1000, i as f64);
        }
        ChunkMeta {
            ref_id: 0,
            min_time: start,
            max_time: start + (n as i64 - 1) * 1000,
            chunk: Some(chunk),
        }
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunks_dir = dir.path().join("chunks");
        let mut metas: Vec<ChunkMeta> =
            (0..10).map(|i| build_chunk(i * 120_000, 120)).collect();
        {
            let mut writer = ChunkWriter::new(&chunks_dir).unwrap();
            writer.write_chunks(&mut metas).unwrap();
            writer.close().unwrap();
        }
        for meta in &metas {
            assert_ne!(meta.ref_id, 0);
            assert_eq!(meta.ref_id >> 32, 1);
        }

        let reader = ChunkReader::open(&chunks_dir).unwrap();
        for (i, meta) in metas.iter().enumerate() {
            let chunk = reader.chunk(meta.ref_id).unwrap();
            assert_eq!(chunk.num_samples(), 120);
            let first = chunk.iterator().next().unwrap().unwrap();
            assert_eq!(first.t, i as i64 * 120_000);
        }
    }

    #[test]
    fn segment_rollover() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunks_dir = dir.path().join("chunks");
        let mut all = Vec::new();
        {
            // A tiny segment size forces several files.
            let mut writer =
                ChunkWriter::with_segment_size(&chunks_dir, 4096).unwrap();
            for i in 0..30 {
                let mut metas = vec![build_chunk(i * 120_000, 120)];
                writer.write_chunks(&mut metas).unwrap();
                all.extend(metas);
            }
            writer.close().unwrap();
        }
        let seqs: std::collections::BTreeSet<u64> =
            all.iter().map(|m| m.ref_id >> 32).collect();
        assert!(seqs.len() > 1, "expected multiple segments");

        let reader = ChunkReader::open(&chunks_dir).unwrap();
        for meta in &all {
            let chunk = reader.chunk(meta.ref_id).unwrap();
            assert_eq!(chunk.num_samples(), 120);
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunks_dir = dir.path().join("chunks");
        fs::create_dir_all(&chunks_dir).unwrap();
        fs::write(chunks_dir.join("00000001"), b"not a chunk file").unwrap();
        assert!(matches!(
            ChunkReader::open(&chunks_dir),
            Err(Error::InvalidMagic(_))
        ));
    }

    #[test]
    fn invalid_ref_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let chunks_dir = dir.path().join("chunks");
        let mut metas = vec![build_chunk(0, 10)];
        {
            let mut writer = ChunkWriter::new(&chunks_dir).unwrap();
            writer.write_chunks(&mut metas).unwrap();
            writer.close().unwrap();
        }
        let reader = ChunkReader::open(&chunks_dir).unwrap();
        assert!(reader.chunk(99 << 32).is_err());
        assert!(reader.chunk(1 << 32 | 0xfff_ffff).is_err());
    }
}
