//! Segmented write-ahead log with CRC-framed records.
//!
//! The log is a directory of segment files named by zero-padded sequence
//! numbers. Segments are written in 32 KiB pages; each page holds a run of
//! record fragments followed by zero padding. A fragment carries a one-byte
//! type (full/first/middle/last), a big-endian `u16` length and a CRC32
//! over its payload. Logical records may span pages but never segments.

pub mod checkpoint;
pub mod record;
pub mod reader;

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub use checkpoint::{checkpoint, delete_checkpoints, last_checkpoint, CheckpointStats};
pub use reader::SegmentReader;

/// Size of a WAL page.
pub const PAGE_SIZE: usize = 32 * 1024;
/// Bytes of fragment framing: type, length, CRC32.
pub const FRAGMENT_HEADER_SIZE: usize = 7;
/// Default size at which a new segment is started.
pub const DEFAULT_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;

const FRAG_PADDING: u8 = 0;
const FRAG_FULL: u8 = 1;
const FRAG_FIRST: u8 = 2;
const FRAG_MIDDLE: u8 = 3;
const FRAG_LAST: u8 = 4;

/// Result alias for WAL operations.
pub type Result<T> = std::result::Result<T, WalError>;

/// Errors raised by the write-ahead log.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A CRC or framing failure while reading records. Callers turn this
    /// into a [`Wal::repair`] invocation.
    #[error("corruption in segment {segment} at offset {offset}: {cause}")]
    Corruption {
        segment: u64,
        offset: u64,
        cause: String,
    },
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
    #[error(transparent)]
    Codec(#[from] chronos_core::CodecError),
    #[error("not found")]
    NotFound,
}

/// Format a segment sequence number as a file name.
pub fn segment_name(seq: u64) -> String {
    format!("{:08}", seq)
}

/// All numeric segment files in `dir`, sorted by sequence number.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(seq) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// The first and last segment sequence numbers in `dir`, if any.
pub fn segments(dir: &Path) -> Result<Option<(u64, u64)>> {
    let segs = list_segments(dir)?;
    Ok(match (segs.first(), segs.last()) {
        (Some((first, _)), Some((last, _))) => Some((*first, *last)),
        _ => None,
    })
}

/// Append-side handle of the write-ahead log.
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    file: BufWriter<File>,
    seq: u64,
    /// Bytes written to the current segment.
    pos: u64,
}

impl Wal {
    /// Open the log in `dir`, continuing the highest existing segment or
    /// starting segment 1. `segment_size` of zero selects the default.
    pub fn open(dir: impl Into<PathBuf>, segment_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let segment_size = if segment_size == 0 {
            DEFAULT_SEGMENT_SIZE
        } else {
            segment_size
        };

        let (seq, file, pos) = match list_segments(&dir)?.last() {
            Some((seq, path)) => {
                let mut file = OpenOptions::new().read(true).write(true).open(path)?;
                let pos = file.seek(SeekFrom::End(0))?;
                (*seq, file, pos)
            }
            None => {
                let path = dir.join(segment_name(1));
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(path)?;
                (1, file, 0)
            }
        };

        Ok(Self {
            dir,
            segment_size,
            file: BufWriter::new(file),
            seq,
            pos,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Sequence number of the segment currently being written.
    pub fn current_segment(&self) -> u64 {
        self.seq
    }

    /// Append one logical record. The write has reached the OS when this
    /// returns; fragments never cross a page boundary.
    pub fn log(&mut self, rec: &[u8]) -> Result<()> {
        if self.pos >= self.segment_size {
            self.cut()?;
        }

        let mut remaining = rec;
        let mut first = true;
        loop {
            let page_rem = PAGE_SIZE - (self.pos as usize % PAGE_SIZE);
            if page_rem <= FRAGMENT_HEADER_SIZE {
                // Not enough room for a fragment; zero-pad to the page end.
                self.write_all(&vec![0u8; page_rem])?;
                continue;
            }
            let frag_len = remaining.len().min(page_rem - FRAGMENT_HEADER_SIZE);
            let (frag, rest) = remaining.split_at(frag_len);

            let typ = match (first, rest.is_empty()) {
                (true, true) => FRAG_FULL,
                (true, false) => FRAG_FIRST,
                (false, true) => FRAG_LAST,
                (false, false) => FRAG_MIDDLE,
            };
            let mut header = [0u8; FRAGMENT_HEADER_SIZE];
            header[0] = typ;
            header[1..3].copy_from_slice(&(frag_len as u16).to_be_bytes());
            header[3..7].copy_from_slice(&crc32c::crc32c(frag).to_be_bytes());
            self.write_all(&header)?;
            self.write_all(frag)?;

            remaining = rest;
            first = false;
            if remaining.is_empty() {
                break;
            }
        }
        self.file.flush()?;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    /// Sync the current segment down to the device.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Finish the current segment and start the next one.
    fn cut(&mut self) -> Result<()> {
        self.sync()?;
        self.seq += 1;
        let path = self.dir.join(segment_name(self.seq));
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        self.file = BufWriter::new(file);
        self.pos = 0;
        Ok(())
    }

    /// Unlink all segments with a sequence number below `up_to`.
    pub fn truncate(&mut self, up_to: u64) -> Result<()> {
        for (seq, path) in list_segments(&self.dir)? {
            if seq >= up_to || seq == self.seq {
                continue;
            }
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Recover from a read-side corruption report: segments after the
    /// offending one are unreachable and unlinked, the offending segment is
    /// truncated at the corruption offset, and the writer resumes there on
    /// a fresh page.
    pub fn repair(&mut self, segment: u64, offset: u64) -> Result<()> {
        warn!(segment, offset, "repairing corrupted WAL segment");
        self.file.flush()?;

        for (seq, path) in list_segments(&self.dir)? {
            if seq > segment {
                fs::remove_file(path)?;
            }
        }

        let path = self.dir.join(segment_name(segment));
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(offset)?;
        file.seek(SeekFrom::End(0))?;
        file.sync_data()?;

        self.seq = segment;
        self.file = BufWriter::new(file);
        self.pos = offset;

        // Zero-fill the torn page so readers skip straight to the next one.
        let page_rem = PAGE_SIZE - (self.pos as usize % PAGE_SIZE);
        if page_rem < PAGE_SIZE {
            self.write_all(&vec![0u8; page_rem])?;
        }
        self.sync()?;
        info!(segment, "WAL repair complete");
        Ok(())
    }

    /// Flush and sync the tail segment.
    pub fn close(&mut self) -> Result<()> {
        self.sync()
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}
