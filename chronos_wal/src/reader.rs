//! Streaming record reader over a run of WAL segments.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::{
    list_segments, Result, WalError, FRAGMENT_HEADER_SIZE, FRAG_FIRST, FRAG_FULL,
    FRAG_LAST, FRAG_MIDDLE, FRAG_PADDING, PAGE_SIZE,
};

/// Reads logical records across one or more segments in sequence order.
///
/// CRC or framing failures surface as [`WalError::Corruption`] carrying the
/// segment and the byte offset of the record's first fragment, which the
/// caller hands to [`crate::Wal::repair`].
pub struct SegmentReader {
    segments: Vec<(u64, PathBuf)>,
    next_idx: usize,
    file: Option<BufReader<File>>,
    seq: u64,
    page: Vec<u8>,
    page_len: usize,
    page_off: usize,
    /// Offset of the current page within the segment.
    page_base: u64,
    partial: Vec<u8>,
    in_record: bool,
    rec_start: u64,
}

impl SegmentReader {
    /// Read every segment in `dir`.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        Self::over(list_segments(dir)?)
    }

    /// Read the segments of `dir` whose sequence number is at least `from`.
    pub fn open_from(dir: &Path, from: u64) -> Result<Self> {
        let segments = list_segments(dir)?
            .into_iter()
            .filter(|(seq, _)| *seq >= from)
            .collect();
        Self::over(segments)
    }

    /// Read an explicit list of `(sequence, path)` pairs in order.
    pub fn over(segments: Vec<(u64, PathBuf)>) -> Result<Self> {
        Ok(Self {
            segments,
            next_idx: 0,
            file: None,
            seq: 0,
            page: vec![0; PAGE_SIZE],
            page_len: 0,
            page_off: 0,
            page_base: 0,
            partial: Vec::new(),
            in_record: false,
            rec_start: 0,
        })
    }

    /// Sequence number of the segment currently being read.
    pub fn segment(&self) -> u64 {
        self.seq
    }

    /// Byte offset of the most recent record's first fragment, the point a
    /// repair would truncate to.
    pub fn last_offset(&self) -> u64 {
        self.rec_start
    }

    fn corruption(&self, cause: impl Into<String>) -> WalError {
        WalError::Corruption {
            segment: self.seq,
            offset: self.rec_start,
            cause: cause.into(),
        }
    }

    /// Advance to the next segment. Returns false when all are exhausted.
    fn next_segment(&mut self) -> Result<bool> {
        if self.in_record {
            return Err(self.corruption("record truncated at segment end"));
        }
        let Some((seq, path)) = self.segments.get(self.next_idx) else {
            return Ok(false);
        };
        self.next_idx += 1;
        self.seq = *seq;
        self.file = Some(BufReader::new(File::open(path)?));
        self.page_len = 0;
        self.page_off = 0;
        self.page_base = 0;
        Ok(true)
    }

    /// Load the next page of the current segment. Returns false at EOF.
    fn next_page(&mut self) -> Result<bool> {
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        self.page_base += self.page_len as u64;
        self.page_len = 0;
        self.page_off = 0;
        while self.page_len < PAGE_SIZE {
            let n = file.read(&mut self.page[self.page_len..])?;
            if n == 0 {
                break;
            }
            self.page_len += n;
        }
        if self.page_len == 0 {
            self.file = None;
            return Ok(false);
        }
        Ok(true)
    }

    /// The next logical record, or `None` when all segments are exhausted.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            // Need more page data?
            if self.page_off >= self.page_len {
                if self.next_page()? {
                    continue;
                }
                // Current segment exhausted.
                if self.in_record {
                    return Err(self.corruption("record truncated at segment end"));
                }
                if self.next_segment()? {
                    continue;
                }
                return Ok(None);
            }

            let rem = self.page_len - self.page_off;
            if rem < FRAGMENT_HEADER_SIZE {
                if self.page_len < PAGE_SIZE && self.in_record {
                    // Torn tail page.
                    return Err(self.corruption("fragment header truncated"));
                }
                self.page_off = self.page_len;
                continue;
            }

            let typ = self.page[self.page_off];
            if typ == FRAG_PADDING {
                // Rest of the page is padding.
                self.page_off = self.page_len;
                continue;
            }

            let frag_off = self.page_base + self.page_off as u64;
            let len = u16::from_be_bytes(
                self.page[self.page_off + 1..self.page_off + 3]
                    .try_into()
                    .unwrap(),
            ) as usize;
            let crc = u32::from_be_bytes(
                self.page[self.page_off + 3..self.page_off + 7]
                    .try_into()
                    .unwrap(),
            );
            if !self.in_record {
                self.rec_start = frag_off;
            }

            if self.page_off + FRAGMENT_HEADER_SIZE + len > self.page_len {
                return Err(self.corruption("fragment crosses page boundary"));
            }
            let payload_start = self.page_off + FRAGMENT_HEADER_SIZE;
            let payload = &self.page[payload_start..payload_start + len];
            if crc32c::crc32c(payload) != crc {
                return Err(self.corruption("fragment checksum mismatch"));
            }

            match typ {
                FRAG_FULL => {
                    if self.in_record {
                        return Err(self.corruption("unexpected full fragment"));
                    }
                    let rec = payload.to_vec();
                    self.page_off = payload_start + len;
                    return Ok(Some(rec));
                }
                FRAG_FIRST => {
                    if self.in_record {
                        return Err(self.corruption("unexpected first fragment"));
                    }
                    self.partial.clear();
                    self.partial.extend_from_slice(payload);
                    self.in_record = true;
                }
                FRAG_MIDDLE => {
                    if !self.in_record {
                        return Err(self.corruption("orphaned middle fragment"));
                    }
                    self.partial.extend_from_slice(payload);
                }
                FRAG_LAST => {
                    if !self.in_record {
                        return Err(self.corruption("orphaned last fragment"));
                    }
                    self.partial.extend_from_slice(payload);
                    self.in_record = false;
                    self.page_off = payload_start + len;
                    return Ok(Some(std::mem::take(&mut self.partial)));
                }
                _ => {
                    return Err(self.corruption(format!(
                        "invalid fragment type {typ}"
                    )));
                }
            }
            self.page_off = payload_start + len;
        }
    }
}
