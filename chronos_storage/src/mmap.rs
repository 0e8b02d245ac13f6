//! Read-only memory-mapped files as bounded byte ranges.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::{Error, Result};

/// A file mapped read-only for its entire lifetime.
pub struct MmapSlice {
    map: Mmap,
}

impl MmapSlice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the engine never writes to
        // files it has handed to a reader.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// The bytes in `[start, end)`, or [`Error::NotFound`] mapped to an
    /// out-of-range error when the range leaves the file.
    pub fn range(&self, start: usize, end: usize) -> Result<&[u8]> {
        if start > end || end > self.map.len() {
            return Err(Error::Codec(chronos_core::CodecError::Eof));
        }
        Ok(&self.map[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn map_and_slice() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"hello mapped world").unwrap();
        drop(f);

        let m = MmapSlice::open(&path).unwrap();
        assert_eq!(m.len(), 18);
        assert_eq!(m.range(6, 12).unwrap(), b"mapped");
        assert!(m.range(10, 100).is_err());
        assert!(m.range(12, 6).is_err());
    }
}
