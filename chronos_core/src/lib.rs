//! ChronosDB core types and codecs.
//!
//! This crate holds the pieces every other layer builds on: the 16-byte
//! series identifier, plain sample/interval types, byte-exact varint and
//! big-endian codecs, a Gorilla-style bit stream, and the XOR chunk
//! implementation that compresses `(i64, f64)` sample pairs.

pub mod bitstream;
pub mod chunk;
pub mod encoding;
pub mod tsid;

pub use chunk::{XorAppender, XorChunk, XorIterator};
pub use tsid::Tsid;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors produced while encoding or decoding byte/bit streams.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The input ended before a complete value could be decoded.
    #[error("unexpected end of input")]
    Eof,
    /// A checksum embedded in the stream did not match the payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// The stream is structurally invalid.
    #[error("invalid encoding: {0}")]
    Invalid(&'static str),
}

/// A single timestamped value. Timestamps are milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub t: i64,
    pub v: f64,
}

impl Sample {
    pub fn new(t: i64, v: f64) -> Self {
        Self { t, v }
    }
}

/// A closed time interval `[mint, maxt]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub mint: i64,
    pub maxt: i64,
}

impl Interval {
    pub fn new(mint: i64, maxt: i64) -> Self {
        Self { mint, maxt }
    }

    /// Whether `t` falls inside the interval.
    pub fn contains(&self, t: i64) -> bool {
        self.mint <= t && t <= self.maxt
    }

    /// Whether the interval intersects `[mint, maxt]`.
    pub fn overlaps(&self, mint: i64, maxt: i64) -> bool {
        self.mint <= maxt && mint <= self.maxt
    }
}
