//! ChronosDB storage engine.
//!
//! A log-structured store for monotonically timestamped samples addressed
//! by a 16-byte series identifier. Fresh writes land in an in-memory head
//! backed by the write-ahead log; a background loop periodically persists
//! head windows as immutable on-disk blocks, merges neighbouring blocks,
//! enforces retention and rewrites tombstoned data.

pub mod block;
pub mod chunks;
pub mod compact;
pub mod db;
pub mod head;
pub mod index;
pub mod mmap;
pub mod querier;
pub mod series;
pub mod tombstones;

use std::path::PathBuf;

pub use chronos_core::{Interval, Sample, Tsid};
pub use db::{Db, Options};
pub use head::Append;
pub use querier::Querier;

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Sample rejected by the appender: below the minimum valid time.
    #[error("out of bounds")]
    OutOfBounds,
    /// Sample with a timestamp at or before the series' newest sample.
    #[error("out of order sample")]
    OutOfOrderSample,
    /// The requested series or chunk does not exist.
    #[error("not found")]
    NotFound,
    /// Another process holds the database directory lock.
    #[error("lock file {0} held by another process")]
    LockHeldElsewhere(PathBuf),
    /// Two on-disk blocks cover intersecting time ranges.
    #[error("blocks time ranges overlap: {0}")]
    BlockOverlap(String),
    #[error("invalid magic number in {0}")]
    InvalidMagic(&'static str),
    #[error("unsupported format version in {0}")]
    InvalidVersion(&'static str),
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),
    #[error("invalid chunk ref {0:#x}")]
    InvalidChunkRef(u64),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    /// A long-running compaction was aborted at a safe point.
    #[error("compaction cancelled")]
    Cancelled,
    #[error("corrupted blocks: {0}")]
    CorruptedBlocks(String),
    /// Aggregated failures from a fanned-out operation.
    #[error("{} errors, first: {}", .0.len(), .0.first().map(|e| e.to_string()).unwrap_or_default())]
    Multi(Vec<Error>),
    #[error(transparent)]
    Wal(#[from] chronos_wal::WalError),
    #[error(transparent)]
    Codec(#[from] chronos_core::CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The exclusive upper bound of the `range`-aligned bucket containing `t`:
/// `range * (t / range + 1)`, with flooring division for negative `t`.
pub fn range_for_timestamp(t: i64, range: i64) -> i64 {
    range * (t.div_euclid(range) + 1)
}

/// Clamp `[a, b]` into `[mint, maxt]`. The result is empty when
/// `first > second`.
pub fn clamp_interval(a: i64, b: i64, mint: i64, maxt: i64) -> (i64, i64) {
    (a.max(mint), b.min(maxt))
}
