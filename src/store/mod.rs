//! Storage engine facade.
//!
//! The request core treats the engine as an opaque [`Store`]; only the
//! operations consumed by the command handlers are part of the contract.
//! [`MemStore`] is the built-in engine backing tests and standalone runs.

mod memory;
mod mfile;

pub use memory::MemStore;
pub use mfile::{MFile, MmapBudget, MAX_MMAP_SIZE_MB};

use crate::item::Item;

/// Outcome of a `set`/`append`, mapped one-to-one onto reply lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    Exists,
    NotFound,
    NotStored,
}

/// Outcome of an `optimize` request (the `flush_all` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeOutcome {
    Ok,
    ReadOnly,
    Running,
    BadArg,
}

/// The storage operations the request core depends on.
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Item>;

    fn set(&self, key: &[u8], value: &[u8], flag: u32, ver: i32) -> SetOutcome;

    fn append(&self, key: &[u8], value: &[u8]) -> SetOutcome;

    /// Add `delta` to a numeric value, returning the new value. Missing or
    /// non-numeric values count as zero.
    fn incr(&self, key: &[u8], delta: u64) -> u64;

    fn delete(&self, key: &[u8]) -> bool;

    /// `(total_items, curr_items)`.
    fn count(&self) -> (u64, u64);

    /// `(total_space_bytes, avail_space_bytes)` of the backing volume.
    fn stat(&self) -> (u64, u64);

    fn optimize(&self, limit: i64, tree: &str) -> OptimizeOutcome;

    /// -1 when the last optimize succeeded, -2 when it failed, otherwise the
    /// bucket id currently being optimized.
    fn optimize_stat(&self) -> i32;

    /// Write back up to `limit_kb` of dirty data older than `period_secs`.
    fn flush(&self, limit_kb: u32, period_secs: u32);
}
