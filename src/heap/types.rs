/*!
 * Heap Types
 * Common types for the allocation engine
 */

use crate::core::types::{Address, Size};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Heap operation result
pub type HeapResult<T> = Result<T, HeapError>;

/// Diagnosed, recoverable misuse of the heap API.
///
/// "Cannot allocate right now" is not an error - allocation entry points
/// return `None` or a short count and the caller retries after attaching
/// more address space. Heap corruption is not an error either: it aborts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("double free of block at 0x{address:x}")]
    DoubleFree { address: Address },

    #[error("address 0x{address:x} is not managed by this admin")]
    UnmanagedAddress { address: Address },

    #[error("address 0x{address:x} is not the start of an allocated block")]
    NotBlockStart { address: Address },

    #[error("request for {requested} quanta exceeds size-class ceiling of {maximum} quanta")]
    OversizedRequest { requested: usize, maximum: usize },

    #[error("invalid admin configuration: {0}")]
    InvalidConfig(String),
}

/// Memory layout category of a block, as the collector sees it.
///
/// Scanned blocks contain pointer fields the collector must trace;
/// object layouts additionally carry a type header in their first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockLayout {
    /// Raw storage with no pointers
    Unscanned,
    /// Pointer-bearing storage
    Scanned,
    /// Object with a header, no pointers
    Object,
    /// Object with a header and pointer fields
    ScannedObject,
}

impl BlockLayout {
    /// Whether blocks of this layout must be traced by the collector
    pub fn is_scanned(self) -> bool {
        matches!(self, BlockLayout::Scanned | BlockLayout::ScannedObject)
    }
}

/// Snapshot of one admin's allocation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminStats {
    pub quantum_size: Size,
    pub cache_size: usize,
    pub subzone_count: usize,
    pub purgeable_subzones: usize,
    /// Bytes sitting on free-list buckets
    pub free_list_bytes: Size,
    /// Bytes in never-carved subzone tails
    pub unused_tail_bytes: Size,
    /// Bytes eligible for an OS purge hint
    pub purgeable_bytes: Size,
    /// Blocks whose refcount has spilled past the presence bit
    pub overflow_entries: usize,
}

/// Fatal heap-corruption diagnostic: report full context and terminate.
///
/// Corruption is never recoverable; unwinding here would let a damaged
/// free list hand out overlapping blocks.
#[cold]
#[track_caller]
pub(crate) fn corruption_abort(detail: std::fmt::Arguments<'_>) -> ! {
    log::error!("heap corruption: {detail}");
    panic!("heap corruption: {detail}");
}
