/*!
 * Quantum Heap
 * Allocation engine for a garbage-collected heap manager
 */

pub mod core;
pub mod heap;

// Re-exports
pub use heap::{
    Admin, AdminConfig, AdminStats, BlockLayout, BlockRef, HeapError, HeapResult, LargeBlocks,
    PageAdvisor, Subzone, ThreadCache, WriteBarrier, ZoneDelegate,
};
