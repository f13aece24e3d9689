/*!
 * Heap Limits and Constants
 *
 * Centralized location for the engine's tunables and magic numbers.
 * Policy values here are defaults for `AdminConfig` fields, not
 * correctness requirements; performance-critical constants are
 * marked with [PERF].
 */

/// Smallest supported quantum (2^4 = 16 bytes)
/// One minimum quantum holds exactly one free-list node:
/// prev, next, size at the front and size_again in the last word
pub const MIN_QUANTUM_LOG2: u32 = 4;

/// Default quantum for the small size class (16 bytes)
pub const DEFAULT_QUANTUM_LOG2: u32 = 4;

/// Default largest quantum count served from the bucket array (64)
/// Requests above this belong to the large-object allocator
pub const DEFAULT_MAXIMUM_QUANTA: usize = 64;

/// Assumed OS page size (4KB)
/// Free ranges must exceed one page before a purge hint is worthwhile
/// [PERF] Sub-page hints cost a call and reclaim nothing
pub const PAGE_SIZE: usize = 4 * 1024;

/// Span covered by one write-barrier card byte (128 bytes)
/// [PERF] One byte per two cache lines keeps the card table dense
/// enough to scan quickly and coarse enough to stay small
pub const CARD_SIZE: usize = 128;

/// log2 of CARD_SIZE, for address-to-card shifts
pub const CARD_SIZE_LOG2: u32 = 7;

/// Blocks refilled into a thread cache per lock acquisition (10)
/// [PERF] Amortizes the admin lock across the allocation hot path
pub const THREAD_CACHE_BATCH: usize = 10;

/// Quantum-index bits in a packed free-list node reference (20)
/// Caps a subzone at 2^20 quanta; the remaining 12 bits index the
/// owning subzone within its admin
pub const NODE_QUANTUM_BITS: u32 = 20;

/// Largest quantum count a single subzone may carry
pub const SUBZONE_QUANTA_MAX: usize = 1 << NODE_QUANTUM_BITS;

/// Largest number of subzones one admin may manage
/// One index is reserved so the all-ones reference stays "none"
pub const SUBZONES_PER_ADMIN_MAX: usize = (1 << (32 - NODE_QUANTUM_BITS)) - 1;

/// Alignment of subzone arenas
/// Page alignment keeps purge/reuse hint ranges page-addressable
pub const ARENA_ALIGN: usize = PAGE_SIZE;
