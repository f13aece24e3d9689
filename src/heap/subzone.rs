/*!
 * Subzone
 * One arena region subdivided into quanta, with per-quantum side tables
 *
 * All raw-pointer reinterpretation of free memory lives in this file.
 * The free-list overlays its node words onto free quanta through the
 * accessors below; nothing outside this module touches arena bytes.
 */

use crate::core::limits::{
    ARENA_ALIGN, MIN_QUANTUM_LOG2, NODE_QUANTUM_BITS, SUBZONE_QUANTA_MAX,
};
use crate::core::types::{Address, Size};
use crate::heap::freelist::RawNode;
use crate::heap::types::BlockLayout;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

// Admin-owned per-quantum flags, mutated only under the admin lock.
pub(crate) const FLAG_FREE: u8 = 1 << 0;
pub(crate) const FLAG_START: u8 = 1 << 1;
pub(crate) const FLAG_REFCOUNT: u8 = 1 << 2;
pub(crate) const FLAG_THREAD_LOCAL: u8 = 1 << 3;
pub(crate) const FLAG_PURGED: u8 = 1 << 4;

// Collector-owned per-quantum flags, valid at block starts.
pub(crate) const COLLECT_MARK: u8 = 1 << 0;
pub(crate) const COLLECT_GARBAGE: u8 = 1 << 1;
pub(crate) const COLLECT_PINNED: u8 = 1 << 2;

/// Page-aligned backing storage for one subzone.
///
/// Owns its mapping exclusively; freed on drop.
struct Arena {
    base: NonNull<u8>,
    size: usize,
}

impl Arena {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, ARENA_ALIGN)
            .expect("subzone arena layout");
        // Zeroed so fresh tails read as all-clear quanta
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        Arena { base, size }
    }

    fn base_address(&self) -> Address {
        self.base.as_ptr() as Address
    }

    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size);
        debug_assert!(offset % 4 == 0);
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().read() }
    }

    #[inline]
    fn write_u32(&mut self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size);
        debug_assert!(offset % 4 == 0);
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().write(value) }
    }

    fn zero_range(&mut self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.size);
        unsafe { self.base.as_ptr().add(offset).write_bytes(0, len) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, ARENA_ALIGN)
            .expect("subzone arena layout");
        unsafe { alloc::dealloc(self.base.as_ptr(), layout) }
    }
}

// The arena is exclusively owned and only reachable through &mut self
// or the owning admin's lock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// One arena region subdivided into `allocation_limit` quanta.
///
/// Tracks the allocation high-water mark and the per-quantum side
/// tables the admin and collector consult. Subzones are constructed by
/// the owning zone and attached via [`Admin::manage_subzone`]; the
/// admin never destroys one.
///
/// [`Admin::manage_subzone`]: crate::heap::Admin::manage_subzone
pub struct Subzone {
    quantum_log2: u32,
    limit: usize,
    allocation_count: usize,
    arena: Arena,
    /// FLAG_* bits per quantum
    flags: Vec<u8>,
    /// COLLECT_* bits per quantum, valid at block starts
    collector: Vec<u8>,
    /// Block length in quanta, valid at block starts
    lens: Vec<u32>,
    /// Block layout tag, valid at block starts
    layouts: Vec<u8>,
    purgeable: bool,
    purged: bool,
}

impl Subzone {
    /// Create a subzone carrying `quanta` quanta of `1 << quantum_log2`
    /// bytes each. The arena is zeroed and page-aligned.
    pub fn new(quantum_log2: u32, quanta: usize) -> Self {
        assert!(
            quantum_log2 >= MIN_QUANTUM_LOG2,
            "quantum must be at least {} bytes",
            1usize << MIN_QUANTUM_LOG2
        );
        assert!(quanta > 0, "subzone must carry at least one quantum");
        assert!(
            quanta <= SUBZONE_QUANTA_MAX,
            "subzone exceeds {} quanta",
            SUBZONE_QUANTA_MAX
        );
        let bytes = quanta << quantum_log2;
        Subzone {
            quantum_log2,
            limit: quanta,
            allocation_count: 0,
            arena: Arena::new(bytes),
            flags: vec![0; quanta],
            collector: vec![0; quanta],
            lens: vec![0; quanta],
            layouts: vec![0; quanta],
            purgeable: false,
            purged: false,
        }
    }

    pub fn quantum_log2(&self) -> u32 {
        self.quantum_log2
    }

    pub fn quantum_size(&self) -> Size {
        1 << self.quantum_log2
    }

    pub fn base_address(&self) -> Address {
        self.arena.base_address()
    }

    pub fn end_address(&self) -> Address {
        self.base_address() + (self.limit << self.quantum_log2)
    }

    /// Capacity in quanta
    pub fn allocation_limit(&self) -> usize {
        self.limit
    }

    /// High-water used boundary in quanta
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    /// Quanta between the high-water mark and capacity
    pub fn remaining_quanta(&self) -> usize {
        self.limit - self.allocation_count
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base_address() && address < self.end_address()
    }

    /// Quantum index of an address, or None if unmanaged or not
    /// quantum-aligned.
    pub(crate) fn quantum_of(&self, address: Address) -> Option<usize> {
        if !self.contains(address) {
            return None;
        }
        let offset = address - self.base_address();
        if offset & (self.quantum_size() - 1) != 0 {
            return None;
        }
        Some(offset >> self.quantum_log2)
    }

    pub(crate) fn quantum_address(&self, q: usize) -> Address {
        debug_assert!(q < self.limit);
        self.base_address() + (q << self.quantum_log2)
    }

    pub(crate) fn raise_allocation_count(&mut self, n: usize) {
        debug_assert!(self.allocation_count + n <= self.limit);
        self.allocation_count += n;
    }

    pub(crate) fn lower_allocation_count(&mut self, n: usize) {
        debug_assert!(n <= self.allocation_count);
        self.allocation_count -= n;
    }

    // --- per-quantum flags ---

    #[inline]
    pub(crate) fn is_free(&self, q: usize) -> bool {
        self.flags[q] & FLAG_FREE != 0
    }

    #[inline]
    pub(crate) fn is_start(&self, q: usize) -> bool {
        self.flags[q] & FLAG_START != 0
    }

    pub(crate) fn has_refcount(&self, q: usize) -> bool {
        self.flags[q] & FLAG_REFCOUNT != 0
    }

    pub(crate) fn set_has_refcount(&mut self, q: usize, on: bool) {
        if on {
            self.flags[q] |= FLAG_REFCOUNT;
        } else {
            self.flags[q] &= !FLAG_REFCOUNT;
        }
    }

    pub(crate) fn is_thread_local(&self, q: usize) -> bool {
        self.flags[q] & FLAG_THREAD_LOCAL != 0
    }

    pub(crate) fn set_thread_local(&mut self, q: usize, on: bool) {
        if on {
            self.flags[q] |= FLAG_THREAD_LOCAL;
        } else {
            self.flags[q] &= !FLAG_THREAD_LOCAL;
        }
    }

    /// Whether the free node starting at `q` had its pages purged
    pub(crate) fn is_purged_node(&self, q: usize) -> bool {
        self.flags[q] & FLAG_PURGED != 0
    }

    pub(crate) fn set_purged_node(&mut self, q: usize, on: bool) {
        if on {
            self.flags[q] |= FLAG_PURGED;
        } else {
            self.flags[q] &= !FLAG_PURGED;
        }
    }

    // --- collector flags ---

    pub(crate) fn is_marked(&self, q: usize) -> bool {
        self.collector[q] & COLLECT_MARK != 0
    }

    pub(crate) fn set_marked(&mut self, q: usize, on: bool) {
        if on {
            self.collector[q] |= COLLECT_MARK;
        } else {
            self.collector[q] &= !COLLECT_MARK;
        }
    }

    pub(crate) fn is_garbage(&self, q: usize) -> bool {
        self.collector[q] & COLLECT_GARBAGE != 0
    }

    pub(crate) fn set_garbage(&mut self, q: usize, on: bool) {
        if on {
            self.collector[q] |= COLLECT_GARBAGE;
        } else {
            self.collector[q] &= !COLLECT_GARBAGE;
        }
    }

    pub(crate) fn is_pinned(&self, q: usize) -> bool {
        self.collector[q] & COLLECT_PINNED != 0
    }

    pub(crate) fn set_pinned(&mut self, q: usize, on: bool) {
        if on {
            self.collector[q] |= COLLECT_PINNED;
        } else {
            self.collector[q] &= !COLLECT_PINNED;
        }
    }

    // --- block bookkeeping ---

    /// Length in quanta of the allocated block starting at `q`
    pub(crate) fn block_len(&self, q: usize) -> usize {
        debug_assert!(self.is_start(q));
        self.lens[q] as usize
    }

    pub(crate) fn layout_of(&self, q: usize) -> BlockLayout {
        match self.layouts[q] {
            1 => BlockLayout::Scanned,
            2 => BlockLayout::Object,
            3 => BlockLayout::ScannedObject,
            _ => BlockLayout::Unscanned,
        }
    }

    /// Transition `n` quanta at `q` to an allocated block.
    pub(crate) fn mark_allocated(
        &mut self,
        q: usize,
        n: usize,
        layout: BlockLayout,
        thread_local: bool,
    ) {
        debug_assert!(q + n <= self.limit);
        for i in q..q + n {
            self.flags[i] = 0;
            self.collector[i] = 0;
        }
        self.flags[q] = FLAG_START | if thread_local { FLAG_THREAD_LOCAL } else { 0 };
        self.lens[q] = n as u32;
        self.layouts[q] = match layout {
            BlockLayout::Unscanned => 0,
            BlockLayout::Scanned => 1,
            BlockLayout::Object => 2,
            BlockLayout::ScannedObject => 3,
        };
    }

    /// Transition `n` quanta at `q` to free-list memory, clearing every
    /// block bit (start/layout/refcount/mark) the range carried.
    pub(crate) fn mark_free_range(&mut self, q: usize, n: usize) {
        debug_assert!(q + n <= self.limit);
        for i in q..q + n {
            self.flags[i] = FLAG_FREE;
            self.collector[i] = 0;
            self.lens[i] = 0;
            self.layouts[i] = 0;
        }
    }

    /// Return a reclaimed tail range to the virgin state.
    pub(crate) fn clear_range_bits(&mut self, q: usize, n: usize) {
        debug_assert!(q + n <= self.limit);
        for i in q..q + n {
            self.flags[i] = 0;
            self.collector[i] = 0;
            self.lens[i] = 0;
            self.layouts[i] = 0;
        }
    }

    // --- purge state ---

    pub(crate) fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    pub(crate) fn set_purgeable(&mut self, on: bool) {
        self.purgeable = on;
    }

    /// Whether the unused tail was hinted discardable to the OS
    pub(crate) fn is_purged(&self) -> bool {
        self.purged
    }

    pub(crate) fn set_purged(&mut self, on: bool) {
        self.purged = on;
    }

    /// The reclaimable range behind the high-water mark, if any
    pub(crate) fn purgeable_range(&self) -> Option<(Address, Size)> {
        let quanta = self.remaining_quanta();
        if quanta == 0 {
            return None;
        }
        Some((
            self.quantum_address(self.allocation_count),
            quanta << self.quantum_log2,
        ))
    }

    // --- free-list node words, overlaid on free quanta ---

    /// Write a complete node at `q`: header words at the front,
    /// size_again in the last word of the block.
    pub(crate) fn write_node(&mut self, q: usize, node: RawNode) {
        let off = q << self.quantum_log2;
        debug_assert!(node.size as usize >= self.quantum_size());
        self.arena.write_u32(off, node.prev);
        self.arena.write_u32(off + 4, node.next);
        self.arena.write_u32(off + 8, node.size);
        self.arena.write_u32(off + node.size as usize - 4, node.size);
    }

    pub(crate) fn read_node(&self, q: usize) -> RawNode {
        let off = q << self.quantum_log2;
        RawNode {
            prev: self.arena.read_u32(off),
            next: self.arena.read_u32(off + 4),
            size: self.arena.read_u32(off + 8),
        }
    }

    /// The size_again word of the node whose block ends at quantum `q`
    pub(crate) fn read_trailing_size(&self, q: usize) -> u32 {
        debug_assert!(q > 0);
        self.arena.read_u32((q << self.quantum_log2) - 4)
    }

    pub(crate) fn read_size_again(&self, q: usize, size: u32) -> u32 {
        self.arena.read_u32((q << self.quantum_log2) + size as usize - 4)
    }

    pub(crate) fn set_node_prev(&mut self, q: usize, prev: u32) {
        self.arena.write_u32(q << self.quantum_log2, prev);
    }

    pub(crate) fn set_node_next(&mut self, q: usize, next: u32) {
        self.arena.write_u32((q << self.quantum_log2) + 4, next);
    }

    /// Zero the contents of `n` quanta at `q` (cleared batch allocations)
    pub(crate) fn zero_quanta(&mut self, q: usize, n: usize) {
        self.arena
            .zero_range(q << self.quantum_log2, n << self.quantum_log2);
    }
}

impl std::fmt::Debug for Subzone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subzone")
            .field("base", &format_args!("0x{:x}", self.base_address()))
            .field("quantum", &self.quantum_size())
            .field("limit", &self.limit)
            .field("allocation_count", &self.allocation_count)
            .field("purgeable", &self.purgeable)
            .field("purged", &self.purged)
            .finish()
    }
}

// NODE_QUANTUM_BITS must cover any legal quantum index.
const _: () = assert!(SUBZONE_QUANTA_MAX == 1 << NODE_QUANTUM_BITS);
