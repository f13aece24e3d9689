/*!
 * Block References
 * Uniform capability facade over subzone-quantum and large blocks
 *
 * The hybrid refcount protocol keeps a presence bit in the subzone
 * side table and spills counts of two or more into the admin's
 * overflow table, guarded by the admin lock. Large blocks carry their
 * count inline in a zone-wide registry with identical transition and
 * underflow semantics.
 */

use crate::core::types::{Address, Size};
use crate::heap::admin::{Admin, AdminState};
use crate::heap::traits::{NoopDelegate, ZoneDelegate};
use crate::heap::types::{corruption_abort, BlockLayout};
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::Arc;

impl Admin {
    /// Capability over the allocated block at `address`, if one lives
    /// there.
    pub fn block_ref(&self, address: Address) -> Option<BlockRef<'_>> {
        if !self.is_block_start(address) {
            return None;
        }
        Some(BlockRef::Subzone {
            admin: self,
            address,
        })
    }

    fn with_quantum<R>(&self, address: Address, f: impl FnOnce(&AdminState, usize, usize) -> R) -> R {
        let guard = self.state.lock();
        match self.locate_block(&guard, address) {
            Some((s, q)) => f(&guard, s, q),
            None => corruption_abort(format_args!(
                "refcount operation on unmanaged address 0x{address:x}"
            )),
        }
    }

    fn with_quantum_mut<R>(
        &self,
        address: Address,
        f: impl FnOnce(&mut AdminState, usize, usize) -> R,
    ) -> R {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match self.locate_block(state, address) {
            Some((s, q)) => f(state, s, q),
            None => corruption_abort(format_args!(
                "refcount operation on unmanaged address 0x{address:x}"
            )),
        }
    }

    fn locate_block(&self, state: &AdminState, address: Address) -> Option<(usize, usize)> {
        for (s, subzone) in state.subzones.iter().enumerate() {
            if subzone.contains(address) {
                return subzone.quantum_of(address).map(|q| (s, q));
            }
        }
        None
    }

    /// Current reference count: 0 without the presence bit, 1 with the
    /// bit alone, else the overflow entry.
    pub(crate) fn refcount(&self, address: Address) -> usize {
        self.with_quantum(address, |state, s, q| {
            if !state.subzones[s].has_refcount(q) {
                0
            } else {
                state.overflow.get(&address).copied().unwrap_or(1)
            }
        })
    }

    /// Raise the count. The 0 -> 1 transition flips the presence bit
    /// and reports the block escaped; 1 -> 2 spills into the overflow
    /// table.
    pub(crate) fn inc_refcount(&self, address: Address) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some((s, q)) = self.locate_block(state, address) else {
            corruption_abort(format_args!(
                "refcount operation on unmanaged address 0x{address:x}"
            ));
        };
        let subzone = &mut state.subzones[s];
        if !subzone.has_refcount(q) {
            subzone.set_has_refcount(q, true);
            // A referenced block is no longer confined to its thread
            subzone.set_thread_local(q, false);
            drop(guard);
            self.delegate.block_escaped(address);
            return 1;
        }
        match state.overflow.get_mut(&address) {
            None => {
                state.overflow.insert(address, 2);
                2
            }
            Some(count) => {
                *count += 1;
                *count
            }
        }
    }

    /// Drop the count; underflow is a fatal diagnostic.
    pub(crate) fn dec_refcount(&self, address: Address) -> usize {
        let mut guard = self.state.lock();
        self.dec_refcount_no_lock(&mut guard, address)
    }

    /// Decrement for call sites already holding the admin lock.
    pub(crate) fn dec_refcount_no_lock(
        &self,
        state: &mut AdminState,
        address: Address,
    ) -> usize {
        let Some((s, q)) = self.locate_block(state, address) else {
            corruption_abort(format_args!(
                "refcount operation on unmanaged address 0x{address:x}"
            ));
        };
        if !state.subzones[s].has_refcount(q) {
            corruption_abort(format_args!(
                "refcount underflow on block at 0x{address:x}"
            ));
        }
        match state.overflow.get_mut(&address) {
            Some(count) => {
                *count -= 1;
                if *count == 1 {
                    state.overflow.remove(&address);
                    1
                } else {
                    *count
                }
            }
            None => {
                state.subzones[s].set_has_refcount(q, false);
                0
            }
        }
    }
}

/// Record backing one standalone large block.
#[derive(Debug, Clone)]
struct LargeRecord {
    size: Size,
    layout: BlockLayout,
    refcount: usize,
    marked: bool,
    garbage: bool,
    pinned: bool,
}

/// Zone-wide registry of blocks above the quantum-class ceiling.
///
/// The large allocator itself lives outside this engine; the registry
/// exists so large blocks expose the same capability set as
/// subzone-quantum blocks, refcounts included.
pub struct LargeBlocks {
    table: DashMap<Address, LargeRecord, RandomState>,
    delegate: Arc<dyn ZoneDelegate>,
}

impl LargeBlocks {
    pub fn new() -> LargeBlocks {
        LargeBlocks {
            table: DashMap::with_hasher(RandomState::new()),
            delegate: Arc::new(NoopDelegate),
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn ZoneDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Track a block handed out by the large allocator
    pub fn register(&self, address: Address, size: Size, layout: BlockLayout) {
        self.table.insert(
            address,
            LargeRecord {
                size,
                layout,
                refcount: 0,
                marked: false,
                garbage: false,
                pinned: false,
            },
        );
    }

    /// Forget a reclaimed block; false if it was never registered
    pub fn deregister(&self, address: Address) -> bool {
        self.table.remove(&address).is_some()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.table.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn block_ref(&self, address: Address) -> Option<BlockRef<'_>> {
        if !self.contains(address) {
            return None;
        }
        Some(BlockRef::Large {
            blocks: self,
            address,
        })
    }

    fn read<R>(&self, address: Address, f: impl FnOnce(&LargeRecord) -> R) -> R {
        match self.table.get(&address) {
            Some(record) => f(&record),
            None => corruption_abort(format_args!(
                "capability use on unregistered large block 0x{address:x}"
            )),
        }
    }

    fn write<R>(&self, address: Address, f: impl FnOnce(&mut LargeRecord) -> R) -> R {
        match self.table.get_mut(&address) {
            Some(mut record) => f(&mut record),
            None => corruption_abort(format_args!(
                "capability use on unregistered large block 0x{address:x}"
            )),
        }
    }
}

impl Default for LargeBlocks {
    fn default() -> Self {
        LargeBlocks::new()
    }
}

/// Capability over one heap block, subzone-relative or large.
///
/// The two variants expose one capability set; callers never care
/// which side of the quantum-class ceiling a block fell on.
pub enum BlockRef<'a> {
    Subzone { admin: &'a Admin, address: Address },
    Large {
        blocks: &'a LargeBlocks,
        address: Address,
    },
}

impl<'a> BlockRef<'a> {
    pub fn address(&self) -> Address {
        match self {
            BlockRef::Subzone { address, .. } | BlockRef::Large { address, .. } => *address,
        }
    }

    pub fn size(&self) -> Size {
        match self {
            BlockRef::Subzone { admin, address } => admin
                .block_size(*address)
                .unwrap_or_else(|| {
                    corruption_abort(format_args!(
                        "capability use on freed block 0x{address:x}"
                    ))
                }),
            BlockRef::Large { blocks, address } => blocks.read(*address, |r| r.size),
        }
    }

    pub fn layout(&self) -> BlockLayout {
        match self {
            BlockRef::Subzone { admin, address } => admin.with_quantum(*address, |state, s, q| {
                state.subzones[s].layout_of(q)
            }),
            BlockRef::Large { blocks, address } => blocks.read(*address, |r| r.layout),
        }
    }

    /// Whether the collector must trace this block's contents
    pub fn is_scanned(&self) -> bool {
        self.layout().is_scanned()
    }

    pub fn is_marked(&self) -> bool {
        match self {
            BlockRef::Subzone { admin, address } => {
                admin.with_quantum(*address, |state, s, q| state.subzones[s].is_marked(q))
            }
            BlockRef::Large { blocks, address } => blocks.read(*address, |r| r.marked),
        }
    }

    pub fn set_marked(&self, on: bool) {
        match self {
            BlockRef::Subzone { admin, address } => {
                admin.with_quantum_mut(*address, |state, s, q| {
                    state.subzones[s].set_marked(q, on)
                })
            }
            BlockRef::Large { blocks, address } => blocks.write(*address, |r| r.marked = on),
        }
    }

    pub fn is_garbage(&self) -> bool {
        match self {
            BlockRef::Subzone { admin, address } => {
                admin.with_quantum(*address, |state, s, q| state.subzones[s].is_garbage(q))
            }
            BlockRef::Large { blocks, address } => blocks.read(*address, |r| r.garbage),
        }
    }

    pub fn set_garbage(&self, on: bool) {
        match self {
            BlockRef::Subzone { admin, address } => {
                admin.with_quantum_mut(*address, |state, s, q| {
                    state.subzones[s].set_garbage(q, on)
                })
            }
            BlockRef::Large { blocks, address } => blocks.write(*address, |r| r.garbage = on),
        }
    }

    pub fn is_pinned(&self) -> bool {
        match self {
            BlockRef::Subzone { admin, address } => {
                admin.with_quantum(*address, |state, s, q| state.subzones[s].is_pinned(q))
            }
            BlockRef::Large { blocks, address } => blocks.read(*address, |r| r.pinned),
        }
    }

    pub fn set_pinned(&self, on: bool) {
        match self {
            BlockRef::Subzone { admin, address } => {
                admin.with_quantum_mut(*address, |state, s, q| {
                    state.subzones[s].set_pinned(q, on)
                })
            }
            BlockRef::Large { blocks, address } => blocks.write(*address, |r| r.pinned = on),
        }
    }

    /// Whether the block is still confined to its allocating thread
    pub fn is_thread_local(&self) -> bool {
        match self {
            BlockRef::Subzone { admin, address } => {
                admin.with_quantum(*address, |state, s, q| state.subzones[s].is_thread_local(q))
            }
            BlockRef::Large { .. } => false,
        }
    }

    pub fn refcount(&self) -> usize {
        match self {
            BlockRef::Subzone { admin, address } => admin.refcount(*address),
            BlockRef::Large { blocks, address } => blocks.read(*address, |r| r.refcount),
        }
    }

    pub fn inc_refcount(&self) -> usize {
        match self {
            BlockRef::Subzone { admin, address } => admin.inc_refcount(*address),
            BlockRef::Large { blocks, address } => {
                let (count, escaped) = blocks.write(*address, |r| {
                    r.refcount += 1;
                    (r.refcount, r.refcount == 1)
                });
                if escaped {
                    blocks.delegate.block_escaped(*address);
                }
                count
            }
        }
    }

    pub fn dec_refcount(&self) -> usize {
        match self {
            BlockRef::Subzone { admin, address } => admin.dec_refcount(*address),
            BlockRef::Large { blocks, address } => blocks.write(*address, |r| {
                if r.refcount == 0 {
                    corruption_abort(format_args!(
                        "refcount underflow on large block at 0x{address:x}"
                    ));
                }
                r.refcount -= 1;
                r.refcount
            }),
        }
    }

    /// Register the block with an in-progress collection so it cannot
    /// be missed; a capability consumed from the collector.
    pub fn enliven(&self) {
        match self {
            BlockRef::Subzone { admin, address } => admin.delegate.enliven(*address),
            BlockRef::Large { blocks, address } => blocks.delegate.enliven(*address),
        }
    }
}
