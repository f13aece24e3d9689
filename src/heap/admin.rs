/*!
 * Admin
 * Allocation and deallocation engine for one quantum size class
 *
 * Each admin owns an allocation cache of free-list buckets, the
 * subzones attached to it by the zone, and one lock guarding all of
 * it. Allocation tries, in order: exact-fit bucket, best-fit scan,
 * catch-all bucket, carving the active subzone's tail, reactivating a
 * purgeable subzone. Deallocation coalesces with free neighbors and
 * either shrinks a subzone tail or lands in a bucket.
 */

use crate::core::limits::{MIN_QUANTUM_LOG2, PAGE_SIZE, SUBZONES_PER_ADMIN_MAX, THREAD_CACHE_BATCH};
use crate::core::types::{Address, Size};
use crate::heap::cache::AllocationCache;
use crate::heap::freelist::{NodeRef, PoppedNode};
use crate::heap::subzone::Subzone;
use crate::heap::traits::{NoopAdvisor, NoopDelegate, PageAdvisor, ZoneDelegate};
use crate::heap::types::{corruption_abort, AdminStats, BlockLayout, HeapError, HeapResult};
use ahash::RandomState;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration for one admin.
///
/// Admins are explicitly constructed; there is no process-wide
/// instance. The numeric fields are policy knobs, not correctness
/// requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// log2 of the quantum size; every block is a quantum multiple
    pub quantum_log2: u32,
    /// Largest quantum count served from the bucket array; bigger
    /// requests belong to the large-object allocator
    pub maximum_quanta: usize,
    /// Layout tag stamped on blocks this admin hands out
    pub layout: BlockLayout,
    /// Free ranges must exceed this many bytes before a purge hint
    /// is worth issuing
    pub purge_threshold: Size,
    /// Spare quanta a purgeable subzone must have before it is worth
    /// reactivating
    pub reactivation_spare_quanta: usize,
    /// Blocks refilled into a thread cache per lock acquisition
    pub thread_cache_batch: usize,
    /// Compaction destinations are deliberately randomized; selects
    /// the allocate_destination_block mode
    pub scramble: bool,
    /// Guard-page diagnostics are active: neighbor adjacency no longer
    /// holds, so coalescing is skipped entirely
    pub guard_pages: bool,
    /// Escalate diagnosed misuse (double free) to a fatal abort
    pub strict_checks: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            quantum_log2: crate::core::limits::DEFAULT_QUANTUM_LOG2,
            maximum_quanta: crate::core::limits::DEFAULT_MAXIMUM_QUANTA,
            layout: BlockLayout::Unscanned,
            purge_threshold: PAGE_SIZE,
            reactivation_spare_quanta: crate::core::limits::DEFAULT_MAXIMUM_QUANTA + 1,
            thread_cache_batch: THREAD_CACHE_BATCH,
            scramble: false,
            guard_pages: false,
            strict_checks: false,
        }
    }
}

impl AdminConfig {
    /// Bucket count: one per exact quantum count plus the catch-all
    pub fn cache_size(&self) -> usize {
        self.maximum_quanta + 1
    }

    pub fn quantum_size(&self) -> Size {
        1 << self.quantum_log2
    }

    pub fn validate(&self) -> HeapResult<()> {
        if self.quantum_log2 < MIN_QUANTUM_LOG2 {
            return Err(HeapError::InvalidConfig(format!(
                "quantum_log2 {} below minimum {}",
                self.quantum_log2, MIN_QUANTUM_LOG2
            )));
        }
        if self.quantum_log2 > 16 {
            return Err(HeapError::InvalidConfig(format!(
                "quantum_log2 {} is past any sensible size class",
                self.quantum_log2
            )));
        }
        if self.maximum_quanta < 2 {
            return Err(HeapError::InvalidConfig(
                "maximum_quanta must be at least 2".to_string(),
            ));
        }
        if self.thread_cache_batch == 0 {
            return Err(HeapError::InvalidConfig(
                "thread_cache_batch must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything the admin lock guards.
pub(crate) struct AdminState {
    pub(crate) subzones: Vec<Subzone>,
    pub(crate) cache: AllocationCache,
    /// Subzone currently carved from, if any
    pub(crate) active: Option<usize>,
    /// Subzones whose tail shrank back to empty
    pub(crate) purgeable: Vec<usize>,
    /// Highest possibly-nonempty non-zero bucket index
    pub(crate) freelist_search_cap: usize,
    /// Refcounts of 2 or more, keyed by block address
    pub(crate) overflow: HashMap<Address, usize, RandomState>,
}

/// Allocation engine for one quantum size class.
///
/// One lock guards all free-list and subzone mutation; independent
/// admins have independent locks. Subzones are attached by the owning
/// zone via [`manage_subzone`] whenever allocation returns `None`.
///
/// [`manage_subzone`]: Admin::manage_subzone
pub struct Admin {
    pub(crate) config: AdminConfig,
    pub(crate) state: Mutex<AdminState>,
    pub(crate) delegate: Arc<dyn ZoneDelegate>,
    pub(crate) advisor: Arc<dyn PageAdvisor>,
}

impl Admin {
    pub fn new(config: AdminConfig) -> HeapResult<Admin> {
        config.validate()?;
        info!(
            "admin initialized: quantum {} bytes, {} buckets",
            config.quantum_size(),
            config.cache_size()
        );
        let cache = AllocationCache::new(config.cache_size());
        Ok(Admin {
            config,
            state: Mutex::new(AdminState {
                subzones: Vec::new(),
                cache,
                active: None,
                purgeable: Vec::new(),
                freelist_search_cap: 0,
                overflow: HashMap::default(),
            }),
            delegate: Arc::new(NoopDelegate),
            advisor: Arc::new(NoopAdvisor),
        })
    }

    /// Attach the zone/collector callback sink
    pub fn with_delegate(mut self, delegate: Arc<dyn ZoneDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Attach the OS page-hint sink
    pub fn with_advisor(mut self, advisor: Arc<dyn PageAdvisor>) -> Self {
        self.advisor = advisor;
        self
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    pub fn quantum_size(&self) -> Size {
        self.config.quantum_size()
    }

    pub fn cache_size(&self) -> usize {
        self.config.cache_size()
    }

    pub fn layout(&self) -> BlockLayout {
        self.config.layout
    }

    /// Quantum count for a byte size, or the request is oversized and
    /// belongs to the large-object allocator.
    pub fn quanta_for_size(&self, size: Size) -> HeapResult<usize> {
        let quantum = self.quantum_size();
        let n = if size == 0 {
            1
        } else {
            (size + quantum - 1) >> self.config.quantum_log2
        };
        if n >= self.config.cache_size() {
            return Err(HeapError::OversizedRequest {
                requested: n,
                maximum: self.config.maximum_quanta,
            });
        }
        Ok(n)
    }

    /// Attach a subzone supplied by the zone. It becomes the active
    /// carving target immediately.
    pub fn manage_subzone(&self, subzone: Subzone) -> usize {
        assert_eq!(
            subzone.quantum_log2(),
            self.config.quantum_log2,
            "subzone quantum must match the admin's"
        );
        let mut guard = self.state.lock();
        let state = &mut *guard;
        assert!(
            state.subzones.len() < SUBZONES_PER_ADMIN_MAX,
            "admin cannot manage more than {} subzones",
            SUBZONES_PER_ADMIN_MAX
        );
        let index = state.subzones.len();
        info!(
            "admin managing subzone {index}: {} quanta of {} bytes at 0x{:x}",
            subzone.allocation_limit(),
            subzone.quantum_size(),
            subzone.base_address()
        );
        state.subzones.push(subzone);
        if let Some(previous) = state.active {
            // The zone only attaches on exhaustion; tolerate anyway
            debug_assert!(false, "attached a subzone while one is active");
            self.retire_active(state, previous);
        }
        state.active = Some(index);
        if state.subzones[index].remaining_quanta() < self.config.cache_size() {
            self.retire_active(state, index);
        }
        index
    }

    // ------------------------------------------------------------------
    // allocation
    // ------------------------------------------------------------------

    /// Find a block of at least `size` bytes.
    ///
    /// `None` means the admin is exhausted: the caller obtains new
    /// address space, attaches it via [`manage_subzone`], and retries.
    /// This is expected flow control, not an error.
    ///
    /// [`manage_subzone`]: Admin::manage_subzone
    pub fn find_allocation(&self, size: Size) -> Option<Address> {
        let n = self.quanta_for_size(size).ok()?;
        let mut guard = self.state.lock();
        let address = self.find_allocation_locked(&mut guard, n, false)?;
        drop(guard);
        self.delegate.note_allocated(n << self.config.quantum_log2);
        Some(address)
    }

    fn find_allocation_locked(
        &self,
        state: &mut AdminState,
        n: usize,
        thread_local: bool,
    ) -> Option<Address> {
        debug_assert!(n >= 1 && n < self.config.cache_size());
        let maximum_quanta = self.config.maximum_quanta;

        // Exact fit
        if n < maximum_quanta {
            if let Some(popped) = state.cache.bucket_mut(n).pop(&mut state.subzones) {
                return Some(self.claim_node(state, popped, n, thread_local));
            }
        }

        // Best fit: first nonempty bucket above n, remainder returned
        // to its own bucket
        let cap = state.freelist_search_cap;
        if n < cap {
            for k in n + 1..=cap {
                if let Some(popped) = state.cache.bucket_mut(k).pop(&mut state.subzones) {
                    return Some(self.claim_node(state, popped, n, thread_local));
                }
            }
        }
        // The scan proved every bucket above n empty
        if cap > n {
            state.freelist_search_cap = n;
        }

        // Catch-all bucket: every node there is at least maximum_quanta,
        // which always covers n
        if let Some(popped) = state.cache.bucket_mut(0).pop(&mut state.subzones) {
            return Some(self.claim_node(state, popped, n, thread_local));
        }

        // Carve from the active subzone, reactivating purgeable ones
        // as they run out
        loop {
            if let Some((_, _, address)) = self.carve_from_active(state, n, thread_local) {
                return Some(address);
            }
            if !self.reactivate_purgeable(state) {
                return None;
            }
        }
    }

    /// Take ownership of a popped node: return any remainder to its
    /// bucket, reuse-hint purged memory, stamp the block allocated.
    fn claim_node(
        &self,
        state: &mut AdminState,
        popped: PoppedNode,
        n: usize,
        thread_local: bool,
    ) -> Address {
        let quantum_log2 = self.config.quantum_log2;
        let total_quanta = (popped.size as usize) >> quantum_log2;
        debug_assert!(total_quanta >= n);
        let s = popped.node.subzone();
        let q = popped.node.quantum();
        let purged = state.subzones[s].is_purged_node(q);

        if total_quanta > n {
            // Remainders queue at the tail; the head stays the most
            // recently freed block
            let remainder = total_quanta - n;
            let bucket = state.cache.bucket_for(remainder);
            let node = NodeRef::new(s, q + n);
            state.cache.bucket_mut(bucket).append(
                &mut state.subzones,
                node,
                (remainder << quantum_log2) as u32,
            );
            if purged {
                state.subzones[s].set_purged_node(q + n, true);
            }
            if bucket != 0 && bucket > state.freelist_search_cap {
                state.freelist_search_cap = bucket;
            }
        }

        let subzone = &mut state.subzones[s];
        let address = subzone.quantum_address(q);
        if purged {
            // Discarded pages must be backed again before reissue
            self.advisor.reuse(address, n << quantum_log2);
        }
        subzone.mark_allocated(q, n, self.config.layout, thread_local);
        address
    }

    fn carve_from_active(
        &self,
        state: &mut AdminState,
        n: usize,
        thread_local: bool,
    ) -> Option<(usize, usize, Address)> {
        let index = state.active?;
        let cache_size = self.config.cache_size();
        let subzone = &mut state.subzones[index];
        if subzone.remaining_quanta() < n {
            // Reactivation thresholds are policy; a too-short tail is
            // retired rather than trusted
            self.retire_active(state, index);
            return None;
        }
        if subzone.is_purged() {
            // A purged free range merged into this tail earlier
            if let Some((address, bytes)) = subzone.purgeable_range() {
                self.advisor.reuse(address, bytes);
            }
            subzone.set_purged(false);
        }
        let q = subzone.allocation_count();
        subzone.raise_allocation_count(n);
        subzone.mark_allocated(q, n, self.config.layout, thread_local);
        let address = subzone.quantum_address(q);
        if state.subzones[index].remaining_quanta() < cache_size {
            self.retire_active(state, index);
        }
        Some((index, q, address))
    }

    /// Push the unusably short tail of the active subzone onto a
    /// bucket and stop carving from it.
    fn retire_active(&self, state: &mut AdminState, index: usize) {
        let quantum_log2 = self.config.quantum_log2;
        let subzone = &mut state.subzones[index];
        let remainder = subzone.remaining_quanta();
        if remainder > 0 {
            let q = subzone.allocation_count();
            subzone.raise_allocation_count(remainder);
            subzone.mark_free_range(q, remainder);
            let bucket = state.cache.bucket_for(remainder);
            state.cache.bucket_mut(bucket).push(
                &mut state.subzones,
                NodeRef::new(index, q),
                (remainder << quantum_log2) as u32,
            );
            if bucket != 0 && bucket > state.freelist_search_cap {
                state.freelist_search_cap = bucket;
            }
        }
        state.active = None;
        debug!("retired subzone {index} with a {remainder}-quantum tail");
    }

    /// Resume carving from a purgeable subzone with enough spare
    /// capacity, reuse-hinting it first if its pages were discarded.
    fn reactivate_purgeable(&self, state: &mut AdminState) -> bool {
        let spare = self.config.reactivation_spare_quanta;
        let position = state
            .purgeable
            .iter()
            .position(|&i| state.subzones[i].remaining_quanta() > spare);
        let Some(position) = position else {
            return false;
        };
        let index = state.purgeable.swap_remove(position);
        let subzone = &mut state.subzones[index];
        subzone.set_purgeable(false);
        if subzone.is_purged() {
            if let Some((address, bytes)) = subzone.purgeable_range() {
                self.advisor.reuse(address, bytes);
            }
            subzone.set_purged(false);
        }
        state.active = Some(index);
        info!(
            "reactivated subzone {index} with {} spare quanta",
            state.subzones[index].remaining_quanta()
        );
        true
    }

    // ------------------------------------------------------------------
    // deallocation
    // ------------------------------------------------------------------

    /// Return a block to the admin, coalescing with free neighbors.
    ///
    /// Double free is diagnosed and rejected without corrupting the
    /// heap; with `strict_checks` it aborts instead.
    pub fn deallocate(&self, address: Address) -> HeapResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (s, q) = self.locate(state, address)?;

        {
            let subzone = &state.subzones[s];
            if subzone.is_free(q) {
                warn!("double free of block at 0x{address:x}");
                if self.config.strict_checks {
                    corruption_abort(format_args!("double free of block at 0x{address:x}"));
                }
                return Err(HeapError::DoubleFree { address });
            }
            if !subzone.is_start(q) {
                return Err(HeapError::NotBlockStart { address });
            }
        }

        let n = state.subzones[s].block_len(q);
        let bytes = n << self.config.quantum_log2;
        state.overflow.remove(&address);

        let mut start = q;
        let mut quanta = n;
        let mut purged = false;

        if !self.config.guard_pages {
            // Forward: merge with the free node that begins where this
            // block ends, evicting it from its bucket
            let end = q + n;
            if end < state.subzones[s].allocation_limit() && state.subzones[s].is_free(end) {
                let next_size = state.subzones[s].read_node(end).size as usize;
                let next_quanta = self.checked_quanta(s, end, next_size);
                let bucket = state.cache.bucket_for(next_quanta);
                state
                    .cache
                    .bucket_mut(bucket)
                    .remove(&mut state.subzones, NodeRef::new(s, end));
                purged |= state.subzones[s].is_purged_node(end);
                quanta += next_quanta;
            }
            // Backward: the predecessor's size_again sits just below
            // this block
            if start > 0 && state.subzones[s].is_free(start - 1) {
                let prev_size = state.subzones[s].read_trailing_size(start) as usize;
                let prev_quanta = self.checked_quanta(s, start, prev_size);
                if prev_quanta > start {
                    corruption_abort(format_args!(
                        "free node trailer below 0x{address:x} spans outside its subzone"
                    ));
                }
                let prev_start = start - prev_quanta;
                let bucket = state.cache.bucket_for(prev_quanta);
                state
                    .cache
                    .bucket_mut(bucket)
                    .remove(&mut state.subzones, NodeRef::new(s, prev_start));
                purged |= state.subzones[s].is_purged_node(prev_start);
                start = prev_start;
                quanta += prev_quanta;
            }
        }

        let subzone = &mut state.subzones[s];
        if start + quanta == subzone.allocation_count() {
            // The range reaches the high-water mark: give it back to
            // the tail instead of listing it
            subzone.lower_allocation_count(quanta);
            subzone.clear_range_bits(start, quanta);
            if purged {
                subzone.set_purged(true);
            }
            if state.active != Some(s) && !subzone.is_purgeable() {
                subzone.set_purgeable(true);
                state.purgeable.push(s);
                info!("subzone {s} became purgeable");
            }
        } else {
            subzone.mark_free_range(start, quanta);
            if purged {
                subzone.set_purged_node(start, true);
            }
            let bucket = state.cache.bucket_for(quanta);
            state.cache.bucket_mut(bucket).push(
                &mut state.subzones,
                NodeRef::new(s, start),
                (quanta << self.config.quantum_log2) as u32,
            );
            if bucket != 0 && bucket > state.freelist_search_cap {
                state.freelist_search_cap = bucket;
            }
        }

        drop(guard);
        self.delegate.note_freed(bytes);
        Ok(())
    }

    /// A neighbor node's size word must be quantum-granular; anything
    /// else is a corrupted heap.
    fn checked_quanta(&self, s: usize, q: usize, size: usize) -> usize {
        let quantum = self.quantum_size();
        if size == 0 || size % quantum != 0 {
            corruption_abort(format_args!(
                "free node near subzone {s} quantum {q} has non-quantum size {size}"
            ));
        }
        size >> self.config.quantum_log2
    }

    fn locate(&self, state: &AdminState, address: Address) -> HeapResult<(usize, usize)> {
        for (s, subzone) in state.subzones.iter().enumerate() {
            if subzone.contains(address) {
                return match subzone.quantum_of(address) {
                    Some(q) => Ok((s, q)),
                    None => Err(HeapError::NotBlockStart { address }),
                };
            }
        }
        Err(HeapError::UnmanagedAddress { address })
    }

    // ------------------------------------------------------------------
    // batch and thread-cache allocation
    // ------------------------------------------------------------------

    /// Allocate up to `count` blocks of `size` bytes under one lock
    /// acquisition, splitting free nodes into as many pieces as they
    /// hold. A short result means the admin is exhausted.
    pub fn batch_allocate(&self, size: Size, clear: bool, count: usize) -> Vec<Address> {
        let Ok(n) = self.quanta_for_size(size) else {
            debug_assert!(false, "batch_allocate request exceeds the size class");
            return Vec::new();
        };
        let quantum_log2 = self.config.quantum_log2;
        let mut produced: Vec<(usize, usize)> = Vec::with_capacity(count);

        let mut guard = self.state.lock();
        let state = &mut *guard;

        // Drain the exact and larger buckets, then the catch-all
        let buckets: Vec<usize> = (n..self.config.cache_size()).chain([0]).collect();
        'drain: for k in buckets {
            while produced.len() < count {
                let Some(popped) = state.cache.bucket_mut(k).pop(&mut state.subzones) else {
                    break;
                };
                self.split_node(state, popped, n, count, &mut produced);
                if produced.len() == count {
                    break 'drain;
                }
            }
        }

        // Fall back to carving fresh tails
        while produced.len() < count {
            match self.carve_from_active(state, n, false) {
                Some((s, q, _)) => produced.push((s, q)),
                None => {
                    if !self.reactivate_purgeable(state) {
                        break;
                    }
                }
            }
        }

        let needs_enlivening = self.delegate.needs_enlivening();
        let mut out = Vec::with_capacity(produced.len());
        for (s, q) in produced {
            if clear {
                state.subzones[s].zero_quanta(q, n);
            }
            let address = state.subzones[s].quantum_address(q);
            if needs_enlivening {
                self.delegate.enliven(address);
            }
            out.push(address);
        }
        drop(guard);
        if !out.is_empty() {
            self.delegate.note_allocated(out.len() * (n << quantum_log2));
        }
        out
    }

    /// Split a popped node into `n`-quantum pieces, stopping at
    /// `count` produced blocks; the unused leftover goes back to its
    /// bucket.
    fn split_node(
        &self,
        state: &mut AdminState,
        popped: PoppedNode,
        n: usize,
        count: usize,
        produced: &mut Vec<(usize, usize)>,
    ) {
        let quantum_log2 = self.config.quantum_log2;
        let total_quanta = (popped.size as usize) >> quantum_log2;
        let s = popped.node.subzone();
        let q0 = popped.node.quantum();
        let purged = state.subzones[s].is_purged_node(q0);

        let pieces = (total_quanta / n).min(count - produced.len());
        debug_assert!(pieces >= 1);
        if purged {
            let address = state.subzones[s].quantum_address(q0);
            self.advisor.reuse(address, pieces * (n << quantum_log2));
        }
        for i in 0..pieces {
            let q = q0 + i * n;
            state.subzones[s].mark_allocated(q, n, self.config.layout, false);
            produced.push((s, q));
        }

        let used = pieces * n;
        if used < total_quanta {
            let remainder = total_quanta - used;
            let bucket = state.cache.bucket_for(remainder);
            let node = NodeRef::new(s, q0 + used);
            state.cache.bucket_mut(bucket).append(
                &mut state.subzones,
                node,
                (remainder << quantum_log2) as u32,
            );
            if purged {
                state.subzones[s].set_purged_node(q0 + used, true);
            }
            if bucket != 0 && bucket > state.freelist_search_cap {
                state.freelist_search_cap = bucket;
            }
        }
    }

    /// Pop from the caller's per-thread cache, refilling a whole batch
    /// under a single lock acquisition when it runs dry. Cached blocks
    /// stay tagged thread-local until they escape.
    pub fn thread_cache_allocate(&self, cache: &mut ThreadCache, size: Size) -> Option<Address> {
        let n = self.quanta_for_size(size).ok()?;
        if let Some(address) = cache.pop(n) {
            return Some(address);
        }
        let batch = self.config.thread_cache_batch;
        let mut refilled = 0;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for _ in 0..batch {
                match self.find_allocation_locked(state, n, true) {
                    Some(address) => {
                        cache.push(n, address);
                        refilled += 1;
                    }
                    None => break,
                }
            }
        }
        if refilled > 0 {
            debug!("thread cache refilled with {refilled} {n}-quantum blocks");
            self.delegate
                .note_allocated(refilled * (n << self.config.quantum_log2));
        }
        cache.pop(n)
    }

    // ------------------------------------------------------------------
    // compaction support
    // ------------------------------------------------------------------

    /// Find a same-size replacement block at a lower address, or hand
    /// the original back when none exists.
    pub fn allocate_lower_block(&self, address: Address) -> HeapResult<Address> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (s, q) = self.locate(state, address)?;
        let n = self.allocated_block_len(state, s, q, address)?;
        let bytes = (n << self.config.quantum_log2) as u32;

        let bucket_index = state.cache.bucket_for(n);
        let mut best: Option<(NodeRef, Address)> = None;
        for (node, size) in state.cache.bucket(bucket_index).nodes(&state.subzones) {
            if size != bytes {
                continue; // the catch-all bucket mixes sizes
            }
            let candidate = state.subzones[node.subzone()].quantum_address(node.quantum());
            if candidate < best.map_or(address, |(_, a)| a) {
                best = Some((node, candidate));
            }
        }
        let Some((node, lower)) = best else {
            return Ok(address);
        };

        state
            .cache
            .bucket_mut(bucket_index)
            .remove(&mut state.subzones, node);
        self.claim_removed(state, node, n);
        drop(guard);
        self.delegate.note_allocated(n << self.config.quantum_log2);
        Ok(lower)
    }

    /// Find a same-size replacement block at any different address, or
    /// hand the original back when the admin is exhausted.
    pub fn allocate_different_block(&self, address: Address) -> HeapResult<Address> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (s, q) = self.locate(state, address)?;
        let n = self.allocated_block_len(state, s, q, address)?;
        let Some(replacement) = self.find_allocation_locked(state, n, false) else {
            return Ok(address);
        };
        drop(guard);
        self.delegate.note_allocated(n << self.config.quantum_log2);
        Ok(replacement)
    }

    /// Compaction destination: scrambled admins randomize, everyone
    /// else slides blocks toward low addresses.
    pub fn allocate_destination_block(&self, address: Address) -> HeapResult<Address> {
        if self.config.scramble {
            self.allocate_different_block(address)
        } else {
            self.allocate_lower_block(address)
        }
    }

    fn allocated_block_len(
        &self,
        state: &AdminState,
        s: usize,
        q: usize,
        address: Address,
    ) -> HeapResult<usize> {
        let subzone = &state.subzones[s];
        if subzone.is_free(q) || !subzone.is_start(q) {
            return Err(HeapError::NotBlockStart { address });
        }
        Ok(subzone.block_len(q))
    }

    /// Stamp a node just removed from its bucket as an allocated block.
    fn claim_removed(&self, state: &mut AdminState, node: NodeRef, n: usize) {
        let s = node.subzone();
        let q = node.quantum();
        if state.subzones[s].is_purged_node(q) {
            let address = state.subzones[s].quantum_address(q);
            self.advisor.reuse(address, n << self.config.quantum_log2);
        }
        state.subzones[s].mark_allocated(q, n, self.config.layout, false);
    }

    // ------------------------------------------------------------------
    // purge accounting
    // ------------------------------------------------------------------

    /// Bytes that purge_free_space would hint discardable right now.
    pub fn purgeable_free_space(&self) -> Size {
        let guard = self.state.lock();
        let threshold = self.config.purge_threshold;
        let mut total = 0;
        for (_, bucket) in guard.cache.buckets() {
            for (_, size) in bucket.nodes(&guard.subzones) {
                if size as usize > threshold {
                    total += size as usize;
                }
            }
        }
        for &index in &guard.purgeable {
            if let Some((_, bytes)) = guard.subzones[index].purgeable_range() {
                total += bytes;
            }
        }
        total
    }

    /// Hint every page-worthy free range discardable to the OS.
    /// Idempotent: already-purged ranges are skipped; returns the
    /// bytes newly hinted.
    pub fn purge_free_space(&self) -> Size {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let threshold = self.config.purge_threshold;
        let mut total = 0;

        for k in 0..state.cache.cache_size() {
            let nodes = state.cache.bucket(k).nodes(&state.subzones);
            for (node, size) in nodes {
                let s = node.subzone();
                let q = node.quantum();
                if size as usize > threshold && !state.subzones[s].is_purged_node(q) {
                    let address = state.subzones[s].quantum_address(q);
                    self.advisor.discard(address, size as usize);
                    state.subzones[s].set_purged_node(q, true);
                    total += size as usize;
                }
            }
        }

        let purgeable = state.purgeable.clone();
        for index in purgeable {
            let subzone = &mut state.subzones[index];
            if subzone.is_purged() {
                continue;
            }
            if let Some((address, bytes)) = subzone.purgeable_range() {
                self.advisor.discard(address, bytes);
                subzone.set_purged(true);
                total += bytes;
            }
        }

        if total > 0 {
            info!("purge hinted {total} bytes discardable");
        }
        total
    }

    // ------------------------------------------------------------------
    // maintenance and introspection
    // ------------------------------------------------------------------

    /// Empty every bucket, returning the covered quanta to the
    /// neither-free-nor-allocated state. The collector rebuilds the
    /// lists as it sweeps.
    pub fn reset_free_list(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let quantum_log2 = self.config.quantum_log2;
        for k in 0..state.cache.cache_size() {
            while let Some(popped) = state.cache.bucket_mut(k).pop(&mut state.subzones) {
                let quanta = (popped.size as usize) >> quantum_log2;
                state.subzones[popped.node.subzone()]
                    .clear_range_bits(popped.node.quantum(), quanta);
            }
        }
        state.freelist_search_cap = 0;
        debug!("free lists reset");
    }

    /// Walk every bucket checking node structure, sizes against the
    /// bucket's class, and the search-cap invariant. Non-fatal; logs
    /// and returns false on the first violation.
    pub fn test_freelist_integrity(&self) -> bool {
        let guard = self.state.lock();
        let quantum_log2 = self.config.quantum_log2;
        for (k, bucket) in guard.cache.buckets() {
            if k != 0 && k > guard.freelist_search_cap && !bucket.is_empty() {
                error!("free list integrity: bucket {k} is populated above the search cap");
                return false;
            }
            let nodes = match bucket.check(&guard.subzones) {
                Ok(nodes) => nodes,
                Err(diag) => {
                    error!("free list integrity: bucket {k}: {diag}");
                    return false;
                }
            };
            for (node, size) in nodes {
                let quanta = (size as usize) >> quantum_log2;
                let sized_right = if k == 0 { quanta >= 1 } else { quanta == k };
                if !sized_right {
                    error!(
                        "free list integrity: bucket {k} holds a {quanta}-quantum node \
                         at subzone {} quantum {}",
                        node.subzone(),
                        node.quantum()
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Bytes sitting on buckets plus never-carved subzone tails.
    pub fn free_space(&self) -> Size {
        let guard = self.state.lock();
        let mut total = 0;
        for (_, bucket) in guard.cache.buckets() {
            for (_, size) in bucket.nodes(&guard.subzones) {
                total += size as usize;
            }
        }
        for subzone in &guard.subzones {
            total += subzone.remaining_quanta() << self.config.quantum_log2;
        }
        total
    }

    pub fn stats(&self) -> AdminStats {
        let guard = self.state.lock();
        let mut free_list_bytes = 0;
        for (_, bucket) in guard.cache.buckets() {
            for (_, size) in bucket.nodes(&guard.subzones) {
                free_list_bytes += size as usize;
            }
        }
        let mut unused_tail_bytes = 0;
        for subzone in &guard.subzones {
            unused_tail_bytes += subzone.remaining_quanta() << self.config.quantum_log2;
        }
        let mut purgeable_bytes = 0;
        for (_, bucket) in guard.cache.buckets() {
            for (_, size) in bucket.nodes(&guard.subzones) {
                if size as usize > self.config.purge_threshold {
                    purgeable_bytes += size as usize;
                }
            }
        }
        for &index in &guard.purgeable {
            if let Some((_, bytes)) = guard.subzones[index].purgeable_range() {
                purgeable_bytes += bytes;
            }
        }
        AdminStats {
            quantum_size: self.quantum_size(),
            cache_size: self.cache_size(),
            subzone_count: guard.subzones.len(),
            purgeable_subzones: guard.purgeable.len(),
            free_list_bytes,
            unused_tail_bytes,
            purgeable_bytes,
            overflow_entries: guard.overflow.len(),
        }
    }

    /// Size in bytes of the allocated block at `address`, if any.
    pub fn block_size(&self, address: Address) -> Option<Size> {
        let guard = self.state.lock();
        let (s, q) = self.locate(&guard, address).ok()?;
        let subzone = &guard.subzones[s];
        if subzone.is_free(q) || !subzone.is_start(q) {
            return None;
        }
        Some(subzone.block_len(q) << self.config.quantum_log2)
    }

    /// Whether `address` is the start of a live allocated block.
    pub fn is_block_start(&self, address: Address) -> bool {
        self.block_size(address).is_some()
    }
}

/// Per-thread stash of pre-allocated blocks, refilled in batches so
/// the allocation hot path skips the admin lock.
///
/// Owned by the calling thread; the admin only fills it.
pub struct ThreadCache {
    buckets: Vec<Vec<Address>>,
}

impl ThreadCache {
    pub fn new(cache_size: usize) -> ThreadCache {
        ThreadCache {
            buckets: vec![Vec::new(); cache_size],
        }
    }

    /// A cache sized for `admin`'s bucket array
    pub fn for_admin(admin: &Admin) -> ThreadCache {
        ThreadCache::new(admin.cache_size())
    }

    fn pop(&mut self, n: usize) -> Option<Address> {
        self.buckets[n].pop()
    }

    fn push(&mut self, n: usize, address: Address) {
        self.buckets[n].push(address);
    }

    /// Blocks currently idle in the cache
    pub fn cached_blocks(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}
