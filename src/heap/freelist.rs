/*!
 * Free List
 * Intrusive doubly-linked list of free blocks, overlaid on arena memory
 *
 * A free block's first three words hold {prev, next, size} and its last
 * word repeats the size, so backward coalescing can find the node start
 * from the following block. Links are packed 32-bit references: the
 * high bits index the owning subzone within its admin, the low
 * NODE_QUANTUM_BITS hold the quantum index. A node is only valid while
 * its quanta are marked free in their subzone; every pop and removal is
 * integrity-checked before the node is trusted.
 */

use crate::core::limits::NODE_QUANTUM_BITS;
use crate::heap::subzone::Subzone;
use crate::heap::types::corruption_abort;

/// Packed reference to a free-list node: (subzone index, quantum index)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef(u32);

impl NodeRef {
    pub(crate) const NONE: NodeRef = NodeRef(u32::MAX);

    pub(crate) fn new(subzone: usize, quantum: usize) -> NodeRef {
        debug_assert!(quantum < (1 << NODE_QUANTUM_BITS));
        debug_assert!(subzone < (1 << (32 - NODE_QUANTUM_BITS)) - 1);
        NodeRef(((subzone as u32) << NODE_QUANTUM_BITS) | quantum as u32)
    }

    pub(crate) fn from_raw(raw: u32) -> NodeRef {
        NodeRef(raw)
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn is_none(self) -> bool {
        self == NodeRef::NONE
    }

    pub(crate) fn subzone(self) -> usize {
        (self.0 >> NODE_QUANTUM_BITS) as usize
    }

    pub(crate) fn quantum(self) -> usize {
        (self.0 & ((1 << NODE_QUANTUM_BITS) - 1)) as usize
    }
}

/// Node words as they sit in arena memory
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawNode {
    pub prev: u32,
    pub next: u32,
    pub size: u32,
}

/// A node popped or removed from its bucket
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoppedNode {
    pub node: NodeRef,
    pub size: u32,
}

/// Check a node without aborting; returns its words or a diagnosis.
///
/// Validity requires in-bounds references, free quanta under the whole
/// block, a quantum-granular size, and matching size/size_again words.
pub(crate) fn check_node(subzones: &[Subzone], node: NodeRef) -> Result<RawNode, String> {
    let (sz, q) = resolve(subzones, node)
        .ok_or_else(|| format!("node ref {:#x} out of bounds", node.raw()))?;
    if !sz.is_free(q) {
        return Err(format!(
            "node at 0x{:x} sits on a quantum not marked free",
            sz.quantum_address(q)
        ));
    }
    let raw = sz.read_node(q);
    let quantum = sz.quantum_size() as u32;
    if raw.size < quantum || raw.size % quantum != 0 {
        return Err(format!(
            "node at 0x{:x} has non-quantum size {}",
            sz.quantum_address(q),
            raw.size
        ));
    }
    let n = (raw.size / quantum) as usize;
    if q + n > sz.allocation_limit() {
        return Err(format!(
            "node at 0x{:x} spans past its subzone ({} quanta at {})",
            sz.quantum_address(q),
            n,
            q
        ));
    }
    if !sz.is_free(q + n - 1) {
        return Err(format!(
            "node at 0x{:x} ends on a quantum not marked free",
            sz.quantum_address(q)
        ));
    }
    let again = sz.read_size_again(q, raw.size);
    if again != raw.size {
        return Err(format!(
            "node at 0x{:x} size mismatch: size={} size_again={}",
            sz.quantum_address(q),
            raw.size,
            again
        ));
    }
    for (label, link) in [("prev", raw.prev), ("next", raw.next)] {
        let link = NodeRef::from_raw(link);
        if link.is_none() {
            continue;
        }
        let (lsz, lq) = resolve(subzones, link).ok_or_else(|| {
            format!(
                "node at 0x{:x} has dangling {label} link {:#x}",
                sz.quantum_address(q),
                link.raw()
            )
        })?;
        let neighbor = lsz.read_node(lq);
        let back = if label == "prev" { neighbor.next } else { neighbor.prev };
        if back != node.raw() {
            return Err(format!(
                "node at 0x{:x} {label} link does not point back (0x{:x} -> {:#x})",
                sz.quantum_address(q),
                lsz.quantum_address(lq),
                back
            ));
        }
    }
    Ok(raw)
}

/// Integrity-check a node; corruption here is fatal.
pub(crate) fn validate_node(subzones: &[Subzone], node: NodeRef) -> RawNode {
    match check_node(subzones, node) {
        Ok(raw) => raw,
        Err(diag) => corruption_abort(format_args!("free list: {diag}")),
    }
}

fn resolve(subzones: &[Subzone], node: NodeRef) -> Option<(&Subzone, usize)> {
    let sz = subzones.get(node.subzone())?;
    let q = node.quantum();
    if q >= sz.allocation_limit() {
        return None;
    }
    Some((sz, q))
}

/// One free-list bucket: nodes linked through their own storage.
#[derive(Debug, Clone)]
pub(crate) struct FreeList {
    head: NodeRef,
    tail: NodeRef,
    count: usize,
}

impl FreeList {
    pub(crate) fn new() -> FreeList {
        FreeList {
            head: NodeRef::NONE,
            tail: NodeRef::NONE,
            count: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    /// Create a node over `size` bytes of free memory at `node` and
    /// link it at the head. The quanta must already be marked free.
    pub(crate) fn push(&mut self, subzones: &mut [Subzone], node: NodeRef, size: u32) {
        let old_head = self.head;
        subzones[node.subzone()].write_node(
            node.quantum(),
            RawNode {
                prev: NodeRef::NONE.raw(),
                next: old_head.raw(),
                size,
            },
        );
        if old_head.is_none() {
            self.tail = node;
        } else {
            subzones[old_head.subzone()].set_node_prev(old_head.quantum(), node.raw());
        }
        self.head = node;
        self.count += 1;
    }

    /// Like push, but links at the tail.
    pub(crate) fn append(&mut self, subzones: &mut [Subzone], node: NodeRef, size: u32) {
        let old_tail = self.tail;
        subzones[node.subzone()].write_node(
            node.quantum(),
            RawNode {
                prev: old_tail.raw(),
                next: NodeRef::NONE.raw(),
                size,
            },
        );
        if old_tail.is_none() {
            self.head = node;
        } else {
            subzones[old_tail.subzone()].set_node_next(old_tail.quantum(), node.raw());
        }
        self.tail = node;
        self.count += 1;
    }

    /// Pop the head node. The node is integrity-checked before use;
    /// the caller owns the underlying quanta afterwards.
    pub(crate) fn pop(&mut self, subzones: &mut [Subzone]) -> Option<PoppedNode> {
        if self.head.is_none() {
            return None;
        }
        let node = self.head;
        let raw = validate_node(subzones, node);
        if !NodeRef::from_raw(raw.prev).is_none() {
            corruption_abort(format_args!(
                "free list: head node at subzone {} quantum {} has a predecessor",
                node.subzone(),
                node.quantum()
            ));
        }
        self.unlink(subzones, node, raw);
        Some(PoppedNode {
            node,
            size: raw.size,
        })
    }

    /// Evict an arbitrary node (coalescing, compaction scans).
    pub(crate) fn remove(&mut self, subzones: &mut [Subzone], node: NodeRef) -> PoppedNode {
        let raw = validate_node(subzones, node);
        if NodeRef::from_raw(raw.prev).is_none() && self.head != node {
            corruption_abort(format_args!(
                "free list: unlinked node at subzone {} quantum {} is not the bucket head",
                node.subzone(),
                node.quantum()
            ));
        }
        if NodeRef::from_raw(raw.next).is_none() && self.tail != node {
            corruption_abort(format_args!(
                "free list: unlinked node at subzone {} quantum {} is not the bucket tail",
                node.subzone(),
                node.quantum()
            ));
        }
        self.unlink(subzones, node, raw);
        PoppedNode {
            node,
            size: raw.size,
        }
    }

    fn unlink(&mut self, subzones: &mut [Subzone], node: NodeRef, raw: RawNode) {
        let prev = NodeRef::from_raw(raw.prev);
        let next = NodeRef::from_raw(raw.next);
        if prev.is_none() {
            self.head = next;
        } else {
            subzones[prev.subzone()].set_node_next(prev.quantum(), next.raw());
        }
        if next.is_none() {
            self.tail = prev;
        } else {
            subzones[next.subzone()].set_node_prev(next.quantum(), prev.raw());
        }
        self.count -= 1;
    }

    /// Walk the list, collecting (node, size) pairs. Non-destructive;
    /// used by stats, purge visits, and the integrity walker.
    pub(crate) fn nodes(&self, subzones: &[Subzone]) -> Vec<(NodeRef, u32)> {
        let mut out = Vec::with_capacity(self.count);
        let mut cur = self.head;
        while !cur.is_none() {
            if out.len() > self.count {
                corruption_abort(format_args!(
                    "free list: cycle detected walking bucket (len {})",
                    self.count
                ));
            }
            let raw = subzones[cur.subzone()].read_node(cur.quantum());
            out.push((cur, raw.size));
            cur = NodeRef::from_raw(raw.next);
        }
        out
    }

    /// Non-fatal structural check; returns the nodes on success.
    pub(crate) fn check(&self, subzones: &[Subzone]) -> Result<Vec<(NodeRef, u32)>, String> {
        let mut out = Vec::with_capacity(self.count);
        let mut cur = self.head;
        let mut prev = NodeRef::NONE;
        while !cur.is_none() {
            if out.len() > self.count {
                return Err(format!("cycle detected walking bucket of len {}", self.count));
            }
            let raw = check_node(subzones, cur)?;
            if raw.prev != prev.raw() {
                return Err(format!(
                    "node at subzone {} quantum {} prev link skew",
                    cur.subzone(),
                    cur.quantum()
                ));
            }
            out.push((cur, raw.size));
            prev = cur;
            cur = NodeRef::from_raw(raw.next);
        }
        if self.tail != prev {
            return Err("bucket tail does not match the last node".to_string());
        }
        if out.len() != self.count {
            return Err(format!(
                "bucket count {} disagrees with walked length {}",
                self.count,
                out.len()
            ));
        }
        Ok(out)
    }
}
