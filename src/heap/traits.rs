/*!
 * Heap Traits
 * Capability seams between the engine and its zone/collector
 */

use crate::core::types::{Address, Size};

/// Callbacks an admin raises toward the owning zone and its collector.
///
/// The zone supplies new subzones when allocation returns `None`; the
/// rest of the protocol flows through this trait: enlivening during a
/// concurrent collection phase, escape notification when a block gains
/// its first reference, and byte accounting.
pub trait ZoneDelegate: Send + Sync {
    /// Whether freshly allocated blocks must be enlivened right now
    fn needs_enlivening(&self) -> bool {
        false
    }

    /// Record a freshly allocated block with the in-progress collection
    fn enliven(&self, _address: Address) {}

    /// A block transitioned from thread-local to globally referenced
    fn block_escaped(&self, _address: Address) {}

    /// Bytes handed out to callers
    fn note_allocated(&self, _bytes: Size) {}

    /// Bytes returned to the free lists or subzone tails
    fn note_freed(&self, _bytes: Size) {}
}

/// Zone delegate that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl ZoneDelegate for NoopDelegate {}

/// Advisory page-hint sink.
///
/// Only the intent is modeled here; the embedder maps `discard` and
/// `reuse` onto whatever the platform offers (madvise, VirtualAlloc
/// reset, or nothing at all).
pub trait PageAdvisor: Send + Sync {
    /// The range's contents may be discarded without releasing the mapping
    fn discard(&self, address: Address, size: Size);

    /// The range is about to be reissued and must be backed again
    fn reuse(&self, address: Address, size: Size);
}

/// Page advisor that drops every hint
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAdvisor;

impl PageAdvisor for NoopAdvisor {
    fn discard(&self, _address: Address, _size: Size) {}
    fn reuse(&self, _address: Address, _size: Size) {}
}
