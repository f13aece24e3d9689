/*!
 * Write Barrier
 * Per-region card table for generational scanning
 *
 * One byte covers each 128-byte card. The store barrier marks the
 * card of a mutated pointer field; the collector scans maximal runs
 * of marked cards and resets the table in two lock-free phases, so a
 * mutation landing between the phases is never silently lost. The
 * reset must stay CAS-based: a mutex here would stall every mutator
 * and reintroduce the lost-mutation race.
 */

use crate::core::limits::{CARD_SIZE, CARD_SIZE_LOG2};
use crate::core::types::{Address, Size};
use std::sync::atomic::{AtomicU8, Ordering};

const CARD_UNMARKED: u8 = 0;
/// Phase-one state: was marked, not yet re-touched by a mutator
const CARD_MARKED_UNTOUCHED: u8 = 1;
const CARD_MARKED: u8 = 2;

/// Card table over `[base, base + size)`, with an optional protected
/// prefix that is never scanned or marked.
pub struct WriteBarrier {
    base: Address,
    size: Size,
    protect: Size,
    cards: Box<[AtomicU8]>,
}

impl WriteBarrier {
    pub fn new(base: Address, size: Size) -> WriteBarrier {
        WriteBarrier::with_protected_prefix(base, size, 0)
    }

    /// A barrier whose first `protect` bytes (card-granular) hold
    /// metadata the collector must never treat as heap memory.
    pub fn with_protected_prefix(base: Address, size: Size, protect: Size) -> WriteBarrier {
        assert!(size > 0, "write barrier over an empty range");
        assert!(
            protect % CARD_SIZE == 0,
            "protected prefix must be card-granular"
        );
        assert!(protect < size, "protected prefix swallows the region");
        let count = (size + CARD_SIZE - 1) >> CARD_SIZE_LOG2;
        let cards = (0..count).map(|_| AtomicU8::new(CARD_UNMARKED)).collect();
        WriteBarrier {
            base,
            size,
            protect,
            cards,
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.base + self.size
    }

    /// Card covering `address`; the address must be in range.
    pub fn card_index(&self, address: Address) -> usize {
        debug_assert!(self.contains(address));
        (address - self.base) >> CARD_SIZE_LOG2
    }

    /// First address covered by card `index`.
    pub fn card_address(&self, index: usize) -> Address {
        debug_assert!(index < self.cards.len());
        self.base + (index << CARD_SIZE_LOG2)
    }

    fn first_markable_card(&self) -> usize {
        self.protect >> CARD_SIZE_LOG2
    }

    /// Record a pointer store into the card covering `address`.
    ///
    /// Invoked (transitively) from the runtime's store barrier; the
    /// mutated field's card is marked, never the target's.
    pub fn mark_card(&self, address: Address) {
        debug_assert!(self.contains(address));
        debug_assert!(
            address >= self.base + self.protect,
            "protected prefix is never marked"
        );
        self.cards[self.card_index(address)].store(CARD_MARKED, Ordering::Release);
    }

    pub fn is_card_marked(&self, address: Address) -> bool {
        self.cards[self.card_index(address)].load(Ordering::Acquire) != CARD_UNMARKED
    }

    pub fn range_has_marked_cards(&self, address: Address, size: Size) -> bool {
        let mut found = false;
        self.scan_marked_ranges(address, size, |_, _| found = true);
        found
    }

    /// Visit every maximal run of marked cards intersecting
    /// `[address, address + size)`, coalesced: one call per run, with
    /// the run clipped to the requested span.
    pub fn scan_marked_ranges(
        &self,
        address: Address,
        size: Size,
        mut visitor: impl FnMut(Address, Size),
    ) {
        let start = address.max(self.base + self.protect);
        let end = (address + size).min(self.base + self.size);
        if start >= end {
            return;
        }
        let first = self.card_index(start);
        let last = self.card_index(end - 1);

        let mut run_start: Option<usize> = None;
        for index in first..=last {
            let marked = self.cards[index].load(Ordering::Acquire) != CARD_UNMARKED;
            match (marked, run_start) {
                (true, None) => run_start = Some(index),
                (false, Some(begin)) => {
                    self.visit_run(begin, index - 1, start, end, &mut visitor);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(begin) = run_start {
            self.visit_run(begin, last, start, end, &mut visitor);
        }
    }

    fn visit_run(
        &self,
        first: usize,
        last: usize,
        clip_start: Address,
        clip_end: Address,
        visitor: &mut impl FnMut(Address, Size),
    ) {
        let run_start = self.card_address(first).max(clip_start);
        let run_end = (self.card_address(last) + CARD_SIZE).min(clip_end);
        visitor(run_start, run_end - run_start);
    }

    /// Phase one of the reset: atomically demote every fully-marked
    /// card to "untouched". Concurrent mutators keep storing the
    /// fully-marked state, so nothing they touch afterwards stays
    /// demoted.
    pub fn mark_cards_untouched(&self) {
        for card in &self.cards[self.first_markable_card()..] {
            let _ = card.compare_exchange(
                CARD_MARKED,
                CARD_MARKED_UNTOUCHED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Phase two: atomically clear only cards still "untouched". A
    /// card re-marked during the window between the phases fails the
    /// exchange and survives fully marked.
    pub fn clear_untouched_cards(&self) {
        for card in &self.cards[self.first_markable_card()..] {
            let _ = card.compare_exchange(
                CARD_MARKED_UNTOUCHED,
                CARD_UNMARKED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }
}
