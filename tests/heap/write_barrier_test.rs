/*!
 * Write Barrier Tests
 * Card marking, coalesced scans, and the lock-free two-phase reset
 */

use pretty_assertions::assert_eq;
use quantum_heap::WriteBarrier;
use serial_test::serial;
use std::sync::{Arc, Barrier};
use std::thread;

const CARD: usize = 128;
const BASE: usize = 0x40_0000;

fn collect_ranges(barrier: &WriteBarrier, address: usize, size: usize) -> Vec<(usize, usize)> {
    let mut visits = Vec::new();
    barrier.scan_marked_ranges(address, size, |a, s| visits.push((a, s)));
    visits
}

#[test]
fn marked_cards_are_visible() {
    let barrier = WriteBarrier::new(BASE, 256 * CARD);
    assert!(!barrier.is_card_marked(BASE + 5 * CARD));
    barrier.mark_card(BASE + 5 * CARD + 17);
    assert!(barrier.is_card_marked(BASE + 5 * CARD));
    assert!(barrier.is_card_marked(BASE + 5 * CARD + 127));
    assert!(!barrier.is_card_marked(BASE + 6 * CARD));
}

#[test]
fn disjoint_runs_visit_the_visitor_once_each() {
    let barrier = WriteBarrier::new(BASE, 256 * CARD);
    barrier.mark_card(BASE + 2 * CARD);
    barrier.mark_card(BASE + 5 * CARD + 37);

    let visits = collect_ranges(&barrier, BASE, 256 * CARD);
    assert_eq!(
        visits,
        vec![(BASE + 2 * CARD, CARD), (BASE + 5 * CARD, CARD)]
    );
}

#[test]
fn adjacent_cards_coalesce_into_one_run() {
    let barrier = WriteBarrier::new(BASE, 256 * CARD);
    barrier.mark_card(BASE + 7 * CARD);
    barrier.mark_card(BASE + 8 * CARD);
    barrier.mark_card(BASE + 9 * CARD);

    let visits = collect_ranges(&barrier, BASE, 256 * CARD);
    assert_eq!(visits, vec![(BASE + 7 * CARD, 3 * CARD)]);
}

#[test]
fn range_queries_respect_their_bounds() {
    let barrier = WriteBarrier::new(BASE, 256 * CARD);
    barrier.mark_card(BASE + 10 * CARD);
    assert!(barrier.range_has_marked_cards(BASE + 10 * CARD, 1));
    assert!(barrier.range_has_marked_cards(BASE, 256 * CARD));
    assert!(!barrier.range_has_marked_cards(BASE, 10 * CARD));
    assert!(!barrier.range_has_marked_cards(BASE + 11 * CARD, 8 * CARD));
}

#[test]
fn two_phase_reset_clears_quiescent_cards() {
    let barrier = WriteBarrier::new(BASE, 64 * CARD);
    barrier.mark_card(BASE + CARD);
    barrier.mark_card(BASE + 3 * CARD);

    barrier.mark_cards_untouched();
    // Phase one demotes but does not clear: still marked for queries
    assert!(barrier.is_card_marked(BASE + CARD));

    barrier.clear_untouched_cards();
    assert!(!barrier.is_card_marked(BASE + CARD));
    assert!(!barrier.is_card_marked(BASE + 3 * CARD));
    assert!(collect_ranges(&barrier, BASE, 64 * CARD).is_empty());
}

#[test]
fn a_mark_between_the_phases_survives() {
    let barrier = WriteBarrier::new(BASE, 64 * CARD);
    barrier.mark_card(BASE + CARD);
    barrier.mark_card(BASE + 3 * CARD);

    barrier.mark_cards_untouched();
    // A mutator re-dirties one card inside the window
    barrier.mark_card(BASE + 3 * CARD);
    barrier.clear_untouched_cards();

    assert!(!barrier.is_card_marked(BASE + CARD));
    assert!(barrier.is_card_marked(BASE + 3 * CARD));
}

#[test]
#[serial]
fn concurrent_marks_are_never_lost() {
    let barrier = Arc::new(WriteBarrier::new(BASE, 64 * CARD));

    for round in 0..200 {
        let card = BASE + (round % 64) * CARD;
        barrier.mark_card(card);
        barrier.mark_cards_untouched();

        // A mutator thread marks strictly inside the reset window
        let rendezvous = Arc::new(Barrier::new(2));
        let mutator = {
            let barrier = Arc::clone(&barrier);
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || {
                rendezvous.wait();
                barrier.mark_card(card);
                rendezvous.wait();
            })
        };
        rendezvous.wait(); // window open
        rendezvous.wait(); // mutator done marking
        barrier.clear_untouched_cards();
        mutator.join().unwrap();

        assert!(
            barrier.is_card_marked(card),
            "round {round}: concurrent mark was lost"
        );
        // Reset for the next round
        barrier.mark_cards_untouched();
        barrier.clear_untouched_cards();
    }
}

#[test]
fn protected_prefix_is_excluded_from_scans() {
    let barrier = WriteBarrier::with_protected_prefix(BASE, 64 * CARD, 4 * CARD);
    barrier.mark_card(BASE + 4 * CARD);
    barrier.mark_card(BASE + 5 * CARD);

    let visits = collect_ranges(&barrier, BASE, 64 * CARD);
    assert_eq!(visits, vec![(BASE + 4 * CARD, 2 * CARD)]);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "protected prefix")]
fn marking_the_protected_prefix_is_a_precondition_violation() {
    let barrier = WriteBarrier::with_protected_prefix(BASE, 64 * CARD, 4 * CARD);
    barrier.mark_card(BASE + CARD);
}
