/*!
 * Admin Tests
 * Allocation order, bucket behavior, batch and thread-cache paths
 */

use crate::support::{admin_with_config_and_subzone, admin_with_subzone, RecordingDelegate};
use pretty_assertions::assert_eq;
use quantum_heap::{Admin, AdminConfig, HeapError, Subzone};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::Ordering;

#[test]
fn admin_initialization() {
    let admin = Admin::new(AdminConfig::default()).unwrap();
    assert_eq!(admin.quantum_size(), 16);
    assert_eq!(admin.cache_size(), 65);
    // No subzones yet: exhaustion is expected flow, not an error
    assert_eq!(admin.find_allocation(16), None);
    assert_eq!(admin.free_space(), 0);
}

#[test]
fn config_validation_rejects_nonsense() {
    let config = AdminConfig {
        quantum_log2: 2,
        ..AdminConfig::default()
    };
    assert!(matches!(
        Admin::new(config),
        Err(HeapError::InvalidConfig(_))
    ));
}

#[test]
fn carving_is_sequential_from_the_tail() {
    let admin = admin_with_subzone(1024);
    let a = admin.find_allocation(48).unwrap();
    let b = admin.find_allocation(80).unwrap();
    let c = admin.find_allocation(16).unwrap();
    assert_eq!(b, a + 48);
    assert_eq!(c, a + 128);
    assert_eq!(admin.block_size(a), Some(48));
    assert_eq!(admin.block_size(b), Some(80));
    assert!(admin.is_block_start(b));
    assert!(!admin.is_block_start(a + 16));
}

#[test]
fn oversized_requests_belong_to_the_large_allocator() {
    let admin = admin_with_subzone(1024);
    assert!(matches!(
        admin.quanta_for_size(65 * 16),
        Err(HeapError::OversizedRequest { requested: 65, maximum: 64 })
    ));
    assert_eq!(admin.find_allocation(65 * 16), None);
    // The ceiling itself is still served
    assert!(admin.find_allocation(64 * 16).is_some());
}

#[test]
fn freed_block_is_reissued_at_the_identical_address() {
    let admin = admin_with_subzone(1024);
    let a = admin.find_allocation(80).unwrap();
    let _sentinel = admin.find_allocation(16).unwrap();
    admin.deallocate(a).unwrap();
    assert!(admin.test_freelist_integrity());
    // No intervening activity: exact-fit pops the same block back
    assert_eq!(admin.find_allocation(80), Some(a));
}

#[test]
fn segregated_buckets_serve_exact_sizes() {
    // quantum 16, cache_size 65: carve A(3), B(5), C(2) plus a
    // sentinel so no block touches the high-water mark
    let admin = admin_with_subzone(1024);
    let a = admin.find_allocation(3 * 16).unwrap();
    let b = admin.find_allocation(5 * 16).unwrap();
    let c = admin.find_allocation(2 * 16).unwrap();
    let _sentinel = admin.find_allocation(16).unwrap();

    admin.deallocate(b).unwrap();
    assert!(admin.test_freelist_integrity());
    assert_eq!(admin.stats().free_list_bytes, 5 * 16);

    // Exact fit from bucket 5, no new tail carve
    assert_eq!(admin.find_allocation(5 * 16), Some(b));

    // A and C are not adjacent to anything free; they land in
    // buckets 3 and 2 without merging into B's reallocated span
    admin.deallocate(a).unwrap();
    admin.deallocate(c).unwrap();
    assert!(admin.test_freelist_integrity());
    assert_eq!(admin.stats().free_list_bytes, 3 * 16 + 2 * 16);
    assert_eq!(admin.find_allocation(3 * 16), Some(a));
    assert_eq!(admin.find_allocation(2 * 16), Some(c));
}

#[test]
fn best_fit_scan_returns_the_remainder() {
    // A subzone too short to stay active: its 32 quanta land in
    // bucket 32 immediately
    let admin = Admin::new(AdminConfig::default()).unwrap();
    admin.manage_subzone(Subzone::new(4, 32));
    assert_eq!(admin.stats().free_list_bytes, 32 * 16);

    let a = admin.find_allocation(16).unwrap();
    assert!(admin.test_freelist_integrity());
    // One quantum came off the node, 31 went back to bucket 31
    assert_eq!(admin.stats().free_list_bytes, 31 * 16);
    assert_eq!(admin.find_allocation(16), Some(a + 16));
}

#[test]
fn exhaustion_then_reattach_retries_cleanly() {
    let admin = Admin::new(AdminConfig::default()).unwrap();
    admin.manage_subzone(Subzone::new(4, 80));
    // Drain the admin completely
    while admin.find_allocation(64 * 16).is_some() {}
    let exhausted = admin.find_allocation(64 * 16);
    assert_eq!(exhausted, None);

    // The zone responds by attaching fresh address space
    admin.manage_subzone(Subzone::new(4, 1024));
    assert!(admin.find_allocation(64 * 16).is_some());
    assert!(admin.test_freelist_integrity());
}

#[test]
fn double_free_is_diagnosed_without_corruption() {
    let admin = admin_with_subzone(1024);
    let a = admin.find_allocation(48).unwrap();
    let _sentinel = admin.find_allocation(16).unwrap();
    admin.deallocate(a).unwrap();
    assert_eq!(
        admin.deallocate(a),
        Err(HeapError::DoubleFree { address: a })
    );
    // The free list is intact and the block reissues normally
    assert!(admin.test_freelist_integrity());
    assert_eq!(admin.find_allocation(48), Some(a));
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal_under_strict_checks() {
    let config = AdminConfig {
        strict_checks: true,
        ..AdminConfig::default()
    };
    let admin = admin_with_config_and_subzone(config, 1024);
    let a = admin.find_allocation(48).unwrap();
    let _sentinel = admin.find_allocation(16).unwrap();
    admin.deallocate(a).unwrap();
    let _ = admin.deallocate(a);
}

#[test]
fn bogus_deallocations_are_rejected() {
    let admin = admin_with_subzone(1024);
    let a = admin.find_allocation(48).unwrap();
    assert_eq!(
        admin.deallocate(0xdead_0000),
        Err(HeapError::UnmanagedAddress { address: 0xdead_0000 })
    );
    assert_eq!(
        admin.deallocate(a + 8),
        Err(HeapError::NotBlockStart { address: a + 8 })
    );
    // Interior quantum of a live block
    assert_eq!(
        admin.deallocate(a + 16),
        Err(HeapError::NotBlockStart { address: a + 16 })
    );
}

#[test]
fn batch_allocate_carves_until_exhausted() {
    let admin = admin_with_subzone(128);
    let blocks = admin.batch_allocate(16, false, 1000);
    // 64 carved one-quantum blocks; the retired 64-quantum tail sits
    // on the catch-all bucket
    assert_eq!(blocks.len(), 64);
    for (i, address) in blocks.iter().enumerate() {
        assert_eq!(*address, blocks[0] + i * 16);
        assert!(admin.is_block_start(*address));
    }
    assert_eq!(admin.free_space(), 64 * 16);

    // A second batch splits the catch-all node into pieces
    let more = admin.batch_allocate(16, true, 64);
    assert_eq!(more.len(), 64);
    assert_eq!(more[0], blocks[0] + 64 * 16);
    assert_eq!(admin.free_space(), 0);

    // Fully exhausted now: short counts are expected, not errors
    assert!(admin.batch_allocate(16, false, 4).is_empty());
}

#[test]
fn batch_allocate_splits_a_coalesced_node() {
    let admin = admin_with_subzone(1024);
    let mut blocks = Vec::new();
    for _ in 0..20 {
        blocks.push(admin.find_allocation(16).unwrap());
    }
    let _sentinel = admin.find_allocation(16).unwrap();
    // Free the run back-to-front so it coalesces into one 20-quantum
    // node
    for address in blocks.iter().rev() {
        admin.deallocate(*address).unwrap();
    }
    assert!(admin.test_freelist_integrity());
    assert_eq!(admin.stats().free_list_bytes, 20 * 16);

    let pieces = admin.batch_allocate(16, false, 8);
    assert_eq!(pieces, blocks[..8].to_vec());
    // The unsplit leftover went back to its own bucket
    assert_eq!(admin.stats().free_list_bytes, 12 * 16);
    assert!(admin.test_freelist_integrity());
}

#[test]
fn batch_allocate_enlivens_during_a_collection_phase() {
    let delegate = RecordingDelegate::new();
    delegate.enlivening.store(true, Ordering::Relaxed);
    let admin = Admin::new(AdminConfig::default())
        .unwrap()
        .with_delegate(delegate.clone());
    admin.manage_subzone(Subzone::new(4, 1024));

    let blocks = admin.batch_allocate(32, false, 5);
    assert_eq!(blocks.len(), 5);
    assert_eq!(*delegate.enlivened.lock(), blocks);
}

#[test]
fn thread_cache_refills_one_batch_at_a_time() {
    let admin = admin_with_subzone(1024);
    let mut cache = quantum_heap::ThreadCache::for_admin(&admin);

    let first = admin.thread_cache_allocate(&mut cache, 16).unwrap();
    // One handed out, batch minus one left idle in the cache
    assert_eq!(cache.cached_blocks(), 9);

    let mut seen = vec![first];
    for _ in 0..9 {
        seen.push(admin.thread_cache_allocate(&mut cache, 16).unwrap());
    }
    assert_eq!(cache.cached_blocks(), 0);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 10);

    // Next request triggers a fresh refill
    admin.thread_cache_allocate(&mut cache, 16).unwrap();
    assert_eq!(cache.cached_blocks(), 9);
}

#[test]
fn cached_blocks_stay_thread_local_until_escape() {
    let admin = admin_with_subzone(1024);
    let mut cache = quantum_heap::ThreadCache::for_admin(&admin);
    let address = admin.thread_cache_allocate(&mut cache, 16).unwrap();

    let block = admin.block_ref(address).unwrap();
    assert!(block.is_thread_local());
    // The first reference makes it escape
    assert_eq!(block.inc_refcount(), 1);
    assert!(!block.is_thread_local());
}

#[test]
fn lower_block_slides_toward_low_addresses() {
    let admin = admin_with_subzone(1024);
    let a = admin.find_allocation(32).unwrap();
    let _gap = admin.find_allocation(16).unwrap();
    let c = admin.find_allocation(32).unwrap();
    let _sentinel = admin.find_allocation(16).unwrap();

    admin.deallocate(a).unwrap();
    let destination = admin.allocate_lower_block(c).unwrap();
    assert_eq!(destination, a);
    // The original stays allocated until the collector moves it
    assert_eq!(admin.block_size(c), Some(32));
    assert_eq!(admin.block_size(destination), Some(32));

    // No lower same-size block left: the original comes back
    assert_eq!(admin.allocate_lower_block(c).unwrap(), c);
}

#[test]
fn destination_block_mode_follows_the_scramble_flag() {
    for scramble in [false, true] {
        let config = AdminConfig {
            scramble,
            ..AdminConfig::default()
        };
        let admin = admin_with_config_and_subzone(config, 1024);
        let target = admin.find_allocation(32).unwrap();
        let _gap = admin.find_allocation(16).unwrap();
        let higher = admin.find_allocation(32).unwrap();
        let _sentinel = admin.find_allocation(16).unwrap();
        admin.deallocate(higher).unwrap();

        let destination = admin.allocate_destination_block(target).unwrap();
        if scramble {
            // Randomized mode takes any different address
            assert_ne!(destination, target);
        } else {
            // Sliding mode refuses a higher address
            assert_eq!(destination, target);
        }
    }
}

#[test]
fn different_block_falls_back_to_the_original_when_exhausted() {
    let admin = admin_with_subzone(128);
    let blocks = admin.batch_allocate(16, false, 1000);
    let target = blocks[0];
    let rest = admin.batch_allocate(16, false, 1000);
    assert!(!rest.is_empty());
    assert!(admin.batch_allocate(16, false, 1).is_empty());

    assert_eq!(admin.allocate_different_block(target).unwrap(), target);
}

#[test]
fn reset_free_list_empties_every_bucket() {
    let admin = admin_with_subzone(1024);
    let a = admin.find_allocation(48).unwrap();
    let b = admin.find_allocation(80).unwrap();
    let _sentinel = admin.find_allocation(16).unwrap();
    admin.deallocate(a).unwrap();
    admin.deallocate(b).unwrap();
    assert!(admin.stats().free_list_bytes > 0);

    admin.reset_free_list();
    assert_eq!(admin.stats().free_list_bytes, 0);
    assert!(admin.test_freelist_integrity());
    // Fresh allocations keep carving the untouched tail
    assert!(admin.find_allocation(48).is_some());
}

#[test]
fn byte_accounting_flows_through_the_delegate() {
    let delegate = RecordingDelegate::new();
    let admin = Admin::new(AdminConfig::default())
        .unwrap()
        .with_delegate(delegate.clone());
    admin.manage_subzone(Subzone::new(4, 1024));

    let a = admin.find_allocation(48).unwrap();
    let _sentinel = admin.find_allocation(16).unwrap();
    assert_eq!(delegate.allocated_bytes.load(Ordering::Relaxed), 64);
    admin.deallocate(a).unwrap();
    assert_eq!(delegate.freed_bytes.load(Ordering::Relaxed), 48);
}

#[test]
fn randomized_traffic_preserves_freelist_integrity() {
    let admin = admin_with_subzone(4096);
    let mut rng = StdRng::seed_from_u64(7);
    let mut live: Vec<usize> = Vec::new();

    for step in 0..400 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=1024);
            if let Some(address) = admin.find_allocation(size) {
                live.push(address);
            }
        } else {
            let index = rng.gen_range(0..live.len());
            admin.deallocate(live.swap_remove(index)).unwrap();
        }
        if step % 16 == 0 {
            assert!(admin.test_freelist_integrity(), "step {step}");
        }
    }

    for address in live.drain(..) {
        admin.deallocate(address).unwrap();
    }
    assert!(admin.test_freelist_integrity());
    // Everything freed: the whole subzone is available again
    assert_eq!(admin.free_space(), 4096 * 16);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Any allocate-then-free-everything sequence restores the
        /// full subzone and an intact free list.
        #[test]
        fn allocation_storms_always_unwind(sizes in prop::collection::vec(1usize..=1024, 1..40)) {
            let admin = admin_with_subzone(2048);
            let mut live = Vec::new();
            for size in sizes {
                if let Some(address) = admin.find_allocation(size) {
                    live.push(address);
                }
            }
            prop_assert!(admin.test_freelist_integrity());
            for address in live {
                admin.deallocate(address).unwrap();
            }
            prop_assert!(admin.test_freelist_integrity());
            prop_assert_eq!(admin.free_space(), 2048 * 16);
        }
    }
}
