//! Property-based tests for the hash table.
//!
//! These tests verify invariants that should hold for all inputs, using
//! differential testing against `std::collections` as an oracle. All
//! single-threaded; the concurrent suites live in `concurrent_regression`
//! and `stress_tests`.

#![allow(clippy::unwrap_used)]

mod common;

use std::collections::{BTreeSet, HashMap};

use chaintable::{ConcurrentHashTable, SIZE_BIG_LOG2, SIZE_SMALL_LOG2};
use common::{DEAD_MARK, KeyLookup, U64Config};
use proptest::prelude::*;

// ============================================================================
//  Strategies
// ============================================================================

/// Keys kept under the dead mark so the mark stays a test-only flag.
fn key() -> impl Strategy<Value = u64> {
    0u64..(1 << 20)
}

fn key_set(max: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::btree_set(key(), 0..=max).prop_map(|set| set.into_iter().collect())
}

/// Operations for random workload testing.
#[derive(Debug, Clone)]
enum Op {
    Insert(u64),
    Remove(u64),
    Get(u64),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => key().prop_map(Op::Insert),
            2 => key().prop_map(Op::Get),
            1 => key().prop_map(Op::Remove),
        ],
        0..=max_ops,
    )
}

fn fresh_table() -> ConcurrentHashTable<U64Config> {
    ConcurrentHashTable::new(SIZE_SMALL_LOG2, SIZE_BIG_LOG2, 4)
}

fn contains(cht: &ConcurrentHashTable<U64Config>, key: u64) -> bool {
    cht.get(&KeyLookup(key), |_| {}, None)
}

// ============================================================================
//  Properties
// ============================================================================

proptest! {
    /// Differential oracle: a random insert/remove/get workload agrees
    /// with a HashMap at every step.
    #[test]
    fn random_ops_match_oracle(ops in operations(300)) {
        let cht = fresh_table();
        let mut oracle: HashMap<u64, u64> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(k) => {
                    let inserted = cht.insert(&KeyLookup(k), || k, |_, _| {}, None);
                    prop_assert_eq!(inserted, !oracle.contains_key(&k));
                    oracle.entry(k).or_insert(k);
                }
                Op::Remove(k) => {
                    let removed = cht.remove(&KeyLookup(k), |_| {});
                    prop_assert_eq!(removed, oracle.remove(&k).is_some());
                }
                Op::Get(k) => {
                    prop_assert_eq!(contains(&cht, k), oracle.contains_key(&k));
                }
            }
        }
    }

    /// Grow preserves exactly the live set; dead entries may be dropped.
    #[test]
    fn grow_preserves_live_set(live in key_set(400), dead in key_set(50)) {
        let cht = fresh_table();
        let live: BTreeSet<u64> = live.into_iter().collect();
        for &k in &live {
            prop_assert!(cht.unsafe_insert(k));
        }
        for &k in &dead {
            if !live.contains(&k) {
                // Already-dead values only enter through the insert path.
                prop_assert!(cht.insert(
                    &KeyLookup(k | DEAD_MARK),
                    || k | DEAD_MARK,
                    |_, _| {},
                    None
                ), "insert failed");
            }
        }

        prop_assert!(cht.grow(SIZE_SMALL_LOG2 + 1));

        let mut found: BTreeSet<u64> = BTreeSet::new();
        prop_assert!(cht.try_scan(|v| {
            if v & DEAD_MARK == 0 {
                found.insert(*v);
            }
            true
        }), "scan failed");
        prop_assert_eq!(found, live);
    }

    /// After a grow, every live value is reachable through its bucket:
    /// lookups keyed by the full hash (new mask included) still hit.
    #[test]
    fn grow_rebuckets_every_key(keys in key_set(300)) {
        let cht = fresh_table();
        for &k in &keys {
            prop_assert!(cht.unsafe_insert(k));
        }

        prop_assert!(cht.grow(SIZE_SMALL_LOG2 + 1));
        prop_assert_eq!(cht.get_size_log2(), SIZE_SMALL_LOG2 + 1);

        for &k in &keys {
            prop_assert!(contains(&cht, k), "key {} unreachable after grow", k);
        }
    }

    /// Shrink merges without losing or duplicating anything.
    #[test]
    fn shrink_preserves_set(keys in key_set(300)) {
        let cht = fresh_table();
        prop_assert!(cht.grow(SIZE_SMALL_LOG2 + 2));
        for &k in &keys {
            prop_assert!(cht.unsafe_insert(k));
        }

        prop_assert!(cht.shrink(0));
        prop_assert_eq!(cht.get_size_log2(), SIZE_SMALL_LOG2);

        let mut count = 0usize;
        prop_assert!(cht.try_scan(|_| { count += 1; true }), "scan failed");
        prop_assert_eq!(count, keys.len());

        for &k in &keys {
            prop_assert!(contains(&cht, k), "key {} lost in shrink", k);
        }
    }

    /// Bulk delete removes exactly the matching subset.
    #[test]
    fn bulk_delete_removes_exact_subset(keys in key_set(400), modulus in 2u64..7) {
        let cht = fresh_table();
        for &k in &keys {
            prop_assert!(cht.unsafe_insert(k));
        }

        let mut deleted: BTreeSet<u64> = BTreeSet::new();
        prop_assert!(cht.try_bulk_delete(
            |v| v % modulus == 0,
            |v| { deleted.insert(*v); },
        ), "bulk delete failed");

        let expected_deleted: BTreeSet<u64> =
            keys.iter().copied().filter(|k| k % modulus == 0).collect();
        prop_assert_eq!(&deleted, &expected_deleted);

        for &k in &keys {
            prop_assert_eq!(contains(&cht, k), k % modulus != 0);
        }
    }

    /// Moving nodes between tables preserves the live set and drains the
    /// source.
    #[test]
    fn move_nodes_preserves_set(keys in key_set(200)) {
        let from = fresh_table();
        let to = fresh_table();
        for &k in &keys {
            prop_assert!(from.unsafe_insert(k));
        }

        prop_assert!(from.try_move_nodes_to(&to));

        let mut source_left = 0usize;
        prop_assert!(from.try_scan(|_| { source_left += 1; true }), "scan failed");
        prop_assert_eq!(source_left, 0);

        for &k in &keys {
            prop_assert!(contains(&to, k), "key {} lost in move", k);
        }
    }

    /// get_copy returns the stored value or the notfound sentinel.
    #[test]
    fn get_copy_matches_membership(keys in key_set(100), probe in key()) {
        let cht = fresh_table();
        for &k in &keys {
            prop_assert!(cht.unsafe_insert(k));
        }

        let copied = cht.get_copy(&KeyLookup(probe), None);
        if keys.contains(&probe) {
            prop_assert_eq!(copied, probe);
        } else {
            prop_assert_eq!(copied, u64::MAX);
        }
    }
}
