//! # Index Regression Scenarios
//!
//! Source of truth for the index's observable behavior: predecessor
//! semantics, insert/delete round trips, bulk loading, iteration, batch
//! operations, and every hierarchy configuration. Each scenario ends
//! with a full structural validation pass.
//!
//! If a test fails after a change, the change regressed the index. Do
//! NOT adjust expected values to make tests pass - fix the underlying
//! issue.

use rand::prelude::*;
use std::collections::BTreeSet;
use strata::{Hierarchy, Tree};

fn all_hierarchies() -> Vec<(&'static str, Hierarchy)> {
    vec![
        ("default", Hierarchy::page_default()),
        ("fence", Hierarchy::fence_keys()),
        ("eytzinger", Hierarchy::eytzinger()),
        ("superpage", Hierarchy::superpage()),
    ]
}

mod predecessor_search {
    use super::*;

    #[test]
    fn sparse_keys_probe() {
        // bulk_load([0, 10, 20, ..., 990]) - 100 keys.
        let keys: Vec<i32> = (0..100).map(|i| i * 10).collect();
        let tree = Tree::bulk_load(&keys).unwrap();

        assert_eq!(tree.search(50), Some(50));
        assert_eq!(tree.search(55), Some(50));
        assert_eq!(tree.search(990), Some(990));
        assert_eq!(tree.search(999), Some(990));
        assert_eq!(tree.search(-1), None);
        tree.check_invariants();
    }

    #[test]
    fn every_query_between_stored_keys() {
        let keys: Vec<i32> = (0..500).map(|i| i * 4).collect();
        for (name, hier) in all_hierarchies() {
            let tree = Tree::bulk_load_with(&keys, hier).unwrap();
            for q in -2..2002 {
                let expect = keys.iter().copied().filter(|&k| k <= q).max();
                assert_eq!(tree.search(q), expect, "{name}: query {q}");
            }
        }
    }

    #[test]
    fn extreme_key_values() {
        let mut tree = Tree::new().unwrap();
        assert!(tree.insert(i32::MIN));
        assert!(tree.insert(i32::MAX));
        assert!(tree.insert(0));
        assert_eq!(tree.search(i32::MIN), Some(i32::MIN));
        assert_eq!(tree.search(-1), Some(i32::MIN));
        assert_eq!(tree.search(i32::MAX), Some(i32::MAX));
        assert!(tree.contains(i32::MAX));
        assert_eq!(tree.len(), 3);
    }
}

mod insertion {
    use super::*;

    #[test]
    fn descending_inserts_cross_leaf_boundaries() {
        // Insert 999, 998, ..., 0; everything must be reachable.
        let mut tree = Tree::new().unwrap();
        for k in (0..1000).rev() {
            assert!(tree.insert(k), "insert {k}");
        }
        assert_eq!(tree.len(), 1000);
        for k in 0..1000 {
            assert!(tree.contains(k), "missing {k}");
        }
        let got: Vec<i32> = tree.iter_from(i32::MIN).collect();
        let expect: Vec<i32> = (0..1000).collect();
        assert_eq!(got, expect);
        tree.check_invariants();
    }

    #[test]
    fn ascending_inserts_all_hierarchies() {
        for (name, hier) in all_hierarchies() {
            let mut tree = Tree::with_hierarchy(hier).unwrap();
            for k in 0..1000 {
                assert!(tree.insert(k * 3), "{name}: insert {k}");
            }
            assert_eq!(tree.len(), 1000, "{name}");
            for k in 0..1000 {
                assert!(tree.contains(k * 3), "{name}: missing {}", k * 3);
            }
            assert!(!tree.contains(1), "{name}: phantom key");
            tree.check_invariants();
        }
    }

    #[test]
    fn double_insert_law() {
        let mut tree = Tree::new().unwrap();
        assert!(tree.insert(42));
        assert!(!tree.insert(42));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn insert_then_delete_restores_iteration() {
        let keys: Vec<i32> = (0..2000).map(|i| i * 2).collect();
        let mut tree = Tree::bulk_load(&keys).unwrap();
        let before: Vec<i32> = tree.iter_from(i32::MIN).collect();

        assert!(tree.insert(1001));
        assert!(tree.delete(1001));

        let after: Vec<i32> = tree.iter_from(i32::MIN).collect();
        assert_eq!(before, after);
        tree.check_invariants();
    }
}

mod deletion {
    use super::*;

    #[test]
    fn double_delete_law() {
        let mut tree = Tree::new().unwrap();
        for k in 0..100 {
            tree.insert(k);
        }
        assert!(tree.delete(50));
        assert!(!tree.delete(50));
        assert_eq!(tree.len(), 99);
        assert!(tree.contains(49));
        assert!(tree.contains(51));
        assert!(!tree.contains(50));
    }

    #[test]
    fn deplete_from_the_middle_out() {
        // bulk_load(0..5000); delete 2500..4999 then 2499..0.
        let keys: Vec<i32> = (0..5000).collect();
        let mut tree = Tree::bulk_load(&keys).unwrap();

        for k in 2500..5000 {
            assert!(tree.delete(k), "delete {k}");
        }
        tree.check_invariants();
        for k in (0..2500).rev() {
            assert!(tree.delete(k), "delete {k}");
        }
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.iter_from(i32::MIN).next(), None);
        tree.check_invariants();
    }

    #[test]
    fn heavy_deletion_collapses_tree() {
        // Insert 0..1000, delete every key not divisible by 10.
        let mut tree = Tree::new().unwrap();
        for k in 0..1000 {
            tree.insert(k);
        }
        for k in 0..1000 {
            if k % 10 != 0 {
                assert!(tree.delete(k), "delete {k}");
            }
        }
        assert_eq!(tree.len(), 100);
        for k in 0..1000 {
            assert_eq!(tree.contains(k), k % 10 == 0, "key {k}");
        }
        tree.check_invariants();
    }

    #[test]
    fn delete_half_all_hierarchies() {
        for (name, hier) in all_hierarchies() {
            let mut tree = Tree::with_hierarchy(hier).unwrap();
            for k in 0..2000 {
                tree.insert(k);
            }
            for k in (0..2000).step_by(2) {
                assert!(tree.delete(k), "{name}: delete {k}");
            }
            assert_eq!(tree.len(), 1000, "{name}");
            for k in 0..2000 {
                assert_eq!(tree.contains(k), k % 2 == 1, "{name}: key {k}");
            }
            tree.check_invariants();
        }
    }
}

mod bulk_load {
    use super::*;

    #[test]
    fn empty_and_single() {
        let tree = Tree::bulk_load(&[]).unwrap();
        assert_eq!(tree.len(), 0);
        assert!(!tree.contains(0));

        let tree = Tree::bulk_load(&[42]).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.contains(42));
        tree.check_invariants();
    }

    #[test]
    fn large_bulk_load() {
        // bulk_load(0..100_000); spot-check at stride 97.
        let keys: Vec<i32> = (0..100_000).collect();
        let tree = Tree::bulk_load(&keys).unwrap();
        assert_eq!(tree.len(), 100_000);
        for k in (0..100_000).step_by(97) {
            assert!(tree.contains(k), "missing {k}");
        }
        tree.check_invariants();
    }

    #[test]
    fn bulk_load_law_iteration_equals_input() {
        let keys: Vec<i32> = (0..30_000).map(|i| i * 5 - 60_000).collect();
        for (name, hier) in all_hierarchies() {
            let tree = Tree::bulk_load_with(&keys, hier).unwrap();
            let got: Vec<i32> = tree.iter_from(i32::MIN).collect();
            assert_eq!(got, keys, "{name}");
            tree.check_invariants();
        }
    }

    #[test]
    fn bulk_load_then_mutate() {
        let keys: Vec<i32> = (0..10_000).map(|i| i * 2).collect();
        let mut tree = Tree::bulk_load(&keys).unwrap();
        for k in (1..10_000).map(|i| i * 2 - 1).step_by(4) {
            assert!(tree.insert(k));
        }
        for k in (0..10_000).map(|i| i * 2).step_by(8) {
            assert!(tree.delete(k));
        }
        tree.check_invariants();
        let got: Vec<i32> = tree.iter_from(i32::MIN).collect();
        assert!(got.windows(2).all(|w| w[0] < w[1]), "iteration not strictly increasing");
    }
}

mod iteration {
    use super::*;

    #[test]
    fn iterator_across_leaves() {
        // bulk_load(0..2000): exactly 2000 strictly increasing values.
        let keys: Vec<i32> = (0..2000).collect();
        let tree = Tree::bulk_load(&keys).unwrap();
        let mut count = 0;
        let mut prev = i32::MIN;
        for (i, k) in tree.iter_from(i32::MIN).enumerate() {
            if i > 0 {
                assert!(k > prev, "not strictly increasing at {i}");
            }
            prev = k;
            count += 1;
        }
        assert_eq!(count, 2000);
    }

    #[test]
    fn iterator_from_midpoint() {
        // On {0, 10, ..., 990}, iter_from(55) starts at 60.
        let keys: Vec<i32> = (0..100).map(|i| i * 10).collect();
        let tree = Tree::bulk_load(&keys).unwrap();

        let mut it = tree.iter_from(55);
        assert_eq!(it.next(), Some(60));

        let mut it = tree.iter_from(50);
        assert_eq!(it.next(), Some(50));
        assert_eq!(it.next(), Some(60));
    }

    #[test]
    fn iteration_matches_membership_and_size() {
        let mut tree = Tree::new().unwrap();
        for k in (0..3000).map(|i| (i * 131) % 5000) {
            tree.insert(k);
        }
        let iterated: Vec<i32> = tree.iter_from(i32::MIN).collect();
        assert_eq!(iterated.len(), tree.len());
        assert!(iterated.windows(2).all(|w| w[0] < w[1]), "duplicates or disorder");
        for &k in &iterated {
            assert!(tree.contains(k));
        }
    }
}

mod batch_operations {
    use super::*;

    #[test]
    fn batch_insert_counts_new_keys_only() {
        let mut tree = Tree::new().unwrap();
        let keys: Vec<i32> = (0..4000).collect();
        assert_eq!(tree.insert_batch(&keys), 4000);
        assert_eq!(tree.insert_batch(&keys[1000..2000]), 0);
        assert_eq!(tree.len(), 4000);
        tree.check_invariants();
    }

    #[test]
    fn batch_delete_counts_present_keys_only() {
        let keys: Vec<i32> = (0..4000).collect();
        let mut tree = Tree::bulk_load(&keys).unwrap();
        let victims: Vec<i32> = (0..5000).filter(|k| k % 3 == 0).collect();
        let present = victims.iter().filter(|&&k| k < 4000).count();
        assert_eq!(tree.delete_batch(&victims), present);
        assert_eq!(tree.len(), 4000 - present);
        tree.check_invariants();
    }

    #[test]
    fn unsorted_batches() {
        let mut tree = Tree::new().unwrap();
        let mut keys: Vec<i32> = (0..3000).collect();
        let mut rng = StdRng::seed_from_u64(7);
        keys.shuffle(&mut rng);
        assert_eq!(tree.insert_batch(&keys), 3000);

        keys.shuffle(&mut rng);
        assert_eq!(tree.delete_batch(&keys[..1500]), 1500);
        assert_eq!(tree.len(), 1500);
        tree.check_invariants();
    }
}

mod superpage_configuration {
    use super::*;

    #[test]
    fn insert_and_delete_odd_keys() {
        // use_superpages: insert 0..5000, delete odds.
        let mut tree = Tree::with_hierarchy(Hierarchy::superpage()).unwrap();
        for k in 0..5000 {
            assert!(tree.insert(k), "insert {k}");
        }
        for k in (1..5000).step_by(2) {
            assert!(tree.delete(k), "delete {k}");
        }
        assert_eq!(tree.len(), 2500);
        for k in 0..5000 {
            assert_eq!(tree.contains(k), k % 2 == 0, "key {k}");
        }
        tree.check_invariants();
    }

    #[test]
    fn bulk_load_spanning_many_pages() {
        let keys: Vec<i32> = (0..200_000).collect();
        let tree = Tree::bulk_load_with(&keys, Hierarchy::superpage()).unwrap();
        assert_eq!(tree.len(), 200_000);
        for k in (0..200_000).step_by(631) {
            assert!(tree.contains(k));
            assert_eq!(tree.search(k), Some(k));
        }
        tree.check_invariants();
    }
}

mod randomized {
    use super::*;

    /// Drive the index and a BTreeSet through the same operation stream
    /// and compare every observable.
    fn differential_run(hier: Hierarchy, seed: u64, ops: usize, key_range: i32) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tree = Tree::with_hierarchy(hier).unwrap();
        let mut model: BTreeSet<i32> = BTreeSet::new();

        for step in 0..ops {
            let key = rng.gen_range(-key_range..key_range);
            match rng.gen_range(0..10) {
                0..=5 => {
                    assert_eq!(tree.insert(key), model.insert(key), "step {step}: insert {key}");
                }
                6..=8 => {
                    assert_eq!(tree.delete(key), model.remove(&key), "step {step}: delete {key}");
                }
                _ => {
                    let expect = model.range(..=key).next_back().copied();
                    assert_eq!(tree.search(key), expect, "step {step}: search {key}");
                }
            }
            assert_eq!(tree.len(), model.len(), "step {step}: size");
        }

        let got: Vec<i32> = tree.iter_from(i32::MIN).collect();
        let expect: Vec<i32> = model.iter().copied().collect();
        assert_eq!(got, expect);
        tree.check_invariants();
    }

    #[test]
    fn differential_default() {
        differential_run(Hierarchy::page_default(), 1, 30_000, 10_000);
    }

    #[test]
    fn differential_fence() {
        differential_run(Hierarchy::fence_keys(), 2, 30_000, 10_000);
    }

    #[test]
    fn differential_eytzinger() {
        differential_run(Hierarchy::eytzinger(), 3, 30_000, 10_000);
    }

    #[test]
    fn differential_superpage() {
        differential_run(Hierarchy::superpage(), 4, 30_000, 10_000);
    }

    #[test]
    fn differential_narrow_keyspace_churn() {
        // Heavy duplicate pressure and constant rebalancing.
        differential_run(Hierarchy::page_default(), 5, 50_000, 700);
    }
}
