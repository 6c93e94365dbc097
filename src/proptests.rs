use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;

/// Multiset model: element -> number of copies.
type Model = BTreeMap<u8, usize>;

fn validate_tree(t: &AvlTree<u8>, model: &Model) {
    let height = t
        .verify()
        .unwrap_or_else(|err| panic!("invariant violated: {err}"));
    assert_eq!(height, t.height(), "derived height must match recomputed height");

    let got: Vec<u8> = t.in_order().into_iter().copied().collect();
    let expected: Vec<u8> = model
        .iter()
        .flat_map(|(&v, &n)| std::iter::repeat(v).take(n))
        .collect();
    assert_eq!(got, expected, "in-order contents must match the model");
    assert_eq!(t.len(), expected.len());
    assert_eq!(
        t.nodes.slots() - t.nodes.len(),
        free_list_len(t),
        "every vacant entry must be on the free list"
    );
}

fn free_list_len(t: &AvlTree<u8>) -> usize {
    let mut n = 0;
    let mut current = t.nodes.free_head;
    while let Some(id) = current {
        n += 1;
        current = match &t.nodes.entries[id.index()] {
            Entry::Vacant(next) => *next,
            Entry::Occupied(_) => panic!("free list reaches live node {id:?}"),
        };
    }
    n
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 50)]
    Insert(#[proptest(strategy = "0u8..48")] u8),
    #[proptest(weight = 30)]
    Remove(#[proptest(strategy = "0u8..48")] u8),
    #[proptest(weight = 19)]
    Get(#[proptest(strategy = "0u8..48")] u8),
    #[proptest(weight = 1)]
    Clear,
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_multiset_equivalence(ops in prop::collection::vec(any::<Op>(), 0..=1000)) {
        let mut t: AvlTree<u8> = AvlTree::new();
        let mut m: Model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(v) => {
                    t.insert(v);
                    *m.entry(v).or_default() += 1;
                }
                Op::Remove(v) => {
                    let removed = t.remove(&v);
                    let expected = match m.get_mut(&v) {
                        Some(n) => {
                            *n -= 1;
                            if *n == 0 {
                                m.remove(&v);
                            }
                            Some(v)
                        }
                        None => None,
                    };
                    prop_assert_eq!(removed, expected);
                }
                Op::Get(v) => {
                    prop_assert_eq!(t.get(&v).copied(), m.contains_key(&v).then_some(v));
                }
                Op::Clear => {
                    t.clear();
                    m.clear();
                }
            }

            prop_assert!(t.is_balanced());
            prop_assert_eq!(t.len(), m.values().sum::<usize>());
        }

        validate_tree(&t, &m);
    }

    #[test]
    fn prop_remove_absent_is_noop(
        values in prop::collection::vec(0u8..100, 0..200),
        probe in 100u8..=255,
    ) {
        let mut t = AvlTree::new();
        for &v in &values {
            t.insert(v);
        }
        let before: Vec<(u8, i8, bool, bool)> =
            t.shape().into_iter().map(|(v, b, l, r)| (*v, b, l, r)).collect();
        prop_assert_eq!(t.remove(&probe), None);
        let after: Vec<(u8, i8, bool, bool)> =
            t.shape().into_iter().map(|(v, b, l, r)| (*v, b, l, r)).collect();
        prop_assert_eq!(before, after);
        prop_assert_eq!(t.len(), values.len());
    }

    #[test]
    fn prop_try_insert_matches_insert(values in prop::collection::vec(any::<u8>(), 0..300)) {
        let mut a = AvlTree::new();
        let mut b = AvlTree::new();
        for &v in &values {
            a.insert(v);
            prop_assert!(b.try_insert(v).is_ok());
        }
        prop_assert_eq!(a.shape(), b.shape());
    }
}

/// Visit every ordering of `items` (Heap's algorithm, no recursion).
fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(&[T])) {
    let mut perm = items.to_vec();
    let mut counters = vec![0usize; perm.len()];
    f(&perm);

    let mut i = 1;
    while i < perm.len() {
        if counters[i] < i {
            let j = if i % 2 == 0 { 0 } else { counters[i] };
            perm.swap(j, i);
            f(&perm);
            counters[i] += 1;
            i = 1;
        } else {
            counters[i] = 0;
            i += 1;
        }
    }
}

#[test]
fn exhaustive_insert_order_small_set() {
    let values: Vec<u8> = vec![1, 2, 3, 4, 5, 6, 7];

    let mut visited = 0usize;
    let mut heights = [0usize; 5];

    for_each_permutation(&values, |perm| {
        let mut t = AvlTree::new();
        let mut m: Model = BTreeMap::new();
        for &v in perm {
            t.insert(v);
            *m.entry(v).or_default() += 1;
            assert!(t.is_balanced());
        }
        // Seven nodes fit an AVL tree of height 3 or 4.
        let height = t.height();
        assert!((3..=4).contains(&height), "order {perm:?} gave height {height}");
        heights[height] += 1;
        visited += 1;
        validate_tree(&t, &m);
    });

    assert_eq!(visited, 5040);
    assert!(heights[3] > 0 && heights[4] > 0, "heights seen: {heights:?}");
    assert_eq!(heights[3] + heights[4], visited);
}

#[test]
fn exhaustive_remove_order_small_set() {
    // Includes duplicates so removals hit chains of equal elements.
    let values: Vec<u8> = vec![4, 2, 6, 1, 3, 4, 7];

    let mut base_tree = AvlTree::new();
    let mut base_model: Model = BTreeMap::new();
    for &v in &values {
        base_tree.insert(v);
        *base_model.entry(v).or_default() += 1;
    }

    for_each_permutation(&values, |perm| {
        let mut t = base_tree.clone();
        let mut m = base_model.clone();

        for &v in perm {
            assert_eq!(t.remove(&v), Some(v));
            let n = m.get_mut(&v).unwrap();
            *n -= 1;
            if *n == 0 {
                m.remove(&v);
            }
            validate_tree(&t, &m);
        }
        assert!(t.is_empty());
        assert!(t.root.is_none());
    });
}
