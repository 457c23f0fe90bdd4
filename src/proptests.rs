use super::*;

use proptest::prelude::*;
use std::collections::BTreeMap;

const DEPTH: usize = 16;

#[derive(Clone, Debug)]
enum Op {
    Insert(Vec<u64>, u64),
    Remove(Vec<u64>),
    Get(Vec<u64>),
    Update(Vec<u64>, Vec<u64>),
}

/// Biased towards small values so keys share long bit prefixes and nodes
/// accumulate entries, splits, and merges.
fn component() -> impl Strategy<Value = u64> + Clone {
    prop_oneof![
        3 => 0u64..16,
        2 => 0u64..1024,
        1 => 0u64..65536,
    ]
}

fn key_strategy(dim: usize) -> impl Strategy<Value = Vec<u64>> + Clone {
    prop::collection::vec(component(), dim)
}

fn ops_strategy(dim: usize) -> impl Strategy<Value = Vec<Op>> {
    let key = key_strategy(dim);
    let op = prop_oneof![
        45 => (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        25 => key.clone().prop_map(Op::Remove),
        20 => key.clone().prop_map(Op::Get),
        10 => (key.clone(), key).prop_map(|(a, b)| Op::Update(a, b)),
    ];
    prop::collection::vec(op, 0..=1500)
}

fn run_model(dim: usize, ops: Vec<Op>) -> Result<(), TestCaseError> {
    let mut t: PhTree<u64> = PhTree::new(dim, DEPTH);
    let mut m: BTreeMap<Vec<u64>, u64> = BTreeMap::new();

    for op in ops {
        match op {
            Op::Insert(k, v) => {
                prop_assert_eq!(t.insert(&k, v), m.insert(k, v));
            }
            Op::Remove(k) => {
                prop_assert_eq!(t.remove(&k), m.remove(&k));
            }
            Op::Get(k) => {
                prop_assert_eq!(t.get(&k), m.get(&k));
            }
            Op::Update(a, b) => {
                let expected = if m.contains_key(&a) && !m.contains_key(&b) {
                    let v = m.remove(&a).expect("present in model");
                    m.insert(b.clone(), v);
                    Some(v)
                } else {
                    None
                };
                prop_assert_eq!(t.update(&a, &b).copied(), expected);
            }
        }
        prop_assert_eq!(t.len(), m.len());
    }

    t.assert_invariants();
    let mut got: Vec<(Vec<u64>, u64)> = t.query_extent().map(|(k, v)| (k.to_vec(), *v)).collect();
    got.sort();
    let want: Vec<(Vec<u64>, u64)> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
    prop_assert_eq!(got, want);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 96,
        max_shrink_iters: 20_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_model_equivalence_dim2(ops in ops_strategy(2)) {
        run_model(2, ops)?;
    }

    #[test]
    fn prop_model_equivalence_dim5(ops in ops_strategy(5)) {
        run_model(5, ops)?;
    }

    #[test]
    fn prop_window_matches_filtered_extent(
        keys in prop::collection::vec(key_strategy(3), 0..400),
        lo in key_strategy(3),
        hi in key_strategy(3),
    ) {
        let mut t: PhTree<u64> = PhTree::new(3, DEPTH);
        let mut m: BTreeMap<Vec<u64>, u64> = BTreeMap::new();
        for (i, k) in keys.into_iter().enumerate() {
            t.insert(&k, i as u64);
            m.insert(k, i as u64);
        }
        let min: Vec<u64> = lo.iter().zip(&hi).map(|(a, b)| *a.min(b)).collect();
        let max: Vec<u64> = lo.iter().zip(&hi).map(|(a, b)| *a.max(b)).collect();

        let mut got: Vec<(Vec<u64>, u64)> =
            t.query(&min, &max).map(|(k, v)| (k.to_vec(), *v)).collect();
        got.sort();
        let want: Vec<(Vec<u64>, u64)> = m
            .iter()
            .filter(|(k, _)| {
                k.iter().zip(&min).all(|(x, lo)| x >= lo)
                    && k.iter().zip(&max).all(|(x, hi)| x <= hi)
            })
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        prop_assert_eq!(got, want);
    }
}

#[test]
fn window_completeness_across_dims() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    for &dim in &[1usize, 3, 8, 16, 32] {
        let mut rng = StdRng::seed_from_u64(dim as u64);
        let mut t: PhTree<u64> = PhTree::new(dim, 16);
        let mut m: BTreeMap<Vec<u64>, u64> = BTreeMap::new();

        for i in 0..800u64 {
            let key: Vec<u64> = (0..dim)
                .map(|_| rng.gen_range(0..16u64) * 4096 + rng.gen_range(0..8u64))
                .collect();
            t.insert(&key, i);
            m.insert(key, i);
        }
        t.assert_invariants();

        for _ in 0..60 {
            let mut min = Vec::with_capacity(dim);
            let mut max = Vec::with_capacity(dim);
            for _ in 0..dim {
                let a = rng.gen_range(0..65536u64);
                let b = rng.gen_range(0..65536u64);
                min.push(a.min(b));
                max.push(a.max(b));
            }
            let mut got: Vec<(Vec<u64>, u64)> =
                t.query(&min, &max).map(|(k, v)| (k.to_vec(), *v)).collect();
            got.sort();
            let want: Vec<(Vec<u64>, u64)> = m
                .iter()
                .filter(|(k, _)| {
                    k.iter().zip(&min).all(|(x, lo)| x >= lo)
                        && k.iter().zip(&max).all(|(x, hi)| x <= hi)
                })
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            assert_eq!(got, want, "window mismatch at dim {dim}");
        }
    }
}

#[test]
fn randomized_full_width_ops() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(3);
    let mut t: PhTree<u64> = PhTree::new(3, 64);
    let mut m: BTreeMap<Vec<u64>, u64> = BTreeMap::new();

    // Clustered 64-bit components: a few high-bit islands with dense low
    // bits, so both deep splits and crowded nodes occur.
    let gen_key = |rng: &mut StdRng| -> Vec<u64> {
        (0..3)
            .map(|_| {
                let island = rng.gen_range(0..3u64) << 61;
                island | rng.gen_range(0..64u64)
            })
            .collect()
    };

    for _ in 0..30_000 {
        let key = gen_key(&mut rng);
        match rng.gen_range(0..100) {
            0..=49 => {
                let v: u64 = rng.gen();
                assert_eq!(t.insert(&key, v), m.insert(key, v));
            }
            50..=74 => {
                assert_eq!(t.remove(&key), m.remove(&key));
            }
            75..=89 => {
                assert_eq!(t.get(&key), m.get(&key));
            }
            _ => {
                let other = gen_key(&mut rng);
                let expected = if m.contains_key(&key) && !m.contains_key(&other) {
                    let v = m.remove(&key).expect("present in model");
                    m.insert(other.clone(), v);
                    Some(v)
                } else {
                    None
                };
                assert_eq!(t.update(&key, &other).copied(), expected);
            }
        }
        assert_eq!(t.len(), m.len());
    }

    t.assert_invariants();
    let mut got: Vec<(Vec<u64>, u64)> = t.query_extent().map(|(k, v)| (k.to_vec(), *v)).collect();
    got.sort();
    let want: Vec<(Vec<u64>, u64)> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(got, want);
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_insert_order_small_set() {
    // Keys chosen so several share the root slot and split at different
    // depths; every insertion order must produce an equivalent tree.
    let keys: Vec<u64> = vec![128, 129, 132, 160, 130, 255];

    for_each_permutation(&keys, |perm| {
        let mut t: PhTree<u64> = PhTree::new(1, 8);
        let mut m: BTreeMap<u64, u64> = BTreeMap::new();

        for (i, k) in perm.into_iter().enumerate() {
            let v = i as u64;
            assert_eq!(t.insert(&[k], v), m.insert(k, v));
        }

        t.assert_invariants();
        let mut got: Vec<(u64, u64)> = t.query_extent().map(|(k, v)| (k[0], *v)).collect();
        got.sort();
        let want: Vec<(u64, u64)> = m.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(got, want);
    });
}

#[test]
fn exhaustive_remove_order_small_set() {
    let keys: Vec<u64> = vec![128, 129, 132, 160, 130, 255];

    let mut base_tree: PhTree<u64> = PhTree::new(1, 8);
    let mut base_map: BTreeMap<u64, u64> = BTreeMap::new();
    for (i, &k) in keys.iter().enumerate() {
        let v = i as u64;
        assert_eq!(base_tree.insert(&[k], v), base_map.insert(k, v));
    }

    for_each_permutation(&keys, |perm| {
        let mut t = base_tree.clone();
        let mut m = base_map.clone();

        for k in perm {
            assert_eq!(t.remove(&[k]), m.remove(&k));
            assert_eq!(t.len(), m.len());
            t.assert_invariants();
        }
        assert_eq!(t.len(), 0);
        assert!(t.is_empty());
    });
}
