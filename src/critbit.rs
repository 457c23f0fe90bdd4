//! Crit-bit index over hypercube addresses.
//!
//! Backs the Indexed node representation: an ordered map from a k-bit
//! hypercube address to a node entry. Branches are keyed by their most
//! significant discriminative bit and carry the prefix shared by every leaf
//! below, so lookups and successor queries bail out as soon as the target
//! diverges from a subtree.

/// Bits strictly above `bit`, where `bit` counts from the MSB (0..=63).
#[inline]
fn hi_mask(bit: u32) -> u64 {
    debug_assert!(bit <= 63);
    if bit == 0 {
        0
    } else {
        !0u64 << (64 - bit)
    }
}

#[inline]
fn addr_bit(addr: u64, bit: u32) -> u64 {
    (addr >> (63 - bit)) & 1
}

#[derive(Clone)]
enum CbNode<T> {
    Leaf {
        addr: u64,
        entry: T,
    },
    Branch {
        /// Discriminative bit, counted from the MSB.
        bit: u32,
        /// Address bits above `bit`, shared by every leaf below; bits at and
        /// below `bit` are zero.
        prefix: u64,
        zero: Box<CbNode<T>>,
        one: Box<CbNode<T>>,
    },
}

#[derive(Clone)]
pub(crate) struct AddrMap<T> {
    root: Option<Box<CbNode<T>>>,
    len: usize,
}

impl<T> AddrMap<T> {
    pub(crate) fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn get(&self, addr: u64) -> Option<&T> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                CbNode::Leaf { addr: a, entry } => return (*a == addr).then_some(entry),
                CbNode::Branch {
                    bit,
                    prefix,
                    zero,
                    one,
                } => {
                    if (addr ^ *prefix) & hi_mask(*bit) != 0 {
                        return None;
                    }
                    node = if addr_bit(addr, *bit) == 1 { one } else { zero };
                }
            }
        }
    }

    pub(crate) fn get_mut(&mut self, addr: u64) -> Option<&mut T> {
        let mut node = self.root.as_deref_mut()?;
        loop {
            match node {
                CbNode::Leaf { addr: a, entry } => return (*a == addr).then_some(entry),
                CbNode::Branch {
                    bit,
                    prefix,
                    zero,
                    one,
                } => {
                    if (addr ^ *prefix) & hi_mask(*bit) != 0 {
                        return None;
                    }
                    node = if addr_bit(addr, *bit) == 1 { one } else { zero };
                }
            }
        }
    }

    pub(crate) fn insert(&mut self, addr: u64, entry: T) -> Option<T> {
        match self.root.take() {
            None => {
                self.root = Some(Box::new(CbNode::Leaf { addr, entry }));
                self.len = 1;
                None
            }
            Some(node) => {
                let (node, old) = Self::insert_rec(node, addr, entry);
                self.root = Some(node);
                if old.is_none() {
                    self.len += 1;
                }
                old
            }
        }
    }

    fn insert_rec(node: Box<CbNode<T>>, addr: u64, entry: T) -> (Box<CbNode<T>>, Option<T>) {
        match *node {
            CbNode::Leaf { addr: a, entry: e } => {
                if a == addr {
                    (Box::new(CbNode::Leaf { addr, entry }), Some(e))
                } else {
                    let db = (addr ^ a).leading_zeros();
                    let old = Box::new(CbNode::Leaf { addr: a, entry: e });
                    (Self::join(old, addr, entry, db), None)
                }
            }
            CbNode::Branch {
                bit,
                prefix,
                zero,
                one,
            } => {
                if (addr ^ prefix) & hi_mask(bit) != 0 {
                    let db = (addr ^ prefix).leading_zeros();
                    let old = Box::new(CbNode::Branch {
                        bit,
                        prefix,
                        zero,
                        one,
                    });
                    return (Self::join(old, addr, entry, db), None);
                }
                if addr_bit(addr, bit) == 1 {
                    let (one, old) = Self::insert_rec(one, addr, entry);
                    (
                        Box::new(CbNode::Branch {
                            bit,
                            prefix,
                            zero,
                            one,
                        }),
                        old,
                    )
                } else {
                    let (zero, old) = Self::insert_rec(zero, addr, entry);
                    (
                        Box::new(CbNode::Branch {
                            bit,
                            prefix,
                            zero,
                            one,
                        }),
                        old,
                    )
                }
            }
        }
    }

    /// Branch at `db` holding `old` and a fresh leaf, ordered by the new
    /// address's bit at `db`.
    fn join(old: Box<CbNode<T>>, addr: u64, entry: T, db: u32) -> Box<CbNode<T>> {
        let leaf = Box::new(CbNode::Leaf { addr, entry });
        let prefix = addr & hi_mask(db);
        let (zero, one) = if addr_bit(addr, db) == 1 {
            (old, leaf)
        } else {
            (leaf, old)
        };
        Box::new(CbNode::Branch {
            bit: db,
            prefix,
            zero,
            one,
        })
    }

    pub(crate) fn remove(&mut self, addr: u64) -> Option<T> {
        let node = self.root.take()?;
        let (rest, removed) = Self::remove_rec(node, addr);
        self.root = rest;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_rec(node: Box<CbNode<T>>, addr: u64) -> (Option<Box<CbNode<T>>>, Option<T>) {
        match *node {
            CbNode::Leaf { addr: a, entry } => {
                if a == addr {
                    (None, Some(entry))
                } else {
                    (Some(Box::new(CbNode::Leaf { addr: a, entry })), None)
                }
            }
            CbNode::Branch {
                bit,
                prefix,
                zero,
                one,
            } => {
                if (addr ^ prefix) & hi_mask(bit) != 0 {
                    return (
                        Some(Box::new(CbNode::Branch {
                            bit,
                            prefix,
                            zero,
                            one,
                        })),
                        None,
                    );
                }
                if addr_bit(addr, bit) == 1 {
                    let (one, removed) = Self::remove_rec(one, addr);
                    match one {
                        Some(one) => (
                            Some(Box::new(CbNode::Branch {
                                bit,
                                prefix,
                                zero,
                                one,
                            })),
                            removed,
                        ),
                        None => (Some(zero), removed),
                    }
                } else {
                    let (zero, removed) = Self::remove_rec(zero, addr);
                    match zero {
                        Some(zero) => (
                            Some(Box::new(CbNode::Branch {
                                bit,
                                prefix,
                                zero,
                                one,
                            })),
                            removed,
                        ),
                        None => (Some(one), removed),
                    }
                }
            }
        }
    }

    /// Smallest stored address `>= target`, with its entry.
    pub(crate) fn next_geq(&self, target: u64) -> Option<(u64, &T)> {
        Self::next_geq_rec(self.root.as_deref()?, target)
    }

    fn next_geq_rec(node: &CbNode<T>, target: u64) -> Option<(u64, &T)> {
        match node {
            CbNode::Leaf { addr, entry } => (*addr >= target).then_some((*addr, entry)),
            CbNode::Branch {
                bit,
                prefix,
                zero,
                one,
            } => {
                let t_hi = target & hi_mask(*bit);
                if t_hi != *prefix {
                    // Every leaf below shares `prefix`, so the shared high
                    // bits decide the whole subtree at once.
                    return (*prefix > t_hi).then(|| Self::min_leaf(node));
                }
                if addr_bit(target, *bit) == 0 {
                    Self::next_geq_rec(zero, target).or_else(|| Some(Self::min_leaf(one)))
                } else {
                    Self::next_geq_rec(one, target)
                }
            }
        }
    }

    fn min_leaf(mut node: &CbNode<T>) -> (u64, &T) {
        loop {
            match node {
                CbNode::Leaf { addr, entry } => return (*addr, entry),
                CbNode::Branch { zero, .. } => node = zero,
            }
        }
    }

    /// In-order visit of every (address, entry) pair.
    pub(crate) fn for_each<'a>(&'a self, f: &mut impl FnMut(u64, &'a T)) {
        fn rec<'a, T>(node: &'a CbNode<T>, f: &mut impl FnMut(u64, &'a T)) {
            match node {
                CbNode::Leaf { addr, entry } => f(*addr, entry),
                CbNode::Branch { zero, one, .. } => {
                    rec(zero, f);
                    rec(one, f);
                }
            }
        }
        if let Some(root) = &self.root {
            rec(root, f);
        }
    }

    /// Consume the map, pushing entries in address order.
    pub(crate) fn drain_in_order(self, out: &mut Vec<(u64, T)>) {
        fn rec<T>(node: Box<CbNode<T>>, out: &mut Vec<(u64, T)>) {
            match *node {
                CbNode::Leaf { addr, entry } => out.push((addr, entry)),
                CbNode::Branch { zero, one, .. } => {
                    rec(zero, out);
                    rec(one, out);
                }
            }
        }
        if let Some(root) = self.root {
            rec(root, out);
        }
    }

    /// Rough heap footprint of the index structure itself (entries excluded).
    pub(crate) fn node_bytes(&self) -> usize {
        if self.len == 0 {
            0
        } else {
            (2 * self.len - 1) * std::mem::size_of::<CbNode<T>>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn insert_get_replace() {
        let mut m: AddrMap<u32> = AddrMap::new();
        assert_eq!(m.insert(5, 50), None);
        assert_eq!(m.insert(9, 90), None);
        assert_eq!(m.insert(5, 55), Some(50));
        assert_eq!(m.get(5), Some(&55));
        assert_eq!(m.get(9), Some(&90));
        assert_eq!(m.get(6), None);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn remove_and_splice() {
        let mut m: AddrMap<u32> = AddrMap::new();
        for a in [3u64, 7, 1, 200, 64] {
            m.insert(a, a as u32);
        }
        assert_eq!(m.remove(7), Some(7));
        assert_eq!(m.remove(7), None);
        assert_eq!(m.get(7), None);
        assert_eq!(m.get(3), Some(&3));
        assert_eq!(m.len(), 4);
        assert_eq!(m.remove(3), Some(3));
        assert_eq!(m.remove(1), Some(1));
        assert_eq!(m.remove(64), Some(64));
        assert_eq!(m.remove(200), Some(200));
        assert_eq!(m.len(), 0);
        assert_eq!(m.next_geq(0), None);
    }

    #[test]
    fn next_geq_basics() {
        let mut m: AddrMap<()> = AddrMap::new();
        for a in [2u64, 8, 9, 1 << 40, u64::MAX] {
            m.insert(a, ());
        }
        assert_eq!(m.next_geq(0).map(|(a, _)| a), Some(2));
        assert_eq!(m.next_geq(2).map(|(a, _)| a), Some(2));
        assert_eq!(m.next_geq(3).map(|(a, _)| a), Some(8));
        assert_eq!(m.next_geq(10).map(|(a, _)| a), Some(1 << 40));
        assert_eq!(m.next_geq((1 << 40) + 1).map(|(a, _)| a), Some(u64::MAX));
        assert_eq!(m.next_geq(u64::MAX).map(|(a, _)| a), Some(u64::MAX));
    }

    #[test]
    fn randomized_against_btreemap() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(11);
        let mut m: AddrMap<u64> = AddrMap::new();
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for _ in 0..20_000 {
            // Cluster addresses so collisions and shared prefixes are common.
            let addr = rng.gen_range(0..2048u64) | (rng.gen_range(0..4u64) << 50);
            match rng.gen_range(0..100) {
                0..=44 => {
                    let v: u64 = rng.gen();
                    assert_eq!(m.insert(addr, v), model.insert(addr, v));
                }
                45..=69 => {
                    assert_eq!(m.remove(addr), model.remove(&addr));
                }
                70..=84 => {
                    assert_eq!(m.get(addr), model.get(&addr));
                }
                _ => {
                    let got = m.next_geq(addr).map(|(a, v)| (a, *v));
                    let want = model.range(addr..).next().map(|(a, v)| (*a, *v));
                    assert_eq!(got, want);
                }
            }
            assert_eq!(m.len(), model.len());
        }

        let mut seen = Vec::new();
        m.for_each(&mut |a, v| seen.push((a, *v)));
        let want: Vec<(u64, u64)> = model.iter().map(|(a, v)| (*a, *v)).collect();
        assert_eq!(seen, want);

        let mut drained = Vec::new();
        m.drain_in_order(&mut drained);
        assert_eq!(drained, want);
    }
}
