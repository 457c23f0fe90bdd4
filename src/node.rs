//! Trie node encoding and the recursive insert/remove machinery.
//!
//! A node owns `post_len` (bits left below its address bit), its
//! path-compression infix, separate postfix/subnode occupancy counts, and a
//! slot table in one of three physical representations:
//!
//! - `Sparse` (LHC): packed fixed-stride records sorted by address, binary
//!   searched. `[addr: dim bits][postfix: dim * post_len bits]` per record,
//!   with a parallel ref array holding the value or child. The postfix
//!   region of a child record is zero.
//! - `Dense` (AHC): `2^dim` direct-indexed slots, used once the sparse form
//!   would outgrow it.
//! - `Indexed` (NI): a crit-bit map from address to entry, used once the
//!   per-record shifting of the sparse form stops scaling.
//!
//! Representation migration happens synchronously inside the mutating call
//! whenever a size boundary is crossed.

use crate::bitbuf::{lo_mask, read_bits, write_bits, BitBuffer};
use crate::critbit::AddrMap;

/// Subnode count above which a node switches to the Indexed representation.
pub(crate) const NI_THRESHOLD_SUB: u32 = 500;
/// Postfix count above which a node switches to the Indexed representation.
pub(crate) const NI_THRESHOLD_POST: u32 = 50;
/// Per-slot reference cost charged by the size model, in bits.
const REF_BITS: u64 = 64;

/// Pack bit `post_len` of every dimension into a hypercube address.
/// Dimension 0 maps to the most significant address bit.
#[inline]
pub(crate) fn hc_pos(key: &[u64], post_len: u32) -> u64 {
    let mut pos = 0u64;
    for &k in key {
        pos = (pos << 1) | ((k >> post_len) & 1);
    }
    pos
}

/// Bit of dimension `d` within a hypercube address.
#[inline]
pub(crate) fn pos_bit(pos: u64, d: usize, dim: usize) -> u64 {
    (pos >> (dim - 1 - d)) & 1
}

#[inline]
fn post_width(dim: usize, post_len: u8) -> usize {
    dim * post_len as usize
}

#[inline]
fn rec_width(dim: usize, post_len: u8) -> usize {
    dim + post_width(dim, post_len)
}

fn size_sparse(n: u64, dim: usize, post_len: u8) -> u64 {
    n.saturating_mul(rec_width(dim, post_len) as u64 + REF_BITS)
}

fn size_dense(dim: usize, post_len: u8) -> u64 {
    let slots = if dim >= 64 { u64::MAX } else { 1u64 << dim };
    slots.saturating_mul(post_width(dim, post_len) as u64 + REF_BITS)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SlotKind {
    Empty,
    Post,
    Sub,
}

#[derive(Clone)]
pub(crate) enum SlotRef<V> {
    Post(V),
    Sub(Box<Node<V>>),
}

/// Borrowed view of a postfix's packed bits.
#[derive(Clone, Copy)]
pub(crate) struct PostBits<'a> {
    words: &'a [u64],
    off: usize,
}

impl<'a> PostBits<'a> {
    #[inline]
    pub(crate) fn dim_bits(&self, d: usize, post_len: u8) -> u64 {
        let pl = post_len as usize;
        read_bits(self.words, self.off + d * pl, pl)
    }
}

pub(crate) enum SlotView<'a, V> {
    Post(PostBits<'a>, &'a V),
    Sub(&'a Node<V>),
}

#[derive(Clone)]
pub(crate) struct Lhc<V> {
    /// Sorted fixed-stride records: `[addr: dim bits][postfix bits]`.
    bits: BitBuffer,
    refs: Vec<SlotRef<V>>,
}

impl<V> Lhc<V> {
    fn empty() -> Self {
        Self {
            bits: BitBuffer::new(),
            refs: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.refs.len()
    }

    #[inline]
    pub(crate) fn addr_at(&self, idx: usize, dim: usize, post_len: u8) -> u64 {
        self.bits.read(idx * rec_width(dim, post_len), dim)
    }

    /// Binary search by address: `Ok(idx)` if present, `Err(insertion_idx)`.
    pub(crate) fn search(&self, pos: u64, dim: usize, post_len: u8) -> Result<usize, usize> {
        let mut lo = 0;
        let mut hi = self.refs.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.addr_at(mid, dim, post_len) < pos {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.refs.len() && self.addr_at(lo, dim, post_len) == pos {
            Ok(lo)
        } else {
            Err(lo)
        }
    }

    pub(crate) fn view_at(&self, idx: usize, dim: usize, post_len: u8) -> SlotView<'_, V> {
        match &self.refs[idx] {
            SlotRef::Post(v) => SlotView::Post(
                PostBits {
                    words: self.bits.words(),
                    off: idx * rec_width(dim, post_len) + dim,
                },
                v,
            ),
            SlotRef::Sub(n) => SlotView::Sub(n),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Ahc<V> {
    /// `2^dim` fixed slots of `dim * post_len` bits each.
    bits: BitBuffer,
    refs: Vec<Option<SlotRef<V>>>,
}

impl<V> Ahc<V> {
    #[inline]
    pub(crate) fn slots(&self) -> usize {
        self.refs.len()
    }

    pub(crate) fn view_at(&self, pos: u64, dim: usize, post_len: u8) -> Option<SlotView<'_, V>> {
        match self.refs[pos as usize].as_ref()? {
            SlotRef::Post(v) => Some(SlotView::Post(
                PostBits {
                    words: self.bits.words(),
                    off: pos as usize * post_width(dim, post_len),
                },
                v,
            )),
            SlotRef::Sub(n) => Some(SlotView::Sub(n)),
        }
    }
}

/// Owned node entry; also the uniform exchange format for representation
/// migration and degenerate-node elimination.
#[derive(Clone)]
pub(crate) enum NiEntry<V> {
    /// Packed postfix words (`dim * post_len` bits) plus the value.
    Post(Box<[u64]>, V),
    Sub(Box<Node<V>>),
}

impl<V> NiEntry<V> {
    pub(crate) fn view(&self) -> SlotView<'_, V> {
        match self {
            NiEntry::Post(words, v) => SlotView::Post(PostBits { words, off: 0 }, v),
            NiEntry::Sub(n) => SlotView::Sub(n),
        }
    }
}

#[derive(Clone)]
pub(crate) enum Entries<V> {
    Sparse(Lhc<V>),
    Dense(Ahc<V>),
    Indexed(AddrMap<NiEntry<V>>),
}

#[derive(Clone)]
pub(crate) struct Node<V> {
    /// Bits below this node's address bit, per dimension.
    pub(crate) post_len: u8,
    pub(crate) infix_len: u8,
    /// One word per dimension when `infix_len > 0`, empty otherwise. Only
    /// bits `[post_len + 1, post_len + infix_len]` may be set.
    pub(crate) infix: Box<[u64]>,
    pub(crate) sub_count: u32,
    pub(crate) post_count: u32,
    pub(crate) entries: Entries<V>,
}

fn pack_post(key: &[u64], post_len: u8) -> Box<[u64]> {
    let pl = post_len as usize;
    let mut words = vec![0u64; (key.len() * pl).div_ceil(64)].into_boxed_slice();
    for (d, &k) in key.iter().enumerate() {
        write_bits(&mut words, d * pl, pl, k);
    }
    words
}

fn write_post_at(bits: &mut BitBuffer, off: usize, key: &[u64], post_len: u8) {
    let pl = post_len as usize;
    for (d, &k) in key.iter().enumerate() {
        bits.write(off + d * pl, pl, k);
    }
}

impl<V> Node<V> {
    fn empty_sparse(post_len: u8, infix_len: u8, infix: Box<[u64]>) -> Self {
        debug_assert_eq!(infix_len == 0, infix.is_empty());
        Self {
            post_len,
            infix_len,
            infix,
            sub_count: 0,
            post_count: 0,
            entries: Entries::Sparse(Lhc::empty()),
        }
    }

    pub(crate) fn new_root(depth: u8) -> Self {
        Self::empty_sparse(depth - 1, 0, Default::default())
    }

    #[inline]
    pub(crate) fn total(&self) -> u32 {
        self.sub_count + self.post_count
    }

    /// Highest bit position where `key` disagrees with this node's infix,
    /// or `None` when the infix matches (or is empty).
    pub(crate) fn infix_mismatch(&self, key: &[u64]) -> Option<u32> {
        if self.infix_len == 0 {
            return None;
        }
        let mask = lo_mask(self.infix_len as usize) << (self.post_len + 1);
        let mut best: Option<u32> = None;
        for (d, &k) in key.iter().enumerate() {
            let x = (k ^ self.infix[d]) & mask;
            if x != 0 {
                let b = 63 - x.leading_zeros();
                best = Some(best.map_or(b, |p| p.max(b)));
            }
        }
        best
    }

    pub(crate) fn slot_kind(&self, pos: u64, dim: usize) -> SlotKind {
        match self.get_slot(pos, dim) {
            None => SlotKind::Empty,
            Some(SlotView::Post(..)) => SlotKind::Post,
            Some(SlotView::Sub(_)) => SlotKind::Sub,
        }
    }

    pub(crate) fn get_slot(&self, pos: u64, dim: usize) -> Option<SlotView<'_, V>> {
        match &self.entries {
            Entries::Sparse(l) => {
                let idx = l.search(pos, dim, self.post_len).ok()?;
                Some(l.view_at(idx, dim, self.post_len))
            }
            Entries::Dense(a) => a.view_at(pos, dim, self.post_len),
            Entries::Indexed(m) => Some(m.get(pos)?.view()),
        }
    }

    /// Compare the postfix stored at `pos` against the low bits of `key`.
    /// Panics if the slot does not hold a postfix.
    pub(crate) fn post_equals_at(&self, pos: u64, key: &[u64], dim: usize) -> bool {
        let pl = self.post_len;
        match self.get_slot(pos, dim) {
            Some(SlotView::Post(pb, _)) => (0..dim)
                .all(|d| pb.dim_bits(d, pl) == key[d] & lo_mask(pl as usize)),
            _ => panic!("slot does not hold a postfix"),
        }
    }

    pub(crate) fn child_mut(&mut self, pos: u64, dim: usize) -> &mut Box<Node<V>> {
        let pl = self.post_len;
        match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = l.search(pos, dim, pl).expect("occupied slot");
                match &mut l.refs[idx] {
                    SlotRef::Sub(n) => n,
                    SlotRef::Post(_) => panic!("slot does not hold a subnode"),
                }
            }
            Entries::Dense(a) => match a.refs[pos as usize].as_mut() {
                Some(SlotRef::Sub(n)) => n,
                _ => panic!("slot does not hold a subnode"),
            },
            Entries::Indexed(m) => match m.get_mut(pos) {
                Some(NiEntry::Sub(n)) => n,
                _ => panic!("slot does not hold a subnode"),
            },
        }
    }

    /// Store a new postfix entry at an empty slot.
    pub(crate) fn insert_post(&mut self, pos: u64, key: &[u64], value: V, dim: usize) {
        let pl = self.post_len;
        match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = match l.search(pos, dim, pl) {
                    Err(idx) => idx,
                    Ok(_) => panic!("slot already occupied"),
                };
                let w = rec_width(dim, pl);
                l.bits.insert_gap(idx * w, w);
                l.bits.write(idx * w, dim, pos);
                write_post_at(&mut l.bits, idx * w + dim, key, pl);
                l.refs.insert(idx, SlotRef::Post(value));
            }
            Entries::Dense(a) => {
                debug_assert!(a.refs[pos as usize].is_none());
                write_post_at(&mut a.bits, pos as usize * post_width(dim, pl), key, pl);
                a.refs[pos as usize] = Some(SlotRef::Post(value));
            }
            Entries::Indexed(m) => {
                let old = m.insert(pos, NiEntry::Post(pack_post(key, pl), value));
                debug_assert!(old.is_none());
            }
        }
        self.post_count += 1;
    }

    /// Attach a subnode at an empty slot.
    pub(crate) fn set_sub(&mut self, pos: u64, child: Box<Node<V>>, dim: usize) {
        let pl = self.post_len;
        match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = match l.search(pos, dim, pl) {
                    Err(idx) => idx,
                    Ok(_) => panic!("slot already occupied"),
                };
                let w = rec_width(dim, pl);
                l.bits.insert_gap(idx * w, w);
                l.bits.write(idx * w, dim, pos);
                l.refs.insert(idx, SlotRef::Sub(child));
            }
            Entries::Dense(a) => {
                debug_assert!(a.refs[pos as usize].is_none());
                a.bits
                    .zero(pos as usize * post_width(dim, pl), post_width(dim, pl));
                a.refs[pos as usize] = Some(SlotRef::Sub(child));
            }
            Entries::Indexed(m) => {
                let old = m.insert(pos, NiEntry::Sub(child));
                debug_assert!(old.is_none());
            }
        }
        self.sub_count += 1;
    }

    /// Overwrite the value of the postfix at `pos`, returning the old one.
    pub(crate) fn replace_value(&mut self, pos: u64, value: V, dim: usize) -> V {
        let pl = self.post_len;
        let slot_ref = match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = l.search(pos, dim, pl).expect("occupied slot");
                &mut l.refs[idx]
            }
            Entries::Dense(a) => a.refs[pos as usize].as_mut().expect("occupied slot"),
            Entries::Indexed(m) => {
                return match m.get_mut(pos) {
                    Some(NiEntry::Post(_, v)) => std::mem::replace(v, value),
                    _ => panic!("slot does not hold a postfix"),
                };
            }
        };
        match slot_ref {
            SlotRef::Post(v) => std::mem::replace(v, value),
            SlotRef::Sub(_) => panic!("slot does not hold a postfix"),
        }
    }

    /// Rewrite the postfix bits at `pos` from `key`, keeping the value.
    pub(crate) fn rewrite_post(&mut self, pos: u64, key: &[u64], dim: usize) {
        let pl = self.post_len;
        match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = l.search(pos, dim, pl).expect("occupied slot");
                write_post_at(&mut l.bits, idx * rec_width(dim, pl) + dim, key, pl);
            }
            Entries::Dense(a) => {
                write_post_at(&mut a.bits, pos as usize * post_width(dim, pl), key, pl);
            }
            Entries::Indexed(m) => match m.get_mut(pos) {
                Some(NiEntry::Post(words, _)) => {
                    let plu = pl as usize;
                    for (d, &k) in key.iter().enumerate() {
                        write_bits(words, d * plu, plu, k);
                    }
                }
                _ => panic!("slot does not hold a postfix"),
            },
        }
    }

    /// Remove the postfix at `pos`, returning its value.
    pub(crate) fn remove_post(&mut self, pos: u64, dim: usize) -> V {
        let pl = self.post_len;
        self.post_count -= 1;
        match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = l.search(pos, dim, pl).expect("occupied slot");
                let w = rec_width(dim, pl);
                l.bits.remove_range(idx * w, w);
                match l.refs.remove(idx) {
                    SlotRef::Post(v) => v,
                    SlotRef::Sub(_) => panic!("slot does not hold a postfix"),
                }
            }
            Entries::Dense(a) => {
                let pw = post_width(dim, pl);
                a.bits.zero(pos as usize * pw, pw);
                match a.refs[pos as usize].take() {
                    Some(SlotRef::Post(v)) => v,
                    _ => panic!("slot does not hold a postfix"),
                }
            }
            Entries::Indexed(m) => match m.remove(pos) {
                Some(NiEntry::Post(_, v)) => v,
                _ => panic!("slot does not hold a postfix"),
            },
        }
    }

    /// Turn the postfix slot at `pos` into a subnode slot, returning the
    /// displaced value.
    fn replace_post_with_sub(&mut self, pos: u64, child: Box<Node<V>>, dim: usize) -> V {
        let pl = self.post_len;
        self.sub_count += 1;
        self.post_count -= 1;
        match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = l.search(pos, dim, pl).expect("occupied slot");
                let w = rec_width(dim, pl);
                l.bits.zero(idx * w + dim, post_width(dim, pl));
                match std::mem::replace(&mut l.refs[idx], SlotRef::Sub(child)) {
                    SlotRef::Post(v) => v,
                    SlotRef::Sub(_) => panic!("slot does not hold a postfix"),
                }
            }
            Entries::Dense(a) => {
                let pw = post_width(dim, pl);
                a.bits.zero(pos as usize * pw, pw);
                match std::mem::replace(&mut a.refs[pos as usize], Some(SlotRef::Sub(child))) {
                    Some(SlotRef::Post(v)) => v,
                    _ => panic!("slot does not hold a postfix"),
                }
            }
            Entries::Indexed(m) => match m.insert(pos, NiEntry::Sub(child)) {
                Some(NiEntry::Post(_, v)) => v,
                _ => panic!("slot does not hold a postfix"),
            },
        }
    }

    /// Turn the subnode slot at `pos` into a postfix slot (degenerate-child
    /// elimination: the lifted key's low bits arrive pre-assembled).
    fn replace_sub_with_post(&mut self, pos: u64, key_low: &[u64], value: V, dim: usize) {
        let pl = self.post_len;
        self.sub_count -= 1;
        self.post_count += 1;
        match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = l.search(pos, dim, pl).expect("occupied slot");
                write_post_at(&mut l.bits, idx * rec_width(dim, pl) + dim, key_low, pl);
                match std::mem::replace(&mut l.refs[idx], SlotRef::Post(value)) {
                    SlotRef::Sub(_) => {}
                    SlotRef::Post(_) => panic!("slot does not hold a subnode"),
                }
            }
            Entries::Dense(a) => {
                write_post_at(&mut a.bits, pos as usize * post_width(dim, pl), key_low, pl);
                match std::mem::replace(&mut a.refs[pos as usize], Some(SlotRef::Post(value))) {
                    Some(SlotRef::Sub(_)) => {}
                    _ => panic!("slot does not hold a subnode"),
                }
            }
            Entries::Indexed(m) => {
                match m.insert(pos, NiEntry::Post(pack_post(key_low, pl), value)) {
                    Some(NiEntry::Sub(_)) => {}
                    _ => panic!("slot does not hold a subnode"),
                }
            }
        }
    }

    /// Replace the subnode at `pos` with another subnode (child splice).
    fn replace_sub_with_sub(&mut self, pos: u64, child: Box<Node<V>>, dim: usize) {
        match &mut self.entries {
            Entries::Sparse(l) => {
                let idx = l.search(pos, dim, self.post_len).expect("occupied slot");
                match std::mem::replace(&mut l.refs[idx], SlotRef::Sub(child)) {
                    SlotRef::Sub(_) => {}
                    SlotRef::Post(_) => panic!("slot does not hold a subnode"),
                }
            }
            Entries::Dense(a) => {
                match std::mem::replace(&mut a.refs[pos as usize], Some(SlotRef::Sub(child))) {
                    Some(SlotRef::Sub(_)) => {}
                    _ => panic!("slot does not hold a subnode"),
                }
            }
            Entries::Indexed(m) => match m.insert(pos, NiEntry::Sub(child)) {
                Some(NiEntry::Sub(_)) => {}
                _ => panic!("slot does not hold a subnode"),
            },
        }
    }

    // =========================================================================
    // Representation migration
    // =========================================================================

    /// Drain every entry into the uniform owned format, in address order.
    /// Leaves an empty sparse table behind.
    fn take_owned(&mut self, dim: usize) -> Vec<(u64, NiEntry<V>)> {
        let pl = self.post_len;
        let pw = post_width(dim, pl);
        match std::mem::replace(&mut self.entries, Entries::Sparse(Lhc::empty())) {
            Entries::Sparse(l) => {
                let Lhc { bits, refs } = l;
                let w = rec_width(dim, pl);
                refs.into_iter()
                    .enumerate()
                    .map(|(i, r)| {
                        let addr = read_bits(bits.words(), i * w, dim);
                        let e = match r {
                            SlotRef::Post(v) => {
                                let mut words = vec![0u64; pw.div_ceil(64)].into_boxed_slice();
                                crate::bitbuf::copy_bits(
                                    bits.words(),
                                    i * w + dim,
                                    &mut words,
                                    0,
                                    pw,
                                );
                                NiEntry::Post(words, v)
                            }
                            SlotRef::Sub(n) => NiEntry::Sub(n),
                        };
                        (addr, e)
                    })
                    .collect()
            }
            Entries::Dense(a) => {
                let Ahc { bits, refs } = a;
                let mut out = Vec::new();
                for (pos, slot) in refs.into_iter().enumerate() {
                    let Some(r) = slot else { continue };
                    let e = match r {
                        SlotRef::Post(v) => {
                            let mut words = vec![0u64; pw.div_ceil(64)].into_boxed_slice();
                            crate::bitbuf::copy_bits(bits.words(), pos * pw, &mut words, 0, pw);
                            NiEntry::Post(words, v)
                        }
                        SlotRef::Sub(n) => NiEntry::Sub(n),
                    };
                    out.push((pos as u64, e));
                }
                out
            }
            Entries::Indexed(m) => {
                let mut out = Vec::with_capacity(m.len());
                m.drain_in_order(&mut out);
                out
            }
        }
    }

    fn rebuild_sparse(&mut self, dim: usize) {
        let pl = self.post_len;
        let w = rec_width(dim, pl);
        let pw = post_width(dim, pl);
        let items = self.take_owned(dim);
        let mut bits = BitBuffer::with_len(items.len() * w);
        let mut refs = Vec::with_capacity(items.len());
        for (i, (addr, e)) in items.into_iter().enumerate() {
            bits.write(i * w, dim, addr);
            match e {
                NiEntry::Post(words, v) => {
                    bits.copy_in(i * w + dim, &words, 0, pw);
                    refs.push(SlotRef::Post(v));
                }
                NiEntry::Sub(n) => refs.push(SlotRef::Sub(n)),
            }
        }
        self.entries = Entries::Sparse(Lhc { bits, refs });
    }

    fn rebuild_dense(&mut self, dim: usize) {
        debug_assert!(dim < 32, "dense representation at unreasonable dimensionality");
        let pl = self.post_len;
        let pw = post_width(dim, pl);
        let slots = 1usize << dim;
        let items = self.take_owned(dim);
        let mut bits = BitBuffer::with_len(slots * pw);
        let mut refs: Vec<Option<SlotRef<V>>> = Vec::with_capacity(slots);
        refs.resize_with(slots, || None);
        for (addr, e) in items {
            match e {
                NiEntry::Post(words, v) => {
                    bits.copy_in(addr as usize * pw, &words, 0, pw);
                    refs[addr as usize] = Some(SlotRef::Post(v));
                }
                NiEntry::Sub(n) => refs[addr as usize] = Some(SlotRef::Sub(n)),
            }
        }
        self.entries = Entries::Dense(Ahc { bits, refs });
    }

    fn rebuild_indexed(&mut self, dim: usize) {
        let items = self.take_owned(dim);
        let mut m = AddrMap::new();
        for (addr, e) in items {
            m.insert(addr, e);
        }
        self.entries = Entries::Indexed(m);
    }

    #[inline]
    fn over_ni_threshold(&self) -> bool {
        self.post_count > NI_THRESHOLD_POST || self.sub_count > NI_THRESHOLD_SUB
    }

    /// Re-encode the slot table if the last mutation crossed a size
    /// boundary. The target representation is a pure function of the
    /// occupancy counts, so the strict `<` on the dense boundary is the
    /// only hysteresis needed.
    pub(crate) fn check_representation(&mut self, dim: usize) {
        let n = self.total() as u64;
        let want_indexed = self.over_ni_threshold();
        let want_dense = !want_indexed
            && size_sparse(n + 1, dim, self.post_len) >= size_dense(dim, self.post_len);
        match (&self.entries, want_indexed, want_dense) {
            (Entries::Indexed(_), true, _) => {}
            (Entries::Dense(_), false, true) => {}
            (Entries::Sparse(_), false, false) => {}
            (_, true, _) => self.rebuild_indexed(dim),
            (_, false, true) => self.rebuild_dense(dim),
            (_, false, false) => self.rebuild_sparse(dim),
        }
    }

    // =========================================================================
    // Degenerate-node elimination
    // =========================================================================

    /// Splice out the child at `pos`, which has decayed to a single occupied
    /// slot: lift its postfix into this node, or reattach its sole subnode
    /// with a concatenated infix.
    pub(crate) fn collapse_child(&mut self, pos: u64, dim: usize) {
        let child = self.child_mut(pos, dim);
        debug_assert_eq!(child.total(), 1);
        let c_pl = child.post_len as u32;
        let c_il = child.infix_len as u32;
        let c_infix = std::mem::take(&mut child.infix);
        let mut items = child.take_owned(dim);
        let (cpos, residue) = items.pop().expect("degenerate child holds one entry");
        debug_assert!(items.is_empty());

        match residue {
            NiEntry::Post(words, v) => {
                // The lifted postfix regains the child's infix and consumed
                // address bit: [child postfix][address bit][child infix].
                let mut key_low = vec![0u64; dim];
                for (d, k) in key_low.iter_mut().enumerate() {
                    let mut w = read_bits(&words, d * c_pl as usize, c_pl as usize);
                    w |= pos_bit(cpos, d, dim) << c_pl;
                    if c_il > 0 {
                        w |= c_infix[d];
                    }
                    *k = w;
                }
                self.replace_sub_with_post(pos, &key_low, v, dim);
            }
            NiEntry::Sub(mut grand) => {
                let mut infix = vec![0u64; dim];
                for (d, w) in infix.iter_mut().enumerate() {
                    let mut x = if grand.infix_len > 0 { grand.infix[d] } else { 0 };
                    x |= pos_bit(cpos, d, dim) << c_pl;
                    if c_il > 0 {
                        x |= c_infix[d];
                    }
                    *w = x;
                }
                grand.infix_len = (c_il + 1 + grand.infix_len as u32) as u8;
                grand.infix = infix.into_boxed_slice();
                self.replace_sub_with_sub(pos, grand, dim);
            }
        }
    }

    /// Rough heap footprint of this subtree.
    pub(crate) fn heap_bytes(&self, dim: usize) -> usize {
        let mut total = std::mem::size_of::<Node<V>>() + self.infix.len() * 8;
        match &self.entries {
            Entries::Sparse(l) => {
                total += l.bits.heap_bytes() + l.refs.capacity() * std::mem::size_of::<SlotRef<V>>();
                for r in &l.refs {
                    if let SlotRef::Sub(n) = r {
                        total += n.heap_bytes(dim);
                    }
                }
            }
            Entries::Dense(a) => {
                total += a.bits.heap_bytes()
                    + a.refs.capacity() * std::mem::size_of::<Option<SlotRef<V>>>();
                for r in a.refs.iter().flatten() {
                    if let SlotRef::Sub(n) = r {
                        total += n.heap_bytes(dim);
                    }
                }
            }
            Entries::Indexed(m) => {
                total += m.node_bytes();
                m.for_each(&mut |_, e| {
                    total += match e {
                        NiEntry::Post(words, _) => words.len() * 8,
                        NiEntry::Sub(n) => n.heap_bytes(dim),
                    };
                });
            }
        }
        total
    }
}

// =============================================================================
// Recursive operations
// =============================================================================

/// Insert below `slot`, splitting the node when `key` conflicts with its
/// infix. `slot` may be replaced wholesale, which is why the owning box is
/// threaded down instead of a parent pointer being stored.
pub(crate) fn insert_rec<V>(
    slot: &mut Box<Node<V>>,
    key: &[u64],
    value: V,
    dim: usize,
) -> Option<V> {
    if let Some(split_bit) = slot.infix_mismatch(key) {
        split_above(slot, key, value, split_bit, dim);
        return None;
    }
    let pos = hc_pos(key, slot.post_len as u32);
    match slot.slot_kind(pos, dim) {
        SlotKind::Empty => {
            slot.insert_post(pos, key, value, dim);
            slot.check_representation(dim);
            None
        }
        SlotKind::Sub => insert_rec(slot.child_mut(pos, dim), key, value, dim),
        SlotKind::Post => {
            if slot.post_equals_at(pos, key, dim) {
                return Some(slot.replace_value(pos, value, dim));
            }
            split_post_pair(slot, pos, key, value, dim);
            slot.check_representation(dim);
            None
        }
    }
}

/// The slot at `pos` holds a postfix for a different key: push both keys one
/// level down into a fresh subnode whose infix is their remaining shared run.
fn split_post_pair<V>(node: &mut Node<V>, pos: u64, key: &[u64], value: V, dim: usize) {
    let pl = node.post_len;
    let mut old_key = vec![0u64; dim];
    match node.get_slot(pos, dim) {
        Some(SlotView::Post(pb, _)) => {
            for (d, k) in old_key.iter_mut().enumerate() {
                *k = pb.dim_bits(d, pl);
            }
        }
        _ => panic!("slot does not hold a postfix"),
    }

    let child = Box::new(pair_shell(pl, &old_key, key, dim));
    let child_pl = child.post_len as u32;
    let old_pos = hc_pos(&old_key, child_pl);
    let new_pos = hc_pos(key, child_pl);
    debug_assert_ne!(old_pos, new_pos);

    let old_value = node.replace_post_with_sub(pos, child, dim);
    let child = node.child_mut(pos, dim);
    child.insert_post(old_pos, &old_key, old_value, dim);
    child.insert_post(new_pos, key, value, dim);
    child.check_representation(dim);
}

/// Node shell for two diverging keys: its address bit is their highest
/// differing bit below `parent_post_len`, its infix the shared run above.
fn pair_shell<V>(parent_post_len: u8, a: &[u64], b: &[u64], dim: usize) -> Node<V> {
    let region = lo_mask(parent_post_len as usize);
    let mut db = 0u32;
    let mut diverged = false;
    for d in 0..dim {
        let x = (a[d] ^ b[d]) & region;
        if x != 0 {
            diverged = true;
            db = db.max(63 - x.leading_zeros());
        }
    }
    assert!(diverged, "cannot split identical keys");

    let post_len = db as u8;
    let infix_len = parent_post_len - post_len - 1;
    let infix: Box<[u64]> = if infix_len == 0 {
        Default::default()
    } else {
        let m = lo_mask(infix_len as usize) << (db + 1);
        a.iter().map(|&w| w & m).collect()
    };
    Node::empty_sparse(post_len, infix_len, infix)
}

/// `key` diverges from `slot`'s infix at `split_bit`: insert a new ancestor
/// above it holding the shared upper part of the infix, demote the current
/// node to a child, and add `key` as a sibling postfix.
fn split_above<V>(slot: &mut Box<Node<V>>, key: &[u64], value: V, split_bit: u32, dim: usize) {
    let node_pl = slot.post_len as u32;
    let node_il = slot.infix_len as u32;
    debug_assert!(split_bit > node_pl && split_bit <= node_pl + node_il);

    let upper_len = (node_pl + node_il - split_bit) as u8;
    let lower_len = (split_bit - node_pl - 1) as u8;

    let upper_infix: Box<[u64]> = if upper_len == 0 {
        Default::default()
    } else {
        let m = lo_mask(upper_len as usize) << (split_bit + 1);
        slot.infix.iter().map(|&w| w & m).collect()
    };
    let node_pos = hc_pos(&slot.infix, split_bit);
    let key_pos = hc_pos(key, split_bit);
    debug_assert_ne!(node_pos, key_pos);

    let above = Box::new(Node::empty_sparse(split_bit as u8, upper_len, upper_infix));
    let mut old = std::mem::replace(slot, above);
    old.infix_len = lower_len;
    old.infix = if lower_len == 0 {
        Default::default()
    } else {
        let m = lo_mask(lower_len as usize) << (node_pl + 1);
        old.infix.iter().map(|&w| w & m).collect()
    };

    slot.insert_post(key_pos, key, value, dim);
    slot.set_sub(node_pos, old, dim);
    slot.check_representation(dim);
}

/// Remove `key` below `node`. Degenerate children are eliminated here, at
/// the parent, which still holds the slot pointing at them.
pub(crate) fn remove_rec<V>(node: &mut Node<V>, key: &[u64], dim: usize) -> Option<V> {
    if node.infix_mismatch(key).is_some() {
        return None;
    }
    let pos = hc_pos(key, node.post_len as u32);
    match node.slot_kind(pos, dim) {
        SlotKind::Empty => None,
        SlotKind::Post => {
            if !node.post_equals_at(pos, key, dim) {
                return None;
            }
            let v = node.remove_post(pos, dim);
            node.check_representation(dim);
            Some(v)
        }
        SlotKind::Sub => {
            let v = remove_rec(node.child_mut(pos, dim), key, dim)?;
            if node.child_mut(pos, dim).total() == 1 {
                node.collapse_child(pos, dim);
                node.check_representation(dim);
            }
            Some(v)
        }
    }
}

/// Attempt the in-place key rewrite for `update`: when the old and new keys
/// agree on every bit at or above the found node's address bit, the entry
/// keeps its slot and record and only the stored postfix changes.
///
/// The caller has already verified that `old` is present and `new` absent.
pub(crate) fn update_in_place<V>(node: &mut Node<V>, old: &[u64], new: &[u64], dim: usize) -> bool {
    let pl = node.post_len as u32;
    let pos = hc_pos(old, pl);
    match node.slot_kind(pos, dim) {
        SlotKind::Sub => update_in_place(node.child_mut(pos, dim), old, new, dim),
        SlotKind::Post => {
            if old.iter().zip(new).all(|(&o, &n)| (o ^ n) >> pl == 0) {
                node.rewrite_post(pos, new, dim);
                true
            } else {
                false
            }
        }
        SlotKind::Empty => false,
    }
}

// =============================================================================
// Test-only invariant walker
// =============================================================================

#[cfg(test)]
impl<V> Node<V> {
    /// Walk the subtree checking structural invariants; returns the number
    /// of reachable entries.
    pub(crate) fn validate(&self, dim: usize, is_root: bool, parent_post_len: Option<u8>) -> usize {
        if let Some(pp) = parent_post_len {
            assert_eq!(
                self.post_len as u32 + self.infix_len as u32 + 1,
                pp as u32,
                "post_len chain broken"
            );
        }
        if !is_root {
            assert!(self.total() >= 2, "degenerate non-root node");
        }
        if self.infix_len == 0 {
            assert!(self.infix.is_empty(), "empty infix must have no words");
        } else {
            assert_eq!(self.infix.len(), dim);
            let m = lo_mask(self.infix_len as usize) << (self.post_len + 1);
            for &w in self.infix.iter() {
                assert_eq!(w & !m, 0, "infix bits outside the infix range");
            }
        }

        match &self.entries {
            Entries::Indexed(_) => assert!(
                self.over_ni_threshold(),
                "indexed node below the NI thresholds"
            ),
            Entries::Sparse(_) | Entries::Dense(_) => assert!(
                !self.over_ni_threshold(),
                "array node above the NI thresholds"
            ),
        }
        let n = self.total() as u64;
        match &self.entries {
            Entries::Sparse(_) => assert!(
                size_sparse(n + 1, dim, self.post_len) < size_dense(dim, self.post_len),
                "sparse node past the dense size boundary"
            ),
            Entries::Dense(_) => assert!(
                size_sparse(n + 1, dim, self.post_len) >= size_dense(dim, self.post_len),
                "dense node below the sparse size boundary"
            ),
            Entries::Indexed(_) => {}
        }

        let mut posts = 0u32;
        let mut subs = 0u32;
        let mut entries = 0usize;
        let mut visit = |view: SlotView<'_, V>| match view {
            SlotView::Post(..) => {
                posts += 1;
                entries += 1;
            }
            SlotView::Sub(child) => {
                subs += 1;
                entries += child.validate(dim, false, Some(self.post_len));
            }
        };
        match &self.entries {
            Entries::Sparse(l) => {
                let mut prev: Option<u64> = None;
                for i in 0..l.len() {
                    let addr = l.addr_at(i, dim, self.post_len);
                    if let Some(p) = prev {
                        assert!(p < addr, "sparse records out of order");
                    }
                    prev = Some(addr);
                    visit(l.view_at(i, dim, self.post_len));
                }
            }
            Entries::Dense(a) => {
                assert_eq!(a.slots(), 1usize << dim);
                for pos in 0..a.slots() as u64 {
                    if let Some(view) = a.view_at(pos, dim, self.post_len) {
                        visit(view);
                    }
                }
            }
            Entries::Indexed(m) => {
                m.for_each(&mut |_, e| visit(e.view()));
            }
        }
        assert_eq!(posts, self.post_count, "postfix count out of sync");
        assert_eq!(subs, self.sub_count, "subnode count out of sync");
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hc_pos_packs_msb_first() {
        // dim 0 -> most significant address bit
        let key = [0b100u64, 0b000, 0b100];
        assert_eq!(hc_pos(&key, 2), 0b101);
        assert_eq!(hc_pos(&key, 0), 0b000);
        assert_eq!(pos_bit(0b101, 0, 3), 1);
        assert_eq!(pos_bit(0b101, 1, 3), 0);
        assert_eq!(pos_bit(0b101, 2, 3), 1);
    }

    #[test]
    fn pair_shell_geometry() {
        // keys diverge at bit 4; bits 5 and 6 are shared infix below post_len 7
        let a = [0b0110_1010u64];
        let b = [0b0111_1010u64];
        let n: Node<()> = pair_shell(7, &a, &b, 1);
        assert_eq!(n.post_len, 4);
        assert_eq!(n.infix_len, 2);
        assert_eq!(n.infix[0], 0b0110_0000);
    }

    #[test]
    fn size_model_crossover() {
        // dim 2, post_len 7: dense wins from the fourth entry
        assert!(size_sparse(3, 2, 7) < size_dense(2, 7));
        assert!(size_sparse(4, 2, 7) >= size_dense(2, 7));
        // high dimensionality never selects dense
        assert!(size_sparse(551, 40, 30) < size_dense(40, 30));
    }
}
