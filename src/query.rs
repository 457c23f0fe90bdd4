//! Window and extent query iterators.
//!
//! Both traverse depth-first over an explicit frame stack; entries are
//! produced lazily, one advance per pull. At every visited node the window
//! iterator derives two k-bit limit masks from the query box: `lower` bit d
//! set means dimension d's lower half cannot contain a match, `upper` bit d
//! set means its upper half can. A slot address `pos` can match only if
//! `((pos | lower) & upper) == pos`. Depending on how many addresses the
//! masks admit relative to the node's occupancy, a node is either scanned
//! linearly with that filter, or walked with the increment trick, which
//! steps directly from one conforming address to the next.

use smallvec::SmallVec;

use crate::bitbuf::lo_mask;
use crate::node::{pos_bit, Entries, Node, SlotView};

/// Per-frame fixed key bits; inline up to four dimensions.
type Prefix = SmallVec<[u64; 4]>;

#[inline]
fn mask_ok(pos: u64, lower: u64, upper: u64) -> bool {
    ((pos | lower) & upper) == pos
}

/// Next address after `v` that satisfies the limit masks. `v` must itself
/// satisfy them; a result `<= v` means the conforming space wrapped.
#[inline]
fn inc(v: u64, lower: u64, upper: u64) -> u64 {
    ((v | !upper).wrapping_add(1)) & upper | lower
}

enum Cursor {
    /// Linear record scan with the mask filter.
    SparseScan { idx: usize },
    /// Linear slot scan with the mask filter.
    DenseScan { pos: u64 },
    /// Ordered walk of the indexed map with the mask filter.
    IndexedScan { target: u64, exhausted: bool },
    /// Increment trick: probe exactly the conforming addresses.
    Jump { target: u64, exhausted: bool },
}

struct Frame<'t, V> {
    node: &'t Node<V>,
    /// Key bits fixed above this node's address bit (path prefix + infixes).
    prefix: Prefix,
    lower: u64,
    upper: u64,
    cursor: Cursor,
}

fn choose_cursor<V>(node: &Node<V>, lower: u64, upper: u64) -> Cursor {
    let free = upper & !lower;
    let max_matches = match free.count_ones() {
        64 => u64::MAX,
        b => 1u64 << b,
    };
    let admits_most = |n: u64| max_matches.saturating_mul(2) >= n;
    match &node.entries {
        Entries::Sparse(l) => {
            if admits_most(l.len() as u64) {
                Cursor::SparseScan { idx: 0 }
            } else {
                Cursor::Jump {
                    target: lower,
                    exhausted: false,
                }
            }
        }
        Entries::Dense(a) => {
            if admits_most(a.slots() as u64) {
                Cursor::DenseScan { pos: 0 }
            } else {
                Cursor::Jump {
                    target: lower,
                    exhausted: false,
                }
            }
        }
        Entries::Indexed(m) => {
            if admits_most(m.len() as u64) {
                Cursor::IndexedScan {
                    target: lower,
                    exhausted: false,
                }
            } else {
                Cursor::Jump {
                    target: lower,
                    exhausted: false,
                }
            }
        }
    }
}

fn make_frame<'t, V>(
    node: &'t Node<V>,
    prefix: Prefix,
    min: &[u64],
    max: &[u64],
    dim: usize,
) -> Frame<'t, V> {
    let pl = node.post_len as u32;
    let mut lower = 0u64;
    let mut upper = 0u64;
    for d in 0..dim {
        lower <<= 1;
        upper <<= 1;
        // Smallest value of this dimension's upper half within the node.
        let bisection = prefix[d] | (1u64 << pl);
        if min[d] >= bisection {
            lower |= 1;
        }
        if max[d] >= bisection {
            upper |= 1;
        }
    }
    let cursor = choose_cursor(node, lower, upper);
    Frame {
        node,
        prefix,
        lower,
        upper,
        cursor,
    }
}

/// Next mask-conforming occupied slot of the frame's node, or `None` when
/// the node is exhausted.
fn frame_next<'t, V>(f: &mut Frame<'t, V>, dim: usize) -> Option<(u64, SlotView<'t, V>)> {
    let node = f.node;
    let pl = node.post_len;
    loop {
        match &mut f.cursor {
            Cursor::SparseScan { idx } => {
                let Entries::Sparse(l) = &node.entries else {
                    unreachable!()
                };
                if *idx >= l.len() {
                    return None;
                }
                let i = *idx;
                *idx += 1;
                let pos = l.addr_at(i, dim, pl);
                if !mask_ok(pos, f.lower, f.upper) {
                    continue;
                }
                return Some((pos, l.view_at(i, dim, pl)));
            }
            Cursor::DenseScan { pos } => {
                let Entries::Dense(a) = &node.entries else {
                    unreachable!()
                };
                let slots = a.slots() as u64;
                while *pos < slots {
                    let p = *pos;
                    *pos += 1;
                    if !mask_ok(p, f.lower, f.upper) {
                        continue;
                    }
                    if let Some(view) = a.view_at(p, dim, pl) {
                        return Some((p, view));
                    }
                }
                return None;
            }
            Cursor::IndexedScan { target, exhausted } => {
                if *exhausted {
                    return None;
                }
                let Entries::Indexed(m) = &node.entries else {
                    unreachable!()
                };
                let Some((pos, entry)) = m.next_geq(*target) else {
                    *exhausted = true;
                    return None;
                };
                // Conforming addresses are numerically within [lower, upper].
                if pos >= f.upper {
                    *exhausted = true;
                    if pos > f.upper {
                        return None;
                    }
                } else {
                    *target = pos + 1;
                }
                if mask_ok(pos, f.lower, f.upper) {
                    return Some((pos, entry.view()));
                }
                if *exhausted {
                    return None;
                }
            }
            Cursor::Jump { target, exhausted } => {
                if *exhausted {
                    return None;
                }
                let p = *target;
                let next = inc(p, f.lower, f.upper);
                if next <= p {
                    *exhausted = true;
                } else {
                    *target = next;
                }
                let hit = match &node.entries {
                    Entries::Sparse(l) => match l.search(p, dim, pl) {
                        Ok(idx) => Some(l.view_at(idx, dim, pl)),
                        Err(idx) => {
                            if idx >= l.len() {
                                // every record is below the probe; later
                                // probes only grow
                                *exhausted = true;
                            }
                            None
                        }
                    },
                    Entries::Dense(a) => a.view_at(p, dim, pl),
                    Entries::Indexed(m) => m.get(p).map(|e| e.view()),
                };
                if let Some(view) = hit {
                    return Some((p, view));
                }
                if *exhausted {
                    return None;
                }
            }
        }
    }
}

/// Lazy window query over `[min, max]`, both bounds inclusive.
///
/// Yields entries in hypercube address order within each node, depth-first.
/// Besides the allocating [`Iterator`] interface there is a zero-allocation
/// [`Query::next_reuse`] that hands out the iterator's internal key buffer.
pub struct Query<'t, V> {
    dim: usize,
    min: Box<[u64]>,
    max: Box<[u64]>,
    stack: Vec<Frame<'t, V>>,
    key_buf: Box<[u64]>,
}

impl<'t, V> Query<'t, V> {
    pub(crate) fn new(root: Option<&'t Node<V>>, min: &[u64], max: &[u64], dim: usize) -> Self {
        let mut q = Query {
            dim,
            min: min.to_vec().into_boxed_slice(),
            max: max.to_vec().into_boxed_slice(),
            stack: Vec::new(),
            key_buf: vec![0u64; dim].into_boxed_slice(),
        };
        let empty = min.iter().zip(max.iter()).any(|(a, b)| a > b);
        if let (Some(root), false) = (root, empty) {
            let mut prefix: Prefix = SmallVec::from_elem(0u64, dim);
            if root.infix_len > 0 {
                prefix.copy_from_slice(&root.infix);
            }
            let frame = make_frame(root, prefix, &q.min, &q.max, dim);
            q.stack.push(frame);
        }
        q
    }

    fn advance(&mut self) -> Option<&'t V> {
        let dim = self.dim;
        loop {
            let top = self.stack.last_mut()?;
            let pl = top.node.post_len;
            match frame_next(top, dim) {
                None => {
                    self.stack.pop();
                }
                Some((pos, SlotView::Post(pb, v))) => {
                    let prefix = &self.stack.last().expect("live frame").prefix;
                    let mut inside = true;
                    for d in 0..dim {
                        let k = prefix[d] | (pos_bit(pos, d, dim) << pl) | pb.dim_bits(d, pl);
                        self.key_buf[d] = k;
                        if k < self.min[d] || k > self.max[d] {
                            inside = false;
                        }
                    }
                    if inside {
                        return Some(v);
                    }
                }
                Some((pos, SlotView::Sub(child))) => {
                    // Extend the prefix with the address bit and the child's
                    // infix, then prune the subtree against the query box.
                    let prefix = &self.stack.last().expect("live frame").prefix;
                    let span = lo_mask(child.post_len as usize + 1);
                    let mut cpref: Prefix = SmallVec::with_capacity(dim);
                    let mut overlaps = true;
                    for d in 0..dim {
                        let mut p = prefix[d] | (pos_bit(pos, d, dim) << pl);
                        if child.infix_len > 0 {
                            p |= child.infix[d];
                        }
                        // the subtree spans [p, p | span] in this dimension
                        if p > self.max[d] || (p | span) < self.min[d] {
                            overlaps = false;
                        }
                        cpref.push(p);
                    }
                    if overlaps {
                        let frame = make_frame(child, cpref, &self.min, &self.max, dim);
                        self.stack.push(frame);
                    }
                }
            }
        }
    }

    /// Zero-allocation advance. The returned key slice borrows the
    /// iterator's internal buffer and is valid only until the next advance.
    pub fn next_reuse(&mut self) -> Option<(&[u64], &'t V)> {
        let v = self.advance()?;
        Some((&self.key_buf, v))
    }
}

impl<'t, V> Iterator for Query<'t, V> {
    type Item = (Box<[u64]>, &'t V);

    fn next(&mut self) -> Option<Self::Item> {
        let v = self.advance()?;
        Some((self.key_buf.clone(), v))
    }
}

enum ExtCursor {
    Sparse { idx: usize },
    Dense { pos: u64 },
    Indexed { target: u64, exhausted: bool },
}

struct ExtFrame<'t, V> {
    node: &'t Node<V>,
    prefix: Prefix,
    cursor: ExtCursor,
}

fn ext_frame_next<'t, V>(f: &mut ExtFrame<'t, V>, dim: usize) -> Option<(u64, SlotView<'t, V>)> {
    let node = f.node;
    let pl = node.post_len;
    match &mut f.cursor {
        ExtCursor::Sparse { idx } => {
            let Entries::Sparse(l) = &node.entries else {
                unreachable!()
            };
            if *idx >= l.len() {
                return None;
            }
            let i = *idx;
            *idx += 1;
            Some((l.addr_at(i, dim, pl), l.view_at(i, dim, pl)))
        }
        ExtCursor::Dense { pos } => {
            let Entries::Dense(a) = &node.entries else {
                unreachable!()
            };
            let slots = a.slots() as u64;
            while *pos < slots {
                let p = *pos;
                *pos += 1;
                if let Some(view) = a.view_at(p, dim, pl) {
                    return Some((p, view));
                }
            }
            None
        }
        ExtCursor::Indexed { target, exhausted } => {
            if *exhausted {
                return None;
            }
            let Entries::Indexed(m) = &node.entries else {
                unreachable!()
            };
            let Some((pos, entry)) = m.next_geq(*target) else {
                *exhausted = true;
                return None;
            };
            if pos == u64::MAX {
                *exhausted = true;
            } else {
                *target = pos + 1;
            }
            Some((pos, entry.view()))
        }
    }
}

fn ext_frame<'t, V>(node: &'t Node<V>, prefix: Prefix) -> ExtFrame<'t, V> {
    let cursor = match &node.entries {
        Entries::Sparse(_) => ExtCursor::Sparse { idx: 0 },
        Entries::Dense(_) => ExtCursor::Dense { pos: 0 },
        Entries::Indexed(_) => ExtCursor::Indexed {
            target: 0,
            exhausted: false,
        },
    };
    ExtFrame {
        node,
        prefix,
        cursor,
    }
}

/// Lazy traversal of every entry: the window machinery without a mask.
///
/// Yields entries in hypercube address order within each node, depth-first;
/// this is not a sorted order. Offers the same allocating/reusing pair of
/// interfaces as [`Query`].
pub struct Extent<'t, V> {
    dim: usize,
    stack: Vec<ExtFrame<'t, V>>,
    key_buf: Box<[u64]>,
}

impl<'t, V> Extent<'t, V> {
    pub(crate) fn new(root: Option<&'t Node<V>>, dim: usize) -> Self {
        let mut stack = Vec::new();
        if let Some(root) = root {
            let mut prefix: Prefix = SmallVec::from_elem(0u64, dim);
            if root.infix_len > 0 {
                prefix.copy_from_slice(&root.infix);
            }
            stack.push(ext_frame(root, prefix));
        }
        Extent {
            dim,
            stack,
            key_buf: vec![0u64; dim].into_boxed_slice(),
        }
    }

    fn advance(&mut self) -> Option<&'t V> {
        let dim = self.dim;
        loop {
            let top = self.stack.last_mut()?;
            let pl = top.node.post_len;
            match ext_frame_next(top, dim) {
                None => {
                    self.stack.pop();
                }
                Some((pos, SlotView::Post(pb, v))) => {
                    let prefix = &self.stack.last().expect("live frame").prefix;
                    for d in 0..dim {
                        self.key_buf[d] =
                            prefix[d] | (pos_bit(pos, d, dim) << pl) | pb.dim_bits(d, pl);
                    }
                    return Some(v);
                }
                Some((pos, SlotView::Sub(child))) => {
                    let prefix = &self.stack.last().expect("live frame").prefix;
                    let mut cpref: Prefix = SmallVec::with_capacity(dim);
                    for d in 0..dim {
                        let mut p = prefix[d] | (pos_bit(pos, d, dim) << pl);
                        if child.infix_len > 0 {
                            p |= child.infix[d];
                        }
                        cpref.push(p);
                    }
                    self.stack.push(ext_frame(child, cpref));
                }
            }
        }
    }

    /// Zero-allocation advance; same contract as [`Query::next_reuse`].
    pub fn next_reuse(&mut self) -> Option<(&[u64], &'t V)> {
        let v = self.advance()?;
        Some((&self.key_buf, v))
    }
}

impl<'t, V> Iterator for Extent<'t, V> {
    type Item = (Box<[u64]>, &'t V);

    fn next(&mut self) -> Option<Self::Item> {
        let v = self.advance()?;
        Some((self.key_buf.clone(), v))
    }
}
