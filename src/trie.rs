// Copyright 2022 Oxide Computer Company

//! Per-field binary prefix tries.
//!
//! Each trie is a radix tree over the big-endian bits of one address
//! field. Edges are compressed: a node carries up to a full field width of
//! prefix bits. `n_rules` counts the rules whose mask pins exactly the
//! prefix ending at that node, so a lookup can report the longest prefix
//! length at which any rule exists, and a subtable demanding a longer
//! prefix can be skipped without probing it.
//!
//! Readers are lock-free. Every mutation clones the root-to-leaf path it
//! touches and publishes a new root; displaced nodes are retired and freed
//! only after concurrent readers quiesce.

use std::sync::atomic::Ordering;

use bitvec::prelude::*;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::field::FieldId;

type PrefixBits = BitArray<[u8; 16], Msb0>;
type Bits = BitSlice<u8, Msb0>;

struct TrieNode {
    prefix: PrefixBits,
    n_bits: u8,
    /// Rules whose prefix ends exactly at this node.
    n_rules: u32,
    /// Children, indexed by the first bit of the child's prefix.
    edges: [Atomic<TrieNode>; 2],
}

impl TrieNode {
    fn leaf(bits: &Bits, n_rules: u32) -> TrieNode {
        let mut prefix = PrefixBits::ZERO;
        prefix[..bits.len()].clone_from_bitslice(bits);
        TrieNode {
            prefix,
            n_bits: bits.len() as u8,
            n_rules,
            edges: [Atomic::null(), Atomic::null()],
        }
    }

    fn bits(&self) -> &Bits {
        &self.prefix[..self.n_bits as usize]
    }

    fn is_leaf(&self, guard: &Guard) -> bool {
        self.edges[0].load(Ordering::Acquire, guard).is_null()
            && self.edges[1].load(Ordering::Acquire, guard).is_null()
    }

    /// A copy sharing both children.
    fn clone_shallow(&self, guard: &Guard) -> TrieNode {
        let n = TrieNode {
            prefix: self.prefix,
            n_bits: self.n_bits,
            n_rules: self.n_rules,
            edges: [Atomic::null(), Atomic::null()],
        };
        for i in 0..2 {
            n.edges[i].store(
                self.edges[i].load(Ordering::Acquire, guard),
                Ordering::Relaxed,
            );
        }
        n
    }
}

fn common_bits(a: &Bits, b: &Bits) -> usize {
    a.iter()
        .by_vals()
        .zip(b.iter().by_vals())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Result of a trie query: the deepest prefix length at which any rule is
/// present along the walked path, and the number of address bits the walk
/// examined to establish that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrieLookup {
    pub match_plen: u8,
    pub wc_plen: u8,
}

pub(crate) struct PrefixTrie {
    field: FieldId,
    root: Atomic<TrieNode>,
}

impl PrefixTrie {
    pub(crate) fn new(field: FieldId) -> Self {
        debug_assert!(field.def().prefix);
        Self { field, root: Atomic::null() }
    }

    pub(crate) fn field(&self) -> FieldId {
        self.field
    }

    /// Writer only. Record one rule pinning the first `plen` bits of
    /// `addr` (which is pre-masked, so trailing bits are zero).
    pub(crate) fn insert(&self, addr: &[u8], plen: u8, guard: &Guard) {
        let bits = &addr.view_bits::<Msb0>()[..plen as usize];
        let root = self.root.load(Ordering::Acquire, guard);
        let new = insert_rec(root, bits, guard);
        self.root.store(new, Ordering::Release);
    }

    /// Writer only. Remove one previously inserted prefix.
    pub(crate) fn remove(&self, addr: &[u8], plen: u8, guard: &Guard) {
        let bits = &addr.view_bits::<Msb0>()[..plen as usize];
        let root = self.root.load(Ordering::Acquire, guard);
        match remove_rec(root, bits, guard) {
            Some(new) => self.root.store(new, Ordering::Release),
            None => self.root.store(Shared::null(), Ordering::Release),
        }
    }

    /// Walk `addr` from the root. Reader safe.
    pub(crate) fn lookup(&self, addr: &[u8], guard: &Guard) -> TrieLookup {
        let bits = addr.view_bits::<Msb0>();
        let mut ofs = 0usize;
        let mut match_plen = 0usize;
        let mut node_s = self.root.load(Ordering::Acquire, guard);
        let mut prev: Option<&TrieNode> = None;
        while let Some(node) = unsafe { node_s.as_ref() } {
            let eq = common_bits(node.bits(), &bits[ofs..]);
            ofs += eq;
            if eq < node.n_bits as usize {
                // Diverged inside this edge; the first mismatching bit was
                // examined.
                return TrieLookup {
                    match_plen: match_plen as u8,
                    wc_plen: (ofs + 1) as u8,
                };
            }
            if node.n_rules > 0 {
                match_plen = ofs;
            }
            if ofs >= bits.len() {
                // Address exhausted.
                return TrieLookup {
                    match_plen: match_plen as u8,
                    wc_plen: ofs as u8,
                };
            }
            prev = Some(node);
            node_s = node.edges[bits[ofs] as usize]
                .load(Ordering::Acquire, guard);
        }
        // Fell off the tree. If the last node had a branch we did not
        // take, bit `ofs` was examined to learn that; a leaf tells us
        // nothing about the address.
        let wc = match prev {
            Some(p) if !p.is_leaf(guard) => ofs + 1,
            _ => ofs,
        };
        TrieLookup { match_plen: match_plen as u8, wc_plen: wc as u8 }
    }

    pub(crate) fn is_empty(&self, guard: &Guard) -> bool {
        self.root.load(Ordering::Acquire, guard).is_null()
    }

    /// (nodes, prefixes) in the trie. Writer context.
    pub(crate) fn stats(&self, guard: &Guard) -> (usize, usize) {
        fn walk(
            s: Shared<TrieNode>,
            guard: &Guard,
            acc: &mut (usize, usize),
        ) {
            if let Some(n) = unsafe { s.as_ref() } {
                acc.0 += 1;
                acc.1 += n.n_rules as usize;
                for e in &n.edges {
                    walk(e.load(Ordering::Acquire, guard), guard, acc);
                }
            }
        }
        let mut acc = (0, 0);
        walk(self.root.load(Ordering::Acquire, guard), guard, &mut acc);
        acc
    }
}

/// Per-lookup cache of one trie's answer. The first subtable that needs
/// the trie performs the walk; later subtables in the same lookup reuse
/// the result.
#[derive(Clone, Copy)]
pub(crate) struct TrieCtx<'g> {
    trie: &'g PrefixTrie,
    done: bool,
    result: TrieLookup,
}

impl<'g> TrieCtx<'g> {
    pub(crate) fn new(trie: &'g PrefixTrie) -> Self {
        Self {
            trie,
            done: false,
            result: TrieLookup { match_plen: 0, wc_plen: 0 },
        }
    }

    pub(crate) fn field(&self) -> FieldId {
        self.trie.field()
    }

    pub(crate) fn lookup(
        &mut self,
        addr: &[u8],
        guard: &Guard,
    ) -> TrieLookup {
        if !self.done {
            self.result = self.trie.lookup(addr, guard);
            self.done = true;
        }
        self.result
    }
}

fn insert_rec<'g>(
    node_s: Shared<'g, TrieNode>,
    bits: &Bits,
    guard: &'g Guard,
) -> Owned<TrieNode> {
    let Some(node) = (unsafe { node_s.as_ref() }) else {
        return Owned::new(TrieNode::leaf(bits, 1));
    };
    let eq = common_bits(node.bits(), bits);
    if eq == node.n_bits as usize {
        if eq == bits.len() {
            // The prefix ends exactly here.
            let mut new = node.clone_shallow(guard);
            new.n_rules += 1;
            unsafe { guard.defer_destroy(node_s) };
            return Owned::new(new);
        }
        // Descend; the branch bit is the first bit of the child's prefix.
        let b = bits[eq] as usize;
        let child = node.edges[b].load(Ordering::Acquire, guard);
        let new_child = insert_rec(child, &bits[eq..], guard);
        let new = node.clone_shallow(guard);
        new.edges[b].store(new_child, Ordering::Relaxed);
        unsafe { guard.defer_destroy(node_s) };
        return Owned::new(new);
    }
    // Split this edge at the divergence point.
    let mut tail = node.clone_shallow(guard);
    let tail_bits: PrefixBits = {
        let mut p = PrefixBits::ZERO;
        let rest = &node.bits()[eq..];
        p[..rest.len()].clone_from_bitslice(rest);
        p
    };
    tail.prefix = tail_bits;
    tail.n_bits = node.n_bits - eq as u8;
    let tail_first = node.bits()[eq] as usize;

    // The shared `eq` bits; bits[..eq] == node.bits()[..eq].
    let mut split = TrieNode::leaf(&bits[..eq], 0);
    if bits.len() == eq {
        // The new prefix ends at the split point.
        split.n_rules = 1;
        split.edges[tail_first].store(Owned::new(tail), Ordering::Relaxed);
    } else {
        let leaf = TrieNode::leaf(&bits[eq..], 1);
        split.edges[bits[eq] as usize]
            .store(Owned::new(leaf), Ordering::Relaxed);
        split.edges[tail_first].store(Owned::new(tail), Ordering::Relaxed);
    }
    unsafe { guard.defer_destroy(node_s) };
    Owned::new(split)
}

/// Join a parent's prefix with `child`, retiring the child node.
fn merge_with_child<'g>(
    parent_bits: &Bits,
    child_s: Shared<'g, TrieNode>,
    guard: &'g Guard,
) -> Owned<TrieNode> {
    let child = unsafe { child_s.as_ref() }.unwrap();
    let mut joined = child.clone_shallow(guard);
    let mut p = PrefixBits::ZERO;
    let total = parent_bits.len() + child.n_bits as usize;
    p[..parent_bits.len()].clone_from_bitslice(parent_bits);
    p[parent_bits.len()..total].clone_from_bitslice(child.bits());
    joined.prefix = p;
    joined.n_bits = total as u8;
    unsafe { guard.defer_destroy(child_s) };
    joined.into()
}

fn remove_rec<'g>(
    node_s: Shared<'g, TrieNode>,
    bits: &Bits,
    guard: &'g Guard,
) -> Option<Owned<TrieNode>> {
    let Some(node) = (unsafe { node_s.as_ref() }) else {
        debug_assert!(false, "removing prefix that was never inserted");
        return None;
    };
    let eq = common_bits(node.bits(), bits);
    if eq == node.n_bits as usize && eq == bits.len() {
        // Target node.
        debug_assert!(node.n_rules > 0);
        let n_rules = node.n_rules.saturating_sub(1);
        let e0 = node.edges[0].load(Ordering::Acquire, guard);
        let e1 = node.edges[1].load(Ordering::Acquire, guard);
        let out = if n_rules == 0 {
            match (e0.is_null(), e1.is_null()) {
                (true, true) => None,
                (false, true) => {
                    Some(merge_with_child(node.bits(), e0, guard))
                }
                (true, false) => {
                    Some(merge_with_child(node.bits(), e1, guard))
                }
                (false, false) => {
                    let mut new = node.clone_shallow(guard);
                    new.n_rules = 0;
                    Some(Owned::new(new))
                }
            }
        } else {
            let mut new = node.clone_shallow(guard);
            new.n_rules = n_rules;
            Some(Owned::new(new))
        };
        unsafe { guard.defer_destroy(node_s) };
        return out;
    }
    debug_assert!(
        eq == node.n_bits as usize && bits.len() > eq,
        "removing prefix that was never inserted"
    );
    let b = bits[eq] as usize;
    let child = node.edges[b].load(Ordering::Acquire, guard);
    let new_child = remove_rec(child, &bits[eq..], guard);
    let other = node.edges[1 - b].load(Ordering::Acquire, guard);
    let out = match new_child {
        Some(c) => {
            let new = node.clone_shallow(guard);
            new.edges[b].store(c, Ordering::Relaxed);
            Some(Owned::new(new))
        }
        None => {
            if node.n_rules == 0 && !other.is_null() {
                // Down to one child and no rules end here: merge.
                Some(merge_with_child(node.bits(), other, guard))
            } else if node.n_rules == 0 && other.is_null() {
                None
            } else {
                let new = node.clone_shallow(guard);
                new.edges[b].store(Shared::null(), Ordering::Relaxed);
                Some(Owned::new(new))
            }
        }
    };
    unsafe { guard.defer_destroy(node_s) };
    out
}

impl Drop for PrefixTrie {
    fn drop(&mut self) {
        fn free(s: Shared<TrieNode>, guard: &Guard) {
            if let Some(n) = unsafe { s.as_ref() } {
                for e in &n.edges {
                    free(e.load(Ordering::Relaxed, guard), guard);
                }
                drop(unsafe { s.into_owned() });
            }
        }
        let guard = unsafe { epoch::unprotected() };
        free(self.root.load(Ordering::Relaxed, guard), guard);
    }
}
