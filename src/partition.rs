// Copyright 2022 Oxide Computer Company

//! Metadata partitions.
//!
//! Subtables whose mask pins the whole metadata register get a tag: a
//! 64-bit word with two bits set, derived from the hash of the mask. For
//! each exact metadata value carried by some rule, a partition aggregates
//! the tags of every subtable holding such a rule. A lookup reads the
//! partition for the flow's metadata and skips any tagged subtable whose
//! tag does not intersect it; subtables that do not pin metadata carry
//! `TAG_ALL` and are never skipped this way.
//!
//! Tag bits are drawn from positions 1..64 so that the arbitrary tag
//! returned for an unknown metadata value (bit 0) intersects no real tag.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use crossbeam_epoch::Guard;
use parking_lot::Mutex;

use crate::cmap::CMap;

/// Intersects every tag; subtables carrying it are always visited.
pub const TAG_ALL: u64 = !0u64;

/// Returned for a metadata value no rule pins exactly.
pub(crate) const TAG_ARBITRARY: u64 = 1;

/// Two bits in 1..64, from disjoint slices of the hash.
pub(crate) fn tag_create(hash: u64) -> u64 {
    let a = 1 + (hash % 63);
    let b = 1 + ((hash >> 6) % 63);
    (1u64 << a) | (1u64 << b)
}

pub(crate) struct Partition {
    metadata: u64,
    /// OR of the member subtables' tags; read lock-free by lookups.
    tags: AtomicU64,
    /// Per-bit reference counts, writer only.
    tracker: Mutex<[u32; 64]>,
}

impl Partition {
    fn new(metadata: u64) -> Self {
        Self {
            metadata,
            tags: AtomicU64::new(0),
            tracker: Mutex::new([0; 64]),
        }
    }
}

pub(crate) type PartitionMap = CMap<Arc<Partition>>;

/// Tags to test subtables against for a flow with this metadata.
pub(crate) fn lookup_tags(
    map: &PartitionMap,
    state: &RandomState,
    metadata: u64,
    guard: &Guard,
) -> u64 {
    if map.is_empty() {
        return TAG_ALL;
    }
    let h = state.hash_one(metadata);
    match map.find(h, guard, |p| p.metadata == metadata) {
        Some(p) => p.tags.load(Ordering::Acquire),
        // No rule pins this exact metadata value; only untagged
        // subtables need be visited.
        None => TAG_ARBITRARY,
    }
}

/// Writer only. Account one rule with this exact metadata value living in
/// a subtable with `tag`.
pub(crate) fn insert_ref(
    map: &PartitionMap,
    state: &RandomState,
    metadata: u64,
    tag: u64,
    guard: &Guard,
) {
    debug_assert!(tag != TAG_ALL && tag & TAG_ARBITRARY == 0);
    let h = state.hash_one(metadata);
    let p = match map.find(h, guard, |p| p.metadata == metadata) {
        Some(p) => p.clone(),
        None => {
            let p = Arc::new(Partition::new(metadata));
            map.insert(h, p.clone(), guard);
            p
        }
    };
    let mut tr = p.tracker.lock();
    let mut t = tag;
    while t != 0 {
        tr[t.trailing_zeros() as usize] += 1;
        t &= t - 1;
    }
    p.tags.fetch_or(tag, Ordering::Release);
}

/// Writer only. Reverse of `insert_ref`; destroys the partition when its
/// last tag bit clears.
pub(crate) fn remove_ref(
    map: &PartitionMap,
    state: &RandomState,
    metadata: u64,
    tag: u64,
    guard: &Guard,
) {
    let h = state.hash_one(metadata);
    let Some(p) = map.find(h, guard, |p| p.metadata == metadata) else {
        debug_assert!(false, "partition missing on remove");
        return;
    };
    let p = p.clone();
    let mut tr = p.tracker.lock();
    let mut t = tag;
    while t != 0 {
        let bit = t.trailing_zeros() as usize;
        tr[bit] -= 1;
        if tr[bit] == 0 {
            p.tags.fetch_and(!(1u64 << bit), Ordering::Release);
        }
        t &= t - 1;
    }
    drop(tr);
    if p.tags.load(Ordering::Acquire) == 0 {
        map.remove(h, guard, |q| q.metadata == metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    fn state() -> RandomState {
        RandomState::with_seeds(1, 2, 3, 4)
    }

    #[test]
    fn tags_have_two_bits_above_zero() {
        for h in [0u64, 1, 63, 64, 0xdeadbeef, u64::MAX] {
            let t = tag_create(h);
            assert!(t & 1 == 0);
            let n = t.count_ones();
            assert!(n == 1 || n == 2); // slices may collide
        }
    }

    #[test]
    fn ref_counting_drives_tag_bits() {
        let map = PartitionMap::new();
        let st = state();
        let guard = &epoch::pin();
        let t1 = tag_create(0x1111);
        let t2 = tag_create(0x2222);

        insert_ref(&map, &st, 7, t1, guard);
        insert_ref(&map, &st, 7, t1, guard);
        insert_ref(&map, &st, 7, t2, guard);
        assert_eq!(lookup_tags(&map, &st, 7, guard), t1 | t2);
        assert_eq!(lookup_tags(&map, &st, 8, guard), TAG_ARBITRARY);

        remove_ref(&map, &st, 7, t1, guard);
        // One t1 reference remains.
        assert_eq!(lookup_tags(&map, &st, 7, guard), t1 | t2);
        remove_ref(&map, &st, 7, t1, guard);
        assert_eq!(lookup_tags(&map, &st, 7, guard) & t1 & !t2, 0);

        remove_ref(&map, &st, 7, t2, guard);
        assert!(map.is_empty());
        assert_eq!(lookup_tags(&map, &st, 7, guard), TAG_ALL);
    }
}
