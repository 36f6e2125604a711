// Copyright 2022 Oxide Computer Company

//! Subtables. All rules sharing one mask shape live in one subtable, which
//! gives them an exact-match hash lookup: a flow masked by the subtable's
//! mask either equals a stored rule value or no rule here matches.
//!
//! The hash probe is staged. The mask is cut at the classifier's segment
//! boundaries (metadata, L2, L3); each boundary that adds mask bits gets a
//! supplementary index keyed by the hash of the mask prefix up to it. A
//! lookup probes the indices in order and aborts at the first stage with
//! no entry, having examined (and therefore un-wildcarded) only the mask
//! bits up to that stage. Prefix tries can cut the probe short the same
//! way before a stage is hashed at all.
//!
//! Rules with identical (value, mask) but different priorities form a
//! priority-descending chain behind one map entry; only the head is
//! indexed or returned by lookups.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use crossbeam_epoch::Guard;

use crate::cmap::{CMap, Iter};
use crate::field::FieldId;
use crate::flow::{Flow, FlowHasher, FlowMask, FLOW_U64S};
use crate::mmatch::MiniMatch;
use crate::partition::{tag_create, TAG_ALL};
use crate::rule::Rule;
use crate::trie::TrieCtx;
use crate::{CLS_MAX_INDICES, CLS_MAX_TRIES};

/// Rules sharing one (value, mask), sorted by descending priority. The
/// head is the only member lookups can return.
pub(crate) type Chain = Arc<[Arc<Rule>]>;

struct Stage {
    /// Stage hashes cover mask words `[0, end)`.
    end: usize,
    index: CMap<u32>,
}

pub(crate) struct Subtable {
    mask: FlowMask,
    tag: u64,
    stages: Vec<Stage>,
    rules: CMap<Chain>,
    /// All rules, chain tails included.
    n_rules: AtomicUsize,
    /// Highest priority over chain heads, `i64::MIN` when empty.
    max_priority: AtomicI64,
    /// Heads at `max_priority`; removal rescans only when this drops to 0.
    max_count: AtomicUsize,
    /// Per configured trie, the prefix length this subtable's mask pins on
    /// the trie's field (0 = the trie cannot rule this subtable out).
    trie_plen: [u8; CLS_MAX_TRIES],
    state: RandomState,
}

impl Subtable {
    pub(crate) fn new(
        mask: FlowMask,
        segments: &[u8; CLS_MAX_INDICES],
        trie_fields: &[FieldId],
        state: RandomState,
    ) -> Self {
        // One staged index per boundary that adds mask bits. If the
        // remainder past the last boundary adds nothing, the last index
        // would duplicate the full-mask map, so it is dropped.
        let mut stages = Vec::new();
        let mut prev = 0usize;
        for &b in segments {
            let b = b as usize;
            if b <= prev || b >= FLOW_U64S {
                continue;
            }
            if mask.has_bits_in(prev..b) {
                stages.push(Stage { end: b, index: CMap::new() });
                prev = b;
            }
        }
        if let Some(end) = stages.last().map(|s| s.end) {
            if !mask.has_bits_in(end..FLOW_U64S) {
                stages.pop();
            }
        }

        let tag = if mask.field_is_exact(FieldId::Metadata) {
            tag_create(state.hash_one(&mask.bytes()[..]))
        } else {
            TAG_ALL
        };

        let mut trie_plen = [0u8; CLS_MAX_TRIES];
        for (i, f) in trie_fields.iter().enumerate() {
            trie_plen[i] = mask.prefix_len(*f).unwrap_or(0);
        }

        Self {
            mask,
            tag,
            stages,
            rules: CMap::new(),
            n_rules: AtomicUsize::new(0),
            max_priority: AtomicI64::new(i64::MIN),
            max_count: AtomicUsize::new(0),
            trie_plen,
            state,
        }
    }

    pub(crate) fn mask(&self) -> &FlowMask {
        &self.mask
    }

    pub(crate) fn tag(&self) -> u64 {
        self.tag
    }

    pub(crate) fn n_rules(&self) -> usize {
        self.n_rules.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.n_rules() == 0
    }

    pub(crate) fn max_priority(&self) -> i64 {
        self.max_priority.load(Ordering::Relaxed)
    }

    pub(crate) fn trie_plen(&self, i: usize) -> u8 {
        self.trie_plen[i]
    }

    pub(crate) fn chains<'g>(&self, guard: &'g Guard) -> Iter<'g, Chain> {
        self.rules.iter(guard)
    }

    fn full_hash(&self, flow: &Flow) -> u64 {
        let mut h = FlowHasher::new(&self.state);
        h.feed(flow, &self.mask, 0..FLOW_U64S);
        h.stage_hash()
    }

    /// Cumulative stage hashes of a pre-masked rule value, plus the full
    /// hash.
    fn staged_hashes(&self, value: &Flow) -> ([u64; CLS_MAX_INDICES], u64) {
        let mut out = [0u64; CLS_MAX_INDICES];
        let mut h = FlowHasher::new(&self.state);
        let mut start = 0;
        for (i, s) in self.stages.iter().enumerate() {
            h.feed(value, &self.mask, start..s.end);
            out[i] = h.stage_hash();
            start = s.end;
        }
        h.feed(value, &self.mask, start..FLOW_U64S);
        (out, h.stage_hash())
    }

    fn index_inc(&self, stage: &Stage, hash: u64, guard: &Guard) {
        match stage.index.find(hash, guard, |_| true) {
            Some(&c) => {
                stage.index.replace(hash, guard, |_| true, c + 1);
            }
            None => stage.index.insert(hash, 1, guard),
        }
    }

    fn index_dec(&self, stage: &Stage, hash: u64, guard: &Guard) {
        match stage.index.find(hash, guard, |_| true) {
            Some(&1) => {
                stage.index.remove(hash, guard, |_| true);
            }
            Some(&c) => {
                stage.index.replace(hash, guard, |_| true, c - 1);
            }
            None => debug_assert!(false, "stage index underflow"),
        }
    }

    fn head_added(&self, prio: i64) {
        let max = self.max_priority.load(Ordering::Relaxed);
        if prio > max {
            self.max_priority.store(prio, Ordering::Relaxed);
            self.max_count.store(1, Ordering::Relaxed);
        } else if prio == max {
            self.max_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn head_removed(&self, prio: i64, guard: &Guard) {
        if prio == self.max_priority.load(Ordering::Relaxed)
            && self.max_count.fetch_sub(1, Ordering::Relaxed) == 1
        {
            self.rescan_max(guard);
        }
    }

    /// A chain's head moved from priority `old` to `new`. The map must
    /// already hold the new chain: a rescan counts the new head.
    fn head_changed(&self, old: i64, new: i64, guard: &Guard) {
        if old == self.max_priority.load(Ordering::Relaxed)
            && self.max_count.fetch_sub(1, Ordering::Relaxed) == 1
        {
            self.rescan_max(guard);
            return;
        }
        self.head_added(new);
    }

    fn rescan_max(&self, guard: &Guard) {
        let mut max = i64::MIN;
        let mut count = 0usize;
        for chain in self.rules.iter(guard) {
            let p = chain[0].priority() as i64;
            if p > max {
                max = p;
                count = 1;
            } else if p == max {
                count += 1;
            }
        }
        self.max_priority.store(max, Ordering::Relaxed);
        self.max_count.store(count, Ordering::Relaxed);
    }

    /// Writer only. Install `rule`, which must carry this subtable's mask.
    /// An installed rule with equal (value, priority) is evicted and
    /// returned.
    pub(crate) fn insert(
        &self,
        rule: Arc<Rule>,
        guard: &Guard,
    ) -> Option<Arc<Rule>> {
        debug_assert!(rule.mmatch().mask() == &self.mask);
        let value = *rule.mmatch().value();
        let (stage_hashes, hash) = self.staged_hashes(&value);
        let found =
            self.rules.find(hash, guard, |c| *c[0].mmatch().value() == value);
        let displaced = match found {
            None => {
                self.head_added(rule.priority() as i64);
                let chain: Chain = Arc::from(vec![rule]);
                self.rules.insert(hash, chain, guard);
                for (i, s) in self.stages.iter().enumerate() {
                    self.index_inc(s, stage_hashes[i], guard);
                }
                None
            }
            Some(chain) => {
                let old_head = chain[0].priority() as i64;
                let mut v: Vec<Arc<Rule>> = chain.to_vec();
                let mut displaced = None;
                match v.iter().position(|r| r.priority() <= rule.priority())
                {
                    Some(pos) if v[pos].priority() == rule.priority() => {
                        displaced =
                            Some(std::mem::replace(&mut v[pos], rule));
                    }
                    Some(pos) => v.insert(pos, rule),
                    None => v.push(rule),
                }
                let new_head = v[0].priority() as i64;
                self.rules.replace(
                    hash,
                    guard,
                    |c| *c[0].mmatch().value() == value,
                    Arc::from(v),
                );
                if old_head != new_head {
                    self.head_changed(old_head, new_head, guard);
                }
                displaced
            }
        };
        if displaced.is_none() {
            self.n_rules.fetch_add(1, Ordering::Relaxed);
        }
        displaced
    }

    /// Writer only. Uninstall `rule` (located by pointer identity).
    /// Returns false if it is not here.
    pub(crate) fn remove(&self, rule: &Arc<Rule>, guard: &Guard) -> bool {
        let value = *rule.mmatch().value();
        let (stage_hashes, hash) = self.staged_hashes(&value);
        let Some(chain) =
            self.rules.find(hash, guard, |c| *c[0].mmatch().value() == value)
        else {
            return false;
        };
        let Some(pos) = chain.iter().position(|r| Arc::ptr_eq(r, rule))
        else {
            return false;
        };
        let old_head = chain[0].priority() as i64;
        if chain.len() == 1 {
            self.rules.remove(hash, guard, |c| {
                *c[0].mmatch().value() == value
            });
            for (i, s) in self.stages.iter().enumerate() {
                self.index_dec(s, stage_hashes[i], guard);
            }
            self.head_removed(old_head, guard);
        } else {
            let v: Vec<Arc<Rule>> = chain
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pos)
                .map(|(_, r)| r.clone())
                .collect();
            let new_head = v[0].priority() as i64;
            self.rules.replace(
                hash,
                guard,
                |c| *c[0].mmatch().value() == value,
                Arc::from(v),
            );
            if pos == 0 {
                self.head_changed(old_head, new_head, guard);
            }
        }
        self.n_rules.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// The installed rule with exactly this match and priority, if any.
    pub(crate) fn find_eq(
        &self,
        mm: &MiniMatch,
        priority: u32,
        guard: &Guard,
    ) -> Option<Arc<Rule>> {
        let hash = self.full_hash(mm.value());
        let chain = self.rules.find(hash, guard, |c| {
            c[0].mmatch().value() == mm.value()
        })?;
        chain.iter().find(|r| r.priority() == priority).cloned()
    }

    /// Single full-mask probe; no staging, no tries, no un-wildcarding.
    pub(crate) fn lookup_fast(
        &self,
        flow: &Flow,
        guard: &Guard,
    ) -> Option<Arc<Rule>> {
        let hash = self.full_hash(flow);
        let chain =
            self.rules.find(hash, guard, |c| c[0].mmatch().matches(flow))?;
        Some(chain[0].clone())
    }

    /// Staged probe, accumulating examined bits into `wc`.
    pub(crate) fn lookup_wc<'g>(
        &self,
        flow: &Flow,
        tries: &mut [Option<TrieCtx<'g>>; CLS_MAX_TRIES],
        wc: &mut FlowMask,
        guard: &Guard,
    ) -> Option<Arc<Rule>> {
        let mut h = FlowHasher::new(&self.state);
        let mut start = 0usize;
        for stage in &self.stages {
            if self.check_tries(flow, tries, start..stage.end, wc, guard) {
                wc.or_mask_range(&self.mask, 0..start);
                return None;
            }
            h.feed(flow, &self.mask, start..stage.end);
            if stage.index.find(h.stage_hash(), guard, |_| true).is_none() {
                // No rule here can match. Only the stages probed so far
                // have been examined.
                wc.or_mask_range(&self.mask, 0..stage.end);
                return None;
            }
            start = stage.end;
        }
        if self.check_tries(flow, tries, start..FLOW_U64S, wc, guard) {
            wc.or_mask_range(&self.mask, 0..start);
            return None;
        }
        h.feed(flow, &self.mask, start..FLOW_U64S);
        let found =
            self.rules.find(h.stage_hash(), guard, |c| {
                c[0].mmatch().matches(flow)
            });
        // The full mask was examined, hit or miss.
        wc.or_mask(&self.mask);
        found.map(|c| c[0].clone())
    }

    /// Consult any not-yet-consulted trie whose field falls in this word
    /// range. Returns true if a trie proves no rule in this subtable can
    /// match (the subtable's prefix on the field is longer than the
    /// longest prefix present for this flow).
    fn check_tries<'g>(
        &self,
        flow: &Flow,
        ctxs: &mut [Option<TrieCtx<'g>>; CLS_MAX_TRIES],
        words: std::ops::Range<usize>,
        wc: &mut FlowMask,
        guard: &Guard,
    ) -> bool {
        for (i, slot) in ctxs.iter_mut().enumerate() {
            let Some(ctx) = slot else {
                break;
            };
            let plen = self.trie_plen[i];
            if plen == 0 {
                continue;
            }
            let f = ctx.field();
            let w = f.start_word();
            if w < words.start || w >= words.end {
                continue;
            }
            let res = ctx.lookup(flow.field_bytes(f), guard);
            // The walked bits back the answer and must show up in the
            // result mask whenever the answer is used.
            wc.set_field_prefix(f, res.wc_plen);
            if plen > res.match_plen {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    const SEGMENTS: [u8; CLS_MAX_INDICES] = [2, 4, 10];

    fn state() -> RandomState {
        RandomState::with_seeds(1, 2, 3, 4)
    }

    fn meta_dst_mask() -> FlowMask {
        let mut m = FlowMask::new();
        m.set_field(FieldId::Metadata);
        m.set_field(FieldId::Ipv4Dst);
        m
    }

    fn rule(mask: FlowMask, meta: u64, dst: &str, prio: u32) -> Arc<Rule> {
        let mut v = Flow::new();
        v.set_metadata(meta);
        v.set_ipv4_dst(dst.parse().unwrap());
        Arc::new(Rule::new(MiniMatch::new(v, mask), prio).unwrap())
    }

    #[test]
    fn stage_layout_skips_empty_segments() {
        // Metadata (word 0) and ipv4_dst (word 8): the L2 boundary adds
        // no bits and the tail past word 10 adds none either, so only the
        // metadata stage survives.
        let s =
            Subtable::new(meta_dst_mask(), &SEGMENTS, &[], state());
        assert_eq!(s.stages.len(), 1);
        assert_eq!(s.stages[0].end, 2);
        assert!(s.tag != TAG_ALL);

        // An L4-only mask gets no staged index at all.
        let mut m = FlowMask::new();
        m.set_field(FieldId::TpDst);
        let s = Subtable::new(m, &SEGMENTS, &[], state());
        assert_eq!(s.stages.len(), 0);
        assert_eq!(s.tag, TAG_ALL);
    }

    #[test]
    fn staged_miss_examines_only_probed_stages() {
        let s = Subtable::new(meta_dst_mask(), &SEGMENTS, &[], state());
        let guard = &epoch::pin();
        assert!(s
            .insert(rule(meta_dst_mask(), 1, "10.0.0.1", 10), guard)
            .is_none());

        let mut flow = Flow::new();
        flow.set_metadata(2); // misses the metadata stage
        flow.set_ipv4_dst("10.0.0.1".parse().unwrap());
        let mut wc = FlowMask::new();
        let mut tries = [None, None, None];
        assert!(s.lookup_wc(&flow, &mut tries, &mut wc, guard).is_none());
        assert!(wc.field_is_exact(FieldId::Metadata));
        assert!(wc.field_bytes(FieldId::Ipv4Dst).iter().all(|b| *b == 0));

        // A full match examines the whole mask.
        flow.set_metadata(1);
        let mut wc = FlowMask::new();
        let hit = s.lookup_wc(&flow, &mut tries, &mut wc, guard).unwrap();
        assert_eq!(hit.priority(), 10);
        assert!(wc.field_is_exact(FieldId::Ipv4Dst));
    }

    #[test]
    fn chains_keep_descending_priority() {
        let mask = meta_dst_mask();
        let s = Subtable::new(mask, &SEGMENTS, &[], state());
        let guard = &epoch::pin();
        let r10 = rule(mask, 1, "10.0.0.1", 10);
        let r30 = rule(mask, 1, "10.0.0.1", 30);
        let r20 = rule(mask, 1, "10.0.0.1", 20);
        assert!(s.insert(r10.clone(), guard).is_none());
        assert!(s.insert(r30.clone(), guard).is_none());
        assert!(s.insert(r20.clone(), guard).is_none());
        assert_eq!(s.n_rules(), 3);
        assert_eq!(s.max_priority(), 30);

        let mut flow = Flow::new();
        flow.set_metadata(1);
        flow.set_ipv4_dst("10.0.0.1".parse().unwrap());
        assert_eq!(s.lookup_fast(&flow, guard).unwrap().priority(), 30);

        // Removing the head promotes the next chain member.
        assert!(s.remove(&r30, guard));
        assert_eq!(s.lookup_fast(&flow, guard).unwrap().priority(), 20);
        assert_eq!(s.max_priority(), 20);

        // Equal (value, priority) insert evicts.
        let dup = rule(mask, 1, "10.0.0.1", 20);
        let out = s.insert(dup, guard).unwrap();
        assert!(Arc::ptr_eq(&out, &r20));
        assert_eq!(s.n_rules(), 2);

        assert!(!s.remove(&r30, guard), "already removed");
    }
}
