// Copyright 2022 Oxide Computer Company

//! The classifier proper: a priority-ordered rule database over the flow
//! header space.
//!
//! Rules are grouped into subtables by mask shape. Subtables sit in a
//! priority vector ordered by their highest-priority rule, so a lookup
//! walks them best-first and stops as soon as no remaining subtable can
//! beat the match in hand. Two side structures cut the walk further:
//! metadata partitions skip subtables whose rules cannot match the flow's
//! metadata register, and per-field prefix tries skip subtables demanding
//! a longer address prefix than any rule possesses for this flow.
//!
//! Every lookup also reports *which* header bits it examined, by OR-ing
//! them into a caller-supplied wildcard mask. A flow cache downstream may
//! treat two flows that agree on the examined bits as equivalent, so the
//! walk is arranged to examine as little as possible: a subtable abandoned
//! at its first stage contributes only that stage's mask bits.
//!
//! Writers serialize on an internal mutex. Readers take no lock at all;
//! they pin an epoch and walk the published structures, which are only
//! ever replaced wholesale and retired, never mutated in place.

use std::fmt::Write;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slog::{debug, o, trace, Logger};

use crate::cmap::CMap;
use crate::error::Error;
use crate::field::FieldId;
use crate::flow::{Flow, FlowMask};
use crate::mmatch::MiniMatch;
use crate::partition::{self, PartitionMap, TAG_ALL};
use crate::pvector::PVector;
use crate::rule::Rule;
use crate::subtable::Subtable;
use crate::trie::{PrefixTrie, TrieCtx};
use crate::{CLASSIFIER_MAX_BATCH, CLS_MAX_INDICES, CLS_MAX_TRIES};

struct Tries(Vec<PrefixTrie>);

pub struct Classifier {
    /// Word boundaries cutting the mask into staged hash regions.
    segments: [u8; CLS_MAX_INDICES],
    /// Mask shape to subtable.
    subtables_map: CMap<Arc<Subtable>>,
    /// Subtables ordered by max rule priority, descending.
    subtables: PVector<Arc<Subtable>>,
    partitions: PartitionMap,
    tries: Atomic<Tries>,
    n_rules: AtomicUsize,
    state: RandomState,
    writer: Mutex<()>,
    log: Logger,
}

impl Classifier {
    /// Segment boundaries at the metadata/L2 and L2/L3 and L3/L4 word
    /// seams of the flow layout.
    pub const DEFAULT_SEGMENTS: [u8; CLS_MAX_INDICES] = [2, 4, 10];

    pub const DEFAULT_PREFIX_FIELDS: [FieldId; 2] =
        [FieldId::Ipv4Dst, FieldId::Ipv4Src];

    pub fn new(segments: [u8; CLS_MAX_INDICES]) -> Self {
        Self::with_logger(segments, Logger::root(slog::Discard, o!()))
    }

    pub fn with_logger(
        segments: [u8; CLS_MAX_INDICES],
        log: Logger,
    ) -> Self {
        debug_assert!(segments.windows(2).all(|w| w[0] < w[1]));
        let tries = Tries(
            Self::DEFAULT_PREFIX_FIELDS
                .iter()
                .map(|f| PrefixTrie::new(*f))
                .collect(),
        );
        Self {
            segments,
            subtables_map: CMap::new(),
            subtables: PVector::new(),
            partitions: PartitionMap::new(),
            tries: Atomic::new(tries),
            n_rules: AtomicUsize::new(0),
            state: RandomState::with_seeds(
                0x736c, 0x6f77, 0x636c, 0x7273,
            ),
            writer: Mutex::new(()),
            log,
        }
    }

    pub fn count(&self) -> usize {
        self.n_rules.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn tries_snapshot<'g>(&self, guard: &'g Guard) -> &'g [PrefixTrie] {
        let t = self.tries.load(Ordering::Acquire, guard);
        &unsafe { t.as_ref() }.unwrap().0
    }

    fn mask_hash(&self, mask: &FlowMask) -> u64 {
        self.state.hash_one(&mask.bytes()[..])
    }

    /// Rebind the prefix tries to `fields`. Only an empty classifier may
    /// be reconfigured. Returns whether the configuration changed.
    pub fn set_prefix_fields(
        &self,
        fields: &[FieldId],
    ) -> Result<bool, Error> {
        let _w = self.writer.lock();
        if !self.is_empty() {
            return Err(Error::ConfigInvalid("classifier is not empty"));
        }
        if fields.len() > CLS_MAX_TRIES {
            return Err(Error::ConfigInvalid("too many prefix fields"));
        }
        for f in fields {
            if !f.def().prefix {
                return Err(Error::ConfigInvalid(
                    "field has no prefix orientation",
                ));
            }
        }
        for (i, f) in fields.iter().enumerate() {
            if fields[..i].contains(f) {
                return Err(Error::ConfigInvalid("duplicate prefix field"));
            }
        }
        let guard = &epoch::pin();
        let cur: Vec<FieldId> = self
            .tries_snapshot(guard)
            .iter()
            .map(|t| t.field())
            .collect();
        if cur == fields {
            return Ok(false);
        }
        let tries =
            Tries(fields.iter().map(|f| PrefixTrie::new(*f)).collect());
        let old = self.tries.swap(
            Owned::new(tries),
            Ordering::Release,
            guard,
        );
        unsafe { guard.defer_destroy(old) };
        debug!(self.log, "prefix fields configured"; "fields" => ?fields);
        Ok(true)
    }

    /// Install `rule`. An installed rule with identical match and
    /// priority is evicted and returned, uninstalled.
    pub fn replace(
        &self,
        rule: Arc<Rule>,
    ) -> Result<Option<Arc<Rule>>, Error> {
        let _w = self.writer.lock();
        if rule.is_installed() {
            return Err(Error::AlreadyInstalled);
        }
        let guard = &epoch::pin();
        let mask = *rule.mmatch().mask();
        let mh = self.mask_hash(&mask);
        let tries = self.tries_snapshot(guard);
        let (sub, created) = match self
            .subtables_map
            .find(mh, guard, |s| s.mask() == &mask)
        {
            Some(s) => (s.clone(), false),
            None => {
                let fields: Vec<FieldId> =
                    tries.iter().map(|t| t.field()).collect();
                let s = Arc::new(Subtable::new(
                    mask,
                    &self.segments,
                    &fields,
                    self.state.clone(),
                ));
                self.subtables_map.insert(mh, s.clone(), guard);
                debug!(
                    self.log, "subtable created";
                    "mask" => ?&mask,
                    "n_subtables" => self.subtables_map.len()
                );
                (s, true)
            }
        };
        let prev_max = sub.max_priority();

        // Tries first: a trie may claim a prefix slightly before the rule
        // is visible, which costs a probe, never a miss.
        for (i, trie) in tries.iter().enumerate() {
            let plen = sub.trie_plen(i);
            if plen > 0 {
                trie.insert(
                    rule.mmatch().value().field_bytes(trie.field()),
                    plen,
                    guard,
                );
            }
        }

        let displaced = sub.insert(rule.clone(), guard);

        if sub.tag() != TAG_ALL {
            partition::insert_ref(
                &self.partitions,
                &self.state,
                rule.mmatch().value().metadata(),
                sub.tag(),
                guard,
            );
        }

        if let Some(old) = &displaced {
            // The evicted rule had the same value and mask; retract its
            // trie and partition references.
            for (i, trie) in tries.iter().enumerate() {
                let plen = sub.trie_plen(i);
                if plen > 0 {
                    trie.remove(
                        old.mmatch().value().field_bytes(trie.field()),
                        plen,
                        guard,
                    );
                }
            }
            if sub.tag() != TAG_ALL {
                partition::remove_ref(
                    &self.partitions,
                    &self.state,
                    old.mmatch().value().metadata(),
                    sub.tag(),
                    guard,
                );
            }
            old.set_installed(false);
        } else {
            self.n_rules.fetch_add(1, Ordering::Relaxed);
        }

        let max = sub.max_priority();
        if created {
            self.subtables.insert(max, sub.clone(), guard);
        } else if max != prev_max {
            self.subtables
                .reprioritize(max, guard, |s| Arc::ptr_eq(s, &sub));
        }
        rule.set_installed(true);
        trace!(self.log, "rule installed"; "rule" => %&rule);
        Ok(displaced)
    }

    /// Install `rule`; equivalent to `replace`.
    pub fn insert(
        &self,
        rule: Arc<Rule>,
    ) -> Result<Option<Arc<Rule>>, Error> {
        self.replace(rule)
    }

    /// Uninstall `rule` and return it.
    pub fn remove(&self, rule: &Arc<Rule>) -> Result<Arc<Rule>, Error> {
        let _w = self.writer.lock();
        if !rule.is_installed() {
            return Err(Error::NotInstalled);
        }
        let guard = &epoch::pin();
        let mask = *rule.mmatch().mask();
        let mh = self.mask_hash(&mask);
        let sub = self
            .subtables_map
            .find(mh, guard, |s| s.mask() == &mask)
            .ok_or(Error::NotInstalled)?
            .clone();
        let prev_max = sub.max_priority();
        if !sub.remove(rule, guard) {
            return Err(Error::NotInstalled);
        }
        let tries = self.tries_snapshot(guard);
        for (i, trie) in tries.iter().enumerate() {
            let plen = sub.trie_plen(i);
            if plen > 0 {
                trie.remove(
                    rule.mmatch().value().field_bytes(trie.field()),
                    plen,
                    guard,
                );
            }
        }
        if sub.tag() != TAG_ALL {
            partition::remove_ref(
                &self.partitions,
                &self.state,
                rule.mmatch().value().metadata(),
                sub.tag(),
                guard,
            );
        }
        if sub.is_empty() {
            self.subtables_map.remove(mh, guard, |s| Arc::ptr_eq(s, &sub));
            self.subtables.remove(guard, |s| Arc::ptr_eq(s, &sub));
            debug!(
                self.log, "subtable destroyed";
                "mask" => ?sub.mask(),
                "n_subtables" => self.subtables_map.len()
            );
        } else if sub.max_priority() != prev_max {
            self.subtables.reprioritize(sub.max_priority(), guard, |s| {
                Arc::ptr_eq(s, &sub)
            });
        }
        self.n_rules.fetch_sub(1, Ordering::Relaxed);
        rule.set_installed(false);
        trace!(self.log, "rule removed"; "rule" => %&rule);
        Ok(rule.clone())
    }

    /// The highest-priority installed rule matching `flow`, or `None`.
    ///
    /// Every header bit the lookup examined is OR-ed into `wc`: the full
    /// mask of the returned rule's subtable, the probed stages of every
    /// other subtable examined, the walked bits of every trie consulted,
    /// and the metadata register whenever partitions pruned the walk. A
    /// flow agreeing with this one on all the reported bits classifies
    /// identically.
    pub fn lookup(
        &self,
        flow: &Flow,
        wc: &mut FlowMask,
    ) -> Option<Arc<Rule>> {
        let guard = &epoch::pin();
        let tries = self.tries_snapshot(guard);
        let mut ctxs: [Option<TrieCtx>; CLS_MAX_TRIES] = [None, None, None];
        for (i, t) in tries.iter().enumerate() {
            ctxs[i] = Some(TrieCtx::new(t));
        }
        let tags = if self.partitions.is_empty() {
            TAG_ALL
        } else {
            // The pruning decision reads the whole metadata register.
            wc.set_field(FieldId::Metadata);
            partition::lookup_tags(
                &self.partitions,
                &self.state,
                flow.metadata(),
                guard,
            )
        };
        let mut best: Option<Arc<Rule>> = None;
        let mut best_prio = i64::MIN;
        for (prio, sub) in self.subtables.entries(guard) {
            if *prio < best_prio {
                break;
            }
            if *prio == best_prio && !cfg!(debug_assertions) {
                // An equal-priority subtable cannot improve the result.
                // Debug builds keep scanning to catch the forbidden case
                // of equal-priority matches under different masks.
                break;
            }
            if sub.tag() & tags == 0 {
                continue;
            }
            if let Some(r) = sub.lookup_wc(flow, &mut ctxs, wc, guard) {
                let p = r.priority() as i64;
                if p > best_prio {
                    best = Some(r);
                    best_prio = p;
                } else {
                    debug_assert!(
                        p < best_prio,
                        "equal-priority rules match via different subtables"
                    );
                }
            }
        }
        best
    }

    fn lookup_fast(&self, flow: &Flow, guard: &Guard) -> Option<Arc<Rule>> {
        let tags = if self.partitions.is_empty() {
            TAG_ALL
        } else {
            partition::lookup_tags(
                &self.partitions,
                &self.state,
                flow.metadata(),
                guard,
            )
        };
        let mut best: Option<Arc<Rule>> = None;
        let mut best_prio = i64::MIN;
        for (prio, sub) in self.subtables.entries(guard) {
            if *prio <= best_prio {
                break;
            }
            if sub.tag() & tags == 0 {
                continue;
            }
            if let Some(r) = sub.lookup_fast(flow, guard) {
                let p = r.priority() as i64;
                if p > best_prio {
                    best = Some(r);
                    best_prio = p;
                }
            }
        }
        best
    }

    /// Classify up to [`CLASSIFIER_MAX_BATCH`] flows in one epoch pin,
    /// without wildcard reporting. Returns whether anything matched.
    /// Flows see per-flow snapshots: a concurrent writer may land between
    /// two flows of the same batch.
    pub fn lookup_batch(
        &self,
        flows: &[Flow],
        results: &mut [Option<Arc<Rule>>],
    ) -> bool {
        assert_eq!(flows.len(), results.len());
        debug_assert!(flows.len() <= CLASSIFIER_MAX_BATCH);
        let guard = &epoch::pin();
        let mut any = false;
        for (flow, out) in flows.iter().zip(results.iter_mut()) {
            *out = self.lookup_fast(flow, guard);
            any |= out.is_some();
        }
        any
    }

    /// The installed rule with exactly this match and priority.
    pub fn find_match_exactly(
        &self,
        mm: &MiniMatch,
        priority: u32,
    ) -> Option<Arc<Rule>> {
        let guard = &epoch::pin();
        let sub = self.subtables_map.find(
            self.mask_hash(mm.mask()),
            guard,
            |s| s.mask() == mm.mask(),
        )?;
        sub.find_eq(mm, priority, guard)
    }

    pub fn find_rule_exactly(&self, rule: &Rule) -> Option<Arc<Rule>> {
        self.find_match_exactly(rule.mmatch(), rule.priority())
    }

    /// True if some installed rule of equal priority admits a flow that
    /// `rule` also matches. An installed rule overlaps itself.
    pub fn rule_overlaps(&self, rule: &Rule) -> bool {
        let guard = &epoch::pin();
        for sub in self.subtables_map.iter(guard) {
            for chain in sub.chains(guard) {
                for r in chain.iter() {
                    // Chains are priority-descending.
                    if r.priority() < rule.priority() {
                        break;
                    }
                    if r.priority() == rule.priority()
                        && r.mmatch().intersects(rule.mmatch())
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Iterate installed rules, optionally restricted to loose matches of
    /// `target`. A `safe` cursor tolerates removal of yielded rules;
    /// iteration requires the writer role either way.
    pub fn cursor(
        &self,
        target: Option<&MiniMatch>,
        safe: bool,
    ) -> Cursor<'_> {
        let guard = &epoch::pin();
        let subtables: Vec<Arc<Subtable>> = self
            .subtables
            .entries(guard)
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        Cursor {
            cls: self,
            target: target.copied(),
            safe,
            expect_count: self.count(),
            subtables,
            si: 0,
            buf: Vec::new(),
            bi: 0,
        }
    }

    pub fn stats(&self) -> ClassifierStats {
        let guard = &epoch::pin();
        ClassifierStats {
            n_rules: self.count(),
            n_subtables: self.subtables_map.len(),
            n_partitions: self.partitions.len(),
            tries: self
                .tries_snapshot(guard)
                .iter()
                .map(|t| {
                    let (n_nodes, n_prefixes) = t.stats(guard);
                    TrieStats { field: t.field(), n_nodes, n_prefixes }
                })
                .collect(),
        }
    }

    pub fn stats_json(&self) -> String {
        serde_json::to_string(&self.stats()).unwrap()
    }

    pub fn dump(&self) -> String {
        let mut s = String::new();
        let guard = &epoch::pin();
        for (prio, sub) in self.subtables.entries(guard) {
            writeln!(s, "subtable max_priority={} {:?}", prio, sub.mask())
                .unwrap();
            for chain in sub.chains(guard) {
                for r in chain.iter() {
                    writeln!(s, "  {}", r).unwrap();
                }
            }
        }
        s
    }
}

impl Drop for Classifier {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let t = self.tries.load(Ordering::Relaxed, guard);
        if !t.is_null() {
            drop(unsafe { t.into_owned() });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrieStats {
    pub field: FieldId,
    pub n_nodes: usize,
    pub n_prefixes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierStats {
    pub n_rules: usize,
    pub n_subtables: usize,
    pub n_partitions: usize,
    pub tries: Vec<TrieStats>,
}

/// A position in an iteration over installed rules. The subtable list is
/// snapshotted at creation and each subtable's rules when the cursor
/// reaches it, so a safe cursor keeps yielding correctly while the caller
/// removes the rules it has been handed.
pub struct Cursor<'a> {
    cls: &'a Classifier,
    target: Option<MiniMatch>,
    safe: bool,
    expect_count: usize,
    subtables: Vec<Arc<Subtable>>,
    si: usize,
    buf: Vec<Arc<Rule>>,
    bi: usize,
}

impl<'a> Cursor<'a> {
    pub fn advance(&mut self) -> Option<Arc<Rule>> {
        if !self.safe {
            debug_assert_eq!(
                self.cls.count(),
                self.expect_count,
                "rule set changed under a non-safe cursor"
            );
        }
        loop {
            if self.bi < self.buf.len() {
                let r = self.buf[self.bi].clone();
                self.bi += 1;
                return Some(r);
            }
            if self.si >= self.subtables.len() {
                return None;
            }
            let sub = self.subtables[self.si].clone();
            self.si += 1;
            if let Some(t) = &self.target {
                // A loose match requires the rule to pin everything the
                // target pins; rules here pin exactly the subtable mask.
                if !t.mask().is_subset_of(sub.mask()) {
                    continue;
                }
            }
            let guard = &epoch::pin();
            self.buf = sub
                .chains(guard)
                .flat_map(|c| c.iter().cloned())
                .filter(|r| match &self.target {
                    Some(t) => r.mmatch().is_loose_match(t),
                    None => true,
                })
                .collect();
            self.bi = 0;
        }
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = Arc<Rule>;

    fn next(&mut self) -> Option<Arc<Rule>> {
        self.advance()
    }
}
