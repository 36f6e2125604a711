// Copyright 2022 Oxide Computer Company

//! End to end tests against the classifier's observable contract: highest
//! priority match wins, and the reported wildcard mask is sound (any flow
//! agreeing on the reported bits classifies identically) while staying as
//! small as the pruning allows.

use std::net::Ipv4Addr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slog::{o, Drain, Logger};

use flowcls::{Classifier, FieldId, Flow, FlowMask, MiniMatch, Rule};

fn test_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

fn catchall(prio: u32) -> Arc<Rule> {
    Arc::new(Rule::new(MiniMatch::catchall(), prio).unwrap())
}

fn rule_src(addr: &str, plen: u8, prio: u32) -> Arc<Rule> {
    let mut mask = FlowMask::new();
    mask.set_field_prefix(FieldId::Ipv4Src, plen);
    let mut v = Flow::new();
    v.set_ipv4_src(addr.parse().unwrap());
    Arc::new(Rule::new(MiniMatch::new(v, mask), prio).unwrap())
}

fn rule_dst(addr: &str, plen: u8, prio: u32) -> Arc<Rule> {
    let mut mask = FlowMask::new();
    mask.set_field_prefix(FieldId::Ipv4Dst, plen);
    let mut v = Flow::new();
    v.set_ipv4_dst(addr.parse().unwrap());
    Arc::new(Rule::new(MiniMatch::new(v, mask), prio).unwrap())
}

fn flow_src(addr: &str) -> Flow {
    let mut f = Flow::new();
    f.set_ipv4_src(addr.parse().unwrap());
    f
}

fn flow_dst(addr: &str) -> Flow {
    let mut f = Flow::new();
    f.set_ipv4_dst(addr.parse().unwrap());
    f
}

fn zero(wc: &FlowMask, f: FieldId) -> bool {
    wc.field_bytes(f).iter().all(|b| *b == 0)
}

/// Catchall plus one src-pinning rule: the src subtable is examined for
/// both flows, so both lookups report the src field examined.
#[test]
fn catchall_and_specific() {
    let cls = Classifier::with_logger(
        Classifier::DEFAULT_SEGMENTS,
        test_logger(),
    );
    let r1 = catchall(100);
    let r2 = rule_src("10.0.0.1", 32, 200);
    cls.insert(r1.clone()).unwrap();
    cls.insert(r2.clone()).unwrap();

    let mut wc = FlowMask::new();
    let hit = cls.lookup(&flow_src("10.0.0.1"), &mut wc).unwrap();
    assert!(Arc::ptr_eq(&hit, &r2));
    assert!(wc.field_is_exact(FieldId::Ipv4Src));

    let mut wc = FlowMask::new();
    let hit = cls.lookup(&flow_src("10.0.0.2"), &mut wc).unwrap();
    assert!(Arc::ptr_eq(&hit, &r1));
    // The src subtable was examined (and pruned by the src trie, which
    // walks all 32 bits before diverging from 10.0.0.1).
    assert!(wc.field_is_exact(FieldId::Ipv4Src));
}

/// A subtable abandoned at its first hash stage only charges the wildcard
/// mask for the stage it probed.
#[test]
fn priority_skip_charges_one_segment() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);

    // 1000 rules pinning eth_src (L2 stage) and tp_src (final stage).
    let mut mask = FlowMask::new();
    mask.set_field(FieldId::EthSrc);
    mask.set_field(FieldId::TpSrc);
    for i in 0..1000u32 {
        let mut v = Flow::new();
        let b = i.to_be_bytes();
        v.set_eth_src([2, 0, b[0], b[1], b[2], b[3]]);
        v.set_tp_src(7);
        let r = Rule::new(MiniMatch::new(v, mask), i).unwrap();
        cls.insert(Arc::new(r)).unwrap();
    }
    let shape_b = rule_dst("10.1.0.0", 16, 500);
    cls.insert(shape_b.clone()).unwrap();

    // The flow matches only shape B; its eth_src is in none of the 1000
    // rules, so the A subtable aborts at the L2 stage and tp_src is never
    // examined.
    let mut f = flow_dst("10.1.2.3");
    f.set_eth_src([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    f.set_tp_src(7);
    let mut wc = FlowMask::new();
    let hit = cls.lookup(&f, &mut wc).unwrap();
    assert!(Arc::ptr_eq(&hit, &shape_b));
    assert!(!zero(&wc, FieldId::EthSrc));
    assert!(zero(&wc, FieldId::TpSrc));

    // With a match outranking every A rule, A is not examined at all.
    let high = rule_dst("10.2.0.0", 16, 100_000);
    cls.insert(high.clone()).unwrap();
    let mut f = flow_dst("10.2.9.9");
    f.set_eth_src([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    f.set_tp_src(7);
    let mut wc = FlowMask::new();
    let hit = cls.lookup(&f, &mut wc).unwrap();
    assert!(Arc::ptr_eq(&hit, &high));
    assert!(zero(&wc, FieldId::EthSrc));
    assert!(zero(&wc, FieldId::TpSrc));
}

/// A trie miss reports only the bits walked before divergence.
#[test]
fn trie_skip_examines_walked_bits_only() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    cls.insert(rule_dst("10.1.0.0", 16, 1)).unwrap();

    let mut wc = FlowMask::new();
    assert!(cls.lookup(&flow_dst("192.168.0.1"), &mut wc).is_none());
    // 192.x diverges from 10.x on the first address bit.
    assert_eq!(wc.field_bytes(FieldId::Ipv4Dst), &[0x80, 0, 0, 0]);
    assert!(zero(&wc, FieldId::Ipv4Src));
    assert!(zero(&wc, FieldId::TpDst));
}

/// Metadata partitions keep subtables pinning other metadata values from
/// being examined at all.
#[test]
fn partition_skip() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    let mut mask = FlowMask::new();
    mask.set_field(FieldId::Metadata);
    mask.set_field(FieldId::Ipv4Dst);
    for meta in [1u64, 2] {
        for i in 0..100u32 {
            let mut v = Flow::new();
            v.set_metadata(meta);
            v.set_ipv4_dst(Ipv4Addr::from(0x0a000000 + i));
            let r = Rule::new(MiniMatch::new(v, mask), i + 1).unwrap();
            cls.insert(Arc::new(r)).unwrap();
        }
    }

    let mut f = Flow::new();
    f.set_metadata(3);
    f.set_ipv4_dst("10.0.0.1".parse().unwrap());
    let mut wc = FlowMask::new();
    assert!(cls.lookup(&f, &mut wc).is_none());
    // Had the subtable been examined, the dst trie would have walked (and
    // reported) address bits. Partition pruning reads only metadata.
    assert!(zero(&wc, FieldId::Ipv4Dst));
    assert!(wc.field_is_exact(FieldId::Metadata));
}

/// Replace evicts the rule with identical match and priority.
#[test]
fn replace_semantics() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    let r1 = rule_dst("10.0.0.0", 24, 5);
    let r2 = rule_dst("10.0.0.0", 24, 5);
    assert!(cls.insert(r1.clone()).unwrap().is_none());
    let evicted = cls.replace(r2.clone()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&evicted, &r1));
    assert!(!r1.is_installed());
    assert!(r2.is_installed());
    assert_eq!(cls.count(), 1);

    let found = cls
        .find_match_exactly(r2.mmatch(), 5)
        .expect("replacement must be installed");
    assert!(Arc::ptr_eq(&found, &r2));

    // Idempotence: replacing again with an equal rule returns r2 and
    // leaves the same state.
    let r3 = rule_dst("10.0.0.0", 24, 5);
    let evicted = cls.replace(r3.clone()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&evicted, &r2));
    assert_eq!(cls.count(), 1);
    assert_eq!(cls.stats().n_subtables, 1);
}

/// Safe cursor iteration while removing yielded rules.
#[test]
fn safe_cursor_with_removal() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    let rules: Vec<Arc<Rule>> = (0..10)
        .map(|i| rule_dst(&format!("10.0.{}.0", i), 24, i as u32))
        .collect();
    for r in &rules {
        cls.insert(r.clone()).unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = cls.cursor(None, true);
    while let Some(r) = cursor.advance() {
        let idx = rules.iter().position(|x| Arc::ptr_eq(x, &r)).unwrap();
        seen.push(idx);
        if idx % 2 == 1 {
            cls.remove(&r).unwrap();
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert_eq!(cls.count(), 5);
}

/// Cursor with a target yields exactly the loose matches.
#[test]
fn cursor_target_filter() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    let a = rule_dst("10.1.0.0", 16, 1);
    let b = rule_dst("10.1.2.0", 24, 2);
    let c = rule_dst("10.2.0.0", 16, 3);
    let d = rule_src("10.1.0.0", 16, 4);
    for r in [&a, &b, &c, &d] {
        cls.insert(r.clone()).unwrap();
    }

    let mut target_mask = FlowMask::new();
    target_mask.set_field_prefix(FieldId::Ipv4Dst, 16);
    let mut tv = Flow::new();
    tv.set_ipv4_dst("10.1.0.0".parse().unwrap());
    let target = MiniMatch::new(tv, target_mask);

    let got: Vec<Arc<Rule>> = cls.cursor(Some(&target), false).collect();
    assert_eq!(got.len(), 2);
    assert!(got.iter().any(|r| Arc::ptr_eq(r, &a)));
    assert!(got.iter().any(|r| Arc::ptr_eq(r, &b)));
}

/// Insert followed by remove restores the previous observable state.
#[test]
fn round_trip_restores_state() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    cls.insert(catchall(1)).unwrap();
    cls.insert(rule_dst("10.1.0.0", 16, 10)).unwrap();
    cls.insert(rule_src("10.9.0.0", 16, 20)).unwrap();

    let stats_before = cls.stats();
    let dump_before = cls.dump();

    // A new mask shape, a trie prefix, and a partition all come and go.
    let mut mask = FlowMask::new();
    mask.set_field(FieldId::Metadata);
    mask.set_field_prefix(FieldId::Ipv4Dst, 24);
    let mut v = Flow::new();
    v.set_metadata(42);
    v.set_ipv4_dst("10.1.2.0".parse().unwrap());
    let r = Arc::new(Rule::new(MiniMatch::new(v, mask), 99).unwrap());
    cls.insert(r.clone()).unwrap();
    assert_eq!(cls.count(), 4);
    cls.remove(&r).unwrap();

    assert_eq!(cls.stats(), stats_before);
    assert_eq!(cls.dump(), dump_before);
}

/// Overlap: equal priority and a satisfiable mask intersection.
#[test]
fn overlap_query() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    cls.insert(rule_dst("10.1.0.0", 16, 7)).unwrap();

    // Same priority, compatible values in the shared bits.
    let probe = rule_dst("10.1.2.0", 24, 7);
    assert!(cls.rule_overlaps(&probe));
    // Same priority, disjoint values.
    let probe = rule_dst("10.2.0.0", 24, 7);
    assert!(!cls.rule_overlaps(&probe));
    // Overlapping match but different priority.
    let probe = rule_dst("10.1.2.0", 24, 8);
    assert!(!cls.rule_overlaps(&probe));
    // A criteria-free probe overlaps anything of equal priority.
    assert!(cls.rule_overlaps(&catchall(7)));
}

#[test]
fn batch_lookup_matches_single_lookups() {
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    cls.insert(rule_dst("10.1.0.0", 16, 10)).unwrap();
    cls.insert(rule_dst("10.1.2.0", 24, 20)).unwrap();
    cls.insert(catchall(1)).unwrap();

    let flows: Vec<Flow> = [
        "10.1.2.3",
        "10.1.9.9",
        "172.16.0.1",
        "10.1.2.255",
    ]
    .iter()
    .map(|a| flow_dst(a))
    .collect();
    let mut results = vec![None; flows.len()];
    assert!(cls.lookup_batch(&flows, &mut results));

    for (flow, batched) in flows.iter().zip(results.iter()) {
        let mut wc = FlowMask::new();
        let single = cls.lookup(flow, &mut wc);
        match (batched, &single) {
            (Some(b), Some(s)) => assert!(Arc::ptr_eq(b, s)),
            (None, None) => {}
            other => panic!("batch/single disagree: {:?}", other),
        }
    }
}

/// Build a small random universe, then check the classifier against a
/// brute-force matcher, and the returned wildcard mask against its
/// soundness contract: flows agreeing on every reported bit classify
/// identically.
#[test]
fn randomized_differential() {
    let mut rng = StdRng::seed_from_u64(0x0f10_3c15);
    let cls = Classifier::new(Classifier::DEFAULT_SEGMENTS);
    let mut rules: Vec<Arc<Rule>> = Vec::new();

    let dsts = ["10.0.0.0", "10.1.0.0", "10.1.2.0", "172.16.0.0"];
    let plens = [8u8, 16, 24, 32];

    for i in 0..120u32 {
        let mut mask = FlowMask::new();
        let mut v = Flow::new();
        match i % 5 {
            0 => {
                mask.set_field(FieldId::Metadata);
                v.set_metadata(rng.gen_range(0..4));
            }
            1 => {
                let p = plens[rng.gen_range(0..plens.len())];
                mask.set_field_prefix(FieldId::Ipv4Dst, p);
                v.set_ipv4_dst(
                    dsts[rng.gen_range(0..dsts.len())].parse().unwrap(),
                );
            }
            2 => {
                mask.set_field_prefix(FieldId::Ipv4Dst, 16);
                mask.set_field(FieldId::TpDst);
                v.set_ipv4_dst(
                    dsts[rng.gen_range(0..dsts.len())].parse().unwrap(),
                );
                v.set_tp_dst(rng.gen_range(0..4) * 100);
            }
            3 => {
                mask.set_field(FieldId::EthType);
                v.set_eth_type(if rng.gen() { 0x0800 } else { 0x86dd });
            }
            _ => {
                mask.set_field(FieldId::Metadata);
                mask.set_field_prefix(FieldId::Ipv4Src, 24);
                v.set_metadata(rng.gen_range(0..4));
                v.set_ipv4_src(
                    dsts[rng.gen_range(0..dsts.len())].parse().unwrap(),
                );
            }
        }
        // Unique priorities keep the max-priority match unambiguous.
        let r = Arc::new(Rule::new(MiniMatch::new(v, mask), i).unwrap());
        if cls.insert(r.clone()).unwrap().is_none() {
            rules.push(r);
        }
    }

    for _ in 0..400 {
        let mut f = Flow::new();
        f.set_metadata(rng.gen_range(0..5));
        f.set_ipv4_dst(dsts[rng.gen_range(0..dsts.len())].parse().unwrap());
        f.set_ipv4_src(dsts[rng.gen_range(0..dsts.len())].parse().unwrap());
        f.set_tp_dst(rng.gen_range(0..5) * 100);
        f.set_eth_type(if rng.gen() { 0x0800 } else { 0x86dd });
        if rng.gen() {
            // Perturb an address byte to leave the curated universe.
            f.set_ipv4_dst(Ipv4Addr::from(rng.gen::<u32>()));
        }

        let mut wc = FlowMask::new();
        let got = cls.lookup(&f, &mut wc);

        let want = rules
            .iter()
            .filter(|r| r.is_installed() && r.matches(&f))
            .max_by_key(|r| r.priority());
        match (&got, want) {
            (Some(g), Some(w)) => assert!(
                Arc::ptr_eq(g, w),
                "classifier {:?} brute force {:?} flow {:?}",
                g,
                w,
                f
            ),
            (None, None) => {}
            other => panic!("mismatch {:?} flow {:?}", other, f),
        }

        // Soundness: randomize every byte the lookup did not examine.
        for _ in 0..4 {
            let mut bytes = *f.bytes();
            for (b, byte) in bytes.iter_mut().enumerate() {
                let keep = wc.bytes()[b];
                let noise: u8 = rng.gen();
                *byte = (*byte & keep) | (noise & !keep);
            }
            let f2 = Flow::from_bytes(bytes);
            let mut wc2 = FlowMask::new();
            let got2 = cls.lookup(&f2, &mut wc2);
            match (&got, &got2) {
                (Some(a), Some(b)) => assert!(
                    Arc::ptr_eq(a, b),
                    "wildcard unsound: {:?} vs {:?}",
                    a,
                    b
                ),
                (None, None) => {}
                other => panic!("wildcard unsound: {:?}", other),
            }
        }
    }
}

/// Readers race a writer; every result must be a rule that actually
/// matches the flow it was returned for.
#[test]
fn readers_race_writer() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let cls = Arc::new(Classifier::new(Classifier::DEFAULT_SEGMENTS));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for t in 0..3u64 {
        let cls = cls.clone();
        let stop = stop.clone();
        readers.push(std::thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(t);
            while !stop.load(Ordering::Relaxed) {
                let mut f = Flow::new();
                f.set_ipv4_dst(Ipv4Addr::from(
                    0x0a000000 | rng.gen_range(0..64u32),
                ));
                let mut wc = FlowMask::new();
                if let Some(r) = cls.lookup(&f, &mut wc) {
                    assert!(r.matches(&f));
                }
            }
        }));
    }

    let mut rng = StdRng::seed_from_u64(99);
    for round in 0..300u32 {
        let mut installed = Vec::new();
        for i in 0..20u32 {
            let plen = [16u8, 24, 32][rng.gen_range(0..3)];
            let r = rule_dst(
                &format!("10.0.0.{}", rng.gen_range(0..64)),
                plen,
                round * 100 + i,
            );
            cls.insert(r.clone()).unwrap();
            installed.push(r);
        }
        for r in installed {
            cls.remove(&r).unwrap();
        }
    }
    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }
    assert!(cls.is_empty());
}
