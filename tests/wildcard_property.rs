use flow_classifier::{Classifier, FieldId, Flow, FlowMatch, Rule, Wildcards, FLOW_WORDS};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use test_log::test;

const SRC_BASES: [u64; 4] = [0x0a00_0000, 0x0a0a_0000, 0xc0a8_0100, 0xac10_0000];
const DST_BASES: [u64; 4] = [0x0a00_0000, 0x0a0a_0a00, 0xc0a8_0200, 0x0808_0808];
const PORTS: [u64; 3] = [80, 443, 8080];

fn random_spec(rng: &mut StdRng) -> FlowMatch {
    let mut spec = FlowMatch::new();
    let n_fields = rng.random_range(1..=3);
    for _ in 0..n_fields {
        match rng.random_range(0..5) {
            0 => spec.set_exact(FieldId::Metadata, rng.random_range(1..4)),
            1 => spec.set_exact(FieldId::EthType, 0x0800),
            2 => {
                let plen = [8u8, 16, 24, 32][rng.random_range(0..4)];
                spec.set_prefix(
                    FieldId::Ipv4Src,
                    SRC_BASES[rng.random_range(0..SRC_BASES.len())],
                    plen,
                );
            }
            3 => {
                let plen = [8u8, 16, 24, 32][rng.random_range(0..4)];
                spec.set_prefix(
                    FieldId::Ipv4Dst,
                    DST_BASES[rng.random_range(0..DST_BASES.len())],
                    plen,
                );
            }
            _ => spec.set_exact(FieldId::TcpDst, PORTS[rng.random_range(0..PORTS.len())]),
        }
    }
    spec
}

fn random_flow(rng: &mut StdRng) -> Flow {
    let mut flow = Flow::new();
    if rng.random::<bool>() {
        flow.set(FieldId::Metadata, rng.random_range(0..5));
    }
    if rng.random::<bool>() {
        flow.set(FieldId::EthType, 0x0800);
    }
    flow.set(
        FieldId::Ipv4Src,
        SRC_BASES[rng.random_range(0..SRC_BASES.len())] | rng.random_range(0..0x1_0000),
    );
    flow.set(
        FieldId::Ipv4Dst,
        DST_BASES[rng.random_range(0..DST_BASES.len())] | rng.random_range(0..0x1_0000),
    );
    flow.set(FieldId::TcpDst, PORTS[rng.random_range(0..PORTS.len())]);
    flow.set(FieldId::TcpSrc, rng.random_range(1024..0x1_0000));
    flow
}

/// Core wildcard-mask safety property: flipping any combination of bits
/// the lookup did not consult must not change the result.
fn check_mask_safety(cls: &Classifier, rng: &mut StdRng, lookups: usize) {
    for _ in 0..lookups {
        let flow = random_flow(rng);
        let mut wc = Wildcards::new();
        let result = cls.lookup(&flow, 0, Some(&mut wc));

        for _ in 0..5 {
            let mut mutated = flow;
            for w in 0..FLOW_WORDS {
                let flips = rng.random::<u64>() & !wc.words()[w];
                mutated = {
                    let mut words = *mutated.words();
                    words[w] ^= flips;
                    Flow(words)
                };
            }
            assert!(wc.equivalent(&flow, &mutated));

            let mutated_result = cls.lookup(&mutated, 0, None);
            match (&result, &mutated_result) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    assert!(
                        Arc::ptr_eq(a, b),
                        "result changed under wildcarded bits:\n flow {flow:?}\n  got {a:?}\n  vs  {b:?}",
                    );
                }
                (a, b) => panic!(
                    "hit/miss flipped under wildcarded bits:\n flow {flow:?}\n  {a:?} vs {b:?}",
                ),
            }
        }
    }
}

fn build_classifier(rng: &mut StdRng, n_rules: usize) -> Classifier {
    let cls = Classifier::default();
    for _ in 0..n_rules {
        let spec = random_spec(rng);
        let priority = rng.random_range(0..30);
        // Duplicate (match, priority) pairs are possible; replace quietly.
        let _ = cls.replace(Arc::new(Rule::new(spec, priority)), 0, &[]);
    }
    cls
}

#[test]
fn mask_safety_plain() {
    let mut rng = StdRng::seed_from_u64(0xC1A5);
    let cls = build_classifier(&mut rng, 60);
    check_mask_safety(&cls, &mut rng, 200);
}

#[test]
fn mask_safety_with_tries() {
    let mut rng = StdRng::seed_from_u64(0xF10E);
    let cls = build_classifier(&mut rng, 60);
    cls.set_prefix_fields(&[FieldId::Ipv4Src, FieldId::Ipv4Dst])
        .unwrap();
    check_mask_safety(&cls, &mut rng, 200);
}

#[test]
fn mask_safety_with_metadata_partitions() {
    let mut rng = StdRng::seed_from_u64(0xBEEF);
    let cls = Classifier::default();

    for meta in 1..4u64 {
        for port in PORTS {
            let mut spec = FlowMatch::new();
            spec.set_exact(FieldId::Metadata, meta);
            spec.set_exact(FieldId::TcpDst, port);
            cls.insert(
                Arc::new(Rule::new(spec, (meta * 10 + port % 7) as i32)),
                0,
                &[],
            );
        }
    }
    // Plus some rules that do not constrain metadata.
    for _ in 0..20 {
        let spec = random_spec(&mut rng);
        let _ = cls.replace(Arc::new(Rule::new(spec, rng.random_range(0..30))), 0, &[]);
    }

    check_mask_safety(&cls, &mut rng, 200);
}

#[test]
fn lookup_agrees_with_linear_scan() {
    let mut rng = StdRng::seed_from_u64(0x5CA7);
    let cls = Classifier::default();

    let mut rules = Vec::new();
    for _ in 0..60 {
        let spec = random_spec(&mut rng);
        let priority = rng.random_range(0..30);
        let rule = Arc::new(Rule::new(spec, priority));
        if cls.replace(rule.clone(), 0, &[]).is_some() {
            rules.retain(|r: &Arc<Rule>| !(r.equal(&rule)));
        }
        rules.push(rule);
    }

    for _ in 0..300 {
        let flow = random_flow(&mut rng);
        let expected_priority = rules
            .iter()
            .filter(|r| r.matches(&flow))
            .map(|r| r.priority())
            .max();

        let hit = cls.lookup(&flow, 0, None);
        assert_eq!(expected_priority, hit.as_ref().map(|r| r.priority()));
        if let Some(hit) = hit {
            assert!(hit.matches(&flow));
        }
    }
}
