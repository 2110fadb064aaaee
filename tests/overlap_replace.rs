use flow_classifier::{Classifier, FieldId, Flow, FlowMatch, Rule};
use std::sync::Arc;
use test_log::test;

fn spec(f: impl FnOnce(&mut FlowMatch)) -> FlowMatch {
    let mut m = FlowMatch::new();
    f(&mut m);
    m
}

#[test]
fn overlap_same_priority_disjoint_fields() {
    let cls = Classifier::default();

    let a = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 80)), 5));
    let b = Arc::new(Rule::new(
        spec(|m| m.set_exact(FieldId::Ipv4Src, 0x0a00_0001)),
        5,
    ));
    cls.insert(a.clone(), 0, &[]);
    cls.insert(b.clone(), 0, &[]);

    // Disjoint constrained fields: a packet can satisfy both.
    assert!(cls.rule_overlaps(&a, 0));
    assert!(cls.rule_overlaps(&b, 0));
}

#[test]
fn no_overlap_on_conflicting_values_or_priorities() {
    let cls = Classifier::default();

    let a = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 80)), 5));
    let b = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 443)), 5));
    let c = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 80)), 6));
    cls.insert(a.clone(), 0, &[]);
    cls.insert(b.clone(), 0, &[]);
    cls.insert(c.clone(), 0, &[]);

    // Same field, different required values: no shared packet.
    // The equal-match rule c has a different priority: no conflict.
    assert!(!cls.rule_overlaps(&a, 0));
    assert!(!cls.rule_overlaps(&b, 0));
    assert!(!cls.rule_overlaps(&c, 0));
}

#[test]
fn overlap_respects_versions() {
    let cls = Classifier::default();

    let a = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 80)), 5));
    let b = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpSrc, 1024)), 5));
    cls.insert(a.clone(), 0, &[]);
    cls.insert(b.clone(), 4, &[]);

    assert!(!cls.rule_overlaps(&a, 3));
    assert!(cls.rule_overlaps(&a, 4));

    b.make_invisible_in_version(6);
    assert!(!cls.rule_overlaps(&a, 6));
}

#[test]
fn replace_swaps_equal_rule() {
    let cls = Classifier::default();

    let old = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 80)), 5));
    cls.insert(old.clone(), 0, &[]);

    let new = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 80)), 5));
    let displaced = cls.replace(new.clone(), 0, &[]).unwrap();
    assert!(Arc::ptr_eq(&displaced, &old));
    assert_eq!(1, cls.count());

    let mut flow = Flow::new();
    flow.set(FieldId::TcpDst, 80);
    let hit = cls.lookup(&flow, 0, None).unwrap();
    assert!(Arc::ptr_eq(&hit, &new));
}

#[test]
fn replace_without_existing_rule_is_insert() {
    let cls = Classifier::default();

    let rule = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 80)), 5));
    assert!(cls.replace(rule.clone(), 0, &[]).is_none());
    assert_eq!(1, cls.count());

    // Different priority is a different rule, not a replacement.
    let other = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, 80)), 6));
    assert!(cls.replace(other.clone(), 0, &[]).is_none());
    assert_eq!(2, cls.count());
}

#[test]
fn find_match_exactly() {
    let cls = Classifier::default();

    let s = spec(|m| {
        m.set_exact(FieldId::TcpDst, 80);
        m.set_exact(FieldId::EthType, 0x0800);
    });
    let rule = Arc::new(Rule::new(s, 5));
    cls.insert(rule.clone(), 0, &[]);

    let found = cls.find_match_exactly(&s, 5, 0).unwrap();
    assert!(Arc::ptr_eq(&found, &rule));

    assert!(cls.find_match_exactly(&s, 4, 0).is_none());

    let other = spec(|m| m.set_exact(FieldId::TcpDst, 80));
    assert!(cls.find_match_exactly(&other, 5, 0).is_none());
}

#[test]
fn count_tracks_inserts_and_removes() {
    let cls = Classifier::default();
    assert!(cls.is_empty());

    let mut rules = Vec::new();
    for port in 0..10u64 {
        let rule = Arc::new(Rule::new(spec(|m| m.set_exact(FieldId::TcpDst, port)), 1));
        cls.insert(rule.clone(), 0, &[]);
        rules.push(rule);
    }
    assert_eq!(10, cls.count());

    for rule in &rules {
        cls.remove(rule);
    }
    assert!(cls.is_empty());

    // All subtables are gone; lookups still work.
    let mut flow = Flow::new();
    flow.set(FieldId::TcpDst, 3);
    assert!(cls.lookup(&flow, 0, None).is_none());
}
