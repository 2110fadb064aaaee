use flow_classifier::{Classifier, FieldId, Flow, FlowMatch, Rule, MAX_VERSION};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use test_log::test;

fn port_rule(port: u64, priority: i32) -> Arc<Rule> {
    let mut spec = FlowMatch::new();
    spec.set_exact(FieldId::TcpDst, port);
    Arc::new(Rule::new(spec, priority))
}

fn port_flow(port: u64) -> Flow {
    let mut flow = Flow::new();
    flow.set(FieldId::TcpDst, port);
    flow
}

/// Readers at a pinned version must see a perfectly stable rule set while
/// a writer churns rules at future versions.
#[test]
fn lookups_stable_under_writer_churn() {
    let cls = Arc::new(Classifier::default());

    let mut stable = Vec::new();
    for port in 0..16u64 {
        let rule = port_rule(port, 5);
        cls.insert(rule.clone(), 0, &[]);
        stable.push(rule);
    }

    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for reader in 0..4 {
            let cls = &cls;
            let stable = &stable;
            let stop = &stop;
            scope.spawn(move || {
                let mut i = reader;
                while !stop.load(Relaxed) {
                    let port = i % 16;
                    let hit = cls.lookup(&port_flow(port as u64), 0, None).unwrap();
                    assert!(Arc::ptr_eq(&hit, &stable[port]));
                    i += 1;
                }
            });
        }

        // One iterating reader.
        {
            let cls = &cls;
            let stop = &stop;
            scope.spawn(move || {
                while !stop.load(Relaxed) {
                    // Version 0 predates all churn: exactly the stable set.
                    assert_eq!(16, cls.iter(0).count());
                }
            });
        }

        // The single writer: insert, soft-delete and remove churn rules
        // with distinct masks so subtables come and go.
        for round in 0..200u64 {
            let version = 1000 + round;
            let mut churn = Vec::new();
            for i in 0..8u64 {
                let mut spec = FlowMatch::new();
                spec.set_exact(FieldId::Ipv4Src, 0x0a00_0000 + i);
                spec.set_exact(FieldId::TcpSrc, round % 7);
                let rule = Arc::new(Rule::new(spec, (round % 11) as i32));
                cls.insert(rule.clone(), version, &[]);
                churn.push(rule);
            }
            for rule in &churn {
                rule.make_invisible_in_version(version + 1);
            }
            for rule in &churn {
                cls.remove(rule);
            }
        }

        stop.store(true, Relaxed);
    });

    assert_eq!(16, cls.count());
    for (port, rule) in stable.iter().enumerate() {
        let hit = cls.lookup(&port_flow(port as u64), MAX_VERSION, None).unwrap();
        assert!(Arc::ptr_eq(&hit, rule));
    }
}

/// A rule handed to readers stays usable after its physical removal.
#[test]
fn removed_rule_outlives_classifier_reference() {
    let cls = Classifier::default();
    let rule = port_rule(80, 5);
    cls.insert(rule.clone(), 0, &[]);

    let held = cls.lookup(&port_flow(80), 0, None).unwrap();
    cls.remove(&rule);
    drop(rule);

    // The classifier no longer knows the rule; our handle still works.
    assert!(cls.lookup(&port_flow(80), 0, None).is_none());
    assert_eq!(5, held.priority());
    assert!(held.matches(&port_flow(80)));
}

/// An insert that returned is observed by lookups at its version.
#[test]
fn insert_linearizes_with_lookups() {
    let cls = Arc::new(Classifier::default());

    std::thread::scope(|scope| {
        let (tx, rx) = std::sync::mpsc::channel::<u64>();

        {
            let cls = &cls;
            scope.spawn(move || {
                for port in rx {
                    // The insert for `port` returned before the message
                    // was sent, so this lookup must hit.
                    let hit = cls.lookup(&port_flow(port), 1, None);
                    assert!(hit.is_some(), "port {port} missing after insert");
                }
            });
        }

        for port in 0..500u64 {
            cls.insert(port_rule(port, 1), 1, &[]);
            tx.send(port).unwrap();
        }
        drop(tx);
    });
}
