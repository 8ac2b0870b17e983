//! End-to-end integration tests for the argus engine.
//!
//! These tests exercise the full pipeline from event intake through rule
//! derivation, trust propagation and the audit surface, validating that the
//! dispatcher, both engines and the provenance ledger work together.

use argus::dispatch::{ChangeDispatcher, EventBatch, TenantId};
use argus::engine::{Engine, EngineConfig, Event};
use argus::node::{AttrValue, Node};
use argus::origin::OriginType;
use argus::profile::{ScanLevel, ScanProfile};
use argus::reference::Reference;
use argus::store::{Query, Timestamp};

fn test_engine() -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("argus=debug")
        .with_test_writer()
        .try_init();
    Engine::new(EngineConfig::default()).unwrap()
}

fn network_ref() -> Reference {
    Reference::from_tokens("Network", &["internet".to_string()])
}

fn reference(kind: &str, tokens: &[&str]) -> Reference {
    let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    Reference::from_tokens(kind, &tokens)
}

/// Declarations building a website stack down from a network, without any
/// HTTP headers.
fn website_stack() -> Vec<Event> {
    let network = network_ref();
    let hostname = reference("Hostname", &["internet", "example.com"]);
    let address = reference("IPAddress", &["internet", "192.0.2.7"]);
    let port = reference("IPPort", &["internet", "192.0.2.7", "tcp", "443"]);
    let service = reference("Service", &["https"]);
    let ip_service = reference(
        "IPService",
        &["internet", "192.0.2.7", "tcp", "443", "https"],
    );

    vec![
        Event::Declaration {
            node: Node::new("Network").with_attr("name", "internet"),
        },
        Event::Declaration {
            node: Node::new("Hostname")
                .with_attr("network", network.clone())
                .with_attr("name", "example.com"),
        },
        Event::Declaration {
            node: Node::new("IPAddress")
                .with_attr("network", network)
                .with_attr("address", "192.0.2.7"),
        },
        Event::Declaration {
            node: Node::new("IPPort")
                .with_attr("address", address)
                .with_attr("protocol", "tcp")
                .with_attr("port", 443i64),
        },
        Event::Declaration {
            node: Node::new("Service").with_attr("name", "https"),
        },
        Event::Declaration {
            node: Node::new("IPService")
                .with_attr("ip_port", port)
                .with_attr("service", service),
        },
        Event::Declaration {
            node: Node::new("Website")
                .with_attr("ip_service", ip_service)
                .with_attr("hostname", hostname),
        },
    ]
}

#[test]
fn end_to_end_ingest_derive_explain() {
    let engine = test_engine();
    let at = Timestamp::new(100);

    let mut events = website_stack();
    events.push(Event::DeclareProfile {
        reference: network_ref(),
        level: ScanLevel::L3,
    });
    let outcome = engine.process(events, at).unwrap();

    // The website without an HSTS header produced a finding.
    let findings = engine.query(&Query::all_of("Finding"), at).unwrap();
    assert_eq!(findings.len(), 1, "{outcome:?}");
    let finding_ref = &findings[0].0;

    // Audit surface: the finding's origin names the rule and its anchor.
    let origins = engine.origins(finding_ref, at).unwrap();
    assert_eq!(origins.len(), 1);
    assert_eq!(origins[0].origin_type, OriginType::Nibblet);
    assert_eq!(origins[0].method, "missing-hsts");
    assert_eq!(origins[0].source.kind(), "Website");

    // Trust propagation: the hostname inherited L2 (clamped) from the
    // network, one hop away.
    let hostname = reference("Hostname", &["internet", "example.com"]);
    let explanation = engine.explain(&hostname, at).unwrap();
    assert_eq!(explanation.len(), 1);
    assert_eq!(explanation[0].source, network_ref());
    assert_eq!(explanation[0].level, ScanLevel::L2);
    assert_eq!(explanation[0].depth, 1);
}

#[test]
fn identity_determinism_over_the_ingested_graph() {
    let engine = test_engine();
    let at = Timestamp::new(100);
    engine.process(website_stack(), at).unwrap();

    for kind in [
        "Network",
        "Hostname",
        "IPAddress",
        "IPPort",
        "Service",
        "IPService",
        "Website",
    ] {
        for (stored_ref, node) in engine.query(&Query::all_of(kind), at).unwrap() {
            assert_eq!(stored_ref.kind(), node.kind());
            let tree = engine.schema().parse(&stored_ref.to_string()).unwrap();
            assert_eq!(
                tree.reference().to_string(),
                stored_ref.to_string(),
                "re-serializing the parsed token tree must reproduce the identity"
            );
        }
    }
}

#[test]
fn rerunning_an_unchanged_batch_is_idempotent() {
    let engine = test_engine();
    let at = Timestamp::new(100);

    engine.process(website_stack(), at).unwrap();
    let findings_before = engine.query(&Query::all_of("Finding"), at).unwrap();

    // Same declarations again: no content changes, empty derivation delta.
    let outcome = engine.process(website_stack(), Timestamp::new(200)).unwrap();
    assert!(outcome.changed.is_empty());
    assert!(outcome.derivation.is_empty_delta());

    let findings_after = engine
        .query(&Query::all_of("Finding"), Timestamp::new(200))
        .unwrap();
    assert_eq!(findings_before, findings_after);
}

#[test]
fn observed_header_flips_the_finding_back_and_forth() {
    let engine = test_engine();
    let website = reference(
        "Website",
        &[
            "internet",
            "192.0.2.7",
            "tcp",
            "443",
            "https",
            "internet",
            "example.com",
        ],
    );

    engine.process(website_stack(), Timestamp::new(100)).unwrap();
    assert_eq!(
        engine
            .query(&Query::all_of("Finding"), Timestamp::new(100))
            .unwrap()
            .len(),
        1
    );

    // A header scan sees HSTS: the finding retracts.
    engine
        .process(
            vec![Event::Observation {
                method: "header-scan".into(),
                source: website.clone(),
                nodes: vec![
                    Node::new("HTTPHeader")
                        .with_attr("website", website.clone())
                        .with_attr("key", "strict-transport-security")
                        .with_attr("value", "max-age=31536000"),
                ],
                task_id: Some("task-1".into()),
            }],
            Timestamp::new(200),
        )
        .unwrap();
    assert!(
        engine
            .query(&Query::all_of("Finding"), Timestamp::new(200))
            .unwrap()
            .is_empty()
    );

    // The next scan no longer sees the header: the finding comes back.
    engine
        .process(
            vec![Event::Observation {
                method: "header-scan".into(),
                source: website,
                nodes: vec![],
                task_id: Some("task-2".into()),
            }],
            Timestamp::new(300),
        )
        .unwrap();
    let findings = engine
        .query(&Query::all_of("Finding"), Timestamp::new(300))
        .unwrap();
    assert_eq!(findings.len(), 1);
}

#[test]
fn finding_inherits_trust_from_its_subject() {
    let engine = test_engine();
    let at = Timestamp::new(100);

    let mut events = website_stack();
    events.push(Event::DeclareProfile {
        reference: network_ref(),
        level: ScanLevel::L4,
    });
    engine.process(events, at).unwrap();

    let findings = engine.query(&Query::all_of("Finding"), at).unwrap();
    assert_eq!(findings.len(), 1);
    let (finding_ref, finding) = &findings[0];

    // The finding points at its subject through an untyped relation.
    let subject = finding
        .attr("ooi")
        .and_then(AttrValue::as_reference)
        .unwrap();
    assert_eq!(subject.kind(), "Website");

    // Trust flowed network → … → website → finding, capped by the clamps
    // crossed on the way (L2 at the network boundary).
    let profile = engine.profile(finding_ref, at).unwrap();
    match profile {
        ScanProfile::Inherited { level, .. } => assert_eq!(level, ScanLevel::L2),
        other => panic!("expected inherited profile on finding, got {other:?}"),
    }
}

#[test]
fn deleting_the_graph_root_retracts_everything_derived() {
    let engine = test_engine();
    engine.process(website_stack(), Timestamp::new(100)).unwrap();
    assert_eq!(
        engine
            .query(&Query::all_of("Finding"), Timestamp::new(100))
            .unwrap()
            .len(),
        1
    );

    // Deleting the website removes the finding and its origin.
    let website = reference(
        "Website",
        &[
            "internet",
            "192.0.2.7",
            "tcp",
            "443",
            "https",
            "internet",
            "example.com",
        ],
    );
    engine
        .process(
            vec![Event::DeleteNode {
                reference: website.clone(),
            }],
            Timestamp::new(200),
        )
        .unwrap();

    assert!(engine.get(&website, Timestamp::new(200)).unwrap().is_none());
    assert!(
        engine
            .query(&Query::all_of("Finding"), Timestamp::new(200))
            .unwrap()
            .is_empty()
    );

    // Bitemporal reads still see the world as it was.
    assert!(engine.get(&website, Timestamp::new(150)).unwrap().is_some());
    assert_eq!(
        engine
            .query(&Query::all_of("Finding"), Timestamp::new(150))
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn sole_source_deletion_reverts_profiles_and_findings_stay_consistent() {
    let engine = test_engine();
    let hostname = reference("Hostname", &["internet", "example.com"]);

    let mut events = website_stack();
    events.push(Event::DeclareProfile {
        reference: network_ref(),
        level: ScanLevel::L3,
    });
    engine.process(events, Timestamp::new(100)).unwrap();
    assert_eq!(
        engine
            .profile(&hostname, Timestamp::new(100))
            .unwrap()
            .level(),
        ScanLevel::L2
    );

    engine
        .process(
            vec![Event::RetractProfile {
                reference: network_ref(),
            }],
            Timestamp::new(200),
        )
        .unwrap();
    assert_eq!(
        engine.profile(&hostname, Timestamp::new(200)).unwrap(),
        ScanProfile::Empty
    );
}

#[test]
fn dispatcher_keeps_tenants_fully_isolated() {
    let dispatcher = ChangeDispatcher::in_memory();

    let mut events_a = website_stack();
    events_a.push(Event::DeclareProfile {
        reference: network_ref(),
        level: ScanLevel::L3,
    });
    let batches = vec![
        EventBatch {
            tenant: TenantId::new("org-a"),
            events: events_a,
            valid_time: Timestamp::new(100),
        },
        EventBatch {
            tenant: TenantId::new("org-b"),
            events: vec![Event::Declaration {
                node: Node::new("Network").with_attr("name", "internet"),
            }],
            valid_time: Timestamp::new(100),
        },
    ];

    let results = dispatcher.dispatch_all(batches);
    assert_eq!(results.len(), 2);
    for (_, outcomes) in &results {
        assert!(outcomes.iter().all(|r| r.is_ok()));
    }

    // org-a derived a finding; org-b shares the same network name but has
    // no website stack and no finding.
    let a_findings = dispatcher
        .with_engine(&TenantId::new("org-a"), |engine| {
            engine
                .query(&Query::all_of("Finding"), Timestamp::new(100))
                .unwrap()
        })
        .unwrap();
    assert_eq!(a_findings.len(), 1);

    let b_findings = dispatcher
        .with_engine(&TenantId::new("org-b"), |engine| {
            engine
                .query(&Query::all_of("Finding"), Timestamp::new(100))
                .unwrap()
        })
        .unwrap();
    assert!(b_findings.is_empty());
}
