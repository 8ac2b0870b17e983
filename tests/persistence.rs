//! Persistence and recovery tests for the argus engine.
//!
//! These tests verify that nodes, profiles and the provenance ledger
//! survive engine restart (commit + reopen cycle) on the redb-backed store.

use argus::engine::{Engine, EngineConfig, Event};
use argus::node::Node;
use argus::profile::{ScanLevel, ScanProfile};
use argus::reference::Reference;
use argus::store::{Query, Timestamp};

fn persistent_engine(dir: &std::path::Path) -> Engine {
    Engine::new(EngineConfig {
        data_dir: Some(dir.to_path_buf()),
        ..Default::default()
    })
    .unwrap()
}

fn network_ref() -> Reference {
    Reference::from_tokens("Network", &["internet".to_string()])
}

fn hostname_ref() -> Reference {
    Reference::from_tokens(
        "Hostname",
        &["internet".to_string(), "example.com".to_string()],
    )
}

fn seed_events() -> Vec<Event> {
    vec![
        Event::Declaration {
            node: Node::new("Network").with_attr("name", "internet"),
        },
        Event::Declaration {
            node: Node::new("Hostname")
                .with_attr("network", network_ref())
                .with_attr("name", "example.com"),
        },
        Event::DeclareProfile {
            reference: network_ref(),
            level: ScanLevel::L3,
        },
    ]
}

#[test]
fn graph_and_profiles_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    // First session: ingest and derive.
    {
        let engine = persistent_engine(dir.path());
        engine.process(seed_events(), Timestamp::new(100)).unwrap();
    }

    // Second session: reopen and verify.
    {
        let engine = persistent_engine(dir.path());

        let node = engine
            .get(&hostname_ref(), Timestamp::new(100))
            .unwrap()
            .expect("hostname survives restart");
        assert_eq!(node.attr("name").unwrap().as_text(), Some("example.com"));

        // The inherited profile survives, clamps intact.
        let profile = engine.profile(&hostname_ref(), Timestamp::new(100)).unwrap();
        assert_eq!(profile.level(), ScanLevel::L2);
        let explanation = engine.explain(&hostname_ref(), Timestamp::new(100)).unwrap();
        assert_eq!(explanation.len(), 1);
        assert_eq!(explanation[0].source, network_ref());
    }
}

#[test]
fn ledger_survives_restart_and_diffing_continues() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = network_ref();

    let hostname = |name: &str| {
        Node::new("Hostname")
            .with_attr("network", network_ref())
            .with_attr("name", name)
    };

    {
        let engine = persistent_engine(dir.path());
        engine
            .process(
                vec![Event::Observation {
                    method: "dns".into(),
                    source: source.clone(),
                    nodes: vec![hostname("a.com"), hostname("b.com")],
                    task_id: Some("task-1".into()),
                }],
                Timestamp::new(100),
            )
            .unwrap();
    }

    // A later session re-observes only a.com; diffing against the persisted
    // ledger retracts b.com.
    {
        let engine = persistent_engine(dir.path());
        engine
            .process(
                vec![Event::Observation {
                    method: "dns".into(),
                    source,
                    nodes: vec![hostname("a.com")],
                    task_id: Some("task-2".into()),
                }],
                Timestamp::new(200),
            )
            .unwrap();

        let live = engine
            .query(&Query::all_of("Hostname"), Timestamp::new(200))
            .unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].0.to_string().contains("a.com"));

        // The history still shows both at the earlier valid time.
        let historic = engine
            .query(&Query::all_of("Hostname"), Timestamp::new(150))
            .unwrap();
        assert_eq!(historic.len(), 2);
    }
}

#[test]
fn profile_retraction_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    {
        let engine = persistent_engine(dir.path());
        engine.process(seed_events(), Timestamp::new(100)).unwrap();
        engine
            .process(
                vec![Event::RetractProfile {
                    reference: network_ref(),
                }],
                Timestamp::new(200),
            )
            .unwrap();
    }

    {
        let engine = persistent_engine(dir.path());
        assert_eq!(
            engine.profile(&hostname_ref(), Timestamp::new(200)).unwrap(),
            ScanProfile::Empty
        );
        // The valid-time axis keeps the pre-retraction state readable.
        assert_eq!(
            engine
                .profile(&hostname_ref(), Timestamp::new(150))
                .unwrap()
                .level(),
            ScanLevel::L2
        );
    }
}
