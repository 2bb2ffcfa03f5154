//! End-to-end scenarios over an in-process cluster

use crate::cluster::LocalCluster;
use crate::gc::GarbageCollector;
use crate::service::NodeService;
use ermes_common::{
    AcquireSessionOptions, BestOffloadTargetsOptions, Config, CreateSessionOptions, Error,
    GarbageCollectSessionsOptions, GeoCoordinates, OffloadCriterion, OffloadSessionOptions,
    OnloadSessionOptions, ResourcesUsage, SessionId, SessionLocation, SessionState, now_millis,
};
use ermes_store::{ScoredMember, SessionValue};
use ermes_topology::{Area, Infrastructure, Node};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MILAN: GeoCoordinates = GeoCoordinates::new(45.46, 9.19);
const TURIN: GeoCoordinates = GeoCoordinates::new(45.07, 7.69);
const ROME: GeoCoordinates = GeoCoordinates::new(41.90, 12.50);

fn node(id: &str, geo: Option<GeoCoordinates>, cpu: f64) -> Node {
    let node = Node::new(id, format!("{id}.ermes:6379"))
        .with_capacity(ResourcesUsage::new().with("cpu", cpu));
    match geo {
        Some(geo) => node.with_geo_coordinates(geo),
        None => node,
    }
}

fn infrastructure() -> Infrastructure {
    Infrastructure::new(vec![
        Area::new(node("cloud", None, 32.0))
            .with_area(
                Area::new(node("north", Some(MILAN), 8.0))
                    .with_area(Area::new(node("milan", Some(MILAN), 4.0)))
                    .with_area(Area::new(node("turin", Some(TURIN), 4.0))),
            )
            .with_area(
                Area::new(node("center", Some(ROME), 8.0))
                    .with_area(Area::new(node("rome", Some(ROME), 4.0))),
            ),
    ])
}

fn cluster() -> LocalCluster {
    let mut config = Config::default();
    config.offload.page_size = 2;
    config.offload.channel_capacity = 1;
    LocalCluster::in_memory(&infrastructure(), &config).unwrap()
}

fn exclusive() -> AcquireSessionOptions {
    AcquireSessionOptions::default()
}

#[tokio::test]
async fn test_acquired_session_offload_example() {
    let cluster = cluster();
    let milan = cluster.node("milan").unwrap();
    let a = SessionId::generate();
    milan
        .create_session(&CreateSessionOptions::default().with_session_id(a.clone()))
        .unwrap();

    assert_eq!(milan.acquire_session(&a, exclusive()).unwrap(), None);
    let err = milan
        .offload_session(&a, OffloadSessionOptions::default(), CancellationToken::new())
        .err()
        .unwrap();
    assert!(matches!(err, Error::UnableToOffloadAcquiredSession(_)));

    milan.release_session(&a, exclusive()).unwrap();
    let mut transfer = milan
        .offload_session(&a, OffloadSessionOptions::default(), CancellationToken::new())
        .unwrap();
    let record = milan.store().get_session_record(&a).unwrap().unwrap();
    assert_eq!(record.state, SessionState::Offloading);

    let turin = cluster.node("turin").unwrap();
    transfer.spawn_loader();
    turin
        .onload_session(&transfer.handoff, transfer.stream, OnloadSessionOptions::default())
        .await
        .unwrap();
    let location = SessionLocation::new("turin", a.as_str());
    assert!(
        milan
            .confirm_session_offload(&a, &location, Some(&cluster.notifier()))
            .await
            .unwrap()
    );

    assert_eq!(milan.acquire_session(&a, exclusive()).unwrap(), Some(location.clone()));
    assert_eq!(
        milan
            .acquire_session(&a, AcquireSessionOptions::default().with_allow_offloading(true))
            .unwrap(),
        Some(location)
    );
    assert_eq!(turin.acquire_session(&a, exclusive()).unwrap(), None);
    assert_eq!(milan.find_lookup_node(std::slice::from_ref(&a)).unwrap().unwrap().id, "north");
}

fn every_shape() -> Vec<(&'static str, SessionValue)> {
    vec![
        ("flat", SessionValue::String("ciao".to_string())),
        ("flat-empty", SessionValue::String(String::new())),
        ("list", SessionValue::List(vec!["b".into(), "a".into(), "b".into()])),
        ("list-empty", SessionValue::List(Vec::new())),
        ("set", SessionValue::Set(BTreeSet::from(["x".to_string(), "y".to_string()]))),
        ("set-empty", SessionValue::Set(BTreeSet::new())),
        (
            "zset",
            SessionValue::ZSet(vec![
                ScoredMember::new("late", 9.5),
                ScoredMember::new("early", -1.0),
            ]),
        ),
        ("zset-empty", SessionValue::ZSet(Vec::new())),
        (
            "hash",
            SessionValue::Hash(BTreeMap::from([
                ("lang".to_string(), "it".to_string()),
                ("theme".to_string(), "dark".to_string()),
            ])),
        ),
        ("hash-empty", SessionValue::Hash(BTreeMap::new())),
    ]
}

#[tokio::test]
async fn test_payload_round_trip_across_shapes() {
    let cluster = cluster();
    let milan = cluster.node("milan").unwrap();
    let id = milan
        .create_session(&CreateSessionOptions::default().with_client_geo_coordinates(TURIN))
        .unwrap();
    for (name, value) in every_shape() {
        milan.set_session_value(&id, name, value).unwrap();
    }
    let before = milan.get_session_data(&id).unwrap();
    assert_eq!(before.len(), 10);

    let location = cluster
        .move_session("milan", "rome", &id, OffloadSessionOptions::default())
        .await
        .unwrap();
    assert_eq!(location.host, "rome");

    let rome = cluster.node("rome").unwrap();
    assert_eq!(rome.get_session_data(&id).unwrap(), before);
    assert_eq!(
        rome.get_session_value(&id, "zset").unwrap(),
        Some(SessionValue::ZSet(vec![
            ScoredMember::new("early", -1.0),
            ScoredMember::new("late", 9.5)
        ]))
    );
    assert_eq!(rome.get_session_metadata(&id).unwrap().client_geo_coordinates, Some(TURIN));
    assert!(milan.get_session_data(&id).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_concurrent_creators_get_unique_ids() {
    let node = Arc::new(NodeService::in_memory("milan", &Config::default()).unwrap());
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let node = node.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            (0..25)
                .map(|_| node.create_session(&CreateSessionOptions::default()).unwrap())
                .collect::<Vec<_>>()
        }));
    }
    let mut ids = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(ids.insert(id));
        }
    }
    assert_eq!(ids.len(), 200);
    assert_eq!(node.get_node_resources_usage("milan").unwrap().sessions, 200);
}

#[tokio::test]
async fn test_concurrent_exclusive_acquisitions() {
    let node = Arc::new(NodeService::in_memory("milan", &Config::default()).unwrap());
    let id = node.create_session(&CreateSessionOptions::default()).unwrap();
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let node = node.clone();
        let id = id.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            node.acquire_session(&id, exclusive())
        }));
    }
    let mut granted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(None) => granted += 1,
            Err(Error::SessionAlreadyAcquired(_)) => {}
            other => panic!("unexpected acquisition result: {other:?}"),
        }
    }
    assert_eq!(granted, 1);

    node.release_session(&id, exclusive()).unwrap();
    assert_eq!(node.acquire_session(&id, exclusive()).unwrap(), None);
}

#[test]
fn test_existing_id_is_never_overwritten() {
    let node = NodeService::in_memory("milan", &Config::default()).unwrap();
    let id = node
        .create_session(&CreateSessionOptions::default().with_client_geo_coordinates(MILAN))
        .unwrap();
    node.set_session_value(&id, "cart", SessionValue::List(vec!["pasta".into()]))
        .unwrap();

    let again = CreateSessionOptions::default()
        .with_session_id(id.clone())
        .with_client_geo_coordinates(ROME);
    assert!(matches!(
        node.create_session(&again),
        Err(Error::SessionIdAlreadyExists(_))
    ));
    assert_eq!(node.get_session_metadata(&id).unwrap().client_geo_coordinates, Some(MILAN));
    assert_eq!(node.get_session_data(&id).unwrap().len(), 1);
}

/// Seed a node with a mix of live, expired, stuck and moved sessions and
/// return how many should be collected at `now`.
fn seed_for_gc(node: &NodeService, now: u64) -> usize {
    let mut doomed = 0;
    for i in 0..23u64 {
        let expiry = match i % 3 {
            0 => Some(now - 1 - i),
            1 => Some(now + 3_600_000),
            _ => None,
        };
        let mut options = CreateSessionOptions::default();
        if let Some(expiry) = expiry {
            options = options.with_expires_at(expiry);
        }
        let id = node.create_session(&options).unwrap();
        if i % 3 == 0 {
            doomed += 1;
        }
        if i % 5 == 0 && i % 3 != 0 {
            node.store()
                .offload_start(&id, &OffloadSessionOptions::default())
                .unwrap();
        }
    }
    doomed
}

#[test]
fn test_gc_result_independent_of_page_size() {
    let mut outcomes = Vec::new();
    for page_size in [1, 2, 3, 7, 50] {
        let node = Arc::new(NodeService::in_memory("milan", &Config::default()).unwrap());
        let now = now_millis();
        let doomed = seed_for_gc(&node, now);
        let gc = GarbageCollector::new(
            node.clone(),
            GarbageCollectSessionsOptions::default()
                .with_page_size(page_size)
                .with_now(now),
        );
        let report = gc.sweep().unwrap();
        assert_eq!(report.expired, doomed);
        assert_eq!(report.visited, 23);

        let again = gc.sweep().unwrap();
        assert_eq!(again.collected(), 0);
        assert_eq!(again.visited, 23 - doomed);
        outcomes.push((report.expired, node.scan_sessions("", 100).unwrap().session_ids.len()));
    }
    assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_gc_interrupted_sweep_resumes() {
    let node = Arc::new(NodeService::in_memory("milan", &Config::default()).unwrap());
    let now = now_millis();
    let doomed = seed_for_gc(&node, now);
    let options = GarbageCollectSessionsOptions::default()
        .with_page_size(4)
        .with_now(now);

    // Two pages, then the sweeper restarts from the persisted cursor
    let first = node.garbage_collect_sessions(&options, None).unwrap();
    let second = node
        .garbage_collect_sessions(&options, first.cursor.as_deref())
        .unwrap();
    let gc = GarbageCollector::new(node.clone(), options).with_cursor(second.cursor.clone());
    let rest = gc.sweep().unwrap();

    assert_eq!(first.report.visited + second.report.visited + rest.visited, 23);
    assert_eq!(
        first.report.expired + second.report.expired + rest.expired,
        doomed
    );
    assert!(matches!(
        node.garbage_collect_sessions(&options, Some("bogus")),
        Err(Error::InvalidCursor(_))
    ));
}

#[tokio::test]
async fn test_gc_rolls_back_stuck_offloads() {
    let node = NodeService::in_memory("milan", &Config::default()).unwrap();
    let id = node.create_session(&CreateSessionOptions::default()).unwrap();
    let cancel = CancellationToken::new();
    let transfer = node
        .offload_session(&id, OffloadSessionOptions::default(), cancel.clone())
        .unwrap();
    cancel.cancel();
    drop(transfer);

    let options = GarbageCollectSessionsOptions::default()
        .with_orphan_timeout(Duration::from_millis(0))
        .with_now(now_millis() + 1);
    let page = node.garbage_collect_sessions(&options, None).unwrap();
    assert_eq!(page.report.offloads_rolled_back, 1);
    assert_eq!(node.acquire_session(&id, exclusive()).unwrap(), None);
}

#[tokio::test]
async fn test_offload_selection_keeps_priority_duplicates() {
    let cluster = cluster();
    let milan = cluster.node("milan").unwrap();
    let near_turin = milan
        .create_session(&CreateSessionOptions::default().with_client_geo_coordinates(TURIN))
        .unwrap();
    let near_rome = milan
        .create_session(&CreateSessionOptions::default().with_client_geo_coordinates(ROME))
        .unwrap();
    milan
        .update_session_resources_usage(&near_rome, &ResourcesUsage::new().with("cpu", 2.0))
        .unwrap();
    let turin = cluster.node("turin").unwrap();
    let busy = turin.create_session(&CreateSessionOptions::default()).unwrap();
    turin
        .update_session_resources_usage(&busy, &ResourcesUsage::new().with("cpu", 3.0))
        .unwrap();
    cluster.propagate_usage().await.unwrap();

    // turin runs at 3/4, north's subtree at 5/16
    assert_eq!(milan.subtree_usage("turin").unwrap().load_ratio(), 0.75);
    assert_eq!(milan.subtree_usage("north").unwrap().load_ratio(), 0.3125);

    let options = BestOffloadTargetsOptions::default()
        .with_criteria(vec![OffloadCriterion::ClosestToClient, OffloadCriterion::LeastLoaded]);
    let sessions = milan.best_sessions_to_offload(Some(&options)).unwrap();
    assert_eq!(sessions.len(), 2);
    // larger, and its client is farther from Milan
    assert_eq!(sessions[0].session_id, near_rome);

    let pairs = milan.best_offload_target_nodes(&sessions, Some(&options)).unwrap();
    assert_eq!(
        pairs,
        vec![
            (near_rome.clone(), "north".to_string()),
            (near_rome, "north".to_string()),
            (near_turin.clone(), "turin".to_string()),
            (near_turin, "north".to_string()),
        ]
    );

    // A threshold below turin's load leaves north as the only target
    let strict = options.with_load_threshold(0.5);
    let pairs = milan.best_offload_target_nodes(&sessions, Some(&strict)).unwrap();
    assert!(pairs.iter().all(|(_, node)| node == "north"));
    assert_eq!(pairs.len(), 4);
}

#[tokio::test]
async fn test_released_session_is_offloaded_by_the_next_round() {
    let cluster = cluster();
    let milan = cluster.node("milan").unwrap();
    let id = milan.create_session(&CreateSessionOptions::default()).unwrap();
    assert_eq!(milan.acquire_session(&id, exclusive()).unwrap(), None);
    let err = milan
        .offload_session(&id, OffloadSessionOptions::default(), CancellationToken::new())
        .err()
        .unwrap();
    assert!(matches!(err, Error::UnableToOffloadAcquiredSession(_)));

    // every node runs below its shedding threshold, and the session is still held
    let round = cluster.offload_round().await.unwrap();
    assert_eq!(round.moved, 0);
    let record = milan.store().get_session_record(&id).unwrap().unwrap();
    assert_eq!(record.state, SessionState::Active);

    assert!(milan.release_session(&id, exclusive()).unwrap().offload_unblocked);
    let round = cluster.offload_round().await.unwrap();
    assert_eq!(round.moved, 1);
    assert_eq!(round.failed, 0);

    // nothing is loaded, so the least loaded tie between north and turin goes to north
    let record = milan.store().get_session_record(&id).unwrap().unwrap();
    assert_eq!(record.state, SessionState::Offloaded);
    let location = SessionLocation::new("north", id.as_str());
    assert_eq!(record.location, Some(location.clone()));
    assert_eq!(milan.acquire_session(&id, exclusive()).unwrap(), Some(location));
    let north = cluster.node("north").unwrap();
    assert_eq!(north.acquire_session(&id, exclusive()).unwrap(), None);
    assert!(milan.take_unblocked_offloads().is_empty());
}
