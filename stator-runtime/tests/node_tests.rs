//! Integration tests for event routing through a node.
//!
//! Each test wires a node to in-memory collaborators. Events the node
//! dispatches (responses and mapper outputs) land on a channel the test
//! drains, and mapper outputs are fed back into the node by hand.

use serde_json::{json, Value};
use stator_mapper::MapperRecord;
use stator_runtime::*;
use stator_types::{meta, EntityId, Event, EventType, PatchData, ResponseStatus, SystemOp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    node: Arc<Node>,
    bus: UnboundedReceiver<Event>,
    repository: Arc<MemoryRepository>,
    publisher: Arc<MemoryPublisher>,
}

fn harness(config: RuntimeConfig) -> Harness {
    let repository = Arc::new(MemoryRepository::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let (dispatcher, bus) = ChannelDispatcher::new();
    let collab = Collaborators::new(repository.clone(), Arc::new(dispatcher), publisher.clone())
        .with_clock(Arc::new(ManualClock::new(1_000)));
    Harness {
        node: Arc::new(Node::new(config, collab)),
        bus,
        repository,
        publisher,
    }
}

fn state(raw: &[u8]) -> Value {
    serde_json::from_slice(raw).unwrap()
}

fn create(id: &str, data: Value) -> Event {
    Event::system_event(&EntityId::new(id), SystemOp::Create, Some(data))
}

fn patch(id: &str, patches: Vec<PatchData>) -> Event {
    Event::patch_event(&EntityId::new(id), patches)
}

fn read(id: &str) -> Event {
    Event::patch_event(&EntityId::new(id), vec![])
}

/// Feed every event waiting on the bus back into the node
async fn pump(h: &mut Harness) -> usize {
    let mut pumped = 0;
    while let Ok(ev) = h.bus.try_recv() {
        pumped += 1;
        h.node.handle_event(ev).await.unwrap();
    }
    pumped
}

#[tokio::test]
async fn test_create_read_delete() {
    let h = harness(RuntimeConfig::default());

    let created = h
        .node
        .handle_event(create("dev-1", json!({"type": "device", "owner": "admin", "properties": {"temp": 20}})))
        .await
        .unwrap();
    assert_eq!(state(&created)["type"], json!("device"));
    assert_eq!(state(&created)["version"], json!(0));

    let raw = h.node.handle_event(read("dev-1")).await.unwrap();
    assert_eq!(state(&raw)["properties"]["temp"], json!(20));
    assert_eq!(state(&raw)["version"], json!(0));

    h.node
        .handle_event(Event::system_event(&EntityId::new("dev-1"), SystemOp::Delete, None))
        .await
        .unwrap();
    assert!(h.node.machine(&EntityId::new("dev-1")).is_none());
    assert_eq!(h.repository.entity_count(), 0);

    let err = h.node.handle_event(read("dev-1")).await.unwrap_err();
    assert!(matches!(err, RuntimeError::EntityNotFound(_)));
}

#[tokio::test]
async fn test_first_patch_creates_entity() {
    let h = harness(RuntimeConfig::default());
    let raw = h
        .node
        .handle_event(patch("dev-2", vec![PatchData::replace("properties.temp", json!(7))]))
        .await
        .unwrap();

    let st = state(&raw);
    assert_eq!(st["properties"]["temp"], json!(7));
    assert_eq!(st["version"], json!(1));
    assert_eq!(st["last_time"], json!(1_000));
}

#[tokio::test]
async fn test_unknown_entity_read_is_not_found() {
    let h = harness(RuntimeConfig::default());
    let err = h.node.handle_event(read("ghost")).await.unwrap_err();
    assert!(matches!(err, RuntimeError::EntityNotFound(_)));
    assert!(h.node.machine(&EntityId::new("ghost")).is_none());
}

#[tokio::test]
async fn test_failed_first_patch_does_not_register() {
    let h = harness(RuntimeConfig::default());
    let err = h
        .node
        .handle_event(patch("dev-3", vec![PatchData::replace("properties.a.b", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Patch(PatchError::MissingPath(_))));
    assert!(h.node.machine(&EntityId::new("dev-3")).is_none());
}

#[tokio::test]
async fn test_messages_apply_in_delivery_order() {
    let h = harness(RuntimeConfig::default());
    h.node
        .handle_event(create("dev-4", json!({"type": "device"})))
        .await
        .unwrap();

    let machine = h.node.machine(&EntityId::new("dev-4")).unwrap();
    for n in 1..=10 {
        machine
            .deliver(Message::event(patch(
                "dev-4",
                vec![
                    PatchData::replace("properties.last", json!(n)),
                    PatchData::add("properties.seen", json!(n)),
                ],
            )))
            .unwrap();
    }

    let st = state(&h.node.handle_event(read("dev-4")).await.unwrap());
    assert_eq!(st["properties"]["last"], json!(10));
    assert_eq!(st["properties"]["seen"], json!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
    assert_eq!(st["version"], json!(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_their_order() {
    let h = harness(RuntimeConfig {
        mailbox_capacity: 1_000,
        ..RuntimeConfig::default()
    });
    h.node
        .handle_event(create("dev-9", json!({"type": "device"})))
        .await
        .unwrap();

    let mut producers = Vec::new();
    for p in 0..4 {
        let node = h.node.clone();
        producers.push(tokio::spawn(async move {
            let mut deliveries = Vec::new();
            for n in 0..50 {
                let ev = patch("dev-9", vec![PatchData::add(format!("properties.s{}", p), json!(n))]);
                deliveries.push(node.submit(ev).await);
            }
            for delivery in deliveries {
                node.complete(delivery).await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let st = state(&h.node.handle_event(read("dev-9")).await.unwrap());
    let expected: Vec<Value> = (0..50).map(|n| json!(n)).collect();
    for p in 0..4 {
        assert_eq!(st["properties"][format!("s{}", p)], json!(expected));
    }
    assert_eq!(st["version"], json!(200));
}

#[tokio::test]
async fn test_concurrent_first_deliveries_share_one_machine() {
    let h = harness(RuntimeConfig::default());

    let mut handles = Vec::new();
    for n in 0..10 {
        let node = h.node.clone();
        handles.push(tokio::spawn(async move {
            node.handle_event(patch(
                "dev-5",
                vec![PatchData::replace(format!("properties.k{}", n), json!(n))],
            ))
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let st = state(&h.node.handle_event(read("dev-5")).await.unwrap());
    assert_eq!(st["version"], json!(10));
    assert_eq!(st["properties"].as_object().unwrap().len(), 10);
}

#[tokio::test]
async fn test_request_id_produces_callback_event() {
    let mut h = harness(RuntimeConfig::default());
    let ev = create("dev-6", json!({"type": "device"}))
        .with_attr(meta::REQUEST_ID, "req-1")
        .with_callback("manager");
    h.node.handle_event(ev).await.unwrap();

    let response = h.bus.recv().await.unwrap();
    assert_eq!(response.event_type().unwrap(), EventType::Callback);
    assert_eq!(response.callback, "manager");
    assert_eq!(response.attr(meta::REQUEST_ID), Some("req-1"));
    assert_eq!(response.attr(meta::RESPONSE_STATUS), Some(ResponseStatus::Ok.as_str()));

    let ev = read("ghost").with_attr(meta::REQUEST_ID, "req-2");
    assert!(h.node.handle_event(ev).await.is_err());
    let response = h.bus.recv().await.unwrap();
    assert_eq!(response.attr(meta::RESPONSE_STATUS), Some(ResponseStatus::Error.as_str()));
    assert_eq!(response.attr(meta::RESPONSE_ERR_CODE), Some("entity_not_found"));
}

#[tokio::test]
async fn test_scheme_mode_from_metadata() {
    let h = harness(RuntimeConfig::default());
    let ev = patch("dev-7", vec![PatchData::replace("properties.a.b", json!(1))])
        .with_attr(meta::PATH_CONSTRUCTOR, "scheme");
    let st = state(&h.node.handle_event(ev).await.unwrap());
    assert_eq!(st["properties"]["a"]["b"], json!(1));
    assert_eq!(st["scheme"]["a"]["type"], json!("struct"));

    let bad = patch("dev-7", vec![]).with_attr(meta::PATH_CONSTRUCTOR, "bogus");
    let err = h.node.handle_event(bad).await.unwrap_err();
    assert_eq!(err.code(), "validation");
}

#[tokio::test]
async fn test_mapper_propagates_to_target() {
    let mut h = harness(RuntimeConfig::default());
    h.repository
        .put_mapper(MapperRecord::new(
            "m1",
            "admin",
            EntityId::new("agg"),
            "insert into agg select dev1.temp as t1",
        ))
        .await
        .unwrap();
    h.node.initialize_metadata().await.unwrap();

    h.node
        .handle_event(patch("dev1", vec![PatchData::replace("properties.temp", json!(30))]))
        .await
        .unwrap();
    assert_eq!(pump(&mut h).await, 1);

    let st = state(&h.node.handle_event(read("agg")).await.unwrap());
    assert_eq!(st["properties"]["t1"], json!(30));
    h.node.shutdown().await;
}

#[tokio::test]
async fn test_mapper_watch_registers_later_mappers() {
    let h = harness(RuntimeConfig::default());
    h.node.initialize_metadata().await.unwrap();

    h.repository
        .put_mapper(MapperRecord::new(
            "m2",
            "admin",
            EntityId::new("agg"),
            "insert into agg select dev1.temp",
        ))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.node.graph().contains("m2") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.repository.del_mapper("m2").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.node.graph().contains("m2") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.node.shutdown().await;
}

#[tokio::test]
async fn test_propagation_depth_is_bounded() {
    let mut h = harness(RuntimeConfig {
        max_propagation_depth: 3,
        ..RuntimeConfig::default()
    });
    for (id, target, tql) in [
        ("ab", "b", "insert into b select a.x as x"),
        ("ba", "a", "insert into a select b.x as x"),
    ] {
        h.repository
            .put_mapper(MapperRecord::new(id, "admin", EntityId::new(target), tql))
            .await
            .unwrap();
    }
    h.node.initialize_metadata().await.unwrap();

    h.node
        .handle_event(patch("a", vec![PatchData::replace("properties.x", json!(1))]))
        .await
        .unwrap();

    let mut pumped = 0;
    loop {
        let n = pump(&mut h).await;
        if n == 0 {
            break;
        }
        pumped += n;
    }
    assert_eq!(pumped, 3);
    h.node.shutdown().await;
}

#[tokio::test]
async fn test_subscription_publishes_forwarded_changes() {
    let h = harness(RuntimeConfig::default());
    h.node
        .handle_event(create(
            "sub-1",
            json!({"type": "subscription", "owner": "admin",
                   "properties": {"mode": "REALTIME", "topic": "temps", "pubsub_name": "ps"}}),
        ))
        .await
        .unwrap();

    let forwarded = patch("sub-1", vec![PatchData::replace("properties.temp", json!(21))])
        .with_attr(meta::SENDER, "dev-1")
        .with_attr(meta::ENTITY_TYPE, "device");
    let st = state(&h.node.handle_event(forwarded).await.unwrap());
    assert_eq!(st["version"], json!(0));

    let published = h.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "temps");
    let payload: Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(payload["id"], json!("dev-1"));
    assert_eq!(payload["subscribe_id"], json!("sub-1"));
    assert_eq!(payload["properties"], json!({"temp": 21}));
}

#[tokio::test]
async fn test_rebalance_releases_moved_entities() {
    let h = harness(RuntimeConfig {
        node_name: "n1".into(),
        queue_count: 4,
        ..RuntimeConfig::default()
    });
    let ids: Vec<String> = (0..12).map(|n| format!("dev-{}", n)).collect();
    for id in &ids {
        h.node
            .handle_event(patch(id, vec![PatchData::replace("properties.v", json!(1))]))
            .await
            .unwrap();
    }

    let mut queues = placement::uniform("core", 4, "n1");
    queues[0].node_name = "n2".into();
    queues[1].node_name = "n2".into();
    let report = h.node.rebalance(queues).await;
    assert_eq!(report.released.len() + report.retained.len(), ids.len());

    for id in &report.released {
        assert!(h.node.machine(id).is_none());
        let err = h.node.handle_event(read(id.as_str())).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotOwner { .. }));
    }
    for id in &report.retained {
        let st = state(&h.node.handle_event(read(id.as_str())).await.unwrap());
        assert_eq!(st["properties"]["v"], json!(1));
    }
}

#[tokio::test]
async fn test_rebalance_keeps_queued_changes_of_moved_entities() {
    let h = harness(RuntimeConfig {
        node_name: "n1".into(),
        queue_count: 4,
        ..RuntimeConfig::default()
    });
    let ids: Vec<String> = (0..12).map(|n| format!("dev-{}", n)).collect();
    for id in &ids {
        h.node
            .handle_event(patch(id, vec![PatchData::replace("properties.v", json!(0))]))
            .await
            .unwrap();
        let machine = h.node.machine(&EntityId::new(id.as_str())).unwrap();
        for n in 1..=5 {
            machine
                .deliver(Message::event(patch(id, vec![PatchData::add("properties.seen", json!(n))])))
                .unwrap();
        }
    }

    // Same node, fewer queues: most entities hash onto another local queue.
    let report = h.node.rebalance(placement::uniform("core", 3, "n1")).await;
    assert!(!report.released.is_empty());

    for id in &ids {
        let st = state(&h.node.handle_event(read(id.as_str())).await.unwrap());
        assert_eq!(st["properties"]["seen"], json!([1, 2, 3, 4, 5]), "entity {}", id);
        assert_eq!(st["version"], json!(6));
    }
}

#[tokio::test]
async fn test_restore_from_snapshot() {
    let h = harness(RuntimeConfig::default());
    h.repository
        .put_entity(
            &EntityId::new("dev-8"),
            serde_json::to_vec(&json!({"id": "dev-8", "type": "device", "version": 4,
                                       "properties": {"temp": 3}}))
            .unwrap(),
        )
        .await
        .unwrap();

    let st = state(&h.node.handle_event(read("dev-8")).await.unwrap());
    assert_eq!(st["version"], json!(4));
    assert_eq!(st["properties"]["temp"], json!(3));
    assert_eq!(st["scheme"], json!({}));
}
