//! In-process bus
//!
//! Everything the node and the manager dispatch comes back through one
//! channel. Callback events resolve the manager's holder; entity and system
//! events are submitted to the node by the router itself, in bus order, and
//! only the wait for each reply runs on its own task.

use async_trait::async_trait;
use stator_manager::Holder;
use stator_runtime::{Delivery, Node, PublishError, Publisher, RuntimeError};
use stator_types::{Event, EventType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Submissions of one event refused with backpressure before giving up
const RESUBMIT_LIMIT: u32 = 10;
const RESUBMIT_BACKOFF: Duration = Duration::from_millis(2);
const RESUBMIT_BACKOFF_MAX: Duration = Duration::from_millis(100);

pub async fn route(
    mut rx: mpsc::UnboundedReceiver<Event>,
    node: Arc<Node>,
    holder: Arc<Holder>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                match ev.event_type() {
                    Ok(EventType::Callback) => match holder.on_event(&ev) {
                        Ok(true) => {}
                        Ok(false) => debug!(event_id = %ev.id, "callback without waiter"),
                        Err(err) => warn!(event_id = %ev.id, error = %err, "malformed callback"),
                    },
                    Ok(_) => {
                        let event_id = ev.id.clone();
                        let delivery = submit(&node, ev).await;
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(err) = node.complete(delivery).await {
                                report(&event_id, &err);
                            }
                        });
                    }
                    Err(err) => warn!(event_id = %ev.id, error = %err, "drop event"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("bus router stopped");
}

/// Submit `ev`, backing off and trying again while its mailbox is full
async fn submit(node: &Node, ev: Event) -> Delivery {
    let mut backoff = RESUBMIT_BACKOFF;
    for attempt in 1..RESUBMIT_LIMIT {
        let delivery = node.submit(ev.clone()).await;
        if !matches!(delivery.error(), Some(RuntimeError::Backpressure(_))) {
            return delivery;
        }
        debug!(event_id = %ev.id, attempt, "mailbox full, resubmitting");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RESUBMIT_BACKOFF_MAX);
    }
    node.submit(ev).await
}

fn report(event_id: &str, err: &RuntimeError) {
    match err {
        RuntimeError::Backpressure(_)
        | RuntimeError::Inactive(_)
        | RuntimeError::Deleted(_)
        | RuntimeError::NotOwner { .. }
        | RuntimeError::Cancelled
        | RuntimeError::Dispatch(_) => {
            warn!(event_id = %event_id, code = err.code(), error = %err, "event dropped");
        }
        _ => debug!(event_id = %event_id, code = err.code(), error = %err, "event failed"),
    }
}

/// Publisher writing subscription messages to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(
        &self,
        topic: &str,
        pubsub_name: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError> {
        info!(
            topic = %topic,
            pubsub = %pubsub_name,
            content_type = %content_type,
            payload = %String::from_utf8_lossy(&payload),
            "publish"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use stator_runtime::{
        ChannelDispatcher, Collaborators, Dispatcher, MemoryPublisher, MemoryRepository,
        RuntimeConfig,
    };
    use stator_types::{EntityId, PatchData, SystemOp};
    use tokio::task::JoinHandle;

    struct Bus {
        node: Arc<Node>,
        dispatcher: Arc<ChannelDispatcher>,
        shutdown: watch::Sender<bool>,
        router: JoinHandle<()>,
    }

    fn bus(config: RuntimeConfig) -> Bus {
        let (dispatcher, rx) = ChannelDispatcher::new();
        let dispatcher = Arc::new(dispatcher);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let node = Arc::new(Node::new(
            config,
            Collaborators::new(
                Arc::new(MemoryRepository::new()),
                dispatcher.clone(),
                Arc::new(MemoryPublisher::new()),
            ),
        ));
        let holder = Arc::new(Holder::new(Duration::from_secs(5), shutdown_rx.clone()));
        let router = tokio::spawn(route(rx, node.clone(), holder, shutdown_rx));
        Bus {
            node,
            dispatcher,
            shutdown,
            router,
        }
    }

    /// Create `id`, then append 0..count to its `seen` list, all through the bus
    async fn send_sequence(bus: &Bus, id: &str, count: i64) {
        let id = EntityId::new(id);
        bus.dispatcher
            .dispatch(Event::system_event(&id, SystemOp::Create, Some(json!({"type": "device"}))))
            .await
            .unwrap();
        for n in 0..count {
            bus.dispatcher
                .dispatch(Event::patch_event(&id, vec![PatchData::add("properties.seen", json!(n))]))
                .await
                .unwrap();
        }
    }

    /// Poll the entity until `count` values have been applied
    async fn seen(node: &Node, id: &str, count: usize) -> Vec<i64> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let read = Event::patch_event(&EntityId::new(id), vec![]);
                if let Ok(raw) = node.handle_event(read).await {
                    let state: Value = serde_json::from_slice(&raw).unwrap();
                    if let Some(seen) = state["properties"]["seen"].as_array() {
                        if seen.len() >= count {
                            return seen.iter().filter_map(Value::as_i64).collect();
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn stop(bus: Bus) {
        bus.shutdown.send_replace(true);
        bus.node.shutdown().await;
        bus.router.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_route_applies_in_bus_order() {
        let bus = bus(RuntimeConfig {
            mailbox_capacity: 1_000,
            ..RuntimeConfig::default()
        });
        send_sequence(&bus, "dev-1", 200).await;

        let seen = seen(&bus.node, "dev-1", 200).await;
        assert_eq!(seen, (0..200).collect::<Vec<i64>>());
        stop(bus).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_route_resubmits_when_mailbox_is_full() {
        let bus = bus(RuntimeConfig::default());
        send_sequence(&bus, "dev-2", 200).await;

        let seen = seen(&bus.node, "dev-2", 200).await;
        assert_eq!(seen, (0..200).collect::<Vec<i64>>());
        stop(bus).await;
    }
}
