//! Node: routing inbound events to entity machines
//!
//! A node owns the placement table, one container per locally owned queue,
//! the tentacle graph and the shared machine environment. Every inbound
//! event is routed by hashing its entity id onto a queue; events for queues
//! owned elsewhere are refused with [`RuntimeError::NotOwner`].

use crate::config::RuntimeConfig;
use crate::container::Container;
use crate::dispatch::Dispatcher;
use crate::entity::{Clock, PatchEntity, SystemClock};
use crate::error::{Result, RuntimeError};
use crate::handler::EntityHandler;
use crate::placement::{self, Placement, QueueInfo};
use crate::propagation::Propagator;
use crate::repository::{MapperEvent, Repository};
use crate::statem::{MachineEnv, MachineStatus, Message, StateMachine};
use crate::subscription::Publisher;
use parking_lot::{Mutex, RwLock};
use stator_mapper::{MapperCompiler, MapperRecord, ProjectionCompiler, TentacleGraph};
use stator_types::{meta, EntityId, EntityRecord, EnvelopeError, Event, EventType, ResponseStatus, SystemOp};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External collaborators of a node
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn Repository>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub publisher: Arc<dyn Publisher>,
    pub compiler: Arc<dyn MapperCompiler>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Projection compiler and wall clock
    pub fn new(
        repository: Arc<dyn Repository>,
        dispatcher: Arc<dyn Dispatcher>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            publisher,
            compiler: Arc::new(ProjectionCompiler::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn MapperCompiler>) -> Self {
        self.compiler = compiler;
        self
    }
}

/// Entities affected by a rebalance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    pub released: Vec<EntityId>,
    pub retained: Vec<EntityId>,
}

/// An event sitting in its machine's mailbox, or the reason it never got
/// there
#[derive(Debug)]
pub struct Delivery {
    request_id: Option<String>,
    callback: String,
    state: Result<Inflight>,
}

impl Delivery {
    /// Why the event was not enqueued
    pub fn error(&self) -> Option<&RuntimeError> {
        self.state.as_ref().err()
    }
}

#[derive(Debug)]
struct Inflight {
    id: EntityId,
    container: Arc<Container>,
    machine: Arc<StateMachine>,
    fresh: bool,
    reply: oneshot::Receiver<Result<Vec<u8>>>,
}

#[derive(Debug)]
pub struct Node {
    config: RuntimeConfig,
    collab: Collaborators,
    placement: Placement,
    containers: RwLock<HashMap<String, Arc<Container>>>,
    graph: Arc<TentacleGraph>,
    env: Arc<MachineEnv>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: RuntimeConfig, collab: Collaborators) -> Self {
        let graph = Arc::new(TentacleGraph::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let env = Arc::new(MachineEnv {
            config: config.clone(),
            repository: collab.repository.clone(),
            handler: Arc::new(EntityHandler::new(collab.publisher.clone())),
            propagator: Propagator::new(
                graph.clone(),
                collab.dispatcher.clone(),
                config.max_propagation_depth,
            ),
            shutdown: shutdown_rx,
        });
        let placement = Placement::new(placement::uniform(
            &config.queue_prefix,
            config.queue_count,
            &config.node_name,
        ));

        Self {
            config,
            collab,
            placement,
            containers: RwLock::new(HashMap::new()),
            graph,
            env,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn graph(&self) -> &Arc<TentacleGraph> {
        &self.graph
    }

    pub fn container(&self, queue_id: &str) -> Option<Arc<Container>> {
        self.containers.read().get(queue_id).cloned()
    }

    /// Registered machine of `id`, if this node hosts it
    pub fn machine(&self, id: &EntityId) -> Option<Arc<StateMachine>> {
        let queue = self.placement.select(id)?;
        self.container(&queue.id)?.load(id).ok()
    }

    fn select_container(&self, queue_id: &str) -> Arc<Container> {
        if let Some(container) = self.containers.read().get(queue_id) {
            return container.clone();
        }
        self.containers
            .write()
            .entry(queue_id.to_string())
            .or_insert_with(|| {
                debug!(queue = %queue_id, "container created");
                Arc::new(Container::new(queue_id))
            })
            .clone()
    }

    /// Route `ev` to its entity and wait for the result.
    ///
    /// On success the entity state is returned. When the event carries a
    /// request id, a callback event with the outcome is dispatched to the
    /// event's callback address as well.
    pub async fn handle_event(&self, ev: Event) -> Result<Vec<u8>> {
        let delivery = self.submit(ev).await;
        self.complete(delivery).await
    }

    /// Route `ev` and put it into its machine's mailbox without waiting for
    /// the machine to apply it.
    ///
    /// Events submitted one after another for the same entity are applied in
    /// submission order, whenever their deliveries are completed.
    pub async fn submit(&self, ev: Event) -> Delivery {
        Delivery {
            request_id: ev.request_id().map(str::to_string),
            callback: ev.callback.clone(),
            state: self.enqueue(ev).await,
        }
    }

    /// Wait for the machine's reply to a submitted event and answer the
    /// request it carries, if any
    pub async fn complete(&self, delivery: Delivery) -> Result<Vec<u8>> {
        let Delivery {
            request_id,
            callback,
            state,
        } = delivery;

        let result = match state {
            Ok(inflight) => self.settle(inflight).await,
            Err(err) => Err(err),
        };
        if let Some(request_id) = request_id {
            self.respond(&request_id, &callback, &result).await;
        }
        result
    }

    async fn enqueue(&self, ev: Event) -> Result<Inflight> {
        let id = ev
            .entity()
            .ok_or(EnvelopeError::MissingField(meta::ENTITY_ID))?;
        match ev.event_type()? {
            EventType::Entity | EventType::System => {}
            other => {
                return Err(RuntimeError::Validation(format!(
                    "event type {} cannot be routed to an entity",
                    other.as_str()
                )))
            }
        }
        ev.path_constructor()?;

        let queue = self
            .placement
            .select(&id)
            .ok_or_else(|| RuntimeError::Internal("placement table is empty".into()))?;
        if queue.node_name != self.config.node_name {
            return Err(RuntimeError::NotOwner {
                queue: queue.id,
                owner: queue.node_name,
            });
        }

        let container = self.select_container(&queue.id);
        let (machine, fresh) = match container.load(&id) {
            Ok(machine) => (machine, false),
            Err(RuntimeError::EntityNotFound(_)) => {
                let machine = match container.pending(&id) {
                    Some(machine) => machine,
                    None => {
                        let made = self.make_machine(&id, &ev).await?;
                        container.insert_pending(made)
                    }
                };
                (machine, true)
            }
            Err(err) => return Err(err),
        };

        match machine.invoke(ev) {
            Ok(reply) => Ok(Inflight {
                id,
                container,
                machine,
                fresh,
                reply,
            }),
            Err(err) => {
                // A full mailbox still holds earlier first deliveries.
                if fresh && !matches!(err, RuntimeError::Backpressure(_)) {
                    container.abandon(&machine);
                }
                if machine.status() == MachineStatus::Deleted {
                    container.remove(&id);
                }
                Err(err)
            }
        }
    }

    async fn settle(&self, inflight: Inflight) -> Result<Vec<u8>> {
        let Inflight {
            id,
            container,
            machine,
            fresh,
            reply,
        } = inflight;

        let result = reply.await.unwrap_or(Err(RuntimeError::Cancelled));
        if fresh {
            match &result {
                Ok(_) => container.promote(&machine),
                Err(_) => container.abandon(&machine),
            }
        }
        if machine.status() == MachineStatus::Deleted {
            container.remove(&id);
            debug!(entity_id = %id, queue = %container.id(), "machine evicted");
        }
        result
    }

    async fn make_machine(&self, id: &EntityId, ev: &Event) -> Result<Arc<StateMachine>> {
        let clock = self.collab.clock.clone();
        let entity = match self.collab.repository.get_entity(id).await? {
            Some(raw) => {
                debug!(entity_id = %id, "restore entity snapshot");
                PatchEntity::from_raw(id, &raw, clock)?
            }
            None => {
                let op = ev.system_data().map(|sys| sys.op()).transpose()?;
                if op == Some(SystemOp::Create) {
                    PatchEntity::from_record(EntityRecord::from_event(ev)?, clock)
                } else if !ev.patches().is_empty() {
                    PatchEntity::from_record(EntityRecord::new(id.clone()), clock)
                } else {
                    return Err(RuntimeError::EntityNotFound(id.clone()));
                }
            }
        };

        debug!(entity_id = %id, "make machine");
        Ok(StateMachine::new(
            entity.with_policy(self.config.default_path_policy),
            self.env.clone(),
        ))
    }

    async fn respond(&self, request_id: &str, callback: &str, result: &Result<Vec<u8>>) {
        let ev = match result {
            Ok(state) => Event::response_event(request_id, ResponseStatus::Ok, "", state.clone()),
            Err(err) => Event::response_event(
                request_id,
                ResponseStatus::Error,
                err.code(),
                err.to_string().into_bytes(),
            ),
        }
        .with_callback(callback);

        if let Err(err) = self.collab.dispatcher.dispatch(ev).await {
            error!(request_id = %request_id, error = %err, "dispatch response");
        }
    }

    /// Load every mapper stored in the repository and follow later changes
    /// until shutdown
    pub async fn initialize_metadata(&self) -> Result<()> {
        let repository = &self.collab.repository;
        let revision = repository.last_revision().await?;
        let records = repository.range_mappers(revision).await?;
        info!(revision, mappers = records.len(), "load mappers");
        for record in &records {
            install_mapper(&self.graph, self.collab.compiler.as_ref(), record);
        }

        let mut events = repository.watch_mappers(revision).await?;
        let graph = self.graph.clone();
        let compiler = self.collab.compiler.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(MapperEvent::Put(record)) => {
                            install_mapper(&graph, compiler.as_ref(), &record);
                        }
                        Some(MapperEvent::Delete(record)) => {
                            if graph.unregister(&record.id) {
                                info!(mapper_id = %record.id, "mapper removed");
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("mapper watch stopped");
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Swap the placement table and re-home the machines it moves.
    ///
    /// Moved machines apply what is already in their mailbox and persist
    /// before the new table takes effect, so the next owner restores their
    /// latest state. Events reaching a moved machine meanwhile are refused
    /// with [`RuntimeError::Inactive`].
    pub async fn rebalance(&self, queues: Vec<QueueInfo>) -> RebalanceReport {
        let next = Placement::new(queues);
        let node_name = &self.config.node_name;

        let mut report = RebalanceReport::default();
        let mut moved = Vec::new();
        let containers: Vec<Arc<Container>> = self.containers.read().values().cloned().collect();
        for container in &containers {
            let local = next.is_local(container.id(), node_name);
            for machine in container.machines() {
                let stays = local
                    && next
                        .select(machine.id())
                        .is_some_and(|queue| queue.id == container.id());
                if stays {
                    if let Err(err) = machine.deliver(Message::ReloadEnv) {
                        warn!(entity_id = %machine.id(), error = %err, "reload environment");
                    }
                    report.retained.push(machine.id().clone());
                } else {
                    if let Err(err) = machine.release().await {
                        error!(entity_id = %machine.id(), code = err.code(), error = %err, "release machine");
                    }
                    report.released.push(machine.id().clone());
                    moved.push((container.clone(), machine));
                }
            }
        }

        self.placement.replace(next.queues());
        for (container, machine) in moved {
            container.remove(machine.id());
        }
        for container in &containers {
            if !self.placement.is_local(container.id(), node_name) {
                self.containers.write().remove(container.id());
            }
        }

        report.released.sort();
        report.retained.sort();
        info!(
            released = report.released.len(),
            retained = report.retained.len(),
            "rebalance complete"
        );
        report
    }

    /// Stop background tasks and tell every running loop to flush and exit
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task failed");
            }
        }
        info!(node = %self.config.node_name, "node stopped");
    }
}

fn install_mapper(graph: &TentacleGraph, compiler: &dyn MapperCompiler, record: &MapperRecord) {
    match compiler.compile(record) {
        Ok(mapper) => {
            graph.register(mapper);
            info!(mapper_id = %record.id, entity_id = %record.entity_id, "mapper installed");
        }
        Err(err) => {
            warn!(mapper_id = %record.id, error = %err, "mapper not installed");
        }
    }
}
