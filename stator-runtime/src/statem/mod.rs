//! Entity state machines
//!
//! A [`StateMachine`] is the actor owning one [`PatchEntity`]. Producers put
//! messages into its bounded mailbox with [`StateMachine::on_message`]; the
//! producer whose put flips the machine from detached to attached spawns
//! [`StateMachine::handle_loop`], which drains the mailbox one message at a
//! time and detaches again once the mailbox stays empty.
//!
//! Attachment is the only thing deciding who runs the loop, so at most one
//! loop drives a machine at any time. The core sits behind an async mutex
//! that the loop holds for its whole run; a loop spawned while the previous
//! one is finishing its final flush waits there instead of racing it.

mod mailbox;

pub use mailbox::Mailbox;

use crate::config::RuntimeConfig;
use crate::constraint::SchemeIndex;
use crate::entity::{touches_scheme, PatchEntity};
use crate::error::{Result, RuntimeError};
use crate::propagation::Propagator;
use crate::repository::Repository;
use async_trait::async_trait;
use stator_types::{EntityId, Event, PatchData};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, warn};

const DETACHED: u8 = 0;
const ATTACHED: u8 = 1;

/// Reply channel for one event; carries the entity state on success
pub type Promise = oneshot::Sender<Result<Vec<u8>>>;

#[derive(Debug)]
pub enum Message {
    Event {
        event: Event,
        promise: Option<Promise>,
    },
    /// Rebuild environment-derived state (the scheme index)
    ReloadEnv,
    /// Persist the entity if it has unflushed changes
    Flush,
}

impl Message {
    pub fn event(event: Event) -> Self {
        Message::Event {
            event,
            promise: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MachineStatus {
    Active = 0,
    Inactive = 1,
    /// Terminal
    Deleted = 2,
}

impl MachineStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MachineStatus::Active,
            1 => MachineStatus::Inactive,
            _ => MachineStatus::Deleted,
        }
    }
}

/// State owned by the processing loop
#[derive(Debug)]
pub struct MachineCore {
    entity: PatchEntity,
    index: Arc<SchemeIndex>,
    dirty: bool,
    flush_countdown: u32,
}

impl MachineCore {
    fn new(entity: PatchEntity, flush_period: u32) -> Self {
        let index = SchemeIndex::build(entity.scheme());
        Self {
            entity,
            index,
            dirty: false,
            flush_countdown: flush_period,
        }
    }

    pub fn entity(&self) -> &PatchEntity {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut PatchEntity {
        &mut self.entity
    }

    pub fn index(&self) -> &Arc<SchemeIndex> {
        &self.index
    }

    fn reload_index(&mut self) {
        self.index = SchemeIndex::build(self.entity.scheme());
    }
}

/// What a handler did with one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Handled {
    /// Committed field-level changes
    pub changes: Vec<PatchData>,
    /// The entity must be persisted even without changes
    pub dirty: bool,
    /// The entity was deleted
    pub deleted: bool,
}

/// Applies one event to a machine's core
#[async_trait]
pub trait MessageHandler: Send + Sync + fmt::Debug {
    async fn handle(&self, core: &mut MachineCore, event: &Event) -> Result<Handled>;
}

/// Collaborators shared by every machine of a node
#[derive(Debug, Clone)]
pub struct MachineEnv {
    pub config: RuntimeConfig,
    pub repository: Arc<dyn Repository>,
    pub handler: Arc<dyn MessageHandler>,
    pub propagator: Propagator,
    pub shutdown: watch::Receiver<bool>,
}

pub struct StateMachine {
    id: EntityId,
    status: AtomicU8,
    attached: AtomicU8,
    mailbox: Mailbox<Message>,
    core: Mutex<MachineCore>,
    env: Arc<MachineEnv>,
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("attached", &self.is_attached())
            .field("mailbox", &self.mailbox.len())
            .finish()
    }
}

impl StateMachine {
    pub fn new(entity: PatchEntity, env: Arc<MachineEnv>) -> Arc<Self> {
        Arc::new(Self {
            id: entity.id().clone(),
            status: AtomicU8::new(MachineStatus::Active as u8),
            attached: AtomicU8::new(DETACHED),
            mailbox: Mailbox::new(env.config.mailbox_capacity),
            core: Mutex::new(MachineCore::new(entity, env.config.flush_period)),
            env,
        })
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn status(&self) -> MachineStatus {
        MachineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire) == ATTACHED
    }

    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }

    /// Mark the machine inactive; a deleted machine stays deleted
    pub fn deactivate(&self) {
        let _ = self.status.compare_exchange(
            MachineStatus::Active as u8,
            MachineStatus::Inactive as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Enqueue `msg`.
    ///
    /// Returns `true` when this call moved the machine from detached to
    /// attached, in which case the caller must run [`Self::handle_loop`].
    pub fn on_message(&self, msg: Message) -> Result<bool> {
        match self.status() {
            MachineStatus::Active => {}
            MachineStatus::Deleted => return Err(RuntimeError::Deleted(self.id.clone())),
            MachineStatus::Inactive => return Err(RuntimeError::Inactive(self.id.clone())),
        }
        self.enqueue(msg)?;
        Ok(self.try_attach())
    }

    /// Put `msg` into the mailbox, spinning a bounded number of times while
    /// it is full. The spin never parks the worker thread.
    fn enqueue(&self, mut msg: Message) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.mailbox.put(msg) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    attempts += 1;
                    if attempts > self.env.config.put_retries {
                        warn!(entity_id = %self.id, attempts, "mailbox full");
                        return Err(RuntimeError::Backpressure(self.id.clone()));
                    }
                    msg = rejected;
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn try_attach(&self) -> bool {
        self.attached
            .compare_exchange(DETACHED, ATTACHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enqueue `msg` and spawn the loop if the machine was detached
    pub fn deliver(self: &Arc<Self>, msg: Message) -> Result<()> {
        if self.on_message(msg)? {
            debug!(entity_id = %self.id, "machine attached");
            tokio::spawn(Arc::clone(self).handle_loop());
        }
        Ok(())
    }

    /// Deliver `event` and return the receiver of its reply
    pub fn invoke(self: &Arc<Self>, event: Event) -> Result<oneshot::Receiver<Result<Vec<u8>>>> {
        let (tx, rx) = oneshot::channel();
        self.deliver(Message::Event {
            event,
            promise: Some(tx),
        })?;
        Ok(rx)
    }

    /// Stop accepting messages, apply the ones already queued and persist
    /// the entity. A running loop is allowed to finish first.
    pub async fn release(&self) -> Result<()> {
        self.deactivate();
        let mut core = self.core.lock().await;
        while let Some(msg) = self.mailbox.get() {
            self.process(&mut core, msg).await;
        }
        self.persist(&mut core).await
    }

    /// Process messages until the mailbox stays empty
    pub async fn handle_loop(self: Arc<Self>) {
        let mut core = self.core.lock().await;
        let flush_period = self.env.config.flush_period;

        loop {
            let stopping = *self.env.shutdown.borrow();
            if stopping {
                self.cancel_pending();
                self.flush(&mut core).await;
                self.attached.store(DETACHED, Ordering::Release);
                debug!(entity_id = %self.id, "machine stopped");
                return;
            }

            if core.flush_countdown == 0 {
                self.flush(&mut core).await;
                core.flush_countdown = flush_period;
            }

            let Some(msg) = self.next_message().await else {
                if self
                    .attached
                    .compare_exchange(ATTACHED, DETACHED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    error!(entity_id = %self.id, "detaching a machine that is not attached");
                }
                self.flush(&mut core).await;

                // A put may have landed between the last poll and the detach.
                if self.mailbox.is_empty() || !self.try_attach() {
                    debug!(entity_id = %self.id, "machine detached");
                    return;
                }
                continue;
            };

            self.process(&mut core, msg).await;
            core.flush_countdown = core.flush_countdown.saturating_sub(1);
        }
    }

    async fn next_message(&self) -> Option<Message> {
        for _ in 0..=self.env.config.ensure_consume_times {
            if let Some(msg) = self.mailbox.get() {
                return Some(msg);
            }
            tokio::task::yield_now().await;
        }
        None
    }

    fn cancel_pending(&self) {
        while let Some(msg) = self.mailbox.get() {
            if let Message::Event {
                promise: Some(promise),
                ..
            } = msg
            {
                let _ = promise.send(Err(RuntimeError::Cancelled));
            }
        }
    }

    async fn process(&self, core: &mut MachineCore, msg: Message) {
        match msg {
            Message::Flush => self.flush(core).await,
            Message::ReloadEnv => {
                core.reload_index();
                debug!(entity_id = %self.id, "environment reloaded");
            }
            Message::Event { event, promise } => {
                let result = self.apply(core, &event).await;
                if let Err(err) = &result {
                    error!(entity_id = %self.id, event_id = %event.id, code = err.code(), error = %err, "handle event");
                }
                if let Some(promise) = promise {
                    // The waiter may have given up already.
                    let _ = promise.send(result);
                }
            }
        }
    }

    async fn apply(&self, core: &mut MachineCore, event: &Event) -> Result<Vec<u8>> {
        if self.status() == MachineStatus::Deleted {
            return Err(RuntimeError::Deleted(self.id.clone()));
        }

        let handled = self.env.handler.handle(core, event).await?;
        if handled.dirty || !handled.changes.is_empty() {
            core.dirty = true;
        }
        if touches_scheme(&handled.changes) {
            core.reload_index();
        }

        if handled.deleted {
            self.status
                .store(MachineStatus::Deleted as u8, Ordering::Release);
            core.dirty = true;
            self.flush(core).await;
            debug!(entity_id = %self.id, "entity deleted");
            return Ok(core.entity.raw());
        }

        self.env
            .propagator
            .propagate(&core.entity, event.propagation_depth(), &handled.changes)
            .await;
        Ok(core.entity.raw())
    }

    async fn flush(&self, core: &mut MachineCore) {
        if let Err(err) = self.persist(core).await {
            error!(entity_id = %self.id, code = err.code(), error = %err, "flush entity");
        }
    }

    /// Write unflushed changes to the repository. On failure the entity
    /// stays dirty and the next flush tries again.
    async fn persist(&self, core: &mut MachineCore) -> Result<()> {
        if !core.dirty {
            return Ok(());
        }

        let result = if self.status() == MachineStatus::Deleted {
            self.env.repository.del_entity(&self.id).await
        } else {
            self.env
                .repository
                .put_entity(&self.id, core.entity.raw())
                .await
        };
        result.map_err(|err| RuntimeError::TransientIo(err.to_string()))?;

        core.dirty = false;
        debug!(entity_id = %self.id, version = core.entity.version(), "entity flushed");
        Ok(())
    }
}
