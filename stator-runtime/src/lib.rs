//! Stator runtime - entity actors over a message bus
//!
//! Every managed entity lives in its own single-writer state machine. The
//! runtime routes inbound events to those machines, applies their patch
//! batches, persists state, and feeds committed changes to the reactive
//! mapper graph.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                           Node                             │
//! │   Placement: entity id ──hash──▶ queue ──▶ owning node      │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐                        │
//! │  │ Container q0 │  │ Container q1 │  ...                   │
//! │  │ ┌──────────┐ │  │ ┌──────────┐ │                        │
//! │  │ │ Machine  │ │  │ │ Machine  │ │                        │
//! │  │ │ mailbox  │ │  │ │ mailbox  │ │                        │
//! │  │ │ entity   │ │  │ │ entity   │ │                        │
//! │  │ └────┬─────┘ │  │ └────┬─────┘ │                        │
//! │  └──────┼───────┘  └──────┼───────┘                        │
//! │         ▼                 ▼                                │
//! │   TentacleGraph ──▶ Propagator ──▶ Dispatcher              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Entities
//! A [`PatchEntity`] holds a JSON state tree with reserved fields (`id`,
//! `type`, `owner`, `source`, `version`, `last_time`, `scheme`,
//! `properties`) and applies ordered patch batches atomically.
//!
//! ## Machines
//! A [`StateMachine`] serialises all work on one entity. It attaches when a
//! message arrives, drains its mailbox on one task, flushes periodically and
//! detaches when idle.
//!
//! ## Propagation
//! Committed changes activate the mappers watching them; their outputs are
//! dispatched as new patch events, bounded by a propagation depth.
//!
//! ## Collaborators
//! Storage, transport and pub/sub sit behind the [`Repository`],
//! [`Dispatcher`] and [`Publisher`] traits, with in-memory implementations
//! for tests and single-process use.

pub mod config;
pub mod constraint;
pub mod container;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod handler;
pub mod node;
pub mod placement;
pub mod propagation;
pub mod repository;
pub mod statem;
pub mod subscription;

pub use config::RuntimeConfig;
pub use constraint::{ConstraintNode, NodeKind, SchemeConfig, SchemeIndex};
pub use container::Container;
pub use dispatch::{ChannelDispatcher, DispatchError, Dispatcher};
pub use entity::{
    Clock, DefaultPathPolicy, ManualClock, PatchEntity, PatchError, PatchOutcome, SystemClock,
};
pub use error::{Result, RuntimeError};
pub use handler::EntityHandler;
pub use node::{Collaborators, Delivery, Node, RebalanceReport};
pub use placement::{Placement, QueueInfo};
pub use propagation::Propagator;
pub use repository::{MapperEvent, MapperFilter, MemoryRepository, Repository, RepositoryError};
pub use statem::{Handled, MachineCore, MachineStatus, Message, MessageHandler, StateMachine};
pub use subscription::{MemoryPublisher, PublishError, Publisher};
