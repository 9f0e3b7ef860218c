//! Dispatcher collaborator
//!
//! A dispatcher hands an event to the message bus. A successful dispatch
//! only means the event was handed over, not that it was processed.

use async_trait::async_trait;
use stator_types::Event;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("dispatch channel closed")]
    Closed,

    #[error("dispatch failed: {0}")]
    Send(String),
}

#[async_trait]
pub trait Dispatcher: Send + Sync + std::fmt::Debug {
    async fn dispatch(&self, event: Event) -> Result<(), DispatchError>;
}

/// Dispatcher feeding an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, event: Event) -> Result<(), DispatchError> {
        self.tx.send(event).map_err(|_| DispatchError::Closed)
    }
}
