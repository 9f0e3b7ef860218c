//! Request correlation
//!
//! A caller registers a request id with [`Holder::wait`] before dispatching
//! its event, then awaits the returned [`Waiter`]. The callback event that
//! answers the request resolves the waiter through [`Holder::on_respond`].
//! Each entry resolves at most once: by the response, the deadline, an
//! explicit cancel or node shutdown. Later responses for the same id are
//! dropped.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stator_types::{Event, EnvelopeError, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Correlation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolderConfig {
    /// Deadline of one request, in milliseconds
    pub timeout_ms: u64,
    /// Callback address stamped on outgoing requests
    pub respond_callback: String,
}

impl Default for HolderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            respond_callback: "core-manager".to_string(),
        }
    }
}

impl HolderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Pending entries by request id, tagged with the generation of the
/// registration that owns them
type Pending = Arc<DashMap<String, (u64, oneshot::Sender<Response>)>>;

#[derive(Debug)]
pub struct Holder {
    pending: Pending,
    generation: AtomicU64,
    timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Holder {
    pub fn new(timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            timeout,
            shutdown,
        }
    }

    /// Register `request_id`; a previous registration under the same id is
    /// cancelled
    pub fn wait(&self, request_id: &str) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if self
            .pending
            .insert(request_id.to_string(), (generation, tx))
            .is_some()
        {
            warn!(request_id = %request_id, "request id registered twice");
        }
        Waiter {
            request_id: request_id.to_string(),
            generation,
            rx,
            pending: self.pending.clone(),
            timeout: self.timeout,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Resolve the waiter of `response.request_id`. Returns whether a
    /// waiter received it.
    pub fn on_respond(&self, response: Response) -> bool {
        match self.pending.remove(&response.request_id) {
            Some((_, (_, tx))) => tx.send(response).is_ok(),
            None => {
                debug!(request_id = %response.request_id, "response without waiter");
                false
            }
        }
    }

    /// Resolve from a callback event
    pub fn on_event(&self, ev: &Event) -> Result<bool, EnvelopeError> {
        Ok(self.on_respond(Response::from_event(ev)?))
    }

    pub fn cancel(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// One pending request
#[derive(Debug)]
pub struct Waiter {
    request_id: String,
    generation: u64,
    rx: oneshot::Receiver<Response>,
    pending: Pending,
    timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Waiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response, the deadline or shutdown
    pub async fn wait(mut self) -> Response {
        let response = tokio::select! {
            received = &mut self.rx => match received {
                Ok(response) => response,
                Err(_) => Response::cancelled(&self.request_id),
            },
            _ = tokio::time::sleep(self.timeout) => {
                warn!(request_id = %self.request_id, "request timeout");
                Response::timeout(&self.request_id)
            }
            _ = stopped(&mut self.shutdown) => Response::cancelled(&self.request_id),
        };
        self.release();
        response
    }

    /// Withdraw the request before it resolves
    pub fn cancel(self) {
        self.release();
    }

    /// Drop this waiter's entry, leaving a newer registration of the same id
    fn release(&self) {
        self.pending
            .remove_if(&self.request_id, |_, (generation, _)| *generation == self.generation);
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stator_types::ResponseStatus;

    fn holder() -> (Holder, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Holder::new(Duration::from_secs(30), rx), tx)
    }

    #[tokio::test]
    async fn test_respond_resolves_waiter() {
        let (holder, _shutdown) = holder();
        let waiter = holder.wait("req-1");
        assert!(holder.on_respond(Response::ok("req-1", b"data".to_vec())));

        let response = waiter.wait().await;
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.data, b"data".to_vec());
        assert_eq!(holder.pending(), 0);
    }

    #[tokio::test]
    async fn test_second_response_is_dropped() {
        let (holder, _shutdown) = holder();
        let waiter = holder.wait("req-1");
        assert!(holder.on_respond(Response::ok("req-1", b"first".to_vec())));
        assert!(!holder.on_respond(Response::ok("req-1", b"second".to_vec())));
        assert_eq!(waiter.wait().await.data, b"first".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_resolves_with_timeout() {
        let (holder, _shutdown) = holder();
        let response = holder.wait("req-1").wait().await;
        assert_eq!(response.status, ResponseStatus::Timeout);
        assert_eq!(response.err_code, "request timeout");
        assert_eq!(holder.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_entry() {
        let (holder, _shutdown) = holder();
        holder.wait("req-1").cancel();
        assert_eq!(holder.pending(), 0);
        assert!(!holder.on_respond(Response::ok("req-1", vec![])));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters() {
        let (holder, shutdown) = holder();
        let waiter = holder.wait("req-1");
        shutdown.send(true).unwrap();
        assert_eq!(waiter.wait().await.status, ResponseStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reregistered_id_keeps_newest_waiter() {
        let (holder, _shutdown) = holder();
        let first = holder.wait("req-1");
        let second = holder.wait("req-1");

        assert_eq!(first.wait().await.status, ResponseStatus::Cancelled);
        assert_eq!(holder.pending(), 1);

        assert!(holder.on_respond(Response::ok("req-1", b"second".to_vec())));
        assert_eq!(second.wait().await.data, b"second".to_vec());
        assert_eq!(holder.pending(), 0);
    }

    #[tokio::test]
    async fn test_on_event() {
        let (holder, _shutdown) = holder();
        let waiter = holder.wait("req-1");
        let ev = Event::response_event("req-1", ResponseStatus::Error, "entity_not_found", vec![]);
        assert!(holder.on_event(&ev).unwrap());
        assert_eq!(waiter.wait().await.err_code, "entity_not_found");
    }
}
