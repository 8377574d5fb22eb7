//! Request correlation.
//!
//! Every in-flight request is registered under its correlation id before its
//! frame is written. Exactly one of three things then settles it:
//!
//! - a response line with the same id arrives on the same connection
//! - its deadline passes (or the waiting caller goes away)
//! - the connection fails, which settles every request pending on it
//!
//! Settlement is decided by whoever removes the entry from the pending map,
//! so a request can never be resolved twice. Responses that arrive after
//! their request was settled are counted and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use relay_kernel::error::{EngineError, EngineResult};
use relay_kernel::wire::{Command, ResponseEnvelope};

type Completion = oneshot::Sender<EngineResult<ResponseEnvelope>>;

struct PendingRequest {
    connection_id: String,
    action: String,
    issued_at: Instant,
    completion: Completion,
}

/// Snapshot of correlator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStats {
    pub pending: usize,
    pub resolved: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub discarded: u64,
}

/// Maps correlation ids to waiting callers. Shared by every connection of
/// an engine.
#[derive(Default)]
pub struct RequestCorrelator {
    pending: DashMap<String, PendingRequest>,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `command` as pending on `connection_id` with the given deadline.
    ///
    /// Must be called before the frame is written so a fast reply cannot
    /// overtake the registration.
    pub fn register(
        self: &Arc<Self>,
        connection_id: &str,
        command: &Command,
        deadline: Instant,
    ) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let issued_at = Instant::now();
        self.pending.insert(
            command.request_id.clone(),
            PendingRequest {
                connection_id: connection_id.to_string(),
                action: command.action.clone(),
                issued_at,
                completion: tx,
            },
        );
        PendingResponse {
            correlator: Arc::clone(self),
            request_id: command.request_id.clone(),
            action: command.action.clone(),
            issued_at,
            deadline,
            receiver: rx,
            settled: false,
        }
    }

    /// Hand a decoded response to its waiter.
    ///
    /// Returns `false` when no request with that id is pending on
    /// `connection_id`; the response is then discarded.
    pub fn resolve(&self, connection_id: &str, envelope: ResponseEnvelope) -> bool {
        let Some((_, pending)) = self
            .pending
            .remove_if(&envelope.request_id, |_, p| p.connection_id == connection_id)
        else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Discarding stray response {} on connection {}",
                envelope.request_id, connection_id
            );
            return false;
        };

        debug!(
            "Resolved {} ({}) after {:?}",
            envelope.request_id,
            pending.action,
            pending.issued_at.elapsed()
        );
        if pending.completion.send(Ok(envelope)).is_err() {
            // The caller went away between our removal and the send.
            self.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.resolved.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Settle every request pending on `connection_id` with `error`.
    pub fn fail_connection(&self, connection_id: &str, error: EngineError) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self
                .pending
                .remove_if(&id, |_, p| p.connection_id == connection_id)
            {
                warn!(
                    "Failing pending request {} ({}) on connection {}: {}",
                    id, pending.action, connection_id, error
                );
                let _ = pending.completion.send(Err(error.clone()));
                failed += 1;
            }
        }
        self.failed.fetch_add(failed as u64, Ordering::Relaxed);
        failed
    }

    /// Remove a pending entry without resolving it. `true` if this call removed it.
    fn cancel(&self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            pending: self.pending.len(),
            resolved: self.resolved.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// The caller's side of a pending request.
///
/// Dropping it before it settles removes the pending entry, so a reply that
/// arrives later is treated as stray.
pub struct PendingResponse {
    correlator: Arc<RequestCorrelator>,
    request_id: String,
    action: String,
    issued_at: Instant,
    deadline: Instant,
    receiver: oneshot::Receiver<EngineResult<ResponseEnvelope>>,
    settled: bool,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response, the deadline, or a connection failure.
    pub async fn wait(mut self) -> EngineResult<ResponseEnvelope> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.receiver).await;
        self.settled = true;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::Connection(
                "correlator dropped the pending request".to_string(),
            )),
            Err(_) if self.correlator.cancel(&self.request_id) => {
                self.correlator.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(self.timeout_error())
            }
            // Someone removed the entry just before the deadline fired; their
            // value is already on its way.
            Err(_) => match (&mut self.receiver).await {
                Ok(result) => result,
                Err(_) => Err(self.timeout_error()),
            },
        }
    }

    /// Abandon the request as timed out, e.g. when its frame could not be
    /// written in time.
    pub fn expire(mut self) -> EngineError {
        self.settled = true;
        if self.correlator.cancel(&self.request_id) {
            self.correlator.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        self.timeout_error()
    }

    fn timeout_error(&self) -> EngineError {
        EngineError::Timeout {
            action: self.action.clone(),
            timeout: self.deadline.saturating_duration_since(self.issued_at),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled && self.correlator.cancel(&self.request_id) {
            debug!("Pending request {} abandoned by its caller", self.request_id);
        }
    }
}

/// Deadline `timeout` from now.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}
