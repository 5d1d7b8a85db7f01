//! Pending request/response exchanges keyed by correlation id.
//!
//! A caller registers an id before sending a query, then waits on the
//! returned [`ExchangeHandle`]. The dispatcher resolves the exchange when an
//! `http.response` with the same id arrives. Each exchange is resolved at
//! most once; a reply for an id that is no longer pending is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::envelope::ResponseEnvelope;
use crate::error::CorrelationError;

#[derive(Debug)]
struct PendingExchange {
    token: u64,
    created_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<ResponseEnvelope>,
}

/// Registry of in-flight exchanges.
#[derive(Debug, Default)]
pub struct CorrelationStore {
    next_token: AtomicU64,
    pending: Mutex<HashMap<String, PendingExchange>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new exchange that must complete before `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::DuplicateId`] if `id` is already pending.
    /// The existing entry is left untouched.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        deadline: Instant,
    ) -> Result<ExchangeHandle, CorrelationError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(CorrelationError::DuplicateId { id });
            }
            pending.insert(
                id.clone(),
                PendingExchange {
                    token,
                    created_at: Instant::now(),
                    deadline,
                    slot: tx,
                },
            );
        }

        tracing::trace!(id = %id, "Registered exchange");
        Ok(ExchangeHandle {
            id,
            token,
            deadline,
            receiver: rx,
            store: Arc::clone(self),
        })
    }

    /// Deliver `response` to the exchange waiting on `id`.
    ///
    /// Returns `false` when nothing was waiting (unknown id, already
    /// resolved, or timed out).
    pub fn resolve(&self, id: &str, response: ResponseEnvelope) -> bool {
        let Some(entry) = self.pending.lock().remove(id) else {
            tracing::debug!(id = %id, "Reply for unknown exchange dropped");
            return false;
        };
        tracing::debug!(
            id = %id,
            waited_ms = entry.created_at.elapsed().as_millis() as u64,
            "Exchange resolved"
        );
        entry.slot.send(response).is_ok()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drop every pending exchange; waiters fail with
    /// [`CorrelationError::Closed`]. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drained.len()
    }

    fn remove_if_owned(&self, id: &str, token: u64) {
        let mut pending = self.pending.lock();
        if pending.get(id).is_some_and(|e| e.token == token) {
            pending.remove(id);
        }
    }
}

/// The waiting side of one exchange.
///
/// Dropping the handle removes its entry if it is still pending.
#[derive(Debug)]
pub struct ExchangeHandle {
    id: String,
    token: u64,
    deadline: Instant,
    receiver: oneshot::Receiver<ResponseEnvelope>,
    store: Arc<CorrelationStore>,
}

impl ExchangeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply, for at most `timeout` and never past the
    /// registered deadline.
    ///
    /// # Errors
    ///
    /// - [`CorrelationError::Timeout`] when no reply arrived in time; the
    ///   entry is removed so a late reply is a no-op
    /// - [`CorrelationError::Closed`] when the store was drained
    pub async fn wait(mut self, timeout: Duration) -> Result<ResponseEnvelope, CorrelationError> {
        let until = self.deadline.min(Instant::now() + timeout);
        match tokio::time::timeout_at(until, &mut self.receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CorrelationError::Closed {
                id: self.id.clone(),
            }),
            Err(_) => {
                tracing::debug!(id = %self.id, "Exchange timed out");
                Err(CorrelationError::Timeout {
                    id: self.id.clone(),
                })
            }
        }
    }
}

impl Drop for ExchangeHandle {
    fn drop(&mut self) {
        self.store.remove_if_owned(&self.id, self.token);
    }
}
