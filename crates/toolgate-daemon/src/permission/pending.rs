//! Pending permission request table.
//!
//! Tracks Manual requests that are awaiting a decision. Each entry owns the
//! sending half of a one-shot mailbox; the waiter holds the receiver.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, oneshot};
use tracing::debug;

use super::types::{PermissionError, PermissionRequest, PermissionResponse};

/// A pending permission request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: PermissionRequest,
    /// When the request was created.
    pub created_at: Instant,
    pub timeout: Duration,
}

impl PendingRequest {
    /// Deadline for a decision; `None` if the timeout does not fit in an `Instant`.
    pub fn expires_at(&self) -> Option<Instant> {
        self.created_at.checked_add(self.timeout)
    }

    /// Check if the request has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at().is_some_and(|at| Instant::now() > at)
    }
}

struct PendingEntry {
    pending: PendingRequest,
    mailbox: oneshot::Sender<PermissionResponse>,
}

/// Table of pending permission requests keyed by request id.
#[derive(Default)]
pub struct PendingTable {
    requests: RwLock<HashMap<String, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending request and return the mailbox its decision arrives on.
    pub async fn register(
        &self,
        request: PermissionRequest,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<PermissionResponse>, PermissionError> {
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel();
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request_id) {
            return Err(PermissionError::DuplicateRequest { request_id });
        }
        requests.insert(
            request_id.clone(),
            PendingEntry {
                pending: PendingRequest {
                    request,
                    created_at: Instant::now(),
                    timeout,
                },
                mailbox: tx,
            },
        );
        drop(requests);
        debug!(request_id, "Added pending permission request");
        Ok(rx)
    }

    /// Deliver a decision to the waiter and remove the entry.
    pub async fn resolve(&self, response: PermissionResponse) -> Result<(), PermissionError> {
        let entry = self.requests.write().await.remove(&response.request_id);
        let Some(entry) = entry else {
            return Err(PermissionError::RequestNotFound {
                request_id: response.request_id,
            });
        };
        let request_id = response.request_id.clone();
        entry
            .mailbox
            .send(response)
            .map_err(|_| PermissionError::RequestNotFound {
                request_id: request_id.clone(),
            })?;
        debug!(request_id, "Delivered permission decision");
        Ok(())
    }

    /// Remove a pending request, returning it if it was still present.
    pub async fn remove(&self, request_id: &str) -> Option<PendingRequest> {
        let entry = self.requests.write().await.remove(request_id);
        if entry.is_some() {
            debug!(request_id, "Removed pending permission request");
        }
        entry.map(|e| e.pending)
    }

    /// Check if a request exists.
    pub async fn contains(&self, request_id: &str) -> bool {
        self.requests.read().await.contains_key(request_id)
    }

    /// Point-in-time snapshot of every pending request.
    pub async fn snapshot(&self) -> Vec<PendingRequest> {
        self.requests
            .read()
            .await
            .values()
            .map(|e| e.pending.clone())
            .collect()
    }

    /// Get all pending requests for a scope.
    pub async fn for_scope(&self, scope_id: &str) -> Vec<PendingRequest> {
        self.requests
            .read()
            .await
            .values()
            .filter(|e| e.pending.request.scope_id == scope_id)
            .map(|e| e.pending.clone())
            .collect()
    }

    /// Get count of pending requests.
    pub async fn count(&self) -> usize {
        self.requests.read().await.len()
    }
}
