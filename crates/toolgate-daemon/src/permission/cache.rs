//! Time-bounded cache of manual decisions.
//!
//! Keyed by (agent type, scope, tool name). The tool input is not part of the
//! key, so one approval covers every later call of that tool in the scope.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use super::types::{AgentType, PermissionRequest, PermissionResult};

/// Cache key for a remembered decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub agent_type: AgentType,
    pub scope_id: String,
    pub tool_name: String,
}

impl DecisionKey {
    pub fn for_request(request: &PermissionRequest) -> Self {
        Self {
            agent_type: request.agent_type.clone(),
            scope_id: request.scope_id.clone(),
            tool_name: request.tool_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedDecision {
    result: PermissionResult,
    /// `None` when the ttl is too large to represent; such decisions never expire.
    expires_at: Option<Instant>,
}

impl CachedDecision {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
pub struct DecisionCache {
    decisions: RwLock<HashMap<DecisionKey, CachedDecision>>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live decision, dropping it if it has expired.
    pub async fn get(&self, key: &DecisionKey) -> Option<PermissionResult> {
        let now = Instant::now();
        {
            let decisions = self.decisions.read().await;
            match decisions.get(key) {
                None => return None,
                Some(cached) if !cached.is_expired(now) => return Some(cached.result.clone()),
                Some(_) => {}
            }
        }

        // Re-check under the write lock; a fresh decision may have replaced it.
        let mut decisions = self.decisions.write().await;
        if decisions.get(key).is_some_and(|c| c.is_expired(now)) {
            decisions.remove(key);
            debug!(tool_name = %key.tool_name, scope_id = %key.scope_id, "Cached decision expired");
        }
        None
    }

    pub async fn insert(&self, key: DecisionKey, result: PermissionResult, ttl: Duration) {
        debug!(
            tool_name = %key.tool_name,
            scope_id = %key.scope_id,
            approved = result.approved,
            "Caching permission decision"
        );
        self.decisions.write().await.insert(
            key,
            CachedDecision {
                result,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
    }

    /// Drop every decision cached for a scope.
    pub async fn clear_scope(&self, scope_id: &str) {
        self.decisions
            .write()
            .await
            .retain(|key, _| key.scope_id != scope_id);
    }

    /// Remove expired decisions, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut decisions = self.decisions.write().await;
        let before = decisions.len();
        decisions.retain(|_, cached| !cached.is_expired(now));
        before - decisions.len()
    }

    pub async fn len(&self) -> usize {
        self.decisions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.decisions.read().await.is_empty()
    }
}
