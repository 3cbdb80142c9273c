//! Permission broker.
//!
//! Decides tool requests from the policy store, per-scope modes and remembered
//! decisions. Manual scopes park the request in the pending table until a
//! decision is submitted, the timeout fires, or the caller cancels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use toolgate_core::config::PermissionConfig;
use toolgate_core::{PermissionMode, PolicyStore, StaticPolicy};

use super::audit::{AuditSink, spawn_record};
use super::cache::{DecisionCache, DecisionKey};
use super::pending::{PendingRequest, PendingTable};
use super::types::{PermissionError, PermissionRequest, PermissionResponse, PermissionResult};

/// Broker tuning.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a Manual request waits for a decision.
    pub timeout: Duration,
    /// Remember Manual decisions per (agent, scope, tool).
    pub remember_decisions: bool,
    pub decision_duration: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            remember_decisions: false,
            decision_duration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<&PermissionConfig> for BrokerConfig {
    fn from(config: &PermissionConfig) -> Self {
        Self {
            timeout: config.timeout(),
            remember_decisions: config.remember_decisions,
            decision_duration: config.decision_duration(),
        }
    }
}

/// Shared decision engine. One instance serves every session of a process.
pub struct PermissionBroker {
    policy: Arc<dyn PolicyStore>,
    config: BrokerConfig,
    modes: RwLock<HashMap<String, PermissionMode>>,
    pending: PendingTable,
    cache: DecisionCache,
    audit: Option<Arc<dyn AuditSink>>,
}

impl PermissionBroker {
    pub fn new(policy: Arc<dyn PolicyStore>, config: BrokerConfig) -> Self {
        Self {
            policy,
            config,
            modes: RwLock::new(HashMap::new()),
            pending: PendingTable::new(),
            cache: DecisionCache::new(),
            audit: None,
        }
    }

    /// Broker with a [`StaticPolicy`] built from the permission config.
    pub fn from_config(config: &PermissionConfig) -> Self {
        Self::new(Arc::new(StaticPolicy::from_config(config)), config.into())
    }

    #[must_use]
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Decide a tool request.
    ///
    /// Blacklist, whitelist, remembered decisions and non-manual modes answer
    /// immediately. Manual scopes wait for [`Self::submit_decision`]; a timeout
    /// resolves to a deny, cancellation to [`PermissionError::Cancelled`].
    pub async fn can_use_tool(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<PermissionResult, PermissionError> {
        let started = Instant::now();
        let outcome = self.evaluate(cancel, request).await;

        if let Some(sink) = &self.audit {
            let result = match &outcome {
                Ok(result) => result.clone(),
                Err(e) => e.fallback_result(),
            };
            spawn_record(
                Arc::clone(sink),
                request.clone(),
                PermissionResponse::new(request.request_id.clone(), result.approved, result.reason),
                started.elapsed(),
            );
        }

        outcome
    }

    async fn evaluate(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<PermissionResult, PermissionError> {
        // 1. Blacklist wins over everything
        if self.policy.is_blacklisted(&request.tool_name) {
            debug!(request_id = %request.request_id, tool_name = %request.tool_name, "Tool blacklisted");
            return Ok(PermissionResult::deny("blacklisted"));
        }

        // 2. Whitelist
        if self.policy.is_whitelisted(&request.tool_name) {
            debug!(request_id = %request.request_id, tool_name = %request.tool_name, "Tool whitelisted");
            return Ok(PermissionResult::allow("whitelisted"));
        }

        // 3. Remembered decisions
        if self.config.remember_decisions {
            if let Some(result) = self.cache.get(&DecisionKey::for_request(request)).await {
                debug!(
                    request_id = %request.request_id,
                    tool_name = %request.tool_name,
                    approved = result.approved,
                    "Cached decision hit"
                );
                return Ok(result);
            }
        }

        // 4. Scope mode
        match self.get_mode(&request.scope_id).await {
            PermissionMode::Auto => Ok(PermissionResult::allow("")),
            PermissionMode::Skip => Ok(PermissionResult::allow("policy: skip")),
            PermissionMode::Manual => self.wait_for_decision(cancel, request).await,
            PermissionMode::Unrecognized(mode) => {
                warn!(scope_id = %request.scope_id, mode = %mode, "Unknown permission mode");
                Err(PermissionError::UnknownMode { mode })
            }
        }
    }

    async fn wait_for_decision(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<PermissionResult, PermissionError> {
        let timeout = self.config.timeout;
        let mailbox = self.pending.register(request.clone(), timeout).await?;

        info!(
            request_id = %request.request_id,
            scope_id = %request.scope_id,
            tool_name = %request.tool_name,
            "Permission request pending"
        );

        let outcome = tokio::select! {
            biased;
            response = mailbox => match response {
                Ok(response) => {
                    let result = response.to_result();
                    if self.config.remember_decisions {
                        self.cache
                            .insert(
                                DecisionKey::for_request(request),
                                result.clone(),
                                self.config.decision_duration,
                            )
                            .await;
                    }
                    Ok(result)
                }
                Err(_) => Err(PermissionError::RequestNotFound {
                    request_id: request.request_id.clone(),
                }),
            },
            () = cancel.cancelled() => {
                debug!(request_id = %request.request_id, "Permission request cancelled");
                Err(PermissionError::Cancelled)
            }
            () = tokio::time::sleep(timeout) => {
                warn!(request_id = %request.request_id, "Permission request timed out");
                Ok(PermissionResult::deny("timed out"))
            }
        };

        self.pending.remove(&request.request_id).await;
        outcome
    }

    /// Resolve a pending Manual request.
    pub async fn submit_decision(
        &self,
        request_id: &str,
        approved: bool,
        reason: impl Into<String>,
    ) -> Result<(), PermissionError> {
        let response = PermissionResponse::new(request_id, approved, reason);
        match self.pending.resolve(response).await {
            Ok(()) => {
                info!(request_id, approved, "Permission decision submitted");
                Ok(())
            }
            Err(e) => {
                warn!(request_id, error = %e, "Late permission decision");
                Err(e)
            }
        }
    }

    /// Snapshot of every request awaiting a decision.
    pub async fn pending_requests(&self) -> Vec<PermissionRequest> {
        into_requests(self.pending.snapshot().await)
    }

    /// Requests awaiting a decision in one scope.
    pub async fn pending_for_scope(&self, scope_id: &str) -> Vec<PermissionRequest> {
        into_requests(self.pending.for_scope(scope_id).await)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.count().await
    }

    /// Override the mode for a scope.
    pub async fn set_mode(&self, scope_id: &str, mode: PermissionMode) {
        info!(scope_id, %mode, "Permission mode set");
        self.modes.write().await.insert(scope_id.to_string(), mode);
    }

    /// Mode for a scope, falling back to the policy default.
    pub async fn get_mode(&self, scope_id: &str) -> PermissionMode {
        let mode = self.modes.read().await.get(scope_id).cloned();
        mode.unwrap_or_else(|| self.policy.default_mode())
    }

    /// Forget a scope's mode override and its remembered decisions.
    pub async fn clear_scope(&self, scope_id: &str) {
        self.modes.write().await.remove(scope_id);
        self.cache.clear_scope(scope_id).await;
        debug!(scope_id, "Cleared permission scope");
    }

    /// Drop expired remembered decisions.
    pub async fn purge_expired_decisions(&self) -> usize {
        let purged = self.cache.purge_expired().await;
        if purged > 0 {
            debug!(purged, "Purged expired permission decisions");
        }
        purged
    }
}

fn into_requests(pending: Vec<PendingRequest>) -> Vec<PermissionRequest> {
    pending.into_iter().map(|p| p.request).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker(mode: PermissionMode) -> PermissionBroker {
        PermissionBroker::new(
            Arc::new(
                StaticPolicy::new(mode)
                    .with_blacklist(["rm_rf"])
                    .with_whitelist(["Read", "rm_rf"]),
            ),
            BrokerConfig::default(),
        )
    }

    fn request(id: &str, scope: &str, tool: &str) -> PermissionRequest {
        PermissionRequest::new(scope, tool, json!({"command": "ls"})).with_request_id(id)
    }

    #[test]
    fn zero_config_durations_use_defaults() {
        let config = BrokerConfig::from(&PermissionConfig {
            timeout_secs: 0,
            decision_duration_secs: 0,
            ..PermissionConfig::default()
        });
        let defaults = BrokerConfig::default();
        assert_eq!(config.timeout, defaults.timeout);
        assert_eq!(config.decision_duration, defaults.decision_duration);
    }

    #[tokio::test]
    async fn zero_timeout_config_still_waits_for_a_decision() {
        let broker = PermissionBroker::from_config(&PermissionConfig {
            default_mode: PermissionMode::Manual,
            timeout_secs: 0,
            ..PermissionConfig::default()
        });
        let cancel = CancellationToken::new();
        let req = request("r1", "s1", "Bash");
        let wait = broker.can_use_tool(&cancel, &req);
        tokio::pin!(wait);

        // Not denied on the spot; still pending after a short while.
        let early = tokio::time::timeout(Duration::from_millis(50), &mut wait).await;
        assert!(early.is_err());
        assert_eq!(broker.pending_count().await, 1);

        broker.submit_decision("r1", true, "ok").await.unwrap();
        assert_eq!(wait.await.unwrap(), PermissionResult::allow("ok"));
    }

    #[tokio::test]
    async fn blacklist_beats_whitelist() {
        let broker = broker(PermissionMode::Auto);
        let result = broker
            .can_use_tool(&CancellationToken::new(), &request("r1", "s1", "rm_rf"))
            .await
            .unwrap();
        assert_eq!(result, PermissionResult::deny("blacklisted"));
    }

    #[tokio::test]
    async fn whitelist_skips_manual_wait() {
        let broker = broker(PermissionMode::Manual);
        let result = broker
            .can_use_tool(&CancellationToken::new(), &request("r1", "s1", "Read"))
            .await
            .unwrap();
        assert_eq!(result, PermissionResult::allow("whitelisted"));
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn skip_mode_annotates_reason() {
        let broker = broker(PermissionMode::Auto);
        broker.set_mode("s1", PermissionMode::Skip).await;
        let result = broker
            .can_use_tool(&CancellationToken::new(), &request("r1", "s1", "Bash"))
            .await
            .unwrap();
        assert_eq!(result, PermissionResult::allow("policy: skip"));
    }

    #[tokio::test]
    async fn unknown_mode_is_an_error() {
        let broker = broker(PermissionMode::Auto);
        broker.set_mode("s1", PermissionMode::parse("paranoid")).await;
        let err = broker
            .can_use_tool(&CancellationToken::new(), &request("r1", "s1", "Bash"))
            .await
            .unwrap_err();
        assert!(matches!(err, PermissionError::UnknownMode { .. }));
        assert!(!err.fallback_result().approved);
    }

    #[tokio::test]
    async fn get_mode_falls_back_to_default() {
        let broker = broker(PermissionMode::Manual);
        assert_eq!(broker.get_mode("anything").await, PermissionMode::Manual);
        broker.set_mode("s1", PermissionMode::Auto).await;
        assert_eq!(broker.get_mode("s1").await, PermissionMode::Auto);
        broker.clear_scope("s1").await;
        assert_eq!(broker.get_mode("s1").await, PermissionMode::Manual);
    }

    #[tokio::test]
    async fn cancel_resolves_manual_wait() {
        let broker = Arc::new(broker(PermissionMode::Manual));
        let cancel = CancellationToken::new();
        let task = {
            let broker = Arc::clone(&broker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                broker
                    .can_use_tool(&cancel, &request("r1", "s1", "Bash"))
                    .await
            })
        };
        while broker.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, PermissionError::Cancelled);
        assert_eq!(err.fallback_result().reason, "context cancelled");
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn clear_scope_forgets_cached_decisions() {
        let broker = Arc::new(PermissionBroker::new(
            Arc::new(StaticPolicy::new(PermissionMode::Manual)),
            BrokerConfig {
                remember_decisions: true,
                ..BrokerConfig::default()
            },
        ));
        let task = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .can_use_tool(&CancellationToken::new(), &request("r1", "s1", "Bash"))
                    .await
            })
        };
        while broker.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
        broker.submit_decision("r1", false, "no").await.unwrap();
        assert!(!task.await.unwrap().unwrap().approved);

        broker.clear_scope("s1").await;
        assert_eq!(broker.purge_expired_decisions().await, 0);
        // Without the cached deny the next request waits again.
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = broker
            .can_use_tool(&cancel, &request("r2", "s1", "Bash"))
            .await
            .unwrap_err();
        assert_eq!(err, PermissionError::Cancelled);
    }
}
