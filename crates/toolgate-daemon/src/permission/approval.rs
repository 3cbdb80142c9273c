//! Approval sources: anything that can answer a permission request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use toolgate_core::PolicyStore;

use super::broker::PermissionBroker;
use super::cache::{DecisionCache, DecisionKey};
use super::types::{PermissionError, PermissionRequest, PermissionResult};

/// Failure to produce a decision (as opposed to a deny).
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error("{0}")]
    Failed(String),
}

/// Failure of the human-approval collaborator.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("no prompt available: {0}")]
    Unavailable(String),

    #[error("prompt cancelled")]
    Cancelled,
}

/// Answers permission requests for one or more sessions.
#[async_trait]
pub trait ApprovalSource: Send + Sync {
    async fn can_use_tool(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<PermissionResult, ApprovalError>;
}

#[async_trait]
impl ApprovalSource for PermissionBroker {
    async fn can_use_tool(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<PermissionResult, ApprovalError> {
        Ok(Self::can_use_tool(self, cancel, request).await?)
    }
}

#[async_trait]
impl<T: ApprovalSource + ?Sized> ApprovalSource for Arc<T> {
    async fn can_use_tool(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<PermissionResult, ApprovalError> {
        (**self).can_use_tool(cancel, request).await
    }
}

/// Denies every request.
#[derive(Debug, Clone)]
pub struct DenyAll {
    reason: String,
}

impl DenyAll {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for DenyAll {
    fn default() -> Self {
        Self::new("Permission denied")
    }
}

#[async_trait]
impl ApprovalSource for DenyAll {
    async fn can_use_tool(
        &self,
        _cancel: &CancellationToken,
        _request: &PermissionRequest,
    ) -> Result<PermissionResult, ApprovalError> {
        Ok(PermissionResult::deny(self.reason.clone()))
    }
}

/// Asks a human. Returns `(approved, remember)`.
#[async_trait]
pub trait UserPrompter: Send + Sync {
    async fn prompt_permission(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<(bool, bool), PromptError>;
}

/// Policy lists first, then a human prompt whose answers may be remembered.
pub struct PromptApproval<P> {
    prompter: P,
    policy: Arc<dyn PolicyStore>,
    remembered: DecisionCache,
    remember_for: Duration,
}

impl<P: UserPrompter> PromptApproval<P> {
    pub fn new(prompter: P, policy: Arc<dyn PolicyStore>, remember_for: Duration) -> Self {
        Self {
            prompter,
            policy,
            remembered: DecisionCache::new(),
            remember_for,
        }
    }
}

#[async_trait]
impl<P: UserPrompter> ApprovalSource for PromptApproval<P> {
    async fn can_use_tool(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<PermissionResult, ApprovalError> {
        if self.policy.is_blacklisted(&request.tool_name) {
            return Ok(PermissionResult::deny("blacklisted"));
        }
        if self.policy.is_whitelisted(&request.tool_name) {
            return Ok(PermissionResult::allow("whitelisted"));
        }

        let key = DecisionKey::for_request(request);
        if let Some(result) = self.remembered.get(&key).await {
            return Ok(result);
        }

        let (approved, remember) = self.prompter.prompt_permission(cancel, request).await?;
        let result = if approved {
            PermissionResult::allow("user approved")
        } else {
            PermissionResult::deny("user denied")
        };
        if remember {
            debug!(tool_name = %request.tool_name, approved, "Remembering prompt answer");
            self.remembered
                .insert(key, result.clone(), self.remember_for)
                .await;
        }
        Ok(result)
    }
}

/// Adapts an async closure into an [`ApprovalSource`].
pub struct FnApproval<F>(F);

impl<F, Fut> FnApproval<F>
where
    F: Fn(CancellationToken, PermissionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PermissionResult, ApprovalError>> + Send,
{
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ApprovalSource for FnApproval<F>
where
    F: Fn(CancellationToken, PermissionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PermissionResult, ApprovalError>> + Send,
{
    async fn can_use_tool(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> Result<PermissionResult, ApprovalError> {
        (self.0)(cancel.clone(), request.clone()).await
    }
}
