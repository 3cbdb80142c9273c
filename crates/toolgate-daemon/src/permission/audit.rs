//! Decision audit sinks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::types::{PermissionRequest, PermissionResponse};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to record decision: {0}")]
    Write(String),
}

/// Receives every resolved permission decision.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_decision(
        &self,
        request: &PermissionRequest,
        response: &PermissionResponse,
        elapsed: Duration,
    ) -> Result<(), AuditError>;
}

/// Logs each decision as a structured `info` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

#[async_trait]
impl AuditSink for TracingAudit {
    async fn record_decision(
        &self,
        request: &PermissionRequest,
        response: &PermissionResponse,
        elapsed: Duration,
    ) -> Result<(), AuditError> {
        info!(
            request_id = %request.request_id,
            scope_id = %request.scope_id,
            agent_type = %request.agent_type,
            tool_name = %request.tool_name,
            approved = response.approved,
            reason = %response.reason,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Permission decision"
        );
        Ok(())
    }
}

/// Record a decision on a background task. Failures are logged and dropped.
pub fn spawn_record(
    sink: Arc<dyn AuditSink>,
    request: PermissionRequest,
    response: PermissionResponse,
    elapsed: Duration,
) {
    tokio::spawn(async move {
        if let Err(e) = sink.record_decision(&request, &response, elapsed).await {
            warn!(request_id = %request.request_id, error = %e, "Failed to record permission decision");
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct ChannelAudit(mpsc::UnboundedSender<(String, bool)>);

    #[async_trait]
    impl AuditSink for ChannelAudit {
        async fn record_decision(
            &self,
            request: &PermissionRequest,
            response: &PermissionResponse,
            _elapsed: Duration,
        ) -> Result<(), AuditError> {
            let _ = self.0.send((request.tool_name.clone(), response.approved));
            Err(AuditError::Write("disk full".into()))
        }
    }

    #[tokio::test]
    async fn spawned_record_reaches_sink_even_when_it_fails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = PermissionRequest::new("s1", "Bash", json!({}));
        let response = PermissionResponse::new(request.request_id.clone(), true, "ok");
        spawn_record(
            Arc::new(ChannelAudit(tx)),
            request,
            response,
            Duration::from_millis(3),
        );
        assert_eq!(rx.recv().await.unwrap(), ("Bash".to_string(), true));
    }

    #[tokio::test]
    async fn tracing_audit_never_fails() {
        let request = PermissionRequest::new("s1", "Read", json!({}));
        let response = PermissionResponse::new(request.request_id.clone(), false, "blacklisted");
        assert!(
            TracingAudit
                .record_decision(&request, &response, Duration::ZERO)
                .await
                .is_ok()
        );
    }
}
