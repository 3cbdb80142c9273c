//! Binds one agent transport to one approval source.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use toolgate_core::ndjson::Frame;

use crate::permission::{ApprovalSource, PermissionBroker, PermissionRequest, PermissionResult};
use crate::subprocess::{
    ControlHandler, LaunchOptions, PromptSource, Transport, TransportError, TransportOptions,
};

/// Per-query settings.
#[derive(Default)]
pub struct QueryOptions {
    pub launch: LaunchOptions,
    pub transport: TransportOptions,
    /// Answers this query's permission asks instead of the gateway broker.
    pub approval: Option<Arc<dyn ApprovalSource>>,
}

/// Entry point for running agent sessions against a shared broker.
#[derive(Clone)]
pub struct Gateway {
    broker: Arc<PermissionBroker>,
}

impl Gateway {
    pub const fn new(broker: Arc<PermissionBroker>) -> Self {
        Self { broker }
    }

    pub const fn broker(&self) -> &Arc<PermissionBroker> {
        &self.broker
    }

    /// Launch the agent and start a query. Cancelling `parent` cancels the
    /// query and every permission wait it started.
    pub fn query(
        &self,
        parent: &CancellationToken,
        prompt: PromptSource,
        options: QueryOptions,
    ) -> Result<Query, TransportError> {
        let (cancel, transport_options) = self.bind(parent, options.approval, options.transport);
        let transport = Transport::open(prompt, &options.launch, transport_options)?;
        info!("Query started");
        Ok(Query { transport, cancel })
    }

    /// Start a query over already-open streams to a running agent.
    pub fn query_attached<R, W>(
        &self,
        parent: &CancellationToken,
        reader: R,
        writer: W,
        prompt: PromptSource,
        options: QueryOptions,
    ) -> Query
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cancel, transport_options) = self.bind(parent, options.approval, options.transport);
        let transport = Transport::attach(reader, writer, prompt, transport_options);
        Query { transport, cancel }
    }

    fn bind(
        &self,
        parent: &CancellationToken,
        approval: Option<Arc<dyn ApprovalSource>>,
        transport: TransportOptions,
    ) -> (CancellationToken, TransportOptions) {
        let cancel = parent.child_token();
        let source = approval.unwrap_or_else(|| Arc::clone(&self.broker) as Arc<dyn ApprovalSource>);
        let options = TransportOptions {
            cancel: cancel.clone(),
            handler: Some(Arc::new(ApprovalBinding { source })),
            ..transport
        };
        (cancel, options)
    }
}

/// Turns an approval source into a transport control handler. Source errors
/// become denies carrying the error message.
struct ApprovalBinding {
    source: Arc<dyn ApprovalSource>,
}

#[async_trait]
impl ControlHandler for ApprovalBinding {
    async fn handle_permission(
        &self,
        cancel: CancellationToken,
        request: PermissionRequest,
    ) -> PermissionResult {
        match self.source.can_use_tool(&cancel, &request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    tool_name = %request.tool_name,
                    error = %e,
                    "Approval source failed, denying"
                );
                PermissionResult::deny(e.to_string())
            }
        }
    }
}

/// A running agent session.
pub struct Query {
    transport: Transport,
    cancel: CancellationToken,
}

impl Query {
    /// Next conversation frame; `None` at end of stream.
    pub async fn next(&mut self) -> Option<Frame> {
        self.transport.next_message().await
    }

    pub async fn interrupt(&self) -> Result<(), TransportError> {
        self.transport.interrupt().await
    }

    /// Cancel outstanding permission waits, then stop the agent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.transport.close().await;
    }

    pub async fn session_id(&self) -> Option<String> {
        self.transport.session_id().await
    }

    /// Abandon one in-flight permission ask by its control request id.
    pub async fn send_cancel(&self, control_request_id: &str) -> Result<(), TransportError> {
        self.transport.send_cancel(control_request_id).await
    }

    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub const fn transport(&self) -> &Transport {
        &self.transport
    }
}
