//! Duplex NDJSON transport over an agent's standard streams.
//!
//! The read loop decodes every line, forwards conversation frames to the
//! consumer in order, and dispatches each `control_request` to its own task so
//! a slow permission decision never stalls the stream. Outgoing lines (prompts,
//! control responses, cancels, interrupts) go through a single writer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use toolgate_core::config::AgentConfig;
use toolgate_core::ndjson::{
    self, ControlOutcome, ControlRequest, ControlRequestType, ControlResponse, Frame,
};

use super::launcher::{self, LaunchOptions};
use crate::permission::{AgentType, PermissionRequest, PermissionResult};

/// Scope used when neither an explicit scope nor an agent session id is known.
pub const DEFAULT_SCOPE: &str = "default";

const NO_HANDLER_REASON: &str = "no permission handler registered";
const HANDLER_FAILED_REASON: &str = "permission handler failed";

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to launch agent: {0}")]
    Launch(String),

    #[error("Transport closed")]
    Closed,

    #[error("No response to control request {request_id}")]
    ControlTimeout { request_id: String },

    #[error("Control request failed: {0}")]
    ControlFailed(String),
}

/// Answers permission asks arriving as `control_request` frames.
///
/// Implementations must always produce a result; the transport writes it back
/// as the matching `control_response`.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle_permission(
        &self,
        cancel: CancellationToken,
        request: PermissionRequest,
    ) -> PermissionResult;
}

/// What to feed the agent's stdin at start.
#[derive(Debug, Default)]
pub enum PromptSource {
    /// Nothing; the caller writes its own input, or the agent needs none.
    #[default]
    Empty,
    /// One user turn.
    Text(String),
    /// A finite list of pre-built frames.
    Frames(Vec<Value>),
    /// Frames produced over time; ends when the sender is dropped.
    Channel(mpsc::Receiver<Value>),
}

/// Transport tuning.
#[derive(Clone)]
pub struct TransportOptions {
    /// Scope for permission requests; defaults to the agent's session id.
    pub scope_id: Option<String>,
    pub agent_type: AgentType,
    pub max_frame_bytes: usize,
    pub control_timeout: Duration,
    pub terminate_timeout: Duration,
    /// Capacity of the decoded conversation frame queue.
    pub frame_buffer: usize,
    /// Parent for every per-request cancellation token.
    pub cancel: CancellationToken,
    pub handler: Option<Arc<dyn ControlHandler>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            scope_id: None,
            agent_type: AgentType::default(),
            max_frame_bytes: 1024 * 1024,
            control_timeout: Duration::from_secs(30),
            terminate_timeout: Duration::from_secs(5),
            frame_buffer: 256,
            cancel: CancellationToken::new(),
            handler: None,
        }
    }
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("scope_id", &self.scope_id)
            .field("agent_type", &self.agent_type)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("control_timeout", &self.control_timeout)
            .field("terminate_timeout", &self.terminate_timeout)
            .field("has_handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

impl TransportOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            control_timeout: config.control_timeout(),
            terminate_timeout: config.terminate_timeout(),
            ..Self::default()
        }
    }
}

/// State shared between the transport handle and its background tasks.
struct Shared {
    writer_tx: mpsc::Sender<String>,
    handler: RwLock<Option<Arc<dyn ControlHandler>>>,
    /// Cancellation for in-flight incoming control requests, by wire id.
    inflight: Mutex<HashMap<String, CancellationToken>>,
    /// Outgoing control requests awaiting a response, by wire id.
    outgoing: Mutex<HashMap<String, oneshot::Sender<ControlResponse>>>,
    session_id: RwLock<Option<String>>,
    scope_id: Option<String>,
    agent_type: AgentType,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
}

/// One agent session's stream pair.
pub struct Transport {
    shared: Arc<Shared>,
    frames_rx: mpsc::Receiver<Frame>,
    child: Mutex<Option<Child>>,
    control_timeout: Duration,
    terminate_timeout: Duration,
    closed: AtomicBool,
}

impl Transport {
    /// Spawn the agent and start streaming.
    pub fn open(
        prompt: PromptSource,
        launch: &LaunchOptions,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        let agent = launcher::spawn(launch)?;
        let mut transport = Self::attach(agent.stdout, agent.stdin, prompt, options);
        *transport.child.get_mut() = Some(agent.child);
        Ok(transport)
    }

    /// Run the protocol over already-open byte streams.
    pub fn attach<R, W>(
        reader: R,
        writer: W,
        prompt: PromptSource,
        options: TransportOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel::<String>(64);
        let (frames_tx, frames_rx) = mpsc::channel::<Frame>(options.frame_buffer.max(1));
        let shutdown = options.cancel.child_token();

        let shared = Arc::new(Shared {
            writer_tx,
            handler: RwLock::new(options.handler),
            inflight: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            session_id: RwLock::new(None),
            scope_id: options.scope_id,
            agent_type: options.agent_type,
            max_frame_bytes: options.max_frame_bytes,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(write_loop(writer, writer_rx, shutdown.clone()));
        tokio::spawn(pump_prompt(
            prompt,
            shared.writer_tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(read_loop(reader, Arc::clone(&shared), frames_tx));

        Self {
            shared,
            frames_rx,
            child: Mutex::new(None),
            control_timeout: options.control_timeout,
            terminate_timeout: options.terminate_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Next conversation frame, in arrival order. `None` once the agent's
    /// output has ended or the transport was closed.
    pub async fn next_message(&mut self) -> Option<Frame> {
        self.frames_rx.recv().await
    }

    /// Replace the handler for subsequent control requests.
    pub async fn on_control_request(&self, handler: Arc<dyn ControlHandler>) {
        *self.shared.handler.write().await = Some(handler);
    }

    /// The agent's session id, once its `system` frame has been seen.
    pub async fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().await.clone()
    }

    /// Write one raw NDJSON line to the agent.
    pub async fn send_line(&self, line: String) -> Result<(), TransportError> {
        self.shared.send(line).await
    }

    /// Abandon a control request: tell the agent and cancel the local handler.
    pub async fn send_cancel(&self, control_request_id: &str) -> Result<(), TransportError> {
        self.shared.cancel_inflight(control_request_id).await;
        self.shared
            .send(ndjson::cancel_request(control_request_id))
            .await
    }

    /// Ask the agent to stop the current turn and wait for its acknowledgement.
    pub async fn interrupt(&self) -> Result<(), TransportError> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        self.shared
            .outgoing
            .lock()
            .await
            .insert(request_id.clone(), tx);

        if let Err(e) = self
            .shared
            .send(ndjson::interrupt_request(&request_id))
            .await
        {
            self.shared.outgoing.lock().await.remove(&request_id);
            return Err(e);
        }
        info!(request_id = %request_id, "Interrupt sent");

        match tokio::time::timeout(self.control_timeout, rx).await {
            Ok(Ok(response)) => match response.outcome {
                ControlOutcome::Success(_) => Ok(()),
                ControlOutcome::Error(message) => Err(TransportError::ControlFailed(message)),
            },
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.outgoing.lock().await.remove(&request_id);
                Err(TransportError::ControlTimeout { request_id })
            }
        }
    }

    /// Stop the agent and release both streams. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.cancel();
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            launcher::terminate(&mut child, self.terminate_timeout).await;
        }
        info!("Transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Shared {
    async fn send(&self, line: String) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.writer_tx
            .send(line)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn scope(&self) -> String {
        if let Some(scope) = &self.scope_id {
            return scope.clone();
        }
        self.session_id
            .read()
            .await
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
    }

    async fn cancel_inflight(&self, control_request_id: &str) {
        if let Some(token) = self.inflight.lock().await.remove(control_request_id) {
            debug!(control_request_id, "Cancelling in-flight control request");
            token.cancel();
        }
    }

    async fn complete_outgoing(&self, response: ControlResponse) {
        let waiter = self.outgoing.lock().await.remove(&response.request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(request_id = %response.request_id, "Unmatched control response"),
        }
    }

    async fn dispatch(self: &Arc<Self>, request: ControlRequest) {
        let wire_id = request.request_id;
        let (tool_name, input) = match request.request {
            ControlRequestType::CanUseTool { tool_name, input } => (tool_name, input),
            other => {
                let subtype = other.subtype().to_string();
                warn!(request_id = %wire_id, subtype = %subtype, "Unsupported control request");
                let line = ndjson::control_error(
                    &wire_id,
                    &format!("Unsupported control request subtype: {subtype}"),
                );
                if let Err(e) = self.send(line).await {
                    warn!(request_id = %wire_id, error = %e, "Failed to answer control request");
                }
                return;
            }
        };

        let permission = PermissionRequest::new(self.scope().await, tool_name, input)
            .with_control_request_id(wire_id.clone())
            .with_agent_type(self.agent_type.clone());
        let token = self.shutdown.child_token();
        self.inflight
            .lock()
            .await
            .insert(wire_id.clone(), token.clone());
        let handler = self.handler.read().await.clone();

        info!(
            request_id = %permission.request_id,
            control_request_id = %wire_id,
            tool_name = %permission.tool_name,
            scope_id = %permission.scope_id,
            "Permission request received"
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let input = permission.input.clone();
            // The handler runs on its own task so a panic still gets a reply.
            let decision = tokio::spawn(async move {
                match handler {
                    Some(handler) => handler.handle_permission(token, permission).await,
                    None => PermissionResult::deny(NO_HANDLER_REASON),
                }
            })
            .await;
            let result = decision.unwrap_or_else(|e| {
                error!(control_request_id = %wire_id, error = %e, "Permission handler failed");
                PermissionResult::deny(HANDLER_FAILED_REASON)
            });
            shared.inflight.lock().await.remove(&wire_id);

            let line = if result.approved {
                ndjson::permission_allow(&wire_id, &input)
            } else {
                ndjson::permission_deny(&wire_id, &result.reason)
            };
            debug!(control_request_id = %wire_id, approved = result.approved, "Sending control response");
            // Responses still go out after cancellation; the writer drains
            // until it observes shutdown.
            if shared.writer_tx.send(line).await.is_err() {
                warn!(control_request_id = %wire_id, "Writer gone, control response dropped");
            }
        });
    }

    async fn finish(&self) {
        let inflight: Vec<CancellationToken> =
            self.inflight.lock().await.drain().map(|(_, t)| t).collect();
        for token in inflight {
            token.cancel();
        }
        // Dropping the senders wakes outgoing waiters with a closed error.
        self.outgoing.lock().await.clear();
    }
}

async fn read_loop<R>(reader: R, shared: Arc<Shared>, frames_tx: mpsc::Sender<Frame>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Agent output ended");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read agent output");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > shared.max_frame_bytes {
            warn!(
                len = trimmed.len(),
                max = shared.max_frame_bytes,
                "Skipping oversized frame"
            );
            continue;
        }

        let frame = match ndjson::decode(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Skipping malformed frame");
                continue;
            }
        };

        match frame {
            Frame::ControlRequest(request) => shared.dispatch(request).await,
            Frame::ControlResponse(response) => shared.complete_outgoing(response).await,
            Frame::ControlCancelRequest(cancel) => {
                shared.cancel_inflight(&cancel.request_id).await;
            }
            frame => {
                if let Frame::System(init) = &frame {
                    if !init.session_id.is_empty() {
                        info!(session_id = %init.session_id, model = %init.model, "Agent session started");
                        *shared.session_id.write().await = Some(init.session_id.clone());
                    }
                }
                debug!(frame_type = frame.frame_type(), "Frame received");
                if frames_tx.send(frame).await.is_err() {
                    debug!("Frame consumer gone");
                    break;
                }
            }
        }
    }
    shared.finish().await;
}

async fn write_loop<W>(writer: W, mut rx: mpsc::Receiver<String>, shutdown: CancellationToken)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = writer;
    loop {
        let line = tokio::select! {
            biased;
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
            () = shutdown.cancelled() => break,
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!("Failed to write to agent stdin: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            error!("Failed to write newline: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush agent stdin: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("Writer finished");
}

async fn pump_prompt(prompt: PromptSource, tx: mpsc::Sender<String>, shutdown: CancellationToken) {
    match prompt {
        PromptSource::Empty => {}
        PromptSource::Text(text) => {
            let _ = tx.send(ndjson::user_message(&text)).await;
        }
        PromptSource::Frames(frames) => {
            for frame in frames {
                if tx.send(frame.to_string()).await.is_err() {
                    break;
                }
            }
        }
        PromptSource::Channel(mut rx) => loop {
            let frame = tokio::select! {
                () = shutdown.cancelled() => break,
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            if tx.send(frame.to_string()).await.is_err() {
                break;
            }
        },
    }
}
