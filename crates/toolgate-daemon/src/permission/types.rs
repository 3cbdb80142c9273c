//! Permission broker types.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of agent subprocess a request came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentType(String);

impl AgentType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentType {
    fn default() -> Self {
        Self("claude".to_string())
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tool invocation the agent wants approved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionRequest {
    /// Process-unique id, used to submit decisions.
    pub request_id: String,
    /// Session or conversation the request belongs to.
    pub scope_id: String,
    pub agent_type: AgentType,
    pub tool_name: String,
    pub input: Value,
    /// The agent's own id for the control request carrying this ask.
    pub control_request_id: String,
    pub timestamp: SystemTime,
}

impl PermissionRequest {
    /// Build a request with a fresh UUID.
    pub fn new(scope_id: impl Into<String>, tool_name: impl Into<String>, input: Value) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        Self {
            control_request_id: request_id.clone(),
            request_id,
            scope_id: scope_id.into(),
            agent_type: AgentType::default(),
            tool_name: tool_name.into(),
            input,
            timestamp: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn with_control_request_id(mut self, control_request_id: impl Into<String>) -> Self {
        self.control_request_id = control_request_id.into();
        self
    }

    #[must_use]
    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = agent_type;
        self
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionResult {
    pub approved: bool,
    pub reason: String,
}

impl PermissionResult {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

/// A decision submitted for a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionResponse {
    pub request_id: String,
    pub approved: bool,
    pub reason: String,
    pub timestamp: SystemTime,
}

impl PermissionResponse {
    pub fn new(request_id: impl Into<String>, approved: bool, reason: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved,
            reason: reason.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn to_result(&self) -> PermissionResult {
        PermissionResult {
            approved: self.approved,
            reason: self.reason.clone(),
        }
    }
}

/// Permission broker errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    #[error("unknown permission mode: {mode}")]
    UnknownMode { mode: String },

    #[error("permission request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("permission request already pending: {request_id}")]
    DuplicateRequest { request_id: String },

    #[error("context cancelled")]
    Cancelled,
}

impl PermissionError {
    /// The deny sent to the agent when a check fails with this error.
    pub fn fallback_result(&self) -> PermissionResult {
        PermissionResult::deny(self.to_string())
    }
}
