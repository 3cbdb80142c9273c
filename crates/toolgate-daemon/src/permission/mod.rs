//! Permission broker and approval sources.
//!
//! Decides whether the agent may invoke a tool: policy lists, per-scope modes,
//! remembered decisions, and manual waits with timeout and cancellation.

mod approval;
mod audit;
mod broker;
mod cache;
mod pending;
mod types;

pub use approval::{
    ApprovalError, ApprovalSource, DenyAll, FnApproval, PromptApproval, PromptError, UserPrompter,
};
pub use audit::{AuditError, AuditSink, TracingAudit, spawn_record};
pub use broker::{BrokerConfig, PermissionBroker};
pub use cache::{DecisionCache, DecisionKey};
pub use pending::{PendingRequest, PendingTable};
pub use types::{
    AgentType, PermissionError, PermissionRequest, PermissionResponse, PermissionResult,
};
