//! Toolgate Daemon Library
//!
//! Runs agent subprocesses and answers their tool permission requests:
//! - Permission broker with per-scope modes, remembered decisions and manual waits
//! - Stream transport over the agent's stdio (NDJSON, control protocol)
//! - Query facade binding a transport to an approval source

pub mod permission;
pub mod query;
pub mod subprocess;

pub use permission::{PermissionBroker, PermissionRequest, PermissionResult};
pub use query::{Gateway, Query, QueryOptions};
pub use subprocess::{PromptSource, Transport, TransportOptions};
