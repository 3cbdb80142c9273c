//! NDJSON codec for the agent stream-json protocol.
//!
//! This module decodes newline-delimited JSON from the agent's stdout into
//! typed frames and encodes frames (and control responses) for its stdin.

mod encoder;
mod parser;
mod types;

pub use encoder::{
    cancel_request, control_error, encode, interrupt_request, permission_allow, permission_deny,
    to_value, user_message,
};
pub use parser::{decode, decode_value};
pub use types::*;
