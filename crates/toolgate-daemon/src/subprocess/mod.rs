//! Agent subprocess launch and the duplex NDJSON transport over its stdio.

mod launcher;
mod transport;

pub use launcher::{LaunchOptions, SpawnedAgent, spawn, terminate};
pub use transport::{
    ControlHandler, DEFAULT_SCOPE, PromptSource, Transport, TransportError, TransportOptions,
};
