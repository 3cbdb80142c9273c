//! Query facade: one agent session wired to an approval source.

mod facade;

pub use facade::{Gateway, Query, QueryOptions};
