//! Connection and server lifecycle state

pub mod state;

pub use state::{ConnectionState, ServerState, StateCell};
