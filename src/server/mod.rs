//! WebSocket broadcast server
//!
//! Accepts many clients, delivers their records to a [`ServerHandler`], and
//! fans records out to all of them.

pub mod config;
pub(crate) mod connection;
pub mod handler;
pub mod listener;

pub use config::ServerConfig;
pub use handler::{ClientContext, NullHandler, ServerHandler};
pub use listener::{BroadcastServer, WeakServer};
