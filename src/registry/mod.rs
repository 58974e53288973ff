//! Client registry for broadcast fan-out
//!
//! The registry tracks every client connected to a broadcast server and fans
//! serialized records out to them.
//!
//! # Architecture
//!
//! ```text
//!                       Arc<ClientRegistry>
//!                  ┌──────────────────────────┐
//!                  │ clients: HashMap<Id,     │
//!                  │   Arc<ClientHandle> {    │
//!                  │     tx: mpsc::Sender,    │
//!                  │     closed: watch,       │
//!                  │   }                      │
//!                  │ >                        │
//!                  └────────────┬─────────────┘
//!                               │ broadcast(): snapshot, unlock, try_send
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!     [writer task]        [writer task]        [writer task]
//!     rx.recv()            rx.recv()            rx.recv()
//!          │                    │                    │
//!          └──► WebSocket ──────┴──► WebSocket ──────┴──► WebSocket
//! ```
//!
//! # Shared Payloads
//!
//! A record is serialized once into `bytes::Bytes`; each queue gets a
//! reference-counted clone, so fan-out itself never copies. Each writer task
//! then copies the payload once into its own text frame, because the
//! WebSocket message type owns its text.

pub mod entry;
pub mod error;
pub mod store;

pub use entry::{ClientHandle, ClientInfo, ConnectionId};
pub use error::RegistryError;
pub use store::{BroadcastReport, ClientRegistry};
