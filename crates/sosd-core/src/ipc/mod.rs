//! Admin control plane: HTTP/JSON over a Unix domain socket.
//!
//! ```text
//! ┌──────────┐         Unix socket        ┌──────────────┐
//! │ sosd CLI │───────────────────────────▶│  IPC Server  │
//! │          │  HTTP/1.1 + JSON           │  (axum)      │
//! └──────────┘                            └──────┬───────┘
//!                                                │
//!                                         ┌──────▼───────┐
//!                                         │  SosContext  │
//!                                         └──────────────┘
//! ```
//!
//! The data plane (publish, query) stays on the TCP wire protocol; this
//! socket is for operators only.

pub mod client;
pub mod server;
pub mod types;

pub use client::{IpcClient, IpcClientError};
pub use server::{DEFAULT_SOCKET_PATH, IpcState};
pub use types::*;
