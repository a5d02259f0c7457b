#![deny(unsafe_code)]

//! SOS core daemon runtime.
//!
//! Ingests telemetry published by instrumented programs, keeps it in a
//! snapshot-readable value store backed by a write-ahead log, and answers
//! SQL queries over it. Clients speak a length-prefixed frame protocol over
//! TCP; operators use an HTTP/JSON admin socket.
//!
//! ```text
//!  client ──TCP frames──▶ listener ──▶ ingest ──▶ registry ──▶ store (WAL)
//!                             │                                   ▲
//!                             ├──▶ query engine ── snapshot ──────┘
//!                             └──▶ feedback hub ──▶ sensitive clients
//! ```

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Shared daemon state and lifecycle.
pub mod context;
/// Async daemon runtime: startup, housekeeping, ordered shutdown.
pub mod daemon;
/// Wire error codes.
pub mod error;
/// Trigger fan-out to sensitive clients.
pub mod feedback;
pub mod guid;
/// Publish path: pack, announce, and atomic batch commit.
pub mod ingest;
/// Admin control plane over a Unix socket.
pub mod ipc;
pub mod listener;
/// In-memory log collector for the admin API.
pub mod logging;
/// Frame codec, message bodies, and the client library.
pub mod protocol;
/// SQL parsing, execution, async jobs, pivot, and cache grab.
pub mod query;
/// Live publisher handles.
pub mod registry;
pub mod results;
pub mod stats;
/// Committed pubs, fields, and values.
pub mod store;
pub mod types;

pub use context::{Lifecycle, SosContext};
pub use daemon::{Daemon, DaemonError};
pub use error::{Coded, ErrorCode, WireError};
pub use feedback::{Feedback, FeedbackHub};
pub use guid::{GuidAllocator, GuidBlock};
pub use ingest::{IngestHandler, IngestSession, PackEntry, PublishAck};
pub use logging::{LogCollector, LogReader};
pub use protocol::{ClientError, SosClient};
pub use query::{QueryEngine, QueryError};
pub use registry::{AnnounceRequest, PublisherRegistry};
pub use results::ResultSet;
pub use store::{StoreError, ValueStore};
pub use types::{Guid, PubInfo, ValType, Value};
