#![deny(unsafe_code)]

//! Shared test utilities for the sosd workspace.
//!
//! Provides config builders, a disposable in-process daemon, and tracing
//! helpers so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! sosd-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use daemon::TestDaemon;
pub use tracing_setup::{capture_logs, init_test_tracing};
