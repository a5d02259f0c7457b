//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text to `AppConfig::parse()`; parsing and validation must
//! reject bad input with an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = sosd_config::AppConfig::parse(s) {
            // Anything accepted must re-validate and yield a WAL path.
            assert!(config.validate().is_ok());
            let _ = config.wal_path();
        }
    }
});
