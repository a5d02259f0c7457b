//! Fuzz target for the SQL subset parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_query_parser
//!
//! Query text comes straight from clients; malformed SQL must surface as a
//! syntax error.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(sql) = std::str::from_utf8(data) {
        if let Ok(select) = sosd_core::query::parser::parse(sql) {
            let _ = select.to_string();
        }
    }
});
