//! Fuzz target for error classification and status parsing.
//!
//! Tests that HTTP status classification is total and that parsing
//! stored operation/status strings never panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sync_queue::{ExternalError, ItemStatus, Operation};

fuzz_target!(|data: (u16, &str)| {
    let (status, text) = data;

    let error = ExternalError::from_status(status, text);
    assert!(error.message().starts_with("HTTP "));
    if (500..600).contains(&status) {
        assert!(error.is_transient());
    }

    if let Ok(op) = text.parse::<Operation>() {
        assert_eq!(op.as_str(), text);
    }
    if let Ok(s) = text.parse::<ItemStatus>() {
        assert_eq!(s.as_str(), text);
    }
});
