//! Fuzz target for batch document parsing.
//!
//! Upload bodies come straight off the network, so the parser must reject
//! arbitrary input with an error and never panic. Accepted documents must
//! also survive a serialize/parse round trip unchanged.

#![no_main]

use fm_core::batch::parse_batch;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let first = parse_batch(data);
    assert_eq!(first, parse_batch(data), "parser verdict must be deterministic");

    if let Ok(batch) = first {
        let raw = serde_json::to_vec(&batch).expect("batch serializes");
        assert_eq!(parse_batch(&raw).as_ref(), Ok(&batch));
    }
});
