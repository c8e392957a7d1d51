//! Fuzz target for config.toml parsing and validation.

#![no_main]

use fm_core::config::{parse_config, validate_config};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = parse_config(text) {
        let _ = validate_config(&config);
    }
});
