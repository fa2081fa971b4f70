//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text to `AppConfig::parse()`. Any config that parses must
//! also satisfy the budget rule the client relies on.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = threadline_config::AppConfig::parse(s) {
            assert!((config.llm.max_tokens as usize) < config.conversation.max_context_length);
            assert!(config.conversation.max_turns > 0);
        }
    }
});
