//! Fuzz target for the prefix parser.
//!
//! The parser must never panic, and every accepted prefix must satisfy
//! the documented invariants.

#![no_main]

use consul_replicate::PrefixConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(prefix) = PrefixConfig::parse(data) {
        // Invariants of an accepted prefix.
        assert!(!prefix.source.is_empty());
        assert!(!prefix.source.contains('@'));
        assert!(!prefix.source.contains(':'));
        assert!(!prefix.datacenter.is_empty());
        assert!(!prefix.destination.is_empty());

        // The rewrite helpers must not panic on accepted prefixes.
        let _ = prefix.dependency_id();
        let _ = prefix.destination_key(&prefix.source);
        let _ = prefix.source_key(&prefix.destination);
    }
});
