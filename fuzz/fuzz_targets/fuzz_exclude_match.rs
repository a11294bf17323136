//! Fuzz target for exclude matching.
//!
//! Matching must never panic on arbitrary keys, and the write/delete
//! sides must agree for keys produced by the prefix rewrite.

#![no_main]

use consul_replicate::config::ExcludeConfig;
use consul_replicate::{ExcludeFilter, PrefixConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str, &str)| {
    let (exclude, path, prefix_spec) = data;

    let Ok(exclude) = ExcludeConfig::parse(exclude) else {
        return;
    };
    let filter = ExcludeFilter::new(&[exclude]);

    // Matching never panics, whatever the path looks like.
    let _ = filter.matches_source(path);

    if let Ok(prefix) = PrefixConfig::parse(prefix_spec) {
        let _ = filter.matches_destination(path, &prefix);

        // A path excluded on the write side stays excluded on the delete
        // side after the destination rewrite, provided the rewrite is
        // reversible for this path (ambiguous rewrites are allowed to
        // disagree).
        let dest = prefix.destination_key(path);
        if filter.matches_source(path).is_some() && prefix.source_key(&dest) == path {
            assert!(filter.matches_destination(&dest, &prefix).is_some());
        }
    }
});
