//! Fuzz target for status record decoding.
//!
//! Status documents come back from the KV store as arbitrary bytes;
//! decoding must never panic, and any successfully decoded document must
//! re-encode.

#![no_main]

use consul_replicate::Status;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(status) = serde_json::from_slice::<Status>(data) {
        let encoded = serde_json::to_vec_pretty(&status).expect("re-encode");
        let decoded: Status = serde_json::from_slice(&encoded).expect("roundtrip");
        assert_eq!(decoded, status);
    }
});
