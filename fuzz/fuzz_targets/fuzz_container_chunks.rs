// Run locally (from the repo root):
//   cargo +nightly fuzz run fuzz_container_chunks -- -runs=10000
#![no_main]

use libfuzzer_sys::fuzz_target;
use quarry_index::{StringExternalizer, ValueContainerImpl};

fuzz_target!(|data: &[u8]| {
    // Oracle: replaying arbitrary bytes as a persisted chunk chain must never panic.
    // Errors are expected; they are what the corruption-recovery path consumes.
    let _ = ValueContainerImpl::<String>::from_chunks(&[data.to_vec()], &StringExternalizer);

    // Split inputs are also valid chunk chains.
    if data.len() >= 2 {
        let (a, b) = data.split_at(data.len() / 2);
        let _ = ValueContainerImpl::<String>::from_chunks(
            &[a.to_vec(), b.to_vec()],
            &StringExternalizer,
        );
    }
});
