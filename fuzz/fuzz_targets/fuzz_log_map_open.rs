// Run locally (from the repo root):
//   cargo +nightly fuzz run fuzz_log_map_open -- -runs=10000
#![no_main]

use std::io::Write;

use libfuzzer_sys::fuzz_target;
use quarry_storage::PersistentLogMap;

fuzz_target!(|data: &[u8]| {
    // Oracle: opening a log file with arbitrary contents must never panic. Bad headers
    // and garbage records surface as corruption errors; torn tails are truncated and the
    // map opens.
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join("fuzz.qlm");
    {
        let mut file = std::fs::File::create(&path).expect("create log file");
        file.write_all(data).expect("write fuzz input");
    }

    if let Ok(mut map) = PersistentLogMap::open(&path) {
        // Whatever survived the scan must be readable.
        let mut keys = Vec::new();
        map.for_each_key(|key| {
            keys.push(key.to_vec());
            true
        });
        for key in keys {
            let _ = map.read_chunks(&key);
        }
    }
});
