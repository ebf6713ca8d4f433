//! Fuzz test for suspend record decoding
//!
//! Records come back from the storage provider verbatim; a corrupt blob
//! must be rejected, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use obex_core::SuspendRecord;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = SuspendRecord::decode(data) {
        // Anything that decodes must encode again
        let encoded = record.encode().expect("decoded record encodes");
        assert_eq!(SuspendRecord::decode(&encoded).ok(), Some(record));
    }
});
