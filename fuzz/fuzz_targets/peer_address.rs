//! Fuzz test for Bluetooth address parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use obex_core::PeerAddress;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(addr) = s.parse::<PeerAddress>() {
            let shown = addr.to_string();
            assert_eq!(shown.parse::<PeerAddress>(), Ok(addr));
        }
    }
});
