#![no_main]

use libfuzzer_sys::fuzz_target;
use skyctl::rpc::parse_handshake;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        // Anything accepted must be a loopback address
        if let Ok(addr) = parse_handshake(line) {
            assert!(addr.ip().is_loopback());
        }
    }
});
