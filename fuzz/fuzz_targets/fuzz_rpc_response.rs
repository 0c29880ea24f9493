#![no_main]

use libfuzzer_sys::fuzz_target;
use skyctl::plugins::PluginMetadata;
use skyctl::rpc::decode_response;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        let _ = decode_response::<PluginMetadata>(line, 1);
        let _ = decode_response::<serde_json::Value>(line, 0);
    }
});
