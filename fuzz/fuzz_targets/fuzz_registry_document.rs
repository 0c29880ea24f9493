#![no_main]

use libfuzzer_sys::fuzz_target;
use skyctl::registry::PluginRegistry;
use std::io::Write;

fuzz_target!(|data: &[u8]| {
    let Ok(mut file) = tempfile::NamedTempFile::new() else {
        return;
    };
    if file.write_all(data).is_err() {
        return;
    }
    // Must return an error for bad documents, never panic
    if let Ok(registry) = PluginRegistry::load(file.path()) {
        for (name, entry) in registry.entries() {
            assert_eq!(name, entry.metadata.name);
        }
    }
});
