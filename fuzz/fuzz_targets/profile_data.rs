#![no_main]
use libfuzzer_sys::fuzz_target;
use sample_profdata::sample_profile::types::SymbolMap;
use sample_profdata::sample_profile::ProfileReader;

fuzz_target!(|data: &[u8]| {
    let mut symbols = SymbolMap::new();
    let mut reader = ProfileReader::new(&mut symbols, true);
    if reader.read_bytes(data).is_err() {
        assert!(reader.summary_information().is_none());
        assert!(symbols.is_empty());
    }
});
