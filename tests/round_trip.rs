use pretty_assertions::assert_eq;
use sample_profdata::sample_profile::binary_profile::*;
use sample_profdata::sample_profile::binary_writer::BinaryProfWriter;
use sample_profdata::sample_profile::text_profile::TextProfWriter;
use sample_profdata::sample_profile::types::*;
use sample_profdata::sample_profile::*;
use sample_profdata::summary::*;
use sample_profdata::*;
use std::fs;

fn frame(name: &str, line: u32) -> SourceInfo {
    SourceInfo::new(name, line)
}

fn foo_boo_symbols() -> SymbolMap {
    let mut map = SymbolMap::new();
    map.add_symbol("foo");
    map.add_symbol_entry_count("foo", 200, Operation::Sum);
    let stack = vec![
        frame("qux", 10),
        frame("baz", 20),
        frame("bar", 25),
        frame("foo", 50),
    ];
    map.add_source_count("foo", &stack, 300, Operation::Max);
    let stack = vec![frame("baz", 30), frame("bar", 25), frame("foo", 50)];
    map.add_source_count("foo", &stack, 0, Operation::Max);
    map.add_source_count("foo", &[frame("foo", 55)], 450, Operation::Max);

    map.add_symbol("boo");
    map.add_symbol_entry_count("boo", 300, Operation::Sum);
    let stack = vec![
        frame("dux", 10),
        frame("daz", 20),
        frame("dar", 25),
        frame("boo", 50),
    ];
    map.add_source_count("boo", &stack, 100, Operation::Max);
    let stack = vec![frame("daz", 30), frame("dar", 25), frame("boo", 50)];
    map.add_source_count("boo", &stack, 0, Operation::Max);
    map.add_source_count("boo", &[frame("boo", 55)], 150, Operation::Max);
    map.add_indirect_call_target("boo", &[frame("boo", 60)], "virtual_call", 12);
    map
}

fn encode(symbols: &SymbolMap, writer: BinaryProfWriter) -> Vec<u8> {
    let mut data = vec![];
    writer.write(symbols, &mut data).unwrap();
    data
}

#[test]
fn every_version_round_trips() {
    let symbols = foo_boo_symbols();
    let expected = ProfileSummary::compute(&symbols, &DEFAULT_CUTOFFS).unwrap();
    for version in FormatVersion::all().iter() {
        for compress in [false, true].iter() {
            let writer = BinaryProfWriter::new(*version).with_compressed_names(*compress);
            let data = encode(&symbols, writer);

            let profile = parse_bytes(&data).unwrap();
            assert_eq!(profile.format, Some(ProfileFormat::Binary));
            assert_eq!(profile.version, Some(u64::from(*version)));
            assert_eq!(profile.summary.as_ref(), Some(&expected));
            assert_eq!(profile.symbols, symbols);

            let mut store = SymbolMap::new();
            let mut reader = ProfileReader::new(&mut store, false);
            assert_eq!(reader.summary_information(), None);
            reader.read_bytes(&data).unwrap();
            assert_eq!(reader.summary_information(), Some(&expected));
            assert_eq!(reader.version(), Some(u64::from(*version)));
            assert_eq!(store, symbols);
        }
    }
}

#[test]
fn compressed_names_are_smaller() {
    let mut symbols = SymbolMap::new();
    for i in 0..100 {
        let name = format!("a_rather_long_and_repetitive_function_name_{}", i);
        symbols.add_symbol(&name);
        symbols.add_source_count(&name, &[frame(&name, 1)], i, Operation::Sum);
    }
    let plain = encode(&symbols, BinaryProfWriter::new(FormatVersion::Compact));
    let compressed = encode(
        &symbols,
        BinaryProfWriter::new(FormatVersion::Compact).with_compressed_names(true),
    );
    assert!(compressed.len() < plain.len());
    assert_eq!(parse_bytes(&compressed).unwrap().symbols, symbols);
}

#[test]
fn summary_section_is_optional() {
    let symbols = foo_boo_symbols();
    for version in FormatVersion::all().iter() {
        let data = encode(&symbols, BinaryProfWriter::new(*version).with_summary(false));
        let mut store = SymbolMap::new();
        let mut reader = ProfileReader::new(&mut store, false);
        reader.read_bytes(&data).unwrap();
        assert_eq!(reader.summary_information(), None);
        assert_eq!(store, symbols);

        let profile = parse_bytes(&data).unwrap();
        assert_eq!(profile.summary, None);
        let computed = profile.summary_or_compute().unwrap();
        assert_eq!(computed.total_count, 1000);
    }
}

#[test]
fn empty_store_round_trips() {
    let symbols = SymbolMap::new();
    for version in FormatVersion::all().iter() {
        let data = encode(&symbols, BinaryProfWriter::new(*version));
        let profile = parse_bytes(&data).unwrap();
        let summary = profile.summary.unwrap();
        assert_eq!(summary.total_count, 0);
        assert_eq!(summary.num_functions, 0);
        assert_eq!(summary.detailed_summaries.len(), DEFAULT_CUTOFFS.len());
        assert!(summary
            .detailed_summaries
            .iter()
            .all(|x| x.min_count == 0 && x.num_counts == 0));
        assert!(profile.symbols.is_empty());
    }
}

#[test]
fn malformed_input_leaves_store_untouched() {
    let symbols = foo_boo_symbols();
    let mut existing = SymbolMap::new();
    existing.add_symbol("existing");
    existing.add_symbol_entry_count("existing", 5, Operation::Sum);

    for version in FormatVersion::all().iter() {
        let data = encode(&symbols, BinaryProfWriter::new(*version));
        // Every strict prefix is truncated somewhere
        for len in 0..data.len() {
            let mut store = existing.clone();
            let mut reader = ProfileReader::new(&mut store, true);
            assert!(
                reader.read_bytes(&data[..len]).is_err(),
                "version {} accepted {} of {} bytes",
                version,
                len,
                data.len()
            );
            assert_eq!(reader.summary_information(), None);
            assert_eq!(store, existing);
        }
        let mut trailing = data.clone();
        trailing.push(0);
        assert!(matches!(
            parse_bytes(&trailing),
            Err(ProfileError::Malformed(_))
        ));
    }
}

#[test]
fn bad_magic_and_version() {
    let data = encode(&foo_boo_symbols(), BinaryProfWriter::default());

    let mut bad_magic = data.clone();
    bad_magic[0] = 0xfe;
    assert!(parse_bytes(&bad_magic).is_err());

    let mut bad_version = data;
    bad_version[MAGIC.len()..MAGIC.len() + 8].copy_from_slice(&42u64.to_le_bytes());
    assert!(matches!(
        parse_bytes(&bad_version),
        Err(ProfileError::UnsupportedVersion(42))
    ));
}

#[test]
fn force_update_controls_existing_functions() {
    let mut incoming = SymbolMap::new();
    incoming.add_symbol("foo");
    incoming.add_symbol_entry_count("foo", 10, Operation::Sum);
    incoming.add_symbol("bar");
    let data = encode(&incoming, BinaryProfWriter::default());

    let mut store = SymbolMap::new();
    store.add_symbol("foo");
    store.add_symbol_entry_count("foo", 99, Operation::Sum);

    let mut kept = store.clone();
    ProfileReader::new(&mut kept, false)
        .read_bytes(&data)
        .unwrap();
    assert_eq!(kept.get("foo").unwrap().head_count, 99);
    assert!(kept.contains("bar"));

    let mut replaced = store;
    let mut reader = ProfileReader::new(&mut replaced, true);
    reader.read_bytes(&data).unwrap();
    let summary = reader.summary_information().cloned();
    assert_eq!(replaced.get("foo").unwrap().head_count, 10);
    assert!(replaced.contains("bar"));
    // The summary describes the file, not the store it was read into
    assert_eq!(summary.map(|x| x.max_function_count), Some(10));
}

#[test]
fn write_to_file_is_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let symbols = foo_boo_symbols();

    let path = dir.path().join("out.prof");
    BinaryProfWriter::default()
        .write_to_file(&symbols, &path)
        .unwrap();
    let mut store = SymbolMap::new();
    let mut reader = ProfileReader::new(&mut store, false);
    reader.read_from_file(&path).unwrap();
    assert!(reader.summary_information().is_some());
    assert_eq!(store, symbols);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

    // The summary can't be computed so the write fails after the temporary file is created
    let mut too_big = SymbolMap::new();
    too_big.add_symbol("huge");
    too_big.add_source_count("huge", &[frame("huge", 1)], u64::MAX, Operation::Sum);
    too_big.add_source_count("huge", &[frame("huge", 2)], 1, Operation::Sum);
    let failed = dir.path().join("failed.prof");
    let res = BinaryProfWriter::default().write_to_file(&too_big, &failed);
    assert!(matches!(
        res,
        Err(ProfileError::Summary(SummaryError::CountOverflow))
    ));
    assert!(!failed.exists());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

    // And the existing file is left alone
    let res = BinaryProfWriter::default().write_to_file(&too_big, &path);
    assert!(res.is_err());
    assert_eq!(parse(&path).unwrap().symbols, symbols);

    let missing = dir.path().join("no_such_dir").join("out.prof");
    assert!(BinaryProfWriter::default()
        .write_to_file(&symbols, &missing)
        .is_err());
    assert!(!missing.exists());
}

#[test]
fn text_round_trip() {
    let mut symbols = foo_boo_symbols();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    TextProfWriter::new().write_to_file(&symbols, &path).unwrap();

    let profile = parse(&path).unwrap();
    assert_eq!(profile.format, Some(ProfileFormat::Text));
    assert_eq!(profile.summary, None);

    // Text profiles don't keep instruction counts or source files
    let computed = profile.summary_or_compute().unwrap().into_owned();
    assert_eq!(
        computed,
        ProfileSummary::compute(&symbols, &DEFAULT_CUTOFFS).unwrap()
    );
    assert_eq!(profile.symbols.len(), symbols.len());
    symbols.merge(&profile.symbols, Operation::Max);
    assert_eq!(
        ProfileSummary::compute(&symbols, &DEFAULT_CUTOFFS).unwrap(),
        computed
    );
}

#[test]
fn deepest_inlining_round_trips() {
    let mut stack = (0..MAX_INLINE_DEPTH)
        .map(|i| frame(&format!("inlined_{}", i), i as u32 + 1))
        .collect::<Vec<_>>();
    stack.push(frame("f", 1));
    let mut symbols = SymbolMap::new();
    symbols.add_symbol("f");
    assert!(symbols.add_source_count("f", &stack, 5, Operation::Sum));

    for version in FormatVersion::all().iter() {
        let data = encode(&symbols, BinaryProfWriter::new(*version));
        let profile = parse_bytes(&data).unwrap();
        assert_eq!(profile.symbols, symbols);
        assert_eq!(profile.summary.map(|x| x.total_count), Some(5));
    }
    let mut text = vec![];
    TextProfWriter::new().write(&symbols, &mut text).unwrap();
    assert_eq!(parse_bytes(&text).unwrap().symbols, symbols);

    // One more frame is refused rather than producing a profile nothing can read
    stack.insert(0, frame("one_too_many", 1));
    assert!(!symbols.add_source_count("f", &stack, 5, Operation::Sum));
    assert_eq!(symbols.get("f").unwrap().inline_depth(), MAX_INLINE_DEPTH);
}
