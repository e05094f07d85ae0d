#![no_main]
use libfuzzer_sys::fuzz_target;
use poolfs::core::wal::{parse_log, ParsedLog};

// Arbitrary log bytes must parse or be rejected, never panic
fuzz_target!(|data: &[u8]| {
    if let ParsedLog::Valid {
        entries, valid_len, ..
    } = parse_log(data)
    {
        assert!(valid_len as usize <= data.len());

        // The accepted prefix parses to the same entries with nothing torn
        match parse_log(&data[..valid_len as usize]) {
            ParsedLog::Valid {
                entries: again,
                torn,
                ..
            } => {
                assert!(!torn);
                assert_eq!(again, entries);
            }
            _ => panic!("accepted prefix no longer parses"),
        }
    }
});
