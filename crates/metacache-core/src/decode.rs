//! Metadata log decoding.
//!
//! A metadata log holds one entry per line. Each entry starts with a
//! timestamp and continues with field names, each followed by value
//! operations:
//!
//! ```text
//! 1507541153.566038914s artist +Alpha genre +Dark +Ambient
//! 1507541200s genre -Dark comment +!aGVsbG8gd29ybGQ=
//! ```
//!
//! `+value` adds a value to the field's set and `-value` removes it. Values
//! that can't be written as a single whitespace-free token are encoded as
//! `!` followed by base64.
//!
//! Decoding sorts entries by timestamp (keeping input order for ties) and
//! folds their operations over per-field value sets. Malformed entries are
//! skipped as a whole and reported as [`DecodeWarning`]s.

use crate::error::DecodeWarning;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::{BTreeMap, BTreeSet};

/// Marks a base64-encoded value token.
pub const ENCODED_SIGIL: char = '!';

/// Entry timestamp with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    /// Parse `1000`, `1000s` or `1507541153.566038914s`.
    pub fn parse(token: &str) -> Option<Timestamp> {
        let token = token.strip_suffix('s').unwrap_or(token);
        let (secs, frac) = match token.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (token, ""),
        };

        if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let secs = secs.parse::<u64>().ok()?;
        let mut nanos = 0u32;
        for (i, digit) in frac.bytes().take(9).enumerate() {
            nanos += u32::from(digit - b'0') * 10u32.pow(8 - i as u32);
        }

        Some(Timestamp { secs, nanos })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ValueOp {
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone)]
struct FieldOps {
    field: String,
    ops: Vec<ValueOp>,
}

#[derive(Debug, Clone)]
struct Entry {
    timestamp: Timestamp,
    fields: Vec<FieldOps>,
}

/// The current state of one item's metadata after replaying its log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedLog {
    /// Field name (lowercased) to surviving values. A field that appeared in
    /// the log but has no surviving values maps to an empty set.
    pub fields: BTreeMap<String, BTreeSet<String>>,

    /// Entries that were skipped
    pub warnings: Vec<DecodeWarning>,
}

impl DecodedLog {
    /// Surviving values of a field, if it ever appeared
    pub fn values(&self, field: &str) -> Option<&BTreeSet<String>> {
        self.fields.get(field)
    }

    /// True if the field appeared in the log but every value was removed
    pub fn is_present_but_empty(&self, field: &str) -> bool {
        self.fields.get(field).map_or(false, BTreeSet::is_empty)
    }
}

/// Decode a raw metadata log into its current field-to-values state.
pub fn decode_log(content: &str) -> DecodedLog {
    let mut warnings = Vec::new();
    let mut entries = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_entry(idx + 1, line) {
            Ok(entry) => entries.push(entry),
            Err(warning) => warnings.push(warning),
        }
    }

    // Stable: equal timestamps keep their input order.
    entries.sort_by_key(|e| e.timestamp);

    let fields = entries.iter().fold(BTreeMap::new(), apply_entry);

    DecodedLog { fields, warnings }
}

fn apply_entry(
    mut state: BTreeMap<String, BTreeSet<String>>,
    entry: &Entry,
) -> BTreeMap<String, BTreeSet<String>> {
    for field_ops in &entry.fields {
        let values = state.entry(field_ops.field.clone()).or_default();
        for op in &field_ops.ops {
            match op {
                ValueOp::Add(v) => {
                    values.insert(v.clone());
                }
                ValueOp::Remove(v) => {
                    values.remove(v);
                }
            }
        }
    }
    state
}

fn parse_entry(line_no: usize, line: &str) -> Result<Entry, DecodeWarning> {
    let mut tokens = line.split_whitespace();

    let ts_token = tokens.next().unwrap_or_default();
    let timestamp = Timestamp::parse(ts_token).ok_or_else(|| DecodeWarning::BadTimestamp {
        line: line_no,
        token: ts_token.to_string(),
    })?;

    let mut fields: Vec<FieldOps> = Vec::new();

    for token in tokens {
        let op = if let Some(body) = token.strip_prefix('+') {
            ValueOp::Add(decode_value(line_no, token, body)?)
        } else if let Some(body) = token.strip_prefix('-') {
            ValueOp::Remove(decode_value(line_no, token, body)?)
        } else {
            fields.push(FieldOps {
                field: token.to_lowercase(),
                ops: Vec::new(),
            });
            continue;
        };

        match fields.last_mut() {
            Some(current) => current.ops.push(op),
            None => {
                return Err(DecodeWarning::OrphanValue {
                    line: line_no,
                    token: token.to_string(),
                })
            }
        }
    }

    Ok(Entry { timestamp, fields })
}

fn decode_value(line_no: usize, token: &str, body: &str) -> Result<String, DecodeWarning> {
    if body.is_empty() {
        return Err(DecodeWarning::EmptyValue {
            line: line_no,
            token: token.to_string(),
        });
    }

    let Some(encoded) = body.strip_prefix(ENCODED_SIGIL) else {
        return Ok(body.to_string());
    };

    let bad = |reason: String| DecodeWarning::BadEncoding {
        line: line_no,
        token: token.to_string(),
        reason,
    };

    let bytes = STANDARD.decode(encoded).map_err(|e| bad(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| bad(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn is_absent(decoded: &DecodedLog, field: &str) -> bool {
        !decoded.fields.contains_key(field)
    }

    /// The single surviving value of a field, if it has exactly one
    fn scalar<'a>(decoded: &'a DecodedLog, field: &str) -> Option<&'a str> {
        let values = decoded.fields.get(field)?;
        if values.len() == 1 {
            values.iter().next().map(String::as_str)
        } else {
            None
        }
    }

    /// Token body for a value, using the `!` form when it can't be written bare.
    fn encode_value(value: &str) -> String {
        let needs_encoding = value.is_empty()
            || value.starts_with(ENCODED_SIGIL)
            || value.chars().any(|c| c.is_whitespace() || c.is_control());

        if needs_encoding {
            format!("{}{}", ENCODED_SIGIL, STANDARD.encode(value.as_bytes()))
        } else {
            value.to_string()
        }
    }

    #[test]
    fn test_timestamp_parse() {
        assert_eq!(
            Timestamp::parse("1000s"),
            Some(Timestamp { secs: 1000, nanos: 0 })
        );
        assert_eq!(
            Timestamp::parse("1507541153.566038914s"),
            Some(Timestamp {
                secs: 1507541153,
                nanos: 566038914
            })
        );
        assert_eq!(
            Timestamp::parse("12.5"),
            Some(Timestamp {
                secs: 12,
                nanos: 500_000_000
            })
        );
        assert_eq!(Timestamp::parse("abc"), None);
        assert_eq!(Timestamp::parse("s"), None);
        assert_eq!(Timestamp::parse("-5s"), None);
        assert!(Timestamp::parse("10.1s") < Timestamp::parse("10.25s"));
    }

    #[test]
    fn test_add_then_remove_across_entries() {
        let log = "1000s artist +Alpha genre +Dark +Ambient\n2000s genre -Dark\n";
        let decoded = decode_log(log);

        assert!(decoded.warnings.is_empty());
        assert_eq!(decoded.values("artist"), Some(&set(&["Alpha"])));
        assert_eq!(decoded.values("genre"), Some(&set(&["Ambient"])));
    }

    #[test]
    fn test_replay_uses_timestamp_order() {
        // The removal is older than the addition, so the value survives.
        let log = "2000s genre +Dark\n1000s genre -Dark\n";
        let decoded = decode_log(log);
        assert_eq!(decoded.values("genre"), Some(&set(&["Dark"])));
    }

    #[test]
    fn test_equal_timestamps_keep_input_order() {
        let decoded = decode_log("1000s genre +Dark\n1000s genre -Dark\n");
        assert!(decoded.is_present_but_empty("genre"));

        let decoded = decode_log("1000s genre -Dark\n1000s genre +Dark\n");
        assert_eq!(decoded.values("genre"), Some(&set(&["Dark"])));
    }

    #[test]
    fn test_continuation_matches_single_replay() {
        let first = "1000s artist +Alpha genre +Dark\n1500s crate +warmup\n";
        let second = "2000s genre -Dark +Ambient\n2500s crate -warmup +peak\n";

        let combined = decode_log(&format!("{}{}", first, second));

        // Shuffled input with the same entries decodes identically.
        let shuffled = "2500s crate -warmup +peak\n1000s artist +Alpha genre +Dark\n\
                        2000s genre -Dark +Ambient\n1500s crate +warmup\n";
        assert_eq!(combined, decode_log(shuffled));

        assert_eq!(combined.values("genre"), Some(&set(&["Ambient"])));
        assert_eq!(combined.values("crate"), Some(&set(&["peak"])));
    }

    #[test]
    fn test_present_but_empty_versus_absent() {
        let decoded = decode_log("1000s crate +a\n2000s crate -a\n");

        assert!(decoded.is_present_but_empty("crate"));
        assert!(!is_absent(&decoded, "crate"));
        assert!(is_absent(&decoded, "genre"));
        assert!(!decoded.is_present_but_empty("genre"));
    }

    #[test]
    fn test_encoded_values() {
        let encoded = encode_value("deep house");
        assert!(encoded.starts_with('!'));

        let log = format!("1000s genre +{} title +plain\n", encoded);
        let decoded = decode_log(&log);

        assert_eq!(scalar(&decoded, "genre"), Some("deep house"));
        assert_eq!(scalar(&decoded, "title"), Some("plain"));
        assert_eq!(encode_value("plain"), "plain");
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let log = "notatime artist +Broken\n\
                   1000s +orphan artist +Nope\n\
                   1100s title +!!!notbase64\n\
                   1200s artist +Alpha\n";
        let decoded = decode_log(log);

        assert_eq!(decoded.warnings.len(), 3);
        assert!(matches!(
            decoded.warnings[0],
            DecodeWarning::BadTimestamp { line: 1, .. }
        ));
        assert!(matches!(
            decoded.warnings[1],
            DecodeWarning::OrphanValue { line: 2, .. }
        ));
        assert!(matches!(
            decoded.warnings[2],
            DecodeWarning::BadEncoding { line: 3, .. }
        ));

        // Only the well-formed entry contributes.
        assert_eq!(decoded.values("artist"), Some(&set(&["Alpha"])));
        assert!(is_absent(&decoded, "title"));
    }

    #[test]
    fn test_field_names_are_case_insensitive() {
        let decoded = decode_log("1000s Artist +Alpha\n2000s ARTIST +Beta\n");
        assert_eq!(decoded.values("artist"), Some(&set(&["Alpha", "Beta"])));
        assert_eq!(decoded.values("artist").map(BTreeSet::len), Some(2));
        assert_eq!(scalar(&decoded, "artist"), None);
    }

    #[test]
    fn test_blank_lines_and_empty_log() {
        assert_eq!(decode_log(""), DecodedLog::default());

        let decoded = decode_log("\n\n1000s bpm +128\n\n");
        assert_eq!(scalar(&decoded, "bpm"), Some("128"));
        assert!(decoded.warnings.is_empty());
    }
}
