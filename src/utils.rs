//! Utility functions shared by the engine and the workloads.
//!

use anyhow::Result;
use bytes::Bytes;
use std::borrow::Cow;

/// Read an entire [`Bytes`] slice into a [`String`].
///
/// Returns an error if the slice contains invalid UTF-8.
pub fn string_from_bytes(buf: Bytes) -> Result<String> {
    Ok(String::from_utf8(buf.as_ref().into())?)
}

/// Convert a [`String`] to [`Bytes`].
#[inline]
pub fn string_to_bytes(s: String) -> Bytes {
    Bytes::from(s)
}

/// Decode input text as UTF-8 without failing.
///
/// A leading byte order mark is dropped and malformed sequences become
/// U+FFFD. The second element is `true` if any replacement happened.
pub fn decode_utf8_lossy(buf: &[u8]) -> (Cow<'_, str>, bool) {
    encoding_rs::UTF_8.decode_with_bom_removal(buf)
}

/// Unescape the handful of escapes accepted in separator arguments
/// (`\t`, `\n`, `\\`). Anything else is kept as written.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_bom_and_replaces_garbage() {
        let (text, bad) = decode_utf8_lossy(b"\xEF\xBB\xBF1,red");
        assert_eq!(text, "1,red");
        assert!(!bad);

        let (text, bad) = decode_utf8_lossy(b"1,r\xFFd");
        assert_eq!(text, "1,r\u{FFFD}d");
        assert!(bad);
    }

    #[test]
    fn unescape_known_sequences() {
        assert_eq!(unescape("\\t"), "\t");
        assert_eq!(unescape("a\\\\b"), "a\\b");
        assert_eq!(unescape("\\x"), "\\x");
        assert_eq!(unescape("::"), "::");
        assert_eq!(unescape("end\\"), "end\\");
    }

    #[test]
    fn string_bytes_conversion() {
        let b = string_to_bytes("posting".to_string());
        assert_eq!(string_from_bytes(b).unwrap(), "posting");
        assert!(string_from_bytes(Bytes::from_static(b"\xFF")).is_err());
    }
}
