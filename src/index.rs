//! Index record grammar: `key=value&key=value` lines terminated by `[end]`.
//!
//! One index file records one snapshot. The same grammar carries hint files.

use std::collections::HashMap;
use std::io::Read;

use thiserror::Error;

use crate::codec::{self, CodecError};

/// Sentinel line closing a well-formed index or hint file.
pub const END_MARKER: &str = "[end]";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("malformed index line: {0}")]
    BadLine(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One parsed record: decoded keys mapped to decoded byte values.
pub type Record = HashMap<String, Vec<u8>>;

/// Read one `\n`-terminated line. Returns `None` at end of file; a final
/// unterminated line is still returned.
pub fn getline(f: &mut dyn Read) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = f.read(&mut byte)?;
        if n == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    // Well-formed lines are pure ASCII; anything else cannot parse anyway.
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-ascii index line"))
}

/// Parse one record line. Every `&`-separated segment must contain `=`;
/// duplicate keys overwrite earlier values.
pub fn parse_record(line: &str) -> Result<Record, IndexError> {
    let mut rec = Record::new();
    for segment in line.split('&') {
        let Some((key, value)) = segment.split_once('=') else {
            return Err(IndexError::BadLine(line.to_string()));
        };
        let key = String::from_utf8(codec::url_decode(key)?)
            .map_err(|_| IndexError::BadLine(line.to_string()))?;
        rec.insert(key, codec::url_decode(value)?);
    }
    Ok(rec)
}

/// Read the next record. Returns `None` at the `[end]` sentinel; a file that
/// runs out before the sentinel is malformed.
pub fn read_record(f: &mut dyn Read) -> Result<Option<Record>, IndexError> {
    let Some(line) = getline(f)? else {
        return Err(IndexError::UnexpectedEof);
    };
    if line == END_MARKER {
        return Ok(None);
    }
    parse_record(&line).map(Some)
}

/// Fetch a field value as UTF-8, if present and valid.
pub fn field_str<'a>(rec: &'a Record, key: &str) -> Option<&'a str> {
    rec.get(key).and_then(|v| std::str::from_utf8(v).ok())
}

/// Permission bits as emitted in `perms=`: octal with a leading zero, or a
/// bare `0` when no bits are set.
pub fn format_perms(mode: u32) -> String {
    let mode = mode & 0o7777;
    if mode == 0 {
        "0".to_string()
    } else {
        format!("0{mode:o}")
    }
}

/// Parse a `perms=` value (base 8, leading zeros allowed).
pub fn parse_perms(s: &str) -> Option<u32> {
    u32::from_str_radix(s, 8).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_fields_in_any_order() {
        let rec = parse_record("name=a%2fb&type=dir").unwrap();
        assert_eq!(rec.get("name").unwrap(), b"a/b");
        assert_eq!(rec.get("type").unwrap(), b"dir");
    }

    #[test]
    fn segment_without_equals_is_bad() {
        assert!(matches!(parse_record("name"), Err(IndexError::BadLine(_))));
        assert!(matches!(
            parse_record("name=a&&type=dir"),
            Err(IndexError::BadLine(_))
        ));
    }

    #[test]
    fn duplicate_key_overwrites() {
        let rec = parse_record("k=1&k=2").unwrap();
        assert_eq!(rec.get("k").unwrap(), b"2");
    }

    #[test]
    fn end_marker_terminates() {
        let mut f = Cursor::new(b"name=a\n[end]\n".to_vec());
        assert!(read_record(&mut f).unwrap().is_some());
        assert!(read_record(&mut f).unwrap().is_none());
    }

    #[test]
    fn missing_end_marker_is_error() {
        let mut f = Cursor::new(b"name=a\n".to_vec());
        assert!(read_record(&mut f).unwrap().is_some());
        assert!(matches!(read_record(&mut f), Err(IndexError::UnexpectedEof)));
    }

    #[test]
    fn perms_round_trip() {
        assert_eq!(format_perms(0o644), "0644");
        assert_eq!(format_perms(0o7777), "07777");
        assert_eq!(format_perms(0), "0");
        assert_eq!(parse_perms("0644"), Some(0o644));
        assert_eq!(parse_perms("0"), Some(0));
        // Mode bits outside the permission mask are dropped.
        assert_eq!(format_perms(0o100644), "0644");
    }
}
