//! Format tests: codec round-trip laws, index grammar, repository paths,
//! and exclusion matching.

use casnap::codec::{
    HASH_SIZE, HashBytes, hash_decode, hash_path, hex_decode, hex_encode, url_decode, url_encode,
};
use casnap::exclude::Exclusions;
use casnap::index::{format_perms, parse_perms, parse_record, read_record};
use std::io::Cursor;

// --- url codec ---

#[test]
fn test_url_round_trip_every_byte() {
    let all: Vec<u8> = (0..=255).collect();
    assert_eq!(url_decode(&url_encode(&all)).unwrap(), all);
}

#[test]
fn test_url_round_trip_symlink_targets() {
    for target in [
        &b"plain/target"[..],
        b"spaces in name",
        b"amp&eq=pct%semi;plus+",
        b"\x01\x7f\xfe trailing",
    ] {
        assert_eq!(url_decode(&url_encode(target)).unwrap(), target);
    }
}

#[test]
fn test_url_space_becomes_plus() {
    assert_eq!(url_encode(b"a b"), "a+b");
}

#[test]
fn test_url_output_is_printable_ascii() {
    let all: Vec<u8> = (0..=255).collect();
    for c in url_encode(&all).bytes() {
        assert!((32..127).contains(&c));
        assert!(c != b'&' && c != b'=' && c != b';');
    }
}

// --- hex codec ---

#[test]
fn test_hex_round_trip() {
    let h: HashBytes = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff, 0x0f, 0xf0, 0x5a, 0xa5,
    ];
    let hex = hex_encode(&h);
    assert_eq!(hex.len(), 2 * HASH_SIZE);
    assert!(hex.bytes().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(hash_decode(&hex).unwrap(), h);
}

#[test]
fn test_hex_is_urlencode_idempotent() {
    let hex = hex_encode(&[0xab; HASH_SIZE]);
    assert_eq!(url_encode(hex.as_bytes()), hex);
}

#[test]
fn test_hex_decode_rejects_garbage() {
    assert!(hex_decode("abc").is_err()); // odd length
    assert!(hex_decode("zz").is_err()); // bad digit
    assert!(hash_decode("abcd").is_err()); // wrong width
}

// --- repository paths ---

#[test]
fn test_hash_path_layout() {
    let mut h = [0u8; HASH_SIZE];
    h[0] = 0x12;
    h[1] = 0x34;
    let p = hash_path(&h);
    let full = hex_encode(&h);
    assert_eq!(p, format!("12/34/{full}"));
}

// --- index records ---

#[test]
fn test_parse_record_decodes_values() {
    let rec = parse_record("name=a+b&target=x%26y").unwrap();
    assert_eq!(rec.get("name").unwrap(), b"a b");
    assert_eq!(rec.get("target").unwrap(), b"x&y");
}

#[test]
fn test_parse_record_rejects_missing_equals() {
    assert!(parse_record("noequals").is_err());
    assert!(parse_record("a=1&&b=2").is_err());
}

#[test]
fn test_read_record_stops_at_end_marker() {
    let mut f = Cursor::new(b"name=x&type=dir\nname=y&data=\n[end]\n".to_vec());
    assert_eq!(read_record(&mut f).unwrap().unwrap().get("name").unwrap(), b"x");
    assert_eq!(read_record(&mut f).unwrap().unwrap().get("name").unwrap(), b"y");
    assert!(read_record(&mut f).unwrap().is_none());
}

#[test]
fn test_read_record_requires_end_marker() {
    let mut f = Cursor::new(b"name=x&type=dir\n".to_vec());
    assert!(read_record(&mut f).unwrap().is_some());
    assert!(read_record(&mut f).is_err());
}

// --- perms rendering ---

#[test]
fn test_perms_format() {
    assert_eq!(format_perms(0o644), "0644");
    assert_eq!(format_perms(0o4755), "04755");
    assert_eq!(format_perms(0), "0");
    assert_eq!(format_perms(0o40755), "0755"); // type bits masked off
}

#[test]
fn test_perms_parse() {
    assert_eq!(parse_perms("0644"), Some(0o644));
    assert_eq!(parse_perms("0"), Some(0));
    assert_eq!(parse_perms("8"), None);
}

// --- exclusions ---

#[test]
fn test_exclusion_matches_anywhere() {
    let mut e = Exclusions::default();
    e.add("cache").unwrap();
    assert!(e.excluded(b"home/cache/f"));
    assert!(e.excluded(b"precached")); // unanchored patterns match substrings
    assert!(!e.excluded(b"home/work/f"));
}

#[test]
fn test_exclusion_dollar_matches_end_only() {
    let mut e = Exclusions::default();
    e.add(r"\.tmp$").unwrap();
    assert!(e.excluded(b"a/b.tmp"));
    assert!(!e.excluded(b"a/b.tmp.keep"));
}

#[test]
fn test_exclusion_first_of_many_wins() {
    let mut e = Exclusions::default();
    e.add(r"^spool/").unwrap();
    e.add(r"\.o$").unwrap();
    assert!(e.excluded(b"spool/x.c"));
    assert!(e.excluded(b"src/x.o"));
    assert!(!e.excluded(b"src/x.c"));
}
