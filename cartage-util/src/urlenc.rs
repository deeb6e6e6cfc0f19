//! Urlencoded key/value maps as used by the queue wire format.
//!
//! This is the classic `key=value&key=value` form with percent escapes and
//! `+` for space, extended with one twist the generic form codecs cannot
//! express: a key *without* `=` stands for an SQL NULL value.  Table
//! attributes, event payloads and `ev_extra3` shard metadata all use this
//! encoding.

use indexmap::IndexMap;

use crate::ParseError;

/// Ordered map of nullable string values, insertion order preserved.
pub type UrlMap = IndexMap<String, Option<String>>;

fn byte_ok(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'~')
}

fn encode_part(out: &mut String, part: &str) {
    for &b in part.as_bytes() {
        if byte_ok(b) {
            out.push(b as char);
        } else if b == b' ' {
            out.push('+');
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
}

/// Encode a map of nullable values.
pub fn db_urlencode<'a, I>(map: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut out = String::new();
    for (key, value) in map {
        if !out.is_empty() {
            out.push('&');
        }
        encode_part(&mut out, key);
        if let Some(value) = value {
            out.push('=');
            encode_part(&mut out, value);
        }
    }
    out
}

fn decode_part(part: &str) -> Result<String, ParseError> {
    let bytes = part.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .ok_or_else(|| ParseError::Urlenc(format!("truncated escape in {part:?}")))?;
                let hex = std::str::from_utf8(hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| ParseError::Urlenc(format!("bad escape in {part:?}")))?;
                out.push(hex);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| ParseError::Urlenc(format!("non-utf8 data in {part:?}")))
}

/// Decode `key=value&key` pairs.  A key without `=` maps to `None`.
pub fn db_urldecode(data: &str) -> Result<UrlMap, ParseError> {
    let mut map = UrlMap::new();
    for pair in data.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => {
                map.insert(decode_part(key)?, Some(decode_part(value)?));
            }
            None => {
                map.insert(decode_part(pair)?, None);
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn basic_roundtrip() {
        let mut map = UrlMap::new();
        map.insert("handler".into(), Some("shard(key=id)".into()));
        map.insert("skip_truncate".into(), Some("1".into()));
        map.insert("note".into(), Some("a b&c=d".into()));
        map.insert("nullish".into(), None);

        let enc = db_urlencode(map.iter().map(|(k, v)| (k.as_str(), v.as_deref())));
        assert_eq!(
            enc,
            "handler=shard%28key%3did%29&skip_truncate=1&note=a+b%26c%3dd&nullish"
        );
        assert_eq!(db_urldecode(&enc).unwrap(), map);
    }

    #[test]
    fn empty_value_vs_null() {
        let decoded = db_urldecode("a=&b").unwrap();
        assert_eq!(decoded["a"], Some(String::new()));
        assert_eq!(decoded["b"], None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(db_urldecode("a=%zz").is_err());
        assert!(db_urldecode("a=%2").is_err());
    }

    proptest! {
        #[test]
        fn roundtrips_arbitrary_maps(
            pairs in proptest::collection::vec(
                ("[a-z][a-z0-9_]{0,8}", proptest::option::of(".{0,24}")),
                0..6,
            )
        ) {
            let mut map = UrlMap::new();
            for (k, v) in pairs {
                map.insert(k, v);
            }
            let enc = db_urlencode(map.iter().map(|(k, v)| (k.as_str(), v.as_deref())));
            prop_assert_eq!(db_urldecode(&enc).unwrap(), map);
        }
    }
}
