//! Escaping for the COPY text format.
//!
//! The copy worker, the obfuscator write hook and the repair dump scanner
//! all speak this format: tab-separated fields, `\N` for NULL, backslash
//! escapes for tab, newline, carriage return and backslash itself.

/// Escape one field for COPY text output.  `None` becomes `\N`.
pub fn quote_copy(value: Option<&str>) -> String {
    match value {
        None => "\\N".to_owned(),
        Some(v) => {
            let mut out = String::with_capacity(v.len());
            for c in v.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\t' => out.push_str("\\t"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    c => out.push(c),
                }
            }
            out
        }
    }
}

/// Undo COPY text escaping.  `\N` maps to `None`; unknown escapes keep the
/// escaped character, which is what the server emits for them anyway.
pub fn unescape_copy(field: &str) -> Option<String> {
    if field == "\\N" {
        return None;
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn null_marker() {
        assert_eq!(quote_copy(None), "\\N");
        assert_eq!(unescape_copy("\\N"), None);
        // a literal backslash-N survives
        assert_eq!(unescape_copy("\\\\N"), Some("\\N".into()));
    }

    #[test]
    fn control_chars() {
        assert_eq!(quote_copy(Some("a\tb\nc\\d")), "a\\tb\\nc\\\\d");
        assert_eq!(unescape_copy("a\\tb\\nc\\\\d"), Some("a\tb\nc\\d".into()));
    }

    proptest! {
        #[test]
        fn roundtrips(v in ".{0,40}") {
            prop_assert_eq!(unescape_copy(&quote_copy(Some(v.as_str()))), Some(v));
        }
    }
}
