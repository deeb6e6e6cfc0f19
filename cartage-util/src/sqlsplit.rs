//! Splitting an SQL script into single statements.
//!
//! EXECUTE events and restored DDL arrive as multi-statement scripts that
//! must be run one statement at a time.  The splitter understands quoted
//! strings, dollar quoting, line comments and nested block comments; it does
//! not try to understand the statements themselves.

/// Split `script` on top-level semicolons.  Empty statements are dropped,
/// the trailing semicolon is kept off each returned statement.
pub fn parse_statements(script: &str) -> Vec<String> {
    let bytes = script.as_bytes();
    let mut stmts = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // doubled quote stays inside the string
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    if quote == b'\'' && bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let mut depth = 1;
                i += 2;
                while i < bytes.len() && depth > 0 {
                    if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
                        depth += 1;
                        i += 2;
                    } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                        depth -= 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
            }
            b'$' => {
                if let Some(tag_end) = dollar_tag_end(bytes, i) {
                    let tag = &script[i..tag_end];
                    if let Some(pos) = script[tag_end..].find(tag) {
                        i = tag_end + pos + tag.len();
                    } else {
                        i = bytes.len();
                    }
                } else {
                    i += 1;
                }
            }
            b';' => {
                let stmt = script[start..i].trim();
                if !stmt.is_empty() {
                    stmts.push(stmt.to_owned());
                }
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }

    let tail = script[start..].trim();
    if !tail.is_empty() {
        stmts.push(tail.to_owned());
    }
    stmts
}

/// If a dollar-quote tag (`$$`, `$body$`, ...) starts at `pos`, return the
/// offset one past its closing `$`.
fn dollar_tag_end(bytes: &[u8], pos: usize) -> Option<usize> {
    let mut i = pos + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'$' => return Some(i + 1),
            c if c.is_ascii_alphanumeric() || c == b'_' => i += 1,
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_statements() {
        let got = parse_statements("create table a (x int);\n\ninsert into a values (1);\n");
        assert_eq!(
            got,
            vec!["create table a (x int)", "insert into a values (1)"]
        );
    }

    #[test]
    fn semicolons_in_strings_and_comments() {
        let got = parse_statements(
            "insert into t values ('a;b'); -- trailing; comment\n\
             /* multi; line /* nested; */ comment; */ delete from t;",
        );
        assert_eq!(got, vec!["insert into t values ('a;b')", "delete from t"]);
    }

    #[test]
    fn dollar_quoted_bodies() {
        let sql = "create function f() returns void as $fn$ begin null; end $fn$ language plpgsql; select 1;";
        let got = parse_statements(sql);
        assert_eq!(got.len(), 2);
        assert!(got[0].contains("begin null; end"));
        assert_eq!(got[1], "select 1");
    }

    #[test]
    fn no_trailing_semicolon() {
        assert_eq!(parse_statements("select 1"), vec!["select 1"]);
        assert_eq!(parse_statements("  ;; \n"), Vec::<String>::new());
    }
}
