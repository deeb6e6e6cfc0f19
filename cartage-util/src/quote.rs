//! SQL identifier and literal quoting.

/// Does the identifier survive unquoted?
fn ident_ok(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Quote an SQL identifier unless it is a plain lowercase name.
pub fn quote_ident(name: &str) -> String {
    if ident_ok(name) && !is_reserved_word(name) {
        name.to_owned()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Quote a possibly schema-qualified name.  Names without a dot get the
/// `public` schema prepended, matching how the provider stores table names.
pub fn quote_fqident(name: &str) -> String {
    let (schema, rest) = fq_name_parts(name);
    format!("{}.{}", quote_ident(schema), quote_ident(rest))
}

/// Split a qualified name into (schema, name), defaulting to `public`.
pub fn fq_name_parts(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, rest)) => (schema, rest),
        None => ("public", name),
    }
}

/// Normalize a name to schema-qualified form.
pub fn fq_name(name: &str) -> String {
    let (schema, rest) = fq_name_parts(name);
    format!("{schema}.{rest}")
}

/// Quote an SQL literal.  NULL is spelled out for `None`, backslashes force
/// the `E''` form so the result is safe regardless of
/// `standard_conforming_strings`.
pub fn quote_literal(value: Option<&str>) -> String {
    match value {
        None => "null".to_owned(),
        Some(v) => {
            let escaped = v.replace('\'', "''");
            if escaped.contains('\\') {
                format!("E'{}'", escaped.replace('\\', "\\\\"))
            } else {
                format!("'{escaped}'")
            }
        }
    }
}

// Only the words that show up in real table/column names often enough to
// have bitten us.  Anything exotic just gets quoted by the charset rule.
fn is_reserved_word(s: &str) -> bool {
    matches!(
        s,
        "all" | "and" | "any" | "as" | "asc" | "between" | "case" | "cast" | "check" | "column"
            | "constraint" | "create" | "cross" | "current_date" | "current_time" | "default"
            | "desc" | "distinct" | "do" | "else" | "end" | "except" | "false" | "for" | "foreign"
            | "from" | "full" | "grant" | "group" | "having" | "in" | "inner" | "intersect"
            | "into" | "is" | "join" | "left" | "like" | "limit" | "natural" | "not" | "null"
            | "offset" | "on" | "only" | "or" | "order" | "outer" | "primary" | "references"
            | "right" | "select" | "table" | "then" | "to" | "true" | "union" | "unique"
            | "user" | "using" | "when" | "where" | "with"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_idents_pass_through() {
        assert_eq!(quote_ident("foo_bar2"), "foo_bar2");
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("Foo"), "\"Foo\"");
        assert_eq!(quote_ident("2fast"), "\"2fast\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn fqident_defaults_schema() {
        assert_eq!(quote_fqident("mytable"), "public.mytable");
        assert_eq!(quote_fqident("other.Bar"), "other.\"Bar\"");
        assert_eq!(quote_fqident("Other.Foo"), "\"Other\".\"Foo\"");
    }

    #[test]
    fn literals() {
        assert_eq!(quote_literal(Some("o'brien")), "'o''brien'");
        assert_eq!(quote_literal(Some("a\\b")), "E'a\\\\b'");
        assert_eq!(quote_literal(None), "null");
        assert_eq!(quote_literal(Some("")), "''");
    }

    #[test]
    fn fq_name_normalizes() {
        assert_eq!(fq_name("t"), "public.t");
        assert_eq!(fq_name("s.t"), "s.t");
    }
}
