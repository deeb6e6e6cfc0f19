//! Table name globbing (`public.*`, `archive.log_?`).

use regex::Regex;

/// Translate a table glob to an anchored regex.  Only `*` and `?` are
/// wildcards; dots separate schema from name and match literally.
pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    // wildcards and escaped literals only, cannot fail to compile
    Regex::new(&expr).expect("glob regex")
}

/// Case-sensitive glob match against a qualified table name.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    glob_to_regex(pattern).is_match(name)
}

/// Does any pattern in the list match?
pub fn glob_match_any<'a, I>(patterns: I, name: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    patterns.into_iter().any(|p| glob_match(p, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        assert!(glob_match("public.*", "public.events"));
        assert!(!glob_match("public.*", "audit.events"));
        assert!(glob_match("archive.log_?", "archive.log_7"));
        assert!(!glob_match("archive.log_?", "archive.log_77"));
    }

    #[test]
    fn dot_is_literal() {
        assert!(!glob_match("publicxevents", "public.events"));
        assert!(glob_match("public.events", "public.events"));
    }
}
