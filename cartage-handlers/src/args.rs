//! Handler argument parsing and validation.

use indexmap::IndexMap;

use crate::HandlerError;

/// Parsed `key=value` arguments for one handler instance.
#[derive(Debug, Clone, Default)]
pub struct HandlerArgs {
    map: IndexMap<String, String>,
}

impl HandlerArgs {
    pub fn new(map: IndexMap<String, String>) -> HandlerArgs {
        HandlerArgs { map }
    }

    /// Overlay missing keys with preset defaults (dispatch handler family).
    pub fn with_defaults(&self, defaults: &[(&str, &str)]) -> HandlerArgs {
        let mut map = self.map.clone();
        for (key, value) in defaults {
            map.entry((*key).to_owned())
                .or_insert_with(|| (*value).to_owned());
        }
        HandlerArgs { map }
    }

    /// Reject arguments the handler does not declare.
    pub fn validate(&self, allowed: &[&str]) -> Result<(), HandlerError> {
        for key in self.map.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(HandlerError::Config(format!(
                    "invalid handler argument: {key}"
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Boolean argument, `0`/`1`/`false`/`true`.
    pub fn get_bool(&self, name: &str, default: bool) -> Result<bool, HandlerError> {
        match self.get(name) {
            None => Ok(default),
            Some("1") | Some("true") => Ok(true),
            Some("0") | Some("false") => Ok(false),
            Some(other) => Err(HandlerError::Config(format!(
                "bad argument {name} value {other:?}"
            ))),
        }
    }

    /// Enumerated argument; the first choice is the default.
    pub fn get_choice(&self, name: &str, choices: &[&str]) -> Result<String, HandlerError> {
        let value = self.get(name).unwrap_or(choices[0]);
        if choices.contains(&value) {
            Ok(value.to_owned())
        } else {
            Err(HandlerError::Config(format!(
                "bad argument {name} value {value:?}"
            )))
        }
    }
}

/// Parse repeated `--handler-arg key=value` strings, rejecting duplicates.
pub fn parse_arg_list(arglist: &[String]) -> Result<IndexMap<String, String>, HandlerError> {
    let mut args = IndexMap::new();
    for arg in arglist {
        let (key, value) = match arg.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (arg.trim(), ""),
        };
        if args.contains_key(key) {
            return Err(HandlerError::Config(format!(
                "multiple handler arguments: {key}"
            )));
        }
        args.insert(key.to_owned(), value.to_owned());
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HandlerArgs {
        HandlerArgs::new(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        )
    }

    #[test]
    fn validation() {
        let a = args(&[("key", "id"), ("hash_expr", "f(id)")]);
        assert!(a.validate(&["key", "hash_key", "hash_expr"]).is_ok());
        assert!(a.validate(&["key"]).is_err());
    }

    #[test]
    fn bools_and_choices() {
        let a = args(&[("ignore_truncate", "1"), ("period", "month")]);
        assert!(a.get_bool("ignore_truncate", false).unwrap());
        assert!(!a.get_bool("missing", false).unwrap());
        assert_eq!(
            a.get_choice("period", &["day", "month", "year", "hour"]).unwrap(),
            "month"
        );
        assert_eq!(
            a.get_choice("row_mode", &["plain", "keep_all", "keep_latest"])
                .unwrap(),
            "plain"
        );
        assert!(args(&[("x", "2")]).get_bool("x", false).is_err());
    }

    #[test]
    fn duplicate_args_rejected() {
        let list = vec!["a=1".to_owned(), "a=2".to_owned()];
        assert!(parse_arg_list(&list).is_err());
    }

    #[test]
    fn defaults_do_not_override() {
        let a = args(&[("period", "year")]).with_defaults(&[("period", "day"), ("load_mode", "bulk")]);
        assert_eq!(a.get("period"), Some("year"));
        assert_eq!(a.get("load_mode"), Some("bulk"));
    }
}
