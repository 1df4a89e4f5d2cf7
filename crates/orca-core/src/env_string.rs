//! `$NAME` environment variable substitution for configuration strings.

use crate::error::{OrcaError, OrcaResult};
use regex::Regex;
use std::sync::OnceLock;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"\$([A-Za-z0-9_]+)").expect("static regex is valid")
    })
}

/// Replace every `$NAME` in `value` with the environment variable `NAME`.
///
/// Fails with a config error naming the first variable that is not set.
pub fn resolve(value: &str) -> OrcaResult<String> {
    resolve_with(value, |name| std::env::var(name).ok())
}

/// Same as [`resolve`] but looks variables up through `lookup`.
pub fn resolve_with<F>(value: &str, lookup: F) -> OrcaResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    if !value.contains('$') {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in var_pattern().captures_iter(value) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let replacement = lookup(name.as_str()).ok_or_else(|| {
            OrcaError::Config(format!(
                "couldn't find ${} environment variable",
                name.as_str()
            ))
        })?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(&replacement);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> HashMap<&'static str, &'static str> {
        HashMap::from([("CTRL_ORCA_DIR", "/opt/orca"), ("USER", "srp")])
    }

    #[test]
    fn test_plain_string_unchanged() {
        let out = resolve_with("/data/run", |_| None).unwrap();
        assert_eq!(out, "/data/run");
    }

    #[test]
    fn test_substitutes_every_variable() {
        let vars = env();
        let out = resolve_with("$CTRL_ORCA_DIR/bin/$USER.sh", |k| {
            vars.get(k).map(|v| (*v).to_string())
        })
        .unwrap();
        assert_eq!(out, "/opt/orca/bin/srp.sh");
    }

    #[test]
    fn test_missing_variable_is_config_error() {
        let err = resolve_with("$NOPE/x", |_| None).unwrap_err();
        assert!(matches!(err, OrcaError::Config(_)));
        assert!(err.to_string().contains("$NOPE"));
    }

    #[test]
    fn test_lone_dollar_kept() {
        let out = resolve_with("cost: $ 5", |_| None).unwrap();
        assert_eq!(out, "cost: $ 5");
    }
}
