//! Identifier validation.
//!
//! Module ids, profiler labels, constraint type names, and namespaced action
//! types all follow small regular grammars. Compiled patterns are cached.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::error::ValidationError;

const REGEX_CACHE_MAX: usize = 64;

static REGEX_CACHE: OnceLock<RwLock<HashMap<&'static str, Regex>>> = OnceLock::new();

/// Module ids: `theory-core`, `voice_leading2`.
pub const MODULE_ID: &str = r"^[a-z][a-z0-9_-]{0,63}$";

/// Profiler path labels: `chords.suggest`, `harmony/next`.
pub const PATH_LABEL: &str = r"^[A-Za-z0-9_][A-Za-z0-9_./:-]{0,127}$";

/// Constraint type and field names (rule-language atoms without quoting).
pub const SNAKE_ATOM: &str = r"^[a-z][a-z0-9_]{0,63}$";

/// Extension action types: `ns:action`.
pub const NAMESPACED: &str = r"^[a-z][a-z0-9_]*:[a-z][a-z0-9_]*$";

fn cached_regex(pattern: &'static str) -> Result<Regex, ValidationError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Ok(guard) = cache.read() {
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = Regex::new(pattern).map_err(|e| ValidationError::InvalidIdentifier {
        value: pattern.to_string(),
        reason: format!("invalid pattern: {e}"),
    })?;

    if let Ok(mut guard) = cache.write() {
        if guard.len() >= REGEX_CACHE_MAX {
            guard.clear();
        }
        guard.entry(pattern).or_insert_with(|| compiled.clone());
    }
    Ok(compiled)
}

/// True when `value` matches `pattern`.
pub fn is_match(pattern: &'static str, value: &str) -> bool {
    cached_regex(pattern).is_ok_and(|re| re.is_match(value))
}

/// Checks `value` against `pattern`, naming `what` in the error.
pub fn validate(pattern: &'static str, value: &str, what: &str) -> Result<(), ValidationError> {
    if cached_regex(pattern)?.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier {
            value: value.to_string(),
            reason: format!("not a valid {what}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_ids() {
        assert!(is_match(MODULE_ID, "theory-core"));
        assert!(is_match(MODULE_ID, "voice_leading2"));
        assert!(!is_match(MODULE_ID, "Theory"));
        assert!(!is_match(MODULE_ID, "1st"));
        assert!(!is_match(MODULE_ID, ""));
    }

    #[test]
    fn namespaced_actions() {
        assert!(is_match(NAMESPACED, "drums:add_fill"));
        assert!(!is_match(NAMESPACED, "add_fill"));
        assert!(!is_match(NAMESPACED, "a:b:c"));
    }

    #[test]
    fn validate_names_the_kind() {
        let err = validate(PATH_LABEL, "bad label", "path label").unwrap_err();
        assert!(err.to_string().contains("path label"));
    }
}
