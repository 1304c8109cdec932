//! Name validation and conflict suggestions.
//!
//! Suggestion generation is a pure function of the desired name and the
//! taken set, so callers (and tests) can pin its output.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::{OrchestratorError, Result};

pub const MAX_NAME_LEN: usize = 64;

#[derive(Clone, Debug, Serialize)]
pub struct NameAvailability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// Environment and session names: `[A-Za-z0-9._-]`, starting alphanumeric.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(OrchestratorError::UserInput(format!(
            "name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    if !name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(OrchestratorError::UserInput(
            "name must start with a letter or digit".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(OrchestratorError::UserInput(
            "name may only contain letters, digits, '.', '_' and '-'".into(),
        ));
    }
    Ok(())
}

/// Up to `count` free alternatives for a taken name, by appending `-2`,
/// `-3`, … (skipping any that are themselves taken).
pub fn suggest_names(desired: &str, taken: &HashSet<String>, count: usize) -> Vec<String> {
    let mut suggestions = Vec::with_capacity(count);
    let mut n = 2usize;
    while suggestions.len() < count && n < 100 {
        let candidate = format!("{desired}-{n}");
        if candidate.len() <= MAX_NAME_LEN && !taken.contains(&candidate) {
            suggestions.push(candidate);
        }
        n += 1;
    }
    suggestions
}

pub fn availability(desired: &str, taken: &HashSet<String>) -> NameAvailability {
    if let Err(err) = validate_name(desired) {
        return NameAvailability {
            available: false,
            message: Some(err.message().to_string()),
            suggestions: Vec::new(),
        };
    }
    if taken.contains(desired) {
        NameAvailability {
            available: false,
            message: Some(format!("'{desired}' is already taken")),
            suggestions: suggest_names(desired, taken, 3),
        }
    } else {
        NameAvailability {
            available: true,
            message: None,
            suggestions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taken(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn valid_names() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("my-env.2").is_ok());
        assert!(validate_name("0start").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn suggestions_are_deterministic() {
        let suggestions = suggest_names("demo", &taken(&["demo"]), 3);
        assert_eq!(suggestions, vec!["demo-2", "demo-3", "demo-4"]);
    }

    #[test]
    fn suggestions_skip_taken_candidates() {
        let suggestions = suggest_names("demo", &taken(&["demo", "demo-2", "demo-4"]), 3);
        assert_eq!(suggestions, vec!["demo-3", "demo-5", "demo-6"]);
    }

    #[test]
    fn availability_reports_conflict() {
        let result = availability("demo", &taken(&["demo"]));
        assert!(!result.available);
        assert_eq!(result.suggestions.len(), 3);
        assert!(result.message.unwrap().contains("demo"));
    }

    #[test]
    fn availability_of_free_name() {
        let result = availability("fresh", &taken(&["demo"]));
        assert!(result.available);
        assert!(result.suggestions.is_empty());
    }
}
