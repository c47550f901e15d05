//! Pattern matching for `take` and the watcher effects.
//!
//! | Pattern                  | Matches                                      |
//! |--------------------------|----------------------------------------------|
//! | `"*"`                    | every action                                 |
//! | `"ns/*"`                 | any action whose type starts with `"ns/"`    |
//! | `"auth/LOGIN"`           | exactly that type                            |
//! | `["a", "ns/*"]`          | any element matches                          |
//! | `Pattern::any_of(..)`    | any nested pattern matches                   |
//! | `Pattern::predicate(f)`  | whatever `f(&action)` returns                |
//!
//! `Pattern` is a closed enum, so no other shapes can reach the matcher.

use std::fmt;
use std::sync::Arc;

use crate::action::Action;

/// Predicate used by [`Pattern::Predicate`].
pub type PredicateFn = Arc<dyn Fn(&Action) -> bool + Send + Sync>;

/// Decides whether an action is of interest to a pending take.
#[derive(Clone)]
pub enum Pattern {
    /// `"*"`, `"prefix/*"` or an exact action type.
    Type(String),
    /// Logical OR over several patterns.
    AnyOf(Vec<Pattern>),
    /// Arbitrary predicate over the action.
    Predicate(PredicateFn),
}

impl Pattern {
    /// Match every action.
    pub fn any() -> Self {
        Pattern::Type("*".to_string())
    }

    /// Logical OR over arbitrary patterns, predicates included.
    pub fn any_of<I, P>(patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Pattern>,
    {
        Pattern::AnyOf(patterns.into_iter().map(Into::into).collect())
    }

    /// Build a predicate pattern.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Action) -> bool + Send + Sync + 'static,
    {
        Pattern::Predicate(Arc::new(f))
    }

    /// Returns true if `action` satisfies this pattern.
    pub fn matches(&self, action: &Action) -> bool {
        match self {
            Pattern::Type(pattern) => type_matches(pattern, &action.action_type),
            Pattern::AnyOf(patterns) => patterns.iter().any(|pattern| pattern.matches(action)),
            Pattern::Predicate(predicate) => predicate(action),
        }
    }
}

fn type_matches(pattern: &str, action_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix("/*") {
        // "ns/*" keeps the slash so "nsx/FOO" does not match
        Some(namespace) => action_type
            .strip_prefix(namespace)
            .is_some_and(|rest| rest.starts_with('/')),
        None => pattern == action_type,
    }
}

impl From<&str> for Pattern {
    fn from(pattern: &str) -> Self {
        Pattern::Type(pattern.to_string())
    }
}

impl From<String> for Pattern {
    fn from(pattern: String) -> Self {
        Pattern::Type(pattern)
    }
}

impl From<&String> for Pattern {
    fn from(pattern: &String) -> Self {
        Pattern::Type(pattern.clone())
    }
}

impl From<Vec<String>> for Pattern {
    fn from(patterns: Vec<String>) -> Self {
        Pattern::any_of(patterns)
    }
}

impl From<Vec<&str>> for Pattern {
    fn from(patterns: Vec<&str>) -> Self {
        Pattern::any_of(patterns)
    }
}

impl From<Vec<Pattern>> for Pattern {
    fn from(patterns: Vec<Pattern>) -> Self {
        Pattern::AnyOf(patterns)
    }
}

impl<const N: usize> From<[&str; N]> for Pattern {
    fn from(patterns: [&str; N]) -> Self {
        Pattern::any_of(patterns)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Type(pattern) => write!(f, "{}", pattern),
            Pattern::AnyOf(patterns) => {
                let parts: Vec<String> = patterns.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Pattern::Predicate(_) => write!(f, "<predicate>"),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Type(pattern) => f.debug_tuple("Type").field(pattern).finish(),
            Pattern::AnyOf(patterns) => f.debug_tuple("AnyOf").field(patterns).finish(),
            Pattern::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(t: &str) -> Action {
        Action::new(t)
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let pattern = Pattern::any();
        assert!(pattern.matches(&action("auth/LOGIN")));
        assert!(pattern.matches(&action("PING")));
    }

    #[test]
    fn test_exact_type() {
        let pattern = Pattern::from("auth/LOGIN");
        assert!(pattern.matches(&action("auth/LOGIN")));
        assert!(!pattern.matches(&action("auth/LOGOUT")));
        assert!(!pattern.matches(&action("auth/LOGIN/extra")));
    }

    #[test]
    fn test_namespace_wildcard() {
        let pattern = Pattern::from("auth/*");
        assert!(pattern.matches(&action("auth/LOGIN")));
        assert!(pattern.matches(&action("auth/session/REFRESH")));
        assert!(!pattern.matches(&action("author/LOGIN")));
        assert!(!pattern.matches(&action("auth")));
    }

    #[test]
    fn test_star_without_slash_is_literal() {
        let pattern = Pattern::from("auth*");
        assert!(!pattern.matches(&action("authLOGIN")));
        assert!(pattern.matches(&action("auth*")));
    }

    #[test]
    fn test_any_of_is_logical_or() {
        let pattern = Pattern::from(["cart/ADD", "auth/*"]);
        assert!(pattern.matches(&action("cart/ADD")));
        assert!(pattern.matches(&action("auth/LOGOUT")));
        assert!(!pattern.matches(&action("cart/REMOVE")));
    }

    #[test]
    fn test_any_of_mixes_types_and_predicates() {
        let pattern = Pattern::any_of([
            Pattern::from("auth/LOGOUT"),
            Pattern::predicate(|a| a.status.as_deref() == Some("error")),
        ]);
        assert!(pattern.matches(&action("auth/LOGOUT")));
        assert!(pattern.matches(&Action::new("cart/ADD").with_status("error")));
        assert!(!pattern.matches(&action("cart/ADD")));
        assert_eq!(pattern.to_string(), "[auth/LOGOUT, <predicate>]");
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let pattern = Pattern::from(Vec::<String>::new());
        assert!(!pattern.matches(&action("anything")));
    }

    #[test]
    fn test_predicate() {
        let pattern = Pattern::predicate(|a| a.payload == Some(json!(42)));
        assert!(pattern.matches(&Action::new("x").with_payload(42)));
        assert!(!pattern.matches(&Action::new("x").with_payload(7)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Pattern::from("a/*").to_string(), "a/*");
        assert_eq!(Pattern::from(["a", "b"]).to_string(), "[a, b]");
        assert_eq!(Pattern::predicate(|_| true).to_string(), "<predicate>");
    }
}
