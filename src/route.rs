//! Route pattern matching
//!
//! Patterns are dot or slash delimited segment sequences. A `{name}` segment
//! matches any single segment and binds the matched text into the
//! per-evaluation [`RouteVars`] context; literal segments must match exactly.
//! Patterns are parsed once at registration and evaluated many times, so the
//! segment split happens at compile time, not per exchange.

use std::collections::HashMap;

use crate::{Error, Result};

/// Variables bound by a pattern match, keyed by `{name}` segment name.
///
/// Only populated for patterns that actually matched; unmatched variables
/// never appear.
pub type RouteVars = HashMap<String, String>;

/// One segment of a compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Must match this text exactly.
    Literal(String),
    /// Matches any single segment, binding it under this name.
    Variable(String),
}

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    segments: Vec<Segment>,
    source: String,
}

impl RoutePattern {
    /// Parse a pattern such as `fetch.{user}.profile` or `orders/{id}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for empty patterns, empty segments, or
    /// malformed `{...}` variables.
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::Config("route pattern is empty".to_string()));
        }

        let mut segments = Vec::new();
        for raw in split_segments(pattern) {
            if raw.is_empty() {
                return Err(Error::Config(format!(
                    "route pattern '{pattern}' contains an empty segment"
                )));
            }
            if let Some(inner) = raw.strip_prefix('{') {
                let Some(name) = inner.strip_suffix('}') else {
                    return Err(Error::Config(format!(
                        "route pattern '{pattern}' has unterminated variable '{raw}'"
                    )));
                };
                if name.is_empty() {
                    return Err(Error::Config(format!(
                        "route pattern '{pattern}' has an unnamed variable"
                    )));
                }
                segments.push(Segment::Variable(name.to_string()));
            } else if raw.contains('{') || raw.contains('}') {
                return Err(Error::Config(format!(
                    "route pattern '{pattern}' mixes literals and braces in '{raw}'"
                )));
            } else {
                segments.push(Segment::Literal(raw.to_string()));
            }
        }

        Ok(Self {
            segments,
            source: pattern.to_string(),
        })
    }

    /// Match a concrete route against this pattern.
    ///
    /// Returns the bound variables on a match, or `None` when the route does
    /// not fit the pattern. Segment counts must be equal; there is no
    /// wildcard tail.
    #[must_use]
    pub fn matches(&self, route: &str) -> Option<RouteVars> {
        let parts: Vec<&str> = split_segments(route).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut vars = RouteVars::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(text) => {
                    if text != part {
                        return None;
                    }
                }
                Segment::Variable(name) => {
                    vars.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(vars)
    }

    /// The original pattern text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Split a route or pattern on the two accepted delimiters.
fn split_segments(route: &str) -> impl Iterator<Item = &str> {
    route.split(['.', '/'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exactly() {
        let pattern = RoutePattern::parse("fetch.profile.me").unwrap();
        assert!(pattern.matches("fetch.profile.me").is_some());
        assert!(pattern.matches("fetch.profile.you").is_none());
        assert!(pattern.matches("fetch.profile").is_none());
        assert!(pattern.matches("fetch.profile.me.extra").is_none());
    }

    #[test]
    fn variable_segment_binds_value() {
        let pattern = RoutePattern::parse("fetch.{user}.profile").unwrap();
        let vars = pattern.matches("fetch.alice.profile").unwrap();
        assert_eq!(vars.get("user").map(String::as_str), Some("alice"));
    }

    #[test]
    fn multiple_variables_bind_independently() {
        let pattern = RoutePattern::parse("orders.{region}.{id}").unwrap();
        let vars = pattern.matches("orders.eu.42").unwrap();
        assert_eq!(vars.get("region").map(String::as_str), Some("eu"));
        assert_eq!(vars.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn unmatched_pattern_binds_nothing() {
        let pattern = RoutePattern::parse("fetch.{user}.profile").unwrap();
        assert!(pattern.matches("store.alice.profile").is_none());
    }

    #[test]
    fn slash_delimited_routes_match_dot_patterns() {
        let pattern = RoutePattern::parse("orders/{id}").unwrap();
        let vars = pattern.matches("orders/42").unwrap();
        assert_eq!(vars.get("id").map(String::as_str), Some("42"));
        // Dot and slash delimiters are interchangeable
        let vars = pattern.matches("orders.42").unwrap();
        assert_eq!(vars.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn empty_pattern_is_config_error() {
        assert!(matches!(RoutePattern::parse(""), Err(Error::Config(_))));
    }

    #[test]
    fn unterminated_variable_is_config_error() {
        assert!(matches!(
            RoutePattern::parse("fetch.{user.profile"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unnamed_variable_is_config_error() {
        assert!(matches!(
            RoutePattern::parse("fetch.{}.profile"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_segment_is_config_error() {
        assert!(matches!(
            RoutePattern::parse("fetch..profile"),
            Err(Error::Config(_))
        ));
    }
}
