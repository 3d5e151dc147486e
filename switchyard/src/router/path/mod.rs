pub mod glob;
pub mod regex;

pub use self::glob::GlobPathMatcher;
pub use self::regex::RegexPathMatcher;

use crate::context::RequestContext;
use std::collections::HashMap;
use thiserror::Error;

/// Variables a matcher extracted from the request path, by name.
pub type PathVariables = HashMap<String, String>;

/// Errors raised while checking or compiling a route pattern.
#[derive(Error, Debug)]
pub enum PathMatcherError {
    #[error("Pattern '{pattern}' is invalid. {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Segment '{segment}' declares {declared} variables but its regex captures {captured} groups")]
    GroupMismatch {
        segment: String,
        declared: usize,
        captured: usize,
    },
}

impl PathMatcherError {
    #[inline]
    pub(crate) fn invalid_pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) fn group_mismatch(segment: impl Into<String>, declared: usize, captured: usize) -> Self {
        Self::GroupMismatch {
            segment: segment.into(),
            declared,
            captured,
        }
    }
}

/// Tests a route pattern against a request path.
///
/// # Behavior
/// Implementations are stateless apart from compiled-pattern caches, so one
/// instance is shared by every route that names it. A matcher type is picked
/// per route; it is looked up in the component table first and built with
/// `Default` otherwise.
pub trait PathMatcher: Send + Sync + 'static {
    /// Returns the extracted variables when `path` matches `pattern`, `None`
    /// otherwise. A pattern without variables yields an empty map on a match.
    fn matches(&self, ctx: &RequestContext, pattern: &str, path: &str) -> Option<PathVariables>;

    /// Called once per route while the route table is built. A failing
    /// pattern causes the route to be skipped.
    fn validate(&self, _pattern: &str) -> Result<(), PathMatcherError> {
        Ok(())
    }
}
