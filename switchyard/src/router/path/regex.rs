use crate::cache::{Cache, new_map};
use crate::context::RequestContext;
use crate::router::path::{PathMatcher, PathMatcherError, PathVariables};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

struct PatternCache {
    patterns: DashMap<String, Arc<Regex>, FnvBuildHasher>,
}

impl Cache<String, Regex> for PatternCache {
    fn inner(&self) -> &DashMap<String, Arc<Regex>, FnvBuildHasher> {
        &self.patterns
    }

    fn cache_id(&self) -> &'static str {
        "RegexPathMatcher"
    }
}

static PATTERNS: Lazy<PatternCache> = Lazy::new(|| PatternCache {
    patterns: new_map(),
});

fn compile(pattern: &str) -> Result<Arc<Regex>, PathMatcherError> {
    if let Some(found) = PATTERNS.inner().get(pattern) {
        return Ok(found.value().clone());
    }
    PATTERNS.get_or_resolve(pattern.to_string(), || {
        Regex::new(&format!("^(?:{})$", pattern))
            .map(Arc::new)
            .map_err(|e| PathMatcherError::invalid_pattern(pattern, e.to_string()))
    })
}

/// Treats the route pattern as a regular expression that must match the
/// whole path. Named capture groups become path variables.
///
/// Compiled patterns are shared process-wide.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexPathMatcher;

impl PathMatcher for RegexPathMatcher {
    fn matches(&self, ctx: &RequestContext, pattern: &str, path: &str) -> Option<PathVariables> {
        let regex = match compile(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                log::warn!("{}: {}", ctx.id(), e);
                return None;
            }
        };
        let captures = regex.captures(path)?;
        let variables = regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|value| (name.to_string(), value.as_str().to_string()))
            })
            .collect();
        Some(variables)
    }

    fn validate(&self, pattern: &str) -> Result<(), PathMatcherError> {
        compile(pattern).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{MemoryRequest, context_for};

    #[test]
    fn named_groups_become_variables() {
        let ctx = context_for(MemoryRequest::get("/").build());
        let matcher = RegexPathMatcher;
        let pattern = "^/user/(?<id>[0-9]+)$";
        let variables = matcher.matches(&ctx, pattern, "/user/42").unwrap();
        assert_eq!(variables.get("id").map(String::as_str), Some("42"));
        assert_eq!(variables.len(), 1);
        assert!(matcher.matches(&ctx, pattern, "/user/abc").is_none());
    }

    #[test]
    fn match_is_anchored() {
        let ctx = context_for(MemoryRequest::get("/").build());
        let matcher = RegexPathMatcher;
        assert!(matcher.matches(&ctx, "/files/.+", "/files/a/b").unwrap().is_empty());
        assert!(matcher.matches(&ctx, "/files", "/files/a").is_none());
        assert!(matcher.matches(&ctx, "/files", "/api/files").is_none());
    }

    #[test]
    fn malformed_pattern_never_matches() {
        let ctx = context_for(MemoryRequest::get("/").build());
        let matcher = RegexPathMatcher;
        assert!(matcher.matches(&ctx, "/broken/(", "/broken/(").is_none());
        assert!(matches!(
            matcher.validate("/broken/("),
            Err(PathMatcherError::InvalidPattern { .. })
        ));
        assert!(matcher.validate("/ok/[a-z]+").is_ok());
    }
}
