use crate::cache::{Cache, new_map};
use crate::context::RequestContext;
use crate::router::path::{PathMatcher, PathMatcherError, PathVariables};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

const SEPARATOR: char = '/';
const DOUBLE_WILDCARD: &str = "**";

/// One compiled pattern segment and the variable names its groups bind to.
struct SegmentPattern {
    regex: Regex,
    names: Vec<String>,
}

struct SegmentCache {
    segments: DashMap<String, Arc<SegmentPattern>, FnvBuildHasher>,
}

impl Cache<String, SegmentPattern> for SegmentCache {
    fn inner(&self) -> &DashMap<String, Arc<SegmentPattern>, FnvBuildHasher> {
        &self.segments
    }

    fn cache_id(&self) -> &'static str {
        "GlobPathMatcher"
    }
}

static SEGMENTS: Lazy<SegmentCache> = Lazy::new(|| SegmentCache {
    segments: new_map(),
});

fn tokenize(path: &str) -> Vec<&str> {
    path.split(SEPARATOR)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect()
}

fn is_literal(segment: &str) -> bool {
    !segment.contains(['*', '?', '{', '}'])
}

fn flush(expr: &mut String, literal: &mut String) {
    if !literal.is_empty() {
        expr.push_str(&regex::escape(literal));
        literal.clear();
    }
}

/// Translates one segment into an anchored regex.
///
/// # Behavior
/// - `?` matches one character, `*` zero or more.
/// - `{name}` captures anything into `name`.
/// - `{name:regex}` captures what `regex` matches; braces inside `regex` nest.
/// - A custom regex that defines capturing groups of its own is rejected,
///   since its groups could no longer be paired with variable names.
fn compile_segment(segment: &str) -> Result<SegmentPattern, PathMatcherError> {
    let mut expr = String::from("^");
    let mut literal = String::new();
    let mut names = Vec::new();
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        match c {
            '?' => {
                flush(&mut expr, &mut literal);
                expr.push('.');
            }
            '*' => {
                flush(&mut expr, &mut literal);
                expr.push_str(".*");
            }
            '{' => {
                flush(&mut expr, &mut literal);
                let mut depth = 1usize;
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('{') => {
                            depth += 1;
                            body.push('{');
                        }
                        Some('}') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            body.push('}');
                        }
                        Some(other) => body.push(other),
                        None => {
                            return Err(PathMatcherError::invalid_pattern(segment, "unclosed '{'"));
                        }
                    }
                }
                match body.split_once(':') {
                    Some((name, custom)) => {
                        names.push(name.trim().to_string());
                        expr.push('(');
                        expr.push_str(custom);
                        expr.push(')');
                    }
                    None => {
                        names.push(body.trim().to_string());
                        expr.push_str("((?s:.*))");
                    }
                }
            }
            '}' => return Err(PathMatcherError::invalid_pattern(segment, "unbalanced '}'")),
            other => literal.push(other),
        }
    }
    flush(&mut expr, &mut literal);
    expr.push('$');

    let regex = Regex::new(&expr)
        .map_err(|e| PathMatcherError::invalid_pattern(segment, e.to_string()))?;
    let captured = regex.captures_len() - 1;
    if captured != names.len() {
        return Err(PathMatcherError::group_mismatch(segment, names.len(), captured));
    }
    Ok(SegmentPattern { regex, names })
}

fn segment_pattern(segment: &str) -> Result<Arc<SegmentPattern>, PathMatcherError> {
    if let Some(found) = SEGMENTS.inner().get(segment) {
        return Ok(found.value().clone());
    }
    SEGMENTS.get_or_resolve(segment.to_string(), || compile_segment(segment).map(Arc::new))
}

fn match_segment(
    pattern: &str,
    value: &str,
    variables: &mut PathVariables,
) -> Result<bool, PathMatcherError> {
    if pattern == "*" {
        return Ok(true);
    }
    if is_literal(pattern) {
        return Ok(pattern == value);
    }
    let compiled = segment_pattern(pattern)?;
    let Some(captures) = compiled.regex.captures(value) else {
        return Ok(false);
    };
    for (index, name) in compiled.names.iter().enumerate() {
        if let Some(found) = captures.get(index + 1) {
            variables.insert(name.clone(), found.as_str().to_string());
        }
    }
    Ok(true)
}

fn only_double_wildcards(tokens: &[&str], from: isize, to: isize) -> bool {
    (from..=to).all(|i| tokens[i as usize] == DOUBLE_WILDCARD)
}

/// Matches head segments up to the first `**`, tail segments back to the last
/// `**`, then places each run of segments between two `**` at its earliest
/// position in what remains of the path.
fn do_match(
    pattern: &str,
    path: &str,
    variables: &mut PathVariables,
) -> Result<bool, PathMatcherError> {
    if path.starts_with(SEPARATOR) != pattern.starts_with(SEPARATOR) {
        return Ok(false);
    }
    let tokens = tokenize(pattern);
    let dirs = tokenize(path);

    let mut pat_start: isize = 0;
    let mut pat_end = tokens.len() as isize - 1;
    let mut path_start: isize = 0;
    let mut path_end = dirs.len() as isize - 1;

    while pat_start <= pat_end && path_start <= path_end {
        let token = tokens[pat_start as usize];
        if token == DOUBLE_WILDCARD {
            break;
        }
        if !match_segment(token, dirs[path_start as usize], variables)? {
            return Ok(false);
        }
        pat_start += 1;
        path_start += 1;
    }

    if path_start > path_end {
        if pat_start > pat_end {
            return Ok(pattern.ends_with(SEPARATOR) == path.ends_with(SEPARATOR));
        }
        if pat_start == pat_end && tokens[pat_start as usize] == "*" && path.ends_with(SEPARATOR) {
            return Ok(true);
        }
        return Ok(only_double_wildcards(&tokens, pat_start, pat_end));
    }
    if pat_start > pat_end {
        return Ok(false);
    }

    while pat_start <= pat_end && path_start <= path_end {
        let token = tokens[pat_end as usize];
        if token == DOUBLE_WILDCARD {
            break;
        }
        if !match_segment(token, dirs[path_end as usize], variables)? {
            return Ok(false);
        }
        pat_end -= 1;
        path_end -= 1;
    }
    if path_start > path_end {
        return Ok(only_double_wildcards(&tokens, pat_start, pat_end));
    }

    while pat_start != pat_end && path_start <= path_end {
        let Some(next) = (pat_start + 1..=pat_end).find(|i| tokens[*i as usize] == DOUBLE_WILDCARD)
        else {
            break;
        };
        if next == pat_start + 1 {
            // `**/**`
            pat_start += 1;
            continue;
        }
        let run = next - pat_start - 1;
        let available = path_end - path_start + 1;
        let mut found = None;
        'placement: for offset in 0..=(available - run) {
            let mut attempt = PathVariables::new();
            for j in 0..run {
                let token = tokens[(pat_start + j + 1) as usize];
                let dir = dirs[(path_start + offset + j) as usize];
                if !match_segment(token, dir, &mut attempt)? {
                    continue 'placement;
                }
            }
            variables.extend(attempt);
            found = Some(path_start + offset);
            break;
        }
        let Some(found) = found else {
            return Ok(false);
        };
        pat_start = next;
        path_start = found + run;
    }

    Ok(only_double_wildcards(&tokens, pat_start, pat_end))
}

/// Ant-style path patterns.
///
/// | token            | matches                                   |
/// |------------------|-------------------------------------------|
/// | `?`              | one character                             |
/// | `*`              | zero or more characters within a segment  |
/// | `**`             | zero or more segments                     |
/// | `{name}`         | a segment part, bound to `name`           |
/// | `{name:[a-z]+}`  | a segment part matching the regex         |
///
/// Segments are trimmed and empty ones ignored. A leading `/` must be present
/// on both or neither side. Compiled segments are shared process-wide.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobPathMatcher;

impl PathMatcher for GlobPathMatcher {
    fn matches(&self, ctx: &RequestContext, pattern: &str, path: &str) -> Option<PathVariables> {
        let mut variables = PathVariables::new();
        match do_match(pattern, path, &mut variables) {
            Ok(true) => Some(variables),
            Ok(false) => None,
            Err(e) => {
                log::warn!("{}: pattern '{}' cannot be matched: {}", ctx.id(), pattern, e);
                None
            }
        }
    }

    fn validate(&self, pattern: &str) -> Result<(), PathMatcherError> {
        for token in tokenize(pattern) {
            if token != DOUBLE_WILDCARD && !is_literal(token) {
                segment_pattern(token)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{MemoryRequest, context_for};

    fn glob(pattern: &str, path: &str) -> Option<PathVariables> {
        let ctx = context_for(MemoryRequest::get("/").build());
        GlobPathMatcher.matches(&ctx, pattern, path)
    }

    #[test]
    fn single_wildcard_spans_one_segment() {
        assert_eq!(glob("a/*/c", "a/b/c"), Some(PathVariables::new()));
        assert!(glob("a/*/c", "a/b/d").is_none());
        assert!(glob("a/*/c", "a/b/x/c").is_none());
        assert!(glob("/x/*.html", "/x/index.html").is_some());
        assert!(glob("/a/?c", "/a/bc").is_some());
        assert!(glob("/a/?c", "/a/bbc").is_none());
    }

    #[test]
    fn leading_separator_must_agree() {
        assert!(glob("a/b", "/a/b").is_none());
        assert!(glob("/a/b", "a/b").is_none());
        assert!(glob("/a/b", "/a/b").is_some());
        assert!(glob("/a/b", "/a/b/").is_none());
    }

    #[test]
    fn double_wildcard_spans_segments() {
        assert!(glob("/files/**", "/files").is_some());
        assert!(glob("/files/**", "/files/a/b/c").is_some());
        assert!(glob("/**/b/**/d", "/a/b/c/d").is_some());
        assert!(glob("/**/b/**/d", "/a/c/d").is_none());
        assert!(glob("/**/**/x", "/x").is_some());
        assert!(glob("/a/**/z", "/a/b/c").is_none());
        assert!(glob("/**", "/").is_some());
    }

    #[test]
    fn template_variables_are_extracted() {
        let variables = glob("/users/{id}/orders/{order:[0-9]+}", "/users/ann/orders/17").unwrap();
        assert_eq!(variables["id"], "ann");
        assert_eq!(variables["order"], "17");
        assert!(glob("/users/{id}/orders/{order:[0-9]+}", "/users/ann/orders/x").is_none());

        let variables = glob("/**/report-{year:[0-9]{4}}.pdf", "/a/b/report-2024.pdf").unwrap();
        assert_eq!(variables["year"], "2024");
    }

    #[test]
    fn extra_capturing_groups_are_rejected() {
        assert!(glob("/a/{x:(b)}", "/a/b").is_none());
        assert!(matches!(
            GlobPathMatcher.validate("/a/{x:(b)}"),
            Err(PathMatcherError::GroupMismatch { declared: 1, captured: 2, .. })
        ));
        assert!(GlobPathMatcher.validate("/a/{x:(?:b|c)}").is_ok());
        assert!(matches!(
            GlobPathMatcher.validate("/a/{x"),
            Err(PathMatcherError::InvalidPattern { .. })
        ));
        assert!(GlobPathMatcher.validate("/a/x}").is_err());
    }
}
