// Skip-list matching shared by every middleware

use std::collections::HashSet;

/// Exact paths are looked up in a set; prefixes are scanned in order.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl PathMatcher {
    pub fn new<P, Q>(paths: P, prefixes: Q) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        Q: IntoIterator,
        Q::Item: Into<String>,
    {
        Self {
            exact: paths.into_iter().map(Into::into).collect(),
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn should_skip(&self, path: &str) -> bool {
        self.exact.contains(path) || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_prefix() {
        let matcher = PathMatcher::new(["/health", "/metrics"], ["/static/", "/debug"]);

        assert!(matcher.should_skip("/health"));
        assert!(matcher.should_skip("/metrics"));
        assert!(matcher.should_skip("/static/app.js"));
        assert!(matcher.should_skip("/debug/pprof"));

        assert!(!matcher.should_skip("/health/deep"));
        assert!(!matcher.should_skip("/api/health"));
        assert!(!matcher.should_skip("/"));
    }

    #[test]
    fn test_empty_prefix_never_matches_everything() {
        let matcher = PathMatcher::new(Vec::<String>::new(), [""]);
        assert!(matcher.is_empty());
        assert!(!matcher.should_skip("/api"));
    }
}
