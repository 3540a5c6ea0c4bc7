//! Host matching for requests that must bypass the engine.

use crate::Url;
use tracing::trace;

/// Type of host pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact host match.
    Exact,
    /// Host ends with the pattern (e.g., a registrable domain).
    Suffix,
    /// Host contains the pattern anywhere.
    Contains,
}

/// Pattern checked against a request's host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    pub pattern_type: PatternType,
    pub pattern: String,
}

impl HostPattern {
    /// Create an exact host pattern.
    pub fn exact(host: &str) -> Self {
        Self {
            pattern_type: PatternType::Exact,
            pattern: host.to_ascii_lowercase(),
        }
    }

    /// Create a suffix pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self {
            pattern_type: PatternType::Suffix,
            pattern: suffix.to_ascii_lowercase(),
        }
    }

    /// Create a substring pattern.
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern_type: PatternType::Contains,
            pattern: substring.to_ascii_lowercase(),
        }
    }

    /// Check a bare host name. `url` already lowercases hosts.
    pub fn matches_host(&self, host: &str) -> bool {
        match self.pattern_type {
            PatternType::Exact => host == self.pattern,
            PatternType::Suffix => host.ends_with(&self.pattern),
            PatternType::Contains => host.contains(&self.pattern),
        }
    }

    /// Check the host of a URL. URLs without a host never match.
    pub fn matches(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| self.matches_host(host))
    }
}

/// Ordered set of host patterns; a request matching any of them is left
/// entirely to the network.
#[derive(Debug, Clone, Default)]
pub struct BypassList {
    patterns: Vec<HostPattern>,
}

impl BypassList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list of substring patterns.
    pub fn from_substrings<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: hosts
                .into_iter()
                .filter(|h| !h.as_ref().is_empty())
                .map(|h| HostPattern::contains(h.as_ref()))
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[HostPattern] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First pattern matching the URL's host.
    pub fn find(&self, url: &Url) -> Option<&HostPattern> {
        let found = self.patterns.iter().find(|p| p.matches(url));
        if let Some(pattern) = found {
            trace!(url = %url, pattern = %pattern.pattern, "Bypass pattern matched");
        }
        found
    }

    pub fn matches(&self, url: &Url) -> bool {
        self.find(url).is_some()
    }
}
