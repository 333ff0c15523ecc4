//! Wake-trigger endpoint matching
//!
//! A trigger set is an ordered list of path patterns. Each pattern is either
//! compared exactly, or split on a single `*` into a prefix and a suffix.
//! Patterns with more than one `*` never match.

/// A single configured wake-trigger pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPattern {
    raw: String,
    wildcard: Option<(String, String)>,
}

impl TriggerPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let parts: Vec<&str> = raw.split('*').collect();
        let wildcard = if parts.len() == 2 {
            Some((parts[0].to_string(), parts[1].to_string()))
        } else {
            None
        };
        Self { raw, wildcard }
    }

    /// The pattern as it appeared in configuration
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains more than one `*` and can only ever
    /// fail to match
    pub fn is_invalid(&self) -> bool {
        self.raw.matches('*').count() > 1
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.is_invalid() {
            return false;
        }
        if self.raw == path {
            return true;
        }
        // Prefix and suffix may overlap: "a*a" matches "a"
        match &self.wildcard {
            Some((prefix, suffix)) => path.starts_with(prefix.as_str()) && path.ends_with(suffix.as_str()),
            None => false,
        }
    }
}

/// Ordered, immutable set of wake-trigger patterns
#[derive(Debug, Clone, Default)]
pub struct WakeTriggerSet {
    patterns: Vec<TriggerPattern>,
}

impl WakeTriggerSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(TriggerPattern::new).collect(),
        }
    }

    /// Whether `path` should wake the backend before being forwarded
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    pub fn patterns(&self) -> &[TriggerPattern] {
        &self.patterns
    }

    /// Patterns that will never match anything
    pub fn invalid_patterns(&self) -> impl Iterator<Item = &TriggerPattern> {
        self.patterns.iter().filter(|p| p.is_invalid())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
