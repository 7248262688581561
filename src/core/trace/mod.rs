//! Trace wait queries and results
//!
//! A [`TraceQuery`] describes what to look for in captured device output;
//! a [`TraceWaiter`] evaluates it against a session's read queue and
//! produces a [`MatchResult`].

mod waiter;

pub use waiter::TraceWaiter;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default wait budget in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Which processed lines are kept in the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionPolicy {
    /// Only the final line processed before stopping
    #[default]
    LastOnly,
    /// Lines that matched a required or avoided pattern
    Matching,
    /// Every processed line
    All,
}

/// Shape of collected trace data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Newline-joined text
    #[default]
    Raw,
    /// Structured [`TraceRecord`]s
    Processed,
}

/// Options shared by pattern and event waits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitOptions {
    /// Budget in milliseconds; 0 waits forever
    pub timeout_ms: u64,
    /// Which lines to keep
    pub collection: CollectionPolicy,
    /// How kept lines are returned
    pub format: ResponseFormat,
    /// Stop as soon as any one required pattern matches
    pub return_on_first_match: bool,
    /// Evaluate lines queued before the wait began
    pub use_backlog: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            collection: CollectionPolicy::default(),
            format: ResponseFormat::default(),
            return_on_first_match: false,
            use_backlog: true,
        }
    }
}

macro_rules! wait_option_setters {
    () => {
        /// Set the wait budget in milliseconds (0 waits forever)
        #[must_use]
        pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
            self.options.timeout_ms = timeout_ms;
            self
        }

        /// Set the collection policy
        #[must_use]
        pub fn collect(mut self, collection: $crate::core::trace::CollectionPolicy) -> Self {
            self.options.collection = collection;
            self
        }

        /// Set the response format
        #[must_use]
        pub fn format(mut self, format: $crate::core::trace::ResponseFormat) -> Self {
            self.options.format = format;
            self
        }

        /// Stop on the first required match
        #[must_use]
        pub fn return_on_first_match(mut self, value: bool) -> Self {
            self.options.return_on_first_match = value;
            self
        }

        /// Include or purge the backlog
        #[must_use]
        pub fn use_backlog(mut self, value: bool) -> Self {
            self.options.use_backlog = value;
            self
        }

        /// Replace all options at once
        #[must_use]
        pub fn with_options(mut self, options: $crate::core::trace::WaitOptions) -> Self {
            self.options = options;
            self
        }
    };
}

pub(crate) use wait_option_setters;

/// Pattern wait parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceQuery {
    /// Regexes that must each be seen; removed as they match
    pub required: Vec<String>,
    /// Regexes whose appearance fails the wait
    pub avoided: Vec<String>,
    /// Timing, collection and format options
    pub options: WaitOptions,
}

impl TraceQuery {
    /// Empty query with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required pattern
    #[must_use]
    pub fn require(mut self, pattern: impl Into<String>) -> Self {
        self.required.push(pattern.into());
        self
    }

    /// Add several required patterns
    #[must_use]
    pub fn require_all<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Add an avoided pattern
    #[must_use]
    pub fn avoid(mut self, pattern: impl Into<String>) -> Self {
        self.avoided.push(pattern.into());
        self
    }

    /// Add several avoided patterns
    #[must_use]
    pub fn avoid_all<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.avoided.extend(patterns.into_iter().map(Into::into));
        self
    }

    wait_option_setters!();
}

/// One processed trace line with its match metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Line as captured (trimmed)
    pub raw_line: String,
    /// Pattern that matched this line, if any
    pub matched_pattern: Option<String>,
    /// Named capture groups from the match
    pub named_fields: HashMap<String, String>,
    /// Event bound to `matched_pattern`, filled in by event waits
    pub event: Option<String>,
}

impl TraceRecord {
    /// Named capture group value
    pub fn field(&self, name: &str) -> Option<&str> {
        self.named_fields.get(name).map(String::as_str)
    }
}

/// Lines kept by a wait, shaped by [`ResponseFormat`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "snake_case")]
pub enum Collected {
    /// Newline-joined text
    Raw(String),
    /// Structured records in processing order
    Processed(Vec<TraceRecord>),
}

impl Collected {
    /// Empty collection of the given format
    pub fn empty(format: ResponseFormat) -> Self {
        match format {
            ResponseFormat::Raw => Self::Raw(String::new()),
            ResponseFormat::Processed => Self::Processed(Vec::new()),
        }
    }

    /// Raw text, if this is a raw collection
    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Self::Raw(text) => Some(text),
            Self::Processed(_) => None,
        }
    }

    /// Records, if this is a processed collection
    pub fn records(&self) -> Option<&[TraceRecord]> {
        match self {
            Self::Raw(_) => None,
            Self::Processed(records) => Some(records),
        }
    }

    /// Text of the kept lines, whatever the format
    pub fn lines(&self) -> Vec<&str> {
        match self {
            Self::Raw(text) if text.is_empty() => Vec::new(),
            Self::Raw(text) => text.lines().collect(),
            Self::Processed(records) => records.iter().map(|r| r.raw_line.as_str()).collect(),
        }
    }

    /// Number of kept lines
    pub fn len(&self) -> usize {
        self.lines().len()
    }

    /// No lines kept
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// All required patterns seen (or first one, when returning on first match)
    /// and no avoided pattern seen
    pub success: bool,
    /// Kept lines
    pub collected: Collected,
    /// Required patterns (or events) never matched
    pub remaining_required: Vec<String>,
}

impl MatchResult {
    /// Failed result carrying everything as remaining
    pub fn failed(format: ResponseFormat, remaining_required: Vec<String>) -> Self {
        Self {
            success: false,
            collected: Collected::empty(format),
            remaining_required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let query = TraceQuery::new();
        assert_eq!(query.options.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(query.options.collection, CollectionPolicy::LastOnly);
        assert_eq!(query.options.format, ResponseFormat::Raw);
        assert!(query.options.use_backlog);
        assert!(!query.options.return_on_first_match);
    }

    #[test]
    fn test_builder() {
        let query = TraceQuery::new()
            .require("READY")
            .require_all(["A", "B"])
            .avoid("ERROR")
            .timeout_ms(250)
            .collect(CollectionPolicy::All)
            .format(ResponseFormat::Processed)
            .use_backlog(false);

        assert_eq!(query.required, vec!["READY", "A", "B"]);
        assert_eq!(query.avoided, vec!["ERROR"]);
        assert_eq!(query.options.timeout_ms, 250);
        assert_eq!(query.options.collection, CollectionPolicy::All);
        assert!(!query.options.use_backlog);
    }

    #[test]
    fn test_collected_lines() {
        assert!(Collected::Raw(String::new()).is_empty());
        assert_eq!(Collected::Raw("a\nb".into()).lines(), vec!["a", "b"]);

        let records = Collected::Processed(vec![TraceRecord {
            raw_line: "boot ok".into(),
            ..Default::default()
        }]);
        assert_eq!(records.len(), 1);
        assert!(records.as_raw().is_none());
    }

    #[test]
    fn test_result_serializes() {
        let result = MatchResult::failed(ResponseFormat::Raw, vec!["OK".into()]);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"format\":\"raw\""));
    }
}
