//! Bidirectional event ↔ pattern map
//!
//! Lets callers wait on symbolic events ("boot_complete") instead of raw
//! regexes. Both directions are unique: an event names exactly one pattern
//! and a pattern identifies exactly one event.

use super::error::{CaptureError, Result};
use super::trace::{wait_option_setters, Collected, MatchResult, TraceQuery, WaitOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event name ↔ trace pattern bindings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMap {
    order: Vec<String>,
    by_event: HashMap<String, String>,
    by_pattern: HashMap<String, String>,
}

impl EventMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(event, pattern)` pairs, rejecting any repeat
    pub fn from_pairs<I, E, P>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (E, P)>,
        E: Into<String>,
        P: Into<String>,
    {
        let mut map = Self::new();
        for (event, pattern) in pairs {
            map.insert(event, pattern)?;
        }
        Ok(map)
    }

    /// Add one binding; the map is unchanged on collision
    pub fn insert(&mut self, event: impl Into<String>, pattern: impl Into<String>) -> Result<()> {
        let event = event.into();
        let pattern = pattern.into();

        if let Some(existing) = self.by_event.get(&event) {
            return Err(CaptureError::InvalidEventMap(format!(
                "event [{event}] already bound to pattern [{existing}]"
            )));
        }
        if let Some(existing) = self.by_pattern.get(&pattern) {
            return Err(CaptureError::InvalidEventMap(format!(
                "pattern [{pattern}] already bound to event [{existing}]"
            )));
        }

        self.order.push(event.clone());
        self.by_pattern.insert(pattern.clone(), event.clone());
        self.by_event.insert(event, pattern);
        Ok(())
    }

    /// Pattern bound to `event`
    pub fn pattern_for(&self, event: &str) -> Option<&str> {
        self.by_event.get(event).map(String::as_str)
    }

    /// Event bound to `pattern`
    pub fn event_for(&self, pattern: &str) -> Option<&str> {
        self.by_pattern.get(pattern).map(String::as_str)
    }

    /// Patterns for `events`, in the same order
    pub fn patterns_for_events<S: AsRef<str>>(&self, events: &[S]) -> Result<Vec<String>> {
        events
            .iter()
            .map(|event| {
                let event = event.as_ref();
                self.pattern_for(event)
                    .map(str::to_string)
                    .ok_or_else(|| CaptureError::UnknownEvent(event.to_string()))
            })
            .collect()
    }

    /// Bindings in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .filter_map(|event| self.by_event.get(event).map(|p| (event.as_str(), p.as_str())))
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// No bindings
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Fill in events on processed records and map remaining patterns back
    /// to event names. Patterns without a binding are kept as-is.
    pub fn resolve(&self, mut result: MatchResult) -> MatchResult {
        if let Collected::Processed(records) = &mut result.collected {
            for record in records.iter_mut() {
                record.event = record
                    .matched_pattern
                    .as_deref()
                    .and_then(|p| self.event_for(p))
                    .map(str::to_string);
            }
        }

        result.remaining_required = result
            .remaining_required
            .into_iter()
            .map(|pattern| self.event_for(&pattern).map(str::to_string).unwrap_or(pattern))
            .collect();

        result
    }
}

/// Event wait parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    /// Events that must each be seen
    pub required: Vec<String>,
    /// Events whose appearance fails the wait
    pub avoided: Vec<String>,
    /// Timing, collection and format options
    pub options: WaitOptions,
}

impl EventQuery {
    /// Empty query with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required event
    #[must_use]
    pub fn require(mut self, event: impl Into<String>) -> Self {
        self.required.push(event.into());
        self
    }

    /// Add several required events
    #[must_use]
    pub fn require_all<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(events.into_iter().map(Into::into));
        self
    }

    /// Add an avoided event
    #[must_use]
    pub fn avoid(mut self, event: impl Into<String>) -> Self {
        self.avoided.push(event.into());
        self
    }

    /// Add several avoided events
    #[must_use]
    pub fn avoid_all<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.avoided.extend(events.into_iter().map(Into::into));
        self
    }

    wait_option_setters!();

    /// Translate to a pattern query through `map`
    pub fn to_trace_query(&self, map: &EventMap) -> Result<TraceQuery> {
        if self.required.is_empty() {
            return Err(CaptureError::MalformedQuery("no required events".to_string()));
        }

        Ok(TraceQuery {
            required: map.patterns_for_events(self.required.as_slice())?,
            avoided: map.patterns_for_events(self.avoided.as_slice())?,
            options: self.options.clone(),
        })
    }
}
