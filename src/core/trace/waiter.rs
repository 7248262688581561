//! Trace pattern-match engine

use super::{Collected, CollectionPolicy, MatchResult, ResponseFormat, TraceQuery, TraceRecord};
use crate::core::error::{CaptureError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use regex::{Captures, Regex, RegexBuilder};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Receive slice for unbounded waits
const IDLE_TICK: Duration = Duration::from_millis(50);

struct CompiledPattern {
    source: String,
    regex: Regex,
}

impl CompiledPattern {
    fn compile(source: &str) -> std::result::Result<Self, regex::Error> {
        let regex = RegexBuilder::new(source).case_insensitive(true).build()?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    fn record(&self, line: &str, captures: &Captures<'_>) -> TraceRecord {
        let named_fields: HashMap<String, String> = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| captures.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();

        TraceRecord {
            raw_line: line.to_string(),
            matched_pattern: Some(self.source.clone()),
            named_fields,
            event: None,
        }
    }
}

fn compile_all(patterns: &[String]) -> std::result::Result<Vec<CompiledPattern>, regex::Error> {
    patterns.iter().map(|p| CompiledPattern::compile(p)).collect()
}

/// Applies the collection policy and response format to processed lines
struct Collector {
    policy: CollectionPolicy,
    format: ResponseFormat,
    kept: Vec<TraceRecord>,
}

impl Collector {
    fn new(policy: CollectionPolicy, format: ResponseFormat) -> Self {
        Self {
            policy,
            format,
            kept: Vec::new(),
        }
    }

    fn push(&mut self, record: TraceRecord) {
        match self.policy {
            CollectionPolicy::All => self.kept.push(record),
            CollectionPolicy::Matching => {
                if record.matched_pattern.is_some() {
                    self.kept.push(record);
                }
            }
            CollectionPolicy::LastOnly => {
                self.kept.clear();
                self.kept.push(record);
            }
        }
    }

    fn finish(self) -> Collected {
        match self.format {
            ResponseFormat::Raw => Collected::Raw(
                self.kept
                    .iter()
                    .map(|r| r.raw_line.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            ResponseFormat::Processed => Collected::Processed(self.kept),
        }
    }
}

/// Evaluates [`TraceQuery`]s against a queue of captured lines
///
/// Lines are consumed in arrival order. Each required pattern is removed the
/// first time it matches; any avoided match ends the wait with failure, even
/// on the line that satisfied the last required pattern.
#[derive(Debug, Clone)]
pub struct TraceWaiter {
    source: Receiver<String>,
}

impl TraceWaiter {
    /// Waiter reading from `source`
    pub fn new(source: Receiver<String>) -> Self {
        Self { source }
    }

    /// Discard every queued line, returning how many were dropped
    pub fn purge(&self) -> usize {
        self.source.try_iter().count()
    }

    /// Reject contradictory or empty parameters
    pub fn validate(query: &TraceQuery) -> Result<()> {
        if let Some(p) = query
            .required
            .iter()
            .chain(query.avoided.iter())
            .find(|p| p.trim().is_empty())
        {
            return Err(CaptureError::MalformedQuery(format!("empty pattern {p:?}")));
        }

        if let Some(p) = query.required.iter().find(|p| query.avoided.contains(p)) {
            return Err(CaptureError::MalformedQuery(format!(
                "pattern {p:?} is both required and avoided"
            )));
        }

        if query.required.is_empty() && query.options.return_on_first_match {
            return Err(CaptureError::MalformedQuery(
                "return_on_first_match needs at least one required pattern".to_string(),
            ));
        }

        Ok(())
    }

    /// Wait for `query` to be satisfied.
    ///
    /// Errors only for malformed parameters. Timeouts, avoided matches and
    /// patterns that fail to compile come back as `success == false`.
    pub fn wait(&self, query: &TraceQuery) -> Result<MatchResult> {
        Self::validate(query)?;

        let options = &query.options;

        if !options.use_backlog {
            let purged = self.purge();
            tracing::debug!("Purged {} backlog traces", purged);
        }

        let (mut remaining, avoided) = match (compile_all(&query.required), compile_all(&query.avoided)) {
            (Ok(required), Ok(avoided)) => (required, avoided),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Trace wait aborted, bad pattern: {}", e);
                return Ok(MatchResult::failed(options.format, query.required.clone()));
            }
        };

        tracing::debug!("looking for traces: {:?}", query.required);

        let nothing_required = remaining.is_empty();
        let budget = (options.timeout_ms != 0).then(|| Duration::from_millis(options.timeout_ms));
        let start = Instant::now();
        let mut collector = Collector::new(options.collection, options.format);

        let success = loop {
            let received = match budget {
                Some(budget) => {
                    if start.elapsed() >= budget {
                        tracing::debug!("Trace wait timed out after {:?}", budget);
                        break false;
                    }
                    self.source.recv_deadline(start + budget)
                }
                None => self.source.recv_timeout(IDLE_TICK),
            };

            let line = match received {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Trace source closed during wait");
                    break false;
                }
            };

            let line = line.trim();
            tracing::trace!("<-- {}", line);

            let mut record: Option<TraceRecord> = None;
            let before = remaining.len();
            remaining.retain(|pattern| match pattern.regex.captures(line) {
                Some(captures) => {
                    if record.is_none() {
                        record = Some(pattern.record(line, &captures));
                    }
                    false
                }
                None => true,
            });
            let matched_required = remaining.len() < before;

            let avoided_hit = avoided
                .iter()
                .find_map(|pattern| pattern.regex.captures(line).map(|captures| pattern.record(line, &captures)));
            let hit_avoided = avoided_hit.is_some();
            if record.is_none() {
                record = avoided_hit;
            }

            let outcome = if hit_avoided {
                tracing::debug!("found response to avoid [{}]", line);
                Some(false)
            } else if nothing_required {
                tracing::debug!("Nothing required, accepting first trace");
                Some(true)
            } else if matched_required && options.return_on_first_match {
                tracing::debug!("Found a match. returning immediately");
                Some(true)
            } else if matched_required && remaining.is_empty() {
                tracing::debug!("Found last required match");
                Some(true)
            } else {
                None
            };

            collector.push(record.unwrap_or_else(|| TraceRecord {
                raw_line: line.to_string(),
                ..TraceRecord::default()
            }));

            if let Some(success) = outcome {
                break success;
            }
        };

        Ok(MatchResult {
            success,
            collected: collector.finish(),
            remaining_required: remaining.into_iter().map(|p| p.source).collect(),
        })
    }
}
