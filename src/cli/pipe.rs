//! CLI Pipe Support
//!
//! Lets `monitor` forward stdin lines as device commands and prints
//! wait results for scripting.

use crate::core::trace::{Collected, MatchResult};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{self, BufRead, Write};
use std::thread;

/// Line-based stdin reader
///
/// Reads on a background thread so the caller can poll with a timeout.
pub struct StdinLineReader {
    receiver: Receiver<String>,
    _thread: thread::JoinHandle<()>,
}

impl StdinLineReader {
    /// Create new line reader
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();

        let thread = thread::spawn(move || {
            Self::reader_thread(&sender);
        });

        Self {
            receiver,
            _thread: thread,
        }
    }

    fn reader_thread(sender: &Sender<String>) {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if sender.send(l).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    /// Try to receive line (non-blocking)
    pub fn try_recv_line(&self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

impl Default for StdinLineReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Output format for wait results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Collected lines, then a summary on failure
    #[default]
    Text,
    /// The whole result as one JSON object
    Json,
}

/// Render a wait result
pub fn format_result(result: &MatchResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => text_format(result),
        OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_else(|e| {
            serde_json::json!({ "error": e.to_string() }).to_string()
        }),
    }
}

fn text_format(result: &MatchResult) -> String {
    let mut out = String::new();

    match &result.collected {
        Collected::Raw(text) => {
            if !text.is_empty() {
                out.push_str(text);
                out.push('\n');
            }
        }
        Collected::Processed(records) => {
            for record in records {
                match (&record.event, &record.matched_pattern) {
                    (Some(event), _) => out.push_str(&format!("[{event}] {}\n", record.raw_line)),
                    (None, Some(pattern)) => out.push_str(&format!("[/{pattern}/] {}\n", record.raw_line)),
                    (None, None) => out.push_str(&format!("{}\n", record.raw_line)),
                }
                let mut fields: Vec<_> = record.named_fields.iter().collect();
                fields.sort();
                for (name, value) in fields {
                    out.push_str(&format!("    {name} = {value}\n"));
                }
            }
        }
    }

    if !result.success {
        if result.remaining_required.is_empty() {
            out.push_str("FAILED\n");
        } else {
            out.push_str(&format!("FAILED, not seen: {}\n", result.remaining_required.join(", ")));
        }
    }

    out
}

/// Write one line to stdout and flush
pub fn write_line(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()
}
