//! Per-execution output collector.
//!
//! Every diagnostic call made by sandboxed code (`console.log`, `console.error`,
//! `console.warn`, `console.info`) ends up here as exactly one line, in call
//! order. Argument rendering happens inside the realm; the collector only sees
//! the already-joined text and adds the severity tag.
//!
//! The buffer is bounded. Once recording a line would push the total past the
//! configured byte cap, the collector keeps whatever still fits of that line,
//! appends a single sentinel line and silently drops everything after it, so a
//! script logging in a tight loop cannot grow host memory without bound.

use serde::{Deserialize, Serialize};

use crate::utils::text::truncate_on_char_boundary;

/// Severity of a diagnostic call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Log,
    Error,
    Warn,
    Info,
}

impl Severity {
    /// Prefix written in front of the line (empty for plain log calls).
    pub fn tag(self) -> &'static str {
        match self {
            Severity::Log => "",
            Severity::Error => "ERROR: ",
            Severity::Warn => "WARNING: ",
            Severity::Info => "INFO: ",
        }
    }

    /// Maps the numeric code used by the realm prelude back to a severity.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Severity::Log),
            1 => Some(Severity::Error),
            2 => Some(Severity::Warn),
            3 => Some(Severity::Info),
            _ => None,
        }
    }
}

/// Finalized, read-only output of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedOutput {
    /// Recorded lines, in call order. Includes the truncation sentinel if any.
    pub lines: Vec<String>,
    /// Whether the byte cap was hit and later lines were dropped.
    pub truncated: bool,
}

impl CollectedOutput {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Append-only line buffer bound to a single realm.
#[derive(Debug)]
pub struct OutputCollector {
    lines: Vec<String>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
    finished: bool,
}

impl OutputCollector {
    /// Creates an empty collector that buffers at most `max_bytes` of line text.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: Vec::new(),
            bytes: 0,
            max_bytes,
            truncated: false,
            finished: false,
        }
    }

    /// Records one diagnostic call.
    ///
    /// Calls made after [`finish`](Self::finish) or after the byte cap was
    /// reached are ignored.
    pub fn record(&mut self, severity: Severity, text: &str) {
        if self.finished || self.truncated {
            return;
        }

        let tag = severity.tag();
        let size = tag.len() + text.len();
        let remaining = self.max_bytes.saturating_sub(self.bytes);

        if size <= remaining {
            self.bytes += size;
            self.lines.push(format!("{}{}", tag, text));
            return;
        }

        if remaining > tag.len() {
            let head = truncate_on_char_boundary(text, remaining - tag.len());
            self.bytes += tag.len() + head.len();
            self.lines.push(format!("{}{}", tag, head));
        }
        self.lines.push(truncation_sentinel(self.max_bytes));
        self.truncated = true;
    }

    /// Recorded lines so far.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Bytes of line text buffered so far, sentinel excluded.
    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    /// Seals the collector and hands out its contents.
    ///
    /// The collector stays sealed afterwards: late calls from still-reachable
    /// realm code are dropped.
    pub fn finish(&mut self) -> CollectedOutput {
        self.finished = true;
        CollectedOutput {
            lines: std::mem::take(&mut self.lines),
            truncated: self.truncated,
        }
    }
}

/// Line appended once when the output cap is reached.
pub fn truncation_sentinel(max_bytes: usize) -> String {
    format!("... output truncated (limit of {} bytes reached)", max_bytes)
}
