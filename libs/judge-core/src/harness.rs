//! Judge harness scripts and the line protocol they speak.
//!
//! A harness reads `{"input": ...}` on stdin, runs the candidate and writes
//! one line `__JUDGE_RESULT__{json}` to the report channel, the descriptor
//! named by `JUDGE_REPORT_FD`. stdout belongs to the candidate and is never
//! parsed. Anything but exactly one report line is treated as no report.

use judge_common::types::ExecutionErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RESULT_SENTINEL: &str = "__JUDGE_RESULT__";

const JAVASCRIPT_HARNESS: &str = include_str!("harness/judge_harness.js");
const PYTHON_HARNESS: &str = include_str!("harness/judge_harness.py");

/// Which harness script an interpreter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarnessKind {
    JavaScript,
    Python,
}

impl HarnessKind {
    pub fn source(&self) -> &'static str {
        match self {
            HarnessKind::JavaScript => JAVASCRIPT_HARNESS,
            HarnessKind::Python => PYTHON_HARNESS,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            HarnessKind::JavaScript => "judge_harness.js",
            HarnessKind::Python => "judge_harness.py",
        }
    }

    /// stderr fragments an interpreter prints when it dies of memory exhaustion
    /// before the harness can report it.
    pub fn oom_markers(&self) -> &'static [&'static str] {
        match self {
            HarnessKind::JavaScript => &["heap out of memory", "Allocation failed"],
            HarnessKind::Python => &["MemoryError"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HarnessReport {
    Ok {
        output: Value,
        #[serde(rename = "memoryBytes", default)]
        memory_bytes: u64,
        #[serde(rename = "elapsedMs", default)]
        elapsed_ms: Option<f64>,
    },
    Error {
        kind: ExecutionErrorKind,
        message: String,
        #[serde(rename = "memoryBytes", default)]
        memory_bytes: u64,
        #[serde(rename = "elapsedMs", default)]
        elapsed_ms: Option<f64>,
    },
}

impl HarnessReport {
    pub fn memory_bytes(&self) -> u64 {
        match self {
            HarnessReport::Ok { memory_bytes, .. } | HarnessReport::Error { memory_bytes, .. } => *memory_bytes,
        }
    }

    pub fn elapsed_ms(&self) -> Option<u64> {
        let elapsed = match self {
            HarnessReport::Ok { elapsed_ms, .. } | HarnessReport::Error { elapsed_ms, .. } => *elapsed_ms,
        };
        elapsed.filter(|ms| ms.is_finite() && *ms >= 0.0).map(|ms| ms.round() as u64)
    }
}

/// Read the harness report from everything written to the report channel.
///
/// Returns `None` unless the channel holds exactly one well-formed report
/// line: either the interpreter died before the harness could speak, or
/// something else wrote to the channel.
pub fn parse_report(channel: &str) -> Option<HarnessReport> {
    let mut lines = channel.lines().filter(|line| !line.trim().is_empty());
    let line = lines.next()?;
    if lines.next().is_some() {
        return None;
    }
    serde_json::from_str(line.strip_prefix(RESULT_SENTINEL)?).ok()
}
