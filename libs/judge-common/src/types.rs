use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Languages the judge knows by name.
///
/// Knowing a language does not imply a working backend for it: the
/// language configuration decides which ones are enabled on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::JavaScript, Language::TypeScript, Language::Python];

    /// Parse a language identifier, case-insensitively, accepting short aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "typescript" | "ts" => Some(Language::TypeScript),
            "python" | "py" | "python3" => Some(Language::Python),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate solution as received from the caller.
///
/// `language` stays a raw identifier here; it is resolved during normalization
/// so that unknown identifiers can be reported precisely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub code: String,
    pub language: String,
}

impl Submission {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: Value,
    #[serde(alias = "output")]
    pub expected_output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub is_hidden: bool,
}

impl TestCase {
    pub fn new(input: Value, expected_output: Value) -> Self {
        Self {
            input,
            expected_output,
            explanation: None,
            is_hidden: false,
        }
    }
}

pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;

/// Per-call execution limits. Exercises override the defaults with their
/// own `timeLimit` and memory ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionLimits {
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
    /// Absolute tolerance for numeric leaves. `None` means exact equality.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub float_tolerance: Option<f64>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            float_tolerance: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Syntax,
    Runtime,
    Timeout,
    ResourceLimit,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionErrorKind::Syntax => "SyntaxError",
            ExecutionErrorKind::Runtime => "RuntimeError",
            ExecutionErrorKind::Timeout => "TimeoutError",
            ExecutionErrorKind::ResourceLimit => "ResourceLimitError",
        };
        f.write_str(s)
    }
}

/// Why a single run did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(ExecutionErrorKind::Timeout, "time limit exceeded")
    }

    pub fn memory_exceeded(limit_mb: u64) -> Self {
        Self::new(
            ExecutionErrorKind::ResourceLimit,
            format!("memory limit exceeded ({} MB)", limit_mb),
        )
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of running one submission against exactly one test case.
///
/// `error` and `actual_output` are mutually exclusive; the constructors are
/// the only way the judge builds outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub passed: bool,
    pub execution_time_ms: u64,
    pub memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<Value>,
}

impl ExecutionOutcome {
    pub fn completed(actual_output: Value, passed: bool, execution_time_ms: u64, memory_bytes: u64) -> Self {
        Self {
            passed,
            execution_time_ms,
            memory_bytes,
            error: None,
            actual_output: Some(actual_output),
        }
    }

    pub fn failed(error: ExecutionError, execution_time_ms: u64, memory_bytes: u64) -> Self {
        Self {
            passed: false,
            execution_time_ms,
            memory_bytes,
            error: Some(error),
            actual_output: None,
        }
    }
}

/// Aggregate over all test cases of one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionVerdict {
    pub all_passed: bool,
    pub outcomes: Vec<ExecutionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failing_index: Option<usize>,
    pub passed_count: usize,
    pub total_count: usize,
}

impl SubmissionVerdict {
    /// Derive the verdict from outcomes given in test-case order.
    pub fn from_outcomes(outcomes: Vec<ExecutionOutcome>) -> Self {
        let first_failing_index = outcomes.iter().position(|o| !o.passed);
        let passed_count = outcomes.iter().filter(|o| o.passed).count();
        let total_count = outcomes.len();

        Self {
            all_passed: first_failing_index.is_none(),
            outcomes,
            first_failing_index,
            passed_count,
            total_count,
        }
    }

    /// Strip candidate output for hidden test cases before showing the
    /// verdict to the submitter. Errors stay visible.
    pub fn redact_hidden(&mut self, test_cases: &[TestCase]) {
        for (outcome, test_case) in self.outcomes.iter_mut().zip(test_cases) {
            if test_case.is_hidden {
                outcome.actual_output = None;
            }
        }
    }
}

/// Emitted once per evaluated submission that belongs to a challenge.
/// Consumed by the statistics aggregator, never by the judge itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionEvaluated {
    pub challenge_id: String,
    pub all_passed: bool,
    pub evaluated_at: DateTime<Utc>,
}

impl SubmissionEvaluated {
    pub fn new(challenge_id: impl Into<String>, all_passed: bool) -> Self {
        Self {
            challenge_id: challenge_id.into(),
            all_passed,
            evaluated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStats {
    pub challenge_id: String,
    pub total: u64,
    pub successful: u64,
    pub success_rate: f64,
}

impl ChallengeStats {
    pub fn new(challenge_id: impl Into<String>, total: u64, successful: u64) -> Self {
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        };
        Self {
            challenge_id: challenge_id.into(),
            total,
            successful,
            success_rate,
        }
    }
}

/// Queue envelope for a submission waiting to be judged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<String>,
    pub submission: Submission,
    pub test_cases: Vec<TestCase>,
    /// `None` leaves the limits to the worker's configured defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ExecutionLimits>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<SubmissionVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn completed(job_id: Uuid, verdict: SubmissionVerdict) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            verdict: Some(verdict),
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn rejected(job_id: Uuid, error: impl Into<String>) -> Self {
        Self::with_error(job_id, JobStatus::Rejected, error)
    }

    pub fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Self::with_error(job_id, JobStatus::Failed, error)
    }

    fn with_error(job_id: Uuid, status: JobStatus, error: impl Into<String>) -> Self {
        Self {
            job_id,
            status,
            verdict: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_outcome(passed: bool) -> ExecutionOutcome {
        if passed {
            ExecutionOutcome::completed(json!(1), true, 5, 1024)
        } else {
            ExecutionOutcome::completed(json!(2), false, 5, 1024)
        }
    }

    #[test]
    fn test_language_parse() {
        assert_eq!(Language::parse("javascript"), Some(Language::JavaScript));
        assert_eq!(Language::parse("JS"), Some(Language::JavaScript));
        assert_eq!(Language::parse(" Python "), Some(Language::Python));
        assert_eq!(Language::parse("ts"), Some(Language::TypeScript));
        assert_eq!(Language::parse("rust"), None);
        assert_eq!(Language::parse(""), None);
    }

    #[test]
    fn test_language_serde_names() {
        assert_eq!(serde_json::to_string(&Language::JavaScript).unwrap(), "\"javascript\"");
        assert_eq!(Language::TypeScript.to_string(), "typescript");
    }

    #[test]
    fn test_verdict_all_passed() {
        let verdict = SubmissionVerdict::from_outcomes(vec![make_outcome(true), make_outcome(true)]);
        assert!(verdict.all_passed);
        assert_eq!(verdict.first_failing_index, None);
        assert_eq!(verdict.passed_count, 2);
        assert_eq!(verdict.total_count, 2);
    }

    #[test]
    fn test_verdict_first_failing_index() {
        let verdict = SubmissionVerdict::from_outcomes(vec![
            make_outcome(true),
            make_outcome(false),
            make_outcome(false),
        ]);
        assert!(!verdict.all_passed);
        assert_eq!(verdict.first_failing_index, Some(1));
        assert_eq!(verdict.passed_count, 1);
    }

    #[test]
    fn test_verdict_all_passed_matches_every() {
        let cases = [
            vec![],
            vec![true],
            vec![false],
            vec![true, false, true],
            vec![true, true, true],
        ];
        for flags in cases {
            let verdict =
                SubmissionVerdict::from_outcomes(flags.iter().map(|p| make_outcome(*p)).collect());
            assert_eq!(verdict.all_passed, verdict.outcomes.iter().all(|o| o.passed));
        }
    }

    #[test]
    fn test_redact_hidden() {
        let mut hidden = TestCase::new(json!([1]), json!(1));
        hidden.is_hidden = true;
        let visible = TestCase::new(json!([2]), json!(2));
        let mut verdict = SubmissionVerdict::from_outcomes(vec![make_outcome(true), make_outcome(false)]);

        verdict.redact_hidden(&[hidden, visible]);

        assert_eq!(verdict.outcomes[0].actual_output, None);
        assert_eq!(verdict.outcomes[1].actual_output, Some(json!(2)));
    }

    #[test]
    fn test_test_case_accepts_output_alias() {
        let tc: TestCase =
            serde_json::from_value(json!({"input": {"nums": [2, 7], "target": 9}, "output": [0, 1]})).unwrap();
        assert_eq!(tc.expected_output, json!([0, 1]));
        assert!(!tc.is_hidden);
        assert!(tc.explanation.is_none());
    }

    #[test]
    fn test_limits_defaults_from_partial_json() {
        let limits: ExecutionLimits = serde_json::from_value(json!({"timeoutMs": 500})).unwrap();
        assert_eq!(limits.timeout_ms, 500);
        assert_eq!(limits.memory_limit_mb, DEFAULT_MEMORY_LIMIT_MB);
        assert_eq!(limits.float_tolerance, None);
    }

    #[test]
    fn test_outcome_serializes_camel_case() {
        let outcome = ExecutionOutcome::failed(ExecutionError::timeout(), 2001, 0);
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["executionTimeMs"], json!(2001));
        assert_eq!(value["error"]["kind"], json!("timeout"));
        assert_eq!(value["error"]["message"], json!("time limit exceeded"));
        assert!(value.get("actualOutput").is_none());
    }

    #[test]
    fn test_job_without_limits_leaves_them_open() {
        let job: JobRequest = serde_json::from_value(json!({
            "id": "6f1c2d7e-43a5-4b8e-9a43-0c7f3f1e2b10",
            "submission": {"code": "def solution(x): return x", "language": "python"},
            "testCases": [{"input": 1, "expectedOutput": 1}]
        }))
        .unwrap();
        assert_eq!(job.limits, None);
        assert!(serde_json::to_value(&job).unwrap().get("limits").is_none());
    }

    #[test]
    fn test_challenge_stats_rate() {
        assert_eq!(ChallengeStats::new("c", 0, 0).success_rate, 0.0);
        assert_eq!(ChallengeStats::new("c", 4, 1).success_rate, 0.25);
    }
}
