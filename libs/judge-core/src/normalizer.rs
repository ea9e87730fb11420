//! Submission validation. Pure: nothing here touches the sandbox.

use crate::error::{JudgeError, Result};
use judge_common::types::{ExecutionLimits, Language, Submission, TestCase};

pub const MAX_CODE_CHARS: usize = 50_000;

/// Bounds a submission must respect before it is allowed near an interpreter.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionPolicy {
    pub max_code_chars: usize,
    pub max_test_cases: usize,
    pub max_timeout_ms: u64,
    pub min_memory_limit_mb: u64,
    pub max_memory_limit_mb: u64,
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            max_code_chars: MAX_CODE_CHARS,
            max_test_cases: 500,
            max_timeout_ms: 10_000,
            min_memory_limit_mb: 16,
            max_memory_limit_mb: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedSubmission {
    pub code: String,
    pub language: Language,
    pub limits: ExecutionLimits,
}

pub fn normalize(
    submission: &Submission,
    test_cases: &[TestCase],
    limits: &ExecutionLimits,
    policy: &SubmissionPolicy,
) -> Result<NormalizedSubmission> {
    if submission.code.trim().is_empty() {
        return Err(JudgeError::validation("code", "must not be empty"));
    }
    let code_chars = submission.code.chars().count();
    if code_chars > policy.max_code_chars {
        return Err(JudgeError::validation(
            "code",
            format!("{} characters exceeds the limit of {}", code_chars, policy.max_code_chars),
        ));
    }

    if submission.language.trim().is_empty() {
        return Err(JudgeError::validation("language", "must not be empty"));
    }
    let language = Language::parse(&submission.language)
        .ok_or_else(|| JudgeError::UnsupportedLanguage(submission.language.clone()))?;

    if test_cases.is_empty() {
        return Err(JudgeError::validation("testCases", "at least one test case is required"));
    }
    if test_cases.len() > policy.max_test_cases {
        return Err(JudgeError::validation(
            "testCases",
            format!("{} test cases exceeds the limit of {}", test_cases.len(), policy.max_test_cases),
        ));
    }

    if limits.timeout_ms == 0 || limits.timeout_ms > policy.max_timeout_ms {
        return Err(JudgeError::validation(
            "timeoutMs",
            format!("must be between 1 and {}", policy.max_timeout_ms),
        ));
    }
    if limits.memory_limit_mb < policy.min_memory_limit_mb
        || limits.memory_limit_mb > policy.max_memory_limit_mb
    {
        return Err(JudgeError::validation(
            "memoryLimitMb",
            format!(
                "must be between {} and {}",
                policy.min_memory_limit_mb, policy.max_memory_limit_mb
            ),
        ));
    }
    if let Some(tolerance) = limits.float_tolerance {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(JudgeError::validation(
                "floatTolerance",
                "must be a finite, non-negative number",
            ));
        }
    }

    Ok(NormalizedSubmission {
        code: submission.code.replace("\r\n", "\n"),
        language,
        limits: *limits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_test_cases() -> Vec<TestCase> {
        vec![TestCase::new(json!([1]), json!(1))]
    }

    fn check(submission: Submission) -> Result<NormalizedSubmission> {
        normalize(
            &submission,
            &make_test_cases(),
            &ExecutionLimits::default(),
            &SubmissionPolicy::default(),
        )
    }

    #[test]
    fn test_valid_submission() {
        let normalized = check(Submission::new("function solution(a) {\r\n return a; }", "JavaScript")).unwrap();
        assert_eq!(normalized.language, Language::JavaScript);
        assert!(!normalized.code.contains('\r'));
    }

    #[test]
    fn test_empty_code_rejected() {
        let err = check(Submission::new("   \n", "javascript")).unwrap_err();
        assert!(matches!(err, JudgeError::Validation { field: "code", .. }));
    }

    #[test]
    fn test_code_length_ceiling() {
        let at_limit = "x".repeat(MAX_CODE_CHARS);
        assert!(check(Submission::new(at_limit, "javascript")).is_ok());

        let oversized = "x".repeat(MAX_CODE_CHARS + 1);
        let err = check(Submission::new(oversized, "javascript")).unwrap_err();
        assert!(matches!(err, JudgeError::Validation { field: "code", .. }));
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // 3 bytes per character in UTF-8
        let code = "€".repeat(MAX_CODE_CHARS);
        assert!(check(Submission::new(code, "python")).is_ok());
    }

    #[test]
    fn test_unknown_language_is_unsupported() {
        let err = check(Submission::new("fn main() {}", "rust")).unwrap_err();
        assert!(matches!(err, JudgeError::UnsupportedLanguage(ref l) if l == "rust"));
    }

    #[test]
    fn test_empty_language_is_validation_error() {
        let err = check(Submission::new("x = 1", "")).unwrap_err();
        assert!(matches!(err, JudgeError::Validation { field: "language", .. }));
    }

    #[test]
    fn test_empty_test_cases_rejected() {
        let err = normalize(
            &Submission::new("def solution(): pass", "python"),
            &[],
            &ExecutionLimits::default(),
            &SubmissionPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, JudgeError::Validation { field: "testCases", .. }));
    }

    #[test]
    fn test_limits_range() {
        let submission = Submission::new("def solution(): pass", "python");
        let policy = SubmissionPolicy::default();

        let zero = ExecutionLimits { timeout_ms: 0, ..Default::default() };
        assert!(normalize(&submission, &make_test_cases(), &zero, &policy).is_err());

        let one = ExecutionLimits { timeout_ms: 1, ..Default::default() };
        assert!(normalize(&submission, &make_test_cases(), &one, &policy).is_ok());

        let too_long = ExecutionLimits { timeout_ms: policy.max_timeout_ms + 1, ..Default::default() };
        assert!(normalize(&submission, &make_test_cases(), &too_long, &policy).is_err());

        let tiny_memory = ExecutionLimits { memory_limit_mb: 1, ..Default::default() };
        assert!(normalize(&submission, &make_test_cases(), &tiny_memory, &policy).is_err());

        let bad_tolerance = ExecutionLimits { float_tolerance: Some(f64::NAN), ..Default::default() };
        assert!(normalize(&submission, &make_test_cases(), &bad_tolerance, &policy).is_err());
    }
}
