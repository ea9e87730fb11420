/// Judge - High-Level Orchestration
///
/// **Responsibility:**
/// Take one submission and its test cases from validation to verdict.
///
/// **Architecture:**
/// 1. Normalize the submission (normalizer.rs)
/// 2. Pick the language backend (backend.rs), which drives the sandbox engine
/// 3. Run every test case in its own sandbox, bounded by the global sandbox pool
/// 4. Score outputs and aggregate (evaluator.rs)
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's and backends' job)
/// - How scoring works (evaluator's job)
///
/// **Concurrency:**
/// - `max_pending_submissions` bounds submissions in flight; excess is rejected
///   with `Overloaded` instead of queueing without bound
/// - `max_concurrent_sandboxes` bounds live sandboxes across all submissions;
///   test cases wait for a permit
/// - Test cases of one submission may run in parallel, results keep input order
///
/// **Cancellation:**
/// Dropping the evaluation future, or firing its `CancellationToken`, drops
/// every in-flight run; the engine kills their process groups on drop.
use crate::backend::{BackendRegistry, LanguageBackend};
use crate::config::{JudgeConfig, LanguageConfigManager};
use crate::engine::ProcessEngine;
use crate::error::{JudgeError, Result};
use crate::evaluator::{self, RunOutput};
use crate::normalizer::{normalize, NormalizedSubmission};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use judge_common::types::{ExecutionLimits, Language, Submission, SubmissionVerdict, TestCase};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct Judge {
    backends: BackendRegistry,
    config: JudgeConfig,
    sandbox_permits: Arc<Semaphore>,
    submission_permits: Arc<Semaphore>,
}

impl Judge {
    pub fn new(backends: BackendRegistry, config: JudgeConfig) -> Self {
        Self {
            sandbox_permits: Arc::new(Semaphore::new(config.max_concurrent_sandboxes)),
            submission_permits: Arc::new(Semaphore::new(config.max_pending_submissions)),
            backends,
            config,
        }
    }

    /// Judge backed by real interpreters, one per enabled language.
    pub fn from_language_config(manager: &LanguageConfigManager, config: JudgeConfig) -> Self {
        let engine = Arc::new(ProcessEngine::new(config.engine.clone()));
        let backends = BackendRegistry::from_config(manager, engine, config.max_error_message_bytes);
        Self::new(backends, config)
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn languages(&self) -> Vec<Language> {
        self.backends.languages()
    }

    pub async fn evaluate(
        &self,
        submission: &Submission,
        test_cases: &[TestCase],
        limits: &ExecutionLimits,
    ) -> Result<SubmissionVerdict> {
        self.evaluate_with_cancel(submission, test_cases, limits, CancellationToken::new())
            .await
    }

    /// Evaluate a submission against every test case.
    ///
    /// `Err` means no verdict exists: the submission was rejected, cancelled
    /// or the host failed. Anything the candidate code does wrong is a
    /// failing outcome inside `Ok`.
    #[instrument(skip_all, fields(language = %submission.language, test_count = test_cases.len()))]
    pub async fn evaluate_with_cancel(
        &self,
        submission: &Submission,
        test_cases: &[TestCase],
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<SubmissionVerdict> {
        let normalized = normalize(submission, test_cases, limits, &self.config.policy)?;

        let backend = self
            .backends
            .get(&normalized.language)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(normalized.language.to_string()))?;

        let _admission = self.submission_permits.clone().try_acquire_owned().map_err(|_| {
            warn!(
                max_pending = self.config.max_pending_submissions,
                "Rejecting submission, judge at capacity"
            );
            JudgeError::Overloaded
        })?;

        let start_time = Instant::now();
        let backend: &dyn LanguageBackend = backend.as_ref();

        // Collected first, so the evaluation future stays Send for tokio::spawn
        let runs: Vec<_> = test_cases
            .iter()
            .enumerate()
            .map(|(index, test_case)| self.run_one(backend, &normalized, index, test_case))
            .collect();
        let runs = stream::iter(runs)
            .buffered(self.config.per_submission_parallelism)
            .try_collect::<Vec<RunOutput>>();

        let outputs = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Evaluation cancelled");
                return Err(JudgeError::Cancelled);
            }
            outputs = runs => outputs?,
        };

        let verdict = evaluator::evaluate(outputs, test_cases, normalized.limits.float_tolerance);

        info!(
            language = %normalized.language,
            passed = verdict.passed_count,
            total = verdict.total_count,
            all_passed = verdict.all_passed,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Submission evaluated"
        );

        Ok(verdict)
    }

    async fn run_one(
        &self,
        backend: &dyn LanguageBackend,
        submission: &NormalizedSubmission,
        index: usize,
        test_case: &TestCase,
    ) -> Result<RunOutput> {
        let _permit = self
            .sandbox_permits
            .acquire()
            .await
            .map_err(|_| JudgeError::Internal("sandbox pool closed".to_string()))?;

        let output = backend
            .execute(&submission.code, &test_case.input, &submission.limits)
            .await?;

        debug!(
            test_index = index,
            ok = output.result.is_ok(),
            execution_time_ms = output.execution_time_ms,
            "Test case finished"
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use judge_common::types::{ExecutionError, ExecutionErrorKind};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Echoes its input back. Numbers sleep that many milliseconds first,
    /// "fail" fails, "internal" breaks the host and "block" never finishes.
    struct EchoBackend {
        language: Language,
        active: AtomicUsize,
        peak: AtomicUsize,
        started: Notify,
    }

    impl EchoBackend {
        fn new(language: Language) -> Arc<Self> {
            Arc::new(Self {
                language,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl LanguageBackend for EchoBackend {
        fn language(&self) -> Language {
            self.language
        }

        async fn execute(&self, _code: &str, input: &Value, _limits: &ExecutionLimits) -> Result<RunOutput> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.started.notify_one();

            let result = match input {
                Value::String(s) if s == "block" => std::future::pending().await,
                Value::String(s) if s == "internal" => {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return Err(JudgeError::Internal("spawn failed".to_string()));
                }
                Value::String(s) if s == "fail" => Err(ExecutionError::new(ExecutionErrorKind::Runtime, "Error: boom")),
                Value::Number(n) => {
                    tokio::time::sleep(Duration::from_millis(n.as_u64().unwrap_or(0))).await;
                    Ok(input.clone())
                }
                other => Ok(other.clone()),
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(RunOutput {
                result,
                execution_time_ms: 1,
                memory_bytes: 0,
            })
        }
    }

    fn make_judge(backend: Arc<EchoBackend>, config: JudgeConfig) -> Judge {
        let mut registry = BackendRegistry::new();
        registry.register(backend);
        Judge::new(registry, config)
    }

    fn echo_cases(inputs: &[Value]) -> Vec<TestCase> {
        inputs.iter().map(|v| TestCase::new(v.clone(), v.clone())).collect()
    }

    fn js(code: &str) -> Submission {
        Submission::new(code, "javascript")
    }

    #[tokio::test]
    async fn test_outcomes_keep_test_case_order() {
        let judge = make_judge(EchoBackend::new(Language::JavaScript), JudgeConfig::default());
        let cases = echo_cases(&[json!(60), json!(20), json!(0), json!(40)]);

        let verdict = judge
            .evaluate(&js("function solution(x) { return x; }"), &cases, &ExecutionLimits::default())
            .await
            .unwrap();

        assert!(verdict.all_passed);
        let actual: Vec<Value> = verdict
            .outcomes
            .iter()
            .map(|o| o.actual_output.clone().unwrap())
            .collect();
        assert_eq!(actual, vec![json!(60), json!(20), json!(0), json!(40)]);
    }

    #[tokio::test]
    async fn test_every_case_runs_after_a_failure() {
        let judge = make_judge(EchoBackend::new(Language::JavaScript), JudgeConfig::default());
        let mut cases = echo_cases(&[json!("a"), json!("fail"), json!("c")]);
        cases[2].expected_output = json!("not c");

        let verdict = judge
            .evaluate(&js("x"), &cases, &ExecutionLimits::default())
            .await
            .unwrap();

        assert!(!verdict.all_passed);
        assert_eq!(verdict.total_count, 3);
        assert_eq!(verdict.passed_count, 1);
        assert_eq!(verdict.first_failing_index, Some(1));
        assert_eq!(
            verdict.outcomes[1].error.as_ref().unwrap().kind,
            ExecutionErrorKind::Runtime
        );
        assert_eq!(verdict.outcomes[2].actual_output, Some(json!("c")));
    }

    #[tokio::test]
    async fn test_sandbox_pool_bounds_concurrency() {
        let backend = EchoBackend::new(Language::JavaScript);
        let config = JudgeConfig {
            max_concurrent_sandboxes: 2,
            per_submission_parallelism: 8,
            ..Default::default()
        };
        let judge = make_judge(backend.clone(), config);
        let cases = echo_cases(&vec![json!(15); 8]);

        let verdict = judge
            .evaluate(&js("x"), &cases, &ExecutionLimits::default())
            .await
            .unwrap();

        assert!(verdict.all_passed);
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_overload_then_cancel_releases_admission() {
        let backend = EchoBackend::new(Language::JavaScript);
        let config = JudgeConfig {
            max_pending_submissions: 1,
            ..Default::default()
        };
        let judge = Arc::new(make_judge(backend.clone(), config));
        let token = CancellationToken::new();

        let first = {
            let judge = judge.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let cases = vec![TestCase::new(json!("block"), json!(null))];
                judge
                    .evaluate_with_cancel(&js("x"), &cases, &ExecutionLimits::default(), token)
                    .await
            })
        };
        backend.started.notified().await;

        let second = judge
            .evaluate(&js("x"), &echo_cases(&[json!(1)]), &ExecutionLimits::default())
            .await;
        assert!(matches!(second, Err(JudgeError::Overloaded)));

        token.cancel();
        assert!(matches!(first.await.unwrap(), Err(JudgeError::Cancelled)));

        let third = judge
            .evaluate(&js("x"), &echo_cases(&[json!(1)]), &ExecutionLimits::default())
            .await
            .unwrap();
        assert!(third.all_passed);
    }

    #[tokio::test]
    async fn test_evaluation_runs_on_a_spawned_task() {
        let judge = Arc::new(make_judge(EchoBackend::new(Language::JavaScript), JudgeConfig::default()));

        let handle = tokio::spawn({
            let judge = judge.clone();
            async move {
                let cases = echo_cases(&[json!(30), json!(0), json!("x")]);
                judge
                    .evaluate_with_cancel(&js("x"), &cases, &ExecutionLimits::default(), CancellationToken::new())
                    .await
            }
        });

        let verdict = handle.await.unwrap().unwrap();
        assert!(verdict.all_passed);
        assert_eq!(verdict.outcomes[0].actual_output, Some(json!(30)));
        assert_eq!(verdict.outcomes[2].actual_output, Some(json!("x")));
    }

    #[tokio::test]
    async fn test_already_cancelled_token() {
        let judge = make_judge(EchoBackend::new(Language::JavaScript), JudgeConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let result = judge
            .evaluate_with_cancel(&js("x"), &echo_cases(&[json!("block")]), &ExecutionLimits::default(), token)
            .await;

        assert!(matches!(result, Err(JudgeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_language_resolution() {
        let judge = make_judge(EchoBackend::new(Language::JavaScript), JudgeConfig::default());
        let cases = echo_cases(&[json!(1)]);
        let limits = ExecutionLimits::default();

        let disabled = judge.evaluate(&Submission::new("x", "python"), &cases, &limits).await;
        assert!(matches!(disabled, Err(JudgeError::UnsupportedLanguage(l)) if l == "python"));

        let unknown = judge.evaluate(&Submission::new("x", "rust"), &cases, &limits).await;
        assert!(matches!(unknown, Err(JudgeError::UnsupportedLanguage(l)) if l == "rust"));

        let empty = judge.evaluate(&Submission::new("x", ""), &cases, &limits).await;
        assert!(matches!(empty, Err(JudgeError::Validation { field: "language", .. })));
    }

    #[tokio::test]
    async fn test_validation_happens_before_execution() {
        let backend = EchoBackend::new(Language::JavaScript);
        let judge = make_judge(backend.clone(), JudgeConfig::default());
        let oversized = "x".repeat(50_001);

        let result = judge
            .evaluate(&js(&oversized), &echo_cases(&[json!(1)]), &ExecutionLimits::default())
            .await;

        assert!(matches!(result, Err(JudgeError::Validation { field: "code", .. })));
        assert_eq!(backend.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_host_failure_aborts_submission() {
        let judge = make_judge(EchoBackend::new(Language::JavaScript), JudgeConfig::default());

        let result = judge
            .evaluate(&js("x"), &echo_cases(&[json!("a"), json!("internal")]), &ExecutionLimits::default())
            .await;

        assert!(matches!(result, Err(JudgeError::Internal(_))));
    }
}
