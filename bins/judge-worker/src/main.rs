use anyhow::Context;
use judge_common::config::WorkerConfig;
use judge_common::redis::{self, QueuedJob};
use judge_common::types::{ExecutionLimits, JobRequest, JobResult, Language, SubmissionEvaluated, SubmissionVerdict};
use judge_core::{CancellationToken, Judge, JudgeConfig, JudgeError, LanguageConfigManager};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// In-flight jobs get this long to finish after a shutdown signal before they are cancelled.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Judge worker booting...");

    let worker_config = WorkerConfig::from_env().map_err(anyhow::Error::msg)?;
    let judge_config = JudgeConfig::from_env().context("Invalid judge configuration")?;

    let language_manager = LanguageConfigManager::load_or_builtin(Path::new(&worker_config.languages_config))
        .map_err(|e| {
            error!("Failed to load language configurations: {:#}", e);
            e
        })?;

    info!("Loaded language configurations for: {:?}", language_manager.list_languages());

    // Every language this worker consumes must be runnable here
    for language in &worker_config.languages {
        if !language_manager.is_enabled(language) {
            error!("Available languages: {:?}", language_manager.list_languages());
            anyhow::bail!("Language '{}' is not enabled in {}", language, worker_config.languages_config);
        }
    }

    info!(
        languages = ?worker_config.languages,
        max_sandboxes = judge_config.max_concurrent_sandboxes,
        max_pending = judge_config.max_pending_submissions,
        "Worker configured"
    );

    let judge = Arc::new(Judge::from_language_config(&language_manager, judge_config));

    let client = ::redis::Client::open(worker_config.redis_url.as_str())?;
    let connections = WorkerConnections::open(&client).await?;

    info!("Connected to Redis: {}", worker_config.redis_url);

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            warn!("Received shutdown signal, draining in-flight jobs...");
            shutdown.cancel();
        });
    }

    worker_loop(
        connections,
        judge,
        &worker_config.languages,
        worker_config.poll_timeout_seconds,
        shutdown,
    )
    .await;

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// BLPOP parks its connection for the whole poll timeout, so popping gets a
/// connection of its own and result writes never queue behind it.
struct WorkerConnections {
    queue: ::redis::aio::ConnectionManager,
    results: ::redis::aio::ConnectionManager,
}

impl WorkerConnections {
    async fn open(client: &::redis::Client) -> ::redis::RedisResult<Self> {
        Ok(Self {
            queue: ::redis::aio::ConnectionManager::new(client.clone()).await?,
            results: ::redis::aio::ConnectionManager::new(client.clone()).await?,
        })
    }
}

#[instrument(skip_all, fields(languages = ?languages))]
async fn worker_loop(
    connections: WorkerConnections,
    judge: Arc<Judge>,
    languages: &[Language],
    poll_timeout_seconds: f64,
    shutdown: CancellationToken,
) {
    let WorkerConnections {
        queue: mut queue_conn,
        results: mut results_conn,
    } = connections;

    // Never pop more jobs than the judge will admit, so nothing is rejected as Overloaded
    let slots = Arc::new(Semaphore::new(judge.config().max_pending_submissions));
    let jobs_cancel = CancellationToken::new();
    let mut in_flight = JoinSet::new();

    while !shutdown.is_cancelled() {
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // BLPOP with a timeout so the shutdown flag is checked regularly
        match redis::pop_job(&mut queue_conn, languages, poll_timeout_seconds).await {
            Ok(Some(QueuedJob::Valid(job))) => {
                let judge = judge.clone();
                let mut conn = results_conn.clone();
                let cancel = jobs_cancel.child_token();
                in_flight.spawn(async move {
                    let _permit = permit;
                    process_job(&judge, &mut conn, job, cancel).await;
                });
            }
            Ok(Some(QueuedJob::Malformed { id, error })) => {
                drop(permit);
                warn!(job_id = ?id, error = %error, "Bad job payload");
                if let Some(id) = id {
                    let result = malformed_result(id, &error);
                    if let Err(e) = redis::store_result(&mut results_conn, &result).await {
                        error!(error = %e, job_id = %id, "Failed to persist rejection");
                    }
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    if !in_flight.is_empty() {
        info!(in_flight = in_flight.len(), "Waiting for in-flight jobs");
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = in_flight.len(), "Drain timed out, cancelling remaining jobs");
            jobs_cancel.cancel();
            while in_flight.join_next().await.is_some() {}
        }
    }
}

#[instrument(skip_all, fields(job_id = %job.id, language = %job.submission.language))]
async fn process_job(
    judge: &Judge,
    redis_conn: &mut ::redis::aio::ConnectionManager,
    job: JobRequest,
    cancel: CancellationToken,
) {
    let limits = job_limits(&job, judge.config());
    info!(
        test_cases = job.test_cases.len(),
        code_chars = job.submission.code.chars().count(),
        timeout_ms = limits.timeout_ms,
        memory_limit_mb = limits.memory_limit_mb,
        "Received job"
    );

    let start = Instant::now();
    let outcome = judge
        .evaluate_with_cancel(&job.submission, &job.test_cases, &limits, cancel)
        .await;

    if let Ok(verdict) = &outcome {
        info!(
            passed = verdict.passed_count,
            total = verdict.total_count,
            all_passed = verdict.all_passed,
            execution_ms = start.elapsed().as_millis() as u64,
            "Execution completed"
        );

        for (idx, test_outcome) in verdict.outcomes.iter().enumerate() {
            debug!(
                test_num = idx + 1,
                passed = test_outcome.passed,
                error = ?test_outcome.error.as_ref().map(|e| e.kind),
                execution_ms = test_outcome.execution_time_ms,
                "Test result"
            );
        }

        if let Some(challenge_id) = &job.challenge_id {
            let event = SubmissionEvaluated::new(challenge_id.clone(), verdict.all_passed);
            if let Err(e) = redis::record_evaluation(redis_conn, &event).await {
                // Non-fatal - the verdict is still stored
                error!(error = %e, challenge_id = %challenge_id, "Failed to record evaluation");
            }
        }
    }

    let result = job_result(&job, outcome);

    // Persist result to Redis
    match redis::store_result(redis_conn, &result).await {
        Ok(()) => info!(status = ?result.status, "Result persisted to Redis"),
        Err(e) => error!(error = %e, "Failed to persist result"),
    }
}

/// Limits the job asked for, or the judge's configured defaults.
fn job_limits(job: &JobRequest, config: &JudgeConfig) -> ExecutionLimits {
    job.limits.unwrap_or(config.default_limits)
}

fn malformed_result(id: Uuid, error: &str) -> JobResult {
    JobResult::rejected(id, format!("malformed job: {}", error))
}

/// Turn an evaluation outcome into what the submitter gets to see.
fn job_result(job: &JobRequest, outcome: Result<SubmissionVerdict, JudgeError>) -> JobResult {
    match outcome {
        Ok(mut verdict) => {
            verdict.redact_hidden(&job.test_cases);
            JobResult::completed(job.id, verdict)
        }
        Err(e @ (JudgeError::Validation { .. } | JudgeError::UnsupportedLanguage(_) | JudgeError::Overloaded)) => {
            warn!(error = %e, "Job rejected");
            JobResult::rejected(job.id, e.public_message())
        }
        Err(e) => {
            error!(error = %e, "Job failed");
            JobResult::failed(job.id, e.public_message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use judge_common::types::{ExecutionOutcome, JobStatus, Submission, TestCase};
    use serde_json::json;

    fn make_job() -> JobRequest {
        let mut hidden = TestCase::new(json!([3]), json!(9));
        hidden.is_hidden = true;
        JobRequest {
            id: Uuid::new_v4(),
            challenge_id: Some("square".to_string()),
            submission: Submission::new("def solution(x): return x * x", "python"),
            test_cases: vec![TestCase::new(json!([2]), json!(4)), hidden],
            limits: None,
        }
    }

    #[test]
    fn test_completed_result_hides_hidden_outputs() {
        let job = make_job();
        let verdict = SubmissionVerdict::from_outcomes(vec![
            ExecutionOutcome::completed(json!(4), true, 5, 0),
            ExecutionOutcome::completed(json!(8), false, 5, 0),
        ]);

        let result = job_result(&job, Ok(verdict));

        assert_eq!(result.status, JobStatus::Completed);
        let verdict = result.verdict.unwrap();
        assert_eq!(verdict.outcomes[0].actual_output, Some(json!(4)));
        assert_eq!(verdict.outcomes[1].actual_output, None);
        assert_eq!(verdict.first_failing_index, Some(1));
    }

    #[test]
    fn test_submitter_errors_are_rejections() {
        let job = make_job();

        let rejected = job_result(&job, Err(JudgeError::UnsupportedLanguage("rust".to_string())));
        assert_eq!(rejected.status, JobStatus::Rejected);
        assert_eq!(rejected.error.as_deref(), Some("unsupported language: rust"));

        let overloaded = job_result(&job, Err(JudgeError::Overloaded));
        assert_eq!(overloaded.status, JobStatus::Rejected);
    }

    #[test]
    fn test_host_errors_are_masked() {
        let job = make_job();

        let result = job_result(&job, Err(JudgeError::Internal("spawn python3: ENOENT".to_string())));

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("execution failed"));
        assert!(result.verdict.is_none());
    }

    #[test]
    fn test_missing_limits_use_configured_defaults() {
        let mut config = JudgeConfig::default();
        config.default_limits.timeout_ms = 750;
        let mut job = make_job();

        assert_eq!(job_limits(&job, &config).timeout_ms, 750);

        let requested = ExecutionLimits {
            timeout_ms: 300,
            ..Default::default()
        };
        job.limits = Some(requested);
        assert_eq!(job_limits(&job, &config), requested);
    }

    #[test]
    fn test_malformed_job_is_rejected() {
        let id = Uuid::new_v4();
        let result = malformed_result(id, "missing field `submission`");

        assert_eq!(result.job_id, id);
        assert_eq!(result.status, JobStatus::Rejected);
        assert!(result.error.unwrap().contains("missing field `submission`"));
        assert!(result.verdict.is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis on REDIS_URL
    async fn test_result_writes_do_not_wait_behind_blpop() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = ::redis::Client::open(url.as_str()).unwrap();
        let WorkerConnections { mut queue, mut results } = WorkerConnections::open(&client).await.unwrap();

        let popping = tokio::spawn(async move {
            // Nothing is pushed, so this parks for the full timeout
            redis::pop_job(&mut queue, &[Language::TypeScript], 3.0).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = Instant::now();
        let result = JobResult::rejected(Uuid::new_v4(), "malformed job: test");
        redis::store_result(&mut results, &result).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());

        popping.abort();
    }
}
