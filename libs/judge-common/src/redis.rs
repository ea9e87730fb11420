use crate::types::{ChallengeStats, JobRequest, JobResult, Language, SubmissionEvaluated};
use redis::{AsyncCommands, RedisResult};

/// Redis key semantics shared by the CLI and the worker, so producers and
/// consumers agree on queue names and result keys.

pub const QUEUE_PREFIX: &str = "judge:queue";
pub const RESULT_PREFIX: &str = "judge:result";
pub const STATUS_PREFIX: &str = "judge:status";
pub const STATS_PREFIX: &str = "judge:stats";

const STATS_TOTAL_FIELD: &str = "total";
const STATS_SUCCESSFUL_FIELD: &str = "successful";

/// Queue name for a language
pub fn queue_name(language: &Language) -> String {
    format!("{}:{}", QUEUE_PREFIX, language)
}

pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

pub fn stats_key(challenge_id: &str) -> String {
    format!("{}:{}", STATS_PREFIX, challenge_id)
}

fn serde_error(desc: &'static str, e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, desc, e.to_string()))
}

/// Push a job onto the queue of `language`. RPUSH + BLPOP gives FIFO order.
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    language: &Language,
    job: &JobRequest,
) -> RedisResult<()> {
    let queue = queue_name(language);
    let payload = serde_json::to_string(job).map_err(|e| serde_error("serialization error", e))?;

    conn.rpush(&queue, payload).await
}

/// One entry taken off a queue.
#[derive(Debug)]
pub enum QueuedJob {
    Valid(JobRequest),
    /// Not a `JobRequest`. `id` is set when the payload still carries a
    /// usable job id, so the submitter can be told.
    Malformed { id: Option<uuid::Uuid>, error: String },
}

impl QueuedJob {
    pub fn decode(payload: &str) -> Self {
        match serde_json::from_str::<JobRequest>(payload) {
            Ok(job) => QueuedJob::Valid(job),
            Err(e) => {
                let id = serde_json::from_str::<serde_json::Value>(payload)
                    .ok()
                    .and_then(|value| value.get("id")?.as_str()?.parse().ok());
                QueuedJob::Malformed {
                    id,
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Pop the next job from any of `languages`' queues.
/// Returns `None` when the timeout elapses, which lets the worker observe shutdown.
///
/// BLPOP holds its connection for the whole timeout, so `conn` should be
/// reserved for popping.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    languages: &[Language],
    timeout_seconds: f64,
) -> RedisResult<Option<QueuedJob>> {
    let queues: Vec<String> = languages.iter().map(queue_name).collect();
    let result: Option<(String, String)> = conn.blpop(&queues, timeout_seconds).await?;

    Ok(result.map(|(_key, payload)| QueuedJob::decode(&payload)))
}

/// Store a job result, plus its status under a separate key for cheap polling.
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    result: &JobResult,
) -> RedisResult<()> {
    let key = result_key(&result.job_id);
    let payload = serde_json::to_string(result).map_err(|e| serde_error("serialization error", e))?;
    let status = serde_json::to_string(&result.status).map_err(|e| serde_error("serialization error", e))?;

    // Both keys expire after 24 hours
    redis::pipe()
        .atomic()
        .set_ex(&key, payload, 86400)
        .ignore()
        .set_ex(status_key(&result.job_id), status, 86400)
        .ignore()
        .query_async(conn)
        .await
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<JobResult>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let result: JobResult =
                serde_json::from_str(&data).map_err(|e| serde_error("deserialization error", e))?;
            Ok(Some(result))
        }
        None => Ok(None),
    }
}

/// Fold a `SubmissionEvaluated` event into the challenge counters.
///
/// Both increments run in one MULTI block, so concurrent workers never
/// observe `successful` ahead of `total`.
pub async fn record_evaluation(
    conn: &mut redis::aio::ConnectionManager,
    event: &SubmissionEvaluated,
) -> RedisResult<()> {
    let key = stats_key(&event.challenge_id);
    let mut pipe = redis::pipe();
    pipe.atomic().hincr(&key, STATS_TOTAL_FIELD, 1).ignore();
    if event.all_passed {
        pipe.hincr(&key, STATS_SUCCESSFUL_FIELD, 1).ignore();
    }
    pipe.query_async(conn).await
}

pub async fn get_challenge_stats(
    conn: &mut redis::aio::ConnectionManager,
    challenge_id: &str,
) -> RedisResult<ChallengeStats> {
    let (total, successful): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
        .arg(stats_key(challenge_id))
        .arg(STATS_TOTAL_FIELD)
        .arg(STATS_SUCCESSFUL_FIELD)
        .query_async(conn)
        .await?;

    Ok(ChallengeStats::new(
        challenge_id,
        total.unwrap_or(0),
        successful.unwrap_or(0),
    ))
}
