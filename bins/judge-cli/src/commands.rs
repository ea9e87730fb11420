use anyhow::{Context, Result};
use judge_common::config::DEFAULT_REDIS_URL;
use judge_common::redis;
use judge_common::types::{
    ExecutionLimits, JobRequest, JobStatus, Language, Submission, SubmissionVerdict, TestCase,
};
use judge_core::{Judge, JudgeConfig, LanguageConfigManager};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RESULT_WAIT_LIMIT: Duration = Duration::from_secs(120);

/// Submission file shared by `run` and `submit`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionFile {
    #[serde(default)]
    challenge_id: Option<String>,
    #[serde(flatten)]
    submission: Submission,
    test_cases: Vec<TestCase>,
    #[serde(default)]
    limits: Option<ExecutionLimits>,
}

fn read_submission_file(path: &Path) -> Result<SubmissionFile> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn build_judge(languages_config: &Path) -> Result<Judge> {
    let manager = LanguageConfigManager::load_or_builtin(languages_config)?;
    let config = JudgeConfig::from_env()?;
    Ok(Judge::from_language_config(&manager, config))
}

async fn connect_redis(redis_url: Option<&str>) -> Result<::redis::aio::ConnectionManager> {
    let url = match redis_url {
        Some(url) => url.to_string(),
        None => std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
    };
    let client = ::redis::Client::open(url.as_str())?;
    ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", url))
}

/// Evaluate locally and print the verdict. Returns whether every test passed.
pub async fn run_submission(file: &Path, languages_config: &Path) -> Result<bool> {
    let input = read_submission_file(file)?;
    let judge = build_judge(languages_config)?;
    let limits = input.limits.unwrap_or(judge.config().default_limits);

    let verdict = judge
        .evaluate(&input.submission, &input.test_cases, &limits)
        .await?;

    println!("{}", serde_json::to_string_pretty(&verdict)?);
    eprintln!("{}", summary_line(&verdict));

    Ok(verdict.all_passed)
}

fn summary_line(verdict: &SubmissionVerdict) -> String {
    if verdict.all_passed {
        return format!("✅ {}/{} test cases passed", verdict.passed_count, verdict.total_count);
    }
    let mut line = format!("❌ {}/{} test cases passed", verdict.passed_count, verdict.total_count);
    if let Some(index) = verdict.first_failing_index {
        line.push_str(&format!(", first failure at #{}", index));
        if let Some(error) = &verdict.outcomes[index].error {
            line.push_str(&format!(" ({})", error));
        }
    }
    line
}

fn probe_solution(language: Language) -> &'static str {
    match language {
        Language::JavaScript => "function solution(x) { return x; }",
        Language::TypeScript => "function solution(x: number): number { return x; }",
        Language::Python => "def solution(x):\n    return x\n",
    }
}

/// List configured languages, optionally checking each backend end to end.
pub async fn list_languages(languages_config: &Path, probe: bool) -> Result<()> {
    let manager = LanguageConfigManager::load_or_builtin(languages_config)?;
    let configs = manager.enabled_configs();

    if configs.is_empty() {
        println!("No languages enabled.");
        return Ok(());
    }

    println!("📋 Configured Languages:\n");
    println!("{:<12} {:<10} {:<12} {:<8}", "LANGUAGE", "COMMAND", "HARNESS", "RLIMIT_AS");
    println!("{}", "─".repeat(46));
    for config in &configs {
        println!(
            "{:<12} {:<10} {:<12} {:<8}",
            config.name.as_str(),
            config.command,
            format!("{:?}", config.harness).to_lowercase(),
            if config.address_space_limit { "yes" } else { "no" }
        );
    }

    if !probe {
        println!("\n✅ Total: {} language(s)", configs.len());
        return Ok(());
    }

    println!("\n🔍 Probing backends...\n");
    let judge = Judge::from_language_config(&manager, JudgeConfig::from_env()?);
    let cases = [TestCase::new(serde_json::json!([42]), serde_json::json!(42))];
    let mut healthy = 0;

    for language in judge.languages() {
        let submission = Submission::new(probe_solution(language), language.as_str());
        let start = Instant::now();
        match judge.evaluate(&submission, &cases, &ExecutionLimits::default()).await {
            Ok(verdict) if verdict.all_passed => {
                healthy += 1;
                println!("  ✅ {:<12} {}ms", language.as_str(), start.elapsed().as_millis());
            }
            Ok(verdict) => {
                let reason = verdict.outcomes[0]
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unexpected output".to_string());
                println!("  ❌ {:<12} {}", language.as_str(), reason);
            }
            Err(e) => println!("  ❌ {:<12} {}", language.as_str(), e),
        }
    }

    println!("\n{}/{} backend(s) healthy", healthy, configs.len());
    Ok(())
}

/// Queue a submission for the workers.
pub async fn submit_job(file: &Path, wait: bool, redis_url: Option<&str>) -> Result<()> {
    let input = read_submission_file(file)?;

    // Unknown languages have no queue to go to
    let language = Language::parse(&input.submission.language)
        .with_context(|| format!("Unsupported language: '{}'", input.submission.language))?;

    let job = JobRequest {
        id: Uuid::new_v4(),
        challenge_id: input.challenge_id,
        submission: input.submission,
        test_cases: input.test_cases,
        limits: input.limits,
    };

    let mut conn = connect_redis(redis_url).await?;
    redis::push_job(&mut conn, &language, &job).await?;

    println!("🚀 Job {} queued on {}", job.id, redis::queue_name(&language));

    if !wait {
        return Ok(());
    }

    let start = Instant::now();
    loop {
        if let Some(result) = redis::get_result(&mut conn, &job.id).await? {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.status != JobStatus::Completed {
                anyhow::bail!("Job {} ended with status {:?}", job.id, result.status);
            }
            return Ok(());
        }
        if start.elapsed() > RESULT_WAIT_LIMIT {
            anyhow::bail!("No result for job {} after {}s", job.id, RESULT_WAIT_LIMIT.as_secs());
        }
        tokio::time::sleep(RESULT_POLL_INTERVAL).await;
    }
}

pub async fn show_stats(challenge_id: &str, redis_url: Option<&str>) -> Result<()> {
    let mut conn = connect_redis(redis_url).await?;
    let stats = redis::get_challenge_stats(&mut conn, challenge_id).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use judge_common::types::{ExecutionError, ExecutionOutcome};
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_read_submission_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "challengeId": "two-sum",
                "code": "function solution(a, b) {{ return a + b; }}",
                "language": "js",
                "testCases": [{{"input": [1, 2], "output": 3}}],
                "limits": {{"timeoutMs": 500}}
            }}"#
        )
        .unwrap();

        let parsed = read_submission_file(file.path()).unwrap();

        assert_eq!(parsed.challenge_id.as_deref(), Some("two-sum"));
        assert_eq!(parsed.submission.language, "js");
        assert_eq!(parsed.test_cases[0].expected_output, json!(3));
        let limits = parsed.limits.unwrap();
        assert_eq!(limits.timeout_ms, 500);
        assert_eq!(limits.memory_limit_mb, ExecutionLimits::default().memory_limit_mb);
    }

    #[test]
    fn test_summary_line_names_first_failure() {
        let verdict = SubmissionVerdict::from_outcomes(vec![
            ExecutionOutcome::completed(json!(1), true, 3, 0),
            ExecutionOutcome::failed(ExecutionError::timeout(), 2000, 0),
        ]);

        let line = summary_line(&verdict);

        assert!(line.contains("1/2"));
        assert!(line.contains("#1"));
        assert!(line.contains("time limit exceeded"));
    }

    #[test]
    fn test_every_language_has_a_probe() {
        for language in Language::ALL {
            assert!(probe_solution(language).contains("solution"));
        }
    }
}
