//! Language backends: turn (code, input, limits) into one sandboxed harness
//! run and interpret how it ended.

use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::engine::{ProcessEngine, ResourceLimits, SandboxCommand, SandboxRun, Termination, REPORT_FD};
use crate::error::{JudgeError, Result};
use crate::evaluator::RunOutput;
use crate::harness::{parse_report, HarnessKind, HarnessReport};
use async_trait::async_trait;
use judge_common::types::{ExecutionError, ExecutionErrorKind, ExecutionLimits, Language};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Address space granted on top of the memory limit for the interpreter itself.
const ADDRESS_SPACE_HEADROOM_MB: u64 = 64;

/// Exit code the harnesses use when they cannot read their own inputs.
const HARNESS_SETUP_FAILURE_EXIT: i32 = 70;

#[async_trait]
pub trait LanguageBackend: Send + Sync {
    fn language(&self) -> Language;

    /// Run `code` against a single `input` in a fresh sandbox.
    ///
    /// Everything the candidate does wrong comes back inside `RunOutput`.
    /// `Err` is reserved for host-side failures.
    async fn execute(&self, code: &str, input: &Value, limits: &ExecutionLimits) -> Result<RunOutput>;
}

pub fn solution_file_name(language: Language) -> &'static str {
    match language {
        Language::JavaScript => "solution.js",
        Language::TypeScript => "solution.ts",
        Language::Python => "solution.py",
    }
}

/// Backend that drives an interpreter through one of the judge harnesses.
pub struct InterpreterBackend {
    config: LanguageConfig,
    engine: Arc<ProcessEngine>,
    max_message_bytes: usize,
}

impl InterpreterBackend {
    pub fn new(config: LanguageConfig, engine: Arc<ProcessEngine>, max_message_bytes: usize) -> Self {
        Self {
            config,
            engine,
            max_message_bytes,
        }
    }

    fn resource_limits(&self, limits: &ExecutionLimits) -> ResourceLimits {
        let base = ResourceLimits::for_timeout(limits.timeout_ms);
        if self.config.address_space_limit {
            base.with_address_space((limits.memory_limit_mb + ADDRESS_SPACE_HEADROOM_MB) * 1024 * 1024)
        } else {
            base
        }
    }
}

#[async_trait]
impl LanguageBackend for InterpreterBackend {
    fn language(&self) -> Language {
        self.config.name
    }

    async fn execute(&self, code: &str, input: &Value, limits: &ExecutionLimits) -> Result<RunOutput> {
        let harness = self.config.harness;
        let solution_file = solution_file_name(self.config.name);

        let workspace = self.engine.create_workspace()?;
        workspace.write_file(harness.file_name(), harness.source()).await?;
        workspace.write_file(solution_file, code).await?;

        let stdin = serde_json::to_vec(&json!({ "input": input }))
            .map_err(|e| JudgeError::Internal(format!("failed to encode test input: {}", e)))?;

        let command = SandboxCommand {
            program: self.config.command.clone(),
            args: self.config.render_args(harness.file_name(), limits.memory_limit_mb),
            env: vec![
                ("JUDGE_TIMEOUT_MS".to_string(), limits.timeout_ms.to_string()),
                ("JUDGE_LANGUAGE".to_string(), self.config.name.as_str().to_string()),
                ("JUDGE_SOLUTION".to_string(), solution_file.to_string()),
                ("JUDGE_REPORT_FD".to_string(), REPORT_FD.to_string()),
            ],
            stdin,
            timeout: Duration::from_millis(limits.timeout_ms),
            limits: self.resource_limits(limits),
        };

        let run = self.engine.run(&workspace, &command).await?;
        let workspace_dir = workspace.path().to_string_lossy().into_owned();

        interpret(&run, harness, limits, self.max_message_bytes, &workspace_dir)
    }
}

/// Map a finished sandbox run onto a value or a classified error.
///
/// Precedence: supervisor timeout, harness report, CPU rlimit, interpreter
/// out-of-memory output, fatal signals, output cap, unreadable report, bare
/// exit. Only the report channel is trusted; stdout is candidate output.
pub fn interpret(
    run: &SandboxRun,
    harness: HarnessKind,
    limits: &ExecutionLimits,
    max_message_bytes: usize,
    workspace_dir: &str,
) -> Result<RunOutput> {
    let failed = |error: ExecutionError, memory_bytes: u64| RunOutput {
        result: Err(error),
        execution_time_ms: run.elapsed_ms,
        memory_bytes,
    };

    if run.termination == Termination::TimedOut {
        return Ok(failed(ExecutionError::timeout(), 0));
    }

    if let Some(report) = parse_report(&run.report) {
        let memory_bytes = report.memory_bytes();
        let execution_time_ms = report.elapsed_ms().unwrap_or(run.elapsed_ms);
        let result = match report {
            HarnessReport::Ok { .. } if execution_time_ms > limits.timeout_ms => Err(ExecutionError::timeout()),
            HarnessReport::Ok { output, .. } => Ok(output),
            HarnessReport::Error { kind: ExecutionErrorKind::Timeout, .. } => Err(ExecutionError::timeout()),
            HarnessReport::Error {
                kind: ExecutionErrorKind::ResourceLimit,
                ..
            } => Err(ExecutionError::memory_exceeded(limits.memory_limit_mb)),
            HarnessReport::Error { kind, message, .. } => Err(ExecutionError::new(
                kind,
                truncate_message(&scrub(&message, workspace_dir), max_message_bytes),
            )),
        };
        return Ok(RunOutput {
            result,
            execution_time_ms,
            memory_bytes,
        });
    }

    if let Termination::Signaled(signal) = run.termination {
        if is_cpu_limit_signal(signal) {
            return Ok(failed(ExecutionError::timeout(), 0));
        }
    }

    if harness.oom_markers().iter().any(|marker| run.stderr.contains(marker)) {
        return Ok(failed(ExecutionError::memory_exceeded(limits.memory_limit_mb), 0));
    }

    let error = match run.termination {
        Termination::Signaled(signal) => signal_error(signal),
        _ if run.stdout_truncated || run.report_truncated => {
            ExecutionError::new(ExecutionErrorKind::ResourceLimit, "output limit exceeded")
        }
        Termination::Exited(HARNESS_SETUP_FAILURE_EXIT) => {
            return Err(JudgeError::Internal(format!(
                "harness setup failed: {}",
                run.stderr.trim()
            )));
        }
        _ if !run.report.trim().is_empty() => {
            debug!(report_bytes = run.report.len(), "Discarding unreadable harness report");
            ExecutionError::new(ExecutionErrorKind::Runtime, "result report was malformed")
        }
        Termination::Exited(code) => {
            debug!(exit_code = code, "Interpreter exited without a harness report");
            let stderr = scrub(run.stderr.trim(), workspace_dir);
            let message = if stderr.is_empty() {
                format!("process exited with code {} without producing a result", code)
            } else {
                truncate_message(&stderr, max_message_bytes)
            };
            ExecutionError::new(ExecutionErrorKind::Runtime, message)
        }
        Termination::TimedOut => ExecutionError::timeout(),
    };

    Ok(failed(error, 0))
}

#[cfg(unix)]
fn is_cpu_limit_signal(signal: i32) -> bool {
    signal == nix::sys::signal::Signal::SIGXCPU as i32
}

#[cfg(not(unix))]
fn is_cpu_limit_signal(_signal: i32) -> bool {
    false
}

fn signal_error(signal: i32) -> ExecutionError {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;
        match Signal::try_from(signal) {
            // Nothing in the supervisor sends SIGKILL before the deadline, so
            // this is the kernel reclaiming memory
            Ok(Signal::SIGKILL) => {
                return ExecutionError::new(
                    ExecutionErrorKind::ResourceLimit,
                    "process was killed, likely memory limit exceeded",
                );
            }
            Ok(other) => {
                return ExecutionError::new(
                    ExecutionErrorKind::Runtime,
                    format!("process terminated by {}", other.as_str()),
                );
            }
            Err(_) => {}
        }
    }
    ExecutionError::new(
        ExecutionErrorKind::Runtime,
        format!("process terminated by signal {}", signal),
    )
}

fn scrub(message: &str, workspace_dir: &str) -> String {
    if workspace_dir.is_empty() {
        return message.to_string();
    }
    message.replace(&format!("{}/", workspace_dir), "").replace(workspace_dir, ".")
}

/// Cut `message` to at most `max_bytes`, on a character boundary.
pub fn truncate_message(message: &str, max_bytes: usize) -> String {
    if message.len() <= max_bytes {
        return message.to_string();
    }
    let mut end = max_bytes;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &message[..end])
}

/// Backends by language. Only languages present here can be judged.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<Language, Arc<dyn LanguageBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One interpreter backend per enabled language.
    pub fn from_config(manager: &LanguageConfigManager, engine: Arc<ProcessEngine>, max_message_bytes: usize) -> Self {
        let mut registry = Self::new();
        for config in manager.enabled_configs() {
            registry.register(Arc::new(InterpreterBackend::new(
                config.clone(),
                engine.clone(),
                max_message_bytes,
            )));
        }
        registry
    }

    /// Add or replace the backend for its language.
    pub fn register(&mut self, backend: Arc<dyn LanguageBackend>) {
        self.backends.insert(backend.language(), backend);
    }

    pub fn get(&self, language: &Language) -> Option<Arc<dyn LanguageBackend>> {
        self.backends.get(language).cloned()
    }

    pub fn languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|l| self.backends.contains_key(l))
            .collect()
    }
}
