// Language and judge configuration management
use crate::engine::EngineConfig;
use crate::harness::HarnessKind;
use crate::isolation::SandboxUser;
use crate::normalizer::SubmissionPolicy;
use anyhow::{bail, Context, Result};
use judge_common::types::{ExecutionLimits, Language};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How one language is executed on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    /// Interpreter binary, resolved through the sandbox PATH.
    pub command: String,
    /// Interpreter arguments. `{harness}` and `{memory_mb}` are substituted per run.
    pub args: Vec<String>,
    pub harness: HarnessKind,
    /// Apply RLIMIT_AS. Off for runtimes that reserve large virtual ranges up front (V8).
    #[serde(default)]
    pub address_space_limit: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl LanguageConfig {
    pub fn render_args(&self, harness_path: &str, memory_mb: u64) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{harness}", harness_path)
                    .replace("{memory_mb}", &memory_mb.to_string())
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Built-in language table, used when no languages.json is present.
pub fn builtin_languages() -> Vec<LanguageConfig> {
    let node = |name| LanguageConfig {
        name,
        command: "node".to_string(),
        args: vec![
            "--max-old-space-size={memory_mb}".to_string(),
            "--disallow-code-generation-from-strings".to_string(),
            "{harness}".to_string(),
        ],
        harness: HarnessKind::JavaScript,
        address_space_limit: false,
        enabled: true,
    };

    vec![
        node(Language::JavaScript),
        node(Language::TypeScript),
        LanguageConfig {
            name: Language::Python,
            command: "python3".to_string(),
            args: vec!["-I".to_string(), "-S".to_string(), "-B".to_string(), "{harness}".to_string()],
            harness: HarnessKind::Python,
            address_space_limit: true,
            enabled: true,
        },
    ]
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content).with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;
        Self::from_configs(languages_json.languages)
    }

    pub fn from_configs(languages: Vec<LanguageConfig>) -> Result<Self> {
        let mut configs = HashMap::new();
        for lang in languages {
            if lang.command.trim().is_empty() {
                bail!("Language '{}' has an empty command", lang.name);
            }
            if !lang.args.iter().any(|a| a.contains("{harness}")) {
                bail!("Language '{}' args must reference {{harness}}", lang.name);
            }
            if configs.insert(lang.name, lang).is_some() {
                bail!("Language configured twice");
            }
        }
        Ok(Self { configs })
    }

    pub fn builtin() -> Self {
        let configs = builtin_languages().into_iter().map(|c| (c.name, c)).collect();
        Self { configs }
    }

    /// Load `path` if it exists, otherwise fall back to the built-in table.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "Language config not found, using built-in defaults");
            Ok(Self::builtin())
        }
    }

    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    pub fn is_enabled(&self, language: &Language) -> bool {
        self.configs.get(language).is_some_and(|c| c.enabled)
    }

    /// Enabled configurations, in a stable order.
    pub fn enabled_configs(&self) -> Vec<&LanguageConfig> {
        Language::ALL
            .iter()
            .filter_map(|l| self.configs.get(l))
            .filter(|c| c.enabled)
            .collect()
    }

    pub fn list_languages(&self) -> Vec<String> {
        self.enabled_configs().iter().map(|c| c.name.to_string()).collect()
    }
}

/// Judge-wide settings. Per-exercise limits travel with each call instead.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Upper bound on sandboxes alive at once, across all submissions.
    pub max_concurrent_sandboxes: usize,
    /// Submissions in flight beyond this are rejected with `Overloaded`.
    pub max_pending_submissions: usize,
    /// Test cases of one submission that may run at the same time.
    pub per_submission_parallelism: usize,
    pub max_error_message_bytes: usize,
    pub engine: EngineConfig,
    pub policy: SubmissionPolicy,
    pub default_limits: ExecutionLimits,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        Self {
            max_concurrent_sandboxes: cpus,
            max_pending_submissions: 64,
            per_submission_parallelism: 4,
            max_error_message_bytes: 4096,
            engine: EngineConfig::default(),
            policy: SubmissionPolicy::default(),
            default_limits: ExecutionLimits::default(),
        }
    }
}

impl JudgeConfig {
    /// Defaults overridden by `JUDGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let engine = EngineConfig {
            max_output_bytes: env_or("JUDGE_MAX_OUTPUT_BYTES", defaults.engine.max_output_bytes)?,
            startup_grace: Duration::from_millis(env_or(
                "JUDGE_STARTUP_GRACE_MS",
                defaults.engine.startup_grace.as_millis() as u64,
            )?),
            temp_root: std::env::var("JUDGE_TEMP_DIR").ok().map(PathBuf::from),
            namespaces: env_or("JUDGE_SANDBOX_NAMESPACES", defaults.engine.namespaces)?,
            run_as: sandbox_user(std::env::var("JUDGE_SANDBOX_UID").ok(), defaults.engine.run_as)?,
            max_processes: env_or("JUDGE_SANDBOX_MAX_PROCESSES", defaults.engine.max_processes)?,
        };

        let policy = SubmissionPolicy {
            max_code_chars: env_or("JUDGE_MAX_CODE_CHARS", defaults.policy.max_code_chars)?,
            max_test_cases: env_or("JUDGE_MAX_TEST_CASES", defaults.policy.max_test_cases)?,
            max_timeout_ms: env_or("JUDGE_MAX_TIMEOUT_MS", defaults.policy.max_timeout_ms)?,
            min_memory_limit_mb: defaults.policy.min_memory_limit_mb,
            max_memory_limit_mb: env_or("JUDGE_MAX_MEMORY_MB", defaults.policy.max_memory_limit_mb)?,
        };

        let default_limits = ExecutionLimits {
            timeout_ms: env_or("JUDGE_DEFAULT_TIMEOUT_MS", defaults.default_limits.timeout_ms)?,
            memory_limit_mb: env_or("JUDGE_DEFAULT_MEMORY_MB", defaults.default_limits.memory_limit_mb)?,
            float_tolerance: None,
        };

        let config = Self {
            max_concurrent_sandboxes: env_or("JUDGE_MAX_SANDBOXES", defaults.max_concurrent_sandboxes)?,
            max_pending_submissions: env_or("JUDGE_MAX_PENDING_SUBMISSIONS", defaults.max_pending_submissions)?,
            per_submission_parallelism: env_or("JUDGE_PER_SUBMISSION_PARALLELISM", defaults.per_submission_parallelism)?,
            max_error_message_bytes: defaults.max_error_message_bytes,
            engine,
            policy,
            default_limits,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sandboxes == 0 {
            bail!("max_concurrent_sandboxes must be at least 1");
        }
        if self.max_pending_submissions == 0 {
            bail!("max_pending_submissions must be at least 1");
        }
        if self.per_submission_parallelism == 0 {
            bail!("per_submission_parallelism must be at least 1");
        }
        if self.engine.max_processes == 0 {
            bail!("sandbox max_processes must be at least 1");
        }
        if self.default_limits.timeout_ms > self.policy.max_timeout_ms {
            bail!(
                "default timeout {}ms exceeds the ceiling of {}ms",
                self.default_limits.timeout_ms,
                self.policy.max_timeout_ms
            );
        }
        Ok(())
    }
}

/// `JUDGE_SANDBOX_UID` (with optional `JUDGE_SANDBOX_GID`, defaulting to the
/// uid). `keep` runs sandboxes under the worker's own credentials.
fn sandbox_user(uid: Option<String>, default: Option<SandboxUser>) -> Result<Option<SandboxUser>> {
    let Some(raw) = uid else {
        return Ok(default);
    };
    if raw.trim() == "keep" {
        return Ok(None);
    }
    let uid: u32 = raw
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid JUDGE_SANDBOX_UID '{}': {}", raw, e))?;
    let gid = env_or("JUDGE_SANDBOX_GID", uid)?;
    Ok(Some(SandboxUser { uid, gid }))
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}
