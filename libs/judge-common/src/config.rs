// Worker runtime configuration, read from the environment.

use crate::types::Language;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_LANGUAGES_CONFIG: &str = "config/languages.json";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// Languages whose queues this worker consumes.
    pub languages: Vec<Language>,
    pub languages_config: String,
    pub poll_timeout_seconds: f64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, String> {
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let languages_config = std::env::var("LANGUAGES_CONFIG")
            .unwrap_or_else(|_| DEFAULT_LANGUAGES_CONFIG.to_string());

        let languages = match std::env::var("WORKER_LANGUAGES") {
            Ok(list) => parse_language_list(&list)?,
            Err(_) => Language::ALL.to_vec(),
        };

        let poll_timeout_seconds = match std::env::var("WORKER_POLL_TIMEOUT_SECONDS") {
            Ok(raw) => raw
                .parse::<f64>()
                .map_err(|e| format!("Invalid WORKER_POLL_TIMEOUT_SECONDS '{}': {}", raw, e))?,
            Err(_) => 5.0,
        };

        Ok(Self {
            redis_url,
            languages,
            languages_config,
            poll_timeout_seconds,
        })
    }
}

/// Parse a comma-separated language list such as `javascript,python`.
pub fn parse_language_list(list: &str) -> Result<Vec<Language>, String> {
    let mut languages = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let language = Language::parse(name).ok_or_else(|| format!("Unknown language '{}'", name))?;
        if !languages.contains(&language) {
            languages.push(language);
        }
    }
    if languages.is_empty() {
        return Err("No languages given".to_string());
    }
    Ok(languages)
}
