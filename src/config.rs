use std::time::Duration;

pub const DEFAULT_LOG_FILTER: &str = "postop_priority_engine=info,postop_priority=info";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const PLACEHOLDER_KEY: &str = "your_claude_api_key_here";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fallback rescoring interval for time-based factors.
    pub refresh_interval: Duration,
    /// How often patient streams that failed to open, or ended, are reopened.
    pub retry_interval: Duration,
    /// Logs fetched for streak detection.
    pub history_limit: usize,
    /// Snapshot poll interval for stores without push notifications.
    pub poll_interval: Duration,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30 * 60),
            retry_interval: Duration::from_secs(30),
            history_limit: 10,
            poll_interval: Duration::from_secs(5),
            generator: GeneratorConfig::default(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or unparsable values keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = EngineConfig::default();
        let secs = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        let api_key = lookup("ANTHROPIC_API_KEY")
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty() && key != PLACEHOLDER_KEY);

        Self {
            refresh_interval: secs("PRIORITY_REFRESH_SECS", defaults.refresh_interval),
            retry_interval: secs("STREAM_RETRY_SECS", defaults.retry_interval),
            history_limit: lookup("ESCALATION_HISTORY_LIMIT")
                .and_then(|value| value.trim().parse::<usize>().ok())
                .filter(|limit| *limit > 0)
                .unwrap_or(defaults.history_limit),
            poll_interval: secs("STORE_POLL_SECS", defaults.poll_interval),
            generator: GeneratorConfig {
                api_key,
                model: lookup("ANTHROPIC_MODEL").unwrap_or(defaults.generator.model),
                base_url: lookup("ANTHROPIC_BASE_URL").unwrap_or(defaults.generator.base_url),
                timeout: secs("GENERATION_TIMEOUT_SECS", defaults.generator.timeout),
            },
        }
    }
}
