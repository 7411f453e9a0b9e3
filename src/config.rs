use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub review: ReviewConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub project: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_token_env() -> String {
    "DGX_API_TOKEN".to_string()
}
fn default_api_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

impl ApiConfig {
    /// Bearer token from the configured environment variable, if set.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: u32,
    #[serde(default)]
    pub partial_match: bool,
    #[serde(default = "default_match_field")]
    pub search_field: String,
    #[serde(default = "default_match_field")]
    pub asset_match_field: String,
    #[serde(default = "default_match_field")]
    pub file_match_field: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            min_tokens: default_min_tokens(),
            partial_match: false,
            search_field: default_match_field(),
            asset_match_field: default_match_field(),
            file_match_field: default_match_field(),
        }
    }
}

fn default_chunk_size() -> usize {
    50
}
fn default_min_tokens() -> u32 {
    2
}
fn default_match_field() -> String {
    "name".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_interval_ms() -> u64 {
    3000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_poll_timeout_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            interval_ms: default_interval_ms(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl ExportConfig {
    /// Poll settings for export jobs; backoff shares the detection ceiling.
    pub fn polling(&self) -> PollingConfig {
        PollingConfig {
            interval_ms: self.interval_ms,
            max_backoff_ms: default_max_backoff_ms().max(self.interval_ms),
            timeout_secs: self.timeout_secs,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReviewConfig {
    #[serde(default)]
    pub checked_by: Option<String>,
    #[serde(default = "default_creating_app")]
    pub creating_app: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            checked_by: None,
            creating_app: default_creating_app(),
        }
    }
}

fn default_creating_app() -> String {
    "interactive-diagrams".to_string()
}

impl Config {
    /// Config for commands that never reach the service (e.g. `dgx plan`).
    pub fn minimal() -> Self {
        Self {
            api: ApiConfig {
                base_url: "http://localhost".to_string(),
                project: "offline".to_string(),
                token_env: default_token_env(),
                timeout_secs: default_api_timeout_secs(),
                max_retries: default_max_retries(),
            },
            detection: DetectionConfig::default(),
            polling: PollingConfig::default(),
            export: ExportConfig::default(),
            review: ReviewConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.api.base_url.trim().is_empty() {
        anyhow::bail!("api.base_url must not be empty");
    }
    if !config.api.base_url.starts_with("http://") && !config.api.base_url.starts_with("https://")
    {
        anyhow::bail!("api.base_url must be an http(s) URL");
    }
    if config.api.project.trim().is_empty() {
        anyhow::bail!("api.project must not be empty");
    }

    if config.detection.chunk_size == 0 {
        anyhow::bail!("detection.chunk_size must be > 0");
    }
    if config.detection.search_field.trim().is_empty() {
        anyhow::bail!("detection.search_field must not be empty");
    }

    if config.polling.interval_ms == 0 {
        anyhow::bail!("polling.interval_ms must be > 0");
    }
    if config.polling.max_backoff_ms < config.polling.interval_ms {
        anyhow::bail!("polling.max_backoff_ms must be >= polling.interval_ms");
    }
    if config.polling.timeout() < config.polling.interval() {
        anyhow::bail!("polling.timeout_secs must cover at least one poll interval");
    }
    if config.export.interval_ms == 0 {
        anyhow::bail!("export.interval_ms must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[api]
base_url = "https://api.example.com"
project = "plant"
"#;

    #[test]
    fn defaults_fill_optional_sections() {
        let cfg = parse_config(BASE).unwrap();
        assert_eq!(cfg.detection.chunk_size, 50);
        assert_eq!(cfg.detection.search_field, "name");
        assert_eq!(cfg.polling.interval_ms, 3000);
        assert_eq!(cfg.api.token_env, "DGX_API_TOKEN");
        assert_eq!(cfg.review.creating_app, "interactive-diagrams");
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let content = format!("{}\n[detection]\nchunk_size = 0\n", BASE);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn rejects_backoff_below_interval() {
        let content = format!(
            "{}\n[polling]\ninterval_ms = 5000\nmax_backoff_ms = 100\n",
            BASE
        );
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn rejects_non_http_base_url() {
        let content = "[api]\nbase_url = \"ftp://x\"\nproject = \"p\"\n";
        assert!(parse_config(content).is_err());
    }
}
