use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerConfig {
    #[serde(default = "default_log_dirs")]
    pub log_dirs: Vec<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default)]
    pub watermark_file: String,
    #[serde(default = "default_batch_lines")]
    pub batch_lines: usize,
    #[serde(default = "default_file_backoff_base_seconds")]
    pub file_backoff_base_seconds: f64,
    #[serde(default = "default_file_backoff_max_seconds")]
    pub file_backoff_max_seconds: f64,
    #[serde(default)]
    pub block_delay_ms: u64,
    #[serde(default = "default_true")]
    pub watch: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_interval_ms")]
    pub retry_max_interval_ms: u64,
    #[serde(default = "default_retry_max_elapsed_seconds")]
    pub retry_max_elapsed_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            log_dirs: default_log_dirs(),
            state_dir: default_state_dir(),
            watermark_file: String::new(),
            batch_lines: default_batch_lines(),
            file_backoff_base_seconds: default_file_backoff_base_seconds(),
            file_backoff_max_seconds: default_file_backoff_max_seconds(),
            block_delay_ms: 0,
            watch: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_interval_ms: default_retry_max_interval_ms(),
            retry_max_elapsed_seconds: default_retry_max_elapsed_seconds(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl AnalyzerConfig {
    pub fn state_path(&self, name: &str) -> PathBuf {
        Path::new(&self.state_dir).join(name)
    }
}

fn default_log_dirs() -> Vec<String> {
    vec!["~/.weft/logs/raw".to_string()]
}

fn default_state_dir() -> String {
    "~/.weft/state".to_string()
}

fn default_watermark_name() -> &'static str {
    "logs_watermark.json"
}

fn default_batch_lines() -> usize {
    200
}

fn default_file_backoff_base_seconds() -> f64 {
    5.0
}

fn default_file_backoff_max_seconds() -> f64 {
    30.0
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_interval_ms() -> u64 {
    10_000
}

fn default_retry_max_elapsed_seconds() -> f64 {
    180.0
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8877
}

fn default_true() -> bool {
    true
}

pub fn expand_path(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{}", home.to_string_lossy(), stripped);
        }
    }
    path.to_string()
}

fn home_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".weft").join("config.toml"))
}

fn repo_default_config_path() -> PathBuf {
    PathBuf::from("config/weft.toml")
}

fn resolve_config_path_with_overrides(
    raw_path: Option<PathBuf>,
    env_keys: &[&str],
    home_path: Option<PathBuf>,
    repo_default: PathBuf,
) -> PathBuf {
    if let Some(path) = raw_path {
        return path;
    }

    for key in env_keys {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
    }

    if let Some(path) = home_path {
        if path.exists() {
            return path;
        }
    }

    if repo_default.exists() {
        return repo_default;
    }

    home_config_path().unwrap_or(repo_default)
}

pub fn resolve_config_path(raw_path: Option<PathBuf>) -> PathBuf {
    resolve_config_path_with_overrides(
        raw_path,
        &["WEFT_CONFIG"],
        home_config_path(),
        repo_default_config_path(),
    )
}

fn resolve_state_file(state_dir: &str, value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Path::new(state_dir).join(fallback).to_string_lossy().to_string();
    }

    let expanded = expand_path(trimmed);
    if Path::new(&expanded).is_absolute() {
        return expanded;
    }

    Path::new(state_dir).join(expanded).to_string_lossy().to_string()
}

fn normalize_config(mut cfg: AppConfig) -> AppConfig {
    cfg.analyzer.log_dirs = cfg
        .analyzer
        .log_dirs
        .iter()
        .map(|dir| expand_path(dir))
        .collect();
    cfg.analyzer.state_dir = expand_path(&cfg.analyzer.state_dir);
    cfg.analyzer.watermark_file = resolve_state_file(
        &cfg.analyzer.state_dir,
        &cfg.analyzer.watermark_file,
        default_watermark_name(),
    );
    cfg.analyzer.batch_lines = cfg.analyzer.batch_lines.max(1);
    if cfg.analyzer.file_backoff_max_seconds < cfg.analyzer.file_backoff_base_seconds {
        cfg.analyzer.file_backoff_max_seconds = cfg.analyzer.file_backoff_base_seconds;
    }

    cfg
}

/// Returns the default configuration with paths normalized the same way a
/// loaded file would be.
pub fn default_config() -> AppConfig {
    normalize_config(AppConfig::default())
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
    let cfg: AppConfig = toml::from_str(&content).context("failed to parse TOML config")?;
    Ok(normalize_config(cfg))
}
