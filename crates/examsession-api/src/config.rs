//! Client and session configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use examsession_core::realtime::ReconnectPolicy;
use examsession_core::SessionConfig;

use crate::http::{HttpAttemptApi, DEFAULT_TIMEOUT_SECS};

/// Where the attempt API lives and how to reach it.
///
/// Note: Custom Debug impl masks the token to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSettings")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Session timing overrides. Unset fields keep the engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub autosave_debounce_ms: Option<u64>,
    pub tick_interval_ms: Option<u64>,
    pub realtime_max_retries: Option<u32>,
    pub realtime_backoff_base_ms: Option<u64>,
    pub realtime_backoff_cap_ms: Option<u64>,
    pub realtime_buffer: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub cleanup_timeout_secs: Option<u64>,
}

/// Top-level examsession configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamSessionConfig {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub session: SessionSettings,
    /// User id used when `--user` is not given.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Directory searched when a test is referenced by id.
    #[serde(default = "default_tests_dir")]
    pub tests_dir: PathBuf,
    /// Where finished result payloads are written.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

fn default_tests_dir() -> PathBuf {
    PathBuf::from("./test-definitions")
}
fn default_results_dir() -> PathBuf {
    PathBuf::from("./examsession-results")
}

impl Default for ExamSessionConfig {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            session: SessionSettings::default(),
            user_id: None,
            tests_dir: default_tests_dir(),
            results_dir: default_results_dir(),
        }
    }
}

impl ExamSessionConfig {
    /// Engine configuration with the overrides applied.
    pub fn to_session_config(&self) -> SessionConfig {
        let base = SessionConfig::default();
        let s = &self.session;
        let ms = Duration::from_millis;
        let policy = ReconnectPolicy::default();
        SessionConfig {
            autosave_debounce: s.autosave_debounce_ms.map(ms).unwrap_or(base.autosave_debounce),
            tick_interval: s.tick_interval_ms.map(ms).unwrap_or(base.tick_interval),
            reconnect: ReconnectPolicy {
                max_retries: s.realtime_max_retries.unwrap_or(policy.max_retries),
                base_delay: s.realtime_backoff_base_ms.map(ms).unwrap_or(policy.base_delay),
                max_delay: s.realtime_backoff_cap_ms.map(ms).unwrap_or(policy.max_delay),
                buffer: s.realtime_buffer.unwrap_or(policy.buffer),
            },
            poll_interval: s
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(base.poll_interval),
            cleanup_timeout: s
                .cleanup_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.cleanup_timeout),
            event_capacity: base.event_capacity,
        }
    }

    /// Build the HTTP attempt client described by `[api]`.
    pub fn create_api(&self) -> Result<HttpAttemptApi> {
        HttpAttemptApi::new(
            &self.api.base_url,
            self.api.token.clone(),
            Duration::from_secs(self.api.timeout_secs),
        )
        .context("failed to create attempt API client")
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_name = &result[start + 2..start + end];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
    }
    result
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `examsession.toml` in the current directory
/// 2. `~/.config/examsession/config.toml`
///
/// Environment variable overrides: `EXAMSESSION_API_URL`, `EXAMSESSION_API_TOKEN`.
pub fn load_config() -> Result<ExamSessionConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<ExamSessionConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from("examsession.toml");
            if local.exists() {
                Some(local)
            } else {
                dirs_path()
                    .map(|home| home.join("config.toml"))
                    .filter(|global| global.exists())
            }
        }
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            tracing::debug!("loaded config from {}", path.display());
            parse_config(&content).with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => ExamSessionConfig::default(),
    };

    if let Ok(url) = std::env::var("EXAMSESSION_API_URL") {
        config.api.base_url = url;
    }
    if let Ok(token) = std::env::var("EXAMSESSION_API_TOKEN") {
        config.api.token = Some(token);
    }
    resolve_config(&mut config);

    Ok(config)
}

/// Parse a config document without touching the environment.
pub fn parse_config(content: &str) -> Result<ExamSessionConfig> {
    Ok(toml::from_str(content)?)
}

fn resolve_config(config: &mut ExamSessionConfig) {
    config.api.base_url = resolve_env_vars(&config.api.base_url);
    config.api.token = config
        .api
        .token
        .as_deref()
        .map(resolve_env_vars)
        .filter(|t| !t.is_empty());
    config.user_id = config
        .user_id
        .as_deref()
        .map(resolve_env_vars)
        .filter(|u| !u.is_empty());
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("examsession"))
}
