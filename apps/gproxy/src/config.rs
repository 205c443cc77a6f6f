use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use gproxy_core::{CoreOptions, UpstreamBases};
use gproxy_core::classify::{DEFAULT_GEMINI_BASE_URL, DEFAULT_OPENAI_BASE_URL};
use gproxy_core::core::DEFAULT_MAX_BODY_BYTES;
use gproxy_provider_core::Sanitizer;
use gproxy_provider_core::sanitize::DEFAULT_MAX_STRING_LEN;
use gproxy_provider_impl::{
    ClientOptions, DispatchOptions, DispatchPlan, SelectionPreferences, TelemetryConfig,
};

use crate::cli::{Cli, LogFormat};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub dispatch: DispatchConfig,
    pub telemetry: TelemetrySection,
    pub auth: AuthConfig,
    pub credentials: Vec<CredentialSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dsn: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            dsn: "sqlite://gproxy.db?mode=rwc".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    pub gemini_base_url: String,
    pub openai_base_url: String,
    pub proxy: Option<String>,
    pub connect_timeout_secs: u64,
    /// Unset means no whole-request timeout, so long streams are not cut.
    pub request_timeout_secs: Option<u64>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            proxy: None,
            connect_timeout_secs: 10,
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub max_retries: i32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,
    pub retry_on_zero_completion_tokens: bool,
    pub retry_validation_errors: bool,
    pub prioritize_newer: bool,
    pub prioritize_least_errors: bool,
    pub prioritize_least_recently_used: bool,
    pub candidate_limit: Option<usize>,
    pub max_capture_bytes: usize,
    pub max_error_body_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let plan = DispatchPlan::default();
        let options = DispatchOptions::default();
        Self {
            max_retries: plan.max_retries,
            retry_delay_ms: 0,
            retry_backoff: plan.retry_backoff,
            retry_on_zero_completion_tokens: plan.retry_on_zero_completion_tokens,
            retry_validation_errors: options.retry_validation_errors,
            prioritize_newer: false,
            prioritize_least_errors: false,
            prioritize_least_recently_used: false,
            candidate_limit: None,
            max_capture_bytes: options.max_capture_bytes,
            max_error_body_bytes: options.max_error_body_bytes,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub flush_interval_ms: u64,
    pub max_batch: usize,
    pub queue_capacity: usize,
    pub flush_on_complete: bool,
    pub max_string_len: usize,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
            max_batch: 50,
            queue_capacity: 4096,
            flush_on_complete: false,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub keys: Vec<ProxyKeySeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyKeySeed {
    pub key: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialSeed {
    pub secret: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub owner_id: Option<i64>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File (if any), then CLI flags on top, then validation.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match cli.config.as_deref() {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(dsn) = &cli.dsn {
            self.server.dsn = dsn.clone();
        }
        if let Some(format) = cli.log_format {
            self.server.log_format = format;
        }
        if let Some(proxy) = &cli.proxy {
            self.upstream.proxy = Some(proxy.clone());
        }
        for secret in cli.credentials.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            self.credentials.push(CredentialSeed {
                secret: secret.to_string(),
                label: None,
                owner_id: None,
            });
        }
        for key in cli.proxy_keys.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
            self.auth.keys.push(ProxyKeySeed {
                key: key.to_string(),
                user_id: None,
                label: None,
            });
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.gemini_base_url.trim().is_empty()
            || self.upstream.openai_base_url.trim().is_empty()
        {
            return Err(ConfigError::Invalid("upstream base urls must not be empty".to_string()));
        }
        if self.telemetry.max_batch == 0 || self.telemetry.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.max_batch and telemetry.queue_capacity must be positive".to_string(),
            ));
        }
        if self.telemetry.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.flush_interval_ms must be positive".to_string(),
            ));
        }
        if !(self.dispatch.retry_backoff.is_finite() && self.dispatch.retry_backoff > 0.0) {
            return Err(ConfigError::Invalid(
                "dispatch.retry_backoff must be a positive number".to_string(),
            ));
        }
        if self.credentials.iter().any(|seed| seed.secret.trim().is_empty()) {
            return Err(ConfigError::Invalid("credential secrets must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            proxy: self.upstream.proxy.clone(),
            connect_timeout: Duration::from_secs(self.upstream.connect_timeout_secs),
            request_timeout: self.upstream.request_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_capture_bytes: self.dispatch.max_capture_bytes,
            max_error_body_bytes: self.dispatch.max_error_body_bytes,
            retry_validation_errors: self.dispatch.retry_validation_errors,
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            flush_interval: Duration::from_millis(self.telemetry.flush_interval_ms),
            max_batch: self.telemetry.max_batch,
            queue_capacity: self.telemetry.queue_capacity,
            sanitizer: Sanitizer::new(self.telemetry.max_string_len),
            flush_on_complete: self.telemetry.flush_on_complete,
        }
    }

    pub fn core_options(&self) -> CoreOptions {
        CoreOptions {
            upstream: UpstreamBases {
                gemini: self.upstream.gemini_base_url.clone(),
                openai: self.upstream.openai_base_url.clone(),
            },
            plan: DispatchPlan {
                max_retries: self.dispatch.max_retries,
                retry_delay: Duration::from_millis(self.dispatch.retry_delay_ms),
                retry_backoff: self.dispatch.retry_backoff,
                retry_on_zero_completion_tokens: self.dispatch.retry_on_zero_completion_tokens,
            },
            preferences: SelectionPreferences {
                prioritize_newer: self.dispatch.prioritize_newer,
                prioritize_least_errors: self.dispatch.prioritize_least_errors,
                prioritize_least_recently_used: self.dispatch.prioritize_least_recently_used,
            },
            candidate_limit: self.dispatch.candidate_limit.filter(|limit| *limit > 0),
            max_body_bytes: self.dispatch.max_body_bytes,
        }
    }
}
