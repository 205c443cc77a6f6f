use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Flags win over the configuration file; the file wins over built-in defaults.
#[derive(Debug, Default, Parser)]
#[command(
    name = "gproxy",
    version,
    about = "Credential-pooling gateway for Gemini and OpenAI-compatible APIs"
)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "GPROXY_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "GPROXY_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "GPROXY_PORT")]
    pub port: Option<u16>,
    /// Database URL, e.g. `sqlite://gproxy.db?mode=rwc` or `postgres://...`.
    #[arg(long, env = "GPROXY_DSN")]
    pub dsn: Option<String>,
    /// Outbound proxy for upstream calls.
    #[arg(long, env = "GPROXY_PROXY")]
    pub proxy: Option<String>,
    #[arg(long, env = "GPROXY_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
    /// Upstream secrets added to the pool at startup.
    #[arg(long = "credential", env = "GPROXY_CREDENTIALS", value_delimiter = ',')]
    pub credentials: Vec<String>,
    /// Proxy keys accepted from callers, added at startup.
    #[arg(long = "proxy-key", env = "GPROXY_PROXY_KEYS", value_delimiter = ',')]
    pub proxy_keys: Vec<String>,
}
