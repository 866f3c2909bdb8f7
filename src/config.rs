use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::AdditionalField;

pub const DEFAULT_API: &str = "https://fofa.info";
pub const DEFAULT_PAGE_SIZE: u64 = 1000;
pub const DEFAULT_MAX_RECORDS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: invalid value for {key}: {value}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Http,
    Socks5,
}

/// Outbound proxy for API requests. Only used when `enabled` and both host
/// and port are set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub kind: ProxyKind,
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
}

impl ProxyConfig {
    pub fn url(&self) -> Option<String> {
        if !self.enabled || self.host.is_empty() || self.port.is_empty() {
            return None;
        }
        let scheme = match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        };
        let auth = if !self.user.is_empty() && !self.password.is_empty() {
            format!("{}:{}@", self.user, self.password)
        } else {
            String::new()
        };
        Some(format!("{scheme}://{auth}{}:{}", self.host, self.port))
    }
}

/// Search settings for one query. Passed by value into every component that
/// needs it; there is no process-wide instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FofaConfig {
    pub api: String,
    #[serde(skip_serializing)]
    pub key: String,
    /// Rows requested per page.
    pub page_size: u64,
    /// Stop paginating once this many distinct records are held.
    pub max_records: u64,
    pub additional_fields: Vec<AdditionalField>,
    pub proxy: ProxyConfig,
}

impl Default for FofaConfig {
    fn default() -> Self {
        Self {
            api: DEFAULT_API.to_string(),
            key: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
            additional_fields: Vec::new(),
            proxy: ProxyConfig::default(),
        }
    }
}

/// Parse `key=value` properties content on top of the defaults.
///
/// - `#` starts a comment line; blank lines are ignored
/// - keys accept both `snake_case` and `camelCase` spellings
/// - `on` (any case) enables a switch, anything else disables it
/// - unknown keys are ignored
pub fn parse_properties_str(s: &str) -> Result<FofaConfig, ConfigError> {
    let mut cfg = FofaConfig::default();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        let invalid = || ConfigError::InvalidValue {
            line: line_no,
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "api" => cfg.api = value.trim_end_matches('/').to_string(),
            "key" => cfg.key = value.to_string(),
            "max_size" | "maxSize" => {
                cfg.page_size = value.parse::<u64>().ok().filter(|n| *n > 0).ok_or_else(invalid)?
            }
            "max_records" | "maxRecords" => {
                cfg.max_records = value.parse::<u64>().map_err(|_| invalid())?
            }
            "fields" => {
                cfg.additional_fields = value
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(|f| f.parse::<AdditionalField>().map_err(|_| invalid()))
                    .collect::<Result<_, _>>()?
            }
            "proxy_status" | "proxyStatus" => cfg.proxy.enabled = value.eq_ignore_ascii_case("on"),
            "proxy_type" | "proxyType" => {
                cfg.proxy.kind = match value.to_ascii_uppercase().as_str() {
                    "HTTP" => ProxyKind::Http,
                    "SOCKS5" => ProxyKind::Socks5,
                    _ => return Err(invalid()),
                }
            }
            "proxy_ip" | "proxyIp" => cfg.proxy.host = value.to_string(),
            "proxy_port" | "proxyPort" => cfg.proxy.port = value.to_string(),
            "proxy_user" | "proxyUser" => cfg.proxy.user = value.to_string(),
            "proxy_password" | "proxyPassword" => cfg.proxy.password = value.to_string(),
            _ => {}
        }
    }

    Ok(cfg)
}

/// Load settings from a properties file.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<FofaConfig, ConfigError> {
    let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
        path: path.as_ref().to_path_buf(),
        source,
    })?;
    parse_properties_str(&content)
}

/// Load settings from a file, or fall back to defaults when it does not exist.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<FofaConfig, ConfigError> {
    if !path.as_ref().exists() {
        return Ok(FofaConfig::default());
    }
    load_config_from_path(path)
}
