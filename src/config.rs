//! Configuration module for the Hub 2 collector.
//!
//! Settings come from an INI file with a `[hub2]` section (SwitchBot
//! credentials, device list, scheduling) and an optional `[zabbix]` section
//! (push target). The file is read once at startup; the resulting [`Config`]
//! is never mutated afterwards.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexSet;
use ini::Ini;
use secrecy::SecretString;
use thiserror::Error;

/// Environment variable that overrides the configuration file location.
pub const CONFIG_PATH_ENV: &str = "SB_HUB2_LOG_CONFIG";

/// Configuration file used when `SB_HUB2_LOG_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "sb_hub2_log.ini";

/// Default number of status fetch attempts per device per cycle
const DEFAULT_RETRY: u64 = 3;

/// Default collection interval in seconds
const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Default SwitchBot Open API base URL
const DEFAULT_API_URL: &str = "https://api.switch-bot.com";

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default Zabbix trapper port
const DEFAULT_ZABBIX_PORT: u16 = 10051;

/// Default prefix prepended to every item key
const DEFAULT_KEY_PREFIX: &str = "sb";

/// Default push executable
const DEFAULT_SENDER: &str = "zabbix_sender";

const HUB2: &str = "hub2";
const ZABBIX: &str = "zabbix";

/// Complete collector configuration.
#[derive(Debug)]
pub struct Config {
    /// SwitchBot API and polling settings
    pub hub2: Hub2Config,

    /// Push target; `None` disables pushing entirely
    pub zabbix: Option<ZabbixConfig>,

    /// Prefix for every recorded item key (`{prefix}.{key}`)
    pub key_prefix: String,
}

/// Settings from the `[hub2]` section.
#[derive(Debug)]
pub struct Hub2Config {
    /// Open API token
    pub token: SecretString,

    /// Open API secret used for request signing
    pub secret: SecretString,

    /// Device identifiers to poll, in configured order, without duplicates
    pub device_ids: Vec<String>,

    /// Status fetch attempts per device per cycle
    pub retry: u32,

    /// Collection interval
    pub interval: Duration,

    /// Base URL of the Open API
    pub api_url: String,

    /// HTTP request timeout
    pub request_timeout: Duration,
}

/// Settings from the `[zabbix]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZabbixConfig {
    /// Zabbix server or proxy hostname
    pub server: String,

    /// Trapper port
    pub port: u16,

    /// Host name the items belong to on the Zabbix side
    pub host: String,

    /// Push executable, invoked with `-z -p -s -i`
    pub sender: String,
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] ini::ParseError),

    #[error("[{section}] {key} is required")]
    Missing {
        section: &'static str,
        key: &'static str,
    },

    #[error("[{section}] {key}: '{value}' {reason}")]
    Invalid {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl Config {
    /// Configuration file location, honoring `SB_HUB2_LOG_CONFIG`.
    pub fn path_from_env() -> PathBuf {
        env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from an INI file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, if a
    /// required key is missing, or if a numeric value is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini_str(&text)
    }

    /// Parse configuration from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str_noescape(text)?;

        let token = required(&ini, HUB2, "token")?;
        let secret = required(&ini, HUB2, "secret")?;
        let device_ids = parse_device_ids(required(&ini, HUB2, "device_ids")?);

        let retry = parse_positive(&ini, HUB2, "retry", DEFAULT_RETRY)?;
        let retry = u32::try_from(retry)
            .map_err(|_| invalid(HUB2, "retry", retry, "is too large"))?;
        let interval = parse_positive(&ini, HUB2, "interval", DEFAULT_INTERVAL_SECS)?;
        let request_timeout =
            parse_positive(&ini, HUB2, "request_timeout", DEFAULT_REQUEST_TIMEOUT_SECS)?;
        let api_url = optional(&ini, HUB2, "api_url")
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();

        let key_prefix = optional(&ini, ZABBIX, "key_prefix")
            .unwrap_or(DEFAULT_KEY_PREFIX)
            .to_string();

        Ok(Self {
            hub2: Hub2Config {
                token: SecretString::from(token.to_string()),
                secret: SecretString::from(secret.to_string()),
                device_ids,
                retry,
                interval: Duration::from_secs(interval),
                api_url,
                request_timeout: Duration::from_secs(request_timeout),
            },
            zabbix: parse_zabbix(&ini)?,
            key_prefix,
        })
    }
}

fn parse_zabbix(ini: &Ini) -> Result<Option<ZabbixConfig>, ConfigError> {
    let Some(server) = optional(ini, ZABBIX, "server") else {
        return Ok(None);
    };

    let port = match optional(ini, ZABBIX, "port") {
        Some(value) => value
            .parse::<u16>()
            .map_err(|_| invalid(ZABBIX, "port", value, "is not a valid port"))?,
        None => DEFAULT_ZABBIX_PORT,
    };
    let host = optional(ini, ZABBIX, "host").ok_or(ConfigError::Missing {
        section: ZABBIX,
        key: "host",
    })?;
    let sender = optional(ini, ZABBIX, "sender").unwrap_or(DEFAULT_SENDER);

    Ok(Some(ZabbixConfig {
        server: server.to_string(),
        port,
        host: host.to_string(),
        sender: sender.to_string(),
    }))
}

/// Split the comma-separated device list, keeping first occurrences only.
fn parse_device_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect::<IndexSet<_>>()
        .into_iter()
        .collect()
}

fn optional<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section))
        .and_then(|props| props.get(key))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn required<'a>(
    ini: &'a Ini,
    section: &'static str,
    key: &'static str,
) -> Result<&'a str, ConfigError> {
    optional(ini, section, key).ok_or(ConfigError::Missing { section, key })
}

fn parse_positive(
    ini: &Ini,
    section: &'static str,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value) = optional(ini, section, key) else {
        return Ok(default);
    };
    let parsed: u64 = value
        .parse()
        .map_err(|_| invalid(section, key, value, "is not a valid number"))?;
    if parsed == 0 {
        return Err(invalid(section, key, value, "must be greater than 0"));
    }
    Ok(parsed)
}

fn invalid(
    section: &'static str,
    key: &'static str,
    value: impl ToString,
    reason: &'static str,
) -> ConfigError {
    ConfigError::Invalid {
        section,
        key,
        value: value.to_string(),
        reason,
    }
}
