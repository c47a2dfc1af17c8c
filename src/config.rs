//! Server configuration read from `NTL_*` environment variables.
//!
//! `.env` files are honoured through `dotenvy` by the binaries before
//! [`Config::from_env`] is called.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "ntl-development-secret";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Fixed-interval, fixed-budget status polling.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Upper bound on how long a deployment can stay in flight.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_url: String,
    pub token: String,
    /// Upper bound on a single provider request, connect to last byte.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
    pub base_domain: String,
    pub poll: PollPolicy,
    pub max_upload_bytes: usize,
    /// Budget for the extracted contents of one deploy upload.
    pub max_unpacked_bytes: u64,
    pub provider: Option<ProviderConfig>,
    pub log_format: LogFormat,
    pub log_dir: Option<PathBuf>,
    /// Problems worth reporting once logging is up; see [`Config::log_warnings`].
    pub warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            data_dir: PathBuf::from("ntl_data"),
            upload_dir: PathBuf::from("uploads"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            token_ttl_secs: 7 * 24 * 3600,
            base_domain: "ntl.cloud".to_string(),
            poll: PollPolicy::default(),
            max_upload_bytes: 100 * 1024 * 1024,
            max_unpacked_bytes: 512 * 1024 * 1024,
            provider: None,
            log_format: LogFormat::Pretty,
            log_dir: None,
            warnings: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut warnings = Vec::new();

        let jwt_secret = match get("NTL_JWT_SECRET") {
            Some(secret) => secret,
            None => {
                warnings.push("NTL_JWT_SECRET not set, using the development secret".to_string());
                defaults.jwt_secret
            }
        };

        let poll = PollPolicy {
            interval: Duration::from_secs(parse_or(
                &get,
                "NTL_POLL_INTERVAL_SECS",
                defaults.poll.interval.as_secs(),
            )?),
            max_attempts: parse_or(&get, "NTL_POLL_MAX_ATTEMPTS", defaults.poll.max_attempts)?,
        };
        if poll.max_attempts == 0 {
            return Err(ConfigError::Zero("NTL_POLL_MAX_ATTEMPTS"));
        }

        let provider = match (get("NTL_PROVIDER_API_URL"), get("NTL_PROVIDER_TOKEN")) {
            (Some(api_url), Some(token)) => {
                let timeout_secs: u64 = parse_or(&get, "NTL_PROVIDER_TIMEOUT_SECS", 30)?;
                if timeout_secs == 0 {
                    return Err(ConfigError::Zero("NTL_PROVIDER_TIMEOUT_SECS"));
                }
                Some(ProviderConfig {
                    api_url: api_url.trim_end_matches('/').to_string(),
                    token,
                    timeout: Duration::from_secs(timeout_secs),
                })
            }
            (Some(_), None) => {
                warnings.push(
                    "NTL_PROVIDER_API_URL set without NTL_PROVIDER_TOKEN, using local provider".to_string(),
                );
                None
            }
            _ => None,
        };

        let log_format = match get("NTL_LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "NTL_LOG_FORMAT",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            bind_addr: parse_or(&get, "NTL_BIND_ADDR", defaults.bind_addr)?,
            data_dir: get("NTL_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            upload_dir: get("NTL_UPLOAD_DIR").map_or(defaults.upload_dir, PathBuf::from),
            jwt_secret,
            token_ttl_secs: parse_or(&get, "NTL_TOKEN_TTL_SECS", defaults.token_ttl_secs)?,
            base_domain: get("NTL_BASE_DOMAIN")
                .map_or(defaults.base_domain, |d| d.trim().to_lowercase()),
            poll,
            max_upload_bytes: parse_or(&get, "NTL_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            max_unpacked_bytes: parse_or(&get, "NTL_MAX_UNPACKED_BYTES", defaults.max_unpacked_bytes)?,
            provider,
            log_format,
            log_dir: get("NTL_LOG_DIR").map(PathBuf::from),
            warnings,
        })
    }

    /// Emit the warnings collected while reading the environment. Call after
    /// the subscriber is installed, otherwise they go nowhere.
    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.poll.max_attempts, 60);
        assert_eq!(config.poll.budget(), Duration::from_secs(300));
        assert!(config.provider.is_none());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("NTL_BIND_ADDR", "127.0.0.1:8080"),
            ("NTL_POLL_INTERVAL_SECS", "2"),
            ("NTL_POLL_MAX_ATTEMPTS", "3"),
            ("NTL_PROVIDER_API_URL", "https://api.host.example/v1/"),
            ("NTL_PROVIDER_TOKEN", "tok"),
            ("NTL_LOG_FORMAT", "json"),
            ("NTL_BASE_DOMAIN", "Sites.Example"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.poll.budget(), Duration::from_secs(6));
        let provider = config.provider.unwrap();
        assert_eq!(provider.api_url, "https://api.host.example/v1");
        assert_eq!(provider.timeout, Duration::from_secs(30));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.base_domain, "sites.example");
    }

    #[test]
    fn fallbacks_are_collected_as_warnings() {
        let config = config_from(&[("NTL_PROVIDER_API_URL", "https://api.host.example")]).unwrap();
        assert!(config.provider.is_none());
        assert_eq!(config.warnings.len(), 2);
        assert!(config.warnings[0].contains("NTL_JWT_SECRET"));
        assert!(config.warnings[1].contains("NTL_PROVIDER_TOKEN"));

        let config = config_from(&[("NTL_JWT_SECRET", "s3cret")]).unwrap();
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn provider_timeout_is_configurable() {
        let config = config_from(&[
            ("NTL_PROVIDER_API_URL", "https://api.host.example"),
            ("NTL_PROVIDER_TOKEN", "tok"),
            ("NTL_PROVIDER_TIMEOUT_SECS", "4"),
        ])
        .unwrap();
        assert_eq!(config.provider.unwrap().timeout, Duration::from_secs(4));

        let err = config_from(&[
            ("NTL_PROVIDER_API_URL", "https://api.host.example"),
            ("NTL_PROVIDER_TOKEN", "tok"),
            ("NTL_PROVIDER_TIMEOUT_SECS", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Zero("NTL_PROVIDER_TIMEOUT_SECS")));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = config_from(&[("NTL_POLL_INTERVAL_SECS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "NTL_POLL_INTERVAL_SECS", .. }));
        let err = config_from(&[("NTL_POLL_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Zero(_)));
    }
}
