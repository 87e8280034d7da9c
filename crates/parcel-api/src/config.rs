use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use parcel_core::util::is_http_url;
use thiserror::Error;
use url::Url;

const MAX_PART_SIZE_BYTES: u64 = 512 * 1024;
const MAX_SMALL_FILE_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub public_base_url: String,
    pub environment: String,
    pub signing_secret: String,
    pub signature_ttl: Duration,
    pub bind_client_ip: bool,
    pub trust_proxy_headers: bool,
    pub small_file_threshold_bytes: u64,
    pub upload_part_size_bytes: u64,
    pub backend_api_url: String,
    pub backend_bot_token: String,
    pub storage_channel: String,
    pub backend_timeout: Duration,
    pub relay: Option<RelayRuntimeConfig>,
    pub admin_api_token: String,
    pub rate_limit_window: Duration,
    pub auth_rate_limit_per_window: u32,
    pub upload_rate_limit_per_window: u32,
}

/// Relay bridge settings; all-or-nothing.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayRuntimeConfig {
    pub url: String,
    pub access_token: String,
    pub phone_number: String,
}

impl fmt::Debug for RelayRuntimeConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RelayRuntimeConfig")
            .field("url", &self.url)
            .field("access_token", &"[REDACTED]")
            .field("phone_number", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("public_base_url", &self.public_base_url)
            .field("environment", &self.environment)
            .field("signing_secret", &"[REDACTED]")
            .field("signature_ttl", &self.signature_ttl)
            .field("bind_client_ip", &self.bind_client_ip)
            .field("trust_proxy_headers", &self.trust_proxy_headers)
            .field("small_file_threshold_bytes", &self.small_file_threshold_bytes)
            .field("upload_part_size_bytes", &self.upload_part_size_bytes)
            .field("backend_api_url", &self.backend_api_url)
            .field("backend_bot_token", &"[REDACTED]")
            .field("storage_channel", &self.storage_channel)
            .field("backend_timeout", &self.backend_timeout)
            .field("relay", &self.relay)
            .field("admin_api_token", &"[REDACTED]")
            .field("rate_limit_window", &self.rate_limit_window)
            .field("auth_rate_limit_per_window", &self.auth_rate_limit_per_window)
            .field(
                "upload_rate_limit_per_window",
                &self.upload_rate_limit_per_window,
            )
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "PARCEL_BIND_ADDR", "127.0.0.1:8080");

        let default_base_url = format!("http://{bind_addr}");
        let public_base_url = trim_trailing(&value_or_default(
            &lookup,
            "PARCEL_PUBLIC_BASE_URL",
            &default_base_url,
        ))
        .to_string();
        if !is_http_url(&public_base_url) || Url::parse(&public_base_url).is_err() {
            return Err(ConfigError::Invalid(
                "PARCEL_PUBLIC_BASE_URL must be an absolute http:// or https:// URL".to_string(),
            ));
        }

        let environment =
            value_or_default(&lookup, "PARCEL_ENVIRONMENT", "development").to_ascii_lowercase();
        let is_production = environment == "production";

        let signing_secret = required_trimmed(&lookup, "DOWNLOAD_SIGNING_SECRET")?;
        if signing_secret.len() < 32 {
            return Err(ConfigError::Invalid(
                "DOWNLOAD_SIGNING_SECRET must be at least 32 characters".to_string(),
            ));
        }

        let signature_ttl_secs = value_or_default(&lookup, "DOWNLOAD_SIGNATURE_TTL_SECS", "900")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DOWNLOAD_SIGNATURE_TTL_SECS must be an integer in [60, 86400]".to_string(),
                )
            })?;
        if !(60..=86_400).contains(&signature_ttl_secs) {
            return Err(ConfigError::Invalid(
                "DOWNLOAD_SIGNATURE_TTL_SECS must be in [60, 86400]".to_string(),
            ));
        }

        let bind_client_ip = optional_trimmed(&lookup, "DOWNLOAD_BIND_CLIENT_IP")
            .map(|value| parse_flag("DOWNLOAD_BIND_CLIENT_IP", &value))
            .transpose()?
            .unwrap_or(is_production);
        let trust_proxy_headers = parse_flag(
            "TRUST_PROXY_HEADERS",
            &value_or_default(&lookup, "TRUST_PROXY_HEADERS", "false"),
        )?;

        let small_file_threshold_bytes =
            value_or_default(&lookup, "SMALL_FILE_THRESHOLD_BYTES", "20971520")
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SMALL_FILE_THRESHOLD_BYTES must be an integer in [1, 52428800]".to_string(),
                    )
                })?;
        if !(1..=MAX_SMALL_FILE_THRESHOLD_BYTES).contains(&small_file_threshold_bytes) {
            return Err(ConfigError::Invalid(
                "SMALL_FILE_THRESHOLD_BYTES must be in [1, 52428800]".to_string(),
            ));
        }

        let upload_part_size_bytes = value_or_default(&lookup, "UPLOAD_PART_SIZE_BYTES", "524288")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid("UPLOAD_PART_SIZE_BYTES must be an integer".to_string())
            })?;
        if upload_part_size_bytes == 0
            || upload_part_size_bytes % 1024 != 0
            || MAX_PART_SIZE_BYTES % upload_part_size_bytes != 0
        {
            return Err(ConfigError::Invalid(
                "UPLOAD_PART_SIZE_BYTES must be a multiple of 1024 that divides 524288".to_string(),
            ));
        }

        let backend_api_url = trim_trailing(&value_or_default(
            &lookup,
            "BACKEND_API_URL",
            "https://api.telegram.org",
        ))
        .to_string();
        if !is_http_url(&backend_api_url) {
            return Err(ConfigError::Invalid(
                "BACKEND_API_URL must start with http:// or https://".to_string(),
            ));
        }
        let backend_bot_token = required_trimmed(&lookup, "BACKEND_BOT_TOKEN")?;
        let storage_channel = required_trimmed(&lookup, "BACKEND_STORAGE_CHANNEL")?;

        let backend_timeout_secs = value_or_default(&lookup, "BACKEND_TIMEOUT_SECS", "30")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid("BACKEND_TIMEOUT_SECS must be an integer in [1, 600]".to_string())
            })?;
        if !(1..=600).contains(&backend_timeout_secs) {
            return Err(ConfigError::Invalid(
                "BACKEND_TIMEOUT_SECS must be in [1, 600]".to_string(),
            ));
        }

        let relay = parse_relay_config(&lookup)?;

        let admin_api_token = required_trimmed(&lookup, "ADMIN_API_TOKEN")?;
        if admin_api_token.len() < 16 {
            return Err(ConfigError::Invalid(
                "ADMIN_API_TOKEN must be at least 16 characters".to_string(),
            ));
        }

        let rate_limit_window_secs = value_or_default(&lookup, "RATE_LIMIT_WINDOW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "RATE_LIMIT_WINDOW_SECS must be an integer in [10, 3600]".to_string(),
                )
            })?;
        if !(10..=3_600).contains(&rate_limit_window_secs) {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_WINDOW_SECS must be in [10, 3600]".to_string(),
            ));
        }

        let auth_rate_limit_per_window = value_or_default(&lookup, "AUTH_RATE_LIMIT_PER_WINDOW", "10")
            .parse::<u32>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "AUTH_RATE_LIMIT_PER_WINDOW must be an integer in [1, 1000]".to_string(),
                )
            })?;
        if !(1..=1_000).contains(&auth_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "AUTH_RATE_LIMIT_PER_WINDOW must be in [1, 1000]".to_string(),
            ));
        }

        let upload_rate_limit_per_window =
            value_or_default(&lookup, "UPLOAD_RATE_LIMIT_PER_WINDOW", "30")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "UPLOAD_RATE_LIMIT_PER_WINDOW must be an integer in [1, 5000]".to_string(),
                    )
                })?;
        if !(1..=5_000).contains(&upload_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "UPLOAD_RATE_LIMIT_PER_WINDOW must be in [1, 5000]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            public_base_url,
            environment,
            signing_secret,
            signature_ttl: Duration::from_secs(signature_ttl_secs),
            bind_client_ip,
            trust_proxy_headers,
            small_file_threshold_bytes,
            upload_part_size_bytes,
            backend_api_url,
            backend_bot_token,
            storage_channel,
            backend_timeout: Duration::from_secs(backend_timeout_secs),
            relay,
            admin_api_token,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            auth_rate_limit_per_window,
            upload_rate_limit_per_window,
        })
    }
}

fn parse_relay_config(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<RelayRuntimeConfig>, ConfigError> {
    let url = optional_trimmed(&lookup, "BACKEND_RELAY_URL");
    let access_token = optional_trimmed(&lookup, "BACKEND_RELAY_TOKEN");
    if url.is_none() && access_token.is_none() {
        return Ok(None);
    }

    let url = url.ok_or(ConfigError::MissingVar("BACKEND_RELAY_URL"))?;
    let access_token = access_token.ok_or(ConfigError::MissingVar("BACKEND_RELAY_TOKEN"))?;
    let phone_number = required_trimmed(&lookup, "BACKEND_PHONE_NUMBER")?;
    if !is_http_url(&url) {
        return Err(ConfigError::Invalid(
            "BACKEND_RELAY_URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(Some(RelayRuntimeConfig {
        url: trim_trailing(&url).to_string(),
        access_token,
        phone_number,
    }))
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name} must be true or false"))),
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}

#[cfg(test)]
pub(crate) fn test_lookup(overrides: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let mut map: HashMap<String, String> = [
        ("DOWNLOAD_SIGNING_SECRET", "0123456789abcdef0123456789abcdef"),
        ("BACKEND_BOT_TOKEN", "123456:sensitive-bot-token"),
        ("BACKEND_STORAGE_CHANNEL", "-1001234567890"),
        ("ADMIN_API_TOKEN", "operator-token-0123456789"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect();
    for (key, value) in overrides {
        map.insert((*key).to_string(), (*value).to_string());
    }
    move |key: &str| map.get(key).cloned()
}
