//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Builder-style overrides
//! - JSON file loading
//! - `ARENA_RELAY_*` environment overrides
//! - Endpoint templates and timing knobs

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::session::endpoints::ApiVersionSetting;

pub const ENV_PREFIX: &str = "ARENA_RELAY_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Upstream path templates. `{prefix}` expands to the detected API prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointTemplates {
    pub sign_up: String,
    pub stream: String,
    pub file_sign: String,
    pub file_notify: String,
    /// Second step of the credential exchange, served by the main origin.
    pub verify: String,
    /// Path requested under each prefix when auto-detecting the version.
    pub probe: String,
    /// `Next-Action` identifiers sent with the upload RPC calls.
    pub file_sign_action: Option<String>,
    pub file_notify_action: Option<String>,
}

impl Default for EndpointTemplates {
    fn default() -> Self {
        Self {
            sign_up: "{prefix}/sign-up".into(),
            stream: "{prefix}/stream/create-evaluation".into(),
            file_sign: "{prefix}/upload/sign".into(),
            file_notify: "{prefix}/upload/notify".into(),
            verify: "/".into(),
            probe: "{prefix}/sign-up".into(),
            file_sign_action: None,
            file_notify_action: None,
        }
    }
}

/// Full relay configuration; every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub controller_url: String,
    pub upstream_origin: Url,
    pub api_version: ApiVersionSetting,
    pub endpoints: EndpointTemplates,
    pub auth_cookie_name: String,
    pub provisional_cookie_name: String,
    pub turnstile_site_key: Option<String>,
    pub turnstile_action: Option<String>,
    pub captcha_api_key: Option<String>,
    pub state_path: PathBuf,

    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    #[serde(with = "duration_ms")]
    pub credential_safety_margin: Duration,
    #[serde(with = "duration_ms")]
    pub token_wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub token_poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub challenge_wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub challenge_poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub recovery_grace: Duration,
    #[serde(with = "duration_ms")]
    pub auth_wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub replay_delay: Duration,
    #[serde(with = "duration_ms")]
    pub widget_interaction_delay: Duration,
    #[serde(with = "duration_ms")]
    pub widget_recreate_delay: Duration,

    pub user_agent: String,
    pub extra_headers: Vec<(String, String)>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            controller_url: "ws://127.0.0.1:9080/ws".into(),
            upstream_origin: Url::parse("https://lmarena.ai/").expect("static origin is valid"),
            api_version: ApiVersionSetting::Auto,
            endpoints: EndpointTemplates::default(),
            auth_cookie_name: "arena-auth-prod-v1".into(),
            provisional_cookie_name: "provisional_user_id".into(),
            turnstile_site_key: None,
            turnstile_action: None,
            captcha_api_key: None,
            state_path: PathBuf::from("relay-state.redb"),
            reconnect_delay: Duration::from_secs(5),
            credential_safety_margin: Duration::from_secs(300),
            token_wait_timeout: Duration::from_secs(60),
            token_poll_interval: Duration::from_secs(1),
            challenge_wait_timeout: Duration::from_secs(45),
            challenge_poll_interval: Duration::from_secs(1),
            recovery_grace: Duration::from_secs(2),
            auth_wait_timeout: Duration::from_secs(60),
            replay_delay: Duration::from_secs(1),
            widget_interaction_delay: Duration::from_millis(1500),
            widget_recreate_delay: Duration::from_secs(2),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36".into(),
            extra_headers: vec![
                ("Accept".into(), "*/*".into()),
                ("Accept-Language".into(), "en-US,en;q=0.9".into()),
                ("Sec-Fetch-Site".into(), "same-origin".into()),
                ("Sec-Fetch-Mode".into(), "cors".into()),
                ("Sec-Fetch-Dest".into(), "empty".into()),
            ],
        }
    }
}

impl RelayConfig {
    /// Loads a JSON config file; absent fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(std::env::vars())
    }

    /// Applies `ARENA_RELAY_*` overrides from `vars`.
    pub fn apply_vars<I>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "CONTROLLER_URL" => self.controller_url = value,
                "UPSTREAM_ORIGIN" => {
                    self.upstream_origin = Url::parse(&value).map_err(|err| ConfigError::Invalid {
                        field: "upstream_origin",
                        message: err.to_string(),
                    })?;
                }
                "API_VERSION" => {
                    self.api_version = value.parse().map_err(|message| ConfigError::Invalid {
                        field: "api_version",
                        message,
                    })?;
                }
                "SITE_KEY" => self.turnstile_site_key = Some(value),
                "CAPTCHA_API_KEY" => self.captcha_api_key = Some(value),
                "STATE_PATH" => self.state_path = PathBuf::from(value),
                "USER_AGENT" => self.user_agent = value,
                "RECONNECT_DELAY_MS" => {
                    self.reconnect_delay = parse_millis("reconnect_delay", &value)?;
                }
                _ => log::debug!("ignoring unknown environment override {key}"),
            }
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.upstream_origin.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "upstream_origin",
                message: format!("unsupported scheme {}", self.upstream_origin.scheme()),
            });
        }
        if self.upstream_origin.host_str().is_none() {
            return Err(ConfigError::Invalid {
                field: "upstream_origin",
                message: "missing host".into(),
            });
        }
        if !(self.controller_url.starts_with("ws://") || self.controller_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                field: "controller_url",
                message: "expected a ws:// or wss:// URL".into(),
            });
        }
        if self.auth_cookie_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth_cookie_name",
                message: "must not be empty".into(),
            });
        }
        for (field, value) in [
            ("token_poll_interval", self.token_poll_interval),
            ("challenge_poll_interval", self.challenge_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    /// Header set sent with every upstream request.
    pub fn default_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("User-Agent".to_string(), self.user_agent.clone())];
        headers.extend(self.extra_headers.iter().cloned());
        headers
    }
}

fn parse_millis(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|err| ConfigError::Invalid {
            field,
            message: err.to_string(),
        })
}

/// Serialises durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
