//! Versioned upstream endpoints.
//!
//! The upstream serves its internal API under two coexisting prefixes. The
//! prefix is either pinned by configuration or detected once by probing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::OnceCell;
use url::Url;

use crate::challenges::core::{UpstreamClientError, UpstreamHttpClient, UpstreamRequest};
use crate::config::EndpointTemplates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    Api,
    NextjsApi,
}

impl ApiVersion {
    /// Probing order used by auto-detection.
    pub const PROBE_ORDER: [ApiVersion; 2] = [ApiVersion::NextjsApi, ApiVersion::Api];

    pub fn prefix(self) -> &'static str {
        match self {
            ApiVersion::Api => "/api",
            ApiVersion::NextjsApi => "/nextjs-api",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApiVersion::Api => "api",
            ApiVersion::NextjsApi => "nextjs-api",
        }
    }
}

/// Configured version policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiVersionSetting {
    #[default]
    Auto,
    Pinned(ApiVersion),
}

impl FromStr for ApiVersionSetting {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(ApiVersionSetting::Auto),
            "api" => Ok(ApiVersionSetting::Pinned(ApiVersion::Api)),
            "nextjs-api" | "nextjs" => Ok(ApiVersionSetting::Pinned(ApiVersion::NextjsApi)),
            other => Err(format!("unknown api version {other:?} (expected auto, api or nextjs-api)")),
        }
    }
}

impl fmt::Display for ApiVersionSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiVersionSetting::Auto => f.write_str("auto"),
            ApiVersionSetting::Pinned(version) => f.write_str(version.as_str()),
        }
    }
}

impl Serialize for ApiVersionSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ApiVersionSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    SignUp,
    Stream,
    FileSign,
    FileNotify,
    Verify,
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint path {path}: {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: url::ParseError,
    },
}

/// Resolves endpoint URLs against the upstream origin.
pub struct Endpoints {
    origin: Url,
    templates: EndpointTemplates,
    setting: ApiVersionSetting,
    client: Arc<dyn UpstreamHttpClient>,
    detected: OnceCell<ApiVersion>,
}

impl fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoints")
            .field("origin", &self.origin.as_str())
            .field("setting", &self.setting)
            .field("detected", &self.detected.get())
            .finish()
    }
}

impl Endpoints {
    pub fn new(
        origin: Url,
        templates: EndpointTemplates,
        setting: ApiVersionSetting,
        client: Arc<dyn UpstreamHttpClient>,
    ) -> Self {
        Self {
            origin,
            templates,
            setting,
            client,
            detected: OnceCell::new(),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn templates(&self) -> &EndpointTemplates {
        &self.templates
    }

    /// Active API version. Auto-detection runs on first use and is cached
    /// once a prefix answered; when none did, the first candidate is used
    /// and detection is retried next time.
    pub async fn version(&self) -> ApiVersion {
        if let ApiVersionSetting::Pinned(version) = self.setting {
            return version;
        }

        match self.detected.get_or_try_init(|| self.probe()).await {
            Ok(version) => *version,
            Err(err) => {
                log::warn!(
                    "api version detection failed ({err}); assuming {}",
                    ApiVersion::PROBE_ORDER[0].as_str()
                );
                ApiVersion::PROBE_ORDER[0]
            }
        }
    }

    pub async fn url(&self, kind: EndpointKind) -> Result<Url, EndpointError> {
        let template = match kind {
            EndpointKind::SignUp => &self.templates.sign_up,
            EndpointKind::Stream => &self.templates.stream,
            EndpointKind::FileSign => &self.templates.file_sign,
            EndpointKind::FileNotify => &self.templates.file_notify,
            EndpointKind::Verify => &self.templates.verify,
        };
        let path = if template.contains("{prefix}") {
            template.replace("{prefix}", self.version().await.prefix())
        } else {
            template.clone()
        };
        self.origin
            .join(&path)
            .map_err(|source| EndpointError::InvalidPath { path, source })
    }

    /// A prefix answers when the probe gets any status except 404 or 5xx.
    async fn probe(&self) -> Result<ApiVersion, ProbeError> {
        let mut last = ProbeError::NoAnswer;
        for version in ApiVersion::PROBE_ORDER {
            let path = self.templates.probe.replace("{prefix}", version.prefix());
            let Ok(url) = self.origin.join(&path) else {
                continue;
            };
            match self.client.send(UpstreamRequest::get(url)).await {
                Ok(response) if response.status != 404 && response.status < 500 => {
                    log::info!("upstream api version detected: {}", version.as_str());
                    return Ok(version);
                }
                Ok(response) => {
                    log::debug!("probe {path} answered {}", response.status);
                }
                Err(err) => last = ProbeError::Transport(err),
            }
        }
        Err(last)
    }
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error("no prefix answered")]
    NoAnswer,
    #[error(transparent)]
    Transport(UpstreamClientError),
}
