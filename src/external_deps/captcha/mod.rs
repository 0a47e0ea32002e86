//! Human-verification integrations.
//!
//! The relay never solves verification puzzles itself. It talks to an opaque
//! widget capability ([`TurnstileWidget`]) through a narrow
//! render/callback contract. [`CaptchaWidget`] implements that contract on
//! top of any [`CaptchaProvider`], such as the CapSolver service.

mod capsolver;
mod widget;

pub use capsolver::CapSolverProvider;
pub use widget::{
    CaptchaWidget, DisabledWidget, ErrorCallback, ExpiredCallback, PointerGesture, TokenCallback,
    TurnstileWidget, WidgetConfig, WidgetContainer, WidgetError, WidgetHandle,
};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// High-level configuration that controls captcha solving behaviour.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Details describing the verification the upstream page embeds.
#[derive(Debug, Clone)]
pub struct CaptchaTask {
    pub site_key: String,
    pub page_url: Url,
    pub action: Option<String>,
    pub data: HashMap<String, String>,
}

impl CaptchaTask {
    pub fn new(site_key: impl Into<String>, page_url: Url) -> Self {
        Self {
            site_key: site_key.into(),
            page_url,
            action: None,
            data: HashMap::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// Resolved verification token and optional metadata.
#[derive(Debug, Clone)]
pub struct CaptchaSolution {
    pub token: String,
    pub expires_in: Option<Duration>,
    pub metadata: HashMap<String, String>,
}

impl CaptchaSolution {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_in: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult;
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha error: {0}")]
    Other(String),
}
