//! Render/callback contract of the human-verification widget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use url::Url;

use super::{CaptchaProvider, CaptchaTask};

/// Continuation invoked with a freshly issued token.
pub type TokenCallback = Arc<dyn Fn(String) + Send + Sync>;
/// Continuation invoked when the widget fails to produce a token.
pub type ErrorCallback = Arc<dyn Fn(WidgetError) + Send + Sync>;
/// Continuation invoked when the last issued token expired.
pub type ExpiredCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum WidgetError {
    #[error("verification widget unavailable: {0}")]
    Unavailable(String),
    #[error("verification widget failed: {0}")]
    Failed(String),
}

/// Render parameters, including the injected continuations.
#[derive(Clone)]
pub struct WidgetConfig {
    pub site_key: String,
    pub action: Option<String>,
    pub callback: TokenCallback,
    pub error_callback: ErrorCallback,
    pub expired_callback: ExpiredCallback,
}

impl WidgetConfig {
    /// Config with no-op continuations.
    pub fn new(site_key: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            action: None,
            callback: Arc::new(|_| {}),
            error_callback: Arc::new(|_| {}),
            expired_callback: Arc::new(|| {}),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn on_token(mut self, callback: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.callback = Arc::new(callback);
        self
    }

    pub fn on_error(mut self, callback: impl Fn(WidgetError) + Send + Sync + 'static) -> Self {
        self.error_callback = Arc::new(callback);
        self
    }

    pub fn on_expired(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.expired_callback = Arc::new(callback);
        self
    }
}

impl std::fmt::Debug for WidgetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetConfig")
            .field("site_key", &self.site_key)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Where a widget instance is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetContainer {
    pub id: String,
    /// Off-screen instances are invisible to a human but still run.
    pub hidden: bool,
    pub viewport: (u32, u32),
}

impl WidgetContainer {
    pub fn hidden(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hidden: true,
            viewport: (1280, 800),
        }
    }
}

/// Identifier of a rendered widget instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WidgetHandle(pub String);

/// Synthetic pointer interaction delivered to a widget instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerGesture {
    pub x: f64,
    pub y: f64,
    /// Time between press and release.
    pub press_dwell: Duration,
    /// Time between release and click.
    pub click_delay: Duration,
}

/// Opaque third-party verification capability.
#[async_trait]
pub trait TurnstileWidget: Send + Sync {
    /// Makes the widget available; called once before the first render.
    async fn load(&self) -> Result<(), WidgetError>;

    /// Mounts an instance in `container`; tokens arrive through `config`.
    fn render(
        &self,
        container: &WidgetContainer,
        config: WidgetConfig,
    ) -> Result<WidgetHandle, WidgetError>;

    /// Destroys a rendered instance.
    fn remove(&self, handle: &WidgetHandle);

    /// Delivers a pointer interaction; widgets without liveness checks ignore it.
    fn pointer(&self, _handle: &WidgetHandle, _gesture: PointerGesture) {}
}

/// Widget used when no verification backend is configured. Rendering
/// always fails, so authentication relies on pre-existing cookies.
#[derive(Debug, Default)]
pub struct DisabledWidget;

#[async_trait]
impl TurnstileWidget for DisabledWidget {
    async fn load(&self) -> Result<(), WidgetError> {
        Ok(())
    }

    fn render(
        &self,
        _container: &WidgetContainer,
        _config: WidgetConfig,
    ) -> Result<WidgetHandle, WidgetError> {
        Err(WidgetError::Unavailable("no verification backend configured".into()))
    }

    fn remove(&self, _handle: &WidgetHandle) {}
}

/// Widget backed by a [`CaptchaProvider`]: each render spawns a solve task
/// whose outcome is reported through the config continuations.
pub struct CaptchaWidget {
    provider: Arc<dyn CaptchaProvider>,
    page_url: Url,
    counter: AtomicU64,
    instances: Arc<Mutex<HashMap<WidgetHandle, AbortHandle>>>,
}

impl CaptchaWidget {
    pub fn new(provider: Arc<dyn CaptchaProvider>, page_url: Url) -> Self {
        Self {
            provider,
            page_url,
            counter: AtomicU64::new(0),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_instances(&self) -> usize {
        self.instances.lock().map(|map| map.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TurnstileWidget for CaptchaWidget {
    async fn load(&self) -> Result<(), WidgetError> {
        log::debug!("verification widget backed by {}", self.provider.name());
        Ok(())
    }

    fn render(
        &self,
        container: &WidgetContainer,
        config: WidgetConfig,
    ) -> Result<WidgetHandle, WidgetError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| WidgetError::Unavailable(err.to_string()))?;

        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let handle = WidgetHandle(format!("{}-{id}", container.id));

        let mut task = CaptchaTask::new(config.site_key.clone(), self.page_url.clone());
        if let Some(action) = &config.action {
            task = task.with_action(action.clone());
        }

        let provider = self.provider.clone();
        let instances = self.instances.clone();
        let own_handle = handle.clone();
        let join = runtime.spawn(async move {
            match provider.solve(&task).await {
                Ok(solution) => {
                    (config.callback)(solution.token);
                    if let Some(ttl) = solution.expires_in {
                        sleep(ttl).await;
                        (config.expired_callback)();
                    }
                }
                Err(err) => (config.error_callback)(WidgetError::Failed(err.to_string())),
            }
            if let Ok(mut map) = instances.lock() {
                map.remove(&own_handle);
            }
        });

        if let Ok(mut map) = self.instances.lock() {
            map.insert(handle.clone(), join.abort_handle());
        }
        Ok(handle)
    }

    fn remove(&self, handle: &WidgetHandle) {
        if let Ok(mut map) = self.instances.lock()
            && let Some(task) = map.remove(handle)
        {
            task.abort();
        }
    }
}
