//! Verification token source.
//!
//! Keeps a hidden verification widget alive for the session, records every
//! token it issues, and lets the authentication flow wait for one. Tokens are
//! captured by composing the caller's success continuation with a recorder
//! before it reaches the widget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use tokio::sync::{OnceCell, watch};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until};

use crate::challenges::core::random_between;
use crate::external_deps::captcha::{
    PointerGesture, TurnstileWidget, WidgetConfig, WidgetContainer, WidgetError, WidgetHandle,
};

const HIDDEN_CONTAINER_ID: &str = "relay-turnstile";

#[derive(Debug, Clone)]
pub struct TokenSourceSettings {
    pub site_key: Option<String>,
    pub action: Option<String>,
    pub poll_interval: Duration,
    /// Delay before the synthetic pointer interaction.
    pub interaction_delay: Duration,
    /// Delay between an expiry, failure or spent token and re-rendering the
    /// hidden instance.
    pub recreate_delay: Duration,
}

impl Default for TokenSourceSettings {
    fn default() -> Self {
        Self {
            site_key: None,
            action: None,
            poll_interval: Duration::from_secs(1),
            interaction_delay: Duration::from_millis(1500),
            recreate_delay: Duration::from_secs(2),
        }
    }
}

/// Outcome of [`TokenSource::wait_for_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenWait {
    Token(String),
    /// A session credential became valid while waiting; no token is needed.
    CredentialReady,
    TimedOut,
}

struct Inner {
    widget: Arc<dyn TurnstileWidget>,
    settings: TokenSourceSettings,
    site_key: Mutex<Option<String>>,
    latest: watch::Sender<Option<String>>,
    loaded: OnceCell<Result<(), WidgetError>>,
    hidden: Mutex<Option<WidgetHandle>>,
    tasks: Mutex<Vec<AbortHandle>>,
    recreating: AtomicBool,
    closed: AtomicBool,
}

/// Session-scoped handle to the verification widget. Cloning is cheap.
#[derive(Clone)]
pub struct TokenSource {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSource")
            .field("has_token", &self.latest_token().is_some())
            .finish_non_exhaustive()
    }
}

impl TokenSource {
    pub fn new(widget: Arc<dyn TurnstileWidget>, settings: TokenSourceSettings) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                widget,
                site_key: Mutex::new(settings.site_key.clone()),
                settings,
                latest,
                loaded: OnceCell::new(),
                hidden: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                recreating: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Supplies a site key discovered at runtime; a configured key wins.
    pub fn set_site_key(&self, site_key: impl Into<String>) {
        if let Ok(mut current) = self.inner.site_key.lock()
            && current.is_none()
        {
            *current = Some(site_key.into());
        }
    }

    pub fn site_key(&self) -> Option<String> {
        self.inner.site_key.lock().ok().and_then(|key| key.clone())
    }

    pub fn latest_token(&self) -> Option<String> {
        self.inner.latest.borrow().clone()
    }

    /// Clears `token` if it is still the latest one. Tokens are single use,
    /// so the hidden instance is re-rendered to issue the next one.
    pub fn consume(&self, token: &str) {
        let spent = self.inner.latest.send_if_modified(|latest| {
            if latest.as_deref() == Some(token) {
                *latest = None;
                true
            } else {
                false
            }
        });
        let rendered = self.inner.hidden.lock().map(|hidden| hidden.is_some()).unwrap_or(false);
        if spent && rendered {
            schedule_recreate(Arc::downgrade(&self.inner), false);
        }
    }

    /// Records a token as if the widget had issued it.
    pub fn record(&self, token: impl Into<String>) {
        self.inner.latest.send_replace(Some(token.into()));
    }

    /// Renders through the widget with the success continuation wrapped so
    /// every issued token is also recorded here.
    pub async fn render(
        &self,
        container: &WidgetContainer,
        config: WidgetConfig,
    ) -> Result<WidgetHandle, WidgetError> {
        self.load().await?;

        let recorder = Arc::downgrade(&self.inner);
        let user_callback = config.callback.clone();
        let config = config.on_token(move |token: String| {
            if let Some(inner) = recorder.upgrade() {
                log::debug!("verification token received ({} chars)", token.len());
                inner.latest.send_replace(Some(token.clone()));
            }
            user_callback(token);
        });
        self.inner.widget.render(container, config)
    }

    /// Makes sure the hidden widget instance exists.
    pub async fn ensure_widget(&self) -> Result<(), WidgetError> {
        if self.is_closed() {
            return Err(WidgetError::Unavailable("session closed".into()));
        }
        if self.inner.hidden.lock().map(|hidden| hidden.is_some()).unwrap_or(false) {
            return Ok(());
        }

        let site_key = self
            .site_key()
            .ok_or_else(|| WidgetError::Unavailable("site key unknown".into()))?;
        let mut config = WidgetConfig::new(site_key);
        if let Some(action) = &self.inner.settings.action {
            config = config.with_action(action.clone());
        }

        let on_error = Arc::downgrade(&self.inner);
        let on_expired = on_error.clone();
        let config = config
            .on_error(move |err| {
                log::warn!("hidden verification widget error: {err}");
                schedule_recreate(on_error.clone(), false);
            })
            .on_expired(move || schedule_recreate(on_expired.clone(), true));

        let container = WidgetContainer::hidden(HIDDEN_CONTAINER_ID);
        let handle = self.render(&container, config).await?;

        let superseded = match self.inner.hidden.lock() {
            Ok(mut hidden) if hidden.is_none() => {
                *hidden = Some(handle.clone());
                false
            }
            _ => true,
        };
        if superseded {
            // Lost a race with a concurrent caller.
            self.inner.widget.remove(&handle);
            return Ok(());
        }

        log::debug!("hidden verification widget rendered as {}", handle.0);
        self.schedule_interaction(&container, handle);
        Ok(())
    }

    /// Waits until a token is available, `credential_ready` reports true,
    /// or `timeout` elapses. Checked every poll interval and whenever a
    /// token arrives.
    pub async fn wait_for_token<F>(&self, timeout: Duration, credential_ready: F) -> TokenWait
    where
        F: Fn() -> bool,
    {
        let mut updates = self.inner.latest.subscribe();
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(self.inner.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(token) = updates.borrow_and_update().clone() {
                return TokenWait::Token(token);
            }
            if credential_ready() {
                return TokenWait::CredentialReady;
            }
            if Instant::now() >= deadline {
                return TokenWait::TimedOut;
            }

            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = updates.changed() => {}
                _ = ticker.tick() => {}
            }
        }
    }

    /// Removes the hidden instance and stops pending widget tasks.
    pub fn teardown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let handle = self.inner.hidden.lock().ok().and_then(|mut hidden| hidden.take());
        if let Some(handle) = handle {
            self.inner.widget.remove(&handle);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn load(&self) -> Result<(), WidgetError> {
        self.inner
            .loaded
            .get_or_init(|| async { self.inner.widget.load().await })
            .await
            .clone()
    }

    fn schedule_interaction(&self, container: &WidgetContainer, handle: WidgetHandle) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.settings.interaction_delay;
        let (width, height) = container.viewport;
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let gesture = human_gesture(width, height);
            if let Some(inner) = weak.upgrade() {
                log::debug!("pointer interaction at ({:.0}, {:.0})", gesture.x, gesture.y);
                inner.widget.pointer(&handle, gesture);
            }
        });
        self.track(task.abort_handle());
    }

    fn track(&self, task: AbortHandle) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.retain(|existing| !existing.is_finished());
            tasks.push(task);
        }
    }
}

/// Destroys the current hidden instance and renders a new one after the
/// configured delay. `discard_token` drops a token the old instance issued.
/// At most one recreation is pending at a time.
fn schedule_recreate(weak: Weak<Inner>, discard_token: bool) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.closed.load(Ordering::Acquire)
        || inner
            .recreating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    {
        return;
    }
    let delay = inner.settings.recreate_delay;
    let source = TokenSource { inner };

    let task = runtime.spawn({
        let weak = weak.clone();
        async move {
            sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let source = TokenSource { inner };
            let stale = source.inner.hidden.lock().ok().and_then(|mut hidden| hidden.take());
            if let Some(handle) = stale {
                source.inner.widget.remove(&handle);
            }
            if discard_token {
                source.inner.latest.send_replace(None);
            }
            source.inner.recreating.store(false, Ordering::Release);
            if source.is_closed() {
                return;
            }
            if let Err(err) = source.ensure_widget().await {
                log::warn!("could not recreate verification widget: {err}");
            }
        }
    });
    source.track(task.abort_handle());
}

/// Pointer gesture near the viewport centre with jittered timing.
fn human_gesture(width: u32, height: u32) -> PointerGesture {
    let mut rng = rand::thread_rng();
    let x = f64::from(width) / 2.0 + rng.gen_range(-40.0..40.0);
    let y = f64::from(height) / 2.0 + rng.gen_range(-30.0..30.0);
    PointerGesture {
        x,
        y,
        press_dwell: random_between(Duration::from_millis(60), Duration::from_millis(180)),
        click_delay: random_between(Duration::from_millis(20), Duration::from_millis(90)),
    }
}

static SITEKEY_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"data-sitekey=['"]([0-9A-Za-z_-]{20,})['"]"#)
        .case_insensitive(true)
        .build()
        .expect("invalid site key attribute regex")
});

static SITEKEY_SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"\\?["']?site_?key\\?["']?\s*[:=]\s*\\?["'](0x[0-9A-Za-z_-]{10,})\\?["']"#)
        .case_insensitive(true)
        .build()
        .expect("invalid site key script regex")
});

/// Finds the verification site key embedded in the upstream page.
pub fn discover_site_key(markup: &str) -> Option<String> {
    SITEKEY_ATTR_RE
        .captures(markup)
        .or_else(|| SITEKEY_SCRIPT_RE.captures(markup))
        .and_then(|caps| caps.get(1))
        .map(|key| key.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Widget that hands the render config back to the test.
    #[derive(Default)]
    struct ManualWidget {
        loads: AtomicUsize,
        configs: Mutex<Vec<WidgetConfig>>,
        removed: Mutex<Vec<WidgetHandle>>,
        gestures: Mutex<Vec<PointerGesture>>,
    }

    impl ManualWidget {
        fn issue(&self, index: usize, token: &str) {
            let callback = self.configs.lock().unwrap()[index].callback.clone();
            callback(token.to_string());
        }

        fn expire(&self, index: usize) {
            let callback = self.configs.lock().unwrap()[index].expired_callback.clone();
            callback();
        }

        fn renders(&self) -> usize {
            self.configs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TurnstileWidget for ManualWidget {
        async fn load(&self) -> Result<(), WidgetError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn render(
            &self,
            container: &WidgetContainer,
            config: WidgetConfig,
        ) -> Result<WidgetHandle, WidgetError> {
            let mut configs = self.configs.lock().unwrap();
            configs.push(config);
            Ok(WidgetHandle(format!("{}-{}", container.id, configs.len())))
        }

        fn remove(&self, handle: &WidgetHandle) {
            self.removed.lock().unwrap().push(handle.clone());
        }

        fn pointer(&self, _handle: &WidgetHandle, gesture: PointerGesture) {
            self.gestures.lock().unwrap().push(gesture);
        }
    }

    fn settings() -> TokenSourceSettings {
        TokenSourceSettings {
            site_key: Some("0x4AAAAAAA".into()),
            poll_interval: Duration::from_millis(5),
            interaction_delay: Duration::from_millis(1),
            recreate_delay: Duration::from_millis(1),
            ..TokenSourceSettings::default()
        }
    }

    #[tokio::test]
    async fn hidden_widget_records_tokens_and_interacts() {
        let widget = Arc::new(ManualWidget::default());
        let source = TokenSource::new(widget.clone(), settings());

        source.ensure_widget().await.unwrap();
        source.ensure_widget().await.unwrap();
        assert_eq!(widget.renders(), 1);
        assert_eq!(widget.loads.load(Ordering::SeqCst), 1);

        widget.issue(0, "tok-1");
        assert_eq!(source.latest_token().as_deref(), Some("tok-1"));

        sleep(Duration::from_millis(20)).await;
        let gestures = widget.gestures.lock().unwrap().clone();
        assert_eq!(gestures.len(), 1);
        assert!((gestures[0].x - 640.0).abs() <= 40.0);
        assert!((gestures[0].y - 400.0).abs() <= 30.0);
    }

    #[tokio::test]
    async fn caller_callback_still_runs_after_wrapping() {
        let widget = Arc::new(ManualWidget::default());
        let source = TokenSource::new(widget.clone(), settings());
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        source
            .render(
                &WidgetContainer::hidden("visible"),
                WidgetConfig::new("0x4AAAAAAA").on_token(move |token| {
                    *sink.lock().unwrap() = Some(token);
                }),
            )
            .await
            .unwrap();
        widget.issue(0, "tok-user");

        assert_eq!(seen.lock().unwrap().as_deref(), Some("tok-user"));
        assert_eq!(source.latest_token().as_deref(), Some("tok-user"));
    }

    #[tokio::test]
    async fn expiry_recreates_hidden_instance() {
        let widget = Arc::new(ManualWidget::default());
        let source = TokenSource::new(widget.clone(), settings());
        source.ensure_widget().await.unwrap();
        widget.issue(0, "tok-old");

        widget.expire(0);
        sleep(Duration::from_millis(30)).await;

        assert_eq!(widget.renders(), 2);
        assert_eq!(widget.removed.lock().unwrap()[0].0, "relay-turnstile-1");
        assert_eq!(source.latest_token(), None);
    }

    /// Widget whose first instance reports a failure; later instances
    /// issue a token as soon as they are rendered.
    #[derive(Default)]
    struct FlakyWidget {
        renders: AtomicUsize,
        removed: Mutex<Vec<WidgetHandle>>,
    }

    #[async_trait]
    impl TurnstileWidget for FlakyWidget {
        async fn load(&self) -> Result<(), WidgetError> {
            Ok(())
        }

        fn render(
            &self,
            container: &WidgetContainer,
            config: WidgetConfig,
        ) -> Result<WidgetHandle, WidgetError> {
            let n = self.renders.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                (config.error_callback)(WidgetError::Failed("solver rejected task".into()));
            } else {
                (config.callback)(format!("tok-{n}"));
            }
            Ok(WidgetHandle(format!("{}-{n}", container.id)))
        }

        fn remove(&self, handle: &WidgetHandle) {
            self.removed.lock().unwrap().push(handle.clone());
        }
    }

    #[tokio::test]
    async fn failed_widget_is_rendered_again() {
        let widget = Arc::new(FlakyWidget::default());
        let source = TokenSource::new(widget.clone(), settings());

        source.ensure_widget().await.unwrap();
        let outcome = source.wait_for_token(Duration::from_millis(500), || false).await;

        assert_eq!(outcome, TokenWait::Token("tok-2".into()));
        assert_eq!(widget.renders.load(Ordering::SeqCst), 2);
        assert_eq!(widget.removed.lock().unwrap()[0].0, "relay-turnstile-1");
    }

    #[tokio::test]
    async fn spent_token_triggers_a_fresh_instance() {
        let widget = Arc::new(ManualWidget::default());
        let source = TokenSource::new(widget.clone(), settings());
        source.ensure_widget().await.unwrap();
        widget.issue(0, "tok-1");

        source.consume("tok-1");
        sleep(Duration::from_millis(30)).await;

        assert_eq!(widget.renders(), 2);
        assert_eq!(widget.removed.lock().unwrap().len(), 1);
        widget.issue(1, "tok-2");
        assert_eq!(source.latest_token().as_deref(), Some("tok-2"));

        // A token that is no longer current leaves the instance alone.
        source.consume("tok-1");
        sleep(Duration::from_millis(30)).await;
        assert_eq!(widget.renders(), 2);
    }

    #[tokio::test]
    async fn wait_returns_token_issued_later() {
        let widget = Arc::new(ManualWidget::default());
        let source = TokenSource::new(widget.clone(), settings());
        source.ensure_widget().await.unwrap();

        let issuer = widget.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            issuer.issue(0, "tok-late");
        });

        let outcome = source.wait_for_token(Duration::from_secs(2), || false).await;
        assert_eq!(outcome, TokenWait::Token("tok-late".into()));

        source.consume("tok-late");
        assert_eq!(source.latest_token(), None);
    }

    #[tokio::test]
    async fn wait_prefers_credential_and_times_out() {
        let source = TokenSource::new(Arc::new(ManualWidget::default()), settings());
        assert_eq!(
            source.wait_for_token(Duration::from_secs(1), || true).await,
            TokenWait::CredentialReady
        );
        assert_eq!(
            source.wait_for_token(Duration::from_millis(20), || false).await,
            TokenWait::TimedOut
        );
    }

    #[tokio::test]
    async fn missing_site_key_is_reported() {
        let mut settings = settings();
        settings.site_key = None;
        let source = TokenSource::new(Arc::new(ManualWidget::default()), settings);
        assert!(matches!(source.ensure_widget().await, Err(WidgetError::Unavailable(_))));

        source.set_site_key("0x4AAAAAAAdiscovered");
        source.ensure_widget().await.unwrap();
        source.teardown();
        assert!(source.is_closed());
        assert!(source.ensure_widget().await.is_err());
    }

    #[test]
    fn discovers_site_key_in_markup_and_scripts() {
        let attr = r#"<div class="cf-turnstile" data-sitekey="0x4AAAAAAA_attrKey123456"></div>"#;
        assert_eq!(discover_site_key(attr).as_deref(), Some("0x4AAAAAAA_attrKey123456"));

        let script = r#"self.__next_f.push([1,"{\"siteKey\":\"0x4AAAAAAAscriptKey\"}"])"#;
        assert_eq!(discover_site_key(script).as_deref(), Some("0x4AAAAAAAscriptKey"));

        assert_eq!(discover_site_key("<html></html>"), None);
    }
}
