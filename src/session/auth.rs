//! Authentication controller.
//!
//! Readiness is decided by one predicate: the auth cookie is visible for the
//! upstream origin. A fresh stored credential counts only after it has been
//! written back into the jar.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

use crate::challenges::core::{UpstreamClientError, UpstreamHttpClient, UpstreamRequest, apex_domain};
use crate::challenges::solvers::{TokenSource, TokenWait};
use crate::modules::cookies::SessionCookieJar;
use crate::modules::events::{AuthEvent, EventDispatcher, RelayEvent};
use crate::modules::state::{Credential, CredentialStore, StoreError};

use super::endpoints::{EndpointError, EndpointKind, Endpoints};

const DEFAULT_CREDENTIAL_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStep {
    SignUp,
    Verify,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no verification token became available in time")]
    Timeout,
    #[error("credential exchange failed at {step:?} with status {status}")]
    ExchangeFailed { step: ExchangeStep, status: u16 },
    #[error(transparent)]
    Transport(#[from] UpstreamClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// How readiness was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    CookiePresent,
    StoredCredential,
    /// The cookie appeared while waiting for a token.
    SupersededWait,
    Exchanged,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub origin: Url,
    pub auth_cookie: String,
    pub provisional_cookie: String,
    pub token_wait_timeout: Duration,
}

enum AuthState {
    NeedCheck,
    NeedToken,
    NeedExchange(String),
    Done(Readiness),
}

pub struct AuthenticationController {
    client: Arc<dyn UpstreamHttpClient>,
    jar: Arc<SessionCookieJar>,
    credentials: CredentialStore,
    tokens: TokenSource,
    endpoints: Arc<Endpoints>,
    events: Arc<EventDispatcher>,
    settings: AuthSettings,
    exchange: tokio::sync::Mutex<()>,
}

impl AuthenticationController {
    pub fn new(
        client: Arc<dyn UpstreamHttpClient>,
        jar: Arc<SessionCookieJar>,
        credentials: CredentialStore,
        tokens: TokenSource,
        endpoints: Arc<Endpoints>,
        events: Arc<EventDispatcher>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            client,
            jar,
            credentials,
            tokens,
            endpoints,
            events,
            settings,
            exchange: tokio::sync::Mutex::new(()),
        }
    }

    /// Canonical readiness predicate.
    pub fn is_ready(&self) -> bool {
        self.jar.contains(&self.settings.origin, &self.settings.auth_cookie)
    }

    /// Brings the session to an authenticated state for `request_id`.
    pub async fn ensure_ready(&self, request_id: &str) -> Result<Readiness, AuthError> {
        let mut state = AuthState::NeedCheck;
        loop {
            state = match state {
                AuthState::NeedCheck => {
                    if self.is_ready() {
                        AuthState::Done(Readiness::CookiePresent)
                    } else if let Some(credential) = self.credentials.load_valid()? {
                        log::debug!("re-installing stored credential for {request_id}");
                        self.install_cookie(&credential.token);
                        AuthState::Done(Readiness::StoredCredential)
                    } else {
                        AuthState::NeedToken
                    }
                }
                AuthState::NeedToken => match self.tokens.latest_token() {
                    Some(token) => AuthState::NeedExchange(token),
                    None => {
                        if let Err(err) = self.tokens.ensure_widget().await {
                            log::warn!("verification widget unavailable: {err}");
                        }
                        log::info!("waiting for a verification token for {request_id}");
                        match self
                            .tokens
                            .wait_for_token(self.settings.token_wait_timeout, || self.is_ready())
                            .await
                        {
                            TokenWait::Token(token) => AuthState::NeedExchange(token),
                            TokenWait::CredentialReady => AuthState::Done(Readiness::SupersededWait),
                            TokenWait::TimedOut => return Err(AuthError::Timeout),
                        }
                    }
                },
                AuthState::NeedExchange(token) => match self.exchange(request_id, &token).await? {
                    Some(readiness) => AuthState::Done(readiness),
                    None => AuthState::NeedToken,
                },
                AuthState::Done(readiness) => return Ok(readiness),
            };
        }
    }

    /// Two-step handshake: sign-up with the token, install the returned
    /// material as the auth cookie, then the verification call.
    ///
    /// Returns `None` when the token was spent by an exchange that held the
    /// lock first and no newer token has arrived since.
    async fn exchange(&self, request_id: &str, seen: &str) -> Result<Option<Readiness>, AuthError> {
        let _serialized = self.exchange.lock().await;
        if self.is_ready() {
            return Ok(Some(Readiness::CookiePresent));
        }
        let Some(token) = self.tokens.latest_token() else {
            log::debug!("verification token for {request_id} was already spent");
            return Ok(None);
        };
        if token != seen {
            log::debug!("using a newer verification token for {request_id}");
        }
        self.tokens.consume(&token);

        let result = self.perform_exchange(&token).await;
        let status = match &result {
            Err(AuthError::ExchangeFailed { status, .. }) => Some(*status),
            _ => None,
        };
        self.events.dispatch(RelayEvent::Auth(AuthEvent {
            request_id: request_id.to_string(),
            success: result.is_ok(),
            status,
            timestamp: Utc::now(),
        }));
        result.map(|_| Some(Readiness::Exchanged))
    }

    async fn perform_exchange(&self, token: &str) -> Result<(), AuthError> {
        let provisional_id = self.provisional_user_id();
        let sign_up = UpstreamRequest::post(self.endpoints.url(EndpointKind::SignUp).await?)
            .with_json(&json!({
                "turnstileToken": token,
                "provisionalUserId": provisional_id,
            }));
        let response = self.client.send(sign_up).await?;
        if !response.is_success() {
            return Err(AuthError::ExchangeFailed {
                step: ExchangeStep::SignUp,
                status: response.status,
            });
        }

        let material = format!("base64-{}", STANDARD.encode(&response.body));
        let expires_at = expiry_from_body(&response.body);
        self.install_cookie(&material);

        let verify = UpstreamRequest::post(self.endpoints.url(EndpointKind::Verify).await?)
            .with_json(&json!({}));
        let response = match self.client.send(verify).await {
            Ok(response) => response,
            Err(err) => {
                self.remove_cookie();
                return Err(err.into());
            }
        };
        if !response.is_success() {
            self.remove_cookie();
            return Err(AuthError::ExchangeFailed {
                step: ExchangeStep::Verify,
                status: response.status,
            });
        }

        self.credentials.save(&Credential::new(material, expires_at))?;
        Ok(())
    }

    fn install_cookie(&self, value: &str) {
        self.jar
            .insert(&self.settings.auth_cookie, value, &self.domain_scope());
    }

    fn remove_cookie(&self) {
        self.jar.remove(&self.settings.auth_cookie, &self.domain_scope());
    }

    /// Existing provisional id, or a new one stored in its own cookie.
    fn provisional_user_id(&self) -> String {
        if let Some(existing) = self
            .jar
            .get(&self.settings.origin, &self.settings.provisional_cookie)
        {
            return existing;
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.jar
            .insert(&self.settings.provisional_cookie, &id, &self.domain_scope());
        id
    }

    fn domain_scope(&self) -> String {
        let host = self.settings.origin.host_str().unwrap_or_default();
        format!(".{}", apex_domain(host))
    }
}

/// Absolute expiry from `expires_at`, else `expires_in`, else one hour.
fn expiry_from_body(body: &[u8]) -> i64 {
    let now = Utc::now().timestamp();
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return now + DEFAULT_CREDENTIAL_LIFETIME_SECS;
    };
    if let Some(at) = value.get("expires_at").and_then(Value::as_i64) {
        return at;
    }
    if let Some(secs) = value.get("expires_in").and_then(Value::as_i64) {
        return now.saturating_add(secs);
    }
    now + DEFAULT_CREDENTIAL_LIFETIME_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::testing::{StubReply, StubUpstream};
    use crate::challenges::solvers::TokenSourceSettings;
    use crate::external_deps::captcha::DisabledWidget;
    use crate::modules::state::StateStore;
    use crate::session::endpoints::{ApiVersion, ApiVersionSetting};
    use crate::config::EndpointTemplates;

    struct Fixture {
        stub: Arc<StubUpstream>,
        jar: Arc<SessionCookieJar>,
        credentials: CredentialStore,
        tokens: TokenSource,
        auth: AuthenticationController,
    }

    fn fixture(wait: Duration) -> Fixture {
        let stub = StubUpstream::new();
        let origin = Url::parse("https://lmarena.ai/").unwrap();
        let jar = Arc::new(SessionCookieJar::new());
        let credentials =
            CredentialStore::new(StateStore::in_memory().unwrap(), Duration::from_secs(300));
        let tokens = TokenSource::new(
            Arc::new(DisabledWidget),
            TokenSourceSettings {
                site_key: Some("0x4AAAAAAA".into()),
                poll_interval: Duration::from_millis(5),
                ..TokenSourceSettings::default()
            },
        );
        let endpoints = Arc::new(Endpoints::new(
            origin.clone(),
            EndpointTemplates::default(),
            ApiVersionSetting::Pinned(ApiVersion::NextjsApi),
            stub.clone(),
        ));
        let auth = AuthenticationController::new(
            stub.clone(),
            jar.clone(),
            credentials.clone(),
            tokens.clone(),
            endpoints,
            Arc::new(EventDispatcher::new()),
            AuthSettings {
                origin,
                auth_cookie: "arena-auth-prod-v1".into(),
                provisional_cookie: "provisional_user_id".into(),
                token_wait_timeout: wait,
            },
        );
        Fixture {
            stub,
            jar,
            credentials,
            tokens,
            auth,
        }
    }

    fn origin() -> Url {
        Url::parse("https://lmarena.ai/").unwrap()
    }

    #[tokio::test]
    async fn existing_cookie_short_circuits() {
        let fx = fixture(Duration::from_millis(10));
        fx.jar.insert("arena-auth-prod-v1", "base64-abc", ".lmarena.ai");
        assert_eq!(fx.auth.ensure_ready("r1").await.unwrap(), Readiness::CookiePresent);
        assert!(fx.stub.requests().is_empty());
    }

    #[tokio::test]
    async fn stored_credential_is_reinjected_as_cookie() {
        let fx = fixture(Duration::from_millis(10));
        fx.credentials
            .save(&Credential::new("base64-stored", Utc::now().timestamp() + 3600))
            .unwrap();

        assert_eq!(fx.auth.ensure_ready("r1").await.unwrap(), Readiness::StoredCredential);
        assert_eq!(
            fx.jar.get(&origin(), "arena-auth-prod-v1").as_deref(),
            Some("base64-stored")
        );
    }

    #[tokio::test]
    async fn token_is_exchanged_for_credential() {
        let fx = fixture(Duration::from_millis(50));
        fx.stub.route(
            "/nextjs-api/sign-up",
            StubReply::ok(r#"{"access_token":"jwt","expires_in":7200}"#),
        );
        fx.stub.route("/", StubReply::ok("{}"));
        fx.tokens.record("turnstile-token");

        assert_eq!(fx.auth.ensure_ready("r1").await.unwrap(), Readiness::Exchanged);

        let sign_up = &fx.stub.requests_to("/nextjs-api/sign-up")[0];
        let body: Value = serde_json::from_slice(sign_up.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["turnstileToken"], "turnstile-token");
        let provisional = fx.jar.get(&origin(), "provisional_user_id").unwrap();
        assert_eq!(body["provisionalUserId"], provisional.as_str());

        let cookie = fx.jar.get(&origin(), "arena-auth-prod-v1").unwrap();
        let decoded = STANDARD.decode(cookie.trim_start_matches("base64-")).unwrap();
        assert_eq!(decoded, br#"{"access_token":"jwt","expires_in":7200}"#);

        let stored = fx.credentials.load_valid().unwrap().unwrap();
        assert_eq!(stored.token, cookie);
        assert!(stored.expires_at > Utc::now().timestamp() + 7000);
        assert_eq!(fx.stub.requests_to("/").len(), 1);
        assert_eq!(fx.tokens.latest_token(), None);
    }

    #[tokio::test]
    async fn failed_sign_up_reports_status() {
        let fx = fixture(Duration::from_millis(50));
        fx.stub.route("/nextjs-api/sign-up", StubReply::status(403, "denied"));
        fx.tokens.record("turnstile-token");

        let err = fx.auth.ensure_ready("r1").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::ExchangeFailed { step: ExchangeStep::SignUp, status: 403 }
        ));
        assert!(fx.credentials.load_valid().unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_verification_is_an_exchange_failure() {
        let fx = fixture(Duration::from_millis(50));
        fx.stub.route("/nextjs-api/sign-up", StubReply::ok("{}"));
        fx.stub.route("/", StubReply::status(500, "oops"));
        fx.tokens.record("turnstile-token");

        let err = fx.auth.ensure_ready("r1").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::ExchangeFailed { step: ExchangeStep::Verify, status: 500 }
        ));
        assert!(!fx.auth.is_ready());
    }

    #[tokio::test]
    async fn missing_token_times_out() {
        let fx = fixture(Duration::from_millis(20));
        assert!(matches!(fx.auth.ensure_ready("r1").await, Err(AuthError::Timeout)));
    }

    #[tokio::test]
    async fn cookie_appearing_during_wait_supersedes_token() {
        let fx = fixture(Duration::from_secs(2));
        let jar = fx.jar.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            jar.insert("arena-auth-prod-v1", "base64-elsewhere", ".lmarena.ai");
        });
        assert_eq!(fx.auth.ensure_ready("r1").await.unwrap(), Readiness::SupersededWait);
    }

    #[tokio::test]
    async fn queued_exchange_does_not_reuse_a_spent_token() {
        let fx = fixture(Duration::from_millis(60));
        fx.stub.route("/nextjs-api/sign-up", StubReply::status(500, "oops"));
        fx.tokens.record("tok-1");
        let auth = Arc::new(fx.auth);

        let held = auth.exchange.lock().await;
        let waiter = tokio::spawn({
            let auth = auth.clone();
            async move { auth.ensure_ready("r2").await }
        });
        tokio::time::sleep(Duration::from_millis(15)).await;
        // The exchange that held the lock spent the token.
        fx.tokens.consume("tok-1");
        drop(held);

        assert!(matches!(waiter.await.unwrap(), Err(AuthError::Timeout)));
        assert!(fx.stub.requests_to("/nextjs-api/sign-up").is_empty());
    }

    #[tokio::test]
    async fn queued_exchange_picks_up_a_newer_token() {
        let fx = fixture(Duration::from_millis(60));
        fx.stub.route("/nextjs-api/sign-up", StubReply::ok("{}"));
        fx.stub.route("/", StubReply::ok("{}"));
        fx.tokens.record("tok-1");
        let auth = Arc::new(fx.auth);

        let held = auth.exchange.lock().await;
        let waiter = tokio::spawn({
            let auth = auth.clone();
            async move { auth.ensure_ready("r2").await }
        });
        tokio::time::sleep(Duration::from_millis(15)).await;
        fx.tokens.consume("tok-1");
        fx.tokens.record("tok-2");
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), Readiness::Exchanged);
        let sign_ups = fx.stub.requests_to("/nextjs-api/sign-up");
        assert_eq!(sign_ups.len(), 1);
        let body: Value = serde_json::from_slice(sign_ups[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["turnstileToken"], "tok-2");
    }

    #[test]
    fn huge_lifetimes_saturate() {
        assert_eq!(expiry_from_body(format!(r#"{{"expires_in":{}}}"#, i64::MAX).as_bytes()), i64::MAX);
    }

    #[test]
    fn expiry_prefers_absolute_timestamp() {
        assert_eq!(expiry_from_body(br#"{"expires_at":1900000000,"expires_in":10}"#), 1_900_000_000);
        let now = Utc::now().timestamp();
        let fallback = expiry_from_body(b"not json");
        assert!((fallback - (now + 3600)).abs() <= 2);
    }
}
