//! Relay-wide cookie jar.
//!
//! Plays the part of the browser's cookie storage: reqwest reads and writes it
//! through [`CookieStore`], while the session layer can ask whether a cookie
//! is visible for a URL, install cookies directly, and delete whole scopes
//! during an identity reset.

use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cookie::Cookie;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use url::Url;

use crate::challenges::core::cookie_scopes;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    /// Lowercase domain without a leading dot.
    domain: String,
    /// Host-only cookies match `domain` exactly; others match subdomains too.
    host_only: bool,
    path: String,
    secure: bool,
    expires: Option<DateTime<Utc>>,
}

impl StoredCookie {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        };
        domain_ok
            && url.path().starts_with(&self.path)
            && (!self.secure || url.scheme() == "https")
    }

    fn same_slot(&self, other: &StoredCookie) -> bool {
        self.name == other.name
            && self.domain == other.domain
            && self.host_only == other.host_only
            && self.path == other.path
    }

    fn scope(&self) -> String {
        if self.host_only {
            self.domain.clone()
        } else {
            format!(".{}", self.domain)
        }
    }
}

/// Thread-safe cookie storage shared by every upstream call of the relay.
#[derive(Debug, Default)]
pub struct SessionCookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl SessionCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a cookie. A `scope` starting with `.` creates a domain cookie
    /// visible to every subdomain; otherwise the cookie is host-only.
    pub fn insert(&self, name: &str, value: &str, scope: &str) {
        let (domain, host_only) = match scope.strip_prefix('.') {
            Some(domain) => (domain, false),
            None => (scope, true),
        };
        self.store(StoredCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_ascii_lowercase(),
            host_only,
            path: "/".to_string(),
            secure: false,
            expires: None,
        });
    }

    /// Value of cookie `name` as seen by a request to `url`.
    pub fn get(&self, url: &Url, name: &str) -> Option<String> {
        self.visible(url)
            .into_iter()
            .find(|(cookie, _)| cookie == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, url: &Url, name: &str) -> bool {
        self.get(url, name).is_some()
    }

    /// Every `(name, value)` pair a request to `url` would carry, most
    /// specific path first.
    pub fn visible(&self, url: &Url) -> Vec<(String, String)> {
        let now = Utc::now();
        let Ok(mut cookies) = self.cookies.lock() else {
            return Vec::new();
        };
        cookies.retain(|cookie| !cookie.is_expired(now));

        let mut matching: Vec<&StoredCookie> =
            cookies.iter().filter(|cookie| cookie.matches(url)).collect();
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matching
            .into_iter()
            .map(|cookie| (cookie.name.clone(), cookie.value.clone()))
            .collect()
    }

    /// Deletes cookie `name` stored under `scope` (same scope syntax as
    /// [`insert`](Self::insert)).
    pub fn remove(&self, name: &str, scope: &str) -> bool {
        let scope = scope.to_ascii_lowercase();
        let Ok(mut cookies) = self.cookies.lock() else {
            return false;
        };
        let before = cookies.len();
        cookies.retain(|cookie| !(cookie.name == name && cookie.scope() == scope));
        before != cookies.len()
    }

    /// Deletes every cookie stored under `scope`. A bare domain removes both
    /// its host-only and domain cookies; `.domain` removes the domain cookies.
    pub fn remove_scope(&self, scope: &str) -> usize {
        let scope = scope.to_ascii_lowercase();
        let Ok(mut cookies) = self.cookies.lock() else {
            return 0;
        };
        let before = cookies.len();
        cookies.retain(|cookie| {
            if scope.starts_with('.') {
                cookie.scope() != scope
            } else {
                cookie.domain != scope
            }
        });
        before - cookies.len()
    }

    /// Deletes the cookies of `url`'s host, its apex domain and the wildcard
    /// apex scope. Returns how many cookies were dropped.
    pub fn clear_visible(&self, url: &Url) -> usize {
        let Some(host) = url.host_str() else {
            return 0;
        };
        cookie_scopes(host)
            .iter()
            .map(|scope| self.remove_scope(scope))
            .sum()
    }

    pub fn clear_all(&self) {
        if let Ok(mut cookies) = self.cookies.lock() {
            cookies.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.cookies.lock().map(|cookies| cookies.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, cookie: StoredCookie) {
        let Ok(mut cookies) = self.cookies.lock() else {
            return;
        };
        cookies.retain(|existing| !existing.same_slot(&cookie));
        if !cookie.is_expired(Utc::now()) {
            cookies.push(cookie);
        }
    }
}

impl CookieStore for SessionCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            let Ok(raw) = header.to_str() else {
                continue;
            };
            if let Some(cookie) = parse_set_cookie(raw, url) {
                self.store(cookie);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let header = self
            .visible(url)
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        if header.is_empty() {
            return None;
        }
        HeaderValue::from_str(&header).ok()
    }
}

/// Turns a `Set-Cookie` header into a jar entry scoped to the responding
/// host. An already-expired result is a deletion.
fn parse_set_cookie(raw: &str, url: &Url) -> Option<StoredCookie> {
    let host = url.host_str()?.to_ascii_lowercase();
    let parsed = Cookie::parse(raw).ok()?;
    if parsed.name().is_empty() {
        return None;
    }

    let (domain, host_only) = match parsed.domain().filter(|domain| !domain.is_empty()) {
        Some(domain) => {
            let domain = domain.trim_start_matches('.').to_ascii_lowercase();
            // A server may only widen to a parent of the responding host.
            if host != domain && !host.ends_with(&format!(".{domain}")) {
                return None;
            }
            (domain, false)
        }
        None => (host, true),
    };

    // Max-Age wins over Expires.
    let expires = match parsed.max_age() {
        Some(max_age) => ChronoDuration::try_seconds(max_age.whole_seconds())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl)),
        None => parsed
            .expires_datetime()
            .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), 0)),
    };

    Some(StoredCookie {
        name: parsed.name().to_string(),
        value: parsed.value_trimmed().to_string(),
        domain,
        host_only,
        path: parsed
            .path()
            .filter(|path| path.starts_with('/'))
            .unwrap_or("/")
            .to_string(),
        secure: parsed.secure().unwrap_or(false),
        expires,
    })
}
