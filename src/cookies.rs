//! `Set-Cookie` parsing and an in-memory cookie jar.
//!
//! Cookies are validated when parsed (domain scope, `Secure` over https, `__Secure-` and
//! `__Host-` prefixes, `SameSite` token). Expiry is never applied eagerly; expired cookies
//! are simply filtered out when the jar is read.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::http::Headers;

const SECURE_PREFIX: &str = "__Secure-";
const HOST_PREFIX: &str = "__Host-";

/// Value of the `SameSite` attribute. Cookies without the attribute default to `Lax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl SameSite {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "lax" => Some(Self::Lax),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Reasons a `Set-Cookie` header is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("Set-Cookie header has no name=value pair")]
    MissingNameValue,
    #[error("cookie received from {url} has no host")]
    NoHost { url: String },
    #[error("cookie domain {domain} is not within {host}")]
    DomainMismatch { domain: String, host: String },
    #[error("cookie {name} is marked Secure but was received over {scheme}")]
    SecureOverInsecure { name: String, scheme: String },
    #[error("cookie {name} violates the {prefix} prefix rules: {reason}")]
    PrefixViolation {
        name: String,
        prefix: &'static str,
        reason: &'static str,
    },
    #[error("invalid SameSite value {0:?}")]
    InvalidSameSite(String),
}

/// One cookie parsed from a `Set-Cookie` header.
///
/// The value is redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    set_from_host: String,
    path: Option<String>,
    expires: Option<SystemTime>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
    same_site: SameSite,
    received_at: SystemTime,
}

impl Cookie {
    /// Parses a `Set-Cookie` header line received from `url`.
    ///
    /// # Errors
    ///
    /// Returns [`CookieError`] when the header is malformed or violates a scoping rule.
    pub fn parse(url: &Url, header: &str) -> Result<Self, CookieError> {
        Self::parse_at(url, header, SystemTime::now())
    }

    /// Parses a header as if it were received at `received_at`.
    ///
    /// # Errors
    ///
    /// See [`parse`](Self::parse).
    pub fn parse_at(url: &Url, header: &str, received_at: SystemTime) -> Result<Self, CookieError> {
        let host = url
            .host_str()
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| CookieError::NoHost {
                url: url.to_string(),
            })?;

        let mut parts = header.split(';');
        let (name, value) = parts
            .next()
            .and_then(|pair| pair.split_once('='))
            .map(|(n, v)| (n.trim(), v.trim()))
            .filter(|(n, _)| !n.is_empty())
            .ok_or(CookieError::MissingNameValue)?;

        let mut cookie = Self {
            name: name.to_string(),
            value: value.trim_matches('"').to_string(),
            domain: host.clone(),
            host_only: true,
            set_from_host: host.clone(),
            path: None,
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: SameSite::default(),
            received_at,
        };
        let mut has_domain_attribute = false;

        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "expires" => match httpdate::parse_http_date(val) {
                    Ok(at) => cookie.expires = Some(at),
                    Err(_) => debug!(cookie = %cookie.name, "ignoring unparseable Expires"),
                },
                "max-age" => match val.parse::<i64>() {
                    Ok(seconds) => cookie.max_age = Some(seconds),
                    Err(_) => debug!(cookie = %cookie.name, "ignoring unparseable Max-Age"),
                },
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if domain.is_empty() {
                        continue;
                    }
                    validate_domain(&domain, &host)?;
                    cookie.domain = domain;
                    cookie.host_only = false;
                    has_domain_attribute = true;
                }
                "path" => {
                    if val.starts_with('/') {
                        cookie.path = Some(val.to_string());
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => {
                    cookie.same_site = SameSite::parse(val)
                        .ok_or_else(|| CookieError::InvalidSameSite(val.to_string()))?;
                }
                _ => {}
            }
        }

        cookie.validate_security(url, has_domain_attribute)?;
        Ok(cookie)
    }

    fn validate_security(&self, url: &Url, has_domain_attribute: bool) -> Result<(), CookieError> {
        let https = url.scheme() == "https";
        if self.secure && !https {
            return Err(CookieError::SecureOverInsecure {
                name: self.name.clone(),
                scheme: url.scheme().to_string(),
            });
        }

        for prefix in [SECURE_PREFIX, HOST_PREFIX] {
            if !self.name.starts_with(prefix) {
                continue;
            }
            let violation = |reason| CookieError::PrefixViolation {
                name: self.name.clone(),
                prefix,
                reason,
            };
            if !https {
                return Err(violation("must be set from an https URL"));
            }
            if !self.secure {
                return Err(violation("requires the Secure attribute"));
            }
            if prefix == HOST_PREFIX {
                if has_domain_attribute {
                    return Err(violation("must not have a Domain attribute"));
                }
                if self.path.as_deref() != Some("/") {
                    return Err(violation("requires Path=/"));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cookie value. Avoid logging it.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Domain the cookie is scoped to (without leading dot).
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    #[must_use]
    pub fn max_age(&self) -> Option<i64> {
        self.max_age
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.secure
    }

    #[must_use]
    pub fn http_only(&self) -> bool {
        self.http_only
    }

    #[must_use]
    pub fn same_site(&self) -> SameSite {
        self.same_site
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Expired if `Expires` has passed, if `Max-Age <= 0`, or if `Max-Age` seconds have
    /// elapsed since the cookie was received. Without either attribute, or with a `Max-Age`
    /// beyond the representable time range, it never expires.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        if self.expires.is_some_and(|at| at <= now) {
            return true;
        }
        match self.max_age {
            Some(seconds) if seconds <= 0 => true,
            #[allow(clippy::cast_sign_loss)]
            Some(seconds) => self
                .received_at
                .checked_add(Duration::from_secs(seconds as u64))
                .is_some_and(|expires_at| now > expires_at),
            None => false,
        }
    }

    #[must_use]
    pub fn should_be_sent_to(&self, url: &Url) -> bool {
        self.should_be_sent_to_at(url, SystemTime::now())
    }

    /// Whether this cookie belongs in a request to `url` at time `now`.
    #[must_use]
    pub fn should_be_sent_to_at(&self, url: &Url, now: SystemTime) -> bool {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        if !domain_ok {
            return false;
        }
        if self.name.starts_with(HOST_PREFIX) && host != self.set_from_host {
            return false;
        }
        if self.secure && url.scheme() != "https" && !is_localhost(&host) {
            return false;
        }
        self.path_matches(url.path()) && !self.is_expired_at(now)
    }

    fn path_matches(&self, request_path: &str) -> bool {
        let Some(path) = self.path.as_deref() else {
            return true;
        };
        path == "/"
            || request_path == path
            || (path.ends_with('/') && request_path.starts_with(path))
            || request_path
                .strip_prefix(path)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("host_only", &self.host_only)
            .field("path", &self.path)
            .field("expires", &self.expires)
            .field("max_age", &self.max_age)
            .field("secure", &self.secure)
            .field("http_only", &self.http_only)
            .field("same_site", &self.same_site)
            .finish_non_exhaustive()
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|rest| rest.ends_with('.'))
}

fn validate_domain(domain: &str, host: &str) -> Result<(), CookieError> {
    let mismatch = || CookieError::DomainMismatch {
        domain: domain.to_string(),
        host: host.to_string(),
    };
    if !domain_matches(host, domain) {
        return Err(mismatch());
    }
    // A bare public suffix (e.g. "co.uk") may only be used by a host that is that suffix.
    if domain != host && psl::suffix_str(domain) == Some(domain) {
        return Err(mismatch());
    }
    Ok(())
}

fn is_localhost(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host.ends_with(".localhost")
}

/// Cookies grouped by domain, then by name. A later cookie with the same name and domain
/// replaces the earlier one.
#[derive(Debug, Default)]
pub struct CookieJar {
    domains: DashMap<String, HashMap<String, Cookie>>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a cookie under its own domain.
    pub fn add(&self, cookie: Cookie) {
        self.domains
            .entry(cookie.domain.clone())
            .or_default()
            .insert(cookie.name.clone(), cookie);
    }

    /// Parses and stores every `Set-Cookie` header in `headers`.
    ///
    /// # Errors
    ///
    /// Stops at the first invalid cookie and returns its error; cookies before it are kept.
    #[instrument(level = "debug", skip(self, headers), fields(url = %url))]
    pub fn add_from(&self, url: &Url, headers: &Headers) -> Result<usize, CookieError> {
        let mut added = 0;
        for line in headers.get_all("set-cookie") {
            self.add(Cookie::parse(url, line)?);
            added += 1;
        }
        Ok(added)
    }

    /// Like [`add_from`](Self::add_from), but logs and skips invalid cookies.
    pub fn add_from_lossy(&self, url: &Url, headers: &Headers) -> usize {
        let mut added = 0;
        for line in headers.get_all("set-cookie") {
            match Cookie::parse(url, line) {
                Ok(cookie) => {
                    debug!(cookie = %cookie.name, domain = %cookie.domain, "stored cookie");
                    self.add(cookie);
                    added += 1;
                }
                Err(e) => warn!(url = %url, error = %e, "dropping invalid cookie"),
            }
        }
        added
    }

    /// Cookies that should be sent to `url`, longest path first.
    #[must_use]
    pub fn get_for(&self, url: &Url) -> Vec<Cookie> {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return Vec::new();
        };
        let now = SystemTime::now();
        let mut cookies: Vec<Cookie> = self
            .domains
            .iter()
            .filter(|bucket| domain_matches(&host, bucket.key()))
            .flat_map(|bucket| {
                bucket
                    .value()
                    .values()
                    .filter(|cookie| cookie.should_be_sent_to_at(url, now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        cookies.sort_by_key(|c| std::cmp::Reverse(c.path.as_deref().map_or(0, str::len)));
        cookies
    }

    /// `Cookie` request header value for `url`, if any cookie applies.
    #[must_use]
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let cookies = self.get_for(url);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Removes every cookie.
    pub fn flush(&self) {
        self.domains.clear();
    }

    /// Number of stored cookies, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.iter().map(|bucket| bucket.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
