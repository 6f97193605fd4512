//! The polite HTTP loader.
//!
//! [`HttpLoader`] ties the politeness pieces together. For every request it:
//!
//! 1. sets the `User-Agent` header and runs `before_load` hooks,
//! 2. answers from the cache if possible (`on_cache_hit`),
//! 3. checks robots.txt for bot identities,
//! 4. waits for the per-domain [`Throttler`] to allow the request,
//! 5. sends it with matching jar cookies, following redirects hop by hop,
//! 6. stores `Set-Cookie` values in the jar,
//! 7. hands error statuses to the [`RetryHandler`],
//! 8. caches the result and runs `on_success` or `on_error`, then `after_load`.
//!
//! [`HttpLoader::load`] logs failures and yields `None`; [`HttpLoader::load_or_fail`]
//! returns them as [`LoadError`].

mod hooks;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, LOCATION, USER_AGENT};
use reqwest::{Client, Method};
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::aggregate::RespondedRequest;
use crate::cache::{CacheItem, ResponseCache, cache_key};
use crate::cookies::CookieJar;
use crate::error::LoadError;
use crate::http::{Headers, Request, Response};
use crate::retry::RetryHandler;
use crate::robots::{RobotsTxtFetcher, RobotsTxtHandler};
use crate::throttle::Throttler;
use crate::user_agent::UserAgent;

pub use hooks::LoaderHooks;
use hooks::Lifecycle;

/// Default redirect hop limit.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default connection timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default total request timeout (60 seconds).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// What to do when robots.txt disallows a URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotsMode {
    /// Never consult robots.txt.
    Off,
    /// Drop the request with a warning.
    #[default]
    Skip,
    /// Treat the denial as a load error (logged and reported to `on_error` hooks).
    Fail,
}

impl FromStr for RobotsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown robots mode '{other}' (expected off, skip or fail)")),
        }
    }
}

impl fmt::Display for RobotsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Skip => "skip",
            Self::Fail => "fail",
        })
    }
}

/// Loader behavior switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Send and store cookies.
    pub use_cookies: bool,
    pub robots: RobotsMode,
    /// Only obey robots.txt groups that name this bot explicitly.
    pub ignore_wildcard_robots_rules: bool,
    pub max_redirects: usize,
    /// Also cache responses with status >= 400.
    pub cache_error_responses: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            use_cookies: true,
            robots: RobotsMode::default(),
            ignore_wildcard_robots_rules: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            cache_error_responses: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Builder for [`HttpLoader`].
#[derive(Debug)]
pub struct HttpLoaderBuilder {
    user_agent: UserAgent,
    config: LoaderConfig,
    throttler: Option<Arc<Throttler>>,
    retry: Option<RetryHandler>,
    cache: Option<Arc<dyn ResponseCache>>,
    hooks: LoaderHooks,
}

impl HttpLoaderBuilder {
    #[must_use]
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares a throttler, e.g. between several loaders of one crawl.
    #[must_use]
    pub fn throttler(mut self, throttler: Arc<Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryHandler) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Never retry error responses.
    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: LoaderHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builds the loader and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Client`] if the HTTP client cannot be initialized.
    pub fn build(self) -> Result<HttpLoader, LoadError> {
        let client = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.read_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .build()
            .map_err(LoadError::Client)?;

        let mut robots = RobotsTxtHandler::new(self.user_agent.clone());
        if self.config.ignore_wildcard_robots_rules {
            robots = robots.ignore_wildcard_rules();
        }

        Ok(HttpLoader {
            client,
            user_agent: self.user_agent,
            config: self.config,
            throttler: self.throttler.unwrap_or_default(),
            retry: self.retry,
            robots,
            cache: self.cache,
            cookies: CookieJar::new(),
            hooks: self.hooks,
        })
    }
}

/// Polite HTTP loader. Share it behind an `Arc` to load concurrently.
#[derive(Debug)]
pub struct HttpLoader {
    client: Client,
    user_agent: UserAgent,
    config: LoaderConfig,
    throttler: Arc<Throttler>,
    retry: Option<RetryHandler>,
    robots: RobotsTxtHandler,
    cache: Option<Arc<dyn ResponseCache>>,
    cookies: CookieJar,
    hooks: LoaderHooks,
}

impl HttpLoader {
    /// Starts a builder with default throttling, retries and no cache.
    #[must_use]
    pub fn builder(user_agent: UserAgent) -> HttpLoaderBuilder {
        HttpLoaderBuilder {
            user_agent,
            config: LoaderConfig::default(),
            throttler: None,
            retry: Some(RetryHandler::default()),
            cache: None,
            hooks: LoaderHooks::default(),
        }
    }

    #[must_use]
    pub fn user_agent(&self) -> &UserAgent {
        &self.user_agent
    }

    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    #[must_use]
    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    #[must_use]
    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// Forgets all cookies received so far.
    pub fn flush_cookies(&self) {
        self.cookies.flush();
    }

    pub fn set_cache(&mut self, cache: Arc<dyn ResponseCache>) {
        self.cache = Some(cache);
    }

    pub fn hooks_mut(&mut self) -> &mut LoaderHooks {
        &mut self.hooks
    }

    /// Loads `request`, returning `None` on any failure (already logged).
    pub async fn load(&self, request: Request) -> Option<RespondedRequest> {
        self.load_or_fail(request).await.ok()
    }

    /// Loads `request`.
    ///
    /// # Errors
    ///
    /// - [`LoadError::InvalidUrl`] for non-http(s) URLs.
    /// - [`LoadError::RobotsDisallowed`] when robots.txt forbids the URL.
    /// - [`LoadError::Network`] / [`LoadError::Timeout`] for transport failures.
    /// - [`LoadError::HttpStatus`], [`LoadError::RetriesExhausted`] or
    ///   [`LoadError::RetryAfterExceedsLimit`] for error responses.
    /// - [`LoadError::TooManyRedirects`] when the redirect chain is too long.
    /// - [`LoadError::Cache`] when the cache cannot be read.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn load_or_fail(&self, request: Request) -> Result<RespondedRequest, LoadError> {
        let request = self.prepare(request)?;
        let mut lifecycle = Lifecycle::default();
        self.hooks.emit_before_load(&request, &mut lifecycle);

        let result = self.run(&request).await;
        match &result {
            Ok(Loaded::Fresh(responded)) => {
                debug!(
                    url = %request.url,
                    status = responded.response().status,
                    redirects = responded.redirects().len(),
                    "loaded"
                );
                self.hooks.emit_success(responded);
            }
            Ok(Loaded::Cached(_)) => {}
            Err(LoadError::RobotsDisallowed { .. }) if self.config.robots == RobotsMode::Skip => {}
            Err(e) => {
                warn!(url = %request.url, error = %e, "load failed");
                self.hooks.emit_error(&request, e);
            }
        }

        self.hooks.emit_after_load(&request, &lifecycle);
        result.map(Loaded::into_inner)
    }

    /// Whether robots.txt lets this loader's identity load `url`.
    pub async fn is_allowed(&self, url: &Url) -> bool {
        self.robots.is_allowed(url, self).await
    }

    /// `Sitemap` URLs from the robots.txt of `url`'s host.
    pub async fn sitemaps(&self, url: &Url) -> Vec<String> {
        self.robots.sitemaps(url, self).await
    }

    fn prepare(&self, mut request: Request) -> Result<Request, LoadError> {
        if !matches!(request.url.scheme(), "http" | "https") || request.url.host().is_none() {
            return Err(LoadError::invalid_url(request.url.as_str()));
        }
        request
            .headers
            .insert(USER_AGENT.as_str(), self.user_agent.header_value());
        Ok(request)
    }

    async fn run(&self, request: &Request) -> Result<Loaded, LoadError> {
        let key = cache_key(request);
        if let Some(cache) = &self.cache
            && let Some(item) = cache.get(&key).await?
        {
            let responded = item.responded_request();
            info!(
                url = %request.url,
                status = responded.response().status,
                "loaded from cache"
            );
            self.hooks.emit_cache_hit(&responded);
            return Ok(Loaded::Cached(responded));
        }

        self.check_robots(&request.url).await?;

        let mut responded = self.send_politely(request).await?;
        if let Some(retry) = &self.retry
            && retry.retries() > 0
            && retry.should_retry(responded.response().status)
        {
            responded = retry
                .handle_retries(responded, || self.send_politely(request))
                .await?;
        }

        let status = responded.response().status;
        if let Some(cache) = &self.cache
            && (status < 400 || self.config.cache_error_responses)
        {
            let item = CacheItem::from_responded(&responded);
            if let Err(e) = cache.set(&key, &item).await {
                error!(url = %request.url, error = %e, "failed to write response to cache");
            }
        }

        if status >= 400 {
            return Err(LoadError::http_status(responded.effective_uri().as_str(), status));
        }
        Ok(Loaded::Fresh(responded))
    }

    async fn check_robots(&self, url: &Url) -> Result<(), LoadError> {
        if self.config.robots == RobotsMode::Off || self.robots.is_allowed(url, self).await {
            return Ok(());
        }
        if self.config.robots == RobotsMode::Skip {
            warn!(url = %url, "robots.txt disallows loading - skipping");
        } else {
            error!(url = %url, "robots.txt disallows loading");
        }
        Err(LoadError::robots_disallowed(url.as_str()))
    }

    /// Waits for the throttler, then sends `request` and follows its redirects.
    async fn send_politely(&self, request: &Request) -> Result<RespondedRequest, LoadError> {
        self.throttler.wait_for_go(&request.url).await;
        let result = self.send_following_redirects(request).await;
        self.throttler.track_request_end_for(&request.url).await;
        result
    }

    async fn send_following_redirects(&self, request: &Request) -> Result<RespondedRequest, LoadError> {
        let mut responded = RespondedRequest::new(request.clone(), self.send(request).await?);
        let mut current = request.clone();
        let mut hops = 0;

        while responded.is_redirect() {
            let Some(location) = responded.response().header(LOCATION.as_str()) else {
                break;
            };
            let target = current
                .url
                .join(location)
                .map_err(|_| LoadError::invalid_url(location))?;

            hops += 1;
            if hops > self.config.max_redirects {
                warn!(url = %request.url, max = self.config.max_redirects, "too many redirects");
                return Err(LoadError::TooManyRedirects {
                    url: request.url.to_string(),
                    max: self.config.max_redirects,
                });
            }

            current = redirected_request(&current, target, responded.response().status);
            debug!(hop = hops, to = %current.url, "following redirect");
            let response = self.send(&current).await?;
            responded.set_response(response);
        }
        Ok(responded)
    }

    /// Sends a single HTTP request, attaching and collecting cookies.
    async fn send(&self, request: &Request) -> Result<Response, LoadError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, values) in request.headers.iter() {
            if self.config.use_cookies && name.eq_ignore_ascii_case(COOKIE.as_str()) {
                continue;
            }
            for value in values {
                builder = builder.header(name, value.as_str());
            }
        }
        if self.config.use_cookies
            && let Some(cookie) = self.cookie_header(request)
        {
            builder = builder.header(COOKIE, cookie);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let url = request.url.as_str();
        let response = builder
            .send()
            .await
            .map_err(|e| LoadError::network(url, e))?;
        let status = response.status().as_u16();
        let headers = Headers::from(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| LoadError::network(url, e))?
            .to_vec();

        if self.config.use_cookies {
            self.cookies.add_from_lossy(&request.url, &headers);
        }
        Ok(Response {
            status,
            headers,
            body,
        })
    }

    /// Caller-supplied `Cookie` header merged with the jar's cookies for the URL.
    fn cookie_header(&self, request: &Request) -> Option<String> {
        let own = request.headers.get(COOKIE.as_str());
        let jar = self.cookies.header_for(&request.url);
        match (own, jar) {
            (Some(own), Some(jar)) => Some(format!("{own}; {jar}")),
            (own, jar) => jar.or_else(|| own.map(str::to_string)),
        }
    }
}

#[async_trait]
impl RobotsTxtFetcher for HttpLoader {
    async fn fetch_robots_txt(&self, url: &Url) -> Result<Response, LoadError> {
        let request = self.prepare(Request::get(url.clone()))?;
        let (_, response) = self.send_politely(&request).await?.into_parts();
        Ok(response)
    }
}

enum Loaded {
    Fresh(RespondedRequest),
    Cached(RespondedRequest),
}

impl Loaded {
    fn into_inner(self) -> RespondedRequest {
        match self {
            Self::Fresh(responded) | Self::Cached(responded) => responded,
        }
    }
}

/// The request to send for a redirect to `target`.
///
/// 303, and 301/302 after a POST, continue as a bodyless GET. Other redirects repeat the
/// method and body. Credentials are not forwarded to another host.
fn redirected_request(previous: &Request, target: Url, status: u16) -> Request {
    let switch_to_get =
        status == 303 || (matches!(status, 301 | 302) && previous.method == Method::POST);
    let same_host = previous.url.host_str() == target.host_str();

    let mut next = previous.clone();
    next.url = target;
    if switch_to_get {
        if next.method != Method::HEAD {
            next.method = Method::GET;
        }
        next.body.clear();
        next.headers.remove("content-type");
        next.headers.remove("content-length");
    }
    if !same_host {
        next.headers.remove("authorization");
        next.headers.remove(COOKIE.as_str());
    }
    next
}
