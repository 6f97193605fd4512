//! Retrying error responses with a fixed wait schedule.
//!
//! A [`RetryHandler`] decides from the status code whether a response deserves another
//! attempt ([`StatusFilter`]), then re-issues the request up to `retries` times, sleeping
//! `wait[i]` before attempt `i`. A numeric or HTTP-date `Retry-After` header on the first
//! failing response replaces the first scheduled wait, unless it asks for more than
//! `max_wait`: that is treated as a policy violation and fails immediately without sleeping.
//! Later responses' `Retry-After` headers are ignored.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use crawler_core::retry::{RetryHandler, StatusFilter};
//!
//! let handler = RetryHandler::new(
//!     3,
//!     vec![Duration::from_secs(5), Duration::from_secs(30)],
//!     Duration::from_secs(60),
//! )
//! .with_filter(StatusFilter::Only(vec![429, 503]));
//!
//! assert!(handler.should_retry(503));
//! assert!(!handler.should_retry(404));
//! assert_eq!(handler.wait_for_attempt(2), Duration::from_secs(30));
//! ```

use std::future::Future;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use tracing::{debug, error, instrument, warn};

use crate::aggregate::RespondedRequest;
use crate::error::LoadError;

/// Default number of retries.
pub const DEFAULT_RETRIES: u32 = 2;

/// Default ceiling for server-requested waits (60 seconds).
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

/// Default wait before each retry: 10 seconds, then 60 seconds.
#[must_use]
pub fn default_wait_schedule() -> Vec<Duration> {
    vec![Duration::from_secs(10), Duration::from_secs(60)]
}

/// Which response status codes are retried.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatusFilter {
    /// Every status >= 400.
    #[default]
    ErrorStatuses,
    /// Only the listed codes.
    Only(Vec<u16>),
    /// Every status >= 400 except the listed codes.
    Except(Vec<u16>),
}

impl StatusFilter {
    #[must_use]
    pub fn matches(&self, status: u16) -> bool {
        match self {
            Self::ErrorStatuses => status >= 400,
            Self::Only(codes) => codes.contains(&status),
            Self::Except(codes) => status >= 400 && !codes.contains(&status),
        }
    }
}

/// Bounded retry loop for error responses.
///
/// Holds configuration only; every call to [`handle_retries`](Self::handle_retries) keeps
/// its own attempt state, so one handler can serve many concurrent requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryHandler {
    retries: u32,
    wait: Vec<Duration>,
    max_wait: Duration,
    filter: StatusFilter,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            wait: default_wait_schedule(),
            max_wait: DEFAULT_MAX_WAIT,
            filter: StatusFilter::default(),
        }
    }
}

impl RetryHandler {
    /// Creates a handler retrying `retries` times with the given wait schedule.
    ///
    /// Attempts beyond the end of `wait` reuse its last entry; an empty schedule never waits
    /// (unless the server sends `Retry-After`).
    #[must_use]
    pub fn new(retries: u32, wait: Vec<Duration>, max_wait: Duration) -> Self {
        Self {
            retries,
            wait,
            max_wait,
            filter: StatusFilter::default(),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: StatusFilter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Whether a response with this status should be retried.
    #[must_use]
    pub fn should_retry(&self, status: u16) -> bool {
        self.filter.matches(status)
    }

    /// Scheduled wait before retry number `attempt` (1-indexed).
    #[must_use]
    pub fn wait_for_attempt(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        self.wait
            .get(index)
            .or_else(|| self.wait.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// `Retry-After` of the failing response, if present and within `max_wait`.
    fn server_wait(&self, failed: &RespondedRequest) -> Result<Option<Duration>, LoadError> {
        let Some(retry_after) = failed
            .response()
            .header(RETRY_AFTER.as_str())
            .and_then(parse_retry_after)
        else {
            return Ok(None);
        };
        if retry_after > self.max_wait {
            error!(
                url = %failed.effective_uri(),
                retry_after_secs = retry_after.as_secs(),
                max_wait_secs = self.max_wait.as_secs(),
                "Retry-After exceeds maximum wait - not retrying"
            );
            return Err(LoadError::RetryAfterExceedsLimit {
                url: failed.effective_uri().to_string(),
                retry_after_secs: retry_after.as_secs(),
                max_wait_secs: self.max_wait.as_secs(),
            });
        }
        debug!(retry_after_ms = retry_after.as_millis(), "using Retry-After header delay");
        Ok(Some(retry_after))
    }

    /// Re-issues a failed request until a response no longer qualifies for retry.
    ///
    /// `retry` performs one new attempt. Transport errors count as failed attempts. Only the
    /// first failing response's `Retry-After` is honored; it replaces the first scheduled wait.
    ///
    /// # Errors
    ///
    /// - [`LoadError::RetryAfterExceedsLimit`] when the server asks for more than `max_wait`.
    /// - [`LoadError::RetriesExhausted`] when every attempt still failed.
    #[instrument(skip(self, failed, retry), fields(url = %failed.requested_uri(), retries = self.retries))]
    pub async fn handle_retries<F, Fut>(
        &self,
        failed: RespondedRequest,
        mut retry: F,
    ) -> Result<RespondedRequest, LoadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RespondedRequest, LoadError>>,
    {
        let mut server_wait = self.server_wait(&failed)?;
        let mut current = failed;

        for attempt in 1..=self.retries {
            let delay = server_wait
                .take()
                .unwrap_or_else(|| self.wait_for_attempt(attempt));
            warn!(
                url = %current.requested_uri(),
                status = current.response().status,
                attempt,
                max_attempts = self.retries,
                delay_ms = delay.as_millis(),
                "request failed - retrying"
            );
            tokio::time::sleep(delay).await;

            match retry().await {
                Ok(next) if !self.should_retry(next.response().status) => {
                    debug!(attempt, status = next.response().status, "retry succeeded");
                    return Ok(next);
                }
                Ok(next) => current = next,
                Err(e) => warn!(attempt, error = %e, "retry attempt failed"),
            }
        }

        error!(
            url = %current.requested_uri(),
            status = current.response().status,
            attempts = self.retries,
            "retries exhausted - giving up"
        );
        Err(LoadError::RetriesExhausted {
            url: current.requested_uri().to_string(),
            attempts: self.retries,
            status: current.response().status,
        })
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Dates in the past yield zero.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use crawler_core::retry::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        return Some(Duration::from_secs(seconds as u64));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => Some(
            datetime
                .duration_since(std::time::SystemTime::now())
                .unwrap_or(Duration::ZERO),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}
