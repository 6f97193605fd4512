//! Error type returned by the loader.
//!
//! [`LoadError`] is what [`HttpLoader::load_or_fail`](crate::loader::HttpLoader::load_or_fail)
//! returns; [`HttpLoader::load`](crate::loader::HttpLoader::load) logs it and yields `None`.

use thiserror::Error;

use crate::cache::CacheError;

/// Errors that can occur while loading a request.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The URL cannot be requested (not absolute, not http(s), or an unresolvable redirect).
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error loading {url}: {source}")]
    Network {
        /// The URL that failed to load.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout loading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The server answered with an error status that is not retried.
    #[error("HTTP {status} loading {url}")]
    HttpStatus {
        /// The effective URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Every retry still produced an error response.
    #[error("giving up on {url} after {attempts} retries (last status {status})")]
    RetriesExhausted {
        /// The requested URL.
        url: String,
        /// Number of retries performed.
        attempts: u32,
        /// Status of the last response.
        status: u16,
    },

    /// The server asked for a longer pause than the configured ceiling allows.
    #[error("Retry-After of {retry_after_secs}s from {url} exceeds the maximum wait of {max_wait_secs}s")]
    RetryAfterExceedsLimit {
        /// The URL that sent the header.
        url: String,
        /// Requested wait in seconds.
        retry_after_secs: u64,
        /// Configured ceiling in seconds.
        max_wait_secs: u64,
    },

    /// robots.txt disallows the URL for this crawler.
    #[error("robots.txt disallows loading {url}")]
    RobotsDisallowed {
        /// The disallowed URL.
        url: String,
    },

    /// The redirect chain is longer than allowed.
    #[error("too many redirects ({max}) loading {url}")]
    TooManyRedirects {
        /// The requested URL.
        url: String,
        /// Configured redirect limit.
        max: usize,
    },

    /// Reading from or writing to the response cache failed.
    #[error("response cache error: {0}")]
    Cache(#[from] CacheError),

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl LoadError {
    /// Creates a network error from a reqwest error, mapping timeouts to [`LoadError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a robots.txt denial error.
    pub fn robots_disallowed(url: impl Into<String>) -> Self {
        Self::RobotsDisallowed { url: url.into() }
    }

    /// Whether a retry could plausibly succeed (network trouble or a transient status).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// No `From<reqwest::Error>`: every variant needs the URL for context, so callers use the
// helper constructors above.
