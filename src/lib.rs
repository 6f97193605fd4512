//! Crawler Core Library
//!
//! A polite HTTP loader for web crawling: it throttles requests per domain, retries error
//! responses with backoff, honors robots.txt for bot identities, keeps a cookie jar, records
//! redirect chains and caches responses.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`loader`] - The [`HttpLoader`] orchestrating everything below
//! - [`aggregate`] - A request with its response and redirect trail
//! - [`cookies`] - `Set-Cookie` parsing and the cookie jar
//! - [`throttle`] - Adaptive per-domain wait timing
//! - [`retry`] - Retrying error responses, `Retry-After` handling
//! - [`robots`] - robots.txt parsing and the per-host gate
//! - [`cache`] - Cache keys, the cached item format, memory and file stores
//! - [`config`] - TOML configuration
//!
//! # Example
//!
//! ```no_run
//! use crawler_core::{HttpLoader, Request, UserAgent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = HttpLoader::builder(UserAgent::bot("MyBot")).build()?;
//! let request = Request::parse_get("https://example.com/")?;
//! if let Some(responded) = loader.load(request).await {
//!     println!("{} -> {}", responded.requested_uri(), responded.effective_uri());
//! }
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod cookies;
pub mod error;
pub mod http;
pub mod loader;
pub mod retry;
pub mod robots;
pub mod throttle;
pub mod time;
pub mod user_agent;

// Re-export commonly used types
pub use aggregate::RespondedRequest;
pub use cache::{CacheError, CacheItem, CacheRecord, FileCache, MemoryCache, ResponseCache, cache_key};
pub use config::{ConfigError, FileConfig, load_config};
pub use cookies::{Cookie, CookieError, CookieJar, SameSite};
pub use error::LoadError;
pub use http::{Headers, Request, Response};
pub use loader::{HttpLoader, HttpLoaderBuilder, LoaderConfig, LoaderHooks, RobotsMode};
pub use retry::{RetryHandler, StatusFilter, parse_retry_after};
pub use robots::{RobotsTxt, RobotsTxtHandler};
pub use throttle::{ThrottleError, ThrottleRange, Throttler};
pub use time::Microseconds;
pub use user_agent::UserAgent;
