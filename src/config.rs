//! TOML configuration for assembling a loader.
//!
//! Every key is optional; missing keys fall back to the library defaults. The binary merges
//! command-line flags over the file with [`FileConfig::merged_with`] and builds the loader
//! with [`FileConfig::build_loader`].
//!
//! ```toml
//! bot_name = "MyBot"
//! throttle_from = 1.0
//! throttle_to = 2.0
//! retries = 2
//! retry_wait_secs = [10, 60]
//! robots = "skip"
//! cache_dir = "/var/cache/crawler"
//! cache_compress = true
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::{FileCache, ResponseCache};
use crate::error::LoadError;
use crate::loader::{HttpLoader, LoaderConfig, RobotsMode};
use crate::retry::{self, RetryHandler};
use crate::throttle::{self, ThrottleError, ThrottleRange, Throttler};
use crate::time::Microseconds;
use crate::user_agent::UserAgent;

/// Errors from loading or applying a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("invalid throttle configuration: {0}")]
    Throttle(#[from] ThrottleError),

    #[error(transparent)]
    Loader(#[from] LoadError),
}

/// Upper limit for `throttle_max_ms` (one hour).
const MAX_THROTTLE_MS: u64 = 3_600_000;

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.into(),
    }
}

/// File (or merged file + CLI) configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Literal User-Agent header; robots.txt is not consulted for it.
    pub user_agent: Option<String>,
    /// Bot product token; the loader identifies as that bot and obeys robots.txt.
    pub bot_name: Option<String>,
    /// Lower end of the throttle range.
    pub throttle_from: Option<f64>,
    /// Upper end of the throttle range.
    pub throttle_to: Option<f64>,
    /// Range is in multiples of the last round trip (default) instead of seconds.
    pub throttle_multiplier: Option<bool>,
    pub throttle_min_ms: Option<u64>,
    pub throttle_max_ms: Option<u64>,
    pub retries: Option<u32>,
    /// Wait before each retry; later retries reuse the last value.
    pub retry_wait_secs: Option<Vec<u64>>,
    /// Longest `Retry-After` honored before giving up.
    pub retry_max_wait_secs: Option<u64>,
    pub robots: Option<RobotsMode>,
    pub cache_dir: Option<PathBuf>,
    pub cache_compress: Option<bool>,
    pub cache_ttl_secs: Option<u64>,
    pub max_redirects: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

/// Reads, parses and validates a TOML config file.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read or parsed, or holds invalid values.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: FileConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl FileConfig {
    /// Values from `overrides` win over values from `self`. The identity (`user_agent` or
    /// `bot_name`) is replaced as a whole.
    #[must_use]
    pub fn merged_with(self, overrides: FileConfig) -> FileConfig {
        let (user_agent, bot_name) =
            if overrides.user_agent.is_some() || overrides.bot_name.is_some() {
                (overrides.user_agent, overrides.bot_name)
            } else {
                (self.user_agent, self.bot_name)
            };
        FileConfig {
            user_agent,
            bot_name,
            throttle_from: overrides.throttle_from.or(self.throttle_from),
            throttle_to: overrides.throttle_to.or(self.throttle_to),
            throttle_multiplier: overrides.throttle_multiplier.or(self.throttle_multiplier),
            throttle_min_ms: overrides.throttle_min_ms.or(self.throttle_min_ms),
            throttle_max_ms: overrides.throttle_max_ms.or(self.throttle_max_ms),
            retries: overrides.retries.or(self.retries),
            retry_wait_secs: overrides.retry_wait_secs.or(self.retry_wait_secs),
            retry_max_wait_secs: overrides.retry_max_wait_secs.or(self.retry_max_wait_secs),
            robots: overrides.robots.or(self.robots),
            cache_dir: overrides.cache_dir.or(self.cache_dir),
            cache_compress: overrides.cache_compress.or(self.cache_compress),
            cache_ttl_secs: overrides.cache_ttl_secs.or(self.cache_ttl_secs),
            max_redirects: overrides.max_redirects.or(self.max_redirects),
            connect_timeout_secs: overrides.connect_timeout_secs.or(self.connect_timeout_secs),
            read_timeout_secs: overrides.read_timeout_secs.or(self.read_timeout_secs),
        }
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_agent.is_some() && self.bot_name.is_some() {
            return Err(invalid("bot_name", "cannot be combined with `user_agent`"));
        }
        if let Some(name) = &self.bot_name
            && (name.is_empty() || name.contains(char::is_whitespace))
        {
            return Err(invalid("bot_name", format!("{name:?} must be a single non-empty token")));
        }
        validate_factor("throttle_from", self.throttle_from)?;
        validate_factor("throttle_to", self.throttle_to)?;
        if let (Some(min), Some(max)) = (self.throttle_min_ms, self.throttle_max_ms)
            && min > max
        {
            return Err(invalid("throttle_min_ms", format!("{min} is greater than throttle_max_ms {max}")));
        }
        if let Some(max) = self.throttle_max_ms
            && max > MAX_THROTTLE_MS
        {
            return Err(invalid("throttle_max_ms", format!("{max}. Expected range: 0..={MAX_THROTTLE_MS}")));
        }
        if let Some(retries) = self.retries
            && retries > 10
        {
            return Err(invalid("retries", format!("{retries}. Expected range: 0..=10")));
        }
        if let Some(max_redirects) = self.max_redirects
            && max_redirects > 100
        {
            return Err(invalid("max_redirects", format!("{max_redirects}. Expected range: 0..=100")));
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        Ok(())
    }

    #[must_use]
    pub fn user_agent(&self) -> UserAgent {
        match (&self.bot_name, &self.user_agent) {
            (Some(name), _) => UserAgent::bot(name.clone()).with_version(env!("CARGO_PKG_VERSION")),
            (None, Some(value)) => UserAgent::new(value.clone()),
            (None, None) => UserAgent::default(),
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Throttle`] for an inverted range or bounds.
    pub fn throttler(&self) -> Result<Throttler, ConfigError> {
        let range = if self.throttle_multiplier.unwrap_or(true) {
            ThrottleRange::MultipleOf {
                from: self.throttle_from.unwrap_or(1.0),
                to: self.throttle_to.unwrap_or(2.0),
            }
        } else {
            ThrottleRange::Absolute {
                from: Microseconds::from_secs_f64(self.throttle_from.unwrap_or(1.0)),
                to: Microseconds::from_secs_f64(self.throttle_to.unwrap_or(2.0)),
            }
        };
        let min = self
            .throttle_min_ms
            .map_or(throttle::DEFAULT_MIN_WAIT, Microseconds::from_millis);
        let max = self
            .throttle_max_ms
            .map_or(throttle::DEFAULT_MAX_WAIT, Microseconds::from_millis);
        Ok(Throttler::new(range, min, max)?)
    }

    #[must_use]
    pub fn retry_handler(&self) -> RetryHandler {
        let wait = self.retry_wait_secs.as_ref().map_or_else(retry::default_wait_schedule, |secs| {
            secs.iter().copied().map(Duration::from_secs).collect()
        });
        RetryHandler::new(
            self.retries.unwrap_or(retry::DEFAULT_RETRIES),
            wait,
            self.retry_max_wait_secs
                .map_or(retry::DEFAULT_MAX_WAIT, Duration::from_secs),
        )
    }

    #[must_use]
    pub fn loader_config(&self) -> LoaderConfig {
        let defaults = LoaderConfig::default();
        LoaderConfig {
            robots: self.robots.unwrap_or(defaults.robots),
            max_redirects: self.max_redirects.unwrap_or(defaults.max_redirects),
            connect_timeout: self
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            read_timeout: self
                .read_timeout_secs
                .map_or(defaults.read_timeout, Duration::from_secs),
            ..defaults
        }
    }

    /// The file cache, when `cache_dir` is set.
    #[must_use]
    pub fn cache(&self) -> Option<Arc<dyn ResponseCache>> {
        let dir = self.cache_dir.as_ref()?;
        let mut cache = FileCache::new(dir).with_compression(self.cache_compress.unwrap_or(false));
        if let Some(ttl) = self.cache_ttl_secs {
            cache = cache.with_ttl(Duration::from_secs(ttl));
        }
        Some(Arc::new(cache))
    }

    /// Builds a loader from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for invalid values or if the HTTP client cannot be built.
    pub fn build_loader(&self) -> Result<HttpLoader, ConfigError> {
        self.validate()?;
        let mut builder = HttpLoader::builder(self.user_agent())
            .config(self.loader_config())
            .throttler(Arc::new(self.throttler()?))
            .retry(self.retry_handler());
        if let Some(cache) = self.cache() {
            builder = builder.cache(cache);
        }
        Ok(builder.build()?)
    }
}

fn validate_factor(key: &'static str, value: Option<f64>) -> Result<(), ConfigError> {
    let Some(value) = value else {
        return Ok(());
    };
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(key, format!("{value} must be a finite, non-negative number")));
    }
    Ok(())
}

fn validate_timeout_secs(key: &'static str, value: Option<u64>) -> Result<(), ConfigError> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        return Err(invalid(key, format!("{value}. Expected range: 1..=3600")));
    }
    Ok(())
}
