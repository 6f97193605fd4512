//! Response cache: key derivation, the cached item format and pluggable stores.
//!
//! A cache key is the sha256 of the request method, absolute URL, headers (minus `Cookie`)
//! and body, so the same logical request hits the same entry across sessions. Stored items
//! flatten to an 8-field [`CacheRecord`]; [`FileCache`] persists records as JSON files,
//! optionally gzip-compressed, and [`MemoryCache`] keeps items in process.

mod file;
mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::aggregate::RespondedRequest;
use crate::http::{Headers, Request, Response};

pub use file::FileCache;
pub use memory::MemoryCache;

const COOKIE_HEADER: &str = "cookie";

/// Errors raised by cache stores. A missing entry is `Ok(None)`, never an error.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing the backing storage failed.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored entry could not be encoded or decoded.
    #[error("cache entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A decoded record holds values that do not form a valid item.
    #[error("invalid cache record: {0}")]
    InvalidRecord(String),

    /// The key cannot be used as a storage name.
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Derives the cache key of a request.
///
/// Header names are compared case-insensitively and `Cookie` headers are ignored.
///
/// # Examples
///
/// ```
/// use crawler_core::cache::cache_key;
/// use crawler_core::http::Request;
///
/// let plain = Request::parse_get("https://example.com/").unwrap();
/// let with_cookie = plain.clone().with_header("Cookie", "session=1");
/// assert_eq!(cache_key(&plain), cache_key(&with_cookie));
/// assert_eq!(cache_key(&plain).len(), 64);
/// ```
#[must_use]
pub fn cache_key(request: &Request) -> String {
    let mut headers: Vec<(String, &[String])> = request
        .headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(COOKIE_HEADER))
        .map(|(name, values)| (name.to_ascii_lowercase(), values))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.url.as_str().as_bytes());
    hasher.update(b"\n");
    for (name, values) in headers {
        for value in values {
            hasher.update(name.as_bytes());
            hasher.update(b": ");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
    }
    hasher.update(b"\n");
    hasher.update(&request.body);
    hex::encode(hasher.finalize())
}

/// Flat, serializable form of a [`CacheItem`]. Bodies are base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub request_method: String,
    pub request_uri: String,
    pub request_headers: Headers,
    pub request_body: String,
    pub effective_uri: String,
    pub response_status_code: u16,
    pub response_headers: Headers,
    pub response_body: String,
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    request: Request,
    effective_uri: Url,
    response: Response,
}

impl CacheItem {
    /// Snapshot of a finished load. `Cookie` request headers are not stored.
    #[must_use]
    pub fn from_responded(responded: &RespondedRequest) -> Self {
        let mut request = responded.request().clone();
        request.headers.remove(COOKIE_HEADER);
        Self {
            request,
            effective_uri: responded.effective_uri().clone(),
            response: responded.response().clone(),
        }
    }

    /// Key this item is stored under.
    #[must_use]
    pub fn key(&self) -> String {
        cache_key(&self.request)
    }

    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub fn response(&self) -> &Response {
        &self.response
    }

    #[must_use]
    pub fn effective_uri(&self) -> &Url {
        &self.effective_uri
    }

    /// Rebuilds the aggregate.
    ///
    /// Only the final effective URL is known, so a multi-hop redirect chain comes back as a
    /// single recorded hop.
    #[must_use]
    pub fn responded_request(&self) -> RespondedRequest {
        let mut responded = RespondedRequest::new(self.request.clone(), self.response.clone());
        if *responded.effective_uri() != self.effective_uri {
            responded.record_redirect(&self.effective_uri);
        }
        responded
    }

    #[must_use]
    pub fn to_record(&self) -> CacheRecord {
        CacheRecord {
            request_method: self.request.method.to_string(),
            request_uri: self.request.url.to_string(),
            request_headers: self.request.headers.clone(),
            request_body: BASE64.encode(&self.request.body),
            effective_uri: self.effective_uri.to_string(),
            response_status_code: self.response.status,
            response_headers: self.response.headers.clone(),
            response_body: BASE64.encode(&self.response.body),
        }
    }

    /// Restores an item from its record.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidRecord`] for an unparsable method, URL or body.
    pub fn from_record(record: CacheRecord) -> Result<Self, CacheError> {
        let method = Method::from_bytes(record.request_method.as_bytes())
            .map_err(|_| CacheError::InvalidRecord(format!("method {:?}", record.request_method)))?;
        let url = parse_url(&record.request_uri)?;
        let effective_uri = parse_url(&record.effective_uri)?;

        Ok(Self {
            request: Request {
                method,
                url,
                headers: record.request_headers,
                body: decode_body(&record.request_body)?,
            },
            effective_uri,
            response: Response {
                status: record.response_status_code,
                headers: record.response_headers,
                body: decode_body(&record.response_body)?,
            },
        })
    }

    /// JSON encoding of the record.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Encoding`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(&self.to_record())?)
    }

    /// Decodes [`to_bytes`](Self::to_bytes) output.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Encoding`] or [`CacheError::InvalidRecord`] for malformed data.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        Self::from_record(serde_json::from_slice(bytes)?)
    }
}

fn parse_url(value: &str) -> Result<Url, CacheError> {
    Url::parse(value).map_err(|e| CacheError::InvalidRecord(format!("url {value:?}: {e}")))
}

fn decode_body(value: &str) -> Result<Vec<u8>, CacheError> {
    BASE64
        .decode(value)
        .map_err(|e| CacheError::InvalidRecord(format!("body: {e}")))
}

/// Key-value store for [`CacheItem`]s.
///
/// The bulk operations default to looping over the single-key ones.
#[async_trait]
pub trait ResponseCache: Send + Sync + std::fmt::Debug {
    /// The item stored under `key`, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<CacheItem>, CacheError>;

    /// Stores `item` under `key`, replacing any previous item.
    async fn set(&self, key: &str, item: &CacheItem) -> Result<(), CacheError>;

    async fn has(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes `key`. Returns whether an item was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes every item.
    async fn clear(&self) -> Result<(), CacheError>;

    async fn get_multiple(
        &self,
        keys: &[String],
    ) -> Result<Vec<(String, Option<CacheItem>)>, CacheError> {
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            items.push((key.clone(), self.get(key).await?));
        }
        Ok(items)
    }

    async fn set_multiple(&self, items: &[(String, CacheItem)]) -> Result<(), CacheError> {
        for (key, item) in items {
            self.set(key, item).await?;
        }
        Ok(())
    }

    async fn delete_multiple(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}
