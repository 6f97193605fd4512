//! Directory-backed cache store: one file per key.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, instrument};

use super::{CacheError, CacheItem, ResponseCache};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Cache storing each item as a JSON file named after its key.
///
/// Writes go to a temporary file that is then renamed into place, so readers never see a
/// partially written entry. Compressed and uncompressed entries can coexist: the format is
/// detected from the file content on read.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
    compress: bool,
    ttl: Option<Duration>,
}

impl FileCache {
    /// Cache rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            compress: false,
            ttl: None,
        }
    }

    /// Gzip entries written from now on.
    #[must_use]
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Treat entries older than `ttl` (by modification time) as absent.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resets the age of an entry to zero. Returns `false` if there is no such entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the file exists but cannot be touched.
    pub async fn prolong(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.path_for(key)?;
        let file = match tokio::fs::OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        file.into_std()
            .await
            .set_modified(SystemTime::now())
            .map_err(|e| CacheError::io(&path, e))?;
        Ok(true)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let usable = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !usable {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }

    /// Whether the file at `path` exists and is within the TTL.
    async fn is_fresh(&self, path: &Path) -> Result<bool, CacheError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        let Some(ttl) = self.ttl else {
            return Ok(true);
        };
        let modified = metadata.modified().map_err(|e| CacheError::io(path, e))?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        Ok(age <= ttl)
    }

    fn encode(&self, item: &CacheItem) -> Result<Vec<u8>, CacheError> {
        let bytes = item.to_bytes()?;
        if !self.compress {
            return Ok(bytes);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&bytes)
            .and_then(|()| encoder.finish())
            .map_err(|e| CacheError::io(&self.dir, e))
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<CacheItem, CacheError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut plain = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut plain)
            .map_err(|e| CacheError::io(path, e))?;
        return CacheItem::from_bytes(&plain);
    }
    CacheItem::from_bytes(bytes)
}

#[async_trait]
impl ResponseCache for FileCache {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<CacheItem>, CacheError> {
        let path = self.path_for(key)?;
        if !self.is_fresh(&path).await? {
            return Ok(None);
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        decode(&path, &bytes).map(Some)
    }

    #[instrument(level = "debug", skip(self, item))]
    async fn set(&self, key: &str, item: &CacheItem) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let bytes = self.encode(item)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;
        let temp = self
            .dir
            .join(format!(".{key}.{:016x}.tmp", rand::random::<u64>()));
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| CacheError::io(&temp, e))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CacheError::io(path, e));
        }
        debug!(path = %path.display(), bytes = bytes.len(), "cache entry written");
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.path_for(key)?;
        self.is_fresh(&path).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    #[instrument(level = "debug", skip(self), fields(dir = %self.dir.display()))]
    async fn clear(&self) -> Result<(), CacheError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = entry.path();
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| CacheError::io(&path, e))?
                .is_file();
            if is_file {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| CacheError::io(&path, e))?;
            }
        }
        Ok(())
    }
}
