//! Local file fetcher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use url::Url;

use super::{detect_content_type, FetchOptions, Fetched, Fetcher, Probe};
use crate::error::FetchError;

pub struct FileFetcher {
    max_document_size: u64,
}

impl FileFetcher {
    pub fn new(max_document_size: u64) -> Self {
        Self { max_document_size }
    }

    fn resolve_path(url: &Url) -> Result<PathBuf, FetchError> {
        url.to_file_path().map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "not a local file path".to_string(),
        })
    }

    async fn stat(&self, url: &Url, path: &PathBuf) -> Result<(u64, String), FetchError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| FetchError::NotFound {
                url: url.to_string(),
            })?;
        if !metadata.is_file() {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: "path is not a regular file".to_string(),
            });
        }
        let modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        // HTTP-date form so refresh can reuse it as If-Modified-Since.
        let last_modified = modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        Ok((metadata.len(), last_modified))
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    fn can_fetch(&self, url: &Url) -> bool {
        url.scheme() == "file"
    }

    async fn fetch(&self, url: &Url, opts: &FetchOptions) -> Result<Fetched, FetchError> {
        if opts.cancel.is_cancelled() {
            return Err(FetchError::Cancelled {
                url: url.to_string(),
            });
        }

        let path = Self::resolve_path(url)?;
        let (size, last_modified) = self.stat(url, &path).await?;

        if size > self.max_document_size {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                size,
                limit: self.max_document_size,
            });
        }

        if opts.if_modified_since.as_deref() == Some(last_modified.as_str()) {
            return Ok(Fetched {
                bytes: Vec::new(),
                content_type: "application/octet-stream".to_string(),
                etag: None,
                last_modified: Some(last_modified),
                final_url: url.clone(),
                status: 304,
            });
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|err| FetchError::Permanent {
                url: url.to_string(),
                reason: format!("read failed: {}", err),
            })?;

        let content_type = detect_content_type(&path.to_string_lossy(), &bytes);

        Ok(Fetched {
            bytes,
            content_type,
            etag: None,
            last_modified: Some(last_modified),
            final_url: url.clone(),
            status: 200,
        })
    }

    async fn probe(&self, url: &Url, _opts: &FetchOptions) -> Result<Probe, FetchError> {
        let path = Self::resolve_path(url)?;
        let (_, last_modified) = self.stat(url, &path).await?;
        Ok(Probe {
            status: 200,
            etag: None,
            last_modified: Some(last_modified),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_for(path: &std::path::Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[tokio::test]
    async fn reads_file_and_detects_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intro.md");
        std::fs::write(&path, "# Intro\n\nhello").unwrap();

        let fetcher = FileFetcher::new(1024 * 1024);
        let fetched = fetcher
            .fetch(&url_for(&path), &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(fetched.status, 200);
        assert_eq!(fetched.content_type, "text/markdown");
        assert_eq!(fetched.bytes, b"# Intro\n\nhello");
        assert!(fetched.last_modified.is_some());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FileFetcher::new(1024);
        let err = fetcher
            .fetch(&url_for(&dir.path().join("gone.md")), &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, vec![b'a'; 64]).unwrap();

        let fetcher = FileFetcher::new(16);
        let err = fetcher
            .fetch(&url_for(&path), &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn unchanged_mtime_yields_304() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "stable").unwrap();

        let fetcher = FileFetcher::new(1024);
        let url = url_for(&path);
        let first = fetcher.fetch(&url, &FetchOptions::default()).await.unwrap();

        let opts = FetchOptions {
            if_modified_since: first.last_modified.clone(),
            ..FetchOptions::default()
        };
        let second = fetcher.fetch(&url, &opts).await.unwrap();
        assert!(second.is_not_modified());
        assert!(second.bytes.is_empty());
    }
}
