//! Shared error taxonomy.
//!
//! Each subsystem has its own typed error so retry and recovery logic can
//! branch on the kind instead of matching message substrings. Orchestration
//! layers (jobs, CLI) wrap these in `anyhow::Error` with added context.

use thiserror::Error;

/// Classified fetch failures surfaced by every [`crate::fetcher::Fetcher`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Retryable failure: 408/425/429/5xx or a transport-level error.
    #[error("transient fetch failure for {url}: {reason}")]
    Transient { url: String, reason: String },

    /// Non-retryable failure: malformed response, unsupported scheme, 4xx.
    #[error("permanent fetch failure for {url}: {reason}")]
    Permanent { url: String, reason: String },

    /// The resource does not exist (404/410). During refresh this triggers
    /// page removal rather than an error on the job.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// Authentication or authorization failure (401/403).
    #[error("unauthorized: {url}")]
    Unauthorized { url: String },

    /// Body exceeds the configured `scraper.document.maxSize`. Skipped, not retried.
    #[error("document too large ({size} > {limit} bytes): {url}")]
    TooLarge { url: String, size: u64, limit: u64 },

    /// The URL could not be parsed or points outside the fetcher's domain.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The fetch was aborted by job cancellation.
    #[error("fetch cancelled: {url}")]
    Cancelled { url: String },
}

impl FetchError {
    /// Whether the fetcher's retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Failures from embedding providers. Retry logic branches on the variant.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The request exceeded the provider's input size limit. The batcher
    /// responds by splitting the batch in half and retrying.
    #[error("embedding input exceeds provider size limit")]
    SizeLimit,

    /// Missing or rejected credentials. Not retryable; disables vector search.
    #[error("embedding provider authentication failed: {0}")]
    Auth(String),

    /// Network-level failure reaching the provider. Retryable.
    #[error("embedding provider unreachable: {0}")]
    Unreachable(String),

    /// Any other provider-reported error.
    #[error("embedding provider error {code}: {message}")]
    Provider { code: u16, message: String },

    /// The configured model produces vectors wider than the database dimension.
    /// Fatal at startup.
    #[error("model dimension {model} exceeds database dimension {database}")]
    Dimension { model: usize, database: usize },
}

impl EmbedError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbedError::Unreachable(_) => true,
            EmbedError::Provider { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Store-level failures. Connection and migration errors are fatal at
/// startup; integrity violations fail only the current write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("migration failed after {attempts} attempts: {reason}")]
    Migration { attempts: u32, reason: String },

    #[error("library not found: {0}")]
    LibraryNotFound(String),

    #[error("version not found: {library}@{version}")]
    VersionNotFound { library: String, version: String },
}

/// Content-processing failures. Reported on the page; the crawl continues
/// with whatever chunks were recoverable.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to parse {content_type} content: {reason}")]
    Parse { content_type: String, reason: String },

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Terminal job failures.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job cancelled")]
    Cancelled,

    #[error("job failed: {0}")]
    Failed(String),

    #[error("no such job: {0}")]
    NotFound(String),
}
